//! Connection demultiplexer and HTTP/gRPC-Web wrapper (spec.md §4.1, §4.2).
//!
//! Two transports are accepted on one port: native gRPC over HTTP/2, and a
//! browser-compatible gRPC-Web framing over HTTP/1.1. Each accepted
//! connection is routed by peeking its first bytes against the HTTP/2
//! client connection preface (RFC 7540 §3.5) before any bytes are consumed,
//! so both paths terminate in the same [`crate::handlers::ControllerService`]
//! without duplicating handler logic.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;

use http::{HeaderName, Method};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use tokio::net::{TcpListener, TcpStream};
use tonic::service::Routes;
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::Instrument;
use uuid::Uuid;

use crate::config::Config;
use crate::handlers::ControllerService;

/// The HTTP/2 client connection preface (RFC 7540 §3.5). Its presence as
/// the first 24 bytes of a connection distinguishes native gRPC (h2) from
/// every other transport we accept on this port.
const HTTP2_PREFACE: &[u8; 24] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Bind `config.port` and serve `service` until `shutdown` fires.
pub async fn serve(
    service: ControllerService,
    config: &Config,
    shutdown: tokio_util::sync::CancellationToken,
) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "listening");

    let native_routes = Routes::new(
        crate::pb::controller_service_server::ControllerServiceServer::new(service.clone()),
    );
    let wrapped = wrapped_service(service);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("shutdown signal received, no longer accepting connections");
                break;
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let native_routes = native_routes.clone();
                let wrapped = wrapped.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, peer, native_routes, wrapped, shutdown).await {
                        tracing::debug!(error = %e, %peer, "connection ended with error");
                    }
                });
            }
        }
    }

    Ok(())
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    native_routes: Routes,
    wrapped: WrappedService,
    shutdown: tokio_util::sync::CancellationToken,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut preface_buf = [0u8; 24];
    let is_native_grpc = match peek_full(&stream, &mut preface_buf).await {
        Ok(()) => preface_buf == *HTTP2_PREFACE,
        Err(_) => false,
    };

    let io = TokioIo::new(stream);
    let executor = TokioExecutor::new();

    if is_native_grpc {
        let svc = hyper::service::service_fn(move |req| {
            let mut routes = native_routes.clone();
            async move { routes.call(req).await }
        });
        let conn = AutoBuilder::new(executor).http2_only().serve_connection(io, svc);
        tokio::select! {
            res = conn => res.map_err(|e| e.into()),
            _ = shutdown.cancelled() => Ok(()),
        }
    } else {
        let svc = hyper::service::service_fn(move |req| {
            let mut wrapped = wrapped.clone();
            async move { wrapped.call(req).await }
        });
        let conn = AutoBuilder::new(executor).serve_connection(io, svc);
        tokio::select! {
            res = conn => res.map_err(|e| e.into()),
            _ = shutdown.cancelled() => Ok(()),
        }
    }
}

/// `TcpStream::peek` until `buf` is full or the connection closes early
/// (a short read means the preface cannot match, which is itself a
/// meaningful answer, not an error worth failing the connection over).
async fn peek_full(stream: &TcpStream, buf: &mut [u8]) -> std::io::Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = stream.peek(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(())
}

type WrappedService = tower::util::BoxCloneService<
    http::Request<hyper::body::Incoming>,
    http::Response<tonic::body::BoxBody>,
    Infallible,
>;

/// `tonic_web::GrpcWebLayer` translates `application/grpc-web(+proto|+json)`
/// framing to native gRPC calls and passes native `application/grpc`
/// requests through unchanged, so this single service also backstops
/// native gRPC arriving over an HTTP/1.1 connection (spec.md §4.2).
fn wrapped_service(service: ControllerService) -> WrappedService {
    let routes = Routes::new(
        crate::pb::controller_service_server::ControllerServiceServer::new(service),
    );

    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::any())
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::HEAD,
        ])
        .allow_headers([
            HeaderName::from_static("x-grpc-web"),
            HeaderName::from_static("x-user-agent"),
            HeaderName::from_static("content-type"),
        ])
        .expose_headers([HeaderName::from_static("etag")])
        .allow_credentials(true)
        .max_age(Duration::from_secs(60 * 60));

    let stack = ServiceBuilder::new()
        .layer(RequestIdLayer)
        .layer(cors)
        .layer(tonic_web::GrpcWebLayer::new())
        .service(routes);

    tower::util::BoxCloneService::new(stack)
}

/// Tags every inbound request with a UUID request id and a tracing span
/// carrying it (spec.md §4.2 "per-request UUID").
#[derive(Clone)]
struct RequestIdLayer;

impl<S> tower::Layer<S> for RequestIdLayer {
    type Service = RequestIdService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestIdService { inner }
    }
}

#[derive(Clone)]
struct RequestIdService<S> {
    inner: S,
}

impl<S, B> tower::Service<http::Request<B>> for RequestIdService<S>
where
    S: tower::Service<http::Request<B>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    B: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = std::pin::Pin<Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut std::task::Context<'_>) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: http::Request<B>) -> Self::Future {
        let request_id = Uuid::new_v4();
        let span = tracing::info_span!("request", %request_id, path = %req.uri().path());
        let mut inner = self.inner.clone();
        Box::pin(async move { inner.call(req).await }.instrument(span))
    }
}
