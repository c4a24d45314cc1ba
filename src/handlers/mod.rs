//! List+stream RPC handlers (spec.md §4.5–§4.8).
//!
//! [`ControllerService`] is the single type the generated
//! `pb::controller_service_server::ControllerService` trait is implemented
//! on; each RPC's body lives in its own submodule as an inherent method,
//! mirroring how the teacher crate splits one `Router`'s procedures across
//! `auth.rs`/`cache.rs`/`rate_limit.rs` rather than one giant file.

mod apps;
pub mod convert;
mod deployments;
mod formations;
mod releases;
mod scale;

use std::pin::Pin;
use std::sync::Arc;

use tokio_stream::Stream;
use tonic::{Request, Response, Status};

use crate::config::Config;
use crate::events::listener::EventListener;
use crate::events::subscription::SubscriptionManager;
use crate::store::Row;
use crate::store::Store;

/// Boxed response stream shared by every server-streaming RPC.
pub type ResponseStream<T> = Pin<Box<dyn Stream<Item = Result<T, Status>> + Send + 'static>>;

/// Shared state behind every RPC handler: the store, the process-wide
/// event listener, and process configuration (spec.md §5 "Shared state").
#[derive(Clone)]
pub struct ControllerService {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) listener: Arc<EventListener>,
    pub(crate) config: Arc<Config>,
}

impl ControllerService {
    /// Build a service over an already-constructed store and listener.
    pub fn new(store: Arc<dyn Store>, listener: Arc<EventListener>, config: Arc<Config>) -> Self {
        ControllerService {
            store,
            listener,
            config,
        }
    }

    fn subscriptions(&self) -> SubscriptionManager {
        SubscriptionManager::new(self.listener.clone())
    }
}

/// Drop the newest surplus row and compute the next-page cursor if the
/// store returned more than `requested_size` rows (spec.md §4.5 Phase S
/// step 3: "request `pageSize+1` rows ...; if so, drop the surplus and set
/// the next-page token's `beforeID`"). Rows must already be oldest-first
/// (the store's canonical ordering); the last `row_id` kept in the page
/// becomes the next call's exclusive lower bound (spec.md §8 scenario A:
/// page `[a,b]`'s token decodes to `beforeID: id_of_b`).
pub(crate) fn paginate<T>(mut rows: Vec<Row<T>>, requested_size: i32) -> (Vec<Row<T>>, Option<i64>) {
    let has_more = rows.len() as i32 > requested_size;
    if has_more {
        rows.truncate(requested_size.max(0) as usize);
    }
    let next_before_id = if has_more {
        rows.last().map(|r| r.row_id)
    } else {
        None
    };
    (rows, next_before_id)
}

/// The highest row id actually returned in a Phase S page, used to seed
/// `currID` (spec.md §4.5 Phase S step 6). Callers must pass the page
/// *after* [`paginate`] has dropped the surplus probe row: seeding from
/// the untruncated fetch would pull in a row never shown to the caller,
/// letting `currID` suppress a legitimate later event for it. Takes the
/// true maximum rather than assuming a sort direction, since `row_id`
/// doubles as the `Event::id` sequence ([`crate::store::Row`]) and the
/// page is oldest-first.
pub(crate) fn max_row_id<T>(rows: &[Row<T>]) -> i64 {
    rows.iter().map(|r| r.row_id).max().unwrap_or(0)
}

#[tonic::async_trait]
impl pb::controller_service_server::ControllerService for ControllerService {
    type StreamAppsStream = ResponseStream<pb::StreamAppsResponse>;
    type StreamReleasesStream = ResponseStream<pb::StreamReleasesResponse>;
    type StreamScalesStream = ResponseStream<pb::StreamScalesResponse>;
    type StreamFormationsStream = ResponseStream<pb::StreamFormationsResponse>;
    type StreamDeploymentsStream = ResponseStream<pb::StreamDeploymentsResponse>;
    type CreateDeploymentStream = ResponseStream<pb::DeploymentEvent>;

    async fn stream_apps(
        &self,
        request: Request<pb::StreamAppsRequest>,
    ) -> Result<Response<Self::StreamAppsStream>, Status> {
        self.stream_apps_impl(request.into_inner())
            .await
            .map(Response::new)
            .map_err(Status::from)
    }

    async fn update_app(
        &self,
        request: Request<pb::UpdateAppRequest>,
    ) -> Result<Response<pb::App>, Status> {
        self.update_app_impl(request.into_inner())
            .await
            .map(Response::new)
            .map_err(Status::from)
    }

    async fn stream_releases(
        &self,
        request: Request<pb::StreamReleasesRequest>,
    ) -> Result<Response<Self::StreamReleasesStream>, Status> {
        self.stream_releases_impl(request.into_inner())
            .await
            .map(Response::new)
            .map_err(Status::from)
    }

    async fn create_release(
        &self,
        request: Request<pb::CreateReleaseRequest>,
    ) -> Result<Response<pb::Release>, Status> {
        self.create_release_impl(request.into_inner())
            .await
            .map(Response::new)
            .map_err(Status::from)
    }

    async fn stream_scales(
        &self,
        request: Request<pb::StreamScalesRequest>,
    ) -> Result<Response<Self::StreamScalesStream>, Status> {
        self.stream_scales_impl(request.into_inner())
            .await
            .map(Response::new)
            .map_err(Status::from)
    }

    async fn create_scale(
        &self,
        request: Request<pb::CreateScaleRequest>,
    ) -> Result<Response<pb::ScaleRequest>, Status> {
        self.create_scale_impl(request.into_inner())
            .await
            .map(Response::new)
            .map_err(Status::from)
    }

    async fn stream_formations(
        &self,
        request: Request<pb::StreamFormationsRequest>,
    ) -> Result<Response<Self::StreamFormationsStream>, Status> {
        self.stream_formations_impl(request.into_inner())
            .await
            .map(Response::new)
            .map_err(Status::from)
    }

    async fn stream_deployments(
        &self,
        request: Request<pb::StreamDeploymentsRequest>,
    ) -> Result<Response<Self::StreamDeploymentsStream>, Status> {
        self.stream_deployments_impl(request.into_inner())
            .await
            .map(Response::new)
            .map_err(Status::from)
    }

    async fn create_deployment(
        &self,
        request: Request<pb::CreateDeploymentRequest>,
    ) -> Result<Response<Self::CreateDeploymentStream>, Status> {
        self.create_deployment_impl(request.into_inner())
            .await
            .map(Response::new)
            .map_err(Status::from)
    }
}

use crate::pb;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Row;

    #[test]
    fn paginate_detects_next_page_and_trims_surplus() {
        let rows = vec![
            Row { row_id: 1, item: "a" },
            Row { row_id: 2, item: "b" },
            Row { row_id: 3, item: "c" },
        ];
        let (page, next) = paginate(rows, 2);
        assert_eq!(page.iter().map(|r| r.item).collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(next, Some(2));
    }

    #[test]
    fn paginate_no_next_page_when_store_returns_le_requested() {
        let rows = vec![Row { row_id: 1, item: "a" }, Row { row_id: 2, item: "b" }];
        let (page, next) = paginate(rows, 2);
        assert_eq!(page.len(), 2);
        assert_eq!(next, None);
    }

    #[test]
    fn max_row_id_is_zero_on_empty() {
        let rows: Vec<Row<&str>> = vec![];
        assert_eq!(max_row_id(&rows), 0);
    }
}
