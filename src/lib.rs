//! # controller
//!
//! A streaming gRPC control-plane server for an application-hosting
//! platform: apps, releases, scale requests, formations, and deployments,
//! all backed by a Postgres store and fanned out to clients over a
//! `LISTEN`/`NOTIFY` change feed.
//!
//! ## Architecture
//!
//! - [`config`] — process configuration from environment variables.
//! - [`domain`] — persistence-facing types, independent of the wire schema.
//! - [`pb`] — generated protobuf/gRPC types (see `build.rs`).
//! - [`store`] — the [`store::Store`] trait plus a Postgres adapter and an
//!   in-memory fake used by tests.
//! - [`events`] — the process-wide [`events::listener::EventListener`] and
//!   per-RPC [`events::subscription::SubscriptionManager`] that turn store
//!   change-feed rows into filtered, merged event channels.
//! - [`handlers`] — [`handlers::ControllerService`], the RPC implementation.
//! - [`server`] — the connection demultiplexer and HTTP/gRPC-Web wrapper.
//!
//! `filters`, `names`, and `page_token` are small, independently-tested
//! building blocks shared across the handlers.

pub mod config;
pub mod domain;
pub mod error;
pub mod events;
pub mod filters;
pub mod handlers;
pub mod names;
pub mod page_token;
pub mod pb;
pub mod server;
pub mod store;

pub use config::Config;
pub use error::ControllerError;
pub use handlers::ControllerService;
