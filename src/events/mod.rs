//! Event subscription fabric (spec.md §4.3, §4.4).
//!
//! `listener` is the process-wide singleton that turns the store's
//! row-level change feed into per-subscriber channels; `subscription` is
//! the per-RPC-call object that aggregates one or more of those channels
//! into a single merged stream.

pub mod listener;
pub mod subscription;

use async_trait::async_trait;

use crate::domain::Event;
use crate::error::ControllerError;

/// Abstract row-level change feed the event listener consumes. The real
/// implementation ([`crate::store::postgres::PgChangeFeed`]) wraps a
/// `LISTEN`/`NOTIFY` connection; tests use
/// [`crate::store::memory::MemoryChangeFeed`] instead so the subscription
/// fabric can be exercised without a live Postgres instance.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Open (or re-open) the underlying connection and return a handle
    /// that yields events as they arrive.
    async fn connect(&self) -> Result<Box<dyn ChangeFeedConnection>, ControllerError>;
}

/// A single open change-feed connection.
#[async_trait]
pub trait ChangeFeedConnection: Send {
    /// Receive the next event. `Ok(None)` means the feed closed cleanly;
    /// `Err` means the connection failed and should be re-opened by the
    /// caller.
    async fn recv(&mut self) -> Result<Option<Event>, ControllerError>;
}
