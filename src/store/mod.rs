//! The relational store abstraction (spec.md §6 "out of scope: the
//! underlying relational store... treated as an external collaborator").
//!
//! `Store` is the abstract contract handlers depend on; `postgres` is the
//! concrete `sqlx::PgPool`-backed adapter (including the `LISTEN`/`NOTIFY`
//! change feed the event listener consumes), and `memory` is an in-memory
//! fake used by unit and scenario tests so they don't need a live Postgres
//! instance (spec.md §8 "the sqlx adapter is not exercised in tests").

pub mod memory;
pub mod postgres;

use async_trait::async_trait;

use crate::domain::{App, ExpandedDeployment, Release, ScaleRequest};
use crate::error::ControllerError;

/// A row plus the monotonic id pagination cursors are built from. Distinct
/// from the entity's own string id: this is insertion order within the
/// store, used only to satisfy the `beforeID` cursor (spec.md §4.5 Phase S
/// step 3).
///
/// `row_id` must be drawn from the *same* monotonic sequence as
/// [`crate::domain::Event::id`] — not an independent per-table serial.
/// Handlers seed their Phase L dedup guard (`currID`) from the `row_id`s
/// of the page they just returned and then compare it against `event.id`
/// values coming off the change feed (spec.md §8 property 2: a snapshot
/// row and a live event for the same mutation must never both be
/// delivered). That guard is only sound if a `row_id` and the `event.id`
/// recording the same mutation are the same number. The in-memory store
/// gets this for free (one `AtomicI64` feeds both); the Postgres adapter
/// must populate each table's `row_id` column from the `events.id` the
/// mutating trigger assigned, not a separate `SERIAL`.
#[derive(Debug, Clone, PartialEq)]
pub struct Row<T> {
    /// Monotonic row id used for pagination, shared with `Event::id`.
    pub row_id: i64,
    /// The row itself.
    pub item: T,
}

/// Abstract persistence contract every handler depends on.
///
/// Row ordering for all `list_*` methods is oldest-first (ascending by
/// `row_id` / insertion order), with `before_id` acting as an exclusive
/// lower bound: a page's last row_id becomes the next page's `before_id`,
/// matching `StreamAppsRequest`'s scenario A wording verbatim (spec.md §8
/// scenario A: apps `[a,b,c,d]` in insertion order page to `[a,b]` then
/// `[c,d]`, with the first page's token decoding to `beforeID: id_of_b`).
#[async_trait]
pub trait Store: Send + Sync {
    /// List apps oldest first (insertion order), at most `limit` rows
    /// with `row_id > before_id` (if set).
    async fn list_apps(
        &self,
        before_id: Option<i64>,
        limit: i64,
    ) -> Result<Vec<Row<App>>, ControllerError>;

    /// Fetch a single app by id.
    async fn get_app(&self, app_id: &str) -> Result<App, ControllerError>;

    /// Persist field-mask-selected changes to an app and return the
    /// updated row.
    async fn update_app(&self, app: App) -> Result<App, ControllerError>;

    /// List releases, optionally restricted to `app_ids` (empty means all
    /// apps), oldest first (insertion order).
    async fn list_releases(
        &self,
        app_ids: &[String],
        before_id: Option<i64>,
        limit: i64,
    ) -> Result<Vec<Row<Release>>, ControllerError>;

    /// Insert a release under `app_id` and return the stored row.
    async fn create_release(
        &self,
        app_id: &str,
        release: Release,
    ) -> Result<Release, ControllerError>;

    /// Fetch a single release by id.
    async fn get_release(&self, app_id: &str, release_id: &str) -> Result<Release, ControllerError>;

    /// The id of the most recently created release for an app, if any.
    async fn latest_release_id(&self, app_id: &str) -> Result<Option<String>, ControllerError>;

    /// Insert a scale request in state `Pending` and return the stored row.
    async fn create_scale_request(
        &self,
        req: ScaleRequest,
    ) -> Result<ScaleRequest, ControllerError>;

    /// Fetch a single scale request.
    async fn get_scale_request(
        &self,
        app_id: &str,
        release_id: &str,
        scale_id: &str,
    ) -> Result<ScaleRequest, ControllerError>;

    /// List scale requests, optionally restricted to `app_ids` (empty
    /// means all apps), newest-updated first.
    async fn list_scale_requests(
        &self,
        app_ids: &[String],
    ) -> Result<Vec<ScaleRequest>, ControllerError>;

    /// Current process/tag state for (app, release), independent of any
    /// scale request (spec.md §4.6 step 2).
    async fn get_formation_state(
        &self,
        app_id: &str,
        release_id: &str,
    ) -> Result<(std::collections::HashMap<String, i32>, std::collections::HashMap<String, std::collections::HashMap<String, String>>), ControllerError>;

    /// Resource name and state of the most-recently-updated scale request
    /// for (app, release), descending by `updated_at` (spec.md §4.6 step 3).
    async fn latest_scale_request_for_release(
        &self,
        app_id: &str,
        release_id: &str,
    ) -> Result<Option<ScaleRequest>, ControllerError>;

    /// List deployments, optionally restricted to `app_ids`, oldest first
    /// (insertion order).
    async fn list_deployments(
        &self,
        app_ids: &[String],
        before_id: Option<i64>,
        limit: i64,
    ) -> Result<Vec<Row<ExpandedDeployment>>, ControllerError>;

    /// Insert a pending deployment and return the stored row.
    async fn create_deployment(
        &self,
        app_id: &str,
        old_release_id: Option<String>,
        new_release_id: String,
        release_type: crate::domain::ReleaseType,
    ) -> Result<ExpandedDeployment, ControllerError>;

    /// Fetch a single deployment.
    async fn get_deployment(
        &self,
        app_id: &str,
        deployment_id: &str,
    ) -> Result<ExpandedDeployment, ControllerError>;

    /// Transition a scale request's state. Modeled on the external worker
    /// queue's effect on the store (spec.md §1 "the queue library used by
    /// release workers" is out of scope; this is the row-level mutation
    /// that queue's workers perform once they finish). Emits the matching
    /// `scale_request` event.
    async fn update_scale_request_state(
        &self,
        app_id: &str,
        release_id: &str,
        scale_id: &str,
        state: crate::domain::ScaleState,
    ) -> Result<ScaleRequest, ControllerError>;

    /// Merge a job update into a deployment (spec.md §4.8 "for every event
    /// emits a delta carrying ... job type, job state, error string").
    /// Emits the matching `deployment` event.
    async fn update_deployment(
        &self,
        app_id: &str,
        deployment_id: &str,
        status: crate::domain::DeploymentStatus,
        job_type: String,
        job_state: String,
        error: Option<String>,
    ) -> Result<ExpandedDeployment, ControllerError>;
}
