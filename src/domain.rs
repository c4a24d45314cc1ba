//! Domain types (spec.md §3), independent of the wire encoding in `pb`.
//!
//! The store and event listener speak these types; `handlers` convert
//! to/from the generated protobuf messages at the RPC boundary, so a
//! change to the wire schema never has to ripple into persistence code.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Deploy strategy for an app (spec.md §3 App entity).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployStrategy {
    /// Deploy every process at once.
    AllAtOnce,
    /// Deploy processes one at a time.
    OneByOne,
}

/// An application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct App {
    /// Opaque id (the resource name is `apps/{id}`).
    pub id: String,
    /// Human-readable display name.
    pub display_name: String,
    /// Free-form labels.
    pub labels: HashMap<String, String>,
    /// Deploy strategy.
    pub deploy_strategy: DeployStrategy,
    /// Deploy timeout, seconds.
    pub deploy_timeout: u32,
}

/// The closed set of release content tags (spec.md §3 ExpandedDeployment
/// "type tag (computed from old/new release content)").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseType {
    /// Release carries a new build artifact.
    Code,
    /// Release only changes configuration (env, process types).
    Config,
}

/// A release: an app's deployable artifact plus opaque metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Release {
    /// Opaque id (resource name is `apps/{app_id}/releases/{id}`).
    pub id: String,
    /// Owning app id.
    pub app_id: String,
    /// Free-form labels.
    pub labels: HashMap<String, String>,
    /// Release content type, used by type filters.
    pub release_type: ReleaseType,
    /// Opaque body (artifact references, process types, env, ...),
    /// passed through verbatim.
    pub body: serde_json::Value,
}

/// Lifecycle state of a [`ScaleRequest`] / mirrored onto [`Formation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleState {
    /// Awaiting a worker to act on it.
    Pending,
    /// A worker cancelled it.
    Cancelled,
    /// A worker completed it.
    Complete,
}

impl ScaleState {
    /// Terminal states end the synchronous `CreateScale` wait loop
    /// (spec.md §4.7).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Cancelled | Self::Complete)
    }
}

/// A client-originated request to change a release's process counts/tags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScaleRequest {
    /// Opaque id (resource name is `apps/{app_id}/releases/{release_id}/scale/{id}`).
    pub id: String,
    /// Owning app id.
    pub app_id: String,
    /// Target release id.
    pub release_id: String,
    /// Lifecycle state.
    pub state: ScaleState,
    /// Requested process-type -> count map, if any.
    pub new_processes: Option<HashMap<String, i32>>,
    /// Requested process-type -> (label -> value) map, if any.
    pub new_tags: Option<HashMap<String, HashMap<String, String>>>,
    /// Row-update ordering key, used by the formations handler to find
    /// the most-recent scale request for a release (spec.md §4.6 step 3).
    pub updated_at: DateTime<Utc>,
}

/// The derived, per-(app, release) view (spec.md §3 Formation entity).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Formation {
    /// Owning app id.
    pub app_id: String,
    /// Release id this formation describes.
    pub release_id: String,
    /// Current process-type -> count map.
    pub processes: HashMap<String, i32>,
    /// Current process-type -> (label -> value) map.
    pub tags: HashMap<String, HashMap<String, String>>,
    /// State mirrored from the latest scale request.
    pub state: ScaleState,
    /// Resource name of the most-recent scale request, if any.
    pub scale_request: Option<String>,
}

/// Deployment status (spec.md §3 ExpandedDeployment entity).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    /// Created, not yet started.
    Pending,
    /// In progress.
    Running,
    /// Finished successfully.
    Complete,
    /// Finished with an error.
    Failed,
}

/// A deployment from one release to another, with event-derived job state
/// merged in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpandedDeployment {
    /// Opaque id (resource name is `apps/{app_id}/deployments/{id}`).
    pub id: String,
    /// Owning app id.
    pub app_id: String,
    /// Release being replaced, if any (first deployment has none).
    pub old_release_id: Option<String>,
    /// Release being deployed to.
    pub new_release_id: String,
    /// Computed from old/new release content.
    pub release_type: ReleaseType,
    /// Current status.
    pub status: DeploymentStatus,
    /// Latest job state string merged in from the event stream.
    pub job_state: String,
    /// Latest job type string merged in from the event stream.
    pub job_type: String,
    /// Error message, set when `status == Failed`.
    pub error: Option<String>,
}

/// The kind of domain object an [`Event`] describes. Controls subscription
/// filtering (spec.md §3 Invariants).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectType {
    /// An [`App`] row changed.
    App,
    /// A [`Release`] row changed.
    Release,
    /// A [`ScaleRequest`] row changed.
    ScaleRequest,
    /// A deployment row changed.
    Deployment,
    /// A deployment-associated job event (spec.md §4.8 "job state").
    DeploymentEvent,
}

/// The kind of change a row-level [`Event`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Row was inserted.
    Create,
    /// Row was updated.
    Update,
    /// Row was deleted. Left unimplemented: deletion is a documented
    /// no-op everywhere it is observed (spec.md §9 Open Questions).
    Delete,
}

/// An append-only, strictly-ordered notification of a domain change
/// (spec.md §3 Event entity).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Monotonically increasing; defines the total delivery order within
    /// a single underlying subscriber (spec.md §3 Invariants).
    pub id: i64,
    /// App the change belongs to.
    pub app_id: String,
    /// Kind of object the change describes.
    pub object_type: ObjectType,
    /// Id of the changed object (release id, scale-request id, ...).
    pub object_id: String,
    /// Kind of change.
    pub operation: Operation,
    /// Opaque payload; decoded lazily by handlers that need a typed view.
    pub payload: serde_json::Value,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}
