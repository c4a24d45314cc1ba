//! In-memory fake [`Store`] + [`ChangeFeed`], used by unit and scenario
//! tests so they exercise real handler logic without a live Postgres
//! instance (spec.md §8: "the sqlx adapter is not exercised in tests").
//!
//! Every mutating method also publishes the matching [`Event`] onto its
//! [`MemoryChangeFeed`], mirroring the `NOTIFY` trigger the Postgres
//! adapter relies on, so tests can drive both the snapshot and the
//! live-tail path through the exact same `Store` + `EventListener` wiring
//! production code uses.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::broadcast;

use super::{Row, Store};
use crate::domain::{
    App, DeploymentStatus, Event, ExpandedDeployment, ObjectType, Operation, Release,
    ReleaseType, ScaleRequest, ScaleState,
};
use crate::error::ControllerError;
use crate::events::{ChangeFeed, ChangeFeedConnection};

/// An in-process, broadcast-backed stand-in for the Postgres change feed.
pub struct MemoryChangeFeed {
    tx: broadcast::Sender<Event>,
}

impl MemoryChangeFeed {
    /// Build a feed with a generous backlog so bursty tests don't lag.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        MemoryChangeFeed { tx }
    }

    /// Publish an event to every currently-connected subscriber.
    pub fn publish(&self, event: Event) {
        let _ = self.tx.send(event);
    }
}

impl Default for MemoryChangeFeed {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChangeFeed for MemoryChangeFeed {
    async fn connect(&self) -> Result<Box<dyn ChangeFeedConnection>, ControllerError> {
        Ok(Box::new(MemoryChangeFeedConnection {
            rx: self.tx.subscribe(),
        }))
    }
}

struct MemoryChangeFeedConnection {
    rx: broadcast::Receiver<Event>,
}

#[async_trait]
impl ChangeFeedConnection for MemoryChangeFeedConnection {
    async fn recv(&mut self) -> Result<Option<Event>, ControllerError> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Ok(Some(event)),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "memory change feed lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(None),
            }
        }
    }
}

/// In-memory [`Store`] implementation. `Row::row_id` is assignment order
/// and, deliberately, the *same* counter `emit` uses for `Event::id`
/// ([`crate::store::Row`]): in production the trigger populating a row's
/// `row_id` column is expected to stamp it with the `events.id` it just
/// inserted, and this store mirrors that instead of taking a shortcut
/// that would only work by accident.
pub struct MemoryStore {
    feed: Arc<MemoryChangeFeed>,
    next_row_id: AtomicI64,
    apps: RwLock<Vec<Row<App>>>,
    releases: RwLock<Vec<Row<Release>>>,
    scale_requests: RwLock<Vec<ScaleRequest>>,
    deployments: RwLock<Vec<Row<ExpandedDeployment>>>,
}

impl MemoryStore {
    /// Build an empty store publishing onto `feed`.
    pub fn new(feed: Arc<MemoryChangeFeed>) -> Self {
        MemoryStore {
            feed,
            next_row_id: AtomicI64::new(1),
            apps: RwLock::new(Vec::new()),
            releases: RwLock::new(Vec::new()),
            scale_requests: RwLock::new(Vec::new()),
            deployments: RwLock::new(Vec::new()),
        }
    }

    fn alloc_row_id(&self) -> i64 {
        self.next_row_id.fetch_add(1, Ordering::SeqCst)
    }

    fn emit(
        &self,
        app_id: &str,
        object_type: ObjectType,
        object_id: &str,
        operation: Operation,
        payload: serde_json::Value,
    ) {
        self.feed.publish(Event {
            id: self.alloc_row_id(),
            app_id: app_id.to_string(),
            object_type,
            object_id: object_id.to_string(),
            operation,
            payload,
            created_at: Utc::now(),
        });
    }

    /// Seed an app without publishing an event. Used by tests to build
    /// fixture state before opening a subscription (spec.md §8 scenario A).
    pub fn seed_app(&self, app: App) {
        let row_id = self.alloc_row_id();
        self.apps.write().unwrap().push(Row { row_id, item: app });
    }

    /// Seed a release without publishing an event.
    pub fn seed_release(&self, release: Release) {
        let row_id = self.alloc_row_id();
        self.releases
            .write()
            .unwrap()
            .push(Row { row_id, item: release });
    }
}

/// Oldest-first (insertion order) pagination: only rows after `before_id`
/// (spec.md §8 scenario A), ascending by `row_id`, capped at `limit`.
fn paginate<T: Clone>(rows: &[Row<T>], before_id: Option<i64>, limit: i64) -> Vec<Row<T>> {
    let mut matching: Vec<&Row<T>> = rows
        .iter()
        .filter(|r| before_id.is_none_or_after(r.row_id))
        .collect();
    matching.sort_by(|a, b| a.row_id.cmp(&b.row_id));
    matching
        .into_iter()
        .take(limit.max(0) as usize)
        .cloned()
        .collect()
}

// Small local helper trait so `paginate` reads naturally; avoids relying
// on the nightly-adjacent `Option::is_none_or`.
trait BeforeId {
    fn is_none_or_after(&self, row_id: i64) -> bool;
}
impl BeforeId for Option<i64> {
    fn is_none_or_after(&self, row_id: i64) -> bool {
        match self {
            None => true,
            Some(before) => row_id > *before,
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn list_apps(
        &self,
        before_id: Option<i64>,
        limit: i64,
    ) -> Result<Vec<Row<App>>, ControllerError> {
        Ok(paginate(&self.apps.read().unwrap(), before_id, limit))
    }

    async fn get_app(&self, app_id: &str) -> Result<App, ControllerError> {
        self.apps
            .read()
            .unwrap()
            .iter()
            .find(|r| r.item.id == app_id)
            .map(|r| r.item.clone())
            .ok_or_else(|| ControllerError::not_found(format!("app {app_id}")))
    }

    async fn update_app(&self, app: App) -> Result<App, ControllerError> {
        let mut apps = self.apps.write().unwrap();
        let row = apps
            .iter_mut()
            .find(|r| r.item.id == app.id)
            .ok_or_else(|| ControllerError::not_found(format!("app {}", app.id)))?;
        row.item = app.clone();
        drop(apps);
        self.emit(
            &app.id,
            ObjectType::App,
            &app.id,
            Operation::Update,
            serde_json::to_value(&app).unwrap_or_default(),
        );
        Ok(app)
    }

    async fn list_releases(
        &self,
        app_ids: &[String],
        before_id: Option<i64>,
        limit: i64,
    ) -> Result<Vec<Row<Release>>, ControllerError> {
        let releases = self.releases.read().unwrap();
        let filtered: Vec<Row<Release>> = releases
            .iter()
            .filter(|r| app_ids.is_empty() || app_ids.contains(&r.item.app_id))
            .cloned()
            .collect();
        Ok(paginate(&filtered, before_id, limit))
    }

    async fn create_release(
        &self,
        app_id: &str,
        mut release: Release,
    ) -> Result<Release, ControllerError> {
        if release.id.is_empty() {
            release.id = uuid::Uuid::new_v4().to_string();
        }
        release.app_id = app_id.to_string();
        let row_id = self.alloc_row_id();
        self.releases.write().unwrap().push(Row {
            row_id,
            item: release.clone(),
        });
        self.emit(
            app_id,
            ObjectType::Release,
            &release.id,
            Operation::Create,
            serde_json::to_value(&release).unwrap_or_default(),
        );
        Ok(release)
    }

    async fn get_release(&self, app_id: &str, release_id: &str) -> Result<Release, ControllerError> {
        self.releases
            .read()
            .unwrap()
            .iter()
            .find(|r| r.item.app_id == app_id && r.item.id == release_id)
            .map(|r| r.item.clone())
            .ok_or_else(|| ControllerError::not_found(format!("release {release_id}")))
    }

    async fn latest_release_id(&self, app_id: &str) -> Result<Option<String>, ControllerError> {
        Ok(self
            .releases
            .read()
            .unwrap()
            .iter()
            .filter(|r| r.item.app_id == app_id)
            .max_by_key(|r| r.row_id)
            .map(|r| r.item.id.clone()))
    }

    async fn create_scale_request(
        &self,
        mut req: ScaleRequest,
    ) -> Result<ScaleRequest, ControllerError> {
        if req.id.is_empty() {
            req.id = uuid::Uuid::new_v4().to_string();
        }
        req.updated_at = Utc::now();
        self.scale_requests.write().unwrap().push(req.clone());
        self.emit(
            &req.app_id,
            ObjectType::ScaleRequest,
            &req.id,
            Operation::Create,
            serde_json::to_value(&req).unwrap_or_default(),
        );
        Ok(req)
    }

    async fn get_scale_request(
        &self,
        app_id: &str,
        release_id: &str,
        scale_id: &str,
    ) -> Result<ScaleRequest, ControllerError> {
        self.scale_requests
            .read()
            .unwrap()
            .iter()
            .find(|r| r.app_id == app_id && r.release_id == release_id && r.id == scale_id)
            .cloned()
            .ok_or_else(|| ControllerError::not_found(format!("scale request {scale_id}")))
    }

    async fn list_scale_requests(
        &self,
        app_ids: &[String],
    ) -> Result<Vec<ScaleRequest>, ControllerError> {
        let mut matching: Vec<ScaleRequest> = self
            .scale_requests
            .read()
            .unwrap()
            .iter()
            .filter(|r| app_ids.is_empty() || app_ids.contains(&r.app_id))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(matching)
    }

    async fn get_formation_state(
        &self,
        app_id: &str,
        release_id: &str,
    ) -> Result<
        (
            HashMap<String, i32>,
            HashMap<String, HashMap<String, String>>,
        ),
        ControllerError,
    > {
        let latest_complete = self
            .scale_requests
            .read()
            .unwrap()
            .iter()
            .filter(|r| {
                r.app_id == app_id && r.release_id == release_id && r.state == ScaleState::Complete
            })
            .max_by_key(|r| r.updated_at)
            .cloned();
        Ok(match latest_complete {
            Some(r) => (
                r.new_processes.unwrap_or_default(),
                r.new_tags.unwrap_or_default(),
            ),
            None => (HashMap::new(), HashMap::new()),
        })
    }

    async fn latest_scale_request_for_release(
        &self,
        app_id: &str,
        release_id: &str,
    ) -> Result<Option<ScaleRequest>, ControllerError> {
        Ok(self
            .scale_requests
            .read()
            .unwrap()
            .iter()
            .filter(|r| r.app_id == app_id && r.release_id == release_id)
            .max_by_key(|r| r.updated_at)
            .cloned())
    }

    async fn list_deployments(
        &self,
        app_ids: &[String],
        before_id: Option<i64>,
        limit: i64,
    ) -> Result<Vec<Row<ExpandedDeployment>>, ControllerError> {
        let deployments = self.deployments.read().unwrap();
        let filtered: Vec<Row<ExpandedDeployment>> = deployments
            .iter()
            .filter(|r| app_ids.is_empty() || app_ids.contains(&r.item.app_id))
            .cloned()
            .collect();
        Ok(paginate(&filtered, before_id, limit))
    }

    async fn create_deployment(
        &self,
        app_id: &str,
        old_release_id: Option<String>,
        new_release_id: String,
        release_type: ReleaseType,
    ) -> Result<ExpandedDeployment, ControllerError> {
        let deployment = ExpandedDeployment {
            id: uuid::Uuid::new_v4().to_string(),
            app_id: app_id.to_string(),
            old_release_id,
            new_release_id,
            release_type,
            status: DeploymentStatus::Pending,
            job_state: String::new(),
            job_type: String::new(),
            error: None,
        };
        let row_id = self.alloc_row_id();
        self.deployments.write().unwrap().push(Row {
            row_id,
            item: deployment.clone(),
        });
        self.emit(
            app_id,
            ObjectType::Deployment,
            &deployment.id,
            Operation::Create,
            serde_json::to_value(&deployment).unwrap_or_default(),
        );
        Ok(deployment)
    }

    async fn get_deployment(
        &self,
        app_id: &str,
        deployment_id: &str,
    ) -> Result<ExpandedDeployment, ControllerError> {
        self.deployments
            .read()
            .unwrap()
            .iter()
            .find(|r| r.item.app_id == app_id && r.item.id == deployment_id)
            .map(|r| r.item.clone())
            .ok_or_else(|| ControllerError::not_found(format!("deployment {deployment_id}")))
    }

    async fn update_scale_request_state(
        &self,
        app_id: &str,
        release_id: &str,
        scale_id: &str,
        state: ScaleState,
    ) -> Result<ScaleRequest, ControllerError> {
        let updated = {
            let mut requests = self.scale_requests.write().unwrap();
            let req = requests
                .iter_mut()
                .find(|r| r.app_id == app_id && r.release_id == release_id && r.id == scale_id)
                .ok_or_else(|| ControllerError::not_found(format!("scale request {scale_id}")))?;
            req.state = state;
            req.updated_at = Utc::now();
            req.clone()
        };
        self.emit(
            app_id,
            ObjectType::ScaleRequest,
            scale_id,
            Operation::Update,
            serde_json::to_value(&updated).unwrap_or_default(),
        );
        Ok(updated)
    }

    async fn update_deployment(
        &self,
        app_id: &str,
        deployment_id: &str,
        status: DeploymentStatus,
        job_type: String,
        job_state: String,
        error: Option<String>,
    ) -> Result<ExpandedDeployment, ControllerError> {
        let updated = {
            let mut deployments = self.deployments.write().unwrap();
            let row = deployments
                .iter_mut()
                .find(|r| r.item.app_id == app_id && r.item.id == deployment_id)
                .ok_or_else(|| ControllerError::not_found(format!("deployment {deployment_id}")))?;
            row.item.status = status;
            row.item.job_type = job_type;
            row.item.job_state = job_state;
            row.item.error = error;
            row.item.clone()
        };
        self.emit(
            app_id,
            ObjectType::Deployment,
            deployment_id,
            Operation::Update,
            serde_json::to_value(&updated).unwrap_or_default(),
        );
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::DeployStrategy;

    fn sample_app(id: &str) -> App {
        App {
            id: id.to_string(),
            display_name: id.to_string(),
            labels: HashMap::new(),
            deploy_strategy: DeployStrategy::AllAtOnce,
            deploy_timeout: 30,
        }
    }

    #[tokio::test]
    async fn paginates_oldest_first_with_before_id_cursor() {
        let store = MemoryStore::new(Arc::new(MemoryChangeFeed::new()));
        for id in ["a", "b", "c", "d"] {
            store.seed_app(sample_app(id));
        }

        let page = store.list_apps(None, 2).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].item.id, "a");
        assert_eq!(page[1].item.id, "b");

        let next = store.list_apps(Some(page[1].row_id), 2).await.unwrap();
        assert_eq!(next.len(), 2);
        assert_eq!(next[0].item.id, "c");
        assert_eq!(next[1].item.id, "d");
    }

    #[tokio::test]
    async fn create_release_emits_event() {
        let feed = Arc::new(MemoryChangeFeed::new());
        let store = MemoryStore::new(feed.clone());
        let mut conn = feed.connect().await.unwrap();

        let release = Release {
            id: String::new(),
            app_id: String::new(),
            labels: HashMap::new(),
            release_type: ReleaseType::Code,
            body: serde_json::json!({}),
        };
        let created = store.create_release("app1", release).await.unwrap();
        assert!(!created.id.is_empty());

        let event = conn.recv().await.unwrap().unwrap();
        assert_eq!(event.object_id, created.id);
        assert_eq!(event.app_id, "app1");
    }
}
