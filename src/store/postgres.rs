//! Postgres-backed [`Store`] and [`ChangeFeed`].
//!
//! The schema itself (DDL, migrations, statement preparation) is the
//! external collaborator spec.md §1 scopes out; this module only depends
//! on its abstract shape: five tables (`apps`, `releases`,
//! `scale_requests`, `deployments`, `events`) and a trigger that issues
//! `NOTIFY controller_events, <json>` with the inserted/updated `events`
//! row whenever one of the other four tables changes.
//!
//! One requirement this module leans on that the DDL must honor: each of
//! `apps.row_id`, `releases.row_id`, and `deployments.row_id` is not an
//! independent per-table serial. It is expected to carry the `id` of the
//! `events` row the same trigger inserted for that mutation, so the
//! pagination cursor these queries return and the `event.id` values the
//! change feed delivers come from one monotonic sequence. `handlers::
//! max_row_id`'s `currID` dedup guard (spec.md §8 property 2) is only
//! correct if that holds.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgListener;
use sqlx::{FromRow, PgPool};

use super::{Row, Store};
use crate::domain::{
    App, DeployStrategy, DeploymentStatus, Event, ExpandedDeployment, ObjectType, Operation,
    Release, ReleaseType, ScaleRequest, ScaleState,
};
use crate::error::ControllerError;
use crate::events::{ChangeFeed, ChangeFeedConnection};

/// Channel the Postgres trigger `NOTIFY`s on.
const NOTIFY_CHANNEL: &str = "controller_events";

/// `sqlx::PgPool`-backed store.
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Wrap an already-connected pool.
    pub fn new(pool: PgPool) -> Self {
        PostgresStore { pool }
    }

    /// Connect to `database_url` and wrap the resulting pool.
    pub async fn connect(database_url: &str) -> Result<Self, ControllerError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| ControllerError::internal(format!("database connect failed: {e}")))?;
        Ok(Self::new(pool))
    }

    /// A change feed sharing this store's pool.
    pub fn change_feed(&self) -> PgChangeFeed {
        PgChangeFeed {
            pool: self.pool.clone(),
        }
    }
}

#[derive(FromRow)]
struct AppRow {
    id: String,
    display_name: String,
    labels: serde_json::Value,
    deploy_strategy: String,
    deploy_timeout: i32,
    row_id: i64,
}

impl AppRow {
    fn into_row(self) -> Result<Row<App>, ControllerError> {
        let deploy_strategy = match self.deploy_strategy.as_str() {
            "all_at_once" => DeployStrategy::AllAtOnce,
            "one_by_one" => DeployStrategy::OneByOne,
            other => {
                return Err(ControllerError::internal(format!(
                    "unknown deploy_strategy {other:?}"
                )))
            }
        };
        let labels: HashMap<String, String> = serde_json::from_value(self.labels)
            .map_err(|e| ControllerError::internal(format!("malformed labels: {e}")))?;
        Ok(Row {
            row_id: self.row_id,
            item: App {
                id: self.id,
                display_name: self.display_name,
                labels,
                deploy_strategy,
                deploy_timeout: self.deploy_timeout as u32,
            },
        })
    }
}

#[derive(FromRow)]
struct ReleaseRow {
    id: String,
    app_id: String,
    labels: serde_json::Value,
    release_type: String,
    body: serde_json::Value,
    row_id: i64,
}

impl ReleaseRow {
    fn into_row(self) -> Result<Row<Release>, ControllerError> {
        let release_type = parse_release_type(&self.release_type)?;
        let labels: HashMap<String, String> = serde_json::from_value(self.labels)
            .map_err(|e| ControllerError::internal(format!("malformed labels: {e}")))?;
        Ok(Row {
            row_id: self.row_id,
            item: Release {
                id: self.id,
                app_id: self.app_id,
                labels,
                release_type,
                body: self.body,
            },
        })
    }
}

fn parse_release_type(s: &str) -> Result<ReleaseType, ControllerError> {
    match s {
        "code" => Ok(ReleaseType::Code),
        "config" => Ok(ReleaseType::Config),
        other => Err(ControllerError::internal(format!(
            "unknown release_type {other:?}"
        ))),
    }
}

fn release_type_str(t: ReleaseType) -> &'static str {
    match t {
        ReleaseType::Code => "code",
        ReleaseType::Config => "config",
    }
}

#[derive(FromRow)]
struct ScaleRequestRow {
    id: String,
    app_id: String,
    release_id: String,
    state: String,
    new_processes: Option<serde_json::Value>,
    new_tags: Option<serde_json::Value>,
    updated_at: DateTime<Utc>,
}

impl ScaleRequestRow {
    fn into_domain(self) -> Result<ScaleRequest, ControllerError> {
        let state = match self.state.as_str() {
            "pending" => ScaleState::Pending,
            "cancelled" => ScaleState::Cancelled,
            "complete" => ScaleState::Complete,
            other => {
                return Err(ControllerError::internal(format!(
                    "unknown scale state {other:?}"
                )))
            }
        };
        let new_processes = self
            .new_processes
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| ControllerError::internal(format!("malformed new_processes: {e}")))?;
        let new_tags = self
            .new_tags
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| ControllerError::internal(format!("malformed new_tags: {e}")))?;
        Ok(ScaleRequest {
            id: self.id,
            app_id: self.app_id,
            release_id: self.release_id,
            state,
            new_processes,
            new_tags,
            updated_at: self.updated_at,
        })
    }
}

fn scale_state_str(s: ScaleState) -> &'static str {
    match s {
        ScaleState::Pending => "pending",
        ScaleState::Cancelled => "cancelled",
        ScaleState::Complete => "complete",
    }
}

#[derive(FromRow)]
struct DeploymentRow {
    id: String,
    app_id: String,
    old_release_id: Option<String>,
    new_release_id: String,
    release_type: String,
    status: String,
    job_state: String,
    job_type: String,
    error: Option<String>,
    row_id: i64,
}

impl DeploymentRow {
    fn into_row(self) -> Result<Row<ExpandedDeployment>, ControllerError> {
        let release_type = parse_release_type(&self.release_type)?;
        let status = match self.status.as_str() {
            "pending" => DeploymentStatus::Pending,
            "running" => DeploymentStatus::Running,
            "complete" => DeploymentStatus::Complete,
            "failed" => DeploymentStatus::Failed,
            other => {
                return Err(ControllerError::internal(format!(
                    "unknown deployment status {other:?}"
                )))
            }
        };
        Ok(Row {
            row_id: self.row_id,
            item: ExpandedDeployment {
                id: self.id,
                app_id: self.app_id,
                old_release_id: self.old_release_id,
                new_release_id: self.new_release_id,
                release_type,
                status,
                job_state: self.job_state,
                job_type: self.job_type,
                error: self.error,
            },
        })
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn list_apps(
        &self,
        before_id: Option<i64>,
        limit: i64,
    ) -> Result<Vec<Row<App>>, ControllerError> {
        let rows = sqlx::query_as::<_, AppRow>(
            "SELECT id, display_name, labels, deploy_strategy, deploy_timeout, row_id \
             FROM apps WHERE $1::bigint IS NULL OR row_id > $1 \
             ORDER BY row_id ASC LIMIT $2",
        )
        .bind(before_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(AppRow::into_row).collect()
    }

    async fn get_app(&self, app_id: &str) -> Result<App, ControllerError> {
        let row = sqlx::query_as::<_, AppRow>(
            "SELECT id, display_name, labels, deploy_strategy, deploy_timeout, row_id \
             FROM apps WHERE id = $1",
        )
        .bind(app_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into_row()?.item)
    }

    async fn update_app(&self, app: App) -> Result<App, ControllerError> {
        let labels = serde_json::to_value(&app.labels).unwrap_or_default();
        let deploy_strategy = match app.deploy_strategy {
            DeployStrategy::AllAtOnce => "all_at_once",
            DeployStrategy::OneByOne => "one_by_one",
        };
        sqlx::query(
            "UPDATE apps SET display_name = $2, labels = $3, deploy_strategy = $4, \
             deploy_timeout = $5 WHERE id = $1",
        )
        .bind(&app.id)
        .bind(&app.display_name)
        .bind(labels)
        .bind(deploy_strategy)
        .bind(app.deploy_timeout as i32)
        .execute(&self.pool)
        .await?;
        Ok(app)
    }

    async fn list_releases(
        &self,
        app_ids: &[String],
        before_id: Option<i64>,
        limit: i64,
    ) -> Result<Vec<Row<Release>>, ControllerError> {
        let rows = sqlx::query_as::<_, ReleaseRow>(
            "SELECT id, app_id, labels, release_type, body, row_id FROM releases \
             WHERE (array_length($1::text[], 1) IS NULL OR app_id = ANY($1)) \
             AND ($2::bigint IS NULL OR row_id > $2) \
             ORDER BY row_id ASC LIMIT $3",
        )
        .bind(app_ids)
        .bind(before_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ReleaseRow::into_row).collect()
    }

    async fn create_release(
        &self,
        app_id: &str,
        release: Release,
    ) -> Result<Release, ControllerError> {
        let id = if release.id.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            release.id.clone()
        };
        let labels = serde_json::to_value(&release.labels).unwrap_or_default();
        sqlx::query(
            "INSERT INTO releases (id, app_id, labels, release_type, body) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(&id)
        .bind(app_id)
        .bind(labels)
        .bind(release_type_str(release.release_type))
        .bind(&release.body)
        .execute(&self.pool)
        .await?;
        Ok(Release {
            id,
            app_id: app_id.to_string(),
            ..release
        })
    }

    async fn get_release(&self, app_id: &str, release_id: &str) -> Result<Release, ControllerError> {
        let row = sqlx::query_as::<_, ReleaseRow>(
            "SELECT id, app_id, labels, release_type, body, row_id FROM releases \
             WHERE app_id = $1 AND id = $2",
        )
        .bind(app_id)
        .bind(release_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into_row()?.item)
    }

    async fn latest_release_id(&self, app_id: &str) -> Result<Option<String>, ControllerError> {
        let id: Option<String> = sqlx::query_scalar(
            "SELECT id FROM releases WHERE app_id = $1 ORDER BY row_id DESC LIMIT 1",
        )
        .bind(app_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }

    async fn create_scale_request(
        &self,
        req: ScaleRequest,
    ) -> Result<ScaleRequest, ControllerError> {
        let id = if req.id.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            req.id.clone()
        };
        let new_processes = req.new_processes.as_ref().map(serde_json::to_value).transpose().ok().flatten();
        let new_tags = req.new_tags.as_ref().map(serde_json::to_value).transpose().ok().flatten();
        let row: ScaleRequestRow = sqlx::query_as(
            "INSERT INTO scale_requests (id, app_id, release_id, state, new_processes, new_tags, updated_at) \
             VALUES ($1, $2, $3, 'pending', $4, $5, now()) \
             RETURNING id, app_id, release_id, state, new_processes, new_tags, updated_at",
        )
        .bind(&id)
        .bind(&req.app_id)
        .bind(&req.release_id)
        .bind(new_processes)
        .bind(new_tags)
        .fetch_one(&self.pool)
        .await?;
        row.into_domain()
    }

    async fn get_scale_request(
        &self,
        app_id: &str,
        release_id: &str,
        scale_id: &str,
    ) -> Result<ScaleRequest, ControllerError> {
        let row: ScaleRequestRow = sqlx::query_as(
            "SELECT id, app_id, release_id, state, new_processes, new_tags, updated_at \
             FROM scale_requests WHERE app_id = $1 AND release_id = $2 AND id = $3",
        )
        .bind(app_id)
        .bind(release_id)
        .bind(scale_id)
        .fetch_one(&self.pool)
        .await?;
        row.into_domain()
    }

    async fn list_scale_requests(
        &self,
        app_ids: &[String],
    ) -> Result<Vec<ScaleRequest>, ControllerError> {
        let rows: Vec<ScaleRequestRow> = sqlx::query_as(
            "SELECT id, app_id, release_id, state, new_processes, new_tags, updated_at \
             FROM scale_requests \
             WHERE array_length($1::text[], 1) IS NULL OR app_id = ANY($1) \
             ORDER BY updated_at DESC",
        )
        .bind(app_ids)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ScaleRequestRow::into_domain).collect()
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
        let row: Option<(serde_json::Value, serde_json::Value)> = sqlx::query_as(
            "SELECT processes, tags FROM formations WHERE app_id = $1 AND release_id = $2",
        )
        .bind(app_id)
        .bind(release_id)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some((processes, tags)) => {
                let processes = serde_json::from_value(processes).unwrap_or_default();
                let tags = serde_json::from_value(tags).unwrap_or_default();
                Ok((processes, tags))
            }
            None => Ok((HashMap::new(), HashMap::new())),
        }
    }

    async fn latest_scale_request_for_release(
        &self,
        app_id: &str,
        release_id: &str,
    ) -> Result<Option<ScaleRequest>, ControllerError> {
        let row: Option<ScaleRequestRow> = sqlx::query_as(
            "SELECT id, app_id, release_id, state, new_processes, new_tags, updated_at \
             FROM scale_requests WHERE app_id = $1 AND release_id = $2 \
             ORDER BY updated_at DESC LIMIT 1",
        )
        .bind(app_id)
        .bind(release_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(ScaleRequestRow::into_domain).transpose()
    }

    async fn list_deployments(
        &self,
        app_ids: &[String],
        before_id: Option<i64>,
        limit: i64,
    ) -> Result<Vec<Row<ExpandedDeployment>>, ControllerError> {
        let rows: Vec<DeploymentRow> = sqlx::query_as(
            "SELECT id, app_id, old_release_id, new_release_id, release_type, status, \
             job_state, job_type, error, row_id FROM deployments \
             WHERE (array_length($1::text[], 1) IS NULL OR app_id = ANY($1)) \
             AND ($2::bigint IS NULL OR row_id > $2) \
             ORDER BY row_id ASC LIMIT $3",
        )
        .bind(app_ids)
        .bind(before_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(DeploymentRow::into_row).collect()
    }

    async fn create_deployment(
        &self,
        app_id: &str,
        old_release_id: Option<String>,
        new_release_id: String,
        release_type: ReleaseType,
    ) -> Result<ExpandedDeployment, ControllerError> {
        let id = uuid::Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO deployments (id, app_id, old_release_id, new_release_id, \
             release_type, status, job_state, job_type) \
             VALUES ($1, $2, $3, $4, $5, 'pending', '', '')",
        )
        .bind(&id)
        .bind(app_id)
        .bind(&old_release_id)
        .bind(&new_release_id)
        .bind(release_type_str(release_type))
        .execute(&self.pool)
        .await?;
        Ok(ExpandedDeployment {
            id,
            app_id: app_id.to_string(),
            old_release_id,
            new_release_id,
            release_type,
            status: DeploymentStatus::Pending,
            job_state: String::new(),
            job_type: String::new(),
            error: None,
        })
    }

    async fn get_deployment(
        &self,
        app_id: &str,
        deployment_id: &str,
    ) -> Result<ExpandedDeployment, ControllerError> {
        let row: DeploymentRow = sqlx::query_as(
            "SELECT id, app_id, old_release_id, new_release_id, release_type, status, \
             job_state, job_type, error, row_id FROM deployments \
             WHERE app_id = $1 AND id = $2",
        )
        .bind(app_id)
        .bind(deployment_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into_row()?.item)
    }

    async fn update_scale_request_state(
        &self,
        app_id: &str,
        release_id: &str,
        scale_id: &str,
        state: ScaleState,
    ) -> Result<ScaleRequest, ControllerError> {
        let row: ScaleRequestRow = sqlx::query_as(
            "UPDATE scale_requests SET state = $4, updated_at = now() \
             WHERE app_id = $1 AND release_id = $2 AND id = $3 \
             RETURNING id, app_id, release_id, state, new_processes, new_tags, updated_at",
        )
        .bind(app_id)
        .bind(release_id)
        .bind(scale_id)
        .bind(scale_state_str(state))
        .fetch_one(&self.pool)
        .await?;
        row.into_domain()
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
        let status_str = match status {
            DeploymentStatus::Pending => "pending",
            DeploymentStatus::Running => "running",
            DeploymentStatus::Complete => "complete",
            DeploymentStatus::Failed => "failed",
        };
        let row: DeploymentRow = sqlx::query_as(
            "UPDATE deployments SET status = $3, job_type = $4, job_state = $5, error = $6 \
             WHERE app_id = $1 AND id = $2 \
             RETURNING id, app_id, old_release_id, new_release_id, release_type, status, \
             job_state, job_type, error, row_id",
        )
        .bind(app_id)
        .bind(deployment_id)
        .bind(status_str)
        .bind(&job_type)
        .bind(&job_state)
        .bind(&error)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into_row()?.item)
    }
}

/// `LISTEN controller_events` backed [`ChangeFeed`].
pub struct PgChangeFeed {
    pool: PgPool,
}

#[async_trait]
impl ChangeFeed for PgChangeFeed {
    async fn connect(&self) -> Result<Box<dyn ChangeFeedConnection>, ControllerError> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(|e| ControllerError::internal(format!("LISTEN connect failed: {e}")))?;
        listener
            .listen(NOTIFY_CHANNEL)
            .await
            .map_err(|e| ControllerError::internal(format!("LISTEN failed: {e}")))?;
        Ok(Box::new(PgChangeFeedConnection { listener }))
    }
}

struct PgChangeFeedConnection {
    listener: PgListener,
}

#[derive(serde::Deserialize)]
struct NotifyPayload {
    id: i64,
    app_id: String,
    object_type: String,
    object_id: String,
    operation: String,
    payload: serde_json::Value,
    created_at: DateTime<Utc>,
}

#[async_trait]
impl ChangeFeedConnection for PgChangeFeedConnection {
    async fn recv(&mut self) -> Result<Option<Event>, ControllerError> {
        loop {
            let notification = self.listener.recv().await.map_err(|e| {
                ControllerError::internal(format!("event listener connection failed: {e}"))
            })?;
            let payload: NotifyPayload = match serde_json::from_str(notification.payload()) {
                Ok(p) => p,
                Err(e) => {
                    tracing::debug!(error = %e, "skipping malformed NOTIFY payload");
                    continue;
                }
            };
            let object_type = match payload.object_type.as_str() {
                "app" => ObjectType::App,
                "release" => ObjectType::Release,
                "scale_request" => ObjectType::ScaleRequest,
                "deployment" => ObjectType::Deployment,
                "deployment_event" => ObjectType::DeploymentEvent,
                other => {
                    tracing::debug!(object_type = other, "skipping unknown object_type");
                    continue;
                }
            };
            let operation = match payload.operation.as_str() {
                "create" => Operation::Create,
                "update" => Operation::Update,
                "delete" => Operation::Delete,
                other => {
                    tracing::debug!(operation = other, "skipping unknown operation");
                    continue;
                }
            };
            return Ok(Some(Event {
                id: payload.id,
                app_id: payload.app_id,
                object_type,
                object_id: payload.object_id,
                operation,
                payload: payload.payload,
                created_at: payload.created_at,
            }));
        }
    }
}
