//! `StreamDeployments` / `CreateDeployment` (spec.md §4.5, §4.8).

use std::collections::HashSet;

use async_stream::try_stream;
use tokio_stream::StreamExt;
use tonic::Status;

use super::convert::deployment_to_pb;
use super::{max_row_id, paginate, ControllerService, ResponseStream};
use crate::domain::{DeploymentStatus, ExpandedDeployment, ObjectType};
use crate::error::ControllerError;
use crate::filters::{
    app_ids_from_name_filters, matches_type_filter, object_ids_from_name_filters,
};
use crate::page_token::PageToken;
use crate::pb;

fn accepts(deployment: &ExpandedDeployment, id_filters: &HashSet<String>, type_filters: &[i32]) -> bool {
    (id_filters.is_empty() || id_filters.contains(&deployment.id))
        && matches_type_filter(type_filters, deployment.release_type)
}

impl ControllerService {
    pub(super) async fn stream_deployments_impl(
        &self,
        req: pb::StreamDeploymentsRequest,
    ) -> Result<ResponseStream<pb::StreamDeploymentsResponse>, ControllerError> {
        let token = PageToken::parse(&req.page_token)?;
        let size = token.effective_size(req.page_size);

        let app_ids = app_ids_from_name_filters(&req.name_filters);
        let fetched = self
            .store
            .list_deployments(&app_ids, token.before_id, (size as i64) + 1)
            .await?;
        let (page, next_before_id) = paginate(fetched, size);
        let curr_id = max_row_id(&page);

        let id_filters: HashSet<String> =
            object_ids_from_name_filters(&req.name_filters, "deployments").into_iter().collect();
        let type_filters = req.type_filters.clone();

        let deployments: Vec<pb::ExpandedDeployment> = page
            .iter()
            .map(|r| &r.item)
            .filter(|d| accepts(d, &id_filters, &type_filters))
            .map(deployment_to_pb)
            .collect();

        let next_page_token = PageToken {
            before_id: next_before_id,
            size,
        }
        .format();

        let snapshot = pb::StreamDeploymentsResponse {
            deployments,
            next_page_token,
            page_complete: true,
        };

        let unary = !req.stream_creates && !req.stream_updates;
        let listener = self.listener.clone();

        let stream = try_stream! {
            yield snapshot;
            if unary {
                return;
            }

            let manager = crate::events::subscription::SubscriptionManager::new(listener);
            let mut sub = manager
                .subscribe_events(&app_ids, HashSet::from([ObjectType::Deployment]), None)
                .await?;

            let mut curr_id = curr_id;
            while let Some(event) = sub.recv().await {
                if event.id <= curr_id {
                    continue;
                }
                curr_id = curr_id.max(event.id);
                if event.object_type != ObjectType::Deployment {
                    continue;
                }
                let deployment: ExpandedDeployment = match serde_json::from_value(event.payload.clone()) {
                    Ok(d) => d,
                    Err(e) => {
                        tracing::debug!(error = %e, "skipping malformed deployment event payload");
                        continue;
                    }
                };
                if !accepts(&deployment, &id_filters, &type_filters) {
                    continue;
                }
                yield pb::StreamDeploymentsResponse {
                    deployments: vec![deployment_to_pb(&deployment)],
                    next_page_token: String::new(),
                    page_complete: false,
                };
            }
            if let Some(err) = sub.error() {
                Err(err)?;
            }
        };

        let stream = stream.map(|item: Result<pb::StreamDeploymentsResponse, ControllerError>| {
            item.map_err(Status::from)
        });
        Ok(Box::pin(stream))
    }

    /// Asynchronous streaming RPC (spec.md §4.8): inserts a deployment,
    /// subscribes to its own events, and relays every job-state delta.
    /// On transition to `complete` with an embedded scale request, invokes
    /// `CreateScale` internally against the new release before closing.
    /// On transition to `failed`, closes the stream with the event's error.
    pub(super) async fn create_deployment_impl(
        &self,
        req: pb::CreateDeploymentRequest,
    ) -> Result<ResponseStream<pb::DeploymentEvent>, ControllerError> {
        let app_id = crate::names::require_segment(&req.parent, "apps")?;
        let new_release_id = crate::names::require_segment(&req.release, "releases")?;
        let new_release = self.store.get_release(&app_id, &new_release_id).await?;
        let old_release_id = self.store.latest_release_id(&app_id).await?;

        let manager = self.subscriptions();
        let mut sub = manager
            .subscribe_events(&[app_id.clone()], HashSet::from([ObjectType::Deployment]), None)
            .await?;

        let deployment = self
            .store
            .create_deployment(
                &app_id,
                old_release_id,
                new_release_id.clone(),
                new_release.release_type,
            )
            .await?;

        let service = self.clone();
        let deployment_id = deployment.id.clone();
        let scale_request = req.scale_request.clone();

        let stream = try_stream! {
            loop {
                let event = match sub.recv().await {
                    Some(event) => event,
                    None => {
                        if let Some(err) = sub.error() {
                            Err(err)?;
                        }
                        break;
                    }
                };
                if event.object_id != deployment_id {
                    continue;
                }
                let current: ExpandedDeployment = match serde_json::from_value(event.payload.clone()) {
                    Ok(d) => d,
                    Err(e) => {
                        tracing::debug!(error = %e, "skipping malformed deployment event payload");
                        continue;
                    }
                };

                yield pb::DeploymentEvent {
                    deployment: Some(deployment_to_pb(&current)),
                    job_type: current.job_type.clone(),
                    job_state: current.job_state.clone(),
                    error: current.error.clone().unwrap_or_default(),
                    created_at_unix_ms: event.created_at.timestamp_millis(),
                };

                match current.status {
                    DeploymentStatus::Failed => {
                        let message = current.error.clone().unwrap_or_else(|| "deployment failed".to_string());
                        Err(ControllerError::failed_precondition(message))?;
                    }
                    DeploymentStatus::Complete => {
                        if let Some(scale_req) = scale_request.clone() {
                            let create_scale_req = pb::CreateScaleRequest {
                                parent: crate::names::release_name(&app_id, &new_release_id),
                                processes: scale_req.processes,
                                tags: scale_req.tags,
                            };
                            service.create_scale_impl(create_scale_req).await?;
                        }
                        break;
                    }
                    _ => {}
                }
            }
        };

        let stream = stream.map(|item: Result<pb::DeploymentEvent, ControllerError>| {
            item.map_err(Status::from)
        });
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ReleaseType;

    fn deployment(id: &str, release_type: ReleaseType) -> ExpandedDeployment {
        ExpandedDeployment {
            id: id.to_string(),
            app_id: "app1".to_string(),
            old_release_id: None,
            new_release_id: "r1".to_string(),
            release_type,
            status: DeploymentStatus::Pending,
            job_state: String::new(),
            job_type: String::new(),
            error: None,
        }
    }

    #[test]
    fn accepts_filters_by_id_and_type() {
        let d = deployment("d1", ReleaseType::Code);
        let ids = HashSet::from(["d1".to_string()]);
        assert!(accepts(&d, &ids, &[]));
        assert!(!accepts(&d, &HashSet::from(["d2".to_string()]), &[]));
        assert!(!accepts(&d, &HashSet::new(), &[pb::ReleaseType::Config as i32]));
        assert!(accepts(&d, &HashSet::new(), &[pb::ReleaseType::Code as i32]));
    }
}
