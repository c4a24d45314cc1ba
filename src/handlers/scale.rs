//! `StreamScales` / `CreateScale` (spec.md §4.5 "Coalescing response
//! rate", §4.7).

use std::collections::HashSet;
use std::time::Duration;

use async_stream::try_stream;
use tokio_stream::StreamExt;
use tonic::Status;

use super::convert::scale_request_to_pb;
use super::{ControllerService, ResponseStream};
use crate::domain::{ObjectType, ScaleRequest, ScaleState};
use crate::error::ControllerError;
use crate::filters::{app_ids_from_name_filters, object_ids_from_name_filters};
use crate::pb;

/// Debounce window for coalesced `StreamScales` responses (spec.md §4.5).
const SCALE_DEBOUNCE: Duration = Duration::from_millis(10);

fn prepend_dedup(list: &mut Vec<pb::ScaleRequest>, item: pb::ScaleRequest) {
    list.retain(|r| r.name != item.name);
    list.insert(0, item);
}

impl ControllerService {
    /// `StreamScales` has no unary path (spec.md §9 Open Questions: "treat
    /// it as always-streaming"); Phase S is folded into the live loop so
    /// the very first coalesced response already carries the snapshot.
    pub(super) async fn stream_scales_impl(
        &self,
        req: pb::StreamScalesRequest,
    ) -> Result<ResponseStream<pb::StreamScalesResponse>, ControllerError> {
        let app_ids = app_ids_from_name_filters(&req.name_filters);
        let release_id_filters: HashSet<String> =
            object_ids_from_name_filters(&req.name_filters, "releases").into_iter().collect();

        let initial = self.store.list_scale_requests(&app_ids).await?;
        let curr_id = 0i64; // scale_requests carry no row_id cursor; rely on event ids only.
        let mut list: Vec<pb::ScaleRequest> = initial
            .iter()
            .filter(|r| release_id_filters.is_empty() || release_id_filters.contains(&r.release_id))
            .map(scale_request_to_pb)
            .collect();

        let listener = self.listener.clone();

        let stream = try_stream! {
            if !list.is_empty() {
                yield pb::StreamScalesResponse { scale_requests: list.clone() };
            }

            let manager = crate::events::subscription::SubscriptionManager::new(listener);
            let mut sub = manager
                .subscribe_events(&app_ids, HashSet::from([ObjectType::ScaleRequest]), None)
                .await?;

            let mut curr_id = curr_id;
            let mut pending = false;
            let deadline = tokio::time::sleep(SCALE_DEBOUNCE);
            tokio::pin!(deadline);

            loop {
                tokio::select! {
                    maybe = sub.recv() => {
                        match maybe {
                            Some(event) => {
                                if event.id <= curr_id {
                                    continue;
                                }
                                curr_id = curr_id.max(event.id);
                                if event.object_type != ObjectType::ScaleRequest {
                                    continue;
                                }
                                let req: ScaleRequest = match serde_json::from_value(event.payload.clone()) {
                                    Ok(r) => r,
                                    Err(e) => {
                                        tracing::debug!(error = %e, "skipping malformed scale event payload");
                                        continue;
                                    }
                                };
                                if !(release_id_filters.is_empty() || release_id_filters.contains(&req.release_id)) {
                                    continue;
                                }
                                prepend_dedup(&mut list, scale_request_to_pb(&req));
                                pending = true;
                                deadline.as_mut().reset(tokio::time::Instant::now() + SCALE_DEBOUNCE);
                            }
                            None => break,
                        }
                    }
                    _ = &mut deadline, if pending => {
                        pending = false;
                        yield pb::StreamScalesResponse { scale_requests: list.clone() };
                        deadline.as_mut().reset(tokio::time::Instant::now() + SCALE_DEBOUNCE);
                    }
                }
            }

            if pending {
                yield pb::StreamScalesResponse { scale_requests: list.clone() };
            }
            if let Some(err) = sub.error() {
                Err(err)?;
            }
        };

        let stream = stream.map(|item: Result<pb::StreamScalesResponse, ControllerError>| {
            item.map_err(Status::from)
        });
        Ok(Box::pin(stream))
    }

    /// Synchronous scale RPC (spec.md §4.7): inserts a pending scale
    /// request, then blocks on its own subscription until the request
    /// reaches a terminal state or `DefaultScaleTimeout` elapses.
    pub(super) async fn create_scale_impl(
        &self,
        req: pb::CreateScaleRequest,
    ) -> Result<pb::ScaleRequest, ControllerError> {
        let app_id = crate::names::require_segment(&req.parent, "apps")?;
        let release_id = crate::names::require_segment(&req.parent, "releases")?;

        let new_processes = req.processes.map(|p| p.counts);
        let new_tags = req
            .tags
            .map(|t| t.tags.into_iter().map(|(k, v)| (k, v.labels)).collect());

        let manager = self.subscriptions();
        let mut sub = manager
            .subscribe_events(
                &[app_id.clone()],
                HashSet::from([ObjectType::ScaleRequest]),
                None,
            )
            .await?;

        let inserted = self
            .store
            .create_scale_request(ScaleRequest {
                id: String::new(),
                app_id: app_id.clone(),
                release_id: release_id.clone(),
                state: ScaleState::Pending,
                new_processes,
                new_tags,
                updated_at: chrono::Utc::now(),
            })
            .await?;

        let result = tokio::time::timeout(self.config.scale_timeout, async {
            loop {
                match sub.recv().await {
                    Some(event) if event.object_id == inserted.id => {
                        let updated: ScaleRequest = serde_json::from_value(event.payload.clone())
                            .map_err(|e| {
                                ControllerError::internal(format!(
                                    "malformed scale request event payload: {e}"
                                ))
                            })?;
                        if updated.state.is_terminal() {
                            return Ok(updated);
                        }
                    }
                    Some(_) => continue,
                    None => {
                        return Err(sub
                            .error()
                            .unwrap_or_else(|| ControllerError::internal("subscription closed")));
                    }
                }
            }
        })
        .await;

        let updated = match result {
            Ok(inner) => inner?,
            Err(_) => {
                return Err(ControllerError::DeadlineExceeded(format!(
                    "scale request did not complete within {}s",
                    self.config.scale_timeout.as_secs()
                )))
            }
        };

        if updated.state == ScaleState::Cancelled {
            return Err(ControllerError::failed_precondition("scale request cancelled"));
        }

        Ok(scale_request_to_pb(&updated))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scale(name: &str) -> pb::ScaleRequest {
        pb::ScaleRequest {
            name: name.to_string(),
            app: String::new(),
            release: String::new(),
            state: pb::ScaleRequestState::ScalePending as i32,
            new_processes: None,
            new_tags: None,
        }
    }

    #[test]
    fn prepend_dedup_keeps_single_copy_at_head() {
        let mut list = vec![scale("apps/a1/releases/r1/scale/s1")];
        prepend_dedup(&mut list, scale("apps/a1/releases/r1/scale/s1"));
        assert_eq!(list.len(), 1);
    }
}
