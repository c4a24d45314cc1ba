//! `StreamReleases` / `CreateRelease` (spec.md §4.5, §6).
//!
//! Releases are one of the two streams that "maintain an in-memory list"
//! (spec.md §4.5 "Merging snapshot and stream without duplicates"): every
//! accepted event prepends a deduped-by-name item to a running list and
//! the *whole* list is re-emitted, rather than a single delta.

use std::collections::HashSet;
use std::sync::Arc;

use async_stream::try_stream;
use tokio::sync::Mutex;
use tokio_stream::StreamExt;
use tonic::Status;

use super::convert::release_to_pb;
use super::{max_row_id, paginate, ControllerService, ResponseStream};
use crate::domain::{ObjectType, Release};
use crate::error::ControllerError;
use crate::filters::{
    app_ids_from_name_filters, label_filters_from_pb, matches_label_filters, matches_type_filter,
    object_ids_from_name_filters, LabelFilter,
};
use crate::page_token::PageToken;
use crate::pb;

fn accepts(
    release: &Release,
    id_filters: &HashSet<String>,
    label_filters: &[LabelFilter],
    type_filters: &[i32],
) -> bool {
    (id_filters.is_empty() || id_filters.contains(&release.id))
        && matches_label_filters(label_filters, &release.labels)
        && matches_type_filter(type_filters, release.release_type)
}

/// Prepend `item`, removing any earlier entry with the same `name`
/// (spec.md §8 property 5).
fn prepend_dedup(list: &mut Vec<pb::Release>, item: pb::Release) {
    list.retain(|r| r.name != item.name);
    list.insert(0, item);
}

impl ControllerService {
    pub(super) async fn stream_releases_impl(
        &self,
        req: pb::StreamReleasesRequest,
    ) -> Result<ResponseStream<pb::StreamReleasesResponse>, ControllerError> {
        let token = PageToken::parse(&req.page_token)?;
        let size = token.effective_size(req.page_size);

        let app_ids = app_ids_from_name_filters(&req.name_filters);
        let fetched = self
            .store
            .list_releases(&app_ids, token.before_id, (size as i64) + 1)
            .await?;
        let (page, next_before_id) = paginate(fetched, size);
        let curr_id = max_row_id(&page);

        let id_filters: HashSet<String> =
            object_ids_from_name_filters(&req.name_filters, "releases").into_iter().collect();
        let label_filters = label_filters_from_pb(&req.label_filters);
        let type_filters = req.type_filters.clone();

        let mut list: Vec<pb::Release> = page
            .iter()
            .map(|r| &r.item)
            .filter(|r| accepts(r, &id_filters, &label_filters, &type_filters))
            .map(release_to_pb)
            .collect();

        let next_page_token = PageToken {
            before_id: next_before_id,
            size,
        }
        .format();

        let snapshot = pb::StreamReleasesResponse {
            releases: list.clone(),
            next_page_token,
            page_complete: true,
        };

        let unary = !req.stream_creates && !req.stream_updates;
        let listener = self.listener.clone();
        let list = Arc::new(Mutex::new(std::mem::take(&mut list)));

        let stream = try_stream! {
            yield snapshot;
            if unary {
                return;
            }

            let manager = crate::events::subscription::SubscriptionManager::new(listener);
            let mut sub = manager
                .subscribe_events(&app_ids, HashSet::from([ObjectType::Release]), None)
                .await?;

            let mut curr_id = curr_id;
            while let Some(event) = sub.recv().await {
                if event.id <= curr_id {
                    continue;
                }
                curr_id = curr_id.max(event.id);
                if event.object_type != ObjectType::Release {
                    continue;
                }
                let release: Release = match serde_json::from_value(event.payload.clone()) {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::debug!(error = %e, "skipping malformed release event payload");
                        continue;
                    }
                };
                if !accepts(&release, &id_filters, &label_filters, &type_filters) {
                    continue;
                }
                let snapshot = {
                    let mut guard = list.lock().await;
                    prepend_dedup(&mut guard, release_to_pb(&release));
                    guard.clone()
                };
                yield pb::StreamReleasesResponse {
                    releases: snapshot,
                    next_page_token: String::new(),
                    page_complete: false,
                };
            }
            if let Some(err) = sub.error() {
                Err(err)?;
            }
        };

        let stream = stream.map(|item: Result<pb::StreamReleasesResponse, ControllerError>| {
            item.map_err(Status::from)
        });
        Ok(Box::pin(stream))
    }

    pub(super) async fn create_release_impl(
        &self,
        req: pb::CreateReleaseRequest,
    ) -> Result<pb::Release, ControllerError> {
        let app_id = crate::names::require_segment(&req.parent, "apps")?;
        let pb_release = req
            .release
            .ok_or_else(|| ControllerError::invalid_argument("missing release"))?;
        let release_type = super::convert::release_type_from_pb(pb_release.r#type)
            .ok_or_else(|| ControllerError::invalid_argument("unknown release type"))?;
        let body: serde_json::Value = if pb_release.body.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&pb_release.body)
                .map_err(|e| ControllerError::invalid_argument(format!("malformed release body: {e}")))?
        };
        let release = Release {
            id: String::new(),
            app_id: app_id.clone(),
            labels: pb_release.labels,
            release_type,
            body,
        };
        let created = self.store.create_release(&app_id, release).await?;
        Ok(release_to_pb(&created))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn release(name: &str) -> pb::Release {
        pb::Release {
            name: name.to_string(),
            labels: Default::default(),
            r#type: pb::ReleaseType::Code as i32,
            body: vec![],
        }
    }

    #[test]
    fn prepend_dedup_keeps_single_copy_at_head() {
        let mut list = vec![release("apps/a1/releases/r1"), release("apps/a1/releases/r2")];
        prepend_dedup(&mut list, release("apps/a1/releases/r1"));
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].name, "apps/a1/releases/r1");
        assert_eq!(list[1].name, "apps/a1/releases/r2");
    }
}
