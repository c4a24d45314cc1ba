//! `StreamFormations` (spec.md §4.6).
//!
//! Unlike the list-oriented streams, this handler keeps a map
//! `app_id -> Formation` and re-fetches formation state from the store on
//! every relevant event rather than updating it from the event payload
//! (spec.md §9 design notes: "defers the truth to the store").

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_stream::try_stream;
use tokio_stream::StreamExt;
use tonic::Status;

use super::convert::formation_to_pb;
use super::{ControllerService, ResponseStream};
use crate::domain::{Formation, ObjectType, ScaleState};
use crate::error::ControllerError;
use crate::filters::app_ids_from_name_filters;
use crate::names;
use crate::pb;
use crate::store::Store;

async fn refresh_formation(
    store: &Arc<dyn Store>,
    app_id: &str,
    release_id: &str,
) -> Result<Formation, ControllerError> {
    let (processes, tags) = store.get_formation_state(app_id, release_id).await?;
    let latest = store.latest_scale_request_for_release(app_id, release_id).await?;
    let (state, scale_request) = match &latest {
        Some(r) if r.state == ScaleState::Pending => (
            ScaleState::Pending,
            Some(names::scale_name(app_id, release_id, &r.id)),
        ),
        Some(r) if r.state == ScaleState::Cancelled => (
            ScaleState::Cancelled,
            Some(names::scale_name(app_id, release_id, &r.id)),
        ),
        Some(r) => (
            ScaleState::Complete,
            Some(names::scale_name(app_id, release_id, &r.id)),
        ),
        None => (ScaleState::Complete, None),
    };
    Ok(Formation {
        app_id: app_id.to_string(),
        release_id: release_id.to_string(),
        processes,
        tags,
        state,
        scale_request,
    })
}

impl ControllerService {
    pub(super) async fn stream_formations_impl(
        &self,
        req: pb::StreamFormationsRequest,
    ) -> Result<ResponseStream<pb::StreamFormationsResponse>, ControllerError> {
        let app_ids = app_ids_from_name_filters(&req.name_filters);
        let store = self.store.clone();

        // Open Question resolution (spec.md §9): seed `release_ids` from
        // the store's current latest-release-per-app rather than
        // refreshing with empty app/release ids before any event arrives.
        let mut release_ids: HashMap<String, String> = HashMap::new();
        let mut formations: HashMap<String, Formation> = HashMap::new();
        for app_id in &app_ids {
            if let Some(release_id) = store.latest_release_id(app_id).await? {
                let formation = refresh_formation(&store, app_id, &release_id).await?;
                release_ids.insert(app_id.clone(), release_id);
                formations.insert(app_id.clone(), formation);
            }
        }

        let initial = pb::StreamFormationsResponse {
            formations: formations.values().map(formation_to_pb).collect(),
        };

        let listener = self.listener.clone();

        let stream = try_stream! {
            if !initial.formations.is_empty() {
                yield initial;
            }

            let manager = crate::events::subscription::SubscriptionManager::new(listener);
            let mut sub = manager
                .subscribe_events(
                    &app_ids,
                    HashSet::from([ObjectType::ScaleRequest, ObjectType::Release]),
                    None,
                )
                .await?;

            let mut release_ids = release_ids;
            let mut formations = formations;

            while let Some(event) = sub.recv().await {
                let app_id = event.app_id.clone();
                match event.object_type {
                    ObjectType::Release => {
                        release_ids.insert(app_id.clone(), event.object_id.clone());
                    }
                    ObjectType::ScaleRequest => {}
                    _ => continue,
                }
                let Some(release_id) = release_ids.get(&app_id).cloned() else {
                    continue;
                };
                let formation = match refresh_formation(&store, &app_id, &release_id).await {
                    Ok(f) => f,
                    Err(e) => {
                        tracing::debug!(error = %e, "skipping formation refresh, store error");
                        continue;
                    }
                };
                formations.insert(app_id, formation);
                yield pb::StreamFormationsResponse {
                    formations: formations.values().map(formation_to_pb).collect(),
                };
            }
            if let Some(err) = sub.error() {
                Err(err)?;
            }
        };

        let stream = stream.map(|item: Result<pb::StreamFormationsResponse, ControllerError>| {
            item.map_err(Status::from)
        });
        Ok(Box::pin(stream))
    }
}
