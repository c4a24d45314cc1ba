//! `StreamApps` / `UpdateApp` (spec.md §4.5, §6).

use std::collections::HashSet;

use async_stream::try_stream;
use tokio_stream::StreamExt;
use tonic::Status;

use super::convert::app_to_pb;
use super::{max_row_id, paginate, ControllerService, ResponseStream};
use crate::domain::{App, DeployStrategy, ObjectType};
use crate::error::ControllerError;
use crate::filters::{label_filters_from_pb, matches_label_filters, object_ids_from_name_filters, LabelFilter};
use crate::page_token::PageToken;
use crate::pb;

fn accepts(app: &App, id_filters: &HashSet<String>, label_filters: &[LabelFilter]) -> bool {
    (id_filters.is_empty() || id_filters.contains(&app.id))
        && matches_label_filters(label_filters, &app.labels)
}

impl ControllerService {
    pub(super) async fn stream_apps_impl(
        &self,
        req: pb::StreamAppsRequest,
    ) -> Result<ResponseStream<pb::StreamAppsResponse>, ControllerError> {
        let token = PageToken::parse(&req.page_token)?;
        let size = token.effective_size(req.page_size);

        let fetched = self.store.list_apps(token.before_id, (size as i64) + 1).await?;
        let (page, next_before_id) = paginate(fetched, size);
        let curr_id = max_row_id(&page);

        let id_filters: HashSet<String> =
            object_ids_from_name_filters(&req.name_filters, "apps").into_iter().collect();
        let label_filters = label_filters_from_pb(&req.label_filters);

        let apps: Vec<pb::App> = page
            .iter()
            .map(|r| &r.item)
            .filter(|app| accepts(app, &id_filters, &label_filters))
            .map(app_to_pb)
            .collect();

        let next_page_token = PageToken {
            before_id: next_before_id,
            size,
        }
        .format();

        let snapshot = pb::StreamAppsResponse {
            apps,
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
            let app_ids: Vec<String> = id_filters.iter().cloned().collect();
            let mut sub = manager
                .subscribe_events(&app_ids, HashSet::from([ObjectType::App]), None)
                .await?;

            let mut curr_id = curr_id;
            while let Some(event) = sub.recv().await {
                if event.id <= curr_id {
                    continue;
                }
                curr_id = curr_id.max(event.id);
                if event.object_type != ObjectType::App {
                    continue;
                }
                let app: App = match serde_json::from_value(event.payload.clone()) {
                    Ok(a) => a,
                    Err(e) => {
                        tracing::debug!(error = %e, "skipping malformed app event payload");
                        continue;
                    }
                };
                if !accepts(&app, &id_filters, &label_filters) {
                    continue;
                }
                yield pb::StreamAppsResponse {
                    apps: vec![app_to_pb(&app)],
                    next_page_token: String::new(),
                    page_complete: false,
                };
            }
            if let Some(err) = sub.error() {
                Err(err)?;
            }
        };

        let stream = stream.map(|item: Result<pb::StreamAppsResponse, ControllerError>| {
            item.map_err(Status::from)
        });
        Ok(Box::pin(stream))
    }

    pub(super) async fn update_app_impl(
        &self,
        req: pb::UpdateAppRequest,
    ) -> Result<pb::App, ControllerError> {
        let pb_app = req
            .app
            .ok_or_else(|| ControllerError::invalid_argument("missing app"))?;
        let app_id = crate::names::require_segment(&pb_app.name, "apps")?;
        let mut app = self.store.get_app(&app_id).await?;

        let mask = if req.update_mask.is_empty() {
            vec![
                "display_name".to_string(),
                "labels".to_string(),
                "deploy_strategy".to_string(),
                "deploy_timeout".to_string(),
            ]
        } else {
            req.update_mask
        };

        for field in &mask {
            match field.as_str() {
                "display_name" => app.display_name = pb_app.display_name.clone(),
                "labels" => app.labels = pb_app.labels.clone(),
                "deploy_strategy" => {
                    app.deploy_strategy = match pb_app.deploy_strategy() {
                        pb::DeployStrategy::OneByOne => DeployStrategy::OneByOne,
                        _ => DeployStrategy::AllAtOnce,
                    }
                }
                "deploy_timeout" => app.deploy_timeout = pb_app.deploy_timeout,
                other => tracing::debug!(field = other, "ignoring unknown update_mask field"),
            }
        }

        let updated = self.store.update_app(app).await?;
        Ok(app_to_pb(&updated))
    }
}
