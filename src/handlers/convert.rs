//! Domain-to-wire conversions (spec.md §4.5 Phase S step 4: "Convert
//! domain rows to protocol messages").
//!
//! Kept separate from `domain` so a change to the `.proto` never forces a
//! change to persistence types, and vice versa (see `SPEC_FULL.md` §3).

use std::collections::HashMap;

use crate::domain::{
    App, DeployStrategy, DeploymentStatus, ExpandedDeployment, Formation, Release, ReleaseType,
    ScaleRequest, ScaleState,
};
use crate::names;
use crate::pb;

pub fn deploy_strategy_to_pb(s: DeployStrategy) -> pb::DeployStrategy {
    match s {
        DeployStrategy::AllAtOnce => pb::DeployStrategy::AllAtOnce,
        DeployStrategy::OneByOne => pb::DeployStrategy::OneByOne,
    }
}

pub fn release_type_to_pb(t: ReleaseType) -> pb::ReleaseType {
    match t {
        ReleaseType::Code => pb::ReleaseType::Code,
        ReleaseType::Config => pb::ReleaseType::Config,
    }
}

pub fn release_type_from_pb(t: i32) -> Option<ReleaseType> {
    match pb::ReleaseType::try_from(t).ok()? {
        pb::ReleaseType::Code => Some(ReleaseType::Code),
        pb::ReleaseType::Config => Some(ReleaseType::Config),
        pb::ReleaseType::Unspecified => None,
    }
}

pub fn scale_state_to_pb(s: ScaleState) -> pb::ScaleRequestState {
    match s {
        ScaleState::Pending => pb::ScaleRequestState::ScalePending,
        ScaleState::Cancelled => pb::ScaleRequestState::ScaleCancelled,
        ScaleState::Complete => pb::ScaleRequestState::ScaleComplete,
    }
}

pub fn deployment_status_to_pb(s: DeploymentStatus) -> pb::DeploymentStatus {
    match s {
        DeploymentStatus::Pending => pb::DeploymentStatus::DeploymentPending,
        DeploymentStatus::Running => pb::DeploymentStatus::DeploymentRunning,
        DeploymentStatus::Complete => pb::DeploymentStatus::DeploymentComplete,
        DeploymentStatus::Failed => pb::DeploymentStatus::DeploymentFailed,
    }
}

pub fn app_to_pb(app: &App) -> pb::App {
    pb::App {
        name: names::app_name(&app.id),
        display_name: app.display_name.clone(),
        labels: app.labels.clone(),
        deploy_strategy: deploy_strategy_to_pb(app.deploy_strategy) as i32,
        deploy_timeout: app.deploy_timeout,
    }
}

pub fn release_to_pb(release: &Release) -> pb::Release {
    pb::Release {
        name: names::release_name(&release.app_id, &release.id),
        labels: release.labels.clone(),
        r#type: release_type_to_pb(release.release_type) as i32,
        body: serde_json::to_vec(&release.body).unwrap_or_default(),
    }
}

fn tags_to_pb(
    tags: &HashMap<String, HashMap<String, String>>,
) -> HashMap<String, pb::LabelMap> {
    tags.iter()
        .map(|(k, v)| (k.clone(), pb::LabelMap { labels: v.clone() }))
        .collect()
}

pub fn scale_request_to_pb(req: &ScaleRequest) -> pb::ScaleRequest {
    pb::ScaleRequest {
        name: names::scale_name(&req.app_id, &req.release_id, &req.id),
        app: names::app_name(&req.app_id),
        release: names::release_name(&req.app_id, &req.release_id),
        state: scale_state_to_pb(req.state) as i32,
        new_processes: req
            .new_processes
            .as_ref()
            .map(|m| pb::ProcessCounts { counts: m.clone() }),
        new_tags: req
            .new_tags
            .as_ref()
            .map(|m| pb::ProcessTags { tags: tags_to_pb(m) }),
    }
}

pub fn formation_to_pb(f: &Formation) -> pb::Formation {
    pb::Formation {
        app: names::app_name(&f.app_id),
        release: names::release_name(&f.app_id, &f.release_id),
        processes: Some(pb::ProcessCounts {
            counts: f.processes.clone(),
        }),
        tags: Some(pb::ProcessTags {
            tags: tags_to_pb(&f.tags),
        }),
        state: scale_state_to_pb(f.state) as i32,
        scale_request: f.scale_request.clone().unwrap_or_default(),
    }
}

pub fn deployment_to_pb(d: &ExpandedDeployment) -> pb::ExpandedDeployment {
    pb::ExpandedDeployment {
        name: names::deployment_name(&d.app_id, &d.id),
        app: names::app_name(&d.app_id),
        old_release: d
            .old_release_id
            .as_ref()
            .map(|r| names::release_name(&d.app_id, r))
            .unwrap_or_default(),
        new_release: names::release_name(&d.app_id, &d.new_release_id),
        r#type: release_type_to_pb(d.release_type) as i32,
        status: deployment_status_to_pb(d.status) as i32,
        job_state: d.job_state.clone(),
        job_type: d.job_type.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_round_trips_name_and_fields() {
        let app = App {
            id: "app1".into(),
            display_name: "App One".into(),
            labels: HashMap::from([("env".to_string(), "prod".to_string())]),
            deploy_strategy: DeployStrategy::OneByOne,
            deploy_timeout: 30,
        };
        let pb_app = app_to_pb(&app);
        assert_eq!(pb_app.name, "apps/app1");
        assert_eq!(pb_app.deploy_strategy, pb::DeployStrategy::OneByOne as i32);
    }

    #[test]
    fn formation_carries_scale_request_name_through() {
        let f = Formation {
            app_id: "app1".into(),
            release_id: "r1".into(),
            processes: HashMap::from([("web".to_string(), 2)]),
            tags: HashMap::new(),
            state: ScaleState::Pending,
            scale_request: Some("apps/app1/releases/r1/scale/s1".into()),
        };
        let pb_f = formation_to_pb(&f);
        assert_eq!(pb_f.scale_request, "apps/app1/releases/r1/scale/s1");
        assert_eq!(pb_f.state, pb::ScaleRequestState::ScalePending as i32);
    }
}
