//! Integration tests for spec.md §8 scenarios A–E, built against the
//! in-memory fake [`MemoryStore`]/[`MemoryChangeFeed`] (the sqlx adapter is
//! not exercised here; see `SPEC_FULL.md` §8).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use controller::config::Config;
use controller::domain::{App, DeployStrategy, Release, ReleaseType, ScaleState};
use controller::events::listener::EventListener;
use controller::pb;
use controller::pb::controller_service_server::ControllerService as _;
use controller::store::memory::{MemoryChangeFeed, MemoryStore};
use controller::store::Store;
use controller::ControllerService;
use tokio_stream::StreamExt;
use tonic::Request;

fn test_config() -> Config {
    Config {
        port: 0,
        default_route_domain: None,
        database_url: String::new(),
        scale_timeout: Duration::from_secs(10),
    }
}

fn sample_app(id: &str) -> App {
    App {
        id: id.to_string(),
        display_name: id.to_string(),
        labels: HashMap::new(),
        deploy_strategy: DeployStrategy::AllAtOnce,
        deploy_timeout: 30,
    }
}

fn build_service(config: Config) -> (ControllerService, Arc<MemoryStore>, Arc<MemoryChangeFeed>) {
    let feed = Arc::new(MemoryChangeFeed::new());
    let store = Arc::new(MemoryStore::new(feed.clone()));
    let listener = EventListener::new(feed.clone());
    let service = ControllerService::new(store.clone(), listener, Arc::new(config));
    (service, store, feed)
}

/// Scenario A: unary `StreamApps` with a bounded page size emits exactly
/// one response carrying a page, a non-empty next-page token, and
/// `page_complete = true`, then closes.
#[tokio::test]
async fn scenario_a_stream_apps_unary_pagination() {
    let (service, store, _feed) = build_service(test_config());
    for id in ["a", "b", "c", "d"] {
        store.seed_app(sample_app(id));
    }

    let req = pb::StreamAppsRequest {
        name_filters: vec![],
        label_filters: vec![],
        stream_updates: false,
        stream_creates: false,
        page_size: 2,
        page_token: String::new(),
    };
    let mut stream = service
        .stream_apps(Request::new(req))
        .await
        .unwrap()
        .into_inner();

    let first = stream.next().await.unwrap().unwrap();
    // Oldest-first (insertion order): the first page is `[a, b]`, not the
    // two most-recently-seeded apps (store/mod.rs documents this as the
    // store's canonical ordering).
    assert_eq!(
        first.apps.iter().map(|a| a.name.clone()).collect::<Vec<_>>(),
        vec!["apps/a".to_string(), "apps/b".to_string()]
    );
    assert!(first.page_complete);
    let token = controller::page_token::PageToken::parse(&first.next_page_token).unwrap();
    let b_row_id = store.list_apps(None, 2).await.unwrap()[1].row_id;
    assert_eq!(token.before_id, Some(b_row_id));

    // Unary: no further responses, the stream closes.
    assert!(stream.next().await.is_none());
}

/// Scenario B: `StreamScales` coalesces a burst of events arriving within
/// the debounce window into a single response carrying all of them.
#[tokio::test]
async fn scenario_b_stream_scales_debounces_bursts() {
    let (service, store, _feed) = build_service(test_config());
    store.seed_release(Release {
        id: "r1".into(),
        app_id: "app1".into(),
        labels: HashMap::new(),
        release_type: ReleaseType::Code,
        body: serde_json::Value::Null,
    });

    let req = pb::StreamScalesRequest {
        name_filters: vec!["apps/app1".to_string()],
    };
    let mut stream = service
        .stream_scales(Request::new(req))
        .await
        .unwrap()
        .into_inner();

    let handle = tokio::spawn(async move { stream.next().await });

    // Give the handler time to open its subscription before the burst.
    tokio::time::sleep(Duration::from_millis(20)).await;

    for i in 0..3 {
        store
            .create_scale_request(controller::domain::ScaleRequest {
                id: format!("s{i}"),
                app_id: "app1".into(),
                release_id: "r1".into(),
                state: ScaleState::Pending,
                new_processes: None,
                new_tags: None,
                updated_at: chrono::Utc::now(),
            })
            .await
            .unwrap();
    }

    let first = tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("debounced response within timeout")
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(first.scale_requests.len(), 3);
}

/// Scenario C: `CreateScale` blocks until the worker-published terminal
/// state, returning the completed request; a `cancelled` terminal state
/// instead fails with `failed-precondition`; no terminal state within the
/// timeout fails with `deadline-exceeded`.
#[tokio::test]
async fn scenario_c_create_scale_completes() {
    let (service, store, _feed) = build_service(test_config());
    store.seed_release(Release {
        id: "r1".into(),
        app_id: "app1".into(),
        labels: HashMap::new(),
        release_type: ReleaseType::Code,
        body: serde_json::Value::Null,
    });

    let store_for_worker = store.clone();
    let worker = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        let reqs = store_for_worker.list_scale_requests(&[]).await.unwrap();
        let inserted = reqs.first().expect("scale request inserted");
        store_for_worker
            .update_scale_request_state("app1", "r1", &inserted.id, ScaleState::Complete)
            .await
            .unwrap();
    });

    let req = pb::CreateScaleRequest {
        parent: "apps/app1/releases/r1".to_string(),
        processes: Some(pb::ProcessCounts {
            counts: HashMap::from([("web".to_string(), 3)]),
        }),
        tags: None,
    };
    let resp = service.create_scale(Request::new(req)).await.unwrap().into_inner();
    assert_eq!(resp.state, pb::ScaleRequestState::ScaleComplete as i32);
    worker.await.unwrap();
}

#[tokio::test]
async fn scenario_c_create_scale_cancelled_is_failed_precondition() {
    let (service, store, _feed) = build_service(test_config());
    store.seed_release(Release {
        id: "r1".into(),
        app_id: "app1".into(),
        labels: HashMap::new(),
        release_type: ReleaseType::Code,
        body: serde_json::Value::Null,
    });

    let store_for_worker = store.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        let reqs = store_for_worker.list_scale_requests(&[]).await.unwrap();
        let inserted = reqs.first().expect("scale request inserted");
        store_for_worker
            .update_scale_request_state("app1", "r1", &inserted.id, ScaleState::Cancelled)
            .await
            .unwrap();
    });

    let req = pb::CreateScaleRequest {
        parent: "apps/app1/releases/r1".to_string(),
        processes: None,
        tags: None,
    };
    let status = service.create_scale(Request::new(req)).await.unwrap_err();
    assert_eq!(status.code(), tonic::Code::FailedPrecondition);
    assert!(status.message().contains("cancelled"));
}

#[tokio::test]
async fn scenario_c_create_scale_times_out() {
    let mut config = test_config();
    config.scale_timeout = Duration::from_millis(30);
    let (service, store, _feed) = build_service(config);
    store.seed_release(Release {
        id: "r1".into(),
        app_id: "app1".into(),
        labels: HashMap::new(),
        release_type: ReleaseType::Code,
        body: serde_json::Value::Null,
    });

    let req = pb::CreateScaleRequest {
        parent: "apps/app1/releases/r1".to_string(),
        processes: None,
        tags: None,
    };
    let status = service.create_scale(Request::new(req)).await.unwrap_err();
    assert_eq!(status.code(), tonic::Code::DeadlineExceeded);
}

/// Scenario D: `StreamFormations` mirrors a pending scale request's state
/// onto the formation and carries its resource name forward.
#[tokio::test]
async fn scenario_d_stream_formations_reflects_pending_scale() {
    let (service, store, _feed) = build_service(test_config());
    store.seed_release(Release {
        id: "r1".into(),
        app_id: "app1".into(),
        labels: HashMap::new(),
        release_type: ReleaseType::Code,
        body: serde_json::Value::Null,
    });

    let req = pb::StreamFormationsRequest {
        name_filters: vec!["apps/app1".to_string()],
    };
    let mut stream = service
        .stream_formations(Request::new(req))
        .await
        .unwrap()
        .into_inner();

    // First response is the initial snapshot (no scale request yet, so
    // state is the `complete` default).
    let baseline = stream.next().await.unwrap().unwrap();
    assert_eq!(baseline.formations.len(), 1);

    let handle = tokio::spawn(async move { stream.next().await });
    tokio::time::sleep(Duration::from_millis(20)).await;

    store
        .create_scale_request(controller::domain::ScaleRequest {
            id: "s1".into(),
            app_id: "app1".into(),
            release_id: "r1".into(),
            state: ScaleState::Pending,
            new_processes: Some(HashMap::from([("web".to_string(), 2)])),
            new_tags: None,
            updated_at: chrono::Utc::now(),
        })
        .await
        .unwrap();

    let updated = tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("formation response within timeout")
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(updated.formations.len(), 1);
    let formation = &updated.formations[0];
    assert_eq!(formation.state, pb::ScaleRequestState::ScalePending as i32);
    assert_eq!(formation.scale_request, "apps/app1/releases/r1/scale/s1");
}

/// Scenario E: `CreateDeployment` streams job-state deltas through to
/// `complete` and invokes `CreateScale` internally when the request carried
/// an embedded scale request.
#[tokio::test]
async fn scenario_e_create_deployment_runs_embedded_scale_on_complete() {
    let (service, store, _feed) = build_service(test_config());
    store.seed_release(Release {
        id: "r1".into(),
        app_id: "app1".into(),
        labels: HashMap::new(),
        release_type: ReleaseType::Code,
        body: serde_json::Value::Null,
    });
    store.seed_release(Release {
        id: "r2".into(),
        app_id: "app1".into(),
        labels: HashMap::new(),
        release_type: ReleaseType::Code,
        body: serde_json::Value::Null,
    });

    let req = pb::CreateDeploymentRequest {
        parent: "apps/app1".to_string(),
        release: "apps/app1/releases/r2".to_string(),
        scale_request: Some(pb::CreateScaleRequest {
            parent: "apps/app1/releases/r2".to_string(),
            processes: Some(pb::ProcessCounts {
                counts: HashMap::from([("web".to_string(), 2)]),
            }),
            tags: None,
        }),
    };
    let mut stream = service
        .create_deployment(Request::new(req))
        .await
        .unwrap()
        .into_inner();

    let store_for_worker = store.clone();
    let worker = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let deployments = store_for_worker.list_deployments(&[], None, 10).await.unwrap();
        let deployment = deployments.first().expect("deployment inserted");
        store_for_worker
            .update_deployment(
                "app1",
                &deployment.item.id,
                controller::domain::DeploymentStatus::Running,
                "deploy".into(),
                "running".into(),
                None,
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        // A worker finishing a scale request unblocks the embedded
        // `CreateScale` the deployment handler invokes on completion.
        let scale_worker_store = store_for_worker.clone();
        tokio::spawn(async move {
            loop {
                let reqs = scale_worker_store.list_scale_requests(&[]).await.unwrap();
                if let Some(r) = reqs.iter().find(|r| r.release_id == "r2") {
                    scale_worker_store
                        .update_scale_request_state("app1", "r2", &r.id, ScaleState::Complete)
                        .await
                        .unwrap();
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });

        store_for_worker
            .update_deployment(
                "app1",
                &deployment.item.id,
                controller::domain::DeploymentStatus::Complete,
                "deploy".into(),
                "complete".into(),
                None,
            )
            .await
            .unwrap();
    });

    let mut statuses = Vec::new();
    while let Some(event) = tokio::time::timeout(Duration::from_secs(2), stream.next())
        .await
        .expect("deployment event within timeout")
    {
        let event = event.unwrap();
        statuses.push(event.deployment.unwrap().status);
    }
    worker.await.unwrap();

    assert!(statuses.contains(&(pb::DeploymentStatus::DeploymentComplete as i32)));
}
