// ABOUTME: Integration tests for sandbox create, update and delete through the orchestration facade
// ABOUTME: Port accounting, partial failure, quota and owner checks against a scripted launcher

mod common;

use common::{scripted_service, service_with, settings, ScriptedLauncher, POOL_START};
use mockbox_orchestrator::{
    AllowAllPolicy, CreateSandboxRequest, MemoryStore, OwnerAllowlistPolicy, SandboxError,
    SandboxStatus, ServiceStatus, UpdateSandboxRequest,
};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

fn request(services: &[&str]) -> CreateSandboxRequest {
    CreateSandboxRequest {
        required_services: services.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    }
}

fn request_with_config(service: &str, config: Value) -> CreateSandboxRequest {
    let mut custom_configs = HashMap::new();
    custom_configs.insert(service.to_string(), config);
    CreateSandboxRequest {
        required_services: vec![service.to_string()],
        custom_configs,
        ttl_minutes: None,
    }
}

#[tokio::test]
async fn test_create_get_delete_round() {
    let (service, launcher) = scripted_service(10);

    let sandbox = service
        .create("team-a", request(&["figma", "slack"]))
        .await
        .unwrap();
    assert_eq!(sandbox.status, SandboxStatus::Running);
    assert_eq!(sandbox.services.len(), 2);

    let ports: HashSet<u16> = sandbox.held_ports().into_iter().collect();
    assert_eq!(ports.len(), 2);
    for port in &ports {
        assert!((POOL_START..POOL_START + 10).contains(port));
        assert!(service.ports().is_held(*port));
    }
    assert!(sandbox.services["figma"]
        .endpoints
        .contains(&"/v1/me".to_string()));

    let fetched = service.get(&sandbox.id).await.unwrap();
    assert_eq!(fetched.id, sandbox.id);

    service.delete("team-a", &sandbox.id).await.unwrap();
    assert!(matches!(
        service.get(&sandbox.id).await,
        Err(SandboxError::NotFound(_))
    ));
    assert_eq!(service.ports().held_count(), 0);
    assert_eq!(launcher.running_count(), 0);
}

#[tokio::test]
async fn test_one_failing_service_degrades_sandbox() {
    let (service, launcher) = scripted_service(10);
    launcher.fail_service("slack");

    let sandbox = service
        .create("team-a", request(&["figma", "slack", "github"]))
        .await
        .unwrap();

    assert_eq!(sandbox.status, SandboxStatus::Degraded);
    assert_eq!(sandbox.running_count(), 2);

    let slack = &sandbox.services["slack"];
    assert_eq!(slack.status, ServiceStatus::Failed);
    assert_eq!(slack.port, None);
    assert!(slack.error.is_some());

    assert_eq!(service.ports().held_count(), 2);
    assert_eq!(service.ports().free_count(), 8);
}

#[tokio::test]
async fn test_total_failure_leaves_nothing_behind() {
    let (service, launcher) = scripted_service(10);
    launcher.fail_service("figma");
    launcher.fail_service("slack");

    let err = service
        .create("team-a", request(&["figma", "slack"]))
        .await
        .unwrap_err();

    match err {
        SandboxError::AllServicesFailed(failures) => {
            let names: HashSet<_> = failures.iter().map(|f| f.service.as_str()).collect();
            assert_eq!(names, HashSet::from(["figma", "slack"]));
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(service.ports().held_count(), 0);
    assert!(service.registry().is_empty().await);
}

#[tokio::test]
async fn test_launch_retry_uses_fresh_port() {
    let (service, launcher) = scripted_service(10);
    launcher.fail_once("figma");

    let sandbox = service.create("team-a", request(&["figma"])).await.unwrap();
    assert_eq!(sandbox.status, SandboxStatus::Running);

    let attempts = launcher.start_ports("figma");
    assert_eq!(attempts.len(), 2);
    assert_ne!(attempts[0], attempts[1]);
    assert_eq!(sandbox.services["figma"].port, Some(attempts[1]));
    assert_eq!(service.ports().held_count(), 1);
}

#[tokio::test]
async fn test_exhausted_pool_is_retryable() {
    let (service, _launcher) = scripted_service(1);

    let first = service.create("team-a", request(&["generic"])).await.unwrap();
    let err = service
        .create("team-b", request(&["figma"]))
        .await
        .unwrap_err();
    assert!(matches!(err, SandboxError::ResourceExhausted(_)));
    assert!(err.is_retryable());

    service.delete("team-a", &first.id).await.unwrap();
    service.create("team-b", request(&["figma"])).await.unwrap();
}

#[tokio::test]
async fn test_pool_exhaustion_mid_create_degrades() {
    let (service, _launcher) = scripted_service(1);

    let sandbox = service
        .create("team-a", request(&["figma", "slack"]))
        .await
        .unwrap();
    assert_eq!(sandbox.status, SandboxStatus::Degraded);
    assert_eq!(sandbox.running_count(), 1);
    assert_eq!(service.ports().free_count(), 0);
}

#[tokio::test]
async fn test_request_validation() {
    let (service, launcher) = scripted_service(10);

    let cases = vec![
        (request(&[]), "empty"),
        (request(&["jira"]), "unknown"),
        (request(&["figma", "figma"]), "duplicate"),
        (request_with_config("figma", json!({ "no_such_param": 1 })), "bad param"),
        (request_with_config("figma", json!("not an object")), "bad shape"),
        (
            CreateSandboxRequest {
                ttl_minutes: Some(-5),
                ..request(&["figma"])
            },
            "negative ttl",
        ),
    ];

    for (req, label) in cases {
        let err = service.create("team-a", req).await.unwrap_err();
        match (label, &err) {
            ("empty", SandboxError::Validation(_))
            | ("unknown", SandboxError::UnknownService(_))
            | ("duplicate", SandboxError::InvalidConfig { .. })
            | ("bad param", SandboxError::InvalidConfig { .. })
            | ("bad shape", SandboxError::InvalidConfig { .. })
            | ("negative ttl", SandboxError::Validation(_)) => {}
            _ => panic!("{}: unexpected error {:?}", label, err),
        }
    }

    let mut stray = request(&["figma"]);
    stray.custom_configs.insert("slack".into(), json!({}));
    assert!(matches!(
        service.create("team-a", stray).await,
        Err(SandboxError::InvalidConfig { .. })
    ));

    assert!(launcher.starts.lock().unwrap().is_empty());
    assert_eq!(service.ports().held_count(), 0);
}

#[tokio::test]
async fn test_ttl_is_clamped_to_maximum() {
    let (service, _launcher) = scripted_service(10);
    let max = service.settings().max_ttl_minutes;

    let sandbox = service
        .create(
            "team-a",
            CreateSandboxRequest {
                ttl_minutes: Some(max as i64 * 10),
                ..request(&["generic"])
            },
        )
        .await
        .unwrap();
    assert_eq!(sandbox.ttl_minutes, max);
}

#[tokio::test]
async fn test_concurrent_creates_get_distinct_ports() {
    let (service, _launcher) = scripted_service(20);

    let creates = (0..10).map(|i| {
        let service = service.clone();
        async move {
            service
                .create(&format!("owner-{}", i), request(&["generic"]))
                .await
        }
    });
    let sandboxes: Vec<_> = futures::future::join_all(creates)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    let ports: HashSet<u16> = sandboxes.iter().flat_map(|s| s.held_ports()).collect();
    assert_eq!(ports.len(), 10);
    assert_eq!(service.ports().held_count(), 10);
}

#[tokio::test]
async fn test_delete_is_idempotent() {
    let (service, launcher) = scripted_service(10);
    let sandbox = service
        .create("team-a", request(&["figma", "slack"]))
        .await
        .unwrap();

    service.delete("team-a", &sandbox.id).await.unwrap();
    service.delete("team-a", &sandbox.id).await.unwrap();
    service.delete("team-a", "sbx_never_existed").await.unwrap();

    assert_eq!(launcher.stops.lock().unwrap().len(), 2);
    assert_eq!(service.ports().held_count(), 0);
}

#[tokio::test]
async fn test_concurrent_deletes_stop_each_service_once() {
    let (service, launcher) = scripted_service(10);
    let sandbox = service
        .create("team-a", request(&["figma", "slack", "github"]))
        .await
        .unwrap();

    let (a, b) = tokio::join!(
        service.delete("team-a", &sandbox.id),
        service.delete("team-a", &sandbox.id)
    );
    a.unwrap();
    b.unwrap();

    assert_eq!(launcher.stops.lock().unwrap().len(), 3);
    assert_eq!(service.ports().held_count(), 0);
    assert!(service.registry().is_tombstoned(&sandbox.id));
}

#[tokio::test]
async fn test_owner_quota() {
    let launcher = ScriptedLauncher::new();
    let mut settings = settings(10);
    settings.max_sandboxes_per_owner = Some(1);
    let service = service_with(
        settings,
        Arc::new(MemoryStore::new()),
        launcher,
        Arc::new(AllowAllPolicy),
    );

    let first = service.create("team-a", request(&["generic"])).await.unwrap();
    assert!(matches!(
        service.create("team-a", request(&["generic"])).await,
        Err(SandboxError::QuotaExceeded { limit: 1, .. })
    ));
    service.create("team-b", request(&["generic"])).await.unwrap();

    service.delete("team-a", &first.id).await.unwrap();
    service.create("team-a", request(&["generic"])).await.unwrap();
}

#[tokio::test]
async fn test_owner_checks() {
    let launcher = ScriptedLauncher::new();
    let service = service_with(
        settings(10),
        Arc::new(MemoryStore::new()),
        launcher,
        Arc::new(OwnerAllowlistPolicy::new(["team-a", "team-b"])),
    );

    assert!(matches!(
        service.create("intruder", request(&["generic"])).await,
        Err(SandboxError::Forbidden(_))
    ));

    let sandbox = service.create("team-a", request(&["generic"])).await.unwrap();
    assert!(matches!(
        service.delete("team-b", &sandbox.id).await,
        Err(SandboxError::Forbidden(_))
    ));
    assert!(matches!(
        service
            .update("team-b", &sandbox.id, UpdateSandboxRequest::default())
            .await,
        Err(SandboxError::Forbidden(_))
    ));
    assert!(service.get(&sandbox.id).await.is_ok());
}

#[tokio::test]
async fn test_update_adds_service() {
    let (service, _launcher) = scripted_service(10);
    let sandbox = service.create("team-a", request(&["figma"])).await.unwrap();
    let figma_port = sandbox.services["figma"].port;

    let updated = service
        .update(
            "team-a",
            &sandbox.id,
            UpdateSandboxRequest {
                add_services: Some(vec!["slack".into()]),
                update_configs: None,
            },
        )
        .await
        .unwrap();

    assert_eq!(updated.status, SandboxStatus::Running);
    assert_eq!(updated.services.len(), 2);
    assert_eq!(updated.services["figma"].port, figma_port);
    assert!(updated.services["slack"].is_running());
    assert_eq!(service.ports().held_count(), 2);
}

#[tokio::test]
async fn test_update_rerenders_changed_service() {
    let (service, launcher) = scripted_service(10);
    let sandbox = service.create("team-a", request(&["figma"])).await.unwrap();
    let old_handle = sandbox.services["figma"].handle.clone().unwrap();

    let mut configs = HashMap::new();
    configs.insert("figma".to_string(), json!({ "file_key": "design42" }));
    let updated = service
        .update(
            "team-a",
            &sandbox.id,
            UpdateSandboxRequest {
                add_services: None,
                update_configs: Some(configs.clone()),
            },
        )
        .await
        .unwrap();

    let figma = &updated.services["figma"];
    assert!(figma.is_running());
    assert!(figma.endpoints.contains(&"/v1/files/design42".to_string()));
    assert!(launcher.stops.lock().unwrap().contains(&old_handle.id));
    assert_eq!(service.ports().held_count(), 1);

    // Same config again renders the same mock
    let again = service
        .update(
            "team-a",
            &sandbox.id,
            UpdateSandboxRequest {
                add_services: None,
                update_configs: Some(configs),
            },
        )
        .await
        .unwrap();
    assert_eq!(again.services["figma"].endpoints, figma.endpoints);
    let first = launcher.artifact_for(figma.handle.as_ref().unwrap());
    assert!(first.is_none(), "previous instance should be stopped");
    let second = launcher
        .artifact_for(again.services["figma"].handle.as_ref().unwrap())
        .unwrap();
    assert!(second.find("GET", "/v1/files/design42").is_some());
}

#[tokio::test]
async fn test_update_rejects_bad_input_without_changes() {
    let (service, launcher) = scripted_service(10);
    let sandbox = service.create("team-a", request(&["figma"])).await.unwrap();
    let starts_before = launcher.starts.lock().unwrap().len();

    let mut bad_config = HashMap::new();
    bad_config.insert("figma".to_string(), json!({ "file_key": 7 }));
    let mut absent = HashMap::new();
    absent.insert("slack".to_string(), json!({}));

    let attempts = vec![
        UpdateSandboxRequest {
            add_services: Some(vec!["figma".into()]),
            update_configs: None,
        },
        UpdateSandboxRequest {
            add_services: Some(vec!["jira".into()]),
            update_configs: None,
        },
        UpdateSandboxRequest {
            add_services: None,
            update_configs: Some(bad_config),
        },
        UpdateSandboxRequest {
            add_services: None,
            update_configs: Some(absent),
        },
    ];
    for attempt in attempts {
        assert!(service.update("team-a", &sandbox.id, attempt).await.is_err());
    }

    assert_eq!(launcher.starts.lock().unwrap().len(), starts_before);
    let current = service.get(&sandbox.id).await.unwrap();
    assert_eq!(current.services, sandbox.services);

    assert!(matches!(
        service
            .update("team-a", "sbx_missing", UpdateSandboxRequest::default())
            .await,
        Err(SandboxError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_update_that_kills_last_service_deletes_sandbox() {
    let (service, launcher) = scripted_service(10);
    let sandbox = service.create("team-a", request(&["figma"])).await.unwrap();

    launcher.fail_service("figma");
    let mut configs = HashMap::new();
    configs.insert("figma".to_string(), json!({ "file_key": "other" }));
    let err = service
        .update(
            "team-a",
            &sandbox.id,
            UpdateSandboxRequest {
                add_services: None,
                update_configs: Some(configs),
            },
        )
        .await
        .unwrap_err();

    assert!(matches!(err, SandboxError::AllServicesFailed(_)));
    assert!(service.get(&sandbox.id).await.is_err());
    assert_eq!(service.ports().held_count(), 0);
}

#[tokio::test]
async fn test_abandoned_create_is_cleaned_up() {
    let (service, launcher) = scripted_service(10);
    launcher.set_start_delay(Duration::from_millis(200));

    let attempt = tokio::time::timeout(
        Duration::from_millis(20),
        service.create("team-a", request(&["figma", "slack"])),
    )
    .await;
    assert!(attempt.is_err());

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(launcher.running_count(), 0);
    assert_eq!(service.ports().held_count(), 0);
    assert!(service.registry().is_empty().await);
}

#[tokio::test]
async fn test_lifecycle_events_are_recorded() {
    let (service, _launcher) = scripted_service(10);
    let sandbox = service.create("team-a", request(&["figma"])).await.unwrap();

    let events = service.events(&sandbox.id, None).await.unwrap();
    assert!(events.iter().any(|e| e.message.contains("Started on port")));

    service.delete("team-a", &sandbox.id).await.unwrap();
    assert!(service.events(&sandbox.id, None).await.is_err());
}
