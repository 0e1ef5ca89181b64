use push_lab::error::PlatformError;
use push_lab::platform::DisplaySurface;
use push_lab::{
    DeliveryMethod, DeliveryOutcome, Harness, HarnessConfig, HarnessError, LabEnvironment,
    LabPlatform, PermissionState,
};
use std::sync::Arc;
use std::time::Duration;

const VAPID_KEY: &str =
    "BEl62iUYgUivxIkv69yViEuiBIa-Ib9-SkvMeAtA3LFgDzkrxZJjSgSnfckjBJuBkr3qBUYIHBQFLXYp5Nksh8U";

async fn start(env: LabEnvironment) -> (Arc<LabPlatform>, Harness) {
    let platform = Arc::new(LabPlatform::new(env));
    let harness = Harness::start(platform.clone(), &HarnessConfig::default()).await;
    (platform, harness)
}

fn granted() -> LabEnvironment {
    LabEnvironment {
        initial_permission: PermissionState::Granted,
        ..LabEnvironment::default()
    }
}

#[tokio::test]
async fn test_grant_then_dispatch_without_service_worker_is_local() {
    let env = LabEnvironment {
        service_worker: false,
        ..LabEnvironment::default()
    };
    let (platform, harness) = start(env).await;
    assert_eq!(harness.readiness().permission, PermissionState::Default);

    let state = harness.request_permission().await.unwrap();
    assert_eq!(state, PermissionState::Granted);
    assert_eq!(harness.readiness().permission, PermissionState::Granted);
    assert_eq!(platform.prompt_count(), 1);

    harness
        .dispatch("Hello", "World", Duration::ZERO)
        .await
        .unwrap();

    let head = harness.history().into_iter().next().unwrap();
    assert_eq!(head.title, "Hello");
    assert_eq!(head.body, "World");
    assert_eq!(head.method, DeliveryMethod::Local);
    assert_eq!(platform.shown()[0].surface, DisplaySurface::Page);
}

#[tokio::test]
async fn test_dispatch_with_service_worker_is_service_worker() {
    let (platform, harness) = start(granted()).await;

    harness.dispatch("Same", "Text", Duration::ZERO).await.unwrap();

    let head = harness.history().into_iter().next().unwrap();
    assert_eq!(head.method, DeliveryMethod::ServiceWorker);
    assert_eq!((head.title.as_str(), head.body.as_str()), ("Same", "Text"));
    assert_eq!(platform.controller().displayed().len(), 1);
}

#[tokio::test]
async fn test_dispatch_without_permission_never_records() {
    for initial in [PermissionState::Default, PermissionState::Denied] {
        let env = LabEnvironment {
            initial_permission: initial,
            ..LabEnvironment::default()
        };
        let (platform, harness) = start(env).await;

        let err = harness
            .dispatch("Hello", "World", Duration::ZERO)
            .await
            .unwrap_err();

        assert_eq!(err, HarnessError::PermissionRequired);
        assert!(harness.history().is_empty());
        assert!(platform.shown().is_empty());
        assert_eq!(
            harness.last_error().as_deref(),
            Some("please grant notification permissions first")
        );
    }
}

#[tokio::test]
async fn test_denied_is_sticky() {
    let env = LabEnvironment {
        initial_permission: PermissionState::Denied,
        ..LabEnvironment::default()
    };
    let (platform, harness) = start(env).await;

    assert_eq!(harness.request_permission().await, Ok(PermissionState::Denied));
    assert_eq!(harness.request_permission().await, Ok(PermissionState::Denied));
    assert_eq!(platform.prompt_count(), 0);
}

#[tokio::test]
async fn test_revoked_permission_is_seen_at_dispatch_time() {
    let (platform, harness) = start(granted()).await;
    platform.set_permission(PermissionState::Denied);

    // 快照还没刷新，发送时仍然要重新向平台确认
    assert_eq!(harness.readiness().permission, PermissionState::Granted);
    let err = harness.dispatch("A", "B", Duration::ZERO).await.unwrap_err();
    assert_eq!(err, HarnessError::PermissionRequired);
}

#[tokio::test(start_paused = true)]
async fn test_delayed_dispatch_through_service_worker() {
    let (_, harness) = start(granted()).await;

    let outcome = harness
        .dispatch("Alert", "Body", Duration::from_secs(5))
        .await
        .unwrap();
    let DeliveryOutcome::Scheduled(scheduled) = outcome else {
        panic!("expected a scheduled dispatch");
    };
    assert!(harness.is_pending());
    assert!(harness.history().is_empty());

    let item = scheduled.wait().await.unwrap();
    assert_eq!(item.method, DeliveryMethod::ServiceWorker);
    assert!(!harness.is_pending());
    assert_eq!(harness.history()[0], item);
}

#[tokio::test(start_paused = true)]
async fn test_second_delayed_dispatch_is_rejected_while_pending() {
    let (_, harness) = start(granted()).await;

    let first = harness
        .dispatch("First", "Body", Duration::from_secs(5))
        .await
        .unwrap();
    let err = harness
        .dispatch("Second", "Body", Duration::from_secs(1))
        .await
        .unwrap_err();
    assert_eq!(err, HarnessError::DispatchPending);

    // 立即发送不受影响
    harness.dispatch("Now", "Body", Duration::ZERO).await.unwrap();

    let DeliveryOutcome::Scheduled(scheduled) = first else {
        panic!("expected a scheduled dispatch");
    };
    scheduled.wait().await.unwrap();

    let titles: Vec<String> = harness.history().into_iter().map(|i| i.title).collect();
    assert_eq!(titles, vec!["First", "Now"]);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_mid_delay_prevents_dispatch() {
    let (platform, harness) = start(granted()).await;

    let outcome = harness
        .dispatch("Late", "Body", Duration::from_secs(5))
        .await
        .unwrap();
    harness.shutdown();
    assert!(!harness.is_pending());

    tokio::time::sleep(Duration::from_secs(10)).await;

    let DeliveryOutcome::Scheduled(scheduled) = outcome else {
        panic!("expected a scheduled dispatch");
    };
    assert!(scheduled.wait().await.is_err());
    assert!(harness.history().is_empty());
    assert!(platform.shown().is_empty());
}

#[tokio::test]
async fn test_service_worker_failure_does_not_fall_back() {
    let (platform, harness) = start(granted()).await;
    platform.fail_next_display(PlatformError::other("showNotification rejected"));

    let err = harness.dispatch("A", "B", Duration::ZERO).await.unwrap_err();

    assert_eq!(err, HarnessError::Dispatch("showNotification rejected".to_string()));
    assert!(platform.shown().is_empty());
    assert!(harness.history().is_empty());
    assert_eq!(
        harness.last_error().as_deref(),
        Some("notification failed: showNotification rejected")
    );
}

#[tokio::test]
async fn test_insecure_context_reports_https_hint() {
    let env = LabEnvironment {
        secure_context: false,
        ..granted()
    };
    let (_, harness) = start(env).await;
    assert!(!harness.readiness().is_secure_context);
    assert!(!harness.readiness().service_worker_active);

    let err = harness.dispatch("A", "B", Duration::ZERO).await.unwrap_err();
    assert!(err.to_string().contains("HTTPS"));
}

#[tokio::test]
async fn test_sandboxed_simulate_without_platform_call() {
    let env = LabEnvironment {
        sandboxed: true,
        ..granted()
    };
    let (platform, harness) = start(env).await;
    assert!(harness.readiness().is_sandboxed);
    assert!(!harness.readiness().service_worker_active);

    let simulated = harness.simulate();
    assert!(simulated.is_simulated());
    assert_eq!(
        simulated.endpoint(),
        "https://fcm.googleapis.com/fcm/send/mock-sandbox-subscription"
    );
    assert_eq!(platform.subscribe_count(), 0);

    let exported = harness.export_subscription().unwrap();
    assert!(exported.contains("mock-sandbox-subscription"));

    let err = harness.deliver_push(None).await.unwrap_err();
    assert_eq!(err, HarnessError::SandboxRestricted);
}

#[tokio::test]
async fn test_real_subscription_differs_from_simulated() {
    let (_, harness) = start(granted()).await;

    let real = harness.subscribe(VAPID_KEY).await.unwrap();
    let simulated = harness.simulate();

    assert!(!real.is_simulated());
    assert_ne!(real.endpoint(), simulated.endpoint());
    assert_eq!(harness.current_subscription(), Some(simulated));

    harness.clear_subscription();
    assert!(harness.export_subscription().is_none());
}

#[tokio::test]
async fn test_bad_key_sets_last_error() {
    let (platform, harness) = start(granted()).await;

    let err = harness.subscribe("%%%").await.unwrap_err();

    assert!(matches!(err, HarnessError::KeyFormat(_)));
    assert_eq!(platform.subscribe_count(), 0);
    assert!(harness.last_error().unwrap().contains("application server key"));
}

#[tokio::test]
async fn test_configured_history_capacity() {
    let platform = Arc::new(LabPlatform::new(granted()));
    let config = HarnessConfig {
        history_capacity: 3,
        ..HarnessConfig::default()
    };
    let harness = Harness::start(platform, &config).await;

    for n in 0..5 {
        harness
            .dispatch(&format!("n{}", n), "body", Duration::ZERO)
            .await
            .unwrap();
    }

    let titles: Vec<String> = harness.history().into_iter().map(|i| i.title).collect();
    assert_eq!(titles, vec!["n4", "n3", "n2"]);
}
