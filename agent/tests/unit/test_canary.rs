//! Canary controller tests

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use pullagent::canary::config::RolloutConfig;
use pullagent::canary::controller::{CanaryController, Options};
use pullagent::canary::fsm::RolloutStatus;
use pullagent::canary::metrics::SideMetrics;
use pullagent::canary::rollout::CanaryRollout;
use pullagent::errors::AgentError;
use pullagent::notify::{self, Dispatcher, Severity};

use crate::fakes::{drain, healthy_metrics, FakeBackend};

fn controller(options: Options) -> (CanaryController, Arc<FakeBackend>, Arc<Dispatcher>) {
    let (dispatcher, _handle) = Dispatcher::start(
        &notify::Options::default(),
        Vec::new(),
        std::future::pending::<()>(),
    );
    let backend = Arc::new(FakeBackend::new());
    let controller = CanaryController::new(options, backend.clone(), dispatcher.clone());
    (controller, backend, dispatcher)
}

fn manual_ticks() -> Options {
    Options {
        analysis_interval: Duration::from_secs(3600),
        ..Default::default()
    }
}

fn config(id: &str) -> RolloutConfig {
    RolloutConfig {
        target_percent: 30,
        increment_interval_minutes: 0,
        ..RolloutConfig::new(id, "web", "web:v2")
    }
}

fn error_rate(percent: u64) -> SideMetrics {
    SideMetrics {
        requests: 1000,
        errors: percent * 10,
        ..healthy_metrics()
    }
}

#[tokio::test]
async fn test_start_sets_initial_split() {
    let (controller, backend, _) = controller(manual_ticks());

    let rollout = controller.start(config("web-v2")).await.unwrap();

    assert_eq!(rollout.status, RolloutStatus::Progressing);
    assert_eq!(rollout.current_percent, 10);
    assert_eq!(backend.state().deployed, vec![("web".to_string(), "web:v2".to_string())]);
    assert_eq!(backend.split_percents(), vec![10]);
    assert_eq!(controller.get("web-v2").unwrap().status, RolloutStatus::Progressing);
    assert_eq!(controller.active().len(), 1);
}

#[tokio::test]
async fn test_healthy_ticks_reach_target() {
    let (controller, backend, dispatcher) = controller(manual_ticks());
    let mut events = dispatcher.subscribe();
    controller.start(config("web-v2")).await.unwrap();

    let rollout = controller.analyze("web-v2").await.unwrap();
    assert_eq!(rollout.current_percent, 20);
    assert_eq!(rollout.status, RolloutStatus::Progressing);

    let rollout = controller.analyze("web-v2").await.unwrap();
    assert_eq!(rollout.current_percent, 30);
    assert_eq!(rollout.status, RolloutStatus::Promoting);
    assert_eq!(rollout.metrics.len(), 2);
    assert_eq!(backend.split_percents(), vec![10, 20, 30]);

    // No automatic promotion
    let rollout = controller.analyze("web-v2").await.unwrap();
    assert_eq!(rollout.status, RolloutStatus::Promoting);
    assert!(backend.state().promoted.is_empty());

    let titles: Vec<String> = drain(&mut events).into_iter().map(|e| e.title).collect();
    assert!(titles.contains(&"Canary web ready for promotion".to_string()));
}

#[tokio::test]
async fn test_increment_waits_for_interval() {
    let (controller, backend, _) = controller(manual_ticks());
    controller
        .start(RolloutConfig {
            increment_interval_minutes: 60,
            ..config("web-v2")
        })
        .await
        .unwrap();

    let rollout = controller.analyze("web-v2").await.unwrap();
    assert_eq!(rollout.current_percent, 10);
    assert_eq!(rollout.metrics.len(), 1);
    assert_eq!(backend.split_percents(), vec![10]);

    // Manual progress ignores the interval
    let rollout = controller.progress("web-v2").await.unwrap();
    assert_eq!(rollout.current_percent, 20);
}

#[tokio::test]
async fn test_error_rate_breach_rolls_back() {
    let (controller, backend, dispatcher) = controller(manual_ticks());
    let mut events = dispatcher.subscribe();
    controller
        .start(RolloutConfig {
            increment_interval_minutes: 60,
            ..config("web-v2")
        })
        .await
        .unwrap();
    backend.state().canary = error_rate(8);

    let rollout = controller.analyze("web-v2").await.unwrap();

    assert_eq!(rollout.status, RolloutStatus::RolledBack);
    assert_eq!(rollout.current_percent, 0);
    assert!(rollout.rollback_reason.as_deref().unwrap().contains("error rate"));
    assert!(rollout.ended_at.is_some());
    assert_eq!(backend.state().removed, vec!["web".to_string()]);
    assert_eq!(backend.split_percents().last(), Some(&0));

    let warnings: Vec<String> = drain(&mut events)
        .into_iter()
        .filter(|e| e.severity == Severity::Warning)
        .map(|e| e.title)
        .collect();
    assert_eq!(warnings, vec!["Canary web rolled back".to_string()]);

    // The actor is gone, controls are refused
    assert!(matches!(
        controller.pause("web-v2").await,
        Err(AgentError::InvalidTransition(_))
    ));
}

#[tokio::test]
async fn test_latency_breach_rolls_back() {
    let (controller, backend, _) = controller(manual_ticks());
    controller.start(config("web-v2")).await.unwrap();
    backend.state().canary.avg_latency_ms = 1500.0;

    let rollout = controller.analyze("web-v2").await.unwrap();

    assert_eq!(rollout.status, RolloutStatus::RolledBack);
    assert!(rollout.rollback_reason.as_deref().unwrap().contains("latency"));
}

#[tokio::test]
async fn test_breach_without_auto_rollback_pauses() {
    let (controller, backend, _) = controller(manual_ticks());
    controller
        .start(RolloutConfig {
            auto_rollback: false,
            ..config("web-v2")
        })
        .await
        .unwrap();
    backend.state().canary = error_rate(20);

    let rollout = controller.analyze("web-v2").await.unwrap();

    assert_eq!(rollout.status, RolloutStatus::Paused);
    assert_eq!(rollout.current_percent, 10);
    assert!(backend.state().removed.is_empty());
}

#[tokio::test]
async fn test_pause_and_resume() {
    let (controller, backend, _) = controller(manual_ticks());
    controller.start(config("web-v2")).await.unwrap();

    let rollout = controller.pause("web-v2").await.unwrap();
    assert_eq!(rollout.status, RolloutStatus::Paused);

    // Paused rollouts only observe
    let rollout = controller.analyze("web-v2").await.unwrap();
    assert_eq!(rollout.current_percent, 10);
    assert_eq!(rollout.metrics.len(), 1);
    assert!(matches!(
        controller.progress("web-v2").await,
        Err(AgentError::InvalidTransition(_))
    ));

    let before = Utc::now();
    let rollout = controller.resume("web-v2").await.unwrap();
    assert_eq!(rollout.status, RolloutStatus::Progressing);
    assert_eq!(rollout.current_percent, 10);
    assert!(rollout.last_increment_at >= before);
    assert_eq!(backend.split_percents(), vec![10]);
}

#[tokio::test]
async fn test_manual_promotion() {
    let (controller, backend, _) = controller(manual_ticks());
    controller.start(config("web-v2")).await.unwrap();

    let rollout = controller.promote("web-v2").await.unwrap();

    assert_eq!(rollout.status, RolloutStatus::Promoted);
    assert_eq!(rollout.current_percent, 0);
    let state = backend.state();
    assert_eq!(state.promoted, vec![("web".to_string(), "web:v2".to_string())]);
    assert_eq!(state.removed, vec!["web".to_string()]);
    assert_eq!(state.splits.last().map(|(_, p)| *p), Some(0));
}

#[tokio::test]
async fn test_manual_rollback_with_reason() {
    let (controller, backend, _) = controller(manual_ticks());
    controller.start(config("web-v2")).await.unwrap();

    let rollout = controller
        .rollback("web-v2", Some("bad release".to_string()))
        .await
        .unwrap();

    assert_eq!(rollout.status, RolloutStatus::RolledBack);
    assert_eq!(rollout.rollback_reason.as_deref(), Some("manual: bad release"));
    assert_eq!(backend.split_percents(), vec![10, 0]);
}

#[tokio::test]
async fn test_metric_failures_fail_rollout() {
    let (controller, backend, _) = controller(manual_ticks());
    controller.start(config("web-v2")).await.unwrap();
    backend.state().fail_metrics = true;

    for _ in 0..4 {
        assert!(controller.analyze("web-v2").await.is_err());
        assert_eq!(controller.get("web-v2").unwrap().status, RolloutStatus::Progressing);
    }
    assert!(controller.analyze("web-v2").await.is_err());

    let rollout = controller.get("web-v2").unwrap();
    assert_eq!(rollout.status, RolloutStatus::Failed);
    assert!(rollout.error.unwrap().contains("metric collection"));
}

#[tokio::test]
async fn test_duplicate_active_rollout_rejected() {
    let (controller, _, _) = controller(manual_ticks());
    controller.start(config("web-v2")).await.unwrap();

    assert!(matches!(
        controller.start(config("web-v2")).await,
        Err(AgentError::Conflict(_))
    ));
    assert!(matches!(
        controller.start(config("web-v3")).await,
        Err(AgentError::Conflict(_))
    ));

    // Once terminal, the id can be reused
    controller.rollback("web-v2", None).await.unwrap();
    let rollout = controller.start(config("web-v2")).await.unwrap();
    assert_eq!(rollout.status, RolloutStatus::Progressing);
}

#[tokio::test]
async fn test_invalid_config_rejected() {
    let (controller, backend, _) = controller(manual_ticks());

    let result = controller
        .start(RolloutConfig {
            initial_percent: 50,
            ..config("web-v2")
        })
        .await;

    assert!(matches!(result, Err(AgentError::ValidationError(_))));
    assert!(controller.get("web-v2").is_none());
    assert!(backend.state().deployed.is_empty());
}

#[tokio::test]
async fn test_oversized_interval_rejected_and_app_stays_free() {
    let (controller, backend, _) = controller(manual_ticks());

    let result = controller
        .start(RolloutConfig {
            increment_interval_minutes: 1_000_000_000_000_000,
            ..config("slow")
        })
        .await;
    assert!(matches!(result, Err(AgentError::ValidationError(_))));

    let result = controller.start(RolloutConfig::new("flag", "-rf", "web:v2")).await;
    assert!(matches!(result, Err(AgentError::ValidationError(_))));
    assert!(backend.state().deployed.is_empty());

    // A valid rollout for the same app still starts and analyzes
    controller.start(config("web-v2")).await.unwrap();
    let rollout = controller.analyze("web-v2").await.unwrap();
    assert_eq!(rollout.current_percent, 20);
}

#[tokio::test]
async fn test_failed_start_is_visible() {
    let (controller, backend, _) = controller(manual_ticks());
    backend.state().fail_deploy = true;

    assert!(controller.start(config("web-v2")).await.is_err());

    let rollout = controller.get("web-v2").unwrap();
    assert_eq!(rollout.status, RolloutStatus::Failed);
    assert_eq!(backend.state().removed, vec!["web".to_string()]);
}

#[tokio::test]
async fn test_unknown_rollout() {
    let (controller, _, _) = controller(manual_ticks());
    assert!(matches!(
        controller.pause("missing").await,
        Err(AgentError::NotFound(_))
    ));
    assert!(matches!(
        controller.metrics("missing", 10),
        Err(AgentError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_ticker_drives_rollout() {
    let (controller, _, _) = controller(Options {
        analysis_interval: Duration::from_millis(20),
        ..Default::default()
    });
    controller.start(config("web-v2")).await.unwrap();

    let rollout = tokio::time::timeout(
        Duration::from_secs(5),
        controller.wait_for("web-v2", |s| s == RolloutStatus::Promoting),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(rollout.current_percent, 30);

    controller.shutdown().await;
}

#[tokio::test]
async fn test_restore_after_restart() {
    let (controller, _, _) = controller(manual_ticks());

    let mut running = CanaryRollout::new(config("running"));
    running.mark_initialized(Utc::now()).unwrap();
    let starting = CanaryRollout::new(RolloutConfig {
        app: "api".to_string(),
        ..config("starting")
    });

    controller.restore(vec![running, starting]);

    let starting = controller.get("starting").unwrap();
    assert_eq!(starting.status, RolloutStatus::Failed);
    assert_eq!(starting.error.as_deref(), Some("interrupted by restart"));

    let rollout = controller.pause("running").await.unwrap();
    assert_eq!(rollout.status, RolloutStatus::Paused);
}
