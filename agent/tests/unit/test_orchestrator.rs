//! Deployment orchestrator tests

use std::time::Duration;

use pullagent::deploy::{DeployRequest, TriggerOutcome};
use pullagent::errors::AgentError;
use pullagent::models::deployment::{DeploymentStatus, PhaseName, PhaseStatus, TriggerSource};
use pullagent::notify::Severity;
use pullagent::triggers::poll::{check_once, PollOutcome};

use crate::fakes::{drain, Harness, REV1, REV2, REV3};

fn manual() -> DeployRequest {
    DeployRequest::new(TriggerSource::Manual)
}

#[tokio::test]
async fn test_successful_deployment() {
    let h = Harness::new().await;
    let mut events = h.app.dispatcher.subscribe();

    let deployment = h.deploy(manual()).await;

    assert_eq!(deployment.status, DeploymentStatus::Success);
    assert_eq!(deployment.previous_revision.as_deref(), Some(REV1));
    assert_eq!(deployment.new_revision.as_deref(), Some(REV2));
    let phases: Vec<PhaseName> = deployment.phases.iter().map(|p| p.name).collect();
    assert_eq!(
        phases,
        vec![PhaseName::Pull, PhaseName::Build, PhaseName::Restart, PhaseName::Health]
    );
    assert!(deployment.phases.iter().all(|p| p.status == PhaseStatus::Completed));
    assert!(deployment.duration_ms.is_some());

    assert_eq!(h.app.store.last_revision().as_deref(), Some(REV2));
    assert_eq!(h.app.store.consecutive_failures(), 0);
    assert!(h.app.store.current().is_none());

    let severities: Vec<Severity> = drain(&mut events).iter().map(|e| e.severity).collect();
    assert_eq!(severities, vec![Severity::Info, Severity::Success]);
}

#[tokio::test]
async fn test_unhealthy_deployment_rolls_back() {
    let h = Harness::new().await;
    h.deploy(manual()).await;
    assert_eq!(h.app.store.last_revision().as_deref(), Some(REV2));

    h.runner.set_remote(REV3);
    h.probe.mark_unhealthy(REV3);
    let mut events = h.app.dispatcher.subscribe();

    let deployment = h.deploy(manual()).await;

    assert_eq!(deployment.status, DeploymentStatus::Failed);
    assert_eq!(deployment.previous_revision.as_deref(), Some(REV2));
    assert!(deployment.error.as_deref().unwrap().contains("health"));

    let health = deployment.phase(PhaseName::Health).unwrap();
    assert_eq!(health.status, PhaseStatus::Failed);
    let rollback = deployment.phase(PhaseName::Rollback).unwrap();
    assert_eq!(rollback.status, PhaseStatus::Completed);

    assert_eq!(h.runner.head(), REV2);
    assert_eq!(h.app.store.last_revision().as_deref(), Some(REV2));
    assert_eq!(h.app.store.consecutive_failures(), 1);
    assert!(h
        .runner
        .calls()
        .iter()
        .any(|c| c == &format!("git reset --hard {}", REV2)));

    let titles: Vec<String> = drain(&mut events).into_iter().map(|e| e.title).collect();
    assert!(titles.contains(&"Deployment failed".to_string()));
    assert!(titles.contains(&"Deployment rolled back".to_string()));
}

#[tokio::test]
async fn test_fresh_agent_rollback_keeps_checked_out_revision() {
    let h = Harness::new().await;
    assert_eq!(h.app.store.last_revision().as_deref(), Some(REV1));
    h.probe.mark_unhealthy(REV2);

    let deployment = h.deploy(manual()).await;

    assert_eq!(deployment.status, DeploymentStatus::Failed);
    assert_eq!(deployment.previous_revision.as_deref(), Some(REV1));
    assert_eq!(h.runner.head(), REV1);
    assert_eq!(h.app.store.last_revision().as_deref(), Some(REV1));
}

#[tokio::test]
async fn test_rollback_records_restored_revision() {
    let h = Harness::new().await;
    // Stale record, the checkout is still at REV1
    h.app.store.set_last_revision(REV3);
    h.probe.mark_unhealthy(REV2);

    let deployment = h.deploy(manual()).await;

    let rollback = deployment.phase(PhaseName::Rollback).unwrap();
    assert_eq!(rollback.status, PhaseStatus::Completed);
    assert_eq!(h.app.store.last_revision().as_deref(), Some(REV1));
}

#[tokio::test]
async fn test_failed_rollback_is_critical() {
    let h = Harness::new().await;
    h.probe.mark_unhealthy(REV1);
    h.probe.mark_unhealthy(REV2);
    let mut events = h.app.dispatcher.subscribe();

    let deployment = h.deploy(manual()).await;

    assert_eq!(deployment.status, DeploymentStatus::Failed);
    assert_eq!(
        deployment.phase(PhaseName::Rollback).unwrap().status,
        PhaseStatus::Failed
    );
    let critical: Vec<String> = drain(&mut events)
        .into_iter()
        .filter(|e| e.severity == Severity::Critical)
        .map(|e| e.title)
        .collect();
    assert_eq!(critical, vec!["Rollback failed".to_string()]);
}

#[tokio::test]
async fn test_skip_rollback() {
    let h = Harness::new().await;
    h.runner.fail("build");

    let deployment = h
        .deploy(DeployRequest {
            skip_rollback: true,
            ..manual()
        })
        .await;

    assert_eq!(deployment.status, DeploymentStatus::Failed);
    assert!(deployment.phase(PhaseName::Rollback).is_none());
    assert!(deployment.phase(PhaseName::Restart).is_none());
    assert!(!h.runner.calls().iter().any(|c| c.starts_with("git reset")));
}

#[tokio::test]
async fn test_rollback_disabled() {
    let h = Harness::with_options(|o| o.orchestrator.rollback_enabled = false).await;
    h.runner.fail("up");

    let deployment = h.deploy(manual()).await;

    assert_eq!(deployment.status, DeploymentStatus::Failed);
    assert_eq!(
        deployment.phase(PhaseName::Restart).unwrap().status,
        PhaseStatus::Failed
    );
    assert!(deployment.phase(PhaseName::Rollback).is_none());
}

#[tokio::test]
async fn test_repeated_failures_need_intervention() {
    let h = Harness::new().await;
    h.runner.fail("build");
    let mut events = h.app.dispatcher.subscribe();

    let request = DeployRequest {
        skip_rollback: true,
        ..manual()
    };
    for _ in 0..3 {
        h.deploy(request).await;
    }
    assert_eq!(h.app.store.consecutive_failures(), 3);

    let received = drain(&mut events);
    let failures = received
        .iter()
        .filter(|e| e.severity == Severity::Error && e.title == "Deployment failed")
        .count();
    let interventions = received
        .iter()
        .filter(|e| e.severity == Severity::Critical && e.title == "Manual intervention required")
        .count();
    assert_eq!(failures, 3);
    assert_eq!(interventions, 1);

    h.runner.heal("build");
    let deployment = h.deploy(manual()).await;
    assert_eq!(deployment.status, DeploymentStatus::Success);
    assert_eq!(h.app.store.consecutive_failures(), 0);
}

#[tokio::test]
async fn test_concurrent_triggers_rejected() {
    let h = Harness::new().await;
    h.runner.state().build_delay = Duration::from_millis(200);

    let first = h.app.orchestrator.trigger(manual()).unwrap();
    assert!(matches!(first, TriggerOutcome::Started { .. }));
    assert!(h.app.orchestrator.is_deploying());

    for trigger in [TriggerSource::Webhook, TriggerSource::Poll, TriggerSource::Manual] {
        let result = h.app.orchestrator.trigger(DeployRequest::new(trigger));
        assert!(matches!(result, Err(AgentError::DeploymentInProgress)));
    }
    assert!(matches!(
        h.app.orchestrator.rollback_to(REV1),
        Err(AgentError::DeploymentInProgress)
    ));

    h.wait_idle().await;
    assert_eq!(h.app.store.history(10).len(), 1);
    assert!(!h.app.orchestrator.is_deploying());
}

#[tokio::test]
async fn test_forced_request_queued() {
    let h = Harness::new().await;
    h.runner.state().build_delay = Duration::from_millis(100);

    let first = h.app.orchestrator.trigger(manual()).unwrap();
    let forced = DeployRequest {
        force: true,
        ..manual()
    };
    assert_eq!(h.app.orchestrator.trigger(forced).unwrap(), TriggerOutcome::Queued);
    // A newer forced request replaces the queued one
    assert_eq!(h.app.orchestrator.trigger(forced).unwrap(), TriggerOutcome::Queued);

    h.wait_idle().await;

    let history = h.app.store.history(10);
    assert_eq!(history.len(), 2);
    let TriggerOutcome::Started { id } = first else {
        panic!("first trigger should start");
    };
    assert_eq!(history[1].id, id);
    assert!(!history[1].forced);
    assert!(history[0].forced);
    assert!(history[0].id > id);
}

#[tokio::test]
async fn test_history_is_bounded() {
    let h = Harness::with_options(|o| o.storage.history_capacity = 3).await;

    let mut ids = Vec::new();
    for _ in 0..5 {
        ids.push(h.deploy(manual()).await.id);
    }

    let kept: Vec<u64> = h.app.store.history(10).iter().map(|d| d.id).collect();
    let expected: Vec<u64> = ids.iter().rev().take(3).copied().collect();
    assert_eq!(kept, expected);
    assert!(ids.windows(2).all(|w| w[0] < w[1]));
}

#[tokio::test]
async fn test_manual_rollback() {
    let h = Harness::new().await;
    h.deploy(manual()).await;
    assert_eq!(h.runner.head(), REV2);

    let id = h.app.orchestrator.rollback_to(REV1).unwrap();
    h.wait_idle().await;

    let deployment = h.app.store.last_deployment().unwrap();
    assert_eq!(deployment.id, id);
    assert_eq!(deployment.trigger, TriggerSource::Manual);
    assert_eq!(deployment.status, DeploymentStatus::Success);
    assert_eq!(deployment.rollback_target.as_deref(), Some(REV1));
    assert_eq!(deployment.phases.len(), 1);
    assert_eq!(deployment.phases[0].name, PhaseName::Rollback);
    assert_eq!(h.runner.head(), REV1);
    assert_eq!(h.app.store.last_revision().as_deref(), Some(REV1));
}

#[tokio::test]
async fn test_poll_triggers_on_new_remote() {
    let h = Harness::new().await;

    let outcome = check_once(&h.app.git, &h.app.orchestrator).await.unwrap();
    assert!(matches!(outcome, PollOutcome::Triggered { ref remote, .. } if remote == REV2));
    h.wait_idle().await;

    let deployment = h.app.store.last_deployment().unwrap();
    assert_eq!(deployment.trigger, TriggerSource::Poll);
    assert_eq!(deployment.status, DeploymentStatus::Success);

    let outcome = check_once(&h.app.git, &h.app.orchestrator).await.unwrap();
    assert_eq!(outcome, PollOutcome::UpToDate);
}

#[tokio::test]
async fn test_poll_skips_while_deploying() {
    let h = Harness::new().await;
    h.runner.state().build_delay = Duration::from_millis(100);
    h.app.orchestrator.trigger(manual()).unwrap();

    let outcome = check_once(&h.app.git, &h.app.orchestrator).await.unwrap();
    assert_eq!(outcome, PollOutcome::Busy);
    h.wait_idle().await;
}
