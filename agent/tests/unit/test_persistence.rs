//! State snapshot and restart tests

use std::time::Duration;

use pullagent::canary::config::RolloutConfig;
use pullagent::canary::fsm::RolloutStatus;
use pullagent::deploy::DeployRequest;
use pullagent::models::deployment::{DeploymentStatus, TriggerSource};
use pullagent::storage::state::PersistedState;
use pullagent::workers::persister;

use crate::fakes::{Harness, REV2};

#[tokio::test]
async fn test_shutdown_snapshot_survives_restart() {
    let h = Harness::new().await;
    h.deploy(DeployRequest::new(TriggerSource::Manual)).await;
    h.app
        .canary
        .start(RolloutConfig::new("web-v2", "web", "web:v2"))
        .await
        .unwrap();
    h.app.shutdown().await.unwrap();

    let state_file = h.dir.path().join("data").join("state.json");
    let raw = tokio::fs::read_to_string(&state_file).await.unwrap();
    let persisted: PersistedState = serde_json::from_str(&raw).unwrap();
    assert_eq!(persisted.last_revision.as_deref(), Some(REV2));
    assert_eq!(persisted.deployment_history.len(), 1);
    assert_eq!(persisted.canary_rollouts.len(), 1);

    // Restart on the same data directory
    let Harness { dir, .. } = h;
    let restarted = Harness::start(dir, REV2, REV2, |_| {}).await;

    assert_eq!(restarted.app.store.last_revision().as_deref(), Some(REV2));
    let history = restarted.app.store.history(10);
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, DeploymentStatus::Success);

    let rollout = restarted.app.canary.get("web-v2").unwrap();
    assert_eq!(rollout.status, RolloutStatus::Progressing);
    assert_eq!(rollout.current_percent, 10);

    // The rollout actor is running again
    let rollout = restarted.app.canary.pause("web-v2").await.unwrap();
    assert_eq!(rollout.status, RolloutStatus::Paused);

    // New deployment ids keep increasing
    let next = restarted
        .deploy(DeployRequest::new(TriggerSource::Manual))
        .await;
    assert!(next.id > history[0].id);
}

#[tokio::test]
async fn test_persister_writes_periodically() {
    let h = Harness::new().await;
    h.deploy(DeployRequest::new(TriggerSource::Manual)).await;

    let options = persister::Options {
        interval: Duration::from_millis(10),
    };
    let store = h.app.store.clone();
    let canary = h.app.canary.clone();
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let worker = tokio::spawn(async move {
        persister::run(
            &options,
            &store,
            &canary,
            tokio::time::sleep,
            Box::pin(async move {
                let _ = stop_rx.await;
            }),
        )
        .await;
    });

    let state_file = h.dir.path().join("data").join("state.json");
    tokio::time::timeout(Duration::from_secs(5), async {
        while !state_file.exists() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    stop_tx.send(()).unwrap();
    worker.await.unwrap();

    let raw = tokio::fs::read_to_string(&state_file).await.unwrap();
    let persisted: PersistedState = serde_json::from_str(&raw).unwrap();
    assert_eq!(persisted.deployment_history.len(), 1);
}
