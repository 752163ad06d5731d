//! Concurrent lifecycle requests
//!
//! Runs on the multi-threaded runtime so racing requests really overlap.

mod common;

use common::{hardware, logic, probe_manager, Journal};
use labctl::{ModuleError, ModuleState};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_double_activation_runs_hook_once() {
    let journal = Journal::default();
    let manager = Arc::new(probe_manager(
        vec![hardware("laser").with_option("delay_ms", json!(100))],
        &journal,
    ));

    let first = tokio::spawn({
        let manager = manager.clone();
        async move { manager.activate("laser").await }
    });
    let second = tokio::spawn({
        let manager = manager.clone();
        async move { manager.activate("laser").await }
    });

    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();
    assert_eq!(journal.count("activate laser"), 1);
    assert_eq!(manager.state("laser").unwrap(), ModuleState::Activated);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_second_caller_observes_failed_activation() {
    let journal = Journal::default();
    let manager = Arc::new(probe_manager(
        vec![hardware("laser")
            .with_option("delay_ms", json!(100))
            .with_option("fail_activate", json!(true))],
        &journal,
    ));

    let requests: Vec<_> = (0..2)
        .map(|_| {
            let manager = manager.clone();
            tokio::spawn(async move { manager.activate("laser").await })
        })
        .collect();
    let results: Vec<_> = futures::future::join_all(requests)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    assert_eq!(journal.count("activate laser"), 1);
    let activation_errors = results
        .iter()
        .filter(|r| matches!(r, Err(ModuleError::Activation { .. })))
        .count();
    let waiting_errors = results
        .iter()
        .filter(|r| matches!(r, Err(ModuleError::InErrorState { .. })))
        .count();
    assert_eq!((activation_errors, waiting_errors), (1, 1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unrelated_modules_activate_in_parallel() {
    let journal = Journal::default();
    let manager = Arc::new(probe_manager(
        vec![
            hardware("laser").with_option("delay_ms", json!(300)),
            hardware("microwave").with_option("delay_ms", json!(300)),
        ],
        &journal,
    ));

    let started = Instant::now();
    let (laser, microwave) = tokio::join!(
        tokio::spawn({
            let manager = manager.clone();
            async move { manager.activate("laser").await }
        }),
        tokio::spawn({
            let manager = manager.clone();
            async move { manager.activate("microwave").await }
        }),
    );
    laser.unwrap().unwrap();
    microwave.unwrap().unwrap();

    assert!(
        started.elapsed() < Duration::from_millis(550),
        "activations were serialised: {:?}",
        started.elapsed()
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_dependency_cannot_be_removed_under_activating_dependent() {
    let journal = Journal::default();
    let manager = Arc::new(probe_manager(
        vec![
            hardware("laser"),
            logic("scan_logic")
                .with_connector("hardware", "laser")
                .with_option("delay_ms", json!(200)),
        ],
        &journal,
    ));
    manager.activate("laser").await.unwrap();

    let activation = tokio::spawn({
        let manager = manager.clone();
        async move { manager.activate("scan_logic").await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(manager.state("scan_logic").unwrap(), ModuleState::Activating);

    match manager.deactivate("laser", false).await {
        Err(ModuleError::DependentsStillActive { dependents, .. }) => {
            assert_eq!(dependents, vec!["scan_logic"]);
        }
        other => panic!("unexpected result: {other:?}"),
    }

    activation.await.unwrap().unwrap();
    assert_eq!(manager.active_modules(), vec!["laser", "scan_logic"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_deactivate_waits_for_running_activation() {
    let journal = Journal::default();
    let manager = Arc::new(probe_manager(
        vec![hardware("laser").with_option("delay_ms", json!(100))],
        &journal,
    ));

    let activation = tokio::spawn({
        let manager = manager.clone();
        async move { manager.activate("laser").await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Queued behind the activation, then sees Activated and tears down.
    manager.deactivate("laser", false).await.unwrap();
    activation.await.unwrap().unwrap();

    assert_eq!(journal.entries(), vec!["activate laser", "deactivate laser"]);
    assert_eq!(manager.state("laser").unwrap(), ModuleState::Deactivated);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_timed_out_activation_still_completes() {
    let journal = Journal::default();
    let manager = probe_manager(
        vec![hardware("laser").with_option("delay_ms", json!(200))],
        &journal,
    );

    let abandoned =
        tokio::time::timeout(Duration::from_millis(50), manager.activate("laser")).await;
    assert!(abandoned.is_err());

    // Waits for the abandoned transition, then finds the module up.
    manager.activate("laser").await.unwrap();
    assert_eq!(manager.state("laser").unwrap(), ModuleState::Activated);
    assert_eq!(journal.count("activate laser"), 1);

    manager.deactivate("laser", false).await.unwrap();
    assert_eq!(manager.state("laser").unwrap(), ModuleState::Deactivated);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_timed_out_failing_activation_ends_in_error_state() {
    let journal = Journal::default();
    let manager = probe_manager(
        vec![hardware("laser")
            .with_option("delay_ms", json!(200))
            .with_option("fail_activate", json!(true))],
        &journal,
    );

    let abandoned =
        tokio::time::timeout(Duration::from_millis(50), manager.activate("laser")).await;
    assert!(abandoned.is_err());

    assert!(matches!(
        manager.activate("laser").await,
        Err(ModuleError::InErrorState { .. })
    ));
    assert_eq!(manager.state("laser").unwrap(), ModuleState::ErrorState);

    manager.reset("laser").await.unwrap();
    assert_eq!(manager.state("laser").unwrap(), ModuleState::Deactivated);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_aborted_deactivation_still_completes() {
    let journal = Journal::default();
    let manager = Arc::new(probe_manager(
        vec![hardware("laser").with_option("deactivate_delay_ms", json!(200))],
        &journal,
    ));
    manager.activate("laser").await.unwrap();

    let task = tokio::spawn({
        let manager = manager.clone();
        async move { manager.deactivate("laser", false).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    task.abort();
    assert!(task.await.unwrap_err().is_cancelled());

    // A second request queues behind the running teardown.
    manager.deactivate("laser", false).await.unwrap();
    assert_eq!(manager.state("laser").unwrap(), ModuleState::Deactivated);
    assert_eq!(journal.count("deactivate laser"), 1);

    manager.activate("laser").await.unwrap();
    assert_eq!(journal.count("activate laser"), 2);
}
