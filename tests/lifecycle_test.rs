//! Lifecycle integration tests
//!
//! Drives probe modules through activation chains, forced cascades, reloads
//! and error recovery, checking both the resulting states and the order in
//! which hooks actually ran.

mod common;

use common::{gui, hardware, logic, probe, probe_manager, Journal};
use labctl::{ModuleError, ModuleState};

fn laser_and_scan(journal: &Journal) -> labctl::ModuleManager {
    probe_manager(
        vec![
            hardware("laser"),
            logic("scan_logic").with_connector("hardware", "laser"),
        ],
        journal,
    )
}

#[tokio::test]
async fn test_activation_chain_runs_dependencies_first() {
    let journal = Journal::default();
    let manager = laser_and_scan(&journal);

    manager.activate("scan_logic").await.unwrap();

    assert_eq!(journal.entries(), vec!["activate laser", "activate scan_logic"]);
    assert_eq!(manager.state("laser").unwrap(), ModuleState::Activated);
    assert_eq!(manager.state("scan_logic").unwrap(), ModuleState::Activated);
    assert!(probe(&manager, "scan_logic").connectors_alive());
}

#[tokio::test]
async fn test_deactivate_refuses_while_dependent_is_live() {
    let journal = Journal::default();
    let manager = laser_and_scan(&journal);
    manager.activate("scan_logic").await.unwrap();
    journal.clear();

    let err = manager.deactivate("laser", false).await.unwrap_err();
    match err {
        ModuleError::DependentsStillActive { module, dependents } => {
            assert_eq!(module, "laser");
            assert_eq!(dependents, vec!["scan_logic"]);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(journal.entries().is_empty());
    assert_eq!(manager.state("laser").unwrap(), ModuleState::Activated);

    manager.deactivate("laser", true).await.unwrap();
    assert_eq!(
        journal.entries(),
        vec!["deactivate scan_logic", "deactivate laser"]
    );
    assert_eq!(manager.state("laser").unwrap(), ModuleState::Deactivated);
    assert_eq!(manager.state("scan_logic").unwrap(), ModuleState::Deactivated);
    assert!(manager.active_modules().is_empty());
}

#[tokio::test]
async fn test_activating_with_active_dependencies_only_runs_target_hook() {
    let journal = Journal::default();
    let manager = laser_and_scan(&journal);
    manager.activate("laser").await.unwrap();
    journal.clear();

    manager.activate("scan_logic").await.unwrap();
    assert_eq!(journal.entries(), vec!["activate scan_logic"]);

    // Already active: nothing runs at all.
    manager.activate("scan_logic").await.unwrap();
    assert_eq!(journal.count("activate scan_logic"), 1);
}

#[tokio::test]
async fn test_failed_dependency_stops_the_chain() {
    let journal = Journal::default();
    let manager = probe_manager(
        vec![
            hardware("laser").with_option("fail_activate", serde_json::json!(true)),
            logic("scan_logic").with_connector("hardware", "laser"),
        ],
        &journal,
    );

    let err = manager.activate("scan_logic").await.unwrap_err();
    assert!(matches!(&err, ModuleError::Activation { module, .. } if module == "laser"));
    assert!(err.to_string().contains("could not open its device"));

    assert_eq!(manager.state("laser").unwrap(), ModuleState::ErrorState);
    assert_eq!(manager.state("scan_logic").unwrap(), ModuleState::Deactivated);
    assert_eq!(journal.count("activate scan_logic"), 0);
}

#[tokio::test]
async fn test_partial_failure_keeps_activated_dependencies() {
    let journal = Journal::default();
    let manager = probe_manager(
        vec![
            hardware("stage"),
            hardware("camera").with_option("fail_activate", serde_json::json!(true)),
            logic("imaging")
                .with_connector("hardware", "stage")
                .with_connector("auxiliary", "camera"),
        ],
        &journal,
    );

    assert!(manager.activate("imaging").await.is_err());
    assert_eq!(manager.state("stage").unwrap(), ModuleState::Activated);
    assert_eq!(manager.state("camera").unwrap(), ModuleState::ErrorState);
    assert_eq!(manager.state("imaging").unwrap(), ModuleState::Deactivated);
    assert_eq!(manager.active_modules(), vec!["stage"]);

    let info = manager.module_info("camera").unwrap();
    assert!(info.last_error.unwrap().contains("could not open its device"));
}

#[tokio::test]
async fn test_panicking_hook_becomes_activation_error() {
    let journal = Journal::default();
    let manager = probe_manager(
        vec![hardware("laser").with_option("panic_activate", serde_json::json!(true))],
        &journal,
    );

    let err = manager.activate("laser").await.unwrap_err();
    assert!(matches!(err, ModuleError::Activation { .. }));
    assert!(err.to_string().contains("panicked"));
    assert_eq!(manager.state("laser").unwrap(), ModuleState::ErrorState);
    assert!(manager.instance("laser").is_none());
}

#[tokio::test]
async fn test_factory_failure_names_the_class() {
    let journal = Journal::default();
    let manager = probe_manager(
        vec![hardware("laser").with_option("fail_create", serde_json::json!(true))],
        &journal,
    );

    let err = manager.activate("laser").await.unwrap_err();
    let message = err.to_string();
    assert!(message.contains("test.hardware"), "{message}");
    assert!(message.contains("refused to be created"), "{message}");
    assert!(journal.entries().is_empty());
}

#[tokio::test]
async fn test_reset_is_the_way_out_of_error_state() {
    let journal = Journal::default();
    let manager = probe_manager(
        vec![hardware("laser").with_option("fail_deactivate", serde_json::json!(true))],
        &journal,
    );
    manager.activate("laser").await.unwrap();

    let err = manager.deactivate("laser", false).await.unwrap_err();
    assert!(matches!(err, ModuleError::Deactivation { .. }));
    assert_eq!(manager.state("laser").unwrap(), ModuleState::ErrorState);

    assert!(matches!(
        manager.activate("laser").await,
        Err(ModuleError::InErrorState { .. })
    ));
    assert!(matches!(
        manager.deactivate("laser", false).await,
        Err(ModuleError::InErrorState { .. })
    ));

    manager.reset("laser").await.unwrap();
    assert_eq!(manager.state("laser").unwrap(), ModuleState::Deactivated);
    assert!(manager.module_info("laser").unwrap().last_error.is_none());
}

#[tokio::test]
async fn test_reset_of_live_module_cascades() {
    let journal = Journal::default();
    let manager = laser_and_scan(&journal);
    manager.activate("scan_logic").await.unwrap();
    journal.clear();

    manager.reset("laser").await.unwrap();
    assert_eq!(
        journal.entries(),
        vec!["deactivate scan_logic", "deactivate laser"]
    );
    assert!(manager.active_modules().is_empty());
}

#[tokio::test]
async fn test_reload_reactivates_cascaded_dependents_in_order() {
    let journal = Journal::default();
    let manager = probe_manager(
        vec![
            hardware("laser"),
            logic("scan_logic").with_connector("hardware", "laser"),
            logic("fit_logic").with_connector("logic", "scan_logic"),
            gui("scan_gui").with_connector("logic", "fit_logic"),
        ],
        &journal,
    );
    manager.activate("scan_gui").await.unwrap();
    let old_laser = manager.instance("laser").unwrap();
    journal.clear();

    let report = manager.reload("laser", true).await.unwrap();

    assert_eq!(report.module, "laser");
    assert_eq!(
        report.reactivated,
        vec!["laser", "scan_logic", "fit_logic", "scan_gui"]
    );
    assert_eq!(
        journal.entries(),
        vec![
            "deactivate scan_gui",
            "deactivate fit_logic",
            "deactivate scan_logic",
            "deactivate laser",
            "activate laser",
            "activate scan_logic",
            "activate fit_logic",
            "activate scan_gui",
        ]
    );
    let new_laser = manager.instance("laser").unwrap();
    assert!(!std::sync::Arc::ptr_eq(&old_laser, &new_laser));
    assert!(probe(&manager, "scan_logic").connectors_alive());
}

#[tokio::test]
async fn test_reload_without_force_refuses_live_dependents() {
    let journal = Journal::default();
    let manager = laser_and_scan(&journal);
    manager.activate("scan_logic").await.unwrap();

    assert!(matches!(
        manager.reload("laser", false).await,
        Err(ModuleError::DependentsStillActive { .. })
    ));
    assert_eq!(manager.state("laser").unwrap(), ModuleState::Activated);
}

#[tokio::test]
async fn test_deactivate_all_tears_down_dependents_first() {
    let journal = Journal::default();
    let manager = probe_manager(
        vec![
            hardware("laser"),
            hardware("microwave"),
            logic("scan_logic")
                .with_connector("hardware", "laser")
                .with_connector("auxiliary", "microwave"),
        ],
        &journal,
    );
    manager.activate("scan_logic").await.unwrap();
    journal.clear();

    manager.deactivate_all().await.unwrap();

    let scan = journal.position("deactivate scan_logic").unwrap();
    assert!(scan < journal.position("deactivate laser").unwrap());
    assert!(scan < journal.position("deactivate microwave").unwrap());
    assert!(manager.active_modules().is_empty());
}

#[tokio::test]
async fn test_deactivate_all_reports_every_failure() {
    let journal = Journal::default();
    let manager = probe_manager(
        vec![
            hardware("laser").with_option("fail_deactivate", serde_json::json!(true)),
            hardware("microwave"),
        ],
        &journal,
    );
    manager.activate("laser").await.unwrap();
    manager.activate("microwave").await.unwrap();

    match manager.deactivate_all().await {
        Err(ModuleError::ShutdownFailed(failures)) => {
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].module(), Some("laser"));
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(manager.state("microwave").unwrap(), ModuleState::Deactivated);
}

#[tokio::test]
async fn test_unknown_module_is_rejected() {
    let journal = Journal::default();
    let manager = laser_and_scan(&journal);
    assert!(matches!(
        manager.activate("spectrometer").await,
        Err(ModuleError::UnknownModule(name)) if name == "spectrometer"
    ));
    assert!(manager.state("spectrometer").is_err());
}
