//! Integration tests for conveyor
//!
//! Scheduler runs end to end against in-memory collaborators, plus CLI smoke tests.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

/// Helper to create a conveyor Command
fn conveyor() -> Command {
    cargo_bin_cmd!("conveyor")
}

const CATALOG: &str = r#"
[[configuration]]
id = "core"
name = "Core"
project = "core"
build_script = "true"

[[configuration]]
id = "api"
name = "API"
project = "api"
build_script = "true"
dependencies = ["core"]

[[configuration]]
id = "web"
name = "Web"
project = "web"
build_script = "true"
dependencies = ["core"]

[[configuration]]
id = "app"
name = "Application"
project = "app"
build_script = "true"
dependencies = ["api", "web"]

[configuration.product_version]
product = "suite"
version = "2.0"
"#;

/// Helper to create a directory holding a config file and a catalog
fn create_workspace() -> TempDir {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("configurations.toml"), CATALOG).unwrap();
    fs::write(
        dir.path().join("conveyor.toml"),
        r#"
[store]
base_url = "http://127.0.0.1:9"
timeout_secs = 2
retries = 0

[logging]
filter = "warn"
"#,
    )
    .unwrap();
    dir
}

// =============================================================================
// Scheduling against in-memory collaborators
// =============================================================================

mod scheduling {
    use conveyor::catalog::MemoryCatalog;
    use conveyor::dag::{
        ExecutorContext, GraphBuilder, SchedulerConfig, SharedSubmission, Submission,
        SubmissionExecutor, SubmissionSnapshot, SubmissionStatus, TaskState, lock,
    };
    use conveyor::driver::{BuildActivity, ScriptedDriver, ScriptedOutcome};
    use conveyor::repository::naming::SHARED_IMPORTS_ID;
    use conveyor::repository::{HierarchyManager, HierarchySettings, MemoryStore};
    use conveyor_common::{
        ArtifactStatus, Configuration, ConfigurationId, ProductVersion, StoreKey, SubmissionId,
    };
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn settings() -> HierarchySettings {
        HierarchySettings::default().with_retries(0, Duration::ZERO)
    }

    async fn run(
        configurations: Vec<Configuration>,
        root: &str,
        store: Arc<MemoryStore>,
        driver: Arc<ScriptedDriver>,
        max_parallel: usize,
    ) -> (SharedSubmission, SubmissionSnapshot, Arc<MemoryCatalog>) {
        let catalog = Arc::new(MemoryCatalog::with_configurations(configurations));
        let mut submission =
            Submission::new(SubmissionId::new(), ProductVersion::new("suite", "1.0"));
        GraphBuilder::new(catalog.clone())
            .build(&root.into(), &mut submission)
            .await
            .unwrap();
        let submission = submission.into_shared();

        let context = ExecutorContext::new(store, driver, catalog.clone(), settings());
        let snapshot = SubmissionExecutor::new(
            Arc::new(context),
            SchedulerConfig::default().with_max_parallel(max_parallel),
        )
        .run(submission.clone(), CancellationToken::new())
        .await;
        (submission, snapshot, catalog)
    }

    /// Root plus four transitive dependencies, `shared` reached through two branches.
    fn five_configurations() -> Vec<Configuration> {
        vec![
            Configuration::new("base", "base"),
            Configuration::new("shared", "shared").with_dependencies(["base"]),
            Configuration::new("left", "left").with_dependencies(["shared"]),
            Configuration::new("right", "right").with_dependencies(["shared"]),
            Configuration::new("root", "root").with_dependencies(["left", "right"]),
        ]
    }

    #[tokio::test]
    async fn test_five_configurations_yield_five_tasks() {
        let store = Arc::new(MemoryStore::new());
        let driver = Arc::new(ScriptedDriver::new());
        let (submission, snapshot, catalog) =
            run(five_configurations(), "root", store, driver.clone(), 4).await;

        assert_eq!(lock(&submission).len(), 5);
        assert_eq!(snapshot.status, SubmissionStatus::Succeeded);
        assert_eq!(driver.dispatched().len(), 5);
        assert_eq!(catalog.records().len(), 5);
    }

    #[tokio::test]
    async fn test_provisioning_never_precedes_dependency_success() {
        let store = Arc::new(MemoryStore::new());
        store.set_latency(Duration::from_millis(1));
        let driver = Arc::new(
            ScriptedDriver::new()
                .with_store(store.clone())
                .with_delay(Duration::from_millis(5)),
        );
        let (submission, snapshot, _) =
            run(five_configurations(), "root", store, driver, 4).await;
        assert_eq!(snapshot.status, SubmissionStatus::Succeeded);

        let sub = lock(&submission);
        let events = sub.events();
        let sequence_of = |task, state| {
            events
                .iter()
                .find(|e| e.task == task && e.state == state)
                .map(|e| e.sequence)
                .unwrap()
        };

        assert!(events.windows(2).all(|w| w[0].sequence < w[1].sequence));
        for task in sub.tasks() {
            let provisioning = sequence_of(task.id, TaskState::WorkspaceProvisioning);
            for dep in &task.dependencies {
                assert!(sequence_of(*dep, TaskState::Success) < provisioning);
            }
        }
    }

    #[tokio::test]
    async fn test_failure_cancels_every_transitive_dependent() {
        let store = Arc::new(MemoryStore::new());
        let driver = Arc::new(ScriptedDriver::new());
        driver.set_outcome("shared", ScriptedOutcome::Fail);
        let (submission, snapshot, _) =
            run(five_configurations(), "root", store, driver.clone(), 4).await;

        assert_eq!(snapshot.status, SubmissionStatus::Failed);
        let state_of = |id: &str| snapshot.task_for(&id.into()).unwrap().state;
        assert_eq!(state_of("base"), TaskState::Success);
        assert_eq!(state_of("shared"), TaskState::FailedBuild);
        for id in ["left", "right", "root"] {
            assert_eq!(state_of(id), TaskState::Cancelled);
        }

        // None of the cancelled tasks ever reached provisioning.
        let sub = lock(&submission);
        for id in ["left", "right", "root"] {
            let task = sub.task_for_configuration(&id.into()).unwrap();
            assert!(
                sub.events()
                    .iter()
                    .filter(|e| e.task == task)
                    .all(|e| e.state != TaskState::WorkspaceProvisioning)
            );
        }
        assert_eq!(
            driver.dispatched_configurations(),
            vec![ConfigurationId::from("base"), ConfigurationId::from("shared")]
        );

        let cancelled = snapshot
            .failures
            .iter()
            .find(|f| f.configuration.as_str() == "left")
            .unwrap();
        assert!(cancelled.message.contains("shared"));
    }

    #[tokio::test]
    async fn test_concurrent_hierarchy_setup_creates_stores_once() {
        let store = Arc::new(MemoryStore::new());
        store.set_latency(Duration::from_millis(2));
        let manager = Arc::new(HierarchyManager::new(store.clone(), settings()));
        let product = ProductVersion::new("suite", "1.0");

        let mut handles = Vec::new();
        for _ in 0..4 {
            let manager = manager.clone();
            let product = product.clone();
            handles.push(tokio::spawn(async move {
                manager.setup_shared().await.unwrap();
                manager.setup_product(&product).await.unwrap()
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), "product+suite+1-0");
        }
        manager.setup_product(&product).await.unwrap();

        assert_eq!(store.create_count(&StoreKey::hosted("product+suite+1-0")), 1);
        assert_eq!(store.create_count(&StoreKey::group("product+suite+1-0")), 1);
        assert_eq!(store.create_count(&StoreKey::hosted(SHARED_IMPORTS_ID)), 1);
    }

    #[tokio::test]
    async fn test_tracking_report_is_promoted_and_recorded() {
        let store = Arc::new(MemoryStore::new());
        let driver = Arc::new(ScriptedDriver::new().with_store(store.clone()));
        driver.add_activity(
            "solo",
            BuildActivity::Download {
                origin: StoreKey::hosted(SHARED_IMPORTS_ID),
                path: "org/known/1.0/known-1.0.jar".into(),
            },
        );
        driver.add_activity(
            "solo",
            BuildActivity::Download {
                origin: StoreKey::remote("central"),
                path: "org/fresh/2.0/fresh-2.0.jar".into(),
            },
        );
        driver.add_activity(
            "solo",
            BuildActivity::Upload {
                path: "org/solo/1.0/solo-1.0.jar".into(),
            },
        );

        let (_, snapshot, catalog) = run(
            vec![Configuration::new("solo", "solo")],
            "solo",
            store.clone(),
            driver,
            1,
        )
        .await;
        assert_eq!(snapshot.status, SubmissionStatus::Succeeded);

        let promotions = store.promotions();
        assert_eq!(promotions.len(), 2);
        let imports: Vec<_> = promotions
            .iter()
            .filter(|p| p.target == StoreKey::hosted(SHARED_IMPORTS_ID))
            .collect();
        assert_eq!(imports.len(), 1);
        assert_eq!(imports[0].source, StoreKey::remote("central"));
        let uploads: Vec<_> = promotions.iter().filter(|p| p.is_whole_store()).collect();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].target, StoreKey::hosted("product+suite+1-0"));

        let record = &catalog.records()[0];
        assert_eq!(record.dependencies.len(), 2);
        assert_eq!(record.built_artifacts.len(), 1);
        assert_eq!(record.built_artifacts[0].status, ArtifactStatus::BuiltByTask);
        assert!(
            record
                .dependencies
                .iter()
                .all(|a| a.status == ArtifactStatus::ResolvedAsImport)
        );
    }

    #[tokio::test]
    async fn test_failed_upload_promotion_reports_rollback_failure() {
        let store = Arc::new(MemoryStore::new());
        store.fail_promotions_into(StoreKey::hosted("product+suite+1-0"), "checksum mismatch");
        store.fail_rollbacks("rollback refused");
        let driver = Arc::new(ScriptedDriver::new().with_store(store.clone()));
        driver.add_activity(
            "solo",
            BuildActivity::Upload {
                path: "org/solo/1.0/solo-1.0.jar".into(),
            },
        );

        let (_, snapshot, catalog) = run(
            vec![Configuration::new("solo", "solo")],
            "solo",
            store.clone(),
            driver,
            1,
        )
        .await;

        assert_eq!(snapshot.count_in(TaskState::FailedPromotion), 1);
        assert_eq!(store.rollbacks().len(), 1);
        let message = &snapshot.failures[0].message;
        assert!(message.contains("checksum mismatch"));
        assert!(message.contains("rollback refused"));
        assert!(catalog.records()[0].log_reference.is_some());
    }
}

// =============================================================================
// CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_conveyor_help() {
        conveyor()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("plan"))
            .stdout(predicate::str::contains("build"));
    }

    #[test]
    fn test_conveyor_version() {
        conveyor().arg("--version").assert().success();
    }

    #[test]
    fn test_plan_prints_waves() {
        let dir = create_workspace();

        conveyor()
            .current_dir(dir.path())
            .args(["plan", "app"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Wave 0: core"))
            .stdout(predicate::str::contains("Wave 1: api, web"))
            .stdout(predicate::str::contains("Wave 2: app"))
            .stdout(predicate::str::contains("suite 2.0"))
            .stdout(predicate::str::contains("4 task(s)"));
    }

    #[test]
    fn test_plan_unknown_configuration_fails() {
        let dir = create_workspace();

        conveyor()
            .current_dir(dir.path())
            .args(["plan", "nope"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("nope"));
    }

    #[test]
    fn test_build_with_unreachable_store_fails_workspace() {
        let dir = create_workspace();

        conveyor()
            .current_dir(dir.path())
            .args(["build", "core"])
            .assert()
            .failure()
            .stdout(predicate::str::contains("failed_workspace"));
    }

    #[test]
    fn test_records_empty() {
        let dir = create_workspace();

        conveyor()
            .current_dir(dir.path())
            .args(["records", "core"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No build records found"));
    }
}

mod config_commands {
    use super::*;

    #[test]
    fn test_config_show_defaults() {
        let dir = TempDir::new().unwrap();

        conveyor()
            .current_dir(dir.path())
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("using defaults"))
            .stdout(predicate::str::contains("max_parallel = 4"));
    }

    #[test]
    fn test_config_init_then_validate() {
        let dir = TempDir::new().unwrap();

        conveyor()
            .current_dir(dir.path())
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Created"));
        assert!(dir.path().join("conveyor.toml").exists());

        conveyor()
            .current_dir(dir.path())
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration is valid"));
    }

    #[test]
    fn test_config_validate_reports_warnings() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("conveyor.toml"),
            "[scheduler]\nmax_parallel = 0\n",
        )
        .unwrap();

        conveyor()
            .current_dir(dir.path())
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("max_parallel"));
    }

    #[test]
    fn test_env_override_is_shown() {
        let dir = TempDir::new().unwrap();

        conveyor()
            .current_dir(dir.path())
            .env("CONVEYOR_MAX_PARALLEL", "7")
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("max_parallel = 7"));
    }
}
