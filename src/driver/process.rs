//! Local process build driver.
//!
//! Runs the configuration's build script through a shell with the workspace URLs
//! exported as environment variables. Output goes to one log file per task; the log
//! path is the build's log reference. This is not a sandbox.

use async_trait::async_trait;
use conveyor_common::{
    BuildDriver, CompletedBuild, DispatchRequest, DriverError, RunningBuild,
};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info, warn};

pub struct ProcessDriver {
    shell: String,
    work_dir: PathBuf,
    log_dir: PathBuf,
}

impl ProcessDriver {
    pub fn new(shell: impl Into<String>, work_dir: &Path, log_dir: &Path) -> Self {
        Self {
            shell: shell.into(),
            work_dir: work_dir.to_path_buf(),
            log_dir: log_dir.to_path_buf(),
        }
    }

    fn log_path(&self, request: &DispatchRequest) -> PathBuf {
        let name = crate::repository::naming::safe_url_part(request.configuration.id.as_str());
        self.log_dir.join(format!("{}-{}.log", name, request.task))
    }
}

#[async_trait]
impl BuildDriver for ProcessDriver {
    async fn dispatch(&self, request: DispatchRequest) -> Result<RunningBuild, DriverError> {
        let script = request.configuration.build_script.as_deref().ok_or_else(|| {
            DriverError::Dispatch(format!(
                "configuration {} has no build script",
                request.configuration.id
            ))
        })?;

        tokio::fs::create_dir_all(&self.log_dir).await.map_err(|e| {
            DriverError::Dispatch(format!(
                "failed to create log directory {}: {}",
                self.log_dir.display(),
                e
            ))
        })?;
        let log_path = self.log_path(&request);
        let log = tokio::fs::File::create(&log_path)
            .await
            .map_err(|e| {
                DriverError::Dispatch(format!("failed to create {}: {}", log_path.display(), e))
            })?
            .into_std()
            .await;
        let log_err = log
            .try_clone()
            .map_err(|e| DriverError::Dispatch(format!("failed to open log: {}", e)))?;

        let connection = &request.repository.connection;
        let mut child = Command::new(&self.shell)
            .arg("-c")
            .arg(script)
            .current_dir(&self.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .env("CONVEYOR_TASK_ID", request.task.to_string())
            .env("CONVEYOR_CONFIGURATION_ID", request.configuration.id.as_str())
            .env("CONVEYOR_TRACKING_URL", &connection.tracking_url)
            .env("CONVEYOR_DEPENDENCY_URL", &connection.dependency_url)
            .env("CONVEYOR_TOOLCHAIN_URL", &connection.toolchain_url)
            .env("CONVEYOR_DEPLOY_URL", &connection.deploy_url)
            .env("CONVEYOR_BUILD_STORE", &request.repository.build_id)
            .env("CONVEYOR_PRODUCT_STORE", &request.repository.product_id)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                DriverError::Dispatch(format!("failed to spawn '{}': {}", self.shell, e))
            })?;

        info!(
            task = %request.task,
            configuration = %request.configuration.id,
            log = %log_path.display(),
            "build process started"
        );

        let (sender, running) = RunningBuild::pending();
        let log_reference = log_path.display().to_string();
        let task = request.task;

        tokio::spawn(async move {
            let cancel = sender.cancellation();
            let outcome = tokio::select! {
                status = child.wait() => match status {
                    Ok(status) if status.success() => Ok(CompletedBuild::success(log_reference)),
                    Ok(status) => {
                        debug!(task = %task, code = ?status.code(), "build process failed");
                        Ok(CompletedBuild::failed(log_reference))
                    }
                    Err(e) => Err(DriverError::Transport(e.to_string())),
                },
                _ = cancel.cancelled() => {
                    if let Err(e) = child.kill().await {
                        warn!(task = %task, error = %e, "failed to kill build process");
                    }
                    Ok(CompletedBuild::failed(log_reference))
                }
            };
            sender.complete(outcome);
        });

        Ok(running)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_common::{
        Configuration, ConnectionInfo, DriverStatus, RepositoryConfiguration, TaskId,
    };
    use std::time::Duration;
    use tempfile::tempdir;

    fn request(script: Option<&str>) -> DispatchRequest {
        let mut configuration = Configuration::new("app", "proj");
        configuration.build_script = script.map(str::to_string);
        DispatchRequest {
            task: TaskId::new(),
            configuration,
            repository: RepositoryConfiguration {
                build_id: "build+proj+1".into(),
                product_id: "product+p+1".into(),
                connection: ConnectionInfo::from_tracking_url("http://store/track"),
            },
        }
    }

    #[tokio::test]
    async fn test_successful_script_writes_log() {
        let dir = tempdir().unwrap();
        let driver = ProcessDriver::new("sh", dir.path(), &dir.path().join("logs"));

        let mut running = driver
            .dispatch(request(Some("echo building $CONVEYOR_BUILD_STORE")))
            .await
            .unwrap();
        let done = running.completion().await.unwrap();

        assert_eq!(done.status, DriverStatus::Success);
        let log = std::fs::read_to_string(&done.log_reference).unwrap();
        assert!(log.contains("building build+proj+1"));
    }

    #[tokio::test]
    async fn test_failing_script_reports_failure() {
        let dir = tempdir().unwrap();
        let driver = ProcessDriver::new("sh", dir.path(), dir.path());

        let mut running = driver.dispatch(request(Some("exit 3"))).await.unwrap();
        let done = running.completion().await.unwrap();
        assert_eq!(done.status, DriverStatus::Failed);
    }

    #[tokio::test]
    async fn test_missing_script_is_a_dispatch_error() {
        let dir = tempdir().unwrap();
        let driver = ProcessDriver::new("sh", dir.path(), dir.path());

        let err = driver.dispatch(request(None)).await.err().unwrap();
        assert!(matches!(err, DriverError::Dispatch(msg) if msg.contains("no build script")));
    }

    #[tokio::test]
    async fn test_cancel_kills_process() {
        let dir = tempdir().unwrap();
        let driver = ProcessDriver::new("sh", dir.path(), dir.path());

        let mut running = driver.dispatch(request(Some("sleep 30"))).await.unwrap();
        running.cancel();
        let done = tokio::time::timeout(Duration::from_secs(5), running.completion())
            .await
            .expect("cancelled build should finish promptly")
            .unwrap();
        assert_eq!(done.status, DriverStatus::Failed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_log_captures_stdout_and_stderr() {
        let dir = tempdir().unwrap();
        let driver = ProcessDriver::new("sh", dir.path(), &dir.path().join("nested/logs"));

        let mut running = driver
            .dispatch(request(Some("echo out; echo err 1>&2")))
            .await
            .unwrap();
        let done = running.completion().await.unwrap();

        let log = tokio::fs::read_to_string(&done.log_reference).await.unwrap();
        assert!(log.contains("out"));
        assert!(log.contains("err"));
    }
}
