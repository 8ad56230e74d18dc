//! Podman test sandbox
//!
//! Runs a project's test command in a throwaway container:
//! - Checking podman availability at startup
//! - Mounting the checkout at /workspace with resource limits
//! - Capturing exit code and output
//! - Removing the container even when the call is abandoned

use aidev_core::domain::run::TestReport;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::process::Command as StdCommand;
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::error::{CollabResult, CollaboratorError};
use crate::config::ProjectConfig;

/// Bytes of test output kept in a report
const MAX_OUTPUT: usize = 8_000;

/// Exit code podman uses for its own failures (image pull, runtime)
const PODMAN_ERROR_EXIT: i32 = 125;

/// Checks if podman is installed and available
pub fn check_podman_available() -> Result<()> {
    let output = StdCommand::new("podman")
        .arg("--version")
        .output()
        .context("Failed to execute 'podman --version'. Is podman installed?")?;

    if !output.status.success() {
        anyhow::bail!("Podman is not working correctly");
    }

    let version = String::from_utf8_lossy(&output.stdout);
    info!("Podman is available: {}", version.trim());

    Ok(())
}

/// Repository trait for the isolated test environment
#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    /// Runs the project's tests against the current working tree
    async fn run_tests(&self, project: &ProjectConfig, run_id: Uuid) -> CollabResult<TestReport>;
}

/// Podman implementation of SandboxRuntime
#[derive(Default)]
pub struct PodmanSandbox;

impl PodmanSandbox {
    pub fn new() -> Self {
        Self
    }
}

/// Removes the named container if the call is abandoned
///
/// A timed-out test call drops the future mid-flight; the podman client is
/// killed but the container would keep running without this. Once podman
/// has exited, `--rm` has already removed the container and the guard is
/// disarmed.
struct ContainerGuard {
    name: Option<String>,
}

impl ContainerGuard {
    fn new(name: &str) -> Self {
        Self {
            name: Some(name.to_string()),
        }
    }

    fn disarm(&mut self) {
        self.name = None;
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        if let Some(name) = self.name.take() {
            if spawn_removal(name.clone()).is_none() {
                warn!("No runtime to remove abandoned container {}", name);
            }
        }
    }
}

/// Runs `podman rm -f` on a runtime task; `None` outside a runtime
fn spawn_removal(name: String) -> Option<tokio::task::JoinHandle<()>> {
    let handle = tokio::runtime::Handle::try_current().ok()?;
    Some(handle.spawn(async move {
        match Command::new("podman").args(["rm", "-f", &name]).output().await {
            Ok(output) if output.status.success() => {
                debug!("Container {} removed", name);
            }
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                if !stderr.contains("no such container") {
                    warn!("Failed to remove container {}: {}", name, stderr.trim());
                }
            }
            Err(e) => warn!("Failed to remove container {}: {}", name, e),
        }
    }))
}

fn container_name(run_id: Uuid) -> String {
    format!("aidev-test-{}", run_id)
}

/// Arguments for `podman run`
fn run_args(project: &ProjectConfig, image: &str, command: &str, name: &str) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "--rm".to_string(),
        "--name".to_string(),
        name.to_string(),
    ];
    if let Some(cpus) = &project.cpu_limit {
        args.push("--cpus".to_string());
        args.push(cpus.clone());
    }
    if let Some(memory) = &project.memory_limit {
        args.push("--memory".to_string());
        args.push(memory.clone());
    }
    args.extend([
        "-v".to_string(),
        format!("{}:/workspace", project.path.display()),
        "-w".to_string(),
        "/workspace".to_string(),
        // Override any image entrypoint
        "--entrypoint".to_string(),
        "/bin/sh".to_string(),
        image.to_string(),
        "-c".to_string(),
        command.to_string(),
    ]);
    args
}

/// Keeps the tail of `output`, where test failures usually are
fn truncate_output(output: &str) -> String {
    if output.len() <= MAX_OUTPUT {
        return output.to_string();
    }
    let mut start = output.len() - MAX_OUTPUT;
    while !output.is_char_boundary(start) {
        start += 1;
    }
    format!("[... truncated ...]\n{}", &output[start..])
}

#[async_trait]
impl SandboxRuntime for PodmanSandbox {
    async fn run_tests(&self, project: &ProjectConfig, run_id: Uuid) -> CollabResult<TestReport> {
        let (Some(image), Some(command)) = (&project.test_image, &project.test_command) else {
            debug!("Project {} has no test command; nothing to run", project.name);
            return Ok(TestReport {
                passed: true,
                exit_code: 0,
                output: String::new(),
            });
        };

        let name = container_name(run_id);
        let mut guard = ContainerGuard::new(&name);
        info!("Running tests for {} in {} ({})", project.name, image, name);

        let output = Command::new("podman")
            .args(run_args(project, image, command, &name))
            .kill_on_drop(true)
            .output()
            .await;
        guard.disarm();
        let output = output.map_err(|e| {
            CollaboratorError::Persistent(format!("Failed to execute podman run: {}", e))
        })?;

        let exit_code = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if exit_code == PODMAN_ERROR_EXIT {
            return Err(CollaboratorError::Transient(format!(
                "podman could not start the test container: {}",
                stderr.trim()
            )));
        }

        let combined = format!("{}{}", stdout, stderr);
        debug!(
            "Tests finished: exit_code={}, output_len={}",
            exit_code,
            combined.len()
        );

        Ok(TestReport {
            passed: output.status.success(),
            exit_code,
            output: truncate_output(&combined),
        })
    }
}
