use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info};

use super::state::DeploymentEnvironment;
use crate::error::{AppError, Result};

/// Puts a candidate build onto an environment.
#[async_trait]
pub trait Deployer: Send + Sync {
    async fn deploy(&self, build: &str, environment: DeploymentEnvironment) -> Result<()>;
}

/// Runs a shell command; exit status 0 means the deploy succeeded.
/// The build and environment are passed as `DEPLOY_BUILD` and `DEPLOY_ENVIRONMENT`.
pub struct CommandDeployer {
    command: String,
    shell: String,
    timeout: Duration,
}

impl CommandDeployer {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            shell: "sh".to_string(),
            timeout,
        }
    }

    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }
}

#[async_trait]
impl Deployer for CommandDeployer {
    async fn deploy(&self, build: &str, environment: DeploymentEnvironment) -> Result<()> {
        info!(build = build, environment = %environment, "🚀 Running deploy command");

        let mut cmd = Command::new(&self.shell);
        cmd.args(["-c", &self.command])
            .env("DEPLOY_BUILD", build)
            .env("DEPLOY_ENVIRONMENT", environment.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| AppError::Timeout(self.timeout.as_millis() as u64))?
            .map_err(|e| AppError::DeploymentFailed(format!("Failed to spawn deploy command: {}", e)))?;

        debug!(
            stdout = %String::from_utf8_lossy(&output.stdout).trim_end(),
            "Deploy command output"
        );

        if !output.status.success() {
            return Err(AppError::DeploymentFailed(format!(
                "deploy command exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        info!(build = build, environment = %environment, "✅ Deploy command succeeded");
        Ok(())
    }
}

/// For environments deployed out of band.
pub struct NoopDeployer;

#[async_trait]
impl Deployer for NoopDeployer {
    async fn deploy(&self, build: &str, environment: DeploymentEnvironment) -> Result<()> {
        info!(build = build, environment = %environment, "No deploy command configured, assuming deployed");
        Ok(())
    }
}
