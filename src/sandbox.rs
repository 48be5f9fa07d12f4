//! Process-backed sandbox executor.
//!
//! Runs an allow-listed interpreter with the module source piped to stdin.
//! Exit status 0 is a successful pass; any other exit is a failed pass with
//! stderr as the detail. Failing to spawn, or running past the timeout, is a
//! judge failure rather than a failed pass.

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::SandboxConfig;
use crate::identity::ModuleId;
use crate::judges::{JudgeError, SandboxExecutor, SandboxReport};

/// Longest stderr excerpt kept in a failure detail.
const MAX_DETAIL_CHARS: usize = 2048;

pub struct ProcessSandbox {
    command: String,
    args: Vec<String>,
    timeout: Duration,
}

impl ProcessSandbox {
    /// Build from config. The command must be on the config's allow-list.
    pub fn from_config(config: &SandboxConfig) -> Result<Self, String> {
        if !config.allowed_commands.contains(&config.command) {
            return Err(format!(
                "sandbox command '{}' not in allow-list: {:?}",
                config.command, config.allowed_commands
            ));
        }
        for arg in &config.args {
            if arg.contains(';') || arg.contains('&') || arg.contains('|') || arg.contains('`') {
                return Err(format!("invalid characters in sandbox argument: {}", arg));
            }
        }
        Ok(Self {
            command: config.command.clone(),
            args: config.args.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        })
    }

    async fn run(&self, source: &[u8]) -> Result<SandboxReport, JudgeError> {
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| JudgeError::Failed(format!("failed to spawn {}: {}", self.command, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            // A module that exits without reading all of stdin surfaces here as
            // a broken pipe; its exit status still decides the pass.
            if let Err(e) = stdin.write_all(source).await {
                debug!(error = %e, "sandbox stdin closed early");
            }
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| JudgeError::Failed(format!("sandbox wait failed: {}", e)))?;

        if output.status.success() {
            Ok(SandboxReport::success("exit 0"))
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let excerpt: String = stderr.trim().chars().take(MAX_DETAIL_CHARS).collect();
            let code = output
                .status
                .code()
                .map_or_else(|| "signal".to_string(), |c| c.to_string());
            Ok(SandboxReport::failure(format!("exit {}: {}", code, excerpt)))
        }
    }
}

#[async_trait]
impl SandboxExecutor for ProcessSandbox {
    async fn execute(
        &self,
        module_id: &ModuleId,
        source: &[u8],
    ) -> Result<SandboxReport, JudgeError> {
        debug!(module_id = %module_id, command = %self.command, "sandbox pass");
        match tokio::time::timeout(self.timeout, self.run(source)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(module_id = %module_id, timeout = ?self.timeout, "sandbox pass timed out");
                Err(JudgeError::Timeout(self.timeout))
            }
        }
    }
}
