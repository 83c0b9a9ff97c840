//! Command execution on a node's session.
//!
//! The autoscaler runs setup/start commands on nodes it creates. On Velda
//! there is no SSH hop: `vrun --session-id` executes directly inside the
//! session, and file sync is unnecessary because sessions share a
//! filesystem.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{FleetError, FleetResult};

/// A local->remote port forward.
pub type PortForward = (u16, u16);

/// Runs commands on one session via `vrun --session-id`.
#[derive(Debug, Clone)]
pub struct SessionExec {
    session_id: String,
    timeout: Duration,
}

impl SessionExec {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            timeout: Duration::from_secs(120),
        }
    }

    /// Set the per-command timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run a shell command inside the session, returning captured stdout.
    ///
    /// Environment variables are passed through the spawned `vrun` process;
    /// port forwards become `-L local:remote` flags.
    pub async fn run(
        &self,
        cmd: &str,
        env: &HashMap<String, String>,
        port_forwards: &[PortForward],
    ) -> FleetResult<String> {
        if cmd.is_empty() {
            return Ok(String::new());
        }

        let argv = exec_argv(&self.session_id, cmd, port_forwards);
        info!(session_id = %self.session_id, %cmd, "running command on session");

        let (program, args) = argv
            .split_first()
            .ok_or_else(|| FleetError::InvalidArgument("empty command".to_string()))?;

        let mut command = Command::new(program);
        command.args(args).stdin(Stdio::null()).envs(env);

        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| {
                FleetError::Unavailable(format!(
                    "command on session {} timed out",
                    self.session_id
                ))
            })?
            .map_err(|e| FleetError::Unavailable(format!("failed to spawn vrun: {e}")))?;

        if output.status.success() {
            debug!(session_id = %self.session_id, "command completed");
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            if stderr.to_ascii_lowercase().contains("not found") {
                Err(FleetError::NotFound(self.session_id.clone()))
            } else {
                Err(FleetError::Unavailable(format!(
                    "command exited with {}: {stderr}",
                    output.status
                )))
            }
        }
    }
}

fn exec_argv(session_id: &str, cmd: &str, port_forwards: &[PortForward]) -> Vec<String> {
    let mut argv = vec![
        "vrun".to_string(),
        "--session-id".to_string(),
        session_id.to_string(),
        "--tty=no".to_string(),
        "-q".to_string(),
    ];
    for (local, remote) in port_forwards {
        argv.push("-L".to_string());
        argv.push(format!("{local}:{remote}"));
    }
    argv.push("bash".to_string());
    argv.push("-c".to_string());
    argv.push(cmd.to_string());
    argv
}
