use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

use super::{AgentEvent, AgentRuntime, Emit, TurnRequest, TurnResult};
use crate::config::ALLOWLIST_ENV;
use crate::errors::RuntimeError;
use crate::sandbox;

/// Runs a local agent binary: stdin receives one JSON `TurnRequest` frame,
/// stdout is read as NDJSON events. Lines that fail to decode are aggregated
/// into the free-form turn output.
///
/// When `sandbox_home` is set and bubblewrap is available, the child runs
/// inside a minimal namespace sandbox where only the requesting team's
/// directory under the home is writable and the rest of the home, including
/// `protected/`, is read-only.
#[derive(Debug, Clone, Default)]
pub struct SubprocessRuntime {
    pub command: String,
    pub args: Vec<String>,
    /// Wall-clock limit for one turn; None = rely on caller cancellation.
    pub timeout: Option<Duration>,
    pub sandbox_home: Option<PathBuf>,
}

#[async_trait]
impl AgentRuntime for SubprocessRuntime {
    fn name(&self) -> &'static str {
        "subprocess"
    }

    async fn run_turn(&self, req: TurnRequest, emit: Emit<'_>) -> Result<TurnResult, RuntimeError> {
        if self.command.is_empty() {
            return Err(RuntimeError::Other(anyhow::anyhow!(
                "subprocess command is required"
            )));
        }

        let mut cmd = match &self.sandbox_home {
            Some(home) => {
                let team_dir =
                    (!req.team.is_empty()).then(|| crate::memory::team_dir(home, &req.team));
                sandbox::wrap_command(home, team_dir.as_deref(), &self.command, &self.args)
            }
            None => {
                let mut c = Command::new(&self.command);
                c.args(&self.args);
                c
            }
        };
        if !req.network_allowlist.is_empty() {
            cmd.env(ALLOWLIST_ENV, req.network_allowlist.join(","));
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(RuntimeError::Spawn)?;

        let req_json = serde_json::to_string(&req)
            .map_err(|e| RuntimeError::Other(anyhow::anyhow!("encode turn request: {}", e)))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(format!("{}\n", req_json).as_bytes())
                .await
                .map_err(|e| RuntimeError::Stream(e.to_string()))?;
            // Closing stdin signals the agent that the request is complete.
            drop(stdin);
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RuntimeError::Stream("child stdout unavailable".to_string()))?;

        let turn = drain_events(stdout, emit);
        let output = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, turn).await {
                Ok(output) => output?,
                Err(_) => {
                    let _ = child.start_kill();
                    return Err(RuntimeError::Timeout(limit));
                }
            },
            None => turn.await?,
        };

        let status = child
            .wait()
            .await
            .map_err(|e| RuntimeError::Stream(e.to_string()))?;
        if !status.success() && output.is_empty() {
            return Err(RuntimeError::NoUsableOutput {
                code: status.code(),
            });
        }
        Ok(TurnResult { output })
    }
}

/// Read NDJSON events until EOF. Decodable lines are emitted; the rest become
/// the turn's free-form output.
async fn drain_events(
    stdout: tokio::process::ChildStdout,
    emit: Emit<'_>,
) -> Result<String, RuntimeError> {
    let mut lines = BufReader::new(stdout).lines();
    let mut output = String::new();
    loop {
        let line = lines
            .next_line()
            .await
            .map_err(|e| RuntimeError::Stream(e.to_string()))?;
        let Some(line) = line else { break };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<AgentEvent>(line) {
            Ok(mut ev) => {
                ev.ensure_timestamp();
                emit(ev);
            }
            Err(_) => {
                output.push_str(line);
                output.push('\n');
            }
        }
    }
    Ok(output.trim().to_string())
}
