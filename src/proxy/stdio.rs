//! stdio transport — subprocess pipe interception.
//!
//! In stdio mode the upstream server runs as a child process and the
//! firewall sits between the agent's pipes and the child's:
//!
//! ```text
//! agent stdin  ──→ [firewall] ──→ child stdin
//! agent stdout ←── [firewall] ←── child stdout
//! ```
//!
//! Messages are newline-delimited JSON-RPC. Each agent line runs through
//! the interception engine; blocked messages are answered on the agent's
//! stdout instead of being forwarded. Server output passes through
//! unchanged. Oversized lines are dropped with a warning.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{info, warn};

use crate::config::FirewallConfig;
use crate::error::{Error, Result};
use crate::escalation::EscalationHub;
use crate::interceptor::FirewallEngine;
use crate::session::SessionStore;

use super::{resolve_blocking, MAX_MESSAGE_BYTES};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Non-invasive stdio proxy in front of a child tool server.
pub struct StdioProxy {
    command: Vec<String>,
    engine: Arc<FirewallEngine>,
    sessions: Arc<SessionStore>,
    hub: Arc<EscalationHub>,
}

impl StdioProxy {
    pub fn new(
        config: &FirewallConfig,
        engine: Arc<FirewallEngine>,
        sessions: Arc<SessionStore>,
        hub: Arc<EscalationHub>,
    ) -> Self {
        Self {
            command: config.server_command.clone(),
            engine,
            sessions,
            hub,
        }
    }

    /// Spawn the child and pump both directions until either side closes.
    pub async fn run(&self) -> Result<()> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| Error::Config("stdio mode requires AF_SERVER_COMMAND".to_string()))?;

        info!(command = %self.command.join(" "), "starting stdio proxy");
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;

        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::SubprocessComm("child stdin unavailable".to_string()))?;
        let child_stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::SubprocessComm("child stdout unavailable".to_string()))?;

        let session_id = format!("stdio-{}", child.id().unwrap_or_default());
        let session = self.sessions.get_or_create(&session_id, "stdio-agent").await;

        let mut agent_in = BufReader::new(tokio::io::stdin());
        let mut server_out = BufReader::new(child_stdout);
        let mut agent_out = tokio::io::stdout();

        // Line buffers persist across select iterations so a cancelled
        // partial read keeps its bytes.
        let mut agent_line: Vec<u8> = Vec::new();
        let mut server_line: Vec<u8> = Vec::new();

        loop {
            tokio::select! {
                read = agent_in.read_until(b'\n', &mut agent_line) => {
                    match read {
                        Ok(0) => {
                            info!("agent closed stdin");
                            break;
                        }
                        Ok(_) if agent_line.len() > MAX_MESSAGE_BYTES => {
                            warn!(bytes = agent_line.len(), "oversized message dropped");
                            agent_line.clear();
                        }
                        Ok(_) => {
                            let interception = self.engine.intercept(&agent_line, &session).await;
                            match resolve_blocking(&self.hub, &interception, &session_id, "stdio-agent").await {
                                Some(blocking) => {
                                    let mut line = blocking.to_bytes();
                                    line.push(b'\n');
                                    agent_out.write_all(&line).await?;
                                    agent_out.flush().await?;
                                }
                                None => {
                                    child_stdin.write_all(&agent_line).await?;
                                    child_stdin.flush().await?;
                                }
                            }
                            agent_line.clear();
                        }
                        Err(err) => {
                            warn!(error = %err, "agent read error");
                            break;
                        }
                    }
                }
                read = server_out.read_until(b'\n', &mut server_line) => {
                    match read {
                        Ok(0) => {
                            info!("server closed stdout");
                            break;
                        }
                        Ok(_) => {
                            agent_out.write_all(&server_line).await?;
                            agent_out.flush().await?;
                            server_line.clear();
                        }
                        Err(err) => {
                            warn!(error = %err, "server read error");
                            break;
                        }
                    }
                }
            }
        }

        drop(child_stdin);
        shutdown_child(&mut child, SHUTDOWN_GRACE).await;
        Ok(())
    }
}

/// Give the child a grace window to exit on its own, then kill it.
async fn shutdown_child(child: &mut tokio::process::Child, grace: Duration) {
    if child.try_wait().ok().flatten().is_some() {
        return;
    }
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(_) => {}
        Err(_) => {
            warn!("child did not exit within grace window, killing");
            let _ = child.kill().await;
        }
    }
}
