//! Escalation hub — human-in-the-loop adjudication and operator events.
//!
//! The hub owns two things:
//!
//! 1. **Pending escalations**: a map from request id to a one-shot promise.
//!    A transport holding an ESCALATE verdict parks on `await_verdict`; an
//!    operator command resolves it. Timeout resolves to BLOCK (fail-safe),
//!    and the entry is removed either way so abandoned waits cannot leak.
//!
//! 2. **Operator event broadcast**: a bounded fan-out channel feeding every
//!    connected operator console. Each subscriber effectively has a
//!    256-event buffer; when a slow consumer falls behind, the oldest
//!    events are dropped rather than blocking producers. Delivery is
//!    best-effort.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, oneshot, RwLock};
use tracing::{info, warn};

use crate::analysis::{AnalysisResult, Verdict};

/// Per-subscriber event buffer; oldest events are discarded on overflow.
const SUBSCRIBER_BUFFER: usize = 256;

/// Kind of event pushed to operator consoles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperatorEventType {
    Request,
    Alert,
    Verdict,
    Stats,
}

/// Real-time frame pushed to every connected operator console.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorEvent {
    pub event_type: OperatorEventType,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub agent_id: String,
    pub method: String,
    pub payload_preview: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis: Option<AnalysisResult>,
    pub is_alert: bool,
}

impl OperatorEvent {
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_else(|_| b"{}".to_vec())
    }
}

/// Operator action on an escalated request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperatorAction {
    Block,
    Allow,
}

/// Command frame received from an operator console.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorCommand {
    pub action: OperatorAction,
    pub request_id: String,
}

/// Central hub for operator adjudication and event broadcast.
pub struct EscalationHub {
    pending: RwLock<HashMap<String, oneshot::Sender<Verdict>>>,
    events: broadcast::Sender<OperatorEvent>,
}

impl Default for EscalationHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EscalationHub {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(SUBSCRIBER_BUFFER);
        Self {
            pending: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Register an operator console. Dropping the receiver unregisters it.
    pub fn subscribe(&self) -> broadcast::Receiver<OperatorEvent> {
        self.events.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.events.receiver_count()
    }

    /// Push an event to all connected consoles, best-effort. A send with no
    /// subscribers is not an error.
    pub fn publish(&self, event: OperatorEvent) {
        let _ = self.events.send(event);
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.read().await.len()
    }

    /// Park an escalated request until an operator responds or the timeout
    /// fires. Timeout resolves to BLOCK and removes the entry.
    pub async fn await_verdict(&self, request_id: &str, timeout: Duration) -> Verdict {
        let (tx, rx) = oneshot::channel();
        self.pending
            .write()
            .await
            .insert(request_id.to_string(), tx);

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(verdict)) => {
                info!(request_id, verdict = %verdict, "operator verdict received");
                verdict
            }
            Ok(Err(_)) | Err(_) => {
                self.pending.write().await.remove(request_id);
                warn!(request_id, "escalation timed out, defaulting to BLOCK");
                Verdict::Block
            }
        }
    }

    /// Apply an operator command to a pending escalation. Returns whether a
    /// pending request was actually resolved.
    pub async fn resolve(&self, command: &OperatorCommand) -> bool {
        let sender = self.pending.write().await.remove(&command.request_id);
        let Some(sender) = sender else {
            warn!(request_id = %command.request_id, "operator verdict for unknown request");
            return false;
        };

        let verdict = match command.action {
            OperatorAction::Block => Verdict::Block,
            OperatorAction::Allow => Verdict::Allow,
        };
        info!(request_id = %command.request_id, verdict = %verdict, "human verdict applied");
        sender.send(verdict).is_ok()
    }
}
