//! Transport adapters. Each adapter invokes the interception engine exactly
//! once per inbound agent message and decides delivery from the verdict.

mod http;
mod stdio;
mod ws;

pub use http::{router, ProxyState};
pub use stdio::StdioProxy;
pub use ws::{handle_operator_socket, handle_proxy_socket};

use std::time::Duration;

use tracing::info;

use crate::analysis::Verdict;
use crate::escalation::{EscalationHub, OperatorEvent, OperatorEventType};
use crate::interceptor::{blocking_response, Interception};
use crate::protocol::JsonRpcResponse;

/// Maximum inbound message size on byte-stream transports. Anything larger
/// is dropped with a warning, never forwarded.
pub const MAX_MESSAGE_BYTES: usize = 4 * 1024 * 1024;

/// Fail-safe timeout for human adjudication of an escalated request.
pub const ESCALATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Upstream forwarding timeout.
pub const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// Drive an interception outcome to its final blocking decision.
///
/// BLOCK returns the already-built synthetic response. ESCALATE parks on
/// the hub; a human BLOCK (or the fail-safe timeout) synthesizes the same
/// blocking response, a human ALLOW forwards. ALLOW forwards.
pub async fn resolve_blocking(
    hub: &EscalationHub,
    interception: &Interception,
    session_id: &str,
    agent_id: &str,
) -> Option<JsonRpcResponse> {
    match interception.analysis.verdict {
        Verdict::Block => interception.blocking.clone(),
        Verdict::Allow => None,
        Verdict::Escalate => {
            let final_verdict = hub
                .await_verdict(&interception.analysis.request_id, ESCALATION_TIMEOUT)
                .await;

            let mut resolved = interception.analysis.clone();
            resolved.verdict = final_verdict;
            hub.publish(OperatorEvent {
                event_type: OperatorEventType::Verdict,
                timestamp: chrono::Utc::now(),
                session_id: session_id.to_string(),
                agent_id: agent_id.to_string(),
                method: interception.request.method.clone(),
                payload_preview: String::new(),
                analysis: Some(resolved),
                is_alert: final_verdict == Verdict::Block,
            });

            info!(
                request_id = %interception.analysis.request_id,
                verdict = %final_verdict,
                "escalation resolved"
            );
            match final_verdict {
                Verdict::Block => Some(blocking_response(
                    interception.request.id.clone(),
                    &interception.analysis,
                )),
                _ => None,
            }
        }
    }
}

/// Token-bucket rate limiter for the request/response surface.
pub struct RateLimiter {
    rate: f64,
    burst: f64,
    state: std::sync::Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: std::time::Instant,
}

impl RateLimiter {
    pub fn new(requests_per_sec: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            rate: requests_per_sec.max(0.0),
            burst,
            state: std::sync::Mutex::new(BucketState {
                tokens: burst,
                last_refill: std::time::Instant::now(),
            }),
        }
    }

    /// Take one token if available. A zero rate disables limiting.
    pub fn allow(&self) -> bool {
        if self.rate == 0.0 {
            return true;
        }
        let Ok(mut state) = self.state.lock() else {
            return true;
        };

        let now = std::time::Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.burst);
        state.last_refill = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}
