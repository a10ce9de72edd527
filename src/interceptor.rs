//! Core interceptor — the single choke point for all inbound agent traffic.
//!
//! Every transport funnels each inbound message through
//! [`FirewallEngine::intercept`], which orchestrates:
//!
//! 1. JSON-RPC 2.0 parsing and envelope validation.
//! 2. L1 static analysis (synchronous, CPU-bound).
//! 3. L2 semantic analysis (async, bounded by its timeout).
//! 4. Policy evaluation (ALLOW / BLOCK / ESCALATE).
//! 5. Session append, audit and operator-event emission.
//!
//! The engine never modifies the original request. It returns the parsed
//! request (for forwarding), the analysis record, and an optional blocking
//! response (present exactly when the verdict is BLOCK). Emission failures
//! are caught and logged; they never alter the verdict.

use std::sync::Arc;
use std::time::Instant;

use serde_json::json;
use tracing::{debug, info, warn};

use crate::analysis::{
    AnalysisResult, L1Result, SemanticAnalyzer, StaticAnalyzer, Verdict,
};
use crate::audit::AuditEntry;
use crate::config::FirewallConfig;
use crate::error::Result;
use crate::escalation::{OperatorEvent, OperatorEventType};
use crate::policy;
use crate::protocol::{
    JsonRpcRequest, JsonRpcResponse, RequestId, CODE_BLOCKED, CODE_PARSE_ERROR,
};
use crate::session::{MessageRole, SharedSession};

/// Handshake and discovery methods exempted from analysis.
pub const SAFE_METHODS: &[&str] = &[
    "initialize",
    "initialized",
    "ping",
    "tools/list",
    "resources/list",
    "resources/templates/list",
    "prompts/list",
    "logging/setLevel",
];

/// Methods always analyzed by L2 regardless of what L1 saw.
pub const HIGH_RISK_METHODS: &[&str] = &["tools/call", "completion/complete", "sampling/createMessage"];

/// Audit sink callback: plain function reference, no back-pointers.
pub type AuditSink = Arc<dyn Fn(AuditEntry) -> Result<()> + Send + Sync>;
/// Operator-event sink callback.
pub type OperatorSink = Arc<dyn Fn(OperatorEvent) -> Result<()> + Send + Sync>;

/// The pair of emission callbacks handed to the engine by the host.
#[derive(Clone, Default)]
pub struct EmitSinks {
    pub audit: Option<AuditSink>,
    pub operator: Option<OperatorSink>,
}

impl EmitSinks {
    pub fn with_audit(mut self, sink: AuditSink) -> Self {
        self.audit = Some(sink);
        self
    }

    pub fn with_operator(mut self, sink: OperatorSink) -> Self {
        self.operator = Some(sink);
        self
    }
}

/// Outcome of one interception call.
#[derive(Debug)]
pub struct Interception {
    pub request: JsonRpcRequest,
    pub analysis: AnalysisResult,
    /// Present exactly when the verdict is BLOCK.
    pub blocking: Option<JsonRpcResponse>,
}

/// Build the synthetic response returned to the agent for a blocked request.
pub fn blocking_response(id: Option<RequestId>, analysis: &AnalysisResult) -> JsonRpcResponse {
    JsonRpcResponse::error(
        id,
        CODE_BLOCKED,
        "Request blocked by Agent Firewall",
        Some(json!({
            "threat_level": analysis.threat_level,
            "reason": analysis.reason,
            "request_id": analysis.request_id,
        })),
    )
}

/// The dual-layer analysis engine shared by every transport.
pub struct FirewallEngine {
    l1: Option<StaticAnalyzer>,
    l2: SemanticAnalyzer,
    sinks: EmitSinks,
}

impl FirewallEngine {
    pub fn new(l1: Option<StaticAnalyzer>, l2: SemanticAnalyzer, sinks: EmitSinks) -> Self {
        Self { l1, l2, sinks }
    }

    /// Assemble the engine from a configuration snapshot.
    pub fn from_config(config: &FirewallConfig, sinks: EmitSinks) -> Self {
        let l1 = config
            .l1_enabled
            .then(|| StaticAnalyzer::new(config.blocked_commands.iter().cloned()));
        Self::new(l1, SemanticAnalyzer::from_config(config), sinks)
    }

    /// The central interception pipeline for all inbound agent traffic.
    pub async fn intercept(&self, raw_payload: &[u8], session: &SharedSession) -> Interception {
        let started = Instant::now();

        // Step 1: parse and validate the envelope. Fail-closed on parse.
        let request = match JsonRpcRequest::from_slice(raw_payload) {
            Ok(request) => request,
            Err(err) => {
                warn!(error = %err, "failed to parse JSON-RPC packet");
                let analysis = AnalysisResult::blocked(format!("Parse error: {err}"));
                let blocking = JsonRpcResponse::error(
                    None,
                    CODE_PARSE_ERROR,
                    "Parse error",
                    Some(json!(err.to_string())),
                );
                return Interception {
                    request: JsonRpcRequest::invalid(),
                    analysis,
                    blocking: Some(blocking),
                };
            }
        };

        // Step 2: fast-path for handshake/discovery methods.
        if SAFE_METHODS.contains(&request.method.as_str()) {
            session
                .lock()
                .await
                .push(MessageRole::Agent, json!({"method": request.method}));
            debug!(method = %request.method, "safe method fast path");
            return Interception {
                request,
                analysis: AnalysisResult::allow(),
                blocking: None,
            };
        }

        // Step 3: L1 static analysis over the full serialized payload.
        let payload_text = String::from_utf8_lossy(raw_payload);
        let l1_result = match &self.l1 {
            Some(analyzer) => analyzer.analyze(&payload_text),
            None => L1Result::default(),
        };

        // Step 4: L2 for high-risk methods or anything L1 flagged, except
        // when L1 is already CRITICAL (guaranteed BLOCK, save the call).
        let run_l2 = HIGH_RISK_METHODS.contains(&request.method.as_str())
            || l1_result.threat_level > crate::analysis::ThreatLevel::None;
        let l2_result = if run_l2 && l1_result.threat_level < crate::analysis::ThreatLevel::Critical
        {
            let context = session.lock().await.recent(10);
            self.l2
                .analyze(&request.method, request.params.as_ref(), &context)
                .await
        } else {
            Default::default()
        };

        // Step 5: policy decision.
        let decision = policy::evaluate(&l1_result, &l2_result);

        let analysis = AnalysisResult {
            l1_matched_patterns: l1_result.matched_patterns,
            l1_threat_level: l1_result.threat_level,
            l2_is_injection: l2_result.is_injection,
            l2_confidence: l2_result.confidence,
            l2_reasoning: l2_result.reasoning,
            verdict: decision.verdict,
            threat_level: decision.threat_level,
            reason: decision.reason,
            ..AnalysisResult::default()
        };

        // Step 6: session append, before the engine returns to the transport.
        let (session_id, agent_id) = {
            let mut session = session.lock().await;
            session.push(
                MessageRole::Agent,
                json!({
                    "method": request.method,
                    "params_preview": preview(request.params.as_ref(), 200),
                    "verdict": analysis.verdict,
                }),
            );
            (session.session_id.clone(), session.agent_id.clone())
        };

        // Step 7: audit + operator emission; failures never change verdicts.
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.emit(&request, &analysis, &session_id, &agent_id, elapsed_ms);

        // Step 8: synthesize the blocking response when required.
        let blocking = match analysis.verdict {
            Verdict::Block => {
                warn!(
                    method = %request.method,
                    session = %session_id,
                    threat = %analysis.threat_level,
                    elapsed_ms,
                    reason = %analysis.reason,
                    "BLOCKED"
                );
                Some(blocking_response(request.id.clone(), &analysis))
            }
            Verdict::Escalate => {
                info!(
                    method = %request.method,
                    session = %session_id,
                    threat = %analysis.threat_level,
                    elapsed_ms,
                    reason = %analysis.reason,
                    "ESCALATED"
                );
                None
            }
            Verdict::Allow => {
                debug!(method = %request.method, session = %session_id, elapsed_ms, "allowed");
                None
            }
        };

        Interception {
            request,
            analysis,
            blocking,
        }
    }

    fn emit(
        &self,
        request: &JsonRpcRequest,
        analysis: &AnalysisResult,
        session_id: &str,
        agent_id: &str,
        elapsed_ms: f64,
    ) {
        if let Some(audit) = &self.sinks.audit {
            let entry = AuditEntry {
                timestamp: analysis.timestamp,
                session_id: session_id.to_string(),
                agent_id: agent_id.to_string(),
                method: request.method.clone(),
                params_summary: preview(request.params.as_ref(), 500),
                analysis: analysis.clone(),
                verdict: analysis.verdict,
                response_time_ms: elapsed_ms,
            };
            if let Err(err) = audit(entry) {
                warn!(error = %err, "audit emission failed");
            }
        }

        if let Some(operator) = &self.sinks.operator {
            let is_alert = analysis.verdict != Verdict::Allow;
            let event = OperatorEvent {
                event_type: if is_alert {
                    OperatorEventType::Alert
                } else {
                    OperatorEventType::Request
                },
                timestamp: analysis.timestamp,
                session_id: session_id.to_string(),
                agent_id: agent_id.to_string(),
                method: request.method.clone(),
                payload_preview: preview(request.params.as_ref(), 300),
                analysis: Some(analysis.clone()),
                is_alert,
            };
            if let Err(err) = operator(event) {
                warn!(error = %err, "operator event emission failed");
            }
        }
    }
}

/// Bounded textual preview of a params value.
fn preview(params: Option<&serde_json::Value>, limit: usize) -> String {
    let text = params.map(|p| p.to_string()).unwrap_or_default();
    text.chars().take(limit).collect()
}
