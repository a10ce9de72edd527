//! # agent-firewall
//!
//! An in-line security gateway for agent-to-tool JSON-RPC traffic. Every
//! agent message is intercepted, classified by a dual-layer analysis
//! pipeline, and either forwarded, answered with a blocking error, or held
//! for human adjudication.
//!
//! ## Core Components
//!
//! - **Analysis**: L1 static pattern engine + L2 semantic classifier
//! - **Policy**: pure verdict function over the combined results
//! - **Interceptor**: the single choke point every transport calls
//! - **Session**: per-agent conversational ring buffers with TTL eviction
//! - **Escalation**: human-in-the-loop verdicts and operator events
//! - **Proxy**: HTTP POST, SSE, WebSocket, and stdio transports
//!
//! ## Example
//!
//! ```rust,ignore
//! use agent_firewall::{EmitSinks, FirewallConfig, FirewallEngine, SessionStore};
//!
//! let config = FirewallConfig::from_env();
//! let engine = FirewallEngine::from_config(&config, EmitSinks::default());
//! let sessions = SessionStore::new(config.session_ring_buffer_size, config.session_ttl());
//!
//! let session = sessions.get_or_create("session-1", "agent-1").await;
//! let outcome = engine.intercept(raw_payload, &session).await;
//! if let Some(blocking) = outcome.blocking {
//!     // deliver the synthetic error instead of forwarding
//! }
//! ```

pub mod analysis;
pub mod audit;
pub mod config;
pub mod error;
pub mod escalation;
pub mod interceptor;
pub mod policy;
pub mod protocol;
pub mod proxy;
pub mod session;

// Re-exports for convenience
pub use analysis::{
    AnalysisResult, IntentClassifier, KeywordClassifier, L1Result, L2Result, LlmClassifier,
    SemanticAnalyzer, StaticAnalyzer, ThreatLevel, Verdict,
};
pub use audit::{AuditEntry, AuditLogger};
pub use config::{FirewallConfig, TransportMode};
pub use error::{Error, Result};
pub use escalation::{
    EscalationHub, OperatorAction, OperatorCommand, OperatorEvent, OperatorEventType,
};
pub use interceptor::{
    blocking_response, EmitSinks, FirewallEngine, Interception, HIGH_RISK_METHODS, SAFE_METHODS,
};
pub use policy::{evaluate, PolicyDecision};
pub use protocol::{
    JsonRpcError, JsonRpcRequest, JsonRpcResponse, RequestId, ToolCall, CODE_BLOCKED,
    CODE_PARSE_ERROR, CODE_UPSTREAM_ERROR,
};
pub use proxy::{router, ProxyState, StdioProxy};
pub use session::{MessageRole, Session, SessionMessage, SessionStore, SharedSession};
