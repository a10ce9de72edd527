//! Core analysis types shared by the L1/L2 engines and the policy layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Severity classification of detected threats.
///
/// The derived `Ord` gives the total ordering NONE < LOW < MEDIUM < HIGH <
/// CRITICAL that threat aggregation relies on.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum ThreatLevel {
    #[default]
    None,
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for ThreatLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "NONE"),
            Self::Low => write!(f, "LOW"),
            Self::Medium => write!(f, "MEDIUM"),
            Self::High => write!(f, "HIGH"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Terminal firewall decision on a request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    #[default]
    Allow,
    Block,
    /// Held for operator adjudication via the escalation hub.
    Escalate,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Allow => write!(f, "ALLOW"),
            Self::Block => write!(f, "BLOCK"),
            Self::Escalate => write!(f, "ESCALATE"),
        }
    }
}

/// Aggregated output from the static analysis pass.
///
/// Matched pattern tags carry their source as a prefix: `dict:` for
/// dictionary hits, `regex:` for structural detectors, `decoded:` for hits
/// surfaced inside decoded base64 payloads.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct L1Result {
    pub matched_patterns: Vec<String>,
    pub threat_level: ThreatLevel,
}

/// Output from the semantic analysis pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct L2Result {
    pub is_injection: bool,
    pub confidence: f64,
    pub reasoning: String,
    pub threat_level: ThreatLevel,
}

impl Default for L2Result {
    fn default() -> Self {
        Self {
            is_injection: false,
            confidence: 0.0,
            reasoning: String::new(),
            threat_level: ThreatLevel::None,
        }
    }
}

impl L2Result {
    /// Positive classification with the threat level derived from confidence:
    /// CRITICAL at >= 0.90, HIGH at >= 0.80, MEDIUM otherwise.
    pub fn injection(confidence: f64, reasoning: impl Into<String>) -> Self {
        let threat_level = if confidence >= 0.90 {
            ThreatLevel::Critical
        } else if confidence >= 0.80 {
            ThreatLevel::High
        } else {
            ThreatLevel::Medium
        };
        Self {
            is_injection: true,
            confidence,
            reasoning: reasoning.into(),
            threat_level,
        }
    }

    /// Negative classification.
    pub fn clean(confidence: f64, reasoning: impl Into<String>) -> Self {
        Self {
            is_injection: false,
            confidence,
            reasoning: reasoning.into(),
            threat_level: ThreatLevel::None,
        }
    }

    /// Safe default used when L2 degrades (timeout, network failure,
    /// malformed model output). Fail-open: no opinion, with the failure
    /// class recorded for the audit trail.
    pub fn degraded(reasoning: impl Into<String>) -> Self {
        Self {
            reasoning: reasoning.into(),
            ..Self::default()
        }
    }
}

/// Generate a 16-hex-char request identifier.
pub fn new_request_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(16);
    id
}

/// Combined output of the dual analysis engine for a single request.
///
/// Exactly one of these is produced per intercepted message; it is the
/// record emitted to the audit and operator event channels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub request_id: String,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub timestamp: DateTime<Utc>,

    // L1 static analysis
    pub l1_matched_patterns: Vec<String>,
    pub l1_threat_level: ThreatLevel,

    // L2 semantic analysis
    pub l2_is_injection: bool,
    pub l2_confidence: f64,
    pub l2_reasoning: String,

    // Final decision
    pub verdict: Verdict,
    pub threat_level: ThreatLevel,
    pub reason: String,
}

impl Default for AnalysisResult {
    fn default() -> Self {
        Self {
            request_id: new_request_id(),
            timestamp: Utc::now(),
            l1_matched_patterns: Vec::new(),
            l1_threat_level: ThreatLevel::None,
            l2_is_injection: false,
            l2_confidence: 0.0,
            l2_reasoning: String::new(),
            verdict: Verdict::Allow,
            threat_level: ThreatLevel::None,
            reason: String::new(),
        }
    }
}

impl AnalysisResult {
    /// A clean ALLOW result (safe-method fast path).
    pub fn allow() -> Self {
        Self::default()
    }

    /// A BLOCK result with no analysis behind it (parse failures).
    pub fn blocked(reason: impl Into<String>) -> Self {
        Self {
            verdict: Verdict::Block,
            reason: reason.into(),
            ..Self::default()
        }
    }
}
