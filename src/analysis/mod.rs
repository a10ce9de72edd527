//! Dual-layer threat analysis: synchronous static pass (L1) and
//! asynchronous semantic pass (L2).

mod semantic;
mod static_analyzer;
mod types;

pub use semantic::{IntentClassifier, KeywordClassifier, LlmClassifier, SemanticAnalyzer};
pub use static_analyzer::{DictionaryMatcher, StaticAnalyzer};
pub use types::{new_request_id, AnalysisResult, L1Result, L2Result, ThreatLevel, Verdict};
