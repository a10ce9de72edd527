//! Policy engine — merges L1 and L2 results into a final verdict.
//!
//! `evaluate` is a pure function: same inputs, same output, no clock, no
//! I/O. The aggregated threat level is the max of both layers, and the
//! decision table below is evaluated top to bottom, first match wins.
//!
//! | L1 level | L2 injection | L2 confidence | Verdict  |
//! |----------|--------------|---------------|----------|
//! | CRITICAL | any          | any           | BLOCK    |
//! | HIGH     | true         | >= 0.70       | BLOCK    |
//! | HIGH     | true         | <  0.70       | ESCALATE |
//! | HIGH     | false        | —             | ESCALATE |
//! | MEDIUM   | true         | >= 0.80       | BLOCK    |
//! | MEDIUM   | true         | <  0.80       | ESCALATE |
//! | MEDIUM   | false        | —             | ALLOW    |
//! | <= LOW   | true         | >= 0.90       | BLOCK    |
//! | <= LOW   | true         | >= 0.70       | ESCALATE |
//! | <= LOW   | true         | <  0.70       | ALLOW    |
//! | <= LOW   | false        | —             | ALLOW    |

use crate::analysis::{L1Result, L2Result, ThreatLevel, Verdict};

/// Outcome of policy evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyDecision {
    pub verdict: Verdict,
    pub threat_level: ThreatLevel,
    pub reason: String,
}

/// Merge L1 + L2 results into a final security verdict.
pub fn evaluate(l1: &L1Result, l2: &L2Result) -> PolicyDecision {
    let threat_level = l1.threat_level.max(l2.threat_level);
    let reason = build_reason(l1, l2);

    let verdict = match l1.threat_level {
        ThreatLevel::Critical => Verdict::Block,
        ThreatLevel::High => {
            if l2.is_injection && l2.confidence >= 0.70 {
                Verdict::Block
            } else {
                Verdict::Escalate
            }
        }
        ThreatLevel::Medium => {
            if l2.is_injection && l2.confidence >= 0.80 {
                Verdict::Block
            } else if l2.is_injection {
                Verdict::Escalate
            } else {
                Verdict::Allow
            }
        }
        ThreatLevel::Low | ThreatLevel::None => {
            if l2.is_injection && l2.confidence >= 0.90 {
                Verdict::Block
            } else if l2.is_injection && l2.confidence >= 0.70 {
                Verdict::Escalate
            } else {
                Verdict::Allow
            }
        }
    };

    PolicyDecision {
        verdict,
        threat_level,
        reason,
    }
}

/// Human-readable reason: up to five L1 tags plus the L2 clause, joined by
/// "; ". `"Clean"` when neither layer contributed.
fn build_reason(l1: &L1Result, l2: &L2Result) -> String {
    let mut reasons: Vec<String> = Vec::new();

    if !l1.matched_patterns.is_empty() {
        let shown: Vec<&str> = l1
            .matched_patterns
            .iter()
            .take(5)
            .map(|s| s.as_str())
            .collect();
        reasons.push(format!("L1 patterns: {}", shown.join(", ")));
    }
    if l2.is_injection {
        reasons.push(format!(
            "L2 injection (conf={:.2}): {}",
            l2.confidence, l2.reasoning
        ));
    }

    if reasons.is_empty() {
        "Clean".to_string()
    } else {
        reasons.join("; ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn l1(level: ThreatLevel) -> L1Result {
        L1Result {
            matched_patterns: if level == ThreatLevel::None {
                vec![]
            } else {
                vec![format!("regex:test_{level}")]
            },
            threat_level: level,
        }
    }

    fn l2(is_injection: bool, confidence: f64) -> L2Result {
        if is_injection {
            L2Result::injection(confidence, "test reasoning")
        } else {
            L2Result::clean(confidence, "clean")
        }
    }

    #[test]
    fn test_critical_l1_always_blocks() {
        for l2_result in [l2(false, 0.0), l2(true, 0.1), l2(true, 0.99)] {
            let decision = evaluate(&l1(ThreatLevel::Critical), &l2_result);
            assert_eq!(decision.verdict, Verdict::Block);
            assert_eq!(decision.threat_level, ThreatLevel::Critical);
        }
    }

    #[test]
    fn test_high_l1_blocks_with_confident_l2() {
        let decision = evaluate(&l1(ThreatLevel::High), &l2(true, 0.75));
        assert_eq!(decision.verdict, Verdict::Block);
    }

    #[test]
    fn test_high_l1_escalates_with_weak_l2() {
        let decision = evaluate(&l1(ThreatLevel::High), &l2(true, 0.5));
        assert_eq!(decision.verdict, Verdict::Escalate);
    }

    #[test]
    fn test_high_l1_escalates_without_l2() {
        let decision = evaluate(&l1(ThreatLevel::High), &l2(false, 0.05));
        assert_eq!(decision.verdict, Verdict::Escalate);
    }

    #[test]
    fn test_medium_l1_blocks_at_080() {
        assert_eq!(
            evaluate(&l1(ThreatLevel::Medium), &l2(true, 0.80)).verdict,
            Verdict::Block
        );
        assert_eq!(
            evaluate(&l1(ThreatLevel::Medium), &l2(true, 0.79)).verdict,
            Verdict::Escalate
        );
    }

    #[test]
    fn test_medium_l1_allows_clean_l2() {
        assert_eq!(
            evaluate(&l1(ThreatLevel::Medium), &l2(false, 0.05)).verdict,
            Verdict::Allow
        );
    }

    #[test]
    fn test_clean_l1_relies_on_l2() {
        assert_eq!(
            evaluate(&l1(ThreatLevel::None), &l2(true, 0.90)).verdict,
            Verdict::Block
        );
        assert_eq!(
            evaluate(&l1(ThreatLevel::None), &l2(true, 0.70)).verdict,
            Verdict::Escalate
        );
        assert_eq!(
            evaluate(&l1(ThreatLevel::None), &l2(true, 0.69)).verdict,
            Verdict::Allow
        );
        assert_eq!(
            evaluate(&l1(ThreatLevel::None), &l2(false, 0.05)).verdict,
            Verdict::Allow
        );
    }

    #[test]
    fn test_threshold_boundaries_use_geq() {
        assert_eq!(
            evaluate(&l1(ThreatLevel::High), &l2(true, 0.70)).verdict,
            Verdict::Block
        );
        assert_eq!(
            evaluate(&l1(ThreatLevel::Low), &l2(true, 0.90)).verdict,
            Verdict::Block
        );
    }

    #[test]
    fn test_reason_concatenation() {
        let l1_result = L1Result {
            matched_patterns: vec![
                "dict:rm -rf".to_string(),
                "regex:shell_pipe_injection".to_string(),
            ],
            threat_level: ThreatLevel::High,
        };
        let decision = evaluate(&l1_result, &l2(true, 0.85));
        assert_eq!(
            decision.reason,
            "L1 patterns: dict:rm -rf, regex:shell_pipe_injection; \
             L2 injection (conf=0.85): test reasoning"
        );
    }

    #[test]
    fn test_reason_caps_l1_patterns_at_five() {
        let l1_result = L1Result {
            matched_patterns: (0..8).map(|i| format!("dict:p{i}")).collect(),
            threat_level: ThreatLevel::High,
        };
        let decision = evaluate(&l1_result, &l2(false, 0.0));
        assert!(decision.reason.contains("dict:p4"));
        assert!(!decision.reason.contains("dict:p5"));
    }

    #[test]
    fn test_clean_reason() {
        let decision = evaluate(&l1(ThreatLevel::None), &l2(false, 0.05));
        assert_eq!(decision.reason, "Clean");
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn threat_level_strategy() -> impl Strategy<Value = ThreatLevel> {
            prop_oneof![
                Just(ThreatLevel::None),
                Just(ThreatLevel::Low),
                Just(ThreatLevel::Medium),
                Just(ThreatLevel::High),
                Just(ThreatLevel::Critical),
            ]
        }

        proptest! {
            #[test]
            fn aggregated_level_dominates_inputs(
                l1_level in threat_level_strategy(),
                is_injection in any::<bool>(),
                confidence in 0.0f64..=1.0,
            ) {
                let l1_result = l1(l1_level);
                let l2_result = l2(is_injection, confidence);
                let decision = evaluate(&l1_result, &l2_result);
                prop_assert!(decision.threat_level >= l1_result.threat_level);
                prop_assert!(decision.threat_level >= l2_result.threat_level);
            }

            #[test]
            fn evaluation_is_pure(
                l1_level in threat_level_strategy(),
                is_injection in any::<bool>(),
                confidence in 0.0f64..=1.0,
            ) {
                let l1_result = l1(l1_level);
                let l2_result = l2(is_injection, confidence);
                prop_assert_eq!(
                    evaluate(&l1_result, &l2_result),
                    evaluate(&l1_result, &l2_result)
                );
            }

            #[test]
            fn critical_l1_implies_block(
                is_injection in any::<bool>(),
                confidence in 0.0f64..=1.0,
            ) {
                let decision = evaluate(&l1(ThreatLevel::Critical), &l2(is_injection, confidence));
                prop_assert_eq!(decision.verdict, Verdict::Block);
            }
        }
    }
}
