//! Gate enforcement authority: builds enforcement plans for outgoing steps
//! and classifies returned verdict strings.

use crate::gates::accumulator::AccumulatedGate;
use crate::registry::{EnforcementMode, Gate};
use crate::sessions::{ChainSession, ReviewAttempt, SessionState};
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;

/// Where a verdict string came from. The minimal fallback pattern is only
/// accepted from the explicit gate-verdict channel; free-text user replies
/// must use the verbose forms so model prose cannot forge a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerdictSource {
    GateVerdict,
    UserResponse,
}

/// Confidence class of the matched pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerdictClass {
    Primary,
    High,
    Medium,
    Fallback,
}

/// A successfully classified verdict
#[derive(Debug, Clone)]
pub struct ParsedVerdict {
    pub passed: bool,
    pub rationale: String,
    pub class: VerdictClass,
    /// 1-based index into the pattern table, for diagnostics
    pub pattern: usize,
}

struct VerdictPattern {
    regex: &'static Lazy<Regex>,
    gate_verdict_only: bool,
    class: VerdictClass,
}

static P1: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?im)^\s*GATE_REVIEW:\s*(PASS|FAIL)\s*-\s*(.+)$").unwrap());
static P2: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?im)^\s*GATE_REVIEW:\s*(PASS|FAIL)\s*:\s*(.+)$").unwrap());
static P3: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?im)^\s*GATE\s+(PASS|FAIL)\s*-\s*(.+)$").unwrap());
static P4: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?im)^\s*GATE\s+(PASS|FAIL)\s*:\s*(.+)$").unwrap());
static P5: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?im)^\s*(PASS|FAIL)\s*-\s*(.+)$").unwrap());

/// Ordered pattern table; the first match wins
static PATTERNS: [VerdictPattern; 5] = [
    VerdictPattern {
        regex: &P1,
        gate_verdict_only: false,
        class: VerdictClass::Primary,
    },
    VerdictPattern {
        regex: &P2,
        gate_verdict_only: false,
        class: VerdictClass::High,
    },
    VerdictPattern {
        regex: &P3,
        gate_verdict_only: false,
        class: VerdictClass::High,
    },
    VerdictPattern {
        regex: &P4,
        gate_verdict_only: false,
        class: VerdictClass::Medium,
    },
    VerdictPattern {
        regex: &P5,
        gate_verdict_only: true,
        class: VerdictClass::Fallback,
    },
];

/// Classify a verdict string. Returns None when nothing matches or the
/// rationale is empty after trimming.
pub fn parse_verdict(text: &str, source: VerdictSource) -> Option<ParsedVerdict> {
    for (index, pattern) in PATTERNS.iter().enumerate() {
        if pattern.gate_verdict_only && source != VerdictSource::GateVerdict {
            continue;
        }
        if let Some(captures) = pattern.regex.captures(text) {
            let rationale = captures.get(2).map(|m| m.as_str().trim()).unwrap_or("");
            if rationale.is_empty() {
                // A match with no rationale captures no verdict
                continue;
            }
            let passed = captures
                .get(1)
                .is_some_and(|m| m.as_str().eq_ignore_ascii_case("PASS"));
            return Some(ParsedVerdict {
                passed,
                rationale: rationale.to_string(),
                class: pattern.class,
                pattern: index + 1,
            });
        }
    }
    None
}

/// What the enforcement authority decided for an outgoing step
#[derive(Debug, Clone)]
pub struct EnforcementPlan {
    /// Gates to embed, in priority order
    pub gates: Vec<AccumulatedGate>,
    /// Aggregate mode: blocking if any gate blocks, else advisory if any
    /// advises, else informational
    pub mode: EnforcementMode,
    pub max_attempts: u32,
    /// Whether the downstream verdict is mandatory before advancing
    pub verdict_mandatory: bool,
}

impl EnforcementPlan {
    /// Render the criteria block embedded into the outgoing prompt
    pub fn criteria_block(&self) -> String {
        let mut out = String::from("Quality gates for this step:\n");
        for entry in &self.gates {
            out.push_str(&format!("- [{}] {}\n", entry.gate.id, entry.gate.name));
            for criterion in &entry.gate.criteria {
                out.push_str(&format!("  * {}\n", criterion));
            }
        }
        out.push_str(
            "\nAfter producing your answer, self-evaluate against every gate and \
reply on a separate line with exactly:\nGATE_REVIEW: PASS - <reason> or \
GATE_REVIEW: FAIL - <reason>\n",
        );
        out
    }

    pub fn gate_ids(&self) -> Vec<String> {
        self.gates.iter().map(|e| e.gate.id.clone()).collect()
    }

    /// Verification gates in the plan, if any
    pub fn verification_gates(&self) -> Vec<Arc<Gate>> {
        self.gates
            .iter()
            .filter(|e| e.gate.verification.is_some())
            .map(|e| Arc::clone(&e.gate))
            .collect()
    }
}

/// Build the plan for an accumulated gate set; None when no gates attached.
/// An explicit `max:` override (from the verify operator) wins over the
/// configured default budget.
pub fn build_plan(
    gates: Vec<AccumulatedGate>,
    default_max_attempts: u32,
) -> Option<EnforcementPlan> {
    if gates.is_empty() {
        return None;
    }
    let mode = gates
        .iter()
        .map(|e| e.gate.effective_enforcement())
        .fold(EnforcementMode::Informational, strictest);
    let max_attempts = gates
        .iter()
        .filter_map(|e| e.gate.verification.as_ref().and_then(|v| v.max_attempts))
        .max()
        .unwrap_or(default_max_attempts)
        .max(1);
    Some(EnforcementPlan {
        verdict_mandatory: mode == EnforcementMode::Blocking,
        gates,
        mode,
        max_attempts,
    })
}

fn strictest(a: EnforcementMode, b: EnforcementMode) -> EnforcementMode {
    use EnforcementMode::*;
    match (a, b) {
        (Blocking, _) | (_, Blocking) => Blocking,
        (Advisory, _) | (_, Advisory) => Advisory,
        _ => Informational,
    }
}

/// Result of applying a verdict to a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerdictOutcome {
    /// PASS, or a non-blocking FAIL: the review cleared and the session advanced
    Advanced { warned: bool },
    /// Blocking FAIL with budget remaining: re-render with retry hints
    RetryPending { attempt: u32, max_attempts: u32 },
    /// Blocking FAIL that exhausted the budget
    Exhausted,
}

/// Apply a classified verdict to the session's pending review, mutating the
/// session per the outcome rules.
pub fn apply_verdict(
    session: &mut ChainSession,
    verdict: &ParsedVerdict,
    mode: EnforcementMode,
) -> VerdictOutcome {
    if let Some(review) = session.pending_review.as_mut() {
        review.history.push(ReviewAttempt {
            raw_verdict: format!(
                "{} (pattern {})",
                if verdict.passed { "PASS" } else { "FAIL" },
                verdict.pattern
            ),
            passed: verdict.passed,
            rationale: verdict.rationale.clone(),
            at: chrono::Utc::now(),
        });
    }

    session.last_review_passed = Some(verdict.passed);
    if verdict.passed {
        if let Some(review) = &session.pending_review {
            for gate_id in &review.gate_ids {
                if !session.passed_gates.contains(gate_id) {
                    session.passed_gates.push(gate_id.clone());
                }
            }
        }
        session.advance();
        return VerdictOutcome::Advanced { warned: false };
    }

    match mode {
        EnforcementMode::Blocking => {
            session.record_failed_attempt(Some(verdict.rationale.clone()));
            match session.state {
                SessionState::AwaitingUserChoice => VerdictOutcome::Exhausted,
                _ => {
                    let (attempt, max_attempts) = session
                        .pending_review
                        .as_ref()
                        .map(|r| (r.attempt_count, r.max_attempts))
                        .unwrap_or((0, 0));
                    VerdictOutcome::RetryPending {
                        attempt,
                        max_attempts,
                    }
                }
            }
        }
        EnforcementMode::Advisory => {
            session.advance();
            VerdictOutcome::Advanced { warned: true }
        }
        EnforcementMode::Informational => {
            session.advance();
            VerdictOutcome::Advanced { warned: false }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gates::accumulator::{GateAccumulator, GateSource};
    use crate::registry::{Severity, VerificationSpec};
    use std::collections::BTreeMap;

    #[test]
    fn pattern_order_first_match_wins() {
        // Matches both #1 and #5; #1 must win
        let v = parse_verdict(
            "GATE_REVIEW: PASS - all criteria satisfied",
            VerdictSource::UserResponse,
        )
        .unwrap();
        assert_eq!(v.pattern, 1);
        assert_eq!(v.class, VerdictClass::Primary);
        assert!(v.passed);
        assert_eq!(v.rationale, "all criteria satisfied");
    }

    #[test]
    fn each_pattern_matches_its_shape() {
        let cases = [
            ("GATE_REVIEW: FAIL - no citation", 1, false),
            ("gate_review: pass : looks good", 2, true),
            ("GATE FAIL - too long", 3, false),
            ("GATE PASS : concise enough", 4, true),
        ];
        for (text, pattern, passed) in cases {
            let v = parse_verdict(text, VerdictSource::UserResponse)
                .unwrap_or_else(|| panic!("no match for {:?}", text));
            assert_eq!(v.pattern, pattern, "{:?}", text);
            assert_eq!(v.passed, passed, "{:?}", text);
        }
    }

    #[test]
    fn minimal_pattern_only_from_gate_verdict_channel() {
        assert!(parse_verdict("PASS - fine", VerdictSource::UserResponse).is_none());
        let v = parse_verdict("PASS - fine", VerdictSource::GateVerdict).unwrap();
        assert_eq!(v.pattern, 5);
        assert_eq!(v.class, VerdictClass::Fallback);
    }

    #[test]
    fn empty_rationale_rejected() {
        assert!(parse_verdict("GATE_REVIEW: PASS -   ", VerdictSource::GateVerdict).is_none());
        assert!(parse_verdict("FAIL -", VerdictSource::GateVerdict).is_none());
    }

    #[test]
    fn verdict_embedded_in_prose_is_found() {
        let text = "Here is my assessment of the draft.\nGATE_REVIEW: FAIL - missing sources\nRegards.";
        let v = parse_verdict(text, VerdictSource::UserResponse).unwrap();
        assert!(!v.passed);
        assert_eq!(v.rationale, "missing sources");
    }

    fn plan_for(gates: Vec<(Arc<Gate>, GateSource)>, max: u32) -> EnforcementPlan {
        let mut acc = GateAccumulator::new();
        for (gate, source) in gates {
            acc.add(gate, source);
        }
        build_plan(acc.gates(), max).unwrap()
    }

    #[test]
    fn plan_mode_is_strictest_gate() {
        let mut low = Gate::inline("style ok".to_string());
        low.severity = Severity::Low;
        let high = Gate::inline("cite sources".to_string());
        let plan = plan_for(
            vec![
                (Arc::new(low), GateSource::RegistryDefault),
                (Arc::new(high), GateSource::Inline),
            ],
            3,
        );
        assert_eq!(plan.mode, EnforcementMode::Blocking);
        assert!(plan.verdict_mandatory);
        assert_eq!(plan.max_attempts, 3);
    }

    #[test]
    fn verify_max_overrides_default_budget() {
        let gate = Gate::inline_verification(VerificationSpec {
            command: "exit 0".to_string(),
            timeout_secs: None,
            max_attempts: Some(7),
            looped: true,
        });
        let plan = plan_for(vec![(Arc::new(gate), GateSource::Inline)], 3);
        assert_eq!(plan.max_attempts, 7);
    }

    #[test]
    fn criteria_block_names_every_gate() {
        let plan = plan_for(
            vec![(
                Arc::new(Gate::inline("under 200 words".to_string())),
                GateSource::Inline,
            )],
            3,
        );
        let block = plan.criteria_block();
        assert!(block.contains("under 200 words"));
        assert!(block.contains("GATE_REVIEW: PASS"));
    }

    fn session_with_review(max_attempts: u32) -> ChainSession {
        let mut s = ChainSession::new(">>doc", "doc", 1, BTreeMap::new());
        s.record_rendered("step".to_string());
        s.capture_output(1, "draft".to_string());
        s.begin_review(crate::sessions::PendingReview {
            review_prompt: "review".to_string(),
            gate_ids: vec!["cite".to_string()],
            attempt_count: 0,
            max_attempts,
            created_at: chrono::Utc::now(),
            retry_hints: vec![],
            history: vec![],
        })
        .unwrap();
        s
    }

    #[test]
    fn pass_clears_review_and_advances() {
        let mut s = session_with_review(2);
        let v = parse_verdict("GATE_REVIEW: PASS - cited", VerdictSource::GateVerdict).unwrap();
        let outcome = apply_verdict(&mut s, &v, EnforcementMode::Blocking);
        assert_eq!(outcome, VerdictOutcome::Advanced { warned: false });
        assert!(s.pending_review.is_none());
        assert_eq!(s.state, SessionState::Complete);
    }

    #[test]
    fn blocking_fail_exhausts_on_kth_attempt() {
        let mut s = session_with_review(2);
        let v =
            parse_verdict("GATE_REVIEW: FAIL - no citation", VerdictSource::GateVerdict).unwrap();
        let first = apply_verdict(&mut s, &v, EnforcementMode::Blocking);
        assert_eq!(
            first,
            VerdictOutcome::RetryPending {
                attempt: 1,
                max_attempts: 2
            }
        );
        let second = apply_verdict(&mut s, &v, EnforcementMode::Blocking);
        assert_eq!(second, VerdictOutcome::Exhausted);
        assert_eq!(s.state, SessionState::AwaitingUserChoice);
        // Retry hints carry the rationale forward
        assert_eq!(
            s.pending_review.as_ref().unwrap().retry_hints,
            vec!["no citation".to_string(), "no citation".to_string()]
        );
    }

    #[test]
    fn advisory_fail_warns_and_advances() {
        let mut s = session_with_review(2);
        let v = parse_verdict("GATE_REVIEW: FAIL - minor nit", VerdictSource::GateVerdict).unwrap();
        let outcome = apply_verdict(&mut s, &v, EnforcementMode::Advisory);
        assert_eq!(outcome, VerdictOutcome::Advanced { warned: true });
        assert!(s.pending_review.is_none());
    }

    #[test]
    fn informational_fail_advances_silently() {
        let mut s = session_with_review(2);
        let v = parse_verdict("GATE_REVIEW: FAIL - noted", VerdictSource::GateVerdict).unwrap();
        let outcome = apply_verdict(&mut s, &v, EnforcementMode::Informational);
        assert_eq!(outcome, VerdictOutcome::Advanced { warned: false });
    }
}
