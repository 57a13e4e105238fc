//! Chain session state machine.
//!
//! A session records the progress of one chain across disconnected client
//! calls. Every call is a discrete input to the state machine; nothing is
//! modeled as a suspended computation.

pub mod manager;
pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub use manager::{SessionManager, SessionSummary};
pub use store::SessionStore;

/// Current serialized envelope version
pub const SESSION_FORMAT_VERSION: u32 = 1;

/// Exactly one of these holds for every live session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// The next step can be rendered
    ReadyForStep,
    /// A step prompt has been emitted; its output has not been captured yet
    InFlight,
    /// A gate review is outstanding; a verdict must arrive before advancing
    PendingReview,
    /// A blocking review exhausted its attempts; the user must choose
    AwaitingUserChoice,
    Complete,
    Terminated,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::ReadyForStep => "ready_for_step",
            SessionState::InFlight => "in_flight",
            SessionState::PendingReview => "pending_review",
            SessionState::AwaitingUserChoice => "awaiting_user_choice",
            SessionState::Complete => "complete",
            SessionState::Terminated => "terminated",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Complete | SessionState::Terminated)
    }
}

/// One recorded step of the chain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    /// 1-indexed step position
    pub index: u32,
    pub rendered_prompt: String,
    #[serde(default)]
    pub output: Option<String>,
    /// True until the real model output arrives; placeholder outputs may be
    /// overwritten, real outputs may not
    pub placeholder: bool,
    pub recorded_at: DateTime<Utc>,
}

/// One verdict attempt against a pending review
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewAttempt {
    pub raw_verdict: String,
    pub passed: bool,
    pub rationale: String,
    pub at: DateTime<Utc>,
}

/// An outstanding gate review owned by its session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingReview {
    /// Combined review prompt sent to the model
    pub review_prompt: String,
    /// Gate ids under review, in embed order
    pub gate_ids: Vec<String>,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub retry_hints: Vec<String>,
    #[serde(default)]
    pub history: Vec<ReviewAttempt>,
}

/// Persistent chain session, keyed by its client-facing chain id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainSession {
    pub format_version: u32,
    pub chain_id: String,
    /// Originating command string
    pub command: String,
    /// Originating prompt id (first prompt of an ad-hoc chain)
    pub prompt_id: String,
    pub total_steps: u32,
    /// 1-indexed; monotonically non-decreasing except under a retry action
    pub current_step: u32,
    pub state: SessionState,
    pub steps: Vec<StepRecord>,
    #[serde(default)]
    pub pending_review: Option<PendingReview>,
    /// Snapshot of the arguments the chain started with
    #[serde(default)]
    pub original_args: BTreeMap<String, String>,
    /// Outcome of the most recent gate review, for step matchers
    #[serde(default)]
    pub last_review_passed: Option<bool>,
    /// Gate ids that have passed in this session
    #[serde(default)]
    pub passed_gates: Vec<String>,
    /// Temporary gates attached with session or chain scope; they re-apply
    /// on every subsequent call of this chain
    #[serde(default)]
    pub extra_gates: Vec<crate::registry::Gate>,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl ChainSession {
    pub fn new(
        command: impl Into<String>,
        prompt_id: impl Into<String>,
        total_steps: u32,
        original_args: BTreeMap<String, String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            format_version: SESSION_FORMAT_VERSION,
            chain_id: format!("chain-{}", uuid::Uuid::new_v4()),
            command: command.into(),
            prompt_id: prompt_id.into(),
            total_steps,
            current_step: 1,
            state: SessionState::ReadyForStep,
            steps: Vec::new(),
            pending_review: None,
            original_args,
            last_review_passed: None,
            passed_gates: Vec::new(),
            extra_gates: Vec::new(),
            started_at: now,
            last_activity: now,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    /// Record the rendered prompt for the current step and move in flight.
    /// A placeholder output slot is written immediately so readers always
    /// observe a record for every rendered step.
    pub fn record_rendered(&mut self, rendered_prompt: String) {
        let index = self.current_step;
        if let Some(existing) = self.steps.iter_mut().find(|s| s.index == index) {
            // A retry re-render replaces the placeholder record
            if existing.placeholder {
                existing.rendered_prompt = rendered_prompt;
                existing.recorded_at = Utc::now();
            }
        } else {
            self.steps.push(StepRecord {
                index,
                rendered_prompt,
                output: None,
                placeholder: true,
                recorded_at: Utc::now(),
            });
        }
        self.state = SessionState::InFlight;
        self.touch();
    }

    /// Capture a model output for a step. Writes overwrite placeholders but
    /// never real outputs; returns whether the write took effect.
    pub fn capture_output(&mut self, index: u32, output: String) -> bool {
        self.touch();
        match self.steps.iter_mut().find(|s| s.index == index) {
            Some(record) if record.placeholder => {
                record.output = Some(output);
                record.placeholder = false;
                record.recorded_at = Utc::now();
                true
            }
            Some(_) => false,
            None => {
                self.steps.push(StepRecord {
                    index,
                    rendered_prompt: String::new(),
                    output: Some(output),
                    placeholder: false,
                    recorded_at: Utc::now(),
                });
                true
            }
        }
    }

    /// Last captured non-placeholder output, if any
    pub fn previous_output(&self) -> Option<&str> {
        self.steps
            .iter()
            .filter(|s| !s.placeholder)
            .max_by_key(|s| s.index)
            .and_then(|s| s.output.as_deref())
    }

    /// The N-th step's captured output (1-indexed)
    pub fn step_output(&self, index: u32) -> Option<&str> {
        self.steps
            .iter()
            .find(|s| s.index == index && !s.placeholder)
            .and_then(|s| s.output.as_deref())
    }

    /// Attach a pending review. A session holds at most one; attaching while
    /// another is outstanding is a logic error surfaced to the caller.
    pub fn begin_review(&mut self, review: PendingReview) -> Result<(), String> {
        if self.pending_review.is_some() {
            return Err(format!(
                "session {} already has a pending review",
                self.chain_id
            ));
        }
        self.pending_review = Some(review);
        self.state = SessionState::PendingReview;
        self.touch();
        Ok(())
    }

    /// Clear any review and advance to the next step or completion
    pub fn advance(&mut self) {
        self.pending_review = None;
        if self.current_step >= self.total_steps {
            self.state = SessionState::Complete;
        } else {
            self.current_step += 1;
            self.state = SessionState::ReadyForStep;
        }
        self.touch();
    }

    /// A failing blocking verdict: bump the attempt counter; exhaust to
    /// awaiting-user-choice at the budget.
    pub fn record_failed_attempt(&mut self, hint: Option<String>) {
        if let Some(review) = self.pending_review.as_mut() {
            review.attempt_count += 1;
            if let Some(hint) = hint {
                review.retry_hints.push(hint);
            }
            if review.attempt_count >= review.max_attempts {
                self.state = SessionState::AwaitingUserChoice;
            } else {
                self.state = SessionState::PendingReview;
            }
        }
        self.touch();
    }

    /// User action `retry`: reset the counter and return to pending review,
    /// keeping `current_step` pinned.
    pub fn reset_for_retry(&mut self) {
        if let Some(review) = self.pending_review.as_mut() {
            review.attempt_count = 0;
        }
        self.state = SessionState::PendingReview;
        self.touch();
    }

    pub fn terminate(&mut self) {
        self.pending_review = None;
        self.state = SessionState::Terminated;
        self.touch();
    }

    pub fn idle_longer_than(&self, limit: std::time::Duration, now: DateTime<Utc>) -> bool {
        (now - self.last_activity).to_std().is_ok_and(|d| d > limit)
    }
}

/// Action a user takes on an exhausted review
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserAction {
    Retry,
    Skip,
    Abort,
}

impl std::str::FromStr for UserAction {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "retry" => Ok(UserAction::Retry),
            "skip" => Ok(UserAction::Skip),
            "abort" => Ok(UserAction::Abort),
            other => Err(format!("unknown action '{}'", other)),
        }
    }
}

/// Validate a client-supplied chain id: `chain-[a-z0-9][a-z0-9-]*`
pub fn is_valid_chain_id(id: &str) -> bool {
    let Some(rest) = id.strip_prefix("chain-") else {
        return false;
    };
    let mut chars = rest.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c.is_ascii_digit() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(total: u32) -> ChainSession {
        ChainSession::new(">>a --> >>b", "a", total, BTreeMap::new())
    }

    #[test]
    fn minted_ids_are_valid() {
        let s = session(2);
        assert!(is_valid_chain_id(&s.chain_id), "{}", s.chain_id);
        assert!(!is_valid_chain_id("chain-"));
        assert!(!is_valid_chain_id("session-abc"));
        assert!(!is_valid_chain_id("chain-ABC"));
        assert!(is_valid_chain_id("chain-0af3"));
    }

    #[test]
    fn advance_increments_once_per_cycle() {
        let mut s = session(3);
        for expected in 1..=3u32 {
            assert_eq!(s.current_step, expected);
            s.record_rendered(format!("step {}", expected));
            assert_eq!(s.state, SessionState::InFlight);
            assert!(s.capture_output(expected, format!("out {}", expected)));
            s.advance();
        }
        assert_eq!(s.state, SessionState::Complete);
    }

    #[test]
    fn placeholder_overwritten_real_output_sticky() {
        let mut s = session(1);
        s.record_rendered("step 1".to_string());
        assert!(s.capture_output(1, "first".to_string()));
        assert!(!s.capture_output(1, "second".to_string()));
        assert_eq!(s.step_output(1), Some("first"));
    }

    #[test]
    fn exhaustion_at_max_attempts_exactly() {
        let mut s = session(1);
        s.record_rendered("step".to_string());
        s.capture_output(1, "out".to_string());
        s.begin_review(PendingReview {
            review_prompt: "review".to_string(),
            gate_ids: vec!["g".to_string()],
            attempt_count: 0,
            max_attempts: 2,
            created_at: Utc::now(),
            retry_hints: vec![],
            history: vec![],
        })
        .unwrap();

        s.record_failed_attempt(Some("missing citation".to_string()));
        assert_eq!(s.state, SessionState::PendingReview);
        s.record_failed_attempt(None);
        assert_eq!(s.state, SessionState::AwaitingUserChoice);
    }

    #[test]
    fn retry_keeps_step_pinned_and_resets_attempts() {
        let mut s = session(2);
        s.record_rendered("step".to_string());
        s.capture_output(1, "out".to_string());
        s.begin_review(PendingReview {
            review_prompt: "review".to_string(),
            gate_ids: vec!["g".to_string()],
            attempt_count: 0,
            max_attempts: 1,
            created_at: Utc::now(),
            retry_hints: vec![],
            history: vec![],
        })
        .unwrap();
        s.record_failed_attempt(None);
        assert_eq!(s.state, SessionState::AwaitingUserChoice);

        let step_before = s.current_step;
        s.reset_for_retry();
        assert_eq!(s.current_step, step_before);
        assert_eq!(s.state, SessionState::PendingReview);
        assert_eq!(s.pending_review.as_ref().unwrap().attempt_count, 0);
    }

    #[test]
    fn only_one_pending_review() {
        let mut s = session(1);
        let review = PendingReview {
            review_prompt: "r".to_string(),
            gate_ids: vec![],
            attempt_count: 0,
            max_attempts: 1,
            created_at: Utc::now(),
            retry_hints: vec![],
            history: vec![],
        };
        s.begin_review(review.clone()).unwrap();
        assert!(s.begin_review(review).is_err());
    }

    #[test]
    fn unknown_user_action_rejected() {
        assert!("retry".parse::<UserAction>().is_ok());
        assert!("SKIP".parse::<UserAction>().is_ok());
        assert!("continue".parse::<UserAction>().is_err());
    }
}
