//! Methodology (reasoning framework) definitions and the built-in set

use serde::{Deserialize, Serialize};

/// A structured reasoning template injected into outgoing prompts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Methodology {
    pub id: String,
    pub name: String,
    /// Guidance block appended when system-prompt injection is on
    pub system_prompt: String,
    /// Ordered reasoning phases
    #[serde(default)]
    pub phases: Vec<String>,
    /// Gate ids this methodology contributes (priority 40 source)
    #[serde(default)]
    pub gates: Vec<String>,
    /// Recommended style block
    #[serde(default)]
    pub style: Option<String>,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl Methodology {
    /// Completeness score in [0.0, 1.0]. System prompt, phases, and gates
    /// together carry 80%; name and style the remainder.
    pub fn completeness_score(&self) -> f32 {
        let mut score = 0.0;
        if !self.system_prompt.trim().is_empty() {
            score += 0.35;
        }
        if !self.phases.is_empty() {
            score += 0.25;
        }
        if !self.gates.is_empty() {
            score += 0.20;
        }
        if !self.name.trim().is_empty() {
            score += 0.10;
        }
        if self.style.as_deref().is_some_and(|s| !s.trim().is_empty()) {
            score += 0.10;
        }
        score
    }

    /// A methodology is valid only when guidance, phases, and gates are all
    /// non-empty. Partial methodologies are rejected at creation.
    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("methodology id must be non-empty".to_string());
        }
        if self.system_prompt.trim().is_empty() {
            return Err(format!("methodology '{}' is missing system-prompt guidance", self.id));
        }
        if self.phases.is_empty() {
            return Err(format!("methodology '{}' has no phases", self.id));
        }
        if self.gates.is_empty() {
            return Err(format!("methodology '{}' has no gates", self.id));
        }
        Ok(())
    }
}

/// Built-in methodology set seeded when the methodology tree supplies none
pub fn builtin_methodologies() -> Vec<Methodology> {
    vec![
        Methodology {
            id: "cageerf".to_string(),
            name: "CAGEERF".to_string(),
            system_prompt: "Work through the task with the CAGEERF structure. \
Establish Context before anything else, then Analyze the problem space, state \
explicit Goals, plan the Execution, Evaluate the result against the goals, \
Refine where the evaluation found gaps, and close with the Framework summary \
of what was decided and why."
                .to_string(),
            phases: vec![
                "context".to_string(),
                "analysis".to_string(),
                "goals".to_string(),
                "execution".to_string(),
                "evaluation".to_string(),
                "refinement".to_string(),
                "framework".to_string(),
            ],
            gates: vec!["goals-stated".to_string(), "evaluation-present".to_string()],
            style: Some("analytical".to_string()),
            priority: Some(10),
            enabled: true,
        },
        Methodology {
            id: "react".to_string(),
            name: "ReACT".to_string(),
            system_prompt: "Alternate explicit Thought and Action records. Each \
Thought states what is known and what to try next; each Action names the \
concrete step taken and its observed result. Conclude with a final answer \
that cites the decisive observations."
                .to_string(),
            phases: vec![
                "thought".to_string(),
                "action".to_string(),
                "observation".to_string(),
                "answer".to_string(),
            ],
            gates: vec!["observations-cited".to_string()],
            style: Some("concise".to_string()),
            priority: Some(8),
            enabled: true,
        },
        Methodology {
            id: "5w1h".to_string(),
            name: "5W1H".to_string(),
            system_prompt: "Cover Who, What, When, Where, Why, and How before \
concluding. Answer each question explicitly, marking any that do not apply, \
then synthesize the six answers into the response."
                .to_string(),
            phases: vec![
                "who".to_string(),
                "what".to_string(),
                "when".to_string(),
                "where".to_string(),
                "why".to_string(),
                "how".to_string(),
            ],
            gates: vec!["all-questions-answered".to_string()],
            style: Some("analytical".to_string()),
            priority: Some(5),
            enabled: true,
        },
        Methodology {
            id: "scamper".to_string(),
            name: "SCAMPER".to_string(),
            system_prompt: "Generate alternatives with SCAMPER: Substitute, \
Combine, Adapt, Modify, Put to other use, Eliminate, Reverse. Produce at \
least one candidate per lens before ranking them."
                .to_string(),
            phases: vec![
                "substitute".to_string(),
                "combine".to_string(),
                "adapt".to_string(),
                "modify".to_string(),
                "put-to-other-use".to_string(),
                "eliminate".to_string(),
                "reverse".to_string(),
            ],
            gates: vec!["one-candidate-per-lens".to_string()],
            style: Some("exploratory".to_string()),
            priority: Some(5),
            enabled: true,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_are_valid_and_complete() {
        for m in builtin_methodologies() {
            assert!(m.validate().is_ok(), "{} invalid", m.id);
            assert!(
                m.completeness_score() >= 0.8,
                "{} score {}",
                m.id,
                m.completeness_score()
            );
        }
    }

    #[test]
    fn partial_methodology_rejected() {
        let m = Methodology {
            id: "half".to_string(),
            name: "Half".to_string(),
            system_prompt: "guidance".to_string(),
            phases: vec![],
            gates: vec![],
            style: None,
            priority: None,
            enabled: true,
        };
        assert!(m.validate().is_err());
        assert!(m.completeness_score() < 0.8);
    }
}
