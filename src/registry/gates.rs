//! Gate definitions: validation criteria the downstream model self-evaluates against

use serde::{Deserialize, Serialize};

/// Gate type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GateType {
    #[default]
    Validation,
    Guidance,
    Verification,
}

/// Gate severity; critical/high default to blocking enforcement
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

/// Policy governing what a failing verdict does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnforcementMode {
    Blocking,
    Advisory,
    Informational,
}

impl Severity {
    /// Default enforcement when the gate carries no override
    pub fn default_enforcement(&self) -> EnforcementMode {
        match self {
            Severity::Critical | Severity::High => EnforcementMode::Blocking,
            Severity::Medium | Severity::Low => EnforcementMode::Advisory,
        }
    }
}

/// Declared shell-verification settings for gates of type `verification`
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VerificationSpec {
    pub command: String,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    /// Re-run the command on retry until it passes or attempts exhaust
    #[serde(default)]
    pub looped: bool,
}

/// Core gate definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gate {
    pub id: String,
    pub name: String,
    #[serde(default, rename = "type")]
    pub gate_type: GateType,
    #[serde(default)]
    pub severity: Severity,
    /// Ordered criterion strings embedded into review prompts
    #[serde(default)]
    pub criteria: Vec<String>,
    /// Optional guidance body injected when gate-guidance injection is on
    #[serde(default)]
    pub guidance: Option<String>,
    #[serde(default)]
    pub enforcement: Option<EnforcementMode>,
    #[serde(default)]
    pub verification: Option<VerificationSpec>,
    /// Attach to every execution as a registry-default source
    #[serde(default)]
    pub is_default: bool,
}

impl Gate {
    /// Effective enforcement: explicit override, else severity default
    pub fn effective_enforcement(&self) -> EnforcementMode {
        self.enforcement
            .unwrap_or_else(|| self.severity.default_enforcement())
    }

    /// An ad-hoc gate from inline `:: '...'` criteria text
    pub fn inline(criteria: String) -> Self {
        let id = inline_gate_id(&criteria);
        Gate {
            id,
            name: "Inline gate".to_string(),
            gate_type: GateType::Validation,
            severity: Severity::High,
            criteria: vec![criteria],
            guidance: None,
            enforcement: None,
            verification: None,
            is_default: false,
        }
    }

    /// An ad-hoc verification gate from a `:: verify:"cmd"` operator
    pub fn inline_verification(spec: VerificationSpec) -> Self {
        let id = format!("verify-{}", inline_gate_id(&spec.command));
        Gate {
            id,
            name: "Shell verification".to_string(),
            gate_type: GateType::Verification,
            severity: Severity::High,
            criteria: vec![format!("Command succeeds: {}", spec.command)],
            guidance: None,
            enforcement: None,
            verification: Some(spec),
            is_default: false,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("gate id must be non-empty".to_string());
        }
        if self.criteria.iter().any(|c| c.trim().is_empty()) {
            return Err(format!("gate '{}' has an empty criterion", self.id));
        }
        if self.gate_type == GateType::Verification {
            match &self.verification {
                Some(v) if !v.command.trim().is_empty() => {}
                _ => {
                    return Err(format!(
                        "verification gate '{}' must declare a command",
                        self.id
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Stable id for ad-hoc gates derived from their text
fn inline_gate_id(text: &str) -> String {
    let slug: String = text
        .chars()
        .take(32)
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    format!("inline-{}", slug.trim_matches('-'))
}
