//! Prompt definitions and their persisted descriptor form

use serde::{Deserialize, Serialize};

/// One declared argument of a prompt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptArgument {
    pub name: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub description: Option<String>,
    /// Default used when the caller leaves the argument unbound
    #[serde(default)]
    pub default: Option<String>,
}

/// One step of a chain prompt: either a literal instruction block or a
/// reference to another prompt with variable mappings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ChainStep {
    Embedded {
        instruction: String,
        /// What the model is expected to produce for this step
        expected_output: String,
    },
    Reference {
        prompt_id: String,
        /// chain variable name -> referenced prompt argument name
        #[serde(default)]
        input_mapping: std::collections::BTreeMap<String, String>,
        /// referenced prompt output -> chain variable name
        #[serde(default)]
        output_mapping: std::collections::BTreeMap<String, String>,
    },
}

/// Core prompt definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prompt {
    /// Stable identifier, lowercase with separators
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub description: String,
    /// Ordered argument list
    #[serde(default)]
    pub arguments: Vec<PromptArgument>,
    /// User-message template with {{name}} placeholders
    pub template: String,
    #[serde(default)]
    pub system_template: Option<String>,
    /// Non-empty for chain prompts; steps are indexed 1..N
    #[serde(default)]
    pub chain_steps: Vec<ChainStep>,
    /// Gate ids attached at the prompt level
    #[serde(default)]
    pub gates: Vec<String>,
}

impl Prompt {
    /// Whether this prompt expands into a multi-step chain
    pub fn is_chain(&self) -> bool {
        !self.chain_steps.is_empty()
    }

    /// Total steps when executed: chain length, or 1 for a single prompt
    pub fn total_steps(&self) -> u32 {
        if self.is_chain() {
            self.chain_steps.len() as u32
        } else {
            1
        }
    }

    /// First required argument, if any (positional binding target)
    pub fn first_required_argument(&self) -> Option<&PromptArgument> {
        self.arguments.iter().find(|a| a.required)
    }

    /// Basic well-formedness used at load and create time
    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("prompt id must be non-empty".to_string());
        }
        if self.id.chars().any(|c| c.is_ascii_uppercase()) {
            return Err(format!("prompt id '{}' must be lowercase", self.id));
        }
        if !self
            .id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(format!("prompt id '{}' has invalid characters", self.id));
        }
        if self.template.trim().is_empty() && self.chain_steps.is_empty() {
            return Err(format!("prompt '{}' has neither template nor steps", self.id));
        }
        for (i, step) in self.chain_steps.iter().enumerate() {
            if let ChainStep::Reference { prompt_id, .. } = step {
                if prompt_id.trim().is_empty() {
                    return Err(format!("step {} of '{}' references an empty id", i + 1, self.id));
                }
            }
        }
        Ok(())
    }
}
