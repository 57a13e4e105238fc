//! Operator token types produced by the symbolic command parser.
//!
//! Tokenization produces this stream plus a residual argument string;
//! deciding where each operator applies (methodology wraps the whole chain,
//! gates attach to the last prompt, style attaches to the response) is a
//! separate planning pass.

use serde::{Deserialize, Serialize};

/// Behavior toggles carried by `%modifier` tokens
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modifier {
    /// Force all injection off
    Clean,
    /// Force system-prompt and style injection off; gate guidance unaffected
    Lean,
    /// Force system-prompt injection on
    Guided,
    /// Permit injection and enable the model-driven selection phase
    Judge,
}

impl Modifier {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "clean" => Some(Modifier::Clean),
            "lean" => Some(Modifier::Lean),
            "guided" => Some(Modifier::Guided),
            "judge" => Some(Modifier::Judge),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Modifier::Clean => "clean",
            Modifier::Lean => "lean",
            Modifier::Guided => "guided",
            Modifier::Judge => "judge",
        }
    }
}

/// Options of a `:: verify:"cmd"` shell-verification gate operator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyOperator {
    pub command: String,
    pub timeout_secs: Option<u64>,
    pub max_attempts: Option<u32>,
    pub looped: bool,
    /// Preset bundle name (`fast` | `full` | `extended`), if given
    pub preset: Option<String>,
}

/// One parsed operator in command order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    /// `>>id` (or a bare id directly after `-->`), with the raw argument
    /// tokens that followed it
    PromptRef { id: String, args: Vec<String> },
    /// `-->`
    Chain,
    /// `* N`
    Repeat(u32),
    /// `@NAME` that matched a registered methodology
    Methodology(String),
    /// `:: 'free-text criteria'`
    InlineGate(String),
    /// `:: gate_id`
    NamedGate(String),
    /// `%clean` / `%lean` / `%guided` / `%judge`
    Modifier(Modifier),
    /// `#style` that matched a registered style
    Style(String),
    /// `:: verify:"cmd" [timeout:N] [loop:true] [max:N]`
    Verify(VerifyOperator),
}

/// Parser output: the ordered operator list plus the free-text suffix after
/// the last structural operator (positional arguments of the last prompt).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ParsedCommand {
    pub operators: Vec<Operator>,
    pub residual: String,
}

impl ParsedCommand {
    /// Prompt references in order
    pub fn prompt_refs(&self) -> Vec<(&str, &[String])> {
        self.operators
            .iter()
            .filter_map(|op| match op {
                Operator::PromptRef { id, args } => Some((id.as_str(), args.as_slice())),
                _ => None,
            })
            .collect()
    }

    pub fn modifiers(&self) -> Vec<Modifier> {
        self.operators
            .iter()
            .filter_map(|op| match op {
                Operator::Modifier(m) => Some(*m),
                _ => None,
            })
            .collect()
    }

    pub fn has_modifier(&self, modifier: Modifier) -> bool {
        self.modifiers().contains(&modifier)
    }

    /// First methodology override; later `@` tokens were degraded to text
    pub fn methodology(&self) -> Option<&str> {
        self.operators.iter().find_map(|op| match op {
            Operator::Methodology(id) => Some(id.as_str()),
            _ => None,
        })
    }

    pub fn style(&self) -> Option<&str> {
        self.operators.iter().find_map(|op| match op {
            Operator::Style(id) => Some(id.as_str()),
            _ => None,
        })
    }

    /// Re-serialize the operator list to a command string whose re-parse
    /// equals this parse.
    pub fn to_command_string(&self) -> String {
        let mut parts: Vec<String> = Vec::new();
        for op in &self.operators {
            match op {
                Operator::PromptRef { id, args } => {
                    parts.push(format!(">>{}", id));
                    for arg in args {
                        parts.push(quote_if_needed(arg));
                    }
                }
                Operator::Chain => parts.push("-->".to_string()),
                Operator::Repeat(n) => parts.push(format!("* {}", n)),
                Operator::Methodology(id) => parts.push(format!("@{}", id)),
                Operator::InlineGate(text) => parts.push(format!(":: '{}'", text)),
                Operator::NamedGate(id) => parts.push(format!(":: {}", id)),
                Operator::Modifier(m) => parts.push(format!("%{}", m.name())),
                Operator::Style(id) => parts.push(format!("#{}", id)),
                Operator::Verify(v) => {
                    let mut piece = format!(":: verify:\"{}\"", v.command);
                    if let Some(t) = v.timeout_secs {
                        piece.push_str(&format!(" timeout:{}", t));
                    }
                    if v.looped {
                        piece.push_str(" loop:true");
                    }
                    if let Some(m) = v.max_attempts {
                        piece.push_str(&format!(" max:{}", m));
                    }
                    if let Some(p) = &v.preset {
                        piece.push_str(&format!(" preset:{}", p));
                    }
                    parts.push(piece);
                }
            }
        }
        parts.join(" ")
    }
}

/// Quote an argument token for re-serialization when it carries whitespace
/// or operator characters.
fn quote_if_needed(arg: &str) -> String {
    let needs_quotes = arg.chars().any(char::is_whitespace);
    if !needs_quotes {
        return arg.to_string();
    }
    if let Some((key, value)) = arg.split_once('=') {
        if !key.chars().any(char::is_whitespace) {
            return format!("{}=\"{}\"", key, value);
        }
    }
    format!("\"{}\"", arg)
}
