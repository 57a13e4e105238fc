//! Argument processor: binds a prompt's declared arguments from the residual
//! command text, prior chain outputs, and a small environment whitelist.

use crate::error::{PromptLoomError, Result};
use crate::registry::Prompt;
use std::collections::BTreeMap;

/// Chain-scoped variables available to argument resolution
#[derive(Debug, Clone, Default)]
pub struct ArgContext {
    pub previous_step_output: Option<String>,
    /// Captured outputs keyed by 1-indexed step
    pub step_results: BTreeMap<u32, String>,
}

impl ArgContext {
    /// Value of a chain-context variable name (`previous_step_output`,
    /// `stepN_result`), if defined
    pub fn lookup(&self, name: &str) -> Option<&str> {
        if name == "previous_step_output" {
            return self.previous_step_output.as_deref();
        }
        let n = name
            .strip_prefix("step")?
            .strip_suffix("_result")?
            .parse::<u32>()
            .ok()?;
        self.step_results.get(&n).map(String::as_str)
    }
}

/// Resolve the name→value mapping for one prompt invocation.
///
/// Accepted argument shapes, in recognition order: a single JSON object,
/// `key=value` pairs (quoted values arrive unquoted from the tokenizer),
/// and a positional free-text value bound to the first required argument.
pub fn process(
    prompt: &Prompt,
    raw_args: &[String],
    ctx: &ArgContext,
    env_whitelist: &[String],
) -> Result<BTreeMap<String, String>> {
    let mut values: BTreeMap<String, String> = BTreeMap::new();
    let mut positional: Vec<String> = Vec::new();

    if let Some(object) = parse_json_object(raw_args) {
        for (key, value) in object {
            values.insert(key, json_to_string(&value));
        }
    } else {
        for token in raw_args {
            match token.split_once('=') {
                Some((key, value)) if !key.is_empty() && is_identifier(key) => {
                    values.insert(key.to_string(), value.to_string());
                }
                _ => positional.push(token.clone()),
            }
        }
    }

    // Positional free text binds to the first required argument still unbound
    if !positional.is_empty() {
        let text = positional.join(" ");
        match prompt
            .arguments
            .iter()
            .find(|a| a.required && !values.contains_key(&a.name))
        {
            Some(arg) => {
                values.insert(arg.name.clone(), text);
            }
            None => {
                // No required slot left; keep it addressable for templates
                values.entry("input".to_string()).or_insert(text);
            }
        }
    }

    // Fill remaining declared arguments from defaults, chain context, env
    for arg in &prompt.arguments {
        if values.contains_key(&arg.name) {
            continue;
        }
        if let Some(default) = &arg.default {
            values.insert(arg.name.clone(), default.clone());
            continue;
        }
        if let Some(value) = ctx.lookup(&arg.name) {
            values.insert(arg.name.clone(), value.to_string());
            continue;
        }
        if env_whitelist.iter().any(|w| w == &arg.name.to_uppercase())
            && let Ok(value) = std::env::var(arg.name.to_uppercase())
        {
            values.insert(arg.name.clone(), value);
            continue;
        }
        // The chain arrow feeds the left step's output into the right step
        if arg.required
            && let Some(previous) = &ctx.previous_step_output
        {
            values.insert(arg.name.clone(), previous.clone());
        }
    }

    if let Some(missing) = prompt
        .arguments
        .iter()
        .find(|a| a.required && !values.contains_key(&a.name))
    {
        return Err(PromptLoomError::Argument {
            message: format!(
                "required argument '{}' of prompt '{}' is unbound",
                missing.name, prompt.id
            ),
        });
    }

    Ok(values)
}

/// Resolve a referenced chain step's inputs through its declared mapping
/// (chain variable -> referenced prompt argument) instead of name matching.
pub fn apply_input_mapping(
    mapping: &BTreeMap<String, String>,
    chain_vars: &BTreeMap<String, String>,
    ctx: &ArgContext,
) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for (chain_var, arg_name) in mapping {
        let value = chain_vars
            .get(chain_var)
            .map(String::as_str)
            .or_else(|| ctx.lookup(chain_var));
        if let Some(value) = value {
            out.insert(arg_name.clone(), value.to_string());
        }
    }
    out
}

fn parse_json_object(raw_args: &[String]) -> Option<serde_json::Map<String, serde_json::Value>> {
    let candidate = match raw_args {
        [single] => single.clone(),
        [] => return None,
        many => {
            let joined = many.join(" ");
            if !joined.trim_start().starts_with('{') {
                return None;
            }
            joined
        }
    };
    match serde_json::from_str::<serde_json::Value>(candidate.trim()) {
        Ok(serde_json::Value::Object(map)) => Some(map),
        _ => None,
    }
}

fn json_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn is_identifier(s: &str) -> bool {
    s.chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::PromptArgument;

    fn prompt_with_args(args: &[(&str, bool)]) -> Prompt {
        Prompt {
            id: "p".to_string(),
            name: "P".to_string(),
            category: "test".to_string(),
            description: String::new(),
            arguments: args
                .iter()
                .map(|(name, required)| PromptArgument {
                    name: (*name).to_string(),
                    required: *required,
                    description: None,
                    default: None,
                })
                .collect(),
            template: "t".to_string(),
            system_template: None,
            chain_steps: vec![],
            gates: vec![],
        }
    }

    #[test]
    fn key_value_pairs_bind_by_name() {
        let prompt = prompt_with_args(&[("language", true), ("focus", false)]);
        let values = process(
            &prompt,
            &["language=Rust".to_string(), "focus=errors".to_string()],
            &ArgContext::default(),
            &[],
        )
        .unwrap();
        assert_eq!(values["language"], "Rust");
        assert_eq!(values["focus"], "errors");
    }

    #[test]
    fn json_object_shape() {
        let prompt = prompt_with_args(&[("topic", true), ("depth", false)]);
        let values = process(
            &prompt,
            &["{\"topic\": \"caching\", \"depth\": 2}".to_string()],
            &ArgContext::default(),
            &[],
        )
        .unwrap();
        assert_eq!(values["topic"], "caching");
        assert_eq!(values["depth"], "2");
    }

    #[test]
    fn positional_binds_first_required() {
        let prompt = prompt_with_args(&[("content", true)]);
        let values = process(
            &prompt,
            &["summarize".to_string(), "this".to_string()],
            &ArgContext::default(),
            &[],
        )
        .unwrap();
        assert_eq!(values["content"], "summarize this");
    }

    #[test]
    fn chain_context_fills_named_variables() {
        let prompt = prompt_with_args(&[("previous_step_output", false), ("step1_result", false)]);
        let mut ctx = ArgContext::default();
        ctx.previous_step_output = Some("alpha".to_string());
        ctx.step_results.insert(1, "alpha".to_string());
        let values = process(&prompt, &[], &ctx, &[]).unwrap();
        assert_eq!(values["previous_step_output"], "alpha");
        assert_eq!(values["step1_result"], "alpha");
    }

    #[test]
    fn previous_output_feeds_unbound_required_arg() {
        let prompt = prompt_with_args(&[("query", true)]);
        let mut ctx = ArgContext::default();
        ctx.previous_step_output = Some("from step one".to_string());
        let values = process(&prompt, &[], &ctx, &[]).unwrap();
        assert_eq!(values["query"], "from step one");
    }

    #[test]
    fn missing_required_is_error() {
        let prompt = prompt_with_args(&[("content", true)]);
        let err = process(&prompt, &[], &ArgContext::default(), &[]).unwrap_err();
        assert!(matches!(err, PromptLoomError::Argument { .. }));
    }

    #[test]
    fn defaults_fill_optionals() {
        let mut prompt = prompt_with_args(&[("tone", false)]);
        prompt.arguments[0].default = Some("neutral".to_string());
        let values = process(&prompt, &[], &ArgContext::default(), &[]).unwrap();
        assert_eq!(values["tone"], "neutral");
    }

    #[test]
    fn input_mapping_overrides_name_matching() {
        let mapping: BTreeMap<String, String> =
            [("step1_result".to_string(), "content".to_string())].into();
        let mut ctx = ArgContext::default();
        ctx.step_results.insert(1, "mapped".to_string());
        let out = apply_input_mapping(&mapping, &BTreeMap::new(), &ctx);
        assert_eq!(out["content"], "mapped");
    }
}
