//! Symbolic command parser: quote-aware tokenization and operator
//! recognition against the current registry snapshot.
//!
//! The parser is pure: identical input and snapshot yield identical output.

use crate::command::tokens::{Modifier, Operator, ParsedCommand, VerifyOperator};
use crate::error::{PromptLoomError, Result};
use crate::registry::RegistrySnapshot;

/// Repeat bounds for the `* N` operator
const REPEAT_MIN: u32 = 2;
const REPEAT_MAX: u32 = 20;

/// One scanned token with its byte position in the input
#[derive(Debug, Clone)]
struct RawToken {
    text: String,
    pos: usize,
    /// Any part of the token came from a quoted span
    quoted: bool,
    /// The token opened with a quote (a pure literal, never an operator)
    leading_quote: bool,
}

/// Split the input into whitespace-separated tokens. Single- and
/// double-quoted spans carry spaces and operator characters literally.
fn scan(input: &str) -> Result<Vec<RawToken>> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();

    while let Some(&(start, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        let mut text = String::new();
        let mut quoted = false;
        let mut leading_quote = false;
        let mut first = true;
        while let Some(&(pos, c)) = chars.peek() {
            if c.is_whitespace() {
                break;
            }
            if c == '\'' || c == '"' {
                if first {
                    leading_quote = true;
                }
                quoted = true;
                let quote = c;
                chars.next();
                let mut closed = false;
                for (_, inner) in chars.by_ref() {
                    if inner == quote {
                        closed = true;
                        break;
                    }
                    text.push(inner);
                }
                if !closed {
                    return Err(PromptLoomError::Parse {
                        message: "unterminated quote".to_string(),
                        position: pos,
                        token: text,
                    });
                }
            } else {
                text.push(c);
                chars.next();
            }
            first = false;
        }
        tokens.push(RawToken {
            text,
            pos: start,
            quoted,
            leading_quote,
        });
    }
    Ok(tokens)
}

/// Parse a command string against the registry snapshot.
///
/// Unknown `@NAME` and `#style` tokens degrade to argument text; unknown
/// `>>id`, malformed repeat counts, unterminated quotes, and dangling gate
/// operators are errors.
pub fn parse(input: &str, registry: &RegistrySnapshot) -> Result<ParsedCommand> {
    let input = input.trim();
    let tokens = scan(input)?;

    let mut operators: Vec<Operator> = Vec::new();
    let mut current_ref: Option<usize> = None;
    let mut after_chain = false;
    let mut leading_text: Vec<String> = Vec::new();

    let mut i = 0;
    while i < tokens.len() {
        let token = &tokens[i];
        let text = token.text.as_str();

        // Fully quoted tokens are always literal argument text
        if !token.leading_quote {
            if text == "-->" {
                if current_ref.is_none() {
                    return Err(PromptLoomError::Parse {
                        message: "chain arrow with no prior prompt".to_string(),
                        position: token.pos,
                        token: text.to_string(),
                    });
                }
                operators.push(Operator::Chain);
                after_chain = true;
                i += 1;
                continue;
            }

            if let Some(id) = text.strip_prefix(">>") {
                push_prompt_ref(&mut operators, &mut current_ref, registry, id, token)?;
                after_chain = false;
                i += 1;
                continue;
            }

            // A bare identifier directly after --> is accepted as a prompt
            // reference when it names a registered prompt
            if after_chain
                && !token.quoted
                && registry.get_prompt(text).is_some()
            {
                push_prompt_ref(&mut operators, &mut current_ref, registry, text, token)?;
                after_chain = false;
                i += 1;
                continue;
            }

            if text == "*" || (text.starts_with('*') && text.len() > 1) {
                let (count_text, consumed) = if text == "*" {
                    let Some(next) = tokens.get(i + 1) else {
                        return Err(PromptLoomError::Parse {
                            message: "repeat operator missing count".to_string(),
                            position: token.pos,
                            token: text.to_string(),
                        });
                    };
                    (next.text.clone(), 2)
                } else {
                    (text[1..].to_string(), 1)
                };
                let count = count_text.parse::<u32>().ok().filter(|n| {
                    (REPEAT_MIN..=REPEAT_MAX).contains(n)
                });
                let Some(count) = count else {
                    return Err(PromptLoomError::Parse {
                        message: format!(
                            "malformed repeat count (expected {}..={})",
                            REPEAT_MIN, REPEAT_MAX
                        ),
                        position: token.pos,
                        token: count_text,
                    });
                };
                if current_ref.is_none() {
                    return Err(PromptLoomError::Parse {
                        message: "repeat with no prior prompt".to_string(),
                        position: token.pos,
                        token: text.to_string(),
                    });
                }
                operators.push(Operator::Repeat(count));
                i += consumed;
                continue;
            }

            if let Some(name) = text.strip_prefix('@') {
                // First match wins; later @ tokens degrade to argument text
                let already = operators
                    .iter()
                    .any(|op| matches!(op, Operator::Methodology(_)));
                if !already && !name.is_empty() && registry.get_methodology(name).is_some() {
                    operators.push(Operator::Methodology(name.to_string()));
                    i += 1;
                    continue;
                }
            }

            if let Some(name) = text.strip_prefix('#') {
                let already = operators.iter().any(|op| matches!(op, Operator::Style(_)));
                if !already && !name.is_empty() && registry.get_style(name).is_some() {
                    operators.push(Operator::Style(name.to_string()));
                    i += 1;
                    continue;
                }
            }

            if let Some(name) = text.strip_prefix('%') {
                if let Some(modifier) = Modifier::from_name(name) {
                    operators.push(Operator::Modifier(modifier));
                    i += 1;
                    continue;
                }
            }

            if text == "::" || text.starts_with("::") {
                let consumed = parse_gate_operator(&tokens, i, &mut operators)?;
                i += consumed;
                continue;
            }
        }

        // Argument text: attach to the most recent prompt reference
        match current_ref {
            Some(ref_index) => {
                if let Operator::PromptRef { args, .. } = &mut operators[ref_index] {
                    args.push(token.text.clone());
                }
            }
            None => leading_text.push(token.text.clone()),
        }
        after_chain = false;
        i += 1;
    }

    let residual = match operators.iter().rev().find_map(|op| match op {
        Operator::PromptRef { args, .. } => Some(args.join(" ")),
        _ => None,
    }) {
        Some(args) => args,
        None => leading_text.join(" "),
    };

    Ok(ParsedCommand {
        operators,
        residual,
    })
}

fn push_prompt_ref(
    operators: &mut Vec<Operator>,
    current_ref: &mut Option<usize>,
    registry: &RegistrySnapshot,
    id: &str,
    token: &RawToken,
) -> Result<()> {
    if id.is_empty() {
        return Err(PromptLoomError::Parse {
            message: "prompt reference missing id".to_string(),
            position: token.pos,
            token: token.text.clone(),
        });
    }
    if registry.get_prompt(id).is_none() {
        return Err(PromptLoomError::UnknownPrompt { id: id.to_string() });
    }
    operators.push(Operator::PromptRef {
        id: id.to_string(),
        args: Vec::new(),
    });
    *current_ref = Some(operators.len() - 1);
    Ok(())
}

/// Handle `::` and its operand. Returns how many tokens were consumed.
fn parse_gate_operator(
    tokens: &[RawToken],
    index: usize,
    operators: &mut Vec<Operator>,
) -> Result<usize> {
    let token = &tokens[index];

    // `::'criteria'` glued into one token
    if token.text.len() > 2 && token.text.starts_with("::") {
        let rest = token.text[2..].to_string();
        if token.quoted {
            operators.push(Operator::InlineGate(rest));
        } else if let Some(spec) = rest.strip_prefix("verify:") {
            let (verify, extra) = parse_verify(spec, tokens, index + 1, token)?;
            operators.push(Operator::Verify(verify));
            return Ok(1 + extra);
        } else {
            operators.push(Operator::NamedGate(rest));
        }
        return Ok(1);
    }

    let Some(operand) = tokens.get(index + 1) else {
        return Err(PromptLoomError::Parse {
            message: "gate operator missing operand".to_string(),
            position: token.pos,
            token: token.text.clone(),
        });
    };

    if operand.leading_quote {
        operators.push(Operator::InlineGate(operand.text.clone()));
        return Ok(2);
    }
    if let Some(spec) = operand.text.strip_prefix("verify:") {
        let (verify, extra) = parse_verify(spec, tokens, index + 2, operand)?;
        operators.push(Operator::Verify(verify));
        return Ok(2 + extra);
    }
    if operand.quoted {
        operators.push(Operator::InlineGate(operand.text.clone()));
        return Ok(2);
    }
    operators.push(Operator::NamedGate(operand.text.clone()));
    Ok(2)
}

/// Parse a verify command plus its trailing option tokens
/// (`timeout:N`, `loop:true`, `max:N`, `preset:name`).
fn parse_verify(
    command: &str,
    tokens: &[RawToken],
    options_from: usize,
    operand: &RawToken,
) -> Result<(VerifyOperator, usize)> {
    if command.trim().is_empty() {
        return Err(PromptLoomError::Parse {
            message: "verify gate missing command".to_string(),
            position: operand.pos,
            token: operand.text.clone(),
        });
    }
    let mut verify = VerifyOperator {
        command: command.to_string(),
        timeout_secs: None,
        max_attempts: None,
        looped: false,
        preset: None,
    };
    let mut consumed = 0;
    while let Some(token) = tokens.get(options_from + consumed) {
        if token.leading_quote {
            break;
        }
        let Some((key, value)) = token.text.split_once(':') else {
            break;
        };
        match key {
            "timeout" => {
                let secs = value.parse::<u64>().map_err(|_| PromptLoomError::Parse {
                    message: "malformed verify timeout".to_string(),
                    position: token.pos,
                    token: token.text.clone(),
                })?;
                verify.timeout_secs = Some(secs);
            }
            "max" => {
                let max = value.parse::<u32>().map_err(|_| PromptLoomError::Parse {
                    message: "malformed verify max attempts".to_string(),
                    position: token.pos,
                    token: token.text.clone(),
                })?;
                verify.max_attempts = Some(max);
            }
            "loop" => {
                verify.looped = value == "true";
            }
            "preset" => {
                verify.preset = Some(value.to_string());
            }
            _ => break,
        }
        consumed += 1;
    }
    Ok((verify, consumed))
}
