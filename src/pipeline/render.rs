//! Template renderer: expands {{name}} placeholders against a scoped
//! variable map. Pure, idempotent, and insertion-verbatim.

use crate::pipeline::context::DiagnosticAccumulator;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*([A-Za-z0-9_]+)\s*\}\}").unwrap());

/// Render a template. Unknown variables render as the empty string and emit
/// a warning diagnostic naming the variable.
pub fn render(
    template: &str,
    vars: &BTreeMap<String, String>,
    diagnostics: &mut DiagnosticAccumulator,
    stage: &'static str,
) -> String {
    PLACEHOLDER
        .replace_all(template, |captures: &regex::Captures<'_>| {
            let name = &captures[1];
            match vars.get(name) {
                Some(value) => value.clone(),
                None => {
                    diagnostics.warning(
                        stage,
                        format!("template variable '{{{{{}}}}}' is unbound", name),
                    );
                    String::new()
                }
            }
        })
        .into_owned()
}

/// Variable names referenced by a template, in order of first appearance
pub fn referenced_variables(template: &str) -> Vec<String> {
    let mut seen = Vec::new();
    for captures in PLACEHOLDER.captures_iter(template) {
        let name = captures[1].to_string();
        if !seen.contains(&name) {
            seen.push(name);
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn substitutes_known_variables_verbatim() {
        let mut diags = DiagnosticAccumulator::new();
        let out = render(
            "Review this {{language}} code: {{snippet}}",
            &vars(&[("language", "Rust"), ("snippet", "fn main() { \"x\" }")]),
            &mut diags,
            "enhance",
        );
        assert_eq!(out, "Review this Rust code: fn main() { \"x\" }");
        assert!(diags.entries().is_empty());
    }

    #[test]
    fn unknown_variable_is_empty_with_warning() {
        let mut diags = DiagnosticAccumulator::new();
        let out = render("Hello {{missing}}!", &vars(&[]), &mut diags, "enhance");
        assert_eq!(out, "Hello !");
        assert_eq!(diags.entries().len(), 1);
    }

    #[test]
    fn rendering_is_idempotent_and_ignores_unused_vars() {
        let mut diags = DiagnosticAccumulator::new();
        let map = vars(&[("a", "1"), ("unused", "zzz")]);
        let once = render("{{a}}-{{a}}", &map, &mut diags, "enhance");
        let twice = render("{{a}}-{{a}}", &map, &mut diags, "enhance");
        assert_eq!(once, twice);
        assert_eq!(once, "1-1");
        // A differing unused variable does not change the output
        let map2 = vars(&[("a", "1"), ("unused", "other")]);
        assert_eq!(render("{{a}}-{{a}}", &map2, &mut diags, "enhance"), once);
    }

    #[test]
    fn whitespace_inside_braces_is_tolerated() {
        let mut diags = DiagnosticAccumulator::new();
        let out = render("{{ name }}", &vars(&[("name", "x")]), &mut diags, "enhance");
        assert_eq!(out, "x");
    }

    #[test]
    fn lists_referenced_variables_once() {
        assert_eq!(
            referenced_variables("{{a}} {{b}} {{a}}"),
            vec!["a".to_string(), "b".to_string()]
        );
    }
}
