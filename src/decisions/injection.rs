//! Injection decision service: resolves, per call and per injection type,
//! whether methodology / gate / style guidance is placed into the outgoing
//! prompt, and at what frequency.

use crate::command::Modifier;
use crate::config::{Config, Frequency, InjectionTarget, InjectionTypeConfig};
use crate::decisions::overrides::RuntimeOverrides;
use chrono::Utc;
use std::collections::{HashMap, HashSet};

/// The three injection types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InjectionType {
    SystemPrompt,
    GateGuidance,
    StyleGuidance,
}

impl InjectionType {
    pub fn key(&self) -> &'static str {
        match self {
            InjectionType::SystemPrompt => "system-prompt",
            InjectionType::GateGuidance => "gate-guidance",
            InjectionType::StyleGuidance => "style-guidance",
        }
    }

    pub const ALL: [InjectionType; 3] = [
        InjectionType::SystemPrompt,
        InjectionType::GateGuidance,
        InjectionType::StyleGuidance,
    ];
}

/// Everything the resolution chain may consult for one call
#[derive(Debug, Clone, Default)]
pub struct DecisionInputs {
    pub modifiers: Vec<Modifier>,
    pub chain_id: Option<String>,
    pub category: String,
    /// 1-indexed current step
    pub step: u32,
    pub total_steps: u32,
    /// Outcome of the previous step's gate review, when one ran
    pub previous_step_success: Option<bool>,
    /// Gate ids that have passed so far in this session
    pub passed_gates: HashSet<String>,
}

/// A resolved decision with its provenance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InjectionDecision {
    pub enabled: bool,
    pub frequency: Frequency,
    pub target: InjectionTarget,
    /// Which priority level decided (for diagnostics)
    pub source: DecisionSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionSource {
    Modifier,
    RuntimeOverride,
    StepRule,
    ChainRule,
    CategoryRule,
    GlobalConfig,
    Builtin,
}

impl InjectionDecision {
    /// Whether guidance is actually placed at the given step
    pub fn injects_at(&self, step: u32) -> bool {
        self.enabled && self.frequency.matches_step(step)
    }

    /// Whether this decision's target covers a normal step / a gate review
    pub fn covers(&self, gate_prompt: bool) -> bool {
        match self.target {
            InjectionTarget::Both => true,
            InjectionTarget::Steps => !gate_prompt,
            InjectionTarget::Gates => gate_prompt,
        }
    }
}

/// Per-request decision service. Decisions are cached per injection type;
/// the cache must be invalidated on config reload or session reset.
pub struct InjectionDecisionService<'a> {
    config: &'a Config,
    overrides: &'a RuntimeOverrides,
    cache: HashMap<InjectionType, InjectionDecision>,
}

impl<'a> InjectionDecisionService<'a> {
    pub fn new(config: &'a Config, overrides: &'a RuntimeOverrides) -> Self {
        Self {
            config,
            overrides,
            cache: HashMap::new(),
        }
    }

    pub fn invalidate(&mut self) {
        self.cache.clear();
    }

    /// Resolve the decision for one injection type, consulting the priority
    /// chain from modifiers down to the built-in default.
    pub fn decide(&mut self, ty: InjectionType, inputs: &DecisionInputs) -> InjectionDecision {
        if let Some(cached) = self.cache.get(&ty) {
            return *cached;
        }
        let decision = self.resolve(ty, inputs);
        self.cache.insert(ty, decision);
        decision
    }

    fn resolve(&self, ty: InjectionType, inputs: &DecisionInputs) -> InjectionDecision {
        let type_config = self.type_config(ty);
        let target = type_config.target;

        // 1. Command modifiers
        if inputs.modifiers.contains(&Modifier::Clean) {
            return InjectionDecision {
                enabled: false,
                frequency: Frequency::Never,
                target,
                source: DecisionSource::Modifier,
            };
        }
        if inputs.modifiers.contains(&Modifier::Lean)
            && matches!(ty, InjectionType::SystemPrompt | InjectionType::StyleGuidance)
        {
            return InjectionDecision {
                enabled: false,
                frequency: Frequency::Never,
                target,
                source: DecisionSource::Modifier,
            };
        }
        if inputs.modifiers.contains(&Modifier::Guided) && ty == InjectionType::SystemPrompt {
            return InjectionDecision {
                enabled: true,
                frequency: Frequency::Always,
                target,
                source: DecisionSource::Modifier,
            };
        }

        // 2. Runtime override (session or chain scope)
        if let Some((enabled, frequency)) = self.overrides.lookup_injection(
            inputs.chain_id.as_deref(),
            ty.key(),
            Utc::now(),
        ) {
            return InjectionDecision {
                enabled,
                frequency: frequency.unwrap_or(type_config.frequency),
                target,
                source: DecisionSource::RuntimeOverride,
            };
        }

        // 3-5. Configured rules: step, then chain, then category scope
        for (scope, source) in [
            ("step", DecisionSource::StepRule),
            ("chain", DecisionSource::ChainRule),
            ("category", DecisionSource::CategoryRule),
        ] {
            if let Some(rule) = self
                .config
                .injection
                .rules
                .iter()
                .find(|r| r.scope == scope && r.injection == ty.key() && rule_matches(r, inputs))
            {
                return InjectionDecision {
                    enabled: rule.enabled,
                    frequency: rule.frequency.unwrap_or(type_config.frequency),
                    target,
                    source,
                };
            }
        }

        // 6. Global config default (anything differing from the builtin)
        InjectionDecision {
            enabled: type_config.enabled,
            frequency: type_config.frequency,
            target,
            source: DecisionSource::GlobalConfig,
        }
    }

    fn type_config(&self, ty: InjectionType) -> &InjectionTypeConfig {
        match ty {
            InjectionType::SystemPrompt => &self.config.injection.system_prompt,
            InjectionType::GateGuidance => &self.config.injection.gate_guidance,
            InjectionType::StyleGuidance => &self.config.injection.style_guidance,
        }
    }
}

/// Built-in system default (priority 7): system-prompt on, gate-guidance on,
/// style-guidance first-only.
pub fn builtin_default(ty: InjectionType) -> InjectionDecision {
    let (enabled, frequency) = match ty {
        InjectionType::SystemPrompt => (true, Frequency::Always),
        InjectionType::GateGuidance => (true, Frequency::Always),
        InjectionType::StyleGuidance => (true, Frequency::FirstOnly),
    };
    InjectionDecision {
        enabled,
        frequency,
        target: InjectionTarget::Both,
        source: DecisionSource::Builtin,
    }
}

/// Evaluate a rule matcher against the call inputs.
///
/// Step scope accepts: index comparisons (`3`, `>2`, `<=4`), parity
/// (`odd`|`even`), position (`first`|`last`|`middle`), previous-step outcome
/// (`prev:success`|`prev:failure`), and gate-status predicates
/// (`gate-<id>-passed`). Chain scope accepts a glob over the chain id.
/// Category scope matches the prompt category exactly.
fn rule_matches(rule: &crate::config::InjectionRule, inputs: &DecisionInputs) -> bool {
    let matcher = rule.matcher.trim();
    match rule.scope.as_str() {
        "step" => step_matcher(matcher, inputs),
        "chain" => inputs
            .chain_id
            .as_deref()
            .is_some_and(|id| glob_match(matcher, id)),
        "category" => matcher == inputs.category,
        _ => false,
    }
}

fn step_matcher(matcher: &str, inputs: &DecisionInputs) -> bool {
    let step = inputs.step;
    match matcher {
        "odd" => return step % 2 == 1,
        "even" => return step % 2 == 0,
        "first" => return step == 1,
        "last" => return step == inputs.total_steps,
        "middle" => return step > 1 && step < inputs.total_steps,
        "prev:success" => return inputs.previous_step_success == Some(true),
        "prev:failure" => return inputs.previous_step_success == Some(false),
        _ => {}
    }
    if let Some(gate) = matcher
        .strip_prefix("gate-")
        .and_then(|rest| rest.strip_suffix("-passed"))
    {
        return inputs.passed_gates.contains(gate);
    }
    for (prefix, cmp) in [
        (">=", u32::ge as fn(&u32, &u32) -> bool),
        ("<=", u32::le as fn(&u32, &u32) -> bool),
        (">", u32::gt as fn(&u32, &u32) -> bool),
        ("<", u32::lt as fn(&u32, &u32) -> bool),
    ] {
        if let Some(rest) = matcher.strip_prefix(prefix) {
            return rest
                .trim()
                .parse::<u32>()
                .is_ok_and(|n| cmp(&step, &n));
        }
    }
    matcher.parse::<u32>().is_ok_and(|n| step == n)
}

/// Minimal glob over chain ids: exact, `prefix-*`, `*-suffix`, `*middle*`
pub fn glob_match(pattern: &str, value: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    match (pattern.strip_prefix('*'), pattern.strip_suffix('*')) {
        (Some(mid_or_suffix), Some(_)) if pattern.len() >= 2 => {
            let middle = &pattern[1..pattern.len() - 1];
            middle.is_empty() || value.contains(middle)
        }
        (Some(suffix), None) => value.ends_with(suffix),
        (None, Some(prefix)) => value.starts_with(prefix),
        (None, None) => value == pattern,
        _ => false,
    }
}
