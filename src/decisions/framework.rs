//! Framework decision authority: resolves the single methodology (or none)
//! applying to a call, across the fixed priority chain.

use crate::command::Modifier;
use crate::config::Config;
use crate::decisions::overrides::RuntimeOverrides;
use crate::registry::{Methodology, RegistrySnapshot};
use std::sync::Arc;

/// Where the resolved methodology came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameworkSource {
    ModifierSuppressed,
    Operator,
    ClientSelection,
    GloballyActive,
    ConfigDefault,
    None,
}

/// The resolved framework decision for one call
#[derive(Debug, Clone)]
pub struct FrameworkDecision {
    pub methodology: Option<Arc<Methodology>>,
    pub source: FrameworkSource,
}

/// Per-call authority; the decision is computed once and cached
pub struct FrameworkDecisionAuthority {
    cached: Option<FrameworkDecision>,
}

impl Default for FrameworkDecisionAuthority {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameworkDecisionAuthority {
    pub fn new() -> Self {
        Self { cached: None }
    }

    /// Resolve with priority: `%clean`/`%lean` suppress; then `@OPERATOR`;
    /// then a judge-phase client selection; then the globally active
    /// methodology; then the configured default; then none. Lookups
    /// normalize to lowercase. Disabled methodologies never apply, and the
    /// `frameworks.enabled` kill switch shuts the whole chain off.
    pub fn resolve(
        &mut self,
        config: &Config,
        overrides: &RuntimeOverrides,
        registry: &RegistrySnapshot,
        modifiers: &[Modifier],
        operator: Option<&str>,
        client_selection: Option<&str>,
    ) -> FrameworkDecision {
        if let Some(cached) = &self.cached {
            return cached.clone();
        }
        let decision = self.resolve_fresh(
            config,
            overrides,
            registry,
            modifiers,
            operator,
            client_selection,
        );
        self.cached = Some(decision.clone());
        decision
    }

    fn resolve_fresh(
        &self,
        config: &Config,
        overrides: &RuntimeOverrides,
        registry: &RegistrySnapshot,
        modifiers: &[Modifier],
        operator: Option<&str>,
        client_selection: Option<&str>,
    ) -> FrameworkDecision {
        if !config.frameworks.enabled {
            return FrameworkDecision {
                methodology: None,
                source: FrameworkSource::None,
            };
        }
        if modifiers.contains(&Modifier::Clean) || modifiers.contains(&Modifier::Lean) {
            return FrameworkDecision {
                methodology: None,
                source: FrameworkSource::ModifierSuppressed,
            };
        }

        let active = overrides.active_methodology();
        let candidates: [(Option<&str>, FrameworkSource); 4] = [
            (operator, FrameworkSource::Operator),
            (client_selection, FrameworkSource::ClientSelection),
            (active.as_deref(), FrameworkSource::GloballyActive),
            (
                config.frameworks.active.as_deref(),
                FrameworkSource::ConfigDefault,
            ),
        ];
        for (candidate, source) in candidates {
            let Some(id) = candidate else { continue };
            match registry.get_methodology(id) {
                Some(methodology) if methodology.enabled => {
                    return FrameworkDecision {
                        methodology: Some(methodology),
                        source,
                    };
                }
                Some(_) => {
                    tracing::debug!("methodology '{}' is disabled, skipping", id);
                }
                None => {
                    tracing::debug!("methodology '{}' not registered, skipping", id);
                }
            }
        }

        FrameworkDecision {
            methodology: None,
            source: FrameworkSource::None,
        }
    }
}
