//! Runtime override store: mutable injection overrides and the active
//! methodology, held behind a single lock. Components never read this state
//! directly from config; they go through here.

use crate::config::Frequency;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};

/// What an override applies to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OverrideScope {
    /// One chain session
    Session(String),
    /// Every session of a chain id (kept distinct for clearing semantics)
    Chain(String),
    Global,
}

impl OverrideScope {
    fn applies_to(&self, chain_id: Option<&str>) -> bool {
        match self {
            OverrideScope::Global => true,
            OverrideScope::Session(id) | OverrideScope::Chain(id) => {
                chain_id.is_some_and(|c| c == id)
            }
        }
    }
}

/// A recorded injection override
#[derive(Debug, Clone)]
pub struct InjectionOverride {
    pub scope: OverrideScope,
    /// system-prompt | gate-guidance | style-guidance
    pub injection: String,
    pub enabled: bool,
    pub frequency: Option<Frequency>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct State {
    injections: Vec<InjectionOverride>,
    active_methodology: Option<String>,
}

/// Shared runtime override store
#[derive(Clone, Default)]
pub struct RuntimeOverrides {
    inner: Arc<Mutex<State>>,
}

impl RuntimeOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record an override; replaces an existing one with the same scope and
    /// injection type.
    pub fn set_injection(&self, override_: InjectionOverride) {
        let mut state = self.lock();
        state
            .injections
            .retain(|o| !(o.scope == override_.scope && o.injection == override_.injection));
        state.injections.push(override_);
    }

    /// Clear overrides; `injection` of None clears every type in the scope
    pub fn clear_injection(&self, scope: &OverrideScope, injection: Option<&str>) -> usize {
        let mut state = self.lock();
        let before = state.injections.len();
        state
            .injections
            .retain(|o| !(&o.scope == scope && injection.is_none_or(|i| i == o.injection)));
        before - state.injections.len()
    }

    /// Look up the effective override for an injection type; expired entries
    /// are filtered on read. Session scope beats chain scope beats global.
    pub fn lookup_injection(
        &self,
        chain_id: Option<&str>,
        injection: &str,
        now: DateTime<Utc>,
    ) -> Option<(bool, Option<Frequency>)> {
        let mut state = self.lock();
        state
            .injections
            .retain(|o| o.expires_at.is_none_or(|t| t > now));
        let rank = |scope: &OverrideScope| match scope {
            OverrideScope::Session(_) => 0,
            OverrideScope::Chain(_) => 1,
            OverrideScope::Global => 2,
        };
        state
            .injections
            .iter()
            .filter(|o| o.injection == injection && o.scope.applies_to(chain_id))
            .min_by_key(|o| rank(&o.scope))
            .map(|o| (o.enabled, o.frequency))
    }

    pub fn set_active_methodology(&self, id: Option<String>) {
        self.lock().active_methodology = id.map(|s| s.to_ascii_lowercase());
    }

    pub fn active_methodology(&self) -> Option<String> {
        self.lock().active_methodology.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_scope_beats_global() {
        let store = RuntimeOverrides::new();
        store.set_injection(InjectionOverride {
            scope: OverrideScope::Global,
            injection: "system-prompt".to_string(),
            enabled: false,
            frequency: None,
            expires_at: None,
        });
        store.set_injection(InjectionOverride {
            scope: OverrideScope::Session("chain-a".to_string()),
            injection: "system-prompt".to_string(),
            enabled: true,
            frequency: Some(Frequency::Always),
            expires_at: None,
        });

        let (enabled, _) = store
            .lookup_injection(Some("chain-a"), "system-prompt", Utc::now())
            .unwrap();
        assert!(enabled);
        let (enabled, _) = store
            .lookup_injection(Some("chain-b"), "system-prompt", Utc::now())
            .unwrap();
        assert!(!enabled);
    }

    #[test]
    fn expired_entries_filtered_on_read() {
        let store = RuntimeOverrides::new();
        store.set_injection(InjectionOverride {
            scope: OverrideScope::Global,
            injection: "style-guidance".to_string(),
            enabled: false,
            frequency: None,
            expires_at: Some(Utc::now() - chrono::Duration::seconds(1)),
        });
        assert!(store
            .lookup_injection(None, "style-guidance", Utc::now())
            .is_none());
    }

    #[test]
    fn clear_removes_matching_scope() {
        let store = RuntimeOverrides::new();
        let scope = OverrideScope::Chain("chain-x".to_string());
        store.set_injection(InjectionOverride {
            scope: scope.clone(),
            injection: "gate-guidance".to_string(),
            enabled: false,
            frequency: None,
            expires_at: None,
        });
        assert_eq!(store.clear_injection(&scope, Some("gate-guidance")), 1);
        assert!(store
            .lookup_injection(Some("chain-x"), "gate-guidance", Utc::now())
            .is_none());
    }

    #[test]
    fn active_methodology_is_normalized() {
        let store = RuntimeOverrides::new();
        store.set_active_methodology(Some("CAGEERF".to_string()));
        assert_eq!(store.active_methodology().as_deref(), Some("cageerf"));
        store.set_active_methodology(None);
        assert!(store.active_methodology().is_none());
    }
}
