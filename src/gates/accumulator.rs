//! Gate accumulator: collects gates from labeled sources, deduplicating by
//! gate id with the higher-priority source winning.

use crate::registry::Gate;
use std::sync::Arc;

/// Labeled gate sources with their fixed priorities
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateSource {
    /// `::` operator on the command
    Inline,
    /// Judge-phase client selection
    ClientSelected,
    /// Request-scoped temporary gate
    RequestTemporary,
    /// Prompt-level configuration
    PromptConfig,
    /// Chain-level configuration
    ChainConfig,
    /// Methodology-derived
    Methodology,
    /// Registry default
    RegistryDefault,
}

impl GateSource {
    pub fn priority(&self) -> u8 {
        match self {
            GateSource::Inline => 100,
            GateSource::ClientSelected => 90,
            GateSource::RequestTemporary => 80,
            GateSource::PromptConfig => 60,
            GateSource::ChainConfig => 50,
            GateSource::Methodology => 40,
            GateSource::RegistryDefault => 20,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            GateSource::Inline => "inline",
            GateSource::ClientSelected => "client-selected",
            GateSource::RequestTemporary => "request-temporary",
            GateSource::PromptConfig => "prompt-config",
            GateSource::ChainConfig => "chain-config",
            GateSource::Methodology => "methodology",
            GateSource::RegistryDefault => "registry-default",
        }
    }
}

/// One accumulated gate with its winning source
#[derive(Debug, Clone)]
pub struct AccumulatedGate {
    pub gate: Arc<Gate>,
    pub source: GateSource,
}

/// A gate id displaced by a higher-priority duplicate (kept for diagnostics)
#[derive(Debug, Clone)]
pub struct DisplacedGate {
    pub gate_id: String,
    pub losing_source: GateSource,
    pub winning_source: GateSource,
}

/// Append-only accumulator with id-dedup by source priority
#[derive(Debug, Default)]
pub struct GateAccumulator {
    entries: Vec<AccumulatedGate>,
    displaced: Vec<DisplacedGate>,
}

impl GateAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Contribute a gate. When the id is already present, the higher-priority
    /// source wins and the loser is recorded as displaced.
    pub fn add(&mut self, gate: Arc<Gate>, source: GateSource) {
        match self.entries.iter_mut().find(|e| e.gate.id == gate.id) {
            Some(existing) => {
                if source.priority() > existing.source.priority() {
                    self.displaced.push(DisplacedGate {
                        gate_id: gate.id.clone(),
                        losing_source: existing.source,
                        winning_source: source,
                    });
                    existing.gate = gate;
                    existing.source = source;
                } else {
                    self.displaced.push(DisplacedGate {
                        gate_id: gate.id.clone(),
                        losing_source: source,
                        winning_source: existing.source,
                    });
                }
            }
            None => self.entries.push(AccumulatedGate { gate, source }),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Accumulated gates ordered by source priority, then insertion order
    pub fn gates(&self) -> Vec<AccumulatedGate> {
        let mut out = self.entries.clone();
        out.sort_by(|a, b| b.source.priority().cmp(&a.source.priority()));
        out
    }

    pub fn displaced(&self) -> &[DisplacedGate] {
        &self.displaced
    }

    pub fn source_of(&self, gate_id: &str) -> Option<GateSource> {
        self.entries
            .iter()
            .find(|e| e.gate.id == gate_id)
            .map(|e| e.source)
    }
}
