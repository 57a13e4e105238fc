//! Resource and notification surface: read-only views over registries,
//! sessions, and metrics, plus the listener channel for invalidation events.
//!
//! Every view is non-mutating and safe from any concurrent context. The
//! event channel is single-producer/many-consumer and never blocks the
//! pipeline; lagging listeners lose the oldest events.

use crate::registry::RegistrySnapshot;
use crate::sessions::{ChainSession, SessionSummary};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

/// Invalidation notifications published to listeners
#[derive(Debug, Clone)]
pub enum SurfaceEvent {
    RegistryChanged,
    SessionUpdated { chain_id: String },
}

/// Broadcast channel wrapper; publishing never blocks and never fails
#[derive(Clone)]
pub struct SurfaceEvents {
    tx: broadcast::Sender<SurfaceEvent>,
}

impl Default for SurfaceEvents {
    fn default() -> Self {
        Self::new()
    }
}

impl SurfaceEvents {
    pub fn new() -> Self {
        // Bounded buffer; broadcast drops the oldest event for slow receivers
        let (tx, _) = broadcast::channel(64);
        Self { tx }
    }

    pub fn publish(&self, event: SurfaceEvent) {
        // No subscribers is fine; send only fails in that case
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SurfaceEvent> {
        self.tx.subscribe()
    }
}

/// Per-stage cumulative timing
#[derive(Debug, Default, Clone, Copy)]
struct StageTiming {
    count: u64,
    total_micros: u64,
    max_micros: u64,
}

/// Cumulative pipeline metrics, shared across requests
#[derive(Default)]
pub struct PipelineMetrics {
    executions: AtomicU64,
    parse_failures: AtomicU64,
    verdicts_passed: AtomicU64,
    verdicts_failed: AtomicU64,
    reloads: AtomicU64,
    stage_timings: Mutex<HashMap<&'static str, StageTiming>>,
}

impl PipelineMetrics {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_execution(&self) {
        self.executions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_parse_failure(&self) {
        self.parse_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_verdict(&self, passed: bool) {
        if passed {
            self.verdicts_passed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.verdicts_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_reload(&self) {
        self.reloads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stage(&self, name: &'static str, elapsed: Duration) {
        let micros = elapsed.as_micros().min(u128::from(u64::MAX)) as u64;
        let mut timings = self
            .stage_timings
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let entry = timings.entry(name).or_default();
        entry.count += 1;
        entry.total_micros += micros;
        entry.max_micros = entry.max_micros.max(micros);
    }

    pub fn to_json(&self) -> serde_json::Value {
        let timings = self
            .stage_timings
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let stages: serde_json::Map<String, serde_json::Value> = timings
            .iter()
            .map(|(name, t)| {
                let avg = if t.count > 0 {
                    t.total_micros / t.count
                } else {
                    0
                };
                (
                    (*name).to_string(),
                    json!({
                        "count": t.count,
                        "avg_micros": avg,
                        "max_micros": t.max_micros,
                    }),
                )
            })
            .collect();
        json!({
            "executions": self.executions.load(Ordering::Relaxed),
            "parse_failures": self.parse_failures.load(Ordering::Relaxed),
            "verdicts": {
                "passed": self.verdicts_passed.load(Ordering::Relaxed),
                "failed": self.verdicts_failed.load(Ordering::Relaxed),
            },
            "reloads": self.reloads.load(Ordering::Relaxed),
            "stages": stages,
        })
    }
}

/// A parsed `resource://` URI
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceRef {
    PromptList,
    Prompt(String),
    PromptTemplate(String),
    GateList,
    Gate(String),
    GateGuidance(String),
    MethodologyList,
    Methodology(String),
    MethodologySystemPrompt(String),
    SessionList,
    Session(String),
    MetricsPipeline,
}

/// Parse a published resource URI; None for anything outside the surface
pub fn parse_resource_uri(uri: &str) -> Option<ResourceRef> {
    let rest = uri.strip_prefix("resource://")?;
    let mut parts = rest.split('/');
    let kind = parts.next()?;
    let id = parts.next().filter(|s| !s.is_empty());
    let facet = parts.next().filter(|s| !s.is_empty());
    if parts.next().is_some() {
        return None;
    }
    match (kind, id, facet) {
        ("prompt", None, None) => Some(ResourceRef::PromptList),
        ("prompt", Some(id), None) => Some(ResourceRef::Prompt(id.to_string())),
        ("prompt", Some(id), Some("template")) => {
            Some(ResourceRef::PromptTemplate(id.to_string()))
        }
        ("gate", None, None) => Some(ResourceRef::GateList),
        ("gate", Some(id), None) => Some(ResourceRef::Gate(id.to_string())),
        ("gate", Some(id), Some("guidance")) => Some(ResourceRef::GateGuidance(id.to_string())),
        ("methodology", None, None) => Some(ResourceRef::MethodologyList),
        ("methodology", Some(id), None) => Some(ResourceRef::Methodology(id.to_string())),
        ("methodology", Some(id), Some("system-prompt")) => {
            Some(ResourceRef::MethodologySystemPrompt(id.to_string()))
        }
        ("session", None, None) => Some(ResourceRef::SessionList),
        ("session", Some(id), None) => Some(ResourceRef::Session(id.to_string())),
        ("metrics", Some("pipeline"), None) => Some(ResourceRef::MetricsPipeline),
        _ => None,
    }
}

/// One line per prompt: `id  [category]  name`
pub fn render_prompt_list(snapshot: &RegistrySnapshot) -> String {
    let mut lines: Vec<String> = snapshot
        .prompts()
        .map(|p| {
            let kind = if p.is_chain() { "chain" } else { "single" };
            format!("{}  [{}/{}]  {}", p.id, p.category, kind, p.name)
        })
        .collect();
    lines.sort();
    lines.join("\n")
}

pub fn render_gate_list(snapshot: &RegistrySnapshot) -> String {
    let mut lines: Vec<String> = snapshot
        .gates()
        .map(|g| {
            format!(
                "{}  [{:?}/{:?}]  {}",
                g.id, g.gate_type, g.severity, g.name
            )
        })
        .collect();
    lines.sort();
    lines.join("\n")
}

pub fn render_methodology_list(snapshot: &RegistrySnapshot, active: Option<&str>) -> String {
    let mut lines: Vec<String> = snapshot
        .methodologies()
        .map(|m| {
            let marker = if Some(m.id.as_str()) == active {
                " *active*"
            } else {
                ""
            };
            format!("{}  ({} phases)  {}{}", m.id, m.phases.len(), m.name, marker)
        })
        .collect();
    lines.sort();
    lines.join("\n")
}

pub fn render_session_list(summaries: &[SessionSummary]) -> String {
    summaries
        .iter()
        .map(|s| {
            format!(
                "{}  {}  step {}/{}  [{}]",
                s.chain_id, s.prompt_id, s.current_step, s.total_steps, s.state
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Structured JSON payload for a single session
pub fn render_session(session: &ChainSession) -> serde_json::Value {
    json!({
        "chainId": session.chain_id,
        "promptId": session.prompt_id,
        "command": session.command,
        "state": session.state.as_str(),
        "currentStep": session.current_step,
        "totalSteps": session.total_steps,
        "pendingReview": session.pending_review.as_ref().map(|r| json!({
            "gateIds": r.gate_ids,
            "attemptCount": r.attempt_count,
            "maxAttempts": r.max_attempts,
            "retryHints": r.retry_hints,
        })),
        "startedAt": session.started_at,
        "lastActivity": session.last_activity,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uri_parsing_covers_published_set() {
        assert_eq!(
            parse_resource_uri("resource://prompt/"),
            Some(ResourceRef::PromptList)
        );
        assert_eq!(
            parse_resource_uri("resource://prompt/code_review"),
            Some(ResourceRef::Prompt("code_review".to_string()))
        );
        assert_eq!(
            parse_resource_uri("resource://prompt/code_review/template"),
            Some(ResourceRef::PromptTemplate("code_review".to_string()))
        );
        assert_eq!(
            parse_resource_uri("resource://gate/cite/guidance"),
            Some(ResourceRef::GateGuidance("cite".to_string()))
        );
        assert_eq!(
            parse_resource_uri("resource://methodology/cageerf/system-prompt"),
            Some(ResourceRef::MethodologySystemPrompt("cageerf".to_string()))
        );
        assert_eq!(
            parse_resource_uri("resource://session/chain-12ab"),
            Some(ResourceRef::Session("chain-12ab".to_string()))
        );
        assert_eq!(
            parse_resource_uri("resource://metrics/pipeline"),
            Some(ResourceRef::MetricsPipeline)
        );
        assert_eq!(parse_resource_uri("resource://metrics/other"), None);
        assert_eq!(parse_resource_uri("file:///etc/passwd"), None);
        assert_eq!(parse_resource_uri("resource://prompt/a/b/c"), None);
    }

    #[test]
    fn publish_without_subscribers_is_silent() {
        let events = SurfaceEvents::new();
        events.publish(SurfaceEvent::RegistryChanged);
    }

    #[tokio::test]
    async fn subscribers_receive_events() {
        let events = SurfaceEvents::new();
        let mut rx = events.subscribe();
        events.publish(SurfaceEvent::SessionUpdated {
            chain_id: "chain-1".to_string(),
        });
        match rx.recv().await.unwrap() {
            SurfaceEvent::SessionUpdated { chain_id } => assert_eq!(chain_id, "chain-1"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn metrics_accumulate() {
        let metrics = PipelineMetrics::default();
        metrics.record_execution();
        metrics.record_execution();
        metrics.record_verdict(true);
        metrics.record_verdict(false);
        metrics.record_stage("parse", Duration::from_micros(250));
        metrics.record_stage("parse", Duration::from_micros(150));
        let json = metrics.to_json();
        assert_eq!(json["executions"], 2);
        assert_eq!(json["verdicts"]["passed"], 1);
        assert_eq!(json["stages"]["parse"]["count"], 2);
        assert_eq!(json["stages"]["parse"]["avg_micros"], 200);
    }
}
