//! Per-request execution context: the request, everything resolved from it,
//! and the centralized diagnostic and gate accumulators stages append to.

use crate::command::ParsedCommand;
use crate::gates::{EnforcementPlan, GateAccumulator};
use crate::registry::{Gate, Methodology, RegistrySnapshot, Style};
use crate::sessions::ChainSession;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Requested execution mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    #[default]
    Auto,
    Single,
    Chain,
}

/// Scope of request-supplied temporary gates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateScope {
    #[default]
    Execution,
    Session,
    Chain,
    Step,
}

/// An ad-hoc check supplied with the request
#[derive(Debug, Clone, Deserialize)]
pub struct CustomCheck {
    pub description: String,
}

/// The execute tool's input shape
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ExecutionRequest {
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub chain_id: Option<String>,
    #[serde(default)]
    pub user_response: Option<String>,
    #[serde(default)]
    pub gate_verdict: Option<String>,
    #[serde(default)]
    pub force_restart: bool,
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    /// Named gates selected by the client (judge phase), priority 90
    #[serde(default)]
    pub gates: Vec<String>,
    /// Request-scoped gate definitions, priority 80
    #[serde(default)]
    pub temporary_gates: Vec<Gate>,
    #[serde(default)]
    pub gate_scope: GateScope,
    #[serde(default)]
    pub custom_checks: Vec<CustomCheck>,
    /// Methodology chosen by the client out of a judge phase
    #[serde(default)]
    pub framework_selection: Option<String>,
}

/// New submission vs continuation of an existing chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    NewExecution,
    ResumeExistingChain,
}

/// Diagnostic severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticLevel {
    Debug,
    Info,
    Warning,
    Error,
}

/// One diagnostic produced by a stage
#[derive(Debug, Clone, serde::Serialize)]
pub struct DiagnosticEntry {
    pub level: DiagnosticLevel,
    pub stage: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub at: DateTime<Utc>,
}

/// Append-only diagnostic collection with level/stage filtering
#[derive(Debug, Default)]
pub struct DiagnosticAccumulator {
    entries: Vec<DiagnosticEntry>,
}

impl DiagnosticAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(
        &mut self,
        level: DiagnosticLevel,
        stage: &'static str,
        message: impl Into<String>,
        context: Option<serde_json::Value>,
        code: Option<String>,
    ) {
        self.entries.push(DiagnosticEntry {
            level,
            stage,
            message: message.into(),
            context,
            code,
            at: Utc::now(),
        });
    }

    pub fn debug(&mut self, stage: &'static str, message: impl Into<String>) {
        self.push(DiagnosticLevel::Debug, stage, message, None, None);
    }

    pub fn info(&mut self, stage: &'static str, message: impl Into<String>) {
        self.push(DiagnosticLevel::Info, stage, message, None, None);
    }

    pub fn warning(&mut self, stage: &'static str, message: impl Into<String>) {
        self.push(DiagnosticLevel::Warning, stage, message, None, None);
    }

    pub fn error(&mut self, stage: &'static str, message: impl Into<String>, code: Option<String>) {
        self.push(DiagnosticLevel::Error, stage, message, None, code);
    }

    pub fn entries(&self) -> &[DiagnosticEntry] {
        &self.entries
    }

    pub fn by_level(&self, level: DiagnosticLevel) -> Vec<&DiagnosticEntry> {
        self.entries.iter().filter(|e| e.level == level).collect()
    }

    pub fn by_stage(&self, stage: &str) -> Vec<&DiagnosticEntry> {
        self.entries.iter().filter(|e| e.stage == stage).collect()
    }

    pub fn count_by_level(&self) -> BTreeMap<&'static str, usize> {
        let mut counts = BTreeMap::new();
        for entry in &self.entries {
            let key = match entry.level {
                DiagnosticLevel::Debug => "debug",
                DiagnosticLevel::Info => "info",
                DiagnosticLevel::Warning => "warning",
                DiagnosticLevel::Error => "error",
            };
            *counts.entry(key).or_insert(0) += 1;
        }
        counts
    }

    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "counts": self.count_by_level(),
            "entries": self.entries,
        })
    }
}

/// One planned step of the execution
#[derive(Debug, Clone)]
pub enum PlannedStep {
    /// A referenced prompt with the raw argument tokens from the command (or
    /// the declared input mapping when it came from a chain-prompt step)
    PromptRef {
        id: String,
        raw_args: Vec<String>,
        input_mapping: BTreeMap<String, String>,
    },
    /// A literal instruction block from a chain prompt
    Embedded {
        instruction: String,
        expected_output: String,
    },
}

impl PlannedStep {
    pub fn describe(&self) -> String {
        match self {
            PlannedStep::PromptRef { id, .. } => format!(">>{}", id),
            PlannedStep::Embedded { .. } => "(embedded step)".to_string(),
        }
    }
}

/// The resolved plan for a whole execution
#[derive(Debug, Clone, Default)]
pub struct ExecutionPlan {
    pub steps: Vec<PlannedStep>,
    pub methodology: Option<Arc<Methodology>>,
    pub style: Option<Arc<Style>>,
    /// Whether the judge selection preamble should be emitted
    pub judge_phase: bool,
}

impl ExecutionPlan {
    pub fn total_steps(&self) -> u32 {
        self.steps.len() as u32
    }

    pub fn step(&self, index: u32) -> Option<&PlannedStep> {
        if index == 0 {
            return None;
        }
        self.steps.get((index - 1) as usize)
    }
}

/// The response assembled by the pipeline
#[derive(Debug, Clone, Default)]
pub struct ExecutionResponse {
    /// Rendered prompt plus the human-readable progress footer
    pub message: String,
    /// Structured content block (gateValidation, chainProgress, ...)
    pub structured: serde_json::Value,
    pub is_error: bool,
}

/// Per-request scratch space handed through the stages. Diagnostics and gate
/// contributions live here; stages never pass them as return values.
pub struct ExecutionContext {
    pub request: ExecutionRequest,
    pub kind: RequestKind,
    /// Registry snapshot held for the duration of this request
    pub registry: Arc<RegistrySnapshot>,
    pub parsed: Option<ParsedCommand>,
    pub plan: ExecutionPlan,
    pub enforcement: Option<EnforcementPlan>,
    pub gate_acc: GateAccumulator,
    pub diagnostics: DiagnosticAccumulator,
    /// Session handle for this chain, once resolved or created
    pub session: Option<Arc<Mutex<ChainSession>>>,
    /// Prompt rendered by this call, if any
    pub rendered: Option<String>,
    pub response: Option<ExecutionResponse>,
    pub cancel: CancellationToken,
    pub started_at: DateTime<Utc>,
}

impl ExecutionContext {
    pub fn new(
        request: ExecutionRequest,
        registry: Arc<RegistrySnapshot>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            request,
            kind: RequestKind::NewExecution,
            registry,
            parsed: None,
            plan: ExecutionPlan::default(),
            enforcement: None,
            gate_acc: GateAccumulator::new(),
            diagnostics: DiagnosticAccumulator::new(),
            session: None,
            rendered: None,
            response: None,
            cancel: cancel.clone(),
            started_at: Utc::now(),
        }
    }

    /// Set a terminal response; later non-finalize stages are skipped
    pub fn respond(&mut self, response: ExecutionResponse) {
        self.response = Some(response);
    }

    pub fn has_response(&self) -> bool {
        self.response.is_some()
    }
}
