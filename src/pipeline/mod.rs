//! Pipeline orchestrator: runs the contractual stage sequence over a mutable
//! execution context, measuring per-stage wall time, honoring early exits,
//! and converting failures into structured responses with their diagnostics.

pub mod context;
pub mod render;
pub mod stages;

use crate::config::Config;
use crate::decisions::RuntimeOverrides;
use crate::error::{PromptLoomError, Result};
use crate::registry::RegistryHandle;
use crate::sessions::SessionManager;
use crate::surface::PipelineMetrics;
use context::{ExecutionContext, ExecutionRequest, ExecutionResponse};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Shared services the stages draw on
#[derive(Clone)]
pub struct Engine {
    pub config: Arc<Config>,
    pub registries: RegistryHandle,
    pub sessions: SessionManager,
    pub overrides: RuntimeOverrides,
    pub metrics: Arc<PipelineMetrics>,
}

/// One declared stage
pub struct StageDef {
    pub name: &'static str,
    /// A terminal response from this stage skips the remaining stages
    /// (finalize always runs)
    pub early_exit: bool,
}

/// The canonical stage order; names and order are contractual
pub const STAGES: [StageDef; 8] = [
    StageDef {
        name: "normalize",
        early_exit: true,
    },
    StageDef {
        name: "parse",
        early_exit: true,
    },
    StageDef {
        name: "resolve",
        early_exit: true,
    },
    StageDef {
        name: "plan",
        early_exit: false,
    },
    StageDef {
        name: "enhance",
        early_exit: false,
    },
    StageDef {
        name: "execute",
        early_exit: true,
    },
    StageDef {
        name: "response-capture",
        early_exit: true,
    },
    StageDef {
        name: "finalize",
        early_exit: false,
    },
];

/// Run one request through the pipeline. Only cancellation surfaces as an
/// error; every other failure becomes a well-formed error response.
pub async fn execute(
    engine: &Engine,
    request: ExecutionRequest,
    cancel: CancellationToken,
) -> Result<ExecutionResponse> {
    let registry = engine.registries.snapshot();
    let mut ctx = ExecutionContext::new(request, registry, cancel);

    for stage in &STAGES {
        // Cancellation is checked at every stage boundary
        if ctx.cancel.is_cancelled() {
            return Err(PromptLoomError::Cancelled);
        }
        if ctx.has_response() && stage.name != "finalize" {
            continue;
        }

        let start = std::time::Instant::now();
        let result = stages::run_stage(stage.name, engine, &mut ctx).await;
        let elapsed = start.elapsed();
        engine.metrics.record_stage(stage.name, elapsed);
        soft_timeout_check(engine, &mut ctx, stage.name, elapsed);

        match result {
            Ok(()) => {}
            Err(PromptLoomError::Cancelled) => return Err(PromptLoomError::Cancelled),
            Err(err) => {
                // Stages never swallow failures; the orchestrator converts
                // them and still runs finalize to package diagnostics.
                ctx.diagnostics.error(
                    stage.name,
                    err.to_string(),
                    Some(err.code().to_string()),
                );
                if matches!(err, PromptLoomError::Parse { .. }) {
                    engine.metrics.record_parse_failure();
                }
                let response = error_response(&ctx, &err);
                ctx.respond(response);
            }
        }
    }

    engine.metrics.record_execution();
    Ok(ctx.response.unwrap_or_else(|| ExecutionResponse {
        message: "Internal error: pipeline produced no response".to_string(),
        structured: json!({ "isError": true, "code": "internal_error" }),
        is_error: true,
    }))
}

fn soft_timeout_check(
    engine: &Engine,
    ctx: &mut ExecutionContext,
    stage: &'static str,
    elapsed: Duration,
) {
    let budget = Duration::from_secs(engine.config.pipeline.stage_soft_timeout_secs);
    if elapsed > budget {
        ctx.diagnostics.warning(
            stage,
            format!(
                "stage exceeded its soft budget ({}ms > {}ms)",
                elapsed.as_millis(),
                budget.as_millis()
            ),
        );
    }
}

/// A well-formed error response preserving recovery context
fn error_response(ctx: &ExecutionContext, err: &PromptLoomError) -> ExecutionResponse {
    let (chain_id, current_step) = ctx
        .session
        .as_ref()
        .and_then(|handle| handle.try_lock().ok().map(|s| (Some(s.chain_id.clone()), Some(s.current_step))))
        .unwrap_or((ctx.request.chain_id.clone(), None));

    let mut message = format!("Error: {}", err);
    if let Some(id) = &chain_id {
        message.push_str(&format!("\nChain ID: {}", id));
    }
    ExecutionResponse {
        message,
        structured: json!({
            "isError": true,
            "code": err.code(),
            "reason": err.to_string(),
            "chainId": chain_id,
            "currentStep": current_step,
            "diagnostics": ctx.diagnostics.to_json(),
        }),
        is_error: true,
    }
}
