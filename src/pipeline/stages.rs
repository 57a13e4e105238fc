//! The eight pipeline stages. Stage order is the contract; the division of
//! work below keeps new executions in enhance/execute and continuations in
//! response-capture.

use crate::command::{self, ArgContext, Modifier, Operator, ParsedCommand};
use crate::decisions::{
    DecisionInputs, FrameworkDecisionAuthority, InjectionDecisionService, InjectionType,
};
use crate::error::{PromptLoomError, Result};
use crate::gates::{self, GateSource, VerdictOutcome, VerdictSource, VerificationRequest};
use crate::pipeline::context::{
    ExecutionContext, ExecutionMode, ExecutionResponse, PlannedStep, RequestKind,
};
use crate::pipeline::render::render;
use crate::pipeline::Engine;
use crate::registry::{ChainStep, Gate, GateType, VerificationSpec};
use crate::sessions::{ChainSession, PendingReview, SessionState, UserAction};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Dispatch one named stage
pub async fn run_stage(
    name: &'static str,
    engine: &Engine,
    ctx: &mut ExecutionContext,
) -> Result<()> {
    match name {
        "normalize" => normalize(engine, ctx).await,
        "parse" => parse(engine, ctx).await,
        "resolve" => resolve(engine, ctx).await,
        "plan" => plan(engine, ctx).await,
        "enhance" => enhance(engine, ctx).await,
        "execute" => execute(engine, ctx).await,
        "response-capture" => response_capture(engine, ctx).await,
        "finalize" => finalize(engine, ctx).await,
        other => Err(PromptLoomError::Internal {
            message: format!("unknown stage '{}'", other),
        }),
    }
}

/// Validate the request shape, trim inputs, classify new vs resume, and load
/// the session for continuations.
async fn normalize(engine: &Engine, ctx: &mut ExecutionContext) -> Result<()> {
    {
        let request = &mut ctx.request;
        if let Some(command) = &mut request.command {
            *command = command.trim().to_string();
        }
        if request.command.as_deref().is_some_and(str::is_empty) {
            request.command = None;
        }
        if let Some(reply) = &mut request.user_response {
            *reply = reply.trim().to_string();
        }
        if let Some(verdict) = &mut request.gate_verdict {
            *verdict = verdict.trim().to_string();
        }
    }

    if ctx.request.command.is_none() && ctx.request.chain_id.is_none() {
        return Err(PromptLoomError::Validation {
            message: "either command or chain_id must be provided".to_string(),
        });
    }
    crate::sessions::SessionManager::check_restart_conflict(
        ctx.request.chain_id.as_deref(),
        ctx.request.force_restart,
    )?;
    for check in &ctx.request.custom_checks {
        if check.description.trim().is_empty() {
            return Err(PromptLoomError::Validation {
                message: "custom_checks entries must have a non-empty description".to_string(),
            });
        }
    }
    for gate in &ctx.request.temporary_gates {
        if gate.criteria.iter().any(|c| c.trim().is_empty()) || gate.criteria.is_empty() {
            return Err(PromptLoomError::Validation {
                message: format!(
                    "temporary gate '{}' must carry non-empty criteria",
                    gate.id
                ),
            });
        }
    }

    let chain_id = ctx.request.chain_id.clone();
    if let Some(chain_id) = chain_id {
        if !crate::sessions::is_valid_chain_id(&chain_id) {
            return Err(PromptLoomError::Session {
                message: format!("malformed chain id '{}'", chain_id),
            });
        }
        let handle = engine.sessions.get(&chain_id).await?.ok_or_else(|| {
            PromptLoomError::Session {
                message: format!("unknown chain id '{}'", chain_id),
            }
        })?;
        ctx.session = Some(handle);
        ctx.kind = RequestKind::ResumeExistingChain;
        ctx.diagnostics
            .debug("normalize", "classified as resume-existing-chain");
    } else {
        ctx.kind = RequestKind::NewExecution;
        ctx.diagnostics
            .debug("normalize", "classified as new-execution");
    }
    Ok(())
}

/// Run the symbolic parser over the submitted command (new execution) or the
/// session's originating command (resume, to rebuild the plan).
async fn parse(_engine: &Engine, ctx: &mut ExecutionContext) -> Result<()> {
    let command = match ctx.kind {
        RequestKind::NewExecution => ctx
            .request
            .command
            .clone()
            .unwrap_or_default(),
        RequestKind::ResumeExistingChain => {
            let handle = ctx.session.as_ref().cloned().ok_or_else(|| {
                PromptLoomError::Internal {
                    message: "resume without session".to_string(),
                }
            })?;
            let session = handle.lock().await;
            session.command.clone()
        }
    };
    let parsed = command::parse(&command, &ctx.registry)?;
    ctx.diagnostics.debug(
        "parse",
        format!("{} operators, residual {:?}", parsed.operators.len(), parsed.residual),
    );
    ctx.parsed = Some(parsed);
    Ok(())
}

/// Look up prompts and named gates and run the argument processor for the
/// opening step of a new execution so unbound required arguments fail here.
async fn resolve(engine: &Engine, ctx: &mut ExecutionContext) -> Result<()> {
    let Some(parsed) = ctx.parsed.clone() else {
        return Ok(());
    };
    if parsed.prompt_refs().is_empty() {
        return Err(PromptLoomError::Validation {
            message: "command contains no prompt reference".to_string(),
        });
    }

    for op in &parsed.operators {
        if let Operator::NamedGate(id) = op
            && ctx.registry.get_gate(id).is_none()
        {
            ctx.diagnostics.warning(
                "resolve",
                format!("named gate '{}' is not registered and will be skipped", id),
            );
        }
    }

    if ctx.kind == RequestKind::NewExecution {
        let (first_id, first_args) = {
            let refs = parsed.prompt_refs();
            (refs[0].0.to_string(), refs[0].1.to_vec())
        };
        let prompt = ctx
            .registry
            .get_prompt(&first_id)
            .ok_or(PromptLoomError::UnknownPrompt { id: first_id })?;
        // Chain prompts defer argument binding to their per-step mappings
        if !prompt.is_chain() {
            command::process_arguments(
                &prompt,
                &first_args,
                &ArgContext::default(),
                &engine.config.arguments.env_whitelist,
            )?;
        }
    }
    Ok(())
}

/// Build the step plan, resolve the framework, and accumulate gates.
async fn plan(engine: &Engine, ctx: &mut ExecutionContext) -> Result<()> {
    let Some(parsed) = ctx.parsed.clone() else {
        return Ok(());
    };

    // --- step plan -------------------------------------------------------
    let mut steps: Vec<PlannedStep> = Vec::new();
    for op in &parsed.operators {
        match op {
            Operator::PromptRef { id, args } => {
                let prompt = ctx
                    .registry
                    .get_prompt(id)
                    .ok_or_else(|| PromptLoomError::UnknownPrompt { id: id.clone() })?;
                if prompt.is_chain() {
                    for step in &prompt.chain_steps {
                        steps.push(match step {
                            ChainStep::Embedded {
                                instruction,
                                expected_output,
                            } => PlannedStep::Embedded {
                                instruction: instruction.clone(),
                                expected_output: expected_output.clone(),
                            },
                            ChainStep::Reference {
                                prompt_id,
                                input_mapping,
                                ..
                            } => PlannedStep::PromptRef {
                                id: prompt_id.clone(),
                                raw_args: Vec::new(),
                                input_mapping: input_mapping.clone(),
                            },
                        });
                    }
                } else {
                    steps.push(PlannedStep::PromptRef {
                        id: id.clone(),
                        raw_args: args.clone(),
                        input_mapping: BTreeMap::new(),
                    });
                }
            }
            Operator::Repeat(n) => {
                if let Some(last) = steps.last().cloned() {
                    for _ in 1..*n {
                        steps.push(last.clone());
                    }
                }
            }
            _ => {}
        }
    }
    match ctx.request.execution_mode {
        ExecutionMode::Single if steps.len() > 1 => {
            ctx.diagnostics
                .info("plan", "execution_mode=single truncated the plan to one step");
            steps.truncate(1);
        }
        ExecutionMode::Chain if steps.len() == 1 => {
            ctx.diagnostics
                .info("plan", "execution_mode=chain on a single-step plan");
        }
        _ => {}
    }
    ctx.plan.steps = steps;
    // A resumed chain is bounded by the step count its session recorded;
    // execution_mode is not persisted and must not grow the plan
    if ctx.kind == RequestKind::ResumeExistingChain
        && let Some(handle) = &ctx.session
    {
        let recorded_total = handle.lock().await.total_steps as usize;
        if ctx.plan.steps.len() > recorded_total {
            ctx.plan.steps.truncate(recorded_total);
        }
    }
    ctx.plan.judge_phase = parsed.has_modifier(Modifier::Judge)
        && !parsed.has_modifier(Modifier::Clean);

    // --- framework decision ---------------------------------------------
    let mut authority = FrameworkDecisionAuthority::new();
    let decision = authority.resolve(
        &engine.config,
        &engine.overrides,
        &ctx.registry,
        &parsed.modifiers(),
        parsed.methodology(),
        ctx.request.framework_selection.as_deref(),
    );
    ctx.diagnostics.debug(
        "plan",
        format!(
            "framework: {:?} via {:?}",
            decision.methodology.as_ref().map(|m| m.id.clone()),
            decision.source
        ),
    );
    ctx.plan.methodology = decision.methodology;

    // Style: explicit #style wins over the methodology's recommendation
    let style_id = parsed
        .style()
        .map(str::to_string)
        .or_else(|| ctx.plan.methodology.as_ref().and_then(|m| m.style.clone()));
    ctx.plan.style = style_id.and_then(|id| ctx.registry.get_style(&id));

    // --- gate accumulation ----------------------------------------------
    for op in &parsed.operators {
        match op {
            Operator::InlineGate(text) => {
                ctx.gate_acc
                    .add(Arc::new(Gate::inline(text.clone())), GateSource::Inline);
            }
            Operator::NamedGate(id) => {
                if let Some(gate) = ctx.registry.get_gate(id) {
                    ctx.gate_acc.add(gate, GateSource::Inline);
                }
            }
            Operator::Verify(v) => {
                let mut spec = VerificationSpec {
                    command: v.command.clone(),
                    timeout_secs: v.timeout_secs,
                    max_attempts: v.max_attempts,
                    looped: v.looped,
                };
                if let Some(preset) = v.preset.as_deref()
                    && let Some((attempts, timeout)) = gates::preset_defaults(preset)
                {
                    spec.max_attempts = spec.max_attempts.or(Some(attempts));
                    spec.timeout_secs = spec.timeout_secs.or(Some(timeout));
                }
                ctx.gate_acc
                    .add(Arc::new(Gate::inline_verification(spec)), GateSource::Inline);
            }
            _ => {}
        }
    }
    for id in &ctx.request.gates {
        match ctx.registry.get_gate(id) {
            Some(gate) => ctx.gate_acc.add(gate, GateSource::ClientSelected),
            None => ctx.diagnostics.warning(
                "plan",
                format!("client-selected gate '{}' is not registered", id),
            ),
        }
    }
    for gate in &ctx.request.temporary_gates {
        ctx.gate_acc
            .add(Arc::new(gate.clone()), GateSource::RequestTemporary);
    }
    for check in &ctx.request.custom_checks {
        ctx.gate_acc.add(
            Arc::new(Gate::inline(check.description.clone())),
            GateSource::RequestTemporary,
        );
    }
    // Session/chain-scoped temporary gates recorded on earlier calls
    if let Some(handle) = &ctx.session {
        let session = handle.lock().await;
        for gate in &session.extra_gates {
            ctx.gate_acc
                .add(Arc::new(gate.clone()), GateSource::RequestTemporary);
        }
    }
    for planned in &ctx.plan.steps {
        if let PlannedStep::PromptRef { id, .. } = planned
            && let Some(prompt) = ctx.registry.get_prompt(id)
        {
            for gate_id in &prompt.gates {
                if let Some(gate) = ctx.registry.get_gate(gate_id) {
                    ctx.gate_acc.add(gate, GateSource::PromptConfig);
                }
            }
        }
    }
    let chain_id = match (&ctx.session, &ctx.request.chain_id) {
        (Some(handle), _) => Some(handle.lock().await.chain_id.clone()),
        (None, Some(id)) => Some(id.clone()),
        _ => None,
    };
    for rule in &engine.config.gates.chain_rules {
        let matches = match &chain_id {
            Some(id) => crate::decisions::injection::glob_match(&rule.pattern, id),
            // Before a chain id exists only the universal pattern applies
            None => rule.pattern == "*",
        };
        if matches {
            for gate_id in &rule.gates {
                if let Some(gate) = ctx.registry.get_gate(gate_id) {
                    ctx.gate_acc.add(gate, GateSource::ChainConfig);
                }
            }
        }
    }
    if let Some(methodology) = ctx.plan.methodology.clone() {
        for gate_id in &methodology.gates {
            if let Some(gate) = ctx.registry.get_gate(gate_id) {
                ctx.gate_acc.add(gate, GateSource::Methodology);
            }
        }
    }
    let default_gates: Vec<Arc<Gate>> = ctx
        .registry
        .gates()
        .filter(|g| g.is_default)
        .cloned()
        .collect();
    for gate in default_gates {
        ctx.gate_acc.add(gate, GateSource::RegistryDefault);
    }

    for displaced in ctx.gate_acc.displaced() {
        ctx.diagnostics.debug(
            "plan",
            format!(
                "gate '{}' from {} displaced by {}",
                displaced.gate_id,
                displaced.losing_source.label(),
                displaced.winning_source.label()
            ),
        );
    }
    ctx.enforcement = gates::build_plan(
        ctx.gate_acc.gates(),
        engine.config.gates.default_max_attempts,
    );
    Ok(())
}

/// Render the opening step of a new execution, guidance included.
async fn enhance(engine: &Engine, ctx: &mut ExecutionContext) -> Result<()> {
    if ctx.kind != RequestKind::NewExecution {
        return Ok(());
    }
    let rendered = render_step(engine, ctx, None, 1)?;
    ctx.rendered = Some(rendered);
    Ok(())
}

/// Emit the rendered prompt and create the session for chains and gated
/// executions. Resume calls pass through to response-capture.
async fn execute(engine: &Engine, ctx: &mut ExecutionContext) -> Result<()> {
    if ctx.kind != RequestKind::NewExecution {
        return Ok(());
    }
    let rendered = ctx.rendered.clone().ok_or_else(|| PromptLoomError::Internal {
        message: "execute reached without a rendered step".to_string(),
    })?;
    let total = ctx.plan.total_steps();

    // A lone ungated prompt completes in one round trip; no session needed
    if total == 1 && ctx.enforcement.is_none() {
        let mut message = rendered;
        message.push_str("\n\n---\nStep 1/1");
        ctx.respond(ExecutionResponse {
            message,
            structured: json!({
                "isError": false,
                "chainProgress": { "currentStep": 1, "totalSteps": 1 },
            }),
            is_error: false,
        });
        return Ok(());
    }

    let parsed_command = ctx
        .request
        .command
        .clone()
        .or_else(|| ctx.parsed.as_ref().map(ParsedCommand::to_command_string))
        .unwrap_or_default();
    let first_prompt = match ctx.plan.step(1) {
        Some(PlannedStep::PromptRef { id, .. }) => id.clone(),
        _ => "(embedded)".to_string(),
    };
    let original_args = step_args_snapshot(ctx);
    let mut session = ChainSession::new(parsed_command, first_prompt, total, original_args);
    // Session/chain-scoped temporary gates stick to the chain for its lifetime
    if matches!(
        ctx.request.gate_scope,
        crate::pipeline::context::GateScope::Session | crate::pipeline::context::GateScope::Chain
    ) {
        session.extra_gates = ctx.request.temporary_gates.clone();
    }
    session.record_rendered(rendered.clone());
    let chain_id = session.chain_id.clone();
    let handle = engine.sessions.create(session).await?;
    ctx.session = Some(handle);

    let mut message = rendered;
    message.push_str(&format!(
        "\n\n---\nChain ID: {}\nSession ID: {}\nStep 1/{}\n\
Run the prompt above, then call the engine again with this chain_id and the model's output.",
        chain_id, chain_id, total
    ));
    ctx.respond(ExecutionResponse {
        message,
        structured: json!({
            "isError": false,
            "chainId": chain_id,
            "chainProgress": { "currentStep": 1, "totalSteps": total },
            "gateValidation": gate_summary(ctx, true, false, &[]),
        }),
        is_error: false,
    });
    Ok(())
}

/// Continuation handling: capture outputs, classify verdicts, apply user
/// actions, and render the next step.
async fn response_capture(engine: &Engine, ctx: &mut ExecutionContext) -> Result<()> {
    if ctx.kind != RequestKind::ResumeExistingChain {
        return Ok(());
    }
    let handle = ctx.session.as_ref().cloned().ok_or_else(|| {
        PromptLoomError::Internal {
            message: "resume without session".to_string(),
        }
    })?;
    // Verdict handling is serialized per session by this lock
    let mut session = handle.lock().await;

    if session.state.is_terminal() {
        let response = match session.state {
            SessionState::Complete => completion_response(&session, serde_json::Value::Null),
            _ => ExecutionResponse {
                message: format!("Chain {} was terminated.", session.chain_id),
                structured: json!({
                    "isError": false,
                    "chainId": session.chain_id,
                    "terminated": true,
                }),
                is_error: false,
            },
        };
        drop(session);
        ctx.respond(response);
        return Ok(());
    }

    // Exhausted review: the user must choose
    if session.state == SessionState::AwaitingUserChoice {
        let action = ctx
            .request
            .user_response
            .as_deref()
            .map(str::parse::<UserAction>);
        match action {
            Some(Ok(UserAction::Retry)) => {
                session.reset_for_retry();
                engine.sessions.persist(&session)?;
                let response = review_response(&session, false);
                drop(session);
                ctx.respond(response);
            }
            Some(Ok(UserAction::Skip)) => {
                session.advance();
                engine.sessions.persist(&session)?;
                self::advance_or_complete(engine, ctx, &mut session).await?;
            }
            Some(Ok(UserAction::Abort)) => {
                session.terminate();
                let chain_id = session.chain_id.clone();
                drop(session);
                engine.sessions.remove(&chain_id).await?;
                ctx.respond(ExecutionResponse {
                    message: format!("Chain {} aborted.", chain_id),
                    structured: json!({ "isError": false, "chainId": chain_id, "terminated": true }),
                    is_error: false,
                });
            }
            Some(Err(err)) => {
                return Err(PromptLoomError::Validation {
                    message: format!("{} (expected retry | skip | abort)", err),
                });
            }
            None => {
                let response = exhausted_response(&session);
                drop(session);
                ctx.respond(response);
            }
        }
        return Ok(());
    }

    // A pending review needs a verdict before anything else happens
    if session.state == SessionState::PendingReview {
        let verdict_input = ctx
            .request
            .gate_verdict
            .clone()
            .filter(|v| !v.is_empty())
            .map(|v| (v, VerdictSource::GateVerdict))
            .or_else(|| {
                ctx.request
                    .user_response
                    .clone()
                    .filter(|v| !v.is_empty())
                    .map(|v| (v, VerdictSource::UserResponse))
            });
        let Some((text, source)) = verdict_input else {
            let response = review_response(&session, false);
            drop(session);
            ctx.respond(response);
            return Ok(());
        };
        self::settle_review(engine, ctx, &mut session, &text, source).await?;
        return Ok(());
    }

    // In flight: capture the model output and/or verdict for the current step
    let reply = ctx.request.user_response.clone().filter(|r| !r.is_empty());
    let direct_verdict = ctx.request.gate_verdict.clone().filter(|v| !v.is_empty());
    if reply.is_some() || direct_verdict.is_some() {
        let step = session.current_step;
        if let Some(reply) = &reply {
            if !session.capture_output(step, reply.clone()) {
                ctx.diagnostics
                    .debug("response-capture", "step output already captured; reply ignored");
            }
            engine.sessions.persist(&session)?;
        }

        let gated = ctx.enforcement.is_some() && step == ctx.plan.total_steps();
        if gated {
            let plan = ctx.enforcement.clone().ok_or_else(|| PromptLoomError::Internal {
                message: "gated step without enforcement plan".to_string(),
            })?;
            session.begin_review(PendingReview {
                review_prompt: plan.criteria_block(),
                gate_ids: plan.gate_ids(),
                attempt_count: 0,
                max_attempts: plan.max_attempts,
                created_at: chrono::Utc::now(),
                retry_hints: Vec::new(),
                history: Vec::new(),
            })
            .map_err(|message| PromptLoomError::Session { message })?;
            engine.sessions.persist(&session)?;

            // Prefer the explicit verdict channel; a free-text reply may
            // still carry a verbose verdict
            let verdict_input = direct_verdict
                .map(|v| (v, VerdictSource::GateVerdict))
                .or_else(|| reply.clone().map(|r| (r, VerdictSource::UserResponse)));
            let settle_now = match &verdict_input {
                Some((text, source)) => {
                    gates::parse_verdict(text, *source).is_some()
                        || !plan.verification_gates().is_empty()
                }
                None => !plan.verification_gates().is_empty(),
            };
            if settle_now && let Some((text, source)) = verdict_input {
                self::settle_review(engine, ctx, &mut session, &text, source).await?;
            } else {
                let response = review_response(&session, false);
                drop(session);
                ctx.respond(response);
            }
            return Ok(());
        }

        if reply.is_none() {
            ctx.diagnostics.warning(
                "response-capture",
                "gate_verdict supplied but the current step has no gates",
            );
        }
        session.advance();
        engine.sessions.persist(&session)?;
        self::advance_or_complete(engine, ctx, &mut session).await?;
        return Ok(());
    }

    // Nothing to capture; re-emit the current step
    let response = reissue_response(&session);
    drop(session);
    ctx.respond(response);
    Ok(())
}

/// Package the response and make sure the session reached durable storage.
async fn finalize(engine: &Engine, ctx: &mut ExecutionContext) -> Result<()> {
    if let Some(handle) = &ctx.session {
        let session = handle.lock().await;
        // Terminal sessions were already removed from durable storage
        if !session.state.is_terminal() {
            let _ = engine.sessions.persist(&session);
        }
    }
    if let Some(response) = &mut ctx.response {
        if let Some(map) = response.structured.as_object_mut() {
            map.insert("diagnostics".to_string(), ctx.diagnostics.to_json());
        }
    }
    Ok(())
}

// --------------------------------------------------------------------------
// helpers

/// Settle a pending review with a verdict string and/or verification runs
async fn settle_review(
    engine: &Engine,
    ctx: &mut ExecutionContext,
    session: &mut ChainSession,
    text: &str,
    source: VerdictSource,
) -> Result<()> {
    let plan = ctx.enforcement.clone().ok_or_else(|| PromptLoomError::Internal {
        message: "pending review without enforcement plan".to_string(),
    })?;

    // Server-side verification gates run before the verdict is considered
    let verification_gates = plan.verification_gates();
    let mut verification_failed: Vec<String> = Vec::new();
    let mut verification_notes: Vec<String> = Vec::new();
    for gate in &verification_gates {
        if ctx.cancel.is_cancelled() {
            return Err(PromptLoomError::Cancelled);
        }
        let Some(spec) = gate.verification.clone() else { continue };
        let request = VerificationRequest {
            command: spec.command.clone(),
            workdir: engine.config.runtime.workspace_dir.clone(),
            timeout_secs: spec.timeout_secs,
            env_overrides: BTreeMap::new(),
        };
        let outcome =
            gates::run_verification(&request, &engine.config.verification, &ctx.cancel).await?;
        ctx.diagnostics.info(
            "response-capture",
            format!(
                "verification '{}': exit={:?} timed_out={} elapsed={}ms",
                spec.command, outcome.exit_code, outcome.timed_out, outcome.elapsed_ms
            ),
        );
        if !outcome.passed {
            verification_failed.push(gate.id.clone());
            let reason = if outcome.timed_out {
                format!("command '{}' timed out", spec.command)
            } else {
                format!(
                    "command '{}' exited {:?}: {}",
                    spec.command,
                    outcome.exit_code,
                    outcome.output.lines().last().unwrap_or("")
                )
            };
            verification_notes.push(reason);
        }
    }

    // Model verdict, when the review has validation gates or the reply
    // carries one anyway
    let parsed_verdict = gates::parse_verdict(text, source);
    let needs_model_verdict = plan
        .gates
        .iter()
        .any(|g| g.gate.gate_type != GateType::Verification);

    let verdict = match parsed_verdict {
        Some(v) if !verification_failed.is_empty() => gates::ParsedVerdict {
            passed: false,
            rationale: format!(
                "{}; verification failed: {}",
                v.rationale,
                verification_notes.join("; ")
            ),
            class: v.class,
            pattern: v.pattern,
        },
        Some(v) => v,
        None if !verification_gates.is_empty() && !needs_model_verdict => {
            // Verification-only reviews synthesize their verdict
            gates::ParsedVerdict {
                passed: verification_failed.is_empty(),
                rationale: if verification_failed.is_empty() {
                    "all verification commands passed".to_string()
                } else {
                    verification_notes.join("; ")
                },
                class: gates::VerdictClass::Primary,
                pattern: 0,
            }
        }
        None => {
            // Unparseable verdicts leave the session pending
            ctx.diagnostics.push(
                crate::pipeline::context::DiagnosticLevel::Warning,
                "response-capture",
                format!("no verdict recognized from {:?} source", source_label(source)),
                None,
                Some("verdict_format_error".to_string()),
            );
            let response = review_response(session, true);
            ctx.respond(response);
            return Ok(());
        }
    };

    engine.metrics.record_verdict(verdict.passed);
    let outcome = gates::apply_verdict(session, &verdict, plan.mode);
    engine.sessions.persist(session)?;

    match outcome {
        VerdictOutcome::Advanced { warned } => {
            if warned {
                ctx.diagnostics.warning(
                    "response-capture",
                    format!("advisory gate failed: {}", verdict.rationale),
                );
            }
            advance_or_complete(engine, ctx, session).await
        }
        VerdictOutcome::RetryPending { attempt, max_attempts } => {
            ctx.diagnostics.info(
                "response-capture",
                format!("blocking gate failed, attempt {}/{}", attempt, max_attempts),
            );
            let response = review_response(session, false);
            ctx.respond(response);
            Ok(())
        }
        VerdictOutcome::Exhausted => {
            let response = exhausted_response(session);
            ctx.respond(response);
            Ok(())
        }
    }
}

/// After an advance: render the next step, or close out a completed chain
async fn advance_or_complete(
    engine: &Engine,
    ctx: &mut ExecutionContext,
    session: &mut ChainSession,
) -> Result<()> {
    if session.state == SessionState::Complete {
        let response = completion_response(session, gate_summary(ctx, true, false, &[]));
        let chain_id = session.chain_id.clone();
        // Completed chains are destroyed after their final response
        engine.sessions.remove(&chain_id).await?;
        ctx.respond(response);
        return Ok(());
    }

    let step = session.current_step;
    let rendered = render_step(engine, ctx, Some(session), step)?;
    session.record_rendered(rendered.clone());

    let total = session.total_steps;
    let chain_id = session.chain_id.clone();

    // Rendering the final step of an ungated chain closes it out in the
    // same response; gated chains stay in flight awaiting the verdict.
    if step == total && ctx.enforcement.is_none() {
        session.advance();
        engine.sessions.remove(&chain_id).await?;
        let mut message = rendered;
        message.push_str(&format!(
            "\n\n✓ Chain complete ({}/{}).\n\n---\nChain ID: {}\nSession ID: {}",
            total, total, chain_id, chain_id
        ));
        ctx.respond(ExecutionResponse {
            message,
            structured: json!({
                "isError": false,
                "chainId": chain_id,
                "complete": true,
                "chainProgress": { "currentStep": total, "totalSteps": total },
            }),
            is_error: false,
        });
        return Ok(());
    }

    engine.sessions.persist(session)?;
    let mut message = rendered;
    message.push_str(&format!(
        "\n\n---\nChain ID: {}\nSession ID: {}\nStep {}/{}",
        chain_id, chain_id, step, total
    ));
    ctx.respond(ExecutionResponse {
        message,
        structured: json!({
            "isError": false,
            "chainId": chain_id,
            "chainProgress": { "currentStep": step, "totalSteps": total },
            "gateValidation": gate_summary(ctx, true, false, &[]),
        }),
        is_error: false,
    });
    Ok(())
}

/// Render one step: guidance sections, body, gate criteria, style
fn render_step(
    engine: &Engine,
    ctx: &mut ExecutionContext,
    session: Option<&ChainSession>,
    step: u32,
) -> Result<String> {
    let plan = ctx.plan.clone();
    let total = plan.total_steps().max(
        session.map(|s| s.total_steps).unwrap_or(0),
    );
    let planned = plan
        .step(step)
        .ok_or_else(|| PromptLoomError::Internal {
            message: format!("no planned step {}", step),
        })?
        .clone();

    let mut arg_ctx = ArgContext::default();
    if let Some(session) = session {
        arg_ctx.previous_step_output = session.previous_output().map(str::to_string);
        for record in &session.steps {
            if let Some(output) = record.output.as_deref()
                && !record.placeholder
            {
                arg_ctx.step_results.insert(record.index, output.to_string());
            }
        }
    }

    let modifiers = ctx
        .parsed
        .as_ref()
        .map(|p| p.modifiers())
        .unwrap_or_default();
    let category;
    let body = match &planned {
        PlannedStep::PromptRef {
            id,
            raw_args,
            input_mapping,
        } => {
            // Re-fetch by id so a reload between creation and use is tolerated
            let prompt = ctx
                .registry
                .get_prompt(id)
                .ok_or_else(|| PromptLoomError::UnknownPrompt { id: id.clone() })?;
            category = prompt.category.clone();
            let mut args = if input_mapping.is_empty() {
                command::process_arguments(
                    &prompt,
                    raw_args,
                    &arg_ctx,
                    &engine.config.arguments.env_whitelist,
                )?
            } else {
                let chain_vars = session
                    .map(|s| s.original_args.clone())
                    .unwrap_or_default();
                let mut mapped = command::apply_input_mapping(input_mapping, &chain_vars, &arg_ctx);
                // Defaults and chain-context names still fill the rest
                let remainder = command::process_arguments(
                    &prompt,
                    &[],
                    &arg_ctx,
                    &engine.config.arguments.env_whitelist,
                )
                .unwrap_or_default();
                for (k, v) in remainder {
                    mapped.entry(k).or_insert(v);
                }
                mapped
            };
            if let Some(previous) = &arg_ctx.previous_step_output {
                args.entry("previous_step_output".to_string())
                    .or_insert_with(|| previous.clone());
            }
            for (n, output) in &arg_ctx.step_results {
                args.entry(format!("step{}_result", n))
                    .or_insert_with(|| output.clone());
            }
            let mut body = String::new();
            if let Some(system) = &prompt.system_template {
                body.push_str(&render(system, &args, &mut ctx.diagnostics, "enhance"));
                body.push_str("\n\n");
            }
            body.push_str(&render(&prompt.template, &args, &mut ctx.diagnostics, "enhance"));
            body
        }
        PlannedStep::Embedded {
            instruction,
            expected_output,
        } => {
            category = String::new();
            let mut vars = BTreeMap::new();
            if let Some(previous) = &arg_ctx.previous_step_output {
                vars.insert("previous_step_output".to_string(), previous.clone());
            }
            for (n, output) in &arg_ctx.step_results {
                vars.insert(format!("step{}_result", n), output.clone());
            }
            let mut body = render(instruction, &vars, &mut ctx.diagnostics, "enhance");
            body.push_str(&format!("\n\nRequired output: {}", expected_output));
            body
        }
    };

    // Injection decisions are cached per type for this request
    let inputs = DecisionInputs {
        modifiers,
        chain_id: session
            .map(|s| s.chain_id.clone())
            .or_else(|| ctx.request.chain_id.clone()),
        category,
        step,
        total_steps: total.max(1),
        previous_step_success: session.and_then(|s| s.last_review_passed),
        passed_gates: session
            .map(|s| s.passed_gates.iter().cloned().collect())
            .unwrap_or_default(),
    };
    let mut service = InjectionDecisionService::new(&engine.config, &engine.overrides);
    let system_decision = service.decide(InjectionType::SystemPrompt, &inputs);
    let gate_decision = service.decide(InjectionType::GateGuidance, &inputs);
    let style_decision = service.decide(InjectionType::StyleGuidance, &inputs);

    let mut sections: Vec<String> = Vec::new();
    if let Some(methodology) = &plan.methodology
        && system_decision.injects_at(step)
        && system_decision.covers(false)
    {
        let mut block = methodology.system_prompt.clone();
        if !methodology.phases.is_empty() {
            block.push_str(&format!("\nPhases: {}", methodology.phases.join(" -> ")));
        }
        sections.push(block);
        ctx.diagnostics
            .debug("enhance", format!("injected methodology '{}'", methodology.id));
    }
    if plan.judge_phase && step == 1 {
        sections.push(
            "Before answering, review the available methodologies and gates and state \
which you will apply (FRAMEWORK: <id>) and why."
                .to_string(),
        );
    }
    sections.push(body);

    let gated = ctx.enforcement.is_some() && step == plan.total_steps();
    if gated && let Some(enforcement) = &ctx.enforcement {
        sections.push(enforcement.criteria_block());
        if gate_decision.injects_at(step) && gate_decision.covers(true) {
            for entry in &enforcement.gates {
                if let Some(guidance) = &entry.gate.guidance {
                    sections.push(format!("Gate guidance ({}):\n{}", entry.gate.id, guidance));
                }
            }
        }
    }
    if let Some(style) = &plan.style
        && style_decision.injects_at(step)
        && style_decision.covers(false)
    {
        sections.push(format!("Response style ({}):\n{}", style.id, style.guidance));
    }

    Ok(sections.join("\n\n"))
}

/// Snapshot of step-1 arguments for the session record
fn step_args_snapshot(ctx: &ExecutionContext) -> BTreeMap<String, String> {
    let Some(PlannedStep::PromptRef { id, raw_args, .. }) = ctx.plan.step(1) else {
        return BTreeMap::new();
    };
    let Some(prompt) = ctx.registry.get_prompt(id) else {
        return BTreeMap::new();
    };
    command::process_arguments(&prompt, raw_args, &ArgContext::default(), &[])
        .unwrap_or_default()
}

fn source_label(source: VerdictSource) -> &'static str {
    match source {
        VerdictSource::GateVerdict => "gate_verdict",
        VerdictSource::UserResponse => "user_response",
    }
}

fn gate_summary(
    ctx: &ExecutionContext,
    passed: bool,
    retry_required: bool,
    failed: &[String],
) -> serde_json::Value {
    match &ctx.enforcement {
        Some(plan) => json!({
            "passed": passed,
            "retryRequired": retry_required,
            "failedGates": failed,
            "retryHints": [],
            "totalGates": plan.gates.len(),
        }),
        None => serde_json::Value::Null,
    }
}

/// Response while a review is pending (initial, retry, or unparseable verdict)
fn review_response(session: &ChainSession, verdict_unparseable: bool) -> ExecutionResponse {
    let review = session.pending_review.as_ref();
    let mut message = String::new();
    if verdict_unparseable {
        message.push_str(
            "The verdict could not be parsed. Reply with GATE_REVIEW: PASS - <reason> \
or GATE_REVIEW: FAIL - <reason>.\n\n",
        );
    }
    if let Some(review) = review {
        message.push_str(&review.review_prompt);
        if !review.retry_hints.is_empty() {
            message.push_str("\n\nPrevious attempt feedback:\n");
            for hint in &review.retry_hints {
                message.push_str(&format!("- {}\n", hint));
            }
        }
    }
    message.push_str(&format!(
        "\n---\nChain ID: {}\nSession ID: {}\nStep {}/{}",
        session.chain_id, session.chain_id, session.current_step, session.total_steps
    ));
    let (attempts, max_attempts, gate_ids, hints) = review
        .map(|r| {
            (
                r.attempt_count,
                r.max_attempts,
                r.gate_ids.clone(),
                r.retry_hints.clone(),
            )
        })
        .unwrap_or((0, 0, Vec::new(), Vec::new()));
    ExecutionResponse {
        message,
        structured: json!({
            "isError": false,
            "chainId": session.chain_id,
            "chainProgress": {
                "currentStep": session.current_step,
                "totalSteps": session.total_steps,
            },
            "gateValidation": {
                "passed": false,
                "retryRequired": true,
                "failedGates": gate_ids,
                "retryHints": hints,
                "attempts": attempts,
                "maxAttempts": max_attempts,
            },
        }),
        is_error: false,
    }
}

/// Response once a blocking review has exhausted its attempts
fn exhausted_response(session: &ChainSession) -> ExecutionResponse {
    let review = session.pending_review.as_ref();
    let gate_ids = review.map(|r| r.gate_ids.clone()).unwrap_or_default();
    let hints = review.map(|r| r.retry_hints.clone()).unwrap_or_default();
    let message = format!(
        "Gate review exhausted its retry budget.\nFailed gates: {}\n\
Next actions: retry | skip | abort\n\n---\nChain ID: {}\nSession ID: {}\nStep {}/{}",
        gate_ids.join(", "),
        session.chain_id,
        session.chain_id,
        session.current_step,
        session.total_steps
    );
    ExecutionResponse {
        message,
        structured: json!({
            "isError": false,
            "chainId": session.chain_id,
            "awaitingUserChoice": true,
            "nextActions": ["retry", "skip", "abort"],
            "chainProgress": {
                "currentStep": session.current_step,
                "totalSteps": session.total_steps,
            },
            "gateValidation": {
                "passed": false,
                "retryRequired": false,
                "failedGates": gate_ids,
                "retryHints": hints,
            },
        }),
        is_error: false,
    }
}

/// Response for a completed chain
fn completion_response(
    session: &ChainSession,
    gate_validation: serde_json::Value,
) -> ExecutionResponse {
    let total = session.total_steps;
    let message = format!(
        "✓ Chain complete ({}/{}).\n\n---\nChain ID: {}\nSession ID: {}",
        total, total, session.chain_id, session.chain_id
    );
    ExecutionResponse {
        message,
        structured: json!({
            "isError": false,
            "chainId": session.chain_id,
            "complete": true,
            "chainProgress": { "currentStep": total, "totalSteps": total },
            "gateValidation": gate_validation,
        }),
        is_error: false,
    }
}

/// Re-emit the current step when a resume call carried nothing to capture
fn reissue_response(session: &ChainSession) -> ExecutionResponse {
    let rendered = session
        .steps
        .iter()
        .find(|s| s.index == session.current_step)
        .map(|s| s.rendered_prompt.clone())
        .unwrap_or_default();
    let mut message = rendered;
    message.push_str(&format!(
        "\n\n---\nChain ID: {}\nSession ID: {}\nStep {}/{}",
        session.chain_id, session.chain_id, session.current_step, session.total_steps
    ));
    ExecutionResponse {
        message,
        structured: json!({
            "isError": false,
            "chainId": session.chain_id,
            "chainProgress": {
                "currentStep": session.current_step,
                "totalSteps": session.total_steps,
            },
        }),
        is_error: false,
    }
}
