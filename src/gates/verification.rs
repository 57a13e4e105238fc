//! Shell verification runner for gates of type `verification`.
//!
//! Spawns the declared command through the system shell with a clamped
//! timeout, a denylist-filtered environment, and capped output capture.

use crate::config::VerificationConfig;
use crate::error::{PromptLoomError, Result};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Instant;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Lower clamp for per-gate timeouts
const MIN_TIMEOUT_SECS: u64 = 1;

/// One verification invocation
#[derive(Debug, Clone)]
pub struct VerificationRequest {
    pub command: String,
    /// Defaults to the request workspace when unset
    pub workdir: Option<PathBuf>,
    pub timeout_secs: Option<u64>,
    /// Explicit additions layered on top of the filtered environment
    pub env_overrides: BTreeMap<String, String>,
}

/// Outcome of one verification run
#[derive(Debug, Clone)]
pub struct VerificationOutcome {
    pub exit_code: Option<i32>,
    /// Combined stdout/stderr, capped at the configured size
    pub output: String,
    pub elapsed_ms: u64,
    pub timed_out: bool,
    pub passed: bool,
}

/// Preset bundles: (max attempts, timeout seconds). Presets only supply
/// defaults; explicit `timeout:` / `max:` on the gate operator override them.
pub fn preset_defaults(name: &str) -> Option<(u32, u64)> {
    match name {
        "fast" => Some((1, 30)),
        "full" => Some((5, 300)),
        "extended" => Some((10, 600)),
        _ => None,
    }
}

/// Whether an environment variable name looks secret-bearing
fn is_secret_like(name: &str, patterns: &[String]) -> bool {
    let upper = name.to_ascii_uppercase();
    patterns
        .iter()
        .any(|p| upper.contains(&p.to_ascii_uppercase()))
}

/// Run a verification command. `passed` is true iff the process exited zero
/// within its budget; a timeout surfaces as a failed outcome, not an error.
pub async fn run(
    request: &VerificationRequest,
    config: &VerificationConfig,
    cancel: &CancellationToken,
) -> Result<VerificationOutcome> {
    let timeout_secs = request
        .timeout_secs
        .unwrap_or(30)
        .clamp(MIN_TIMEOUT_SECS, config.max_timeout_secs);

    let mut cmd = if cfg!(windows) {
        let mut c = Command::new("cmd");
        c.arg("/C").arg(&request.command);
        c
    } else {
        let mut c = Command::new("sh");
        c.arg("-c").arg(&request.command);
        c
    };
    cmd.kill_on_drop(true)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    // Denylist-filtered environment, then explicit overrides on top
    cmd.env_clear();
    for (name, value) in std::env::vars() {
        if !is_secret_like(&name, &config.secret_patterns) {
            cmd.env(name, value);
        }
    }
    for (name, value) in &request.env_overrides {
        cmd.env(name, value);
    }

    if let Some(workdir) = &request.workdir {
        cmd.current_dir(workdir);
    }

    let start = Instant::now();
    let deadline = std::time::Duration::from_secs(timeout_secs);
    let output = tokio::select! {
        _ = cancel.cancelled() => return Err(PromptLoomError::Cancelled),
        result = tokio::time::timeout(deadline, cmd.output()) => result,
    };

    let elapsed_ms = start.elapsed().as_millis().min(u128::from(u64::MAX)) as u64;
    match output {
        Ok(Ok(output)) => {
            let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.trim().is_empty() {
                if !combined.is_empty() {
                    combined.push('\n');
                }
                combined.push_str(&stderr);
            }
            if combined.len() > config.output_cap_bytes {
                combined.truncate(floor_char_boundary(&combined, config.output_cap_bytes));
                combined.push_str("\n[output truncated]");
            }
            let exit_code = output.status.code();
            let passed = output.status.success();
            Ok(VerificationOutcome {
                exit_code,
                output: combined,
                elapsed_ms,
                timed_out: false,
                passed,
            })
        }
        Ok(Err(err)) => Err(PromptLoomError::ShellVerification {
            message: format!("failed to spawn '{}': {}", request.command, err),
        }),
        Err(_) => Ok(VerificationOutcome {
            exit_code: None,
            output: String::new(),
            elapsed_ms,
            timed_out: true,
            passed: false,
        }),
    }
}

fn floor_char_boundary(s: &str, max: usize) -> usize {
    let mut idx = max.min(s.len());
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}
