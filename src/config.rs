//! Configuration loaded from prompt_loom.toml and LOOM_* environment variables

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Injection frequency resolved per call: inject always, on the first step only,
/// on every k-th step, or never.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Frequency {
    Always,
    FirstOnly,
    Every(u32),
    Never,
}

impl Frequency {
    /// Whether the 1-indexed step matches this frequency
    pub fn matches_step(&self, step: u32) -> bool {
        match self {
            Frequency::Always => true,
            Frequency::FirstOnly => step == 1,
            Frequency::Every(k) => *k > 0 && (step.saturating_sub(1)) % k == 0,
            Frequency::Never => false,
        }
    }
}

impl std::str::FromStr for Frequency {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        match s.as_str() {
            "always" => return Ok(Frequency::Always),
            "first-only" | "first_only" => return Ok(Frequency::FirstOnly),
            "never" => return Ok(Frequency::Never),
            _ => {}
        }
        // Accept both every:k and every(k)
        let inner = s
            .strip_prefix("every:")
            .or_else(|| s.strip_prefix("every(").and_then(|r| r.strip_suffix(')')));
        if let Some(k) = inner {
            return k
                .trim()
                .parse::<u32>()
                .ok()
                .filter(|k| *k > 0)
                .map(Frequency::Every)
                .ok_or_else(|| format!("invalid interval in frequency '{}'", s));
        }
        Err(format!("unrecognized frequency '{}'", s))
    }
}

impl TryFrom<String> for Frequency {
    type Error = String;
    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Frequency> for String {
    fn from(f: Frequency) -> String {
        match f {
            Frequency::Always => "always".to_string(),
            Frequency::FirstOnly => "first-only".to_string(),
            Frequency::Every(k) => format!("every:{}", k),
            Frequency::Never => "never".to_string(),
        }
    }
}

/// Which outgoing prompts carry injected guidance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum InjectionTarget {
    #[default]
    Both,
    Steps,
    Gates,
}

/// Settings for one injection type (system-prompt, gate-guidance, style-guidance)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InjectionTypeConfig {
    pub enabled: bool,
    pub frequency: Frequency,
    #[serde(default)]
    pub target: InjectionTarget,
}

/// A configured injection rule scoped to steps, chains, or prompt categories.
/// Matcher grammar is interpreted by the injection decision service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InjectionRule {
    /// One of: step, chain, category
    pub scope: String,
    /// One of: system-prompt, gate-guidance, style-guidance
    pub injection: String,
    /// Matcher expression (step index/parity/position/outcome predicate,
    /// chain-id glob, or category name depending on scope)
    pub matcher: String,
    pub enabled: bool,
    #[serde(default)]
    pub frequency: Option<Frequency>,
}

/// Injection configuration block
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InjectionConfig {
    pub system_prompt: InjectionTypeConfig,
    pub gate_guidance: InjectionTypeConfig,
    pub style_guidance: InjectionTypeConfig,
    #[serde(default)]
    pub rules: Vec<InjectionRule>,
}

impl Default for InjectionConfig {
    fn default() -> Self {
        // Built-in system defaults: system-prompt on, gate-guidance on,
        // style-guidance first-only
        Self {
            system_prompt: InjectionTypeConfig {
                enabled: true,
                frequency: Frequency::Always,
                target: InjectionTarget::Both,
            },
            gate_guidance: InjectionTypeConfig {
                enabled: true,
                frequency: Frequency::Always,
                target: InjectionTarget::Both,
            },
            style_guidance: InjectionTypeConfig {
                enabled: true,
                frequency: Frequency::FirstOnly,
                target: InjectionTarget::Steps,
            },
            rules: Vec::new(),
        }
    }
}

/// Methodology (framework) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameworksConfig {
    /// Global kill switch for all methodology effects
    pub enabled: bool,
    /// Methodology active at startup, if any
    #[serde(default)]
    pub active: Option<String>,
}

impl Default for FrameworksConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            active: None,
        }
    }
}

/// Gate ids attached to chains whose id matches a glob pattern
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainGateRule {
    pub pattern: String,
    pub gates: Vec<String>,
}

/// Gate enforcement configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatesConfig {
    pub default_max_attempts: u32,
    /// Chain-level gate attachments (priority 50 source)
    #[serde(default)]
    pub chain_rules: Vec<ChainGateRule>,
}

impl Default for GatesConfig {
    fn default() -> Self {
        Self {
            default_max_attempts: 3,
            chain_rules: Vec::new(),
        }
    }
}

/// Chain session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsConfig {
    pub idle_expiry_seconds: u64,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            idle_expiry_seconds: 3600,
        }
    }
}

/// Hot-reload configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HotReloadConfig {
    pub debounce_ms: u64,
}

impl Default for HotReloadConfig {
    fn default() -> Self {
        Self { debounce_ms: 500 }
    }
}

/// Version-history sidecar settings. The sidecar itself is an external
/// collaborator; only `enabled` is consulted here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersioningConfig {
    pub enabled: bool,
    pub max_versions: u32,
    pub auto_version: bool,
}

impl Default for VersioningConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_versions: 10,
            auto_version: false,
        }
    }
}

/// Shell verification runner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationConfig {
    /// Upper clamp for per-gate timeouts, seconds
    pub max_timeout_secs: u64,
    /// Cap on captured combined stdout/stderr, bytes
    pub output_cap_bytes: usize,
    /// Env var name fragments scrubbed before spawning
    pub secret_patterns: Vec<String>,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            max_timeout_secs: 600,
            output_cap_bytes: 64 * 1024,
            secret_patterns: vec![
                "SECRET".to_string(),
                "TOKEN".to_string(),
                "KEY".to_string(),
                "PASSWORD".to_string(),
            ],
        }
    }
}

/// Argument processor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArgumentsConfig {
    /// Env vars the processor may read to fill optional arguments
    pub env_whitelist: Vec<String>,
}

impl Default for ArgumentsConfig {
    fn default() -> Self {
        Self {
            env_whitelist: vec![
                "USER".to_string(),
                "HOME".to_string(),
                "LANG".to_string(),
                "PWD".to_string(),
            ],
        }
    }
}

/// Pipeline orchestrator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Soft per-stage budget; exceeding it logs a warning diagnostic
    pub stage_soft_timeout_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stage_soft_timeout_secs: 30,
        }
    }
}

/// Resource tree locations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourcePaths {
    pub prompts_dir: PathBuf,
    pub gates_dir: PathBuf,
    pub methodologies_dir: PathBuf,
    pub sessions_dir: PathBuf,
}

impl Default for ResourcePaths {
    fn default() -> Self {
        let base = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("prompt-loom");
        Self {
            prompts_dir: base.join("prompts"),
            gates_dir: base.join("gates"),
            methodologies_dir: base.join("methodologies"),
            sessions_dir: base.join("sessions"),
        }
    }
}

/// Runtime configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub log_level: String,
    pub mcp_no_log: bool,
    /// Default working directory for shell verification
    pub workspace_dir: Option<PathBuf>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            log_level: "prompt_loom=info,rmcp=info".to_string(),
            mcp_no_log: false,
            workspace_dir: None,
        }
    }
}

impl RuntimeConfig {
    /// Load runtime configuration from environment variables
    pub fn load_from_env() -> Self {
        Self {
            log_level: std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "prompt_loom=info,rmcp=info".to_string()),
            mcp_no_log: std::env::var("MCP_NO_LOG")
                .ok()
                .is_some_and(|v| v == "true" || v == "1"),
            workspace_dir: std::env::var("LOOM_WORKSPACE").ok().map(PathBuf::from),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub injection: InjectionConfig,
    pub frameworks: FrameworksConfig,
    pub gates: GatesConfig,
    pub sessions: SessionsConfig,
    pub hot_reload: HotReloadConfig,
    pub versioning: VersioningConfig,
    pub verification: VerificationConfig,
    pub arguments: ArgumentsConfig,
    pub pipeline: PipelineConfig,
    pub resources: ResourcePaths,
    /// Runtime configuration loaded from environment variables
    #[serde(skip)]
    pub runtime: RuntimeConfig,
}

impl Config {
    /// Load configuration from TOML file and environment variables.
    /// Uses LOOM_CONFIG environment variable or defaults to "prompt_loom.toml".
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(None)
    }

    /// Load with an explicit config file path (CLI override)
    pub fn load_from(path: Option<&std::path::Path>) -> anyhow::Result<Self> {
        let _ = dotenvy::dotenv();

        let config_path = path
            .map(|p| p.display().to_string())
            .or_else(|| std::env::var("LOOM_CONFIG").ok())
            .unwrap_or_else(|| "prompt_loom.toml".to_string());

        let mut config: Config = if let Ok(content) = std::fs::read_to_string(&config_path) {
            toml::from_str(&content)?
        } else {
            tracing::warn!("Config file {} not found, using defaults", config_path);
            Self::default()
        };

        config.apply_env_overrides();
        config.runtime = RuntimeConfig::load_from_env();
        config.validate();

        Ok(config)
    }

    /// Apply LOOM_* env overrides on top of the file-loaded values (env-first)
    fn apply_env_overrides(&mut self) {
        if let Some(v) = env_parse::<u64>("LOOM_HOT_RELOAD_DEBOUNCE_MS") {
            self.hot_reload.debounce_ms = v;
        }
        if let Some(v) = env_parse::<u64>("LOOM_SESSION_IDLE_EXPIRY_SECS") {
            self.sessions.idle_expiry_seconds = v;
        }
        if let Some(v) = env_parse::<u32>("LOOM_GATE_MAX_ATTEMPTS") {
            self.gates.default_max_attempts = v;
        }
        if let Some(v) = env_bool("LOOM_FRAMEWORKS_ENABLED") {
            self.frameworks.enabled = v;
        }
        if let Ok(dir) = std::env::var("LOOM_PROMPTS_DIR") {
            self.resources.prompts_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("LOOM_GATES_DIR") {
            self.resources.gates_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("LOOM_METHODOLOGIES_DIR") {
            self.resources.methodologies_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("LOOM_SESSIONS_DIR") {
            self.resources.sessions_dir = PathBuf::from(dir);
        }
        if let Some(v) = env_parse::<u64>("LOOM_VERIFY_MAX_TIMEOUT_SECS") {
            self.verification.max_timeout_secs = v;
        }
        if let Some(v) = env_parse::<u64>("LOOM_STAGE_SOFT_TIMEOUT_SECS") {
            self.pipeline.stage_soft_timeout_secs = v;
        }
    }

    /// Validate configuration, clamping out-of-range values
    fn validate(&mut self) {
        if self.gates.default_max_attempts == 0 {
            self.gates.default_max_attempts = 1;
        } else if self.gates.default_max_attempts > 20 {
            tracing::warn!(
                "gates.default_max_attempts {} exceeds max 20, clamping",
                self.gates.default_max_attempts
            );
            self.gates.default_max_attempts = 20;
        }
        if self.hot_reload.debounce_ms == 0 {
            self.hot_reload.debounce_ms = 50;
        }
        if self.verification.max_timeout_secs == 0 {
            self.verification.max_timeout_secs = 1;
        }
        for rule in &self.injection.rules {
            if !matches!(rule.scope.as_str(), "step" | "chain" | "category") {
                tracing::warn!("injection rule with unknown scope '{}' ignored", rule.scope);
            }
        }
    }

    /// Sweep interval for the idle-expiry task: at most every debounce_ms * 4
    pub fn sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.hot_reload.debounce_ms.saturating_mul(4).max(200))
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| v == "true" || v == "1")
}
