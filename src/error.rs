//! Domain-specific error types for prompt-loom

use serde_json::json;
use thiserror::Error;

/// Main error type for the prompt-loom MCP server
#[derive(Error, Debug)]
pub enum PromptLoomError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Parse error at {position}: {message} ({token})")]
    Parse {
        message: String,
        position: usize,
        token: String,
    },

    #[error("Unknown prompt: {id}")]
    UnknownPrompt { id: String },

    #[error("Argument error: {message}")]
    Argument { message: String },

    #[error("Session error: {message}")]
    Session { message: String },

    #[error("Verdict format error: {message}")]
    VerdictFormat { message: String },

    #[error("Resource load error in {path}: {message}")]
    ResourceLoad { path: String, message: String },

    #[error("Shell verification failed: {message}")]
    ShellVerification { message: String },

    #[error("Verification command timed out after {timeout_secs}s")]
    ShellTimeout { timeout_secs: u64 },

    #[error("Request cancelled")]
    Cancelled,

    #[error("MCP protocol error: {message}")]
    Mcp { message: String },

    #[error("Serialization error: {message}")]
    Serialization { message: String },

    #[error("Validation error: {message}")]
    Validation { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl PromptLoomError {
    /// Stable machine-readable code surfaced in error responses
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config { .. } => "config_error",
            Self::Parse { .. } => "parse_error",
            Self::UnknownPrompt { .. } => "unknown_prompt",
            Self::Argument { .. } => "argument_error",
            Self::Session { .. } => "session_error",
            Self::VerdictFormat { .. } => "verdict_format_error",
            Self::ResourceLoad { .. } => "resource_load_error",
            Self::ShellVerification { .. } => "shell_verification_error",
            Self::ShellTimeout { .. } => "shell_timeout_error",
            Self::Cancelled => "cancelled",
            Self::Mcp { .. } => "mcp_error",
            Self::Serialization { .. } => "serialization_error",
            Self::Validation { .. } => "validation_error",
            Self::Internal { .. } => "internal_error",
        }
    }

    /// Whether this error terminates the pipeline (vs being recorded and continued past)
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            Self::VerdictFormat { .. } | Self::ResourceLoad { .. }
        )
    }
}

impl From<anyhow::Error> for PromptLoomError {
    fn from(err: anyhow::Error) -> Self {
        PromptLoomError::Internal {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for PromptLoomError {
    fn from(err: serde_json::Error) -> Self {
        PromptLoomError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<std::io::Error> for PromptLoomError {
    fn from(err: std::io::Error) -> Self {
        PromptLoomError::Internal {
            message: format!("I/O error: {}", err),
        }
    }
}

impl From<rmcp::ErrorData> for PromptLoomError {
    fn from(err: rmcp::ErrorData) -> Self {
        PromptLoomError::Mcp {
            message: err.message.to_string(),
        }
    }
}

/// Convert PromptLoomError to MCP error
impl From<PromptLoomError> for rmcp::ErrorData {
    fn from(err: PromptLoomError) -> Self {
        let code = err.code();
        let (mcp_code, label, details) = match err {
            PromptLoomError::Config { message } => (
                rmcp::model::ErrorCode::INVALID_PARAMS,
                "Configuration error",
                message,
            ),
            PromptLoomError::Parse {
                message,
                position,
                token,
            } => (
                rmcp::model::ErrorCode::INVALID_PARAMS,
                "Parse error",
                format!("{} at {} near '{}'", message, position, token),
            ),
            PromptLoomError::UnknownPrompt { id } => (
                rmcp::model::ErrorCode::INVALID_PARAMS,
                "Unknown prompt",
                id,
            ),
            PromptLoomError::Argument { message } => (
                rmcp::model::ErrorCode::INVALID_PARAMS,
                "Argument error",
                message,
            ),
            PromptLoomError::Session { message } => (
                rmcp::model::ErrorCode::INVALID_PARAMS,
                "Session error",
                message,
            ),
            PromptLoomError::VerdictFormat { message } => (
                rmcp::model::ErrorCode::INVALID_PARAMS,
                "Verdict format error",
                message,
            ),
            PromptLoomError::ResourceLoad { path, message } => (
                rmcp::model::ErrorCode::INTERNAL_ERROR,
                "Resource load error",
                format!("{}: {}", path, message),
            ),
            PromptLoomError::ShellVerification { message } => (
                rmcp::model::ErrorCode::INTERNAL_ERROR,
                "Shell verification error",
                message,
            ),
            PromptLoomError::ShellTimeout { timeout_secs } => (
                rmcp::model::ErrorCode::INTERNAL_ERROR,
                "Shell timeout",
                format!("command exceeded {}s budget", timeout_secs),
            ),
            PromptLoomError::Cancelled => (
                rmcp::model::ErrorCode::INTERNAL_ERROR,
                "Cancelled",
                "request was cancelled".to_string(),
            ),
            PromptLoomError::Mcp { message } => (
                rmcp::model::ErrorCode::INVALID_PARAMS,
                "MCP protocol error",
                message,
            ),
            PromptLoomError::Serialization { message } => (
                rmcp::model::ErrorCode::INTERNAL_ERROR,
                "Serialization error",
                message,
            ),
            PromptLoomError::Validation { message } => (
                rmcp::model::ErrorCode::INVALID_PARAMS,
                "Validation error",
                message,
            ),
            PromptLoomError::Internal { message } => (
                rmcp::model::ErrorCode::INTERNAL_ERROR,
                "Internal error",
                message,
            ),
        };

        rmcp::ErrorData {
            code: mcp_code,
            message: format!("{label}: {details}").into(),
            data: Some(json!({ "code": code, "details": details })),
        }
    }
}

/// Result type alias for prompt-loom operations
pub type Result<T> = std::result::Result<T, PromptLoomError>;
