//! system_control tool handler: methodology activation, injection overrides,
//! and registry reload requests.

use crate::config::Frequency;
use crate::decisions::{InjectionOverride, OverrideScope};
use crate::error::{PromptLoomError, Result};
use crate::server::PromptLoomServer;
use rmcp::model::{CallToolRequestParam, CallToolResult};
use serde_json::json;

#[derive(Debug, serde::Deserialize)]
pub struct SystemControlParams {
    pub action: String,
    #[serde(default)]
    pub methodology: Option<String>,
    #[serde(default)]
    pub injection: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub frequency: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub chain_id: Option<String>,
    #[serde(default)]
    pub ttl_seconds: Option<u64>,
}

impl PromptLoomServer {
    /// Handle the system_control tool call
    pub async fn handle_system_control(
        &self,
        request: CallToolRequestParam,
    ) -> Result<CallToolResult> {
        let args = request.arguments.ok_or_else(|| PromptLoomError::Mcp {
            message: "Missing parameters".into(),
        })?;
        let params: SystemControlParams = serde_json::from_value(serde_json::Value::Object(args))
            .map_err(|e| PromptLoomError::Serialization {
                message: format!("Invalid parameters: {}", e),
            })?;
        tracing::info!("system_control {}", params.action);

        match params.action.as_str() {
            "activate_methodology" => {
                let id = params.methodology.ok_or_else(|| PromptLoomError::Validation {
                    message: "methodology is required".to_string(),
                })?;
                let snapshot = self.engine.registries.snapshot();
                if snapshot.get_methodology(&id).is_none() {
                    return Err(PromptLoomError::Validation {
                        message: format!("unknown methodology '{}'", id),
                    });
                }
                self.engine
                    .overrides
                    .set_active_methodology(Some(id.clone()));
                Ok(CallToolResult::structured(
                    json!({ "active": id.to_ascii_lowercase() }),
                ))
            }
            "deactivate_methodology" => {
                self.engine.overrides.set_active_methodology(None);
                Ok(CallToolResult::structured(json!({ "active": null })))
            }
            "set_injection_override" => {
                let injection = Self::injection_of(&params)?;
                let enabled = params.enabled.ok_or_else(|| PromptLoomError::Validation {
                    message: "enabled is required".to_string(),
                })?;
                let frequency = params
                    .frequency
                    .as_deref()
                    .map(|f| {
                        f.parse::<Frequency>()
                            .map_err(|message| PromptLoomError::Validation { message })
                    })
                    .transpose()?;
                let scope = Self::scope_of(&params)?;
                let expires_at = params
                    .ttl_seconds
                    .map(|ttl| chrono::Utc::now() + chrono::Duration::seconds(ttl as i64));
                self.engine.overrides.set_injection(InjectionOverride {
                    scope,
                    injection: injection.to_string(),
                    enabled,
                    frequency,
                    expires_at,
                });
                Ok(CallToolResult::structured(json!({ "override": "set" })))
            }
            "clear_injection_override" => {
                let scope = Self::scope_of(&params)?;
                let cleared = self
                    .engine
                    .overrides
                    .clear_injection(&scope, params.injection.as_deref());
                Ok(CallToolResult::structured(json!({ "cleared": cleared })))
            }
            "reload" => {
                self.reload.request_reload();
                Ok(CallToolResult::structured(json!({ "reload": "requested" })))
            }
            other => Err(PromptLoomError::Validation {
                message: format!("unknown action '{}'", other),
            }),
        }
    }

    fn injection_of(params: &SystemControlParams) -> Result<&str> {
        match params.injection.as_deref() {
            Some(i @ ("system-prompt" | "gate-guidance" | "style-guidance")) => Ok(i),
            Some(other) => Err(PromptLoomError::Validation {
                message: format!("unknown injection type '{}'", other),
            }),
            None => Err(PromptLoomError::Validation {
                message: "injection is required".to_string(),
            }),
        }
    }

    fn scope_of(params: &SystemControlParams) -> Result<OverrideScope> {
        match params.scope.as_deref().unwrap_or("global") {
            "global" => Ok(OverrideScope::Global),
            "chain" => {
                let chain_id = params.chain_id.clone().ok_or_else(|| {
                    PromptLoomError::Validation {
                        message: "chain_id is required for chain scope".to_string(),
                    }
                })?;
                Ok(OverrideScope::Chain(chain_id))
            }
            "session" => {
                let chain_id = params.chain_id.clone().ok_or_else(|| {
                    PromptLoomError::Validation {
                        message: "chain_id is required for session scope".to_string(),
                    }
                })?;
                Ok(OverrideScope::Session(chain_id))
            }
            other => Err(PromptLoomError::Validation {
                message: format!("unknown scope '{}'", other),
            }),
        }
    }
}
