//! prompt_manager tool handler: resource CRUD, methodology switching,
//! session inspection, and metrics reads.

use crate::error::{PromptLoomError, Result};
use crate::registry::{self, Gate, Methodology, Prompt};
use crate::server::PromptLoomServer;
use crate::surface;
use rmcp::model::{CallToolRequestParam, CallToolResult};
use serde_json::json;

#[derive(Debug, serde::Deserialize)]
pub struct ManagerParams {
    pub action: String,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub definition: Option<serde_json::Value>,
}

impl PromptLoomServer {
    /// Handle the prompt_manager tool call
    pub async fn handle_prompt_manager(
        &self,
        request: CallToolRequestParam,
    ) -> Result<CallToolResult> {
        let args = request.arguments.ok_or_else(|| PromptLoomError::Mcp {
            message: "Missing parameters".into(),
        })?;
        let params: ManagerParams = serde_json::from_value(serde_json::Value::Object(args))
            .map_err(|e| PromptLoomError::Serialization {
                message: format!("Invalid parameters: {}", e),
            })?;
        tracing::info!(
            "prompt_manager {} {:?} {:?}",
            params.action,
            params.kind,
            params.id
        );

        match params.action.as_str() {
            "list" => self.manager_list(&params),
            "read" => self.manager_read(&params).await,
            "create" | "update" => self.manager_upsert(&params),
            "delete" => self.manager_delete(&params),
            "switch" => self.manager_switch(&params),
            "inspect" => self.manager_inspect(&params).await,
            "metrics" => Ok(CallToolResult::structured(self.engine.metrics.to_json())),
            other => Err(PromptLoomError::Validation {
                message: format!("unknown action '{}'", other),
            }),
        }
    }

    fn kind_of(params: &ManagerParams) -> Result<&str> {
        params
            .kind
            .as_deref()
            .ok_or_else(|| PromptLoomError::Validation {
                message: "kind is required for this action".to_string(),
            })
    }

    fn id_of(params: &ManagerParams) -> Result<&str> {
        params.id.as_deref().ok_or_else(|| PromptLoomError::Validation {
            message: "id is required for this action".to_string(),
        })
    }

    fn manager_list(&self, params: &ManagerParams) -> Result<CallToolResult> {
        let snapshot = self.engine.registries.snapshot();
        let listing = match Self::kind_of(params)? {
            "prompt" => surface::render_prompt_list(&snapshot),
            "gate" => surface::render_gate_list(&snapshot),
            "methodology" => surface::render_methodology_list(
                &snapshot,
                self.engine.overrides.active_methodology().as_deref(),
            ),
            other => {
                return Err(PromptLoomError::Validation {
                    message: format!("cannot list kind '{}'", other),
                });
            }
        };
        Ok(CallToolResult::structured(json!({ "listing": listing })))
    }

    async fn manager_read(&self, params: &ManagerParams) -> Result<CallToolResult> {
        let snapshot = self.engine.registries.snapshot();
        let id = Self::id_of(params)?;
        let payload = match Self::kind_of(params)? {
            "prompt" => {
                let prompt = snapshot
                    .get_prompt(id)
                    .ok_or_else(|| PromptLoomError::UnknownPrompt { id: id.to_string() })?;
                serde_json::to_value(prompt.as_ref())?
            }
            "gate" => {
                let gate =
                    snapshot
                        .get_gate(id)
                        .ok_or_else(|| PromptLoomError::Validation {
                            message: format!("unknown gate '{}'", id),
                        })?;
                serde_json::to_value(gate.as_ref())?
            }
            "methodology" => {
                let methodology =
                    snapshot
                        .get_methodology(id)
                        .ok_or_else(|| PromptLoomError::Validation {
                            message: format!("unknown methodology '{}'", id),
                        })?;
                serde_json::to_value(methodology.as_ref())?
            }
            "session" => {
                let handle = self.engine.sessions.get(id).await?.ok_or_else(|| {
                    PromptLoomError::Session {
                        message: format!("unknown chain id '{}'", id),
                    }
                })?;
                let session = handle.lock().await;
                surface::render_session(&session)
            }
            other => {
                return Err(PromptLoomError::Validation {
                    message: format!("cannot read kind '{}'", other),
                });
            }
        };
        Ok(CallToolResult::structured(payload))
    }

    /// Create/update write the persisted form back to the resource tree and
    /// rebuild the registry, so the hot-reload path stays the single source
    /// of registry truth.
    fn manager_upsert(&self, params: &ManagerParams) -> Result<CallToolResult> {
        let definition = params
            .definition
            .clone()
            .ok_or_else(|| PromptLoomError::Validation {
                message: "definition is required for create/update".to_string(),
            })?;
        let paths = &self.engine.config.resources;
        if self.engine.config.versioning.enabled {
            // Version history itself is kept by an external sidecar
            tracing::debug!("versioning enabled; sidecar will pick up this write");
        }
        let written = match Self::kind_of(params)? {
            "prompt" => {
                let prompt: Prompt = serde_json::from_value(definition)?;
                prompt
                    .validate()
                    .map_err(|message| PromptLoomError::Validation { message })?;
                registry::write_prompt(paths, &prompt)?;
                prompt.id
            }
            "gate" => {
                let gate: Gate = serde_json::from_value(definition)?;
                gate.validate()
                    .map_err(|message| PromptLoomError::Validation { message })?;
                registry::write_gate(paths, &gate)?;
                gate.id
            }
            "methodology" => {
                let methodology: Methodology = serde_json::from_value(definition)?;
                // Partial methodologies are rejected outright
                methodology
                    .validate()
                    .map_err(|message| PromptLoomError::Validation { message })?;
                registry::write_methodology(paths, &methodology)?;
                methodology.id
            }
            other => {
                return Err(PromptLoomError::Validation {
                    message: format!("cannot write kind '{}'", other),
                });
            }
        };
        self.rebuild_registries();
        Ok(CallToolResult::structured(
            json!({ "written": written, "action": params.action }),
        ))
    }

    fn manager_delete(&self, params: &ManagerParams) -> Result<CallToolResult> {
        let id = Self::id_of(params)?;
        let paths = &self.engine.config.resources;
        let removed = match Self::kind_of(params)? {
            "prompt" => registry::remove_prompt(paths, id)?,
            "gate" => registry::remove_gate(paths, id)?,
            "methodology" => registry::remove_methodology(paths, id)?,
            other => {
                return Err(PromptLoomError::Validation {
                    message: format!("cannot delete kind '{}'", other),
                });
            }
        };
        if removed {
            self.rebuild_registries();
        }
        Ok(CallToolResult::structured(json!({ "removed": removed })))
    }

    /// Switch is only valid for methodologies
    fn manager_switch(&self, params: &ManagerParams) -> Result<CallToolResult> {
        match Self::kind_of(params)? {
            "methodology" => {}
            other => {
                return Err(PromptLoomError::Validation {
                    message: format!("switch applies to methodologies, not '{}'", other),
                });
            }
        }
        let id = Self::id_of(params)?;
        let snapshot = self.engine.registries.snapshot();
        if snapshot.get_methodology(id).is_none() {
            return Err(PromptLoomError::Validation {
                message: format!("unknown methodology '{}'", id),
            });
        }
        self.engine
            .overrides
            .set_active_methodology(Some(id.to_string()));
        Ok(CallToolResult::structured(
            json!({ "active": id.to_ascii_lowercase() }),
        ))
    }

    async fn manager_inspect(&self, params: &ManagerParams) -> Result<CallToolResult> {
        match params.kind.as_deref() {
            Some("session") | None => {}
            Some(other) => {
                return Err(PromptLoomError::Validation {
                    message: format!("inspect applies to sessions, not '{}'", other),
                });
            }
        }
        match &params.id {
            Some(chain_id) => {
                let handle = self.engine.sessions.get(chain_id).await?.ok_or_else(|| {
                    PromptLoomError::Session {
                        message: format!("unknown chain id '{}'", chain_id),
                    }
                })?;
                let session = handle.lock().await;
                Ok(CallToolResult::structured(surface::render_session(&session)))
            }
            None => {
                let summaries = self.engine.sessions.summaries().await?;
                Ok(CallToolResult::structured(json!({
                    "sessions": summaries,
                    "listing": surface::render_session_list(&summaries),
                })))
            }
        }
    }
}
