//! prompt_engine tool handler: the primary execute operation

use crate::error::{PromptLoomError, Result};
use crate::pipeline::{self, context::ExecutionRequest};
use crate::server::PromptLoomServer;
use rmcp::model::{CallToolRequestParam, CallToolResult};
use serde_json::json;

/// Maximum command size in bytes
const MAX_COMMAND_SIZE: usize = 64 * 1024;

impl PromptLoomServer {
    /// Handle the prompt_engine tool call
    pub async fn handle_prompt_engine(
        &self,
        request: CallToolRequestParam,
    ) -> Result<CallToolResult> {
        let args = request.arguments.ok_or_else(|| PromptLoomError::Mcp {
            message: "Missing parameters".into(),
        })?;
        let params: ExecutionRequest = serde_json::from_value(serde_json::Value::Object(args))
            .map_err(|e| PromptLoomError::Serialization {
                message: format!("Invalid parameters: {}", e),
            })?;

        if let Some(command) = &params.command {
            if command.len() > MAX_COMMAND_SIZE {
                return Err(PromptLoomError::Validation {
                    message: format!(
                        "Command exceeds maximum size of {}KB",
                        MAX_COMMAND_SIZE / 1024
                    ),
                });
            }
            // Redact content at info level to avoid logging full user text
            tracing::info!("prompt_engine called (command_len={})", command.len());
        } else {
            tracing::info!(
                "prompt_engine resume (chain_id={:?})",
                params.chain_id.as_deref()
            );
        }

        // Dropped transports cancel the request at the next stage boundary
        let cancel = self.shutdown.child_token();
        let response = pipeline::execute(&self.engine, params, cancel).await?;

        let mut payload = match response.structured {
            serde_json::Value::Object(map) => map,
            other => {
                let mut map = serde_json::Map::new();
                map.insert("structured".to_string(), other);
                map
            }
        };
        payload.insert("message".to_string(), json!(response.message));
        payload.insert("isError".to_string(), json!(response.is_error));

        Ok(CallToolResult::structured(serde_json::Value::Object(
            payload,
        )))
    }
}
