//! Server module containing the PromptLoomServer implementation

use crate::config::Config;
use crate::decisions::RuntimeOverrides;
use crate::error::Result;
use crate::pipeline::Engine;
use crate::registry::{self, reload::ReloadRequester, RegistryHandle};
use crate::sessions::{SessionManager, SessionStore};
use crate::surface::{self, PipelineMetrics, ResourceRef, SurfaceEvents};
use rmcp::{
    ErrorData as McpError,
    handler::server::ServerHandler,
    model::{
        AnnotateAble, CallToolRequestParam, CallToolResult, Implementation,
        InitializeRequestParam, InitializeResult, ListResourcesResult, ListToolsResult,
        PaginatedRequestParam, ProtocolVersion, RawResource, ReadResourceRequestParam,
        ReadResourceResult, ResourceContents, ResourcesCapability, ServerCapabilities,
        ServerInfo, Tool, ToolsCapability,
    },
    service::{RequestContext, RoleServer},
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Main PromptLoom server implementation
#[derive(Clone)]
pub struct PromptLoomServer {
    pub engine: Engine,
    pub events: SurfaceEvents,
    pub reload: ReloadRequester,
    pub shutdown: CancellationToken,
}

impl PromptLoomServer {
    /// Create a new server instance: load registries, start the hot-reload
    /// coordinator and the session sweeper.
    pub async fn new(config: Config) -> Result<Self> {
        let config = Arc::new(config);
        info!(
            "loading resource trees from {:?}",
            config.resources.prompts_dir.parent()
        );
        let registries = RegistryHandle::new(registry::load_snapshot(&config.resources));
        let events = SurfaceEvents::new();
        let store = SessionStore::new(&config.resources.sessions_dir);
        let sessions = SessionManager::new(
            store,
            events.clone(),
            Duration::from_secs(config.sessions.idle_expiry_seconds),
        );
        let overrides = RuntimeOverrides::new();
        if let Some(active) = &config.frameworks.active {
            overrides.set_active_methodology(Some(active.clone()));
        }
        let metrics = PipelineMetrics::shared();
        let shutdown = CancellationToken::new();

        let reload = registry::reload::spawn(
            &config,
            registries.clone(),
            events.clone(),
            shutdown.clone(),
        );
        sessions.spawn_sweeper(config.sweep_interval(), shutdown.clone());

        let engine = Engine {
            config,
            registries,
            sessions,
            overrides,
            metrics,
        };
        Ok(Self {
            engine,
            events,
            reload,
            shutdown,
        })
    }

    /// Rebuild the registry snapshot synchronously (used by resource CRUD so
    /// the write-back is immediately visible) and notify listeners.
    pub fn rebuild_registries(&self) {
        let snapshot = registry::load_snapshot(&self.engine.config.resources);
        self.engine.registries.install(snapshot);
        self.engine.metrics.record_reload();
        self.events.publish(crate::surface::SurfaceEvent::RegistryChanged);
    }

    async fn resource_payload(&self, reference: ResourceRef) -> Result<String> {
        let snapshot = self.engine.registries.snapshot();
        let payload = match reference {
            ResourceRef::PromptList => surface::render_prompt_list(&snapshot),
            ResourceRef::Prompt(id) => {
                let prompt = snapshot.get_prompt(&id).ok_or_else(|| {
                    crate::error::PromptLoomError::UnknownPrompt { id: id.clone() }
                })?;
                serde_json::to_string_pretty(prompt.as_ref())?
            }
            ResourceRef::PromptTemplate(id) => {
                let prompt = snapshot.get_prompt(&id).ok_or_else(|| {
                    crate::error::PromptLoomError::UnknownPrompt { id: id.clone() }
                })?;
                prompt.template.clone()
            }
            ResourceRef::GateList => surface::render_gate_list(&snapshot),
            ResourceRef::Gate(id) => {
                let gate = snapshot.get_gate(&id).ok_or_else(|| {
                    crate::error::PromptLoomError::Validation {
                        message: format!("unknown gate '{}'", id),
                    }
                })?;
                serde_json::to_string_pretty(gate.as_ref())?
            }
            ResourceRef::GateGuidance(id) => {
                let gate = snapshot.get_gate(&id).ok_or_else(|| {
                    crate::error::PromptLoomError::Validation {
                        message: format!("unknown gate '{}'", id),
                    }
                })?;
                gate.guidance.clone().unwrap_or_default()
            }
            ResourceRef::MethodologyList => surface::render_methodology_list(
                &snapshot,
                self.engine.overrides.active_methodology().as_deref(),
            ),
            ResourceRef::Methodology(id) => {
                let methodology = snapshot.get_methodology(&id).ok_or_else(|| {
                    crate::error::PromptLoomError::Validation {
                        message: format!("unknown methodology '{}'", id),
                    }
                })?;
                serde_json::to_string_pretty(methodology.as_ref())?
            }
            ResourceRef::MethodologySystemPrompt(id) => {
                let methodology = snapshot.get_methodology(&id).ok_or_else(|| {
                    crate::error::PromptLoomError::Validation {
                        message: format!("unknown methodology '{}'", id),
                    }
                })?;
                methodology.system_prompt.clone()
            }
            ResourceRef::SessionList => {
                let summaries = self.engine.sessions.summaries().await?;
                surface::render_session_list(&summaries)
            }
            ResourceRef::Session(chain_id) => {
                let handle = self.engine.sessions.get(&chain_id).await?.ok_or_else(|| {
                    crate::error::PromptLoomError::Session {
                        message: format!("unknown chain id '{}'", chain_id),
                    }
                })?;
                let session = handle.lock().await;
                serde_json::to_string_pretty(&surface::render_session(&session))?
            }
            ResourceRef::MetricsPipeline => {
                serde_json::to_string_pretty(&self.engine.metrics.to_json())?
            }
        };
        Ok(payload)
    }
}

impl ServerHandler for PromptLoomServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::LATEST,
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability {
                    list_changed: Some(false),
                }),
                resources: Some(ResourcesCapability {
                    subscribe: None,
                    list_changed: Some(true),
                }),
                ..Default::default()
            },
            server_info: Implementation {
                name: "prompt-loom".to_string(),
                title: None,
                version: "0.1.0".to_string(),
                icons: None,
                website_url: None,
            },
            ..Default::default()
        }
    }

    async fn initialize(
        &self,
        request: InitializeRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> std::result::Result<InitializeResult, McpError> {
        let mut info = self.get_info();
        info.protocol_version = request.protocol_version.clone();
        Ok(info)
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> std::result::Result<ListToolsResult, McpError> {
        info!("tools/list requested");

        let tools = vec![
            Tool {
                name: "prompt_engine".into(),
                title: None,
                description: Some(
                    "Execute a symbolic prompt command or resume a chain session".into(),
                ),
                input_schema: crate::schemas::prompt_engine_schema(),
                annotations: None,
                output_schema: None,
                icons: None,
                meta: None,
            },
            Tool {
                name: "prompt_manager".into(),
                title: None,
                description: Some(
                    "List, read, create, update, and delete prompts, gates, and methodologies"
                        .into(),
                ),
                input_schema: crate::schemas::prompt_manager_schema(),
                annotations: None,
                output_schema: None,
                icons: None,
                meta: None,
            },
            Tool {
                name: "system_control".into(),
                title: None,
                description: Some(
                    "Activate methodologies, manage injection overrides, request reloads".into(),
                ),
                input_schema: crate::schemas::system_control_schema(),
                annotations: None,
                output_schema: None,
                icons: None,
                meta: None,
            },
        ];

        Ok(ListToolsResult {
            tools,
            ..Default::default()
        })
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> std::result::Result<CallToolResult, McpError> {
        match request.name.as_ref() {
            "prompt_engine" => self.handle_prompt_engine(request).await.map_err(|e| e.into()),
            "prompt_manager" => self
                .handle_prompt_manager(request)
                .await
                .map_err(|e| e.into()),
            "system_control" => self
                .handle_system_control(request)
                .await
                .map_err(|e| e.into()),
            _ => Err(McpError {
                code: rmcp::model::ErrorCode::METHOD_NOT_FOUND,
                message: format!("Unknown tool: {}", request.name).into(),
                data: None,
            }),
        }
    }

    async fn list_resources(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> std::result::Result<ListResourcesResult, McpError> {
        let mut resources = vec![
            RawResource::new("resource://prompt/", "Prompt index").no_annotation(),
            RawResource::new("resource://gate/", "Gate index").no_annotation(),
            RawResource::new("resource://methodology/", "Methodology index").no_annotation(),
            RawResource::new("resource://session/", "Active sessions").no_annotation(),
            RawResource::new("resource://metrics/pipeline", "Pipeline metrics").no_annotation(),
        ];
        let snapshot = self.engine.registries.snapshot();
        for prompt in snapshot.prompts() {
            resources.push(
                RawResource::new(
                    format!("resource://prompt/{}", prompt.id),
                    prompt.name.clone(),
                )
                .no_annotation(),
            );
        }
        for gate in snapshot.gates() {
            resources.push(
                RawResource::new(format!("resource://gate/{}", gate.id), gate.name.clone())
                    .no_annotation(),
            );
        }
        for methodology in snapshot.methodologies() {
            resources.push(
                RawResource::new(
                    format!("resource://methodology/{}", methodology.id),
                    methodology.name.clone(),
                )
                .no_annotation(),
            );
        }
        Ok(ListResourcesResult {
            resources,
            ..Default::default()
        })
    }

    async fn read_resource(
        &self,
        request: ReadResourceRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> std::result::Result<ReadResourceResult, McpError> {
        let reference = surface::parse_resource_uri(&request.uri).ok_or_else(|| McpError {
            code: rmcp::model::ErrorCode::INVALID_PARAMS,
            message: format!("Unknown resource uri: {}", request.uri).into(),
            data: None,
        })?;
        let payload = self
            .resource_payload(reference)
            .await
            .map_err(rmcp::ErrorData::from)?;
        Ok(ReadResourceResult {
            contents: vec![ResourceContents::TextResourceContents {
                uri: request.uri,
                mime_type: Some("text/plain".to_string()),
                text: payload,
                meta: None,
            }],
        })
    }
}
