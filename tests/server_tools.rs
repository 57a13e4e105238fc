//! Tool-surface tests: CRUD through prompt_manager, methodology switching,
//! injection overrides, and the metrics read, exercised directly against the
//! server handlers.

use prompt_loom::config::{Config, ResourcePaths};
use prompt_loom::server::PromptLoomServer;
use rmcp::model::CallToolRequestParam;
use serde_json::json;
use tempfile::TempDir;

async fn server(dir: &TempDir) -> PromptLoomServer {
    let mut config = Config::default();
    config.resources = ResourcePaths {
        prompts_dir: dir.path().join("prompts"),
        gates_dir: dir.path().join("gates"),
        methodologies_dir: dir.path().join("methodologies"),
        sessions_dir: dir.path().join("sessions"),
    };
    config.hot_reload.debounce_ms = 50;
    PromptLoomServer::new(config).await.unwrap()
}

fn call(name: &str, args: serde_json::Value) -> CallToolRequestParam {
    CallToolRequestParam {
        name: name.to_string().into(),
        arguments: args.as_object().cloned(),
    }
}

#[tokio::test]
async fn prompt_crud_round_trips_through_the_registry() {
    let dir = TempDir::new().unwrap();
    let server = server(&dir).await;

    let created = server
        .handle_prompt_manager(call(
            "prompt_manager",
            json!({
                "action": "create",
                "kind": "prompt",
                "definition": {
                    "id": "triage",
                    "name": "Triage",
                    "category": "support",
                    "template": "Triage this ticket: {{ticket}}",
                    "arguments": [{"name": "ticket", "required": true}]
                }
            }),
        ))
        .await;
    assert!(created.is_ok());
    assert!(server
        .engine
        .registries
        .snapshot()
        .get_prompt("triage")
        .is_some());

    // Update replaces the stored definition
    server
        .handle_prompt_manager(call(
            "prompt_manager",
            json!({
                "action": "update",
                "kind": "prompt",
                "definition": {
                    "id": "triage",
                    "name": "Triage v2",
                    "category": "support",
                    "template": "Triage carefully: {{ticket}}",
                    "arguments": [{"name": "ticket", "required": true}]
                }
            }),
        ))
        .await
        .unwrap();
    let snapshot = server.engine.registries.snapshot();
    assert!(snapshot
        .get_prompt("triage")
        .unwrap()
        .template
        .contains("carefully"));

    server
        .handle_prompt_manager(call(
            "prompt_manager",
            json!({ "action": "delete", "kind": "prompt", "id": "triage" }),
        ))
        .await
        .unwrap();
    assert!(server
        .engine
        .registries
        .snapshot()
        .get_prompt("triage")
        .is_none());
}

#[tokio::test]
async fn partial_methodology_creation_is_rejected() {
    let dir = TempDir::new().unwrap();
    let server = server(&dir).await;

    let result = server
        .handle_prompt_manager(call(
            "prompt_manager",
            json!({
                "action": "create",
                "kind": "methodology",
                "definition": {
                    "id": "halfbaked",
                    "name": "Half baked",
                    "system_prompt": "Think hard.",
                    "phases": [],
                    "gates": []
                }
            }),
        ))
        .await;
    assert!(result.is_err(), "incomplete methodologies must be rejected");

    let complete = server
        .handle_prompt_manager(call(
            "prompt_manager",
            json!({
                "action": "create",
                "kind": "methodology",
                "definition": {
                    "id": "checklist",
                    "name": "Checklist",
                    "system_prompt": "Walk an explicit checklist before answering.",
                    "phases": ["collect", "check", "answer"],
                    "gates": ["all-items-checked"]
                }
            }),
        ))
        .await;
    assert!(complete.is_ok());
    assert!(server
        .engine
        .registries
        .snapshot()
        .get_methodology("checklist")
        .is_some());
}

#[tokio::test]
async fn switch_is_only_valid_for_methodologies() {
    let dir = TempDir::new().unwrap();
    let server = server(&dir).await;

    let bad = server
        .handle_prompt_manager(call(
            "prompt_manager",
            json!({ "action": "switch", "kind": "prompt", "id": "whatever" }),
        ))
        .await;
    assert!(bad.is_err());

    // Built-in methodologies are switch targets
    server
        .handle_prompt_manager(call(
            "prompt_manager",
            json!({ "action": "switch", "kind": "methodology", "id": "CAGEERF" }),
        ))
        .await
        .unwrap();
    assert_eq!(
        server.engine.overrides.active_methodology().as_deref(),
        Some("cageerf")
    );
}

#[tokio::test]
async fn system_control_manages_overrides_and_activation() {
    let dir = TempDir::new().unwrap();
    let server = server(&dir).await;

    server
        .handle_system_control(call(
            "system_control",
            json!({ "action": "activate_methodology", "methodology": "react" }),
        ))
        .await
        .unwrap();
    assert_eq!(
        server.engine.overrides.active_methodology().as_deref(),
        Some("react")
    );

    server
        .handle_system_control(call(
            "system_control",
            json!({
                "action": "set_injection_override",
                "injection": "system-prompt",
                "enabled": false,
                "scope": "global",
                "frequency": "never"
            }),
        ))
        .await
        .unwrap();
    let looked_up = server.engine.overrides.lookup_injection(
        None,
        "system-prompt",
        chrono::Utc::now(),
    );
    assert_eq!(looked_up.map(|(enabled, _)| enabled), Some(false));

    server
        .handle_system_control(call(
            "system_control",
            json!({
                "action": "clear_injection_override",
                "injection": "system-prompt",
                "scope": "global"
            }),
        ))
        .await
        .unwrap();
    assert!(server
        .engine
        .overrides
        .lookup_injection(None, "system-prompt", chrono::Utc::now())
        .is_none());

    // Unknown methodology activation is rejected
    let unknown = server
        .handle_system_control(call(
            "system_control",
            json!({ "action": "activate_methodology", "methodology": "nonexistent" }),
        ))
        .await;
    assert!(unknown.is_err());

    server
        .handle_system_control(call(
            "system_control",
            json!({ "action": "deactivate_methodology" }),
        ))
        .await
        .unwrap();
    assert!(server.engine.overrides.active_methodology().is_none());
}

#[tokio::test]
async fn metrics_and_session_inspection_answer() {
    let dir = TempDir::new().unwrap();
    let server = server(&dir).await;

    let metrics = server
        .handle_prompt_manager(call("prompt_manager", json!({ "action": "metrics" })))
        .await;
    assert!(metrics.is_ok());

    let sessions = server
        .handle_prompt_manager(call(
            "prompt_manager",
            json!({ "action": "inspect", "kind": "session" }),
        ))
        .await;
    assert!(sessions.is_ok());

    let missing = server
        .handle_prompt_manager(call(
            "prompt_manager",
            json!({ "action": "inspect", "kind": "session", "id": "chain-missing" }),
        ))
        .await;
    assert!(missing.is_err());
}

#[tokio::test]
async fn gate_crud_writes_guidance_sidecar() {
    let dir = TempDir::new().unwrap();
    let server = server(&dir).await;

    server
        .handle_prompt_manager(call(
            "prompt_manager",
            json!({
                "action": "create",
                "kind": "gate",
                "definition": {
                    "id": "cite-sources",
                    "name": "Cite sources",
                    "type": "validation",
                    "severity": "high",
                    "criteria": ["every claim carries a citation"],
                    "guidance": "Prefer primary sources."
                }
            }),
        ))
        .await
        .unwrap();

    let snapshot = server.engine.registries.snapshot();
    let gate = snapshot.get_gate("cite-sources").unwrap();
    assert_eq!(gate.guidance.as_deref(), Some("Prefer primary sources."));
    assert!(dir
        .path()
        .join("gates")
        .join("cite-sources")
        .join("guidance.md")
        .exists());
}
