use serde_json::{Map, Value, json};
use std::sync::Arc;

pub fn prompt_engine_schema() -> Arc<Map<String, Value>> {
    let schema = json!({
        "type": "object",
        "properties": {
            "command": {"type": "string", "description": "Symbolic command, e.g. >>summarize :: 'under 200 words'"},
            "chain_id": {"type": "string", "description": "Resume an existing chain session"},
            "user_response": {"type": "string", "description": "Model output or user action for the current step"},
            "gate_verdict": {"type": "string", "description": "GATE_REVIEW: PASS|FAIL - reason"},
            "force_restart": {"type": "boolean", "default": false},
            "execution_mode": {"type": "string", "enum": ["auto", "single", "chain"], "default": "auto"},
            "gates": {"type": "array", "items": {"type": "string"}},
            "temporary_gates": {"type": "array", "items": {"type": "object"}},
            "gate_scope": {"type": "string", "enum": ["execution", "session", "chain", "step"], "default": "execution"},
            "custom_checks": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {"description": {"type": "string"}},
                    "required": ["description"]
                }
            },
            "framework_selection": {"type": "string"}
        }
    });
    Arc::new(schema.as_object().cloned().unwrap_or_else(Map::new))
}

pub fn prompt_manager_schema() -> Arc<Map<String, Value>> {
    let schema = json!({
        "type": "object",
        "properties": {
            "action": {"type": "string", "enum": ["list", "read", "create", "update", "delete", "switch", "inspect", "metrics"]},
            "kind": {"type": "string", "enum": ["prompt", "gate", "methodology", "session"]},
            "id": {"type": "string"},
            "definition": {"type": "object", "description": "Resource descriptor for create/update"}
        },
        "required": ["action"]
    });
    Arc::new(schema.as_object().cloned().unwrap_or_else(Map::new))
}

pub fn system_control_schema() -> Arc<Map<String, Value>> {
    let schema = json!({
        "type": "object",
        "properties": {
            "action": {"type": "string", "enum": [
                "activate_methodology", "deactivate_methodology",
                "set_injection_override", "clear_injection_override", "reload"
            ]},
            "methodology": {"type": "string"},
            "injection": {"type": "string", "enum": ["system-prompt", "gate-guidance", "style-guidance"]},
            "enabled": {"type": "boolean"},
            "frequency": {"type": "string", "description": "always | first-only | every:k | never"},
            "scope": {"type": "string", "enum": ["global", "chain", "session"], "default": "global"},
            "chain_id": {"type": "string"},
            "ttl_seconds": {"type": ["integer", "number"]}
        },
        "required": ["action"]
    });
    Arc::new(schema.as_object().cloned().unwrap_or_else(Map::new))
}
