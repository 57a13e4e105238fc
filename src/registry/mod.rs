//! Resource registries: in-memory indexes of prompts, gates, methodologies,
//! and styles, rebuilt from their backing trees and swapped atomically.
//!
//! Readers take an `Arc` snapshot and hold it for the duration of one request;
//! the hot-reload coordinator is the only writer.

pub mod gates;
pub mod methodologies;
pub mod prompts;
pub mod reload;
pub mod styles;

use crate::config::ResourcePaths;
use crate::error::{PromptLoomError, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

pub use gates::{EnforcementMode, Gate, GateType, Severity, VerificationSpec};
pub use methodologies::{builtin_methodologies, Methodology};
pub use prompts::{ChainStep, Prompt, PromptArgument};
pub use styles::{builtin_styles, Style};

/// A file that failed to parse during a load; the rest of the tree still loads
#[derive(Debug, Clone)]
pub struct LoadIssue {
    pub path: String,
    pub message: String,
}

/// Immutable view of all loaded resources
#[derive(Debug, Default)]
pub struct RegistrySnapshot {
    prompts: HashMap<String, Arc<Prompt>>,
    gates: HashMap<String, Arc<Gate>>,
    methodologies: HashMap<String, Arc<Methodology>>,
    styles: HashMap<String, Arc<Style>>,
    pub issues: Vec<LoadIssue>,
    pub loaded_at: Option<DateTime<Utc>>,
}

impl RegistrySnapshot {
    pub fn get_prompt(&self, id: &str) -> Option<Arc<Prompt>> {
        self.prompts.get(id).cloned()
    }

    /// Case-insensitive methodology lookup (operator ids arrive uppercased)
    pub fn get_methodology(&self, id: &str) -> Option<Arc<Methodology>> {
        self.methodologies.get(&id.to_ascii_lowercase()).cloned()
    }

    pub fn get_gate(&self, id: &str) -> Option<Arc<Gate>> {
        self.gates.get(id).cloned()
    }

    pub fn get_style(&self, id: &str) -> Option<Arc<Style>> {
        self.styles.get(&id.to_ascii_lowercase()).cloned()
    }

    pub fn prompts(&self) -> impl Iterator<Item = &Arc<Prompt>> {
        self.prompts.values()
    }

    pub fn gates(&self) -> impl Iterator<Item = &Arc<Gate>> {
        self.gates.values()
    }

    pub fn methodologies(&self) -> impl Iterator<Item = &Arc<Methodology>> {
        self.methodologies.values()
    }

    pub fn styles(&self) -> impl Iterator<Item = &Arc<Style>> {
        self.styles.values()
    }

    pub fn prompt_count(&self) -> usize {
        self.prompts.len()
    }

    pub fn gate_count(&self) -> usize {
        self.gates.len()
    }

    pub fn methodology_count(&self) -> usize {
        self.methodologies.len()
    }
}

/// Shared handle over the live snapshot; cheap to clone, atomic to swap
#[derive(Clone, Default)]
pub struct RegistryHandle {
    inner: Arc<RwLock<Arc<RegistrySnapshot>>>,
}

impl RegistryHandle {
    pub fn new(snapshot: RegistrySnapshot) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(snapshot))),
        }
    }

    /// Current snapshot; hold it for the duration of one request
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        Arc::clone(
            &self
                .inner
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        )
    }

    /// Replace the live snapshot. The new snapshot is fully built before this
    /// is called, so readers never observe a partial registry.
    pub fn install(&self, snapshot: RegistrySnapshot) {
        let mut guard = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Arc::new(snapshot);
    }
}

/// Build a full snapshot from the three resource trees. Per-file parse errors
/// are collected as issues and the offending file is skipped.
pub fn load_snapshot(paths: &ResourcePaths) -> RegistrySnapshot {
    let mut snapshot = RegistrySnapshot {
        loaded_at: Some(Utc::now()),
        ..Default::default()
    };

    load_prompts(&paths.prompts_dir, &mut snapshot);
    load_gates(&paths.gates_dir, &mut snapshot);
    load_methodologies(&paths.methodologies_dir, &mut snapshot);

    // Built-in methodologies back-fill an empty tree
    if snapshot.methodologies.is_empty() {
        for m in builtin_methodologies() {
            snapshot
                .methodologies
                .insert(m.id.to_ascii_lowercase(), Arc::new(m));
        }
    }
    for s in builtin_styles() {
        snapshot
            .styles
            .entry(s.id.to_ascii_lowercase())
            .or_insert_with(|| Arc::new(s));
    }

    tracing::info!(
        "registry loaded: {} prompts, {} gates, {} methodologies, {} issues",
        snapshot.prompts.len(),
        snapshot.gates.len(),
        snapshot.methodologies.len(),
        snapshot.issues.len()
    );
    snapshot
}

fn load_prompts(dir: &Path, snapshot: &mut RegistrySnapshot) {
    for path in toml_files(dir, snapshot) {
        match read_toml::<Prompt>(&path) {
            Ok(prompt) => match prompt.validate() {
                Ok(()) => {
                    snapshot
                        .prompts
                        .insert(prompt.id.clone(), Arc::new(prompt));
                }
                Err(message) => push_issue(snapshot, &path, message),
            },
            Err(message) => push_issue(snapshot, &path, message),
        }
    }
}

/// Gates live one-per-subdirectory: `<id>/gate.toml` plus optional `guidance.md`
fn load_gates(dir: &Path, snapshot: &mut RegistrySnapshot) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return,
    };
    for entry in entries.flatten() {
        let sub = entry.path();
        if !sub.is_dir() {
            continue;
        }
        let descriptor = sub.join("gate.toml");
        if !descriptor.exists() {
            continue;
        }
        match read_toml::<Gate>(&descriptor) {
            Ok(mut gate) => {
                let guidance_path = sub.join("guidance.md");
                if gate.guidance.is_none()
                    && let Ok(body) = std::fs::read_to_string(&guidance_path)
                    && !body.trim().is_empty()
                {
                    gate.guidance = Some(body);
                }
                match gate.validate() {
                    Ok(()) => {
                        snapshot.gates.insert(gate.id.clone(), Arc::new(gate));
                    }
                    Err(message) => push_issue(snapshot, &descriptor, message),
                }
            }
            Err(message) => push_issue(snapshot, &descriptor, message),
        }
    }
}

fn load_methodologies(dir: &Path, snapshot: &mut RegistrySnapshot) {
    for path in toml_files(dir, snapshot) {
        match read_toml::<Methodology>(&path) {
            Ok(methodology) => match methodology.validate() {
                Ok(()) => {
                    snapshot
                        .methodologies
                        .insert(methodology.id.to_ascii_lowercase(), Arc::new(methodology));
                }
                Err(message) => push_issue(snapshot, &path, message),
            },
            Err(message) => push_issue(snapshot, &path, message),
        }
    }
}

fn toml_files(dir: &Path, snapshot: &mut RegistrySnapshot) -> Vec<std::path::PathBuf> {
    let mut files = Vec::new();
    match std::fs::read_dir(dir) {
        Ok(entries) => {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().is_some_and(|e| e == "toml") {
                    files.push(path);
                }
            }
            files.sort();
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => push_issue(snapshot, dir, err.to_string()),
    }
    files
}

fn read_toml<T: serde::de::DeserializeOwned>(path: &Path) -> std::result::Result<T, String> {
    let content = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    toml::from_str(&content).map_err(|e| e.to_string())
}

fn push_issue(snapshot: &mut RegistrySnapshot, path: &Path, message: String) {
    tracing::warn!("resource load failed for {}: {}", path.display(), message);
    snapshot.issues.push(LoadIssue {
        path: path.display().to_string(),
        message,
    });
}

/// Persist a prompt descriptor back to its tree (create/update write-back)
pub fn write_prompt(paths: &ResourcePaths, prompt: &Prompt) -> Result<()> {
    std::fs::create_dir_all(&paths.prompts_dir)?;
    let body = toml::to_string_pretty(prompt).map_err(|e| PromptLoomError::Serialization {
        message: e.to_string(),
    })?;
    let path = paths.prompts_dir.join(format!("{}.toml", prompt.id));
    std::fs::write(path, body)?;
    Ok(())
}

pub fn remove_prompt(paths: &ResourcePaths, id: &str) -> Result<bool> {
    let path = paths.prompts_dir.join(format!("{}.toml", id));
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err.into()),
    }
}

/// Persist a gate descriptor (and guidance body, if any) back to its subdirectory
pub fn write_gate(paths: &ResourcePaths, gate: &Gate) -> Result<()> {
    let dir = paths.gates_dir.join(&gate.id);
    std::fs::create_dir_all(&dir)?;
    // Guidance goes to the sidecar file, not the descriptor
    let mut descriptor = gate.clone();
    let guidance = descriptor.guidance.take();
    let body = toml::to_string_pretty(&descriptor).map_err(|e| PromptLoomError::Serialization {
        message: e.to_string(),
    })?;
    std::fs::write(dir.join("gate.toml"), body)?;
    if let Some(guidance) = guidance {
        std::fs::write(dir.join("guidance.md"), guidance)?;
    }
    Ok(())
}

pub fn remove_gate(paths: &ResourcePaths, id: &str) -> Result<bool> {
    let dir = paths.gates_dir.join(id);
    match std::fs::remove_dir_all(dir) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err.into()),
    }
}

pub fn write_methodology(paths: &ResourcePaths, methodology: &Methodology) -> Result<()> {
    std::fs::create_dir_all(&paths.methodologies_dir)?;
    let body =
        toml::to_string_pretty(methodology).map_err(|e| PromptLoomError::Serialization {
            message: e.to_string(),
        })?;
    let path = paths
        .methodologies_dir
        .join(format!("{}.toml", methodology.id.to_ascii_lowercase()));
    std::fs::write(path, body)?;
    Ok(())
}

pub fn remove_methodology(paths: &ResourcePaths, id: &str) -> Result<bool> {
    let path = paths
        .methodologies_dir
        .join(format!("{}.toml", id.to_ascii_lowercase()));
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err.into()),
    }
}
