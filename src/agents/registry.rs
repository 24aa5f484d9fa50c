//! Global executor registry.
//!
//! Module-scoped mutable state with explicit registration; built-in
//! profiles are loaded lazily through [`load_profiles`]. `reset` exists for
//! tests only.

use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use super::{AgentConfig, AgentExecutor, ClaudeExecutor, CopilotExecutor, GeminiExecutor};

static REGISTRY: Lazy<RwLock<HashMap<String, Arc<dyn AgentExecutor>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Register an executor under its adapter name. Replaces any previous
/// registration for the same name.
pub fn register(executor: Arc<dyn AgentExecutor>) {
    let name = executor.adapter().name().to_string();
    tracing::debug!("Registering agent executor: {name}");
    REGISTRY.write().unwrap().insert(name, executor);
}

/// Look up an executor by agent name.
pub fn get_executor(name: &str) -> Option<Arc<dyn AgentExecutor>> {
    REGISTRY.read().unwrap().get(name).cloned()
}

/// Names of every registered executor.
pub fn registered_agents() -> Vec<String> {
    let mut names: Vec<String> = REGISTRY.read().unwrap().keys().cloned().collect();
    names.sort();
    names
}

/// Register the built-in agent profiles with default configs. Idempotent:
/// existing registrations are kept.
pub fn load_profiles() {
    let mut registry = REGISTRY.write().unwrap();
    registry
        .entry("claude".to_string())
        .or_insert_with(|| Arc::new(ClaudeExecutor::new(AgentConfig::default())));
    registry
        .entry("gemini".to_string())
        .or_insert_with(|| Arc::new(GeminiExecutor::new(AgentConfig::default())));
    registry
        .entry("copilot".to_string())
        .or_insert_with(|| Arc::new(CopilotExecutor::new(AgentConfig::default())));
}

/// Clear every registration. Test-only.
pub fn reset() {
    REGISTRY.write().unwrap().clear();
}
