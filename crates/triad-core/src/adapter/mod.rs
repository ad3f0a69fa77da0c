//! Agent adapters: the only place that knows how each external CLI is
//! invoked. Everything else operates on the abstract agent instance.

pub mod claude;
pub mod codex;
pub mod gemini;
pub mod integrator;

pub use claude::ClaudeAdapter;
pub use codex::CodexAdapter;
pub use gemini::GeminiAdapter;
pub use integrator::{integration_objective, IntegratorAdapter, FINAL_REPORT, PROMPT_FILE};

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::event::AgentKey;
use crate::supervisor::AgentCommand;
use crate::Result;

/// Logical command family of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    Claude,
    Gemini,
    Codex,
}

impl AgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Claude => "claude",
            AgentKind::Gemini => "gemini",
            AgentKind::Codex => "codex",
        }
    }
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The command family bound to each primary slot. The integrator's family
/// comes from configuration instead.
pub fn primary_kind(key: AgentKey) -> Option<AgentKind> {
    match key {
        AgentKey::Primary1 => Some(AgentKind::Claude),
        AgentKey::Primary2 => Some(AgentKind::Gemini),
        AgentKey::Primary3 => Some(AgentKind::Codex),
        AgentKey::Integrator => None,
    }
}

/// Everything an adapter needs to produce a concrete command.
#[derive(Debug, Clone)]
pub struct PlanContext {
    pub objective: String,
    pub model: String,
    pub workspace: PathBuf,
    pub credential: Option<String>,
}

/// Best-effort progress inferred from one output line. Never gates
/// correctness; feeds `status` events only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressHint {
    pub label: String,
    pub percent: Option<u8>,
}

impl ProgressHint {
    pub fn render(&self) -> String {
        match self.percent {
            Some(p) => format!("{} ({p}%)", self.label),
            None => self.label.clone(),
        }
    }
}

/// Core trait every agent adapter implements.
pub trait AgentAdapter: Send + Sync {
    fn key(&self) -> &'static str;

    /// Materialize any per-workspace files the CLI expects before launch.
    fn prepare(&self, ctx: &PlanContext) -> Result<()> {
        let _ = ctx;
        Ok(())
    }

    /// Translate a plan context into a concrete command.
    fn plan(&self, ctx: &PlanContext) -> Result<AgentCommand>;

    /// Map an output line to a progress hint, when one is recognizable.
    fn infer_progress(&self, line: &str) -> Option<ProgressHint> {
        let _ = line;
        None
    }
}

/// Adapter for a primary agent of the given kind.
pub fn adapter_for(kind: AgentKind) -> Box<dyn AgentAdapter> {
    match kind {
        AgentKind::Claude => Box::new(ClaudeAdapter::new(None)),
        AgentKind::Gemini => Box::new(GeminiAdapter::new(None)),
        AgentKind::Codex => Box::new(CodexAdapter::new(None)),
    }
}

/// Adapter for the integrator slot, running as the given command family.
pub fn integrator_adapter(kind: AgentKind) -> Box<dyn AgentAdapter> {
    Box::new(IntegratorAdapter::new(adapter_for(kind)))
}

/// Resolve a binary by checking the configured path, then `$PATH`.
///
/// If a configured path is provided but doesn't exist, returns `None`
/// without falling back to PATH discovery (explicit config takes
/// precedence).
pub fn resolve_binary(configured: Option<&str>, candidates: &[&str]) -> Option<PathBuf> {
    if let Some(path) = configured {
        let p = PathBuf::from(path);
        return if p.exists() { Some(p) } else { None };
    }
    for name in candidates {
        if let Ok(p) = which::which(name) {
            return Some(p);
        }
    }
    None
}

/// Best-effort extraction of a semantic-ish version string from CLI output.
pub(crate) fn parse_version_string(text: &str) -> Option<String> {
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        for word in line.split_whitespace() {
            let w = word.strip_prefix('v').unwrap_or(word);
            if w.contains('.') && w.chars().next().is_some_and(|c| c.is_ascii_digit()) {
                return Some(w.to_string());
            }
        }
    }
    None
}
