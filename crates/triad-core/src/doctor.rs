//! Environment probe: which agent CLIs are installed and runnable.

use std::path::PathBuf;
use std::process::Command;

use serde::{Deserialize, Serialize};

use crate::adapter::{resolve_binary, AgentKind};

/// Probe result for one agent CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProbe {
    pub kind: AgentKind,
    pub binary: Option<PathBuf>,
    pub version: Option<String>,
    pub available: bool,
}

/// Availability report across all supported agent kinds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeReport {
    pub agents: Vec<AgentProbe>,
}

impl ProbeReport {
    pub fn all_available(&self) -> bool {
        self.agents.iter().all(|a| a.available)
    }
}

/// Probe every agent kind. Never consulted on the job path when a command
/// override is present.
pub fn probe_all() -> ProbeReport {
    let agents = [AgentKind::Claude, AgentKind::Gemini, AgentKind::Codex]
        .into_iter()
        .map(probe_kind)
        .collect();
    ProbeReport { agents }
}

fn probe_kind(kind: AgentKind) -> AgentProbe {
    let binary = resolve_binary(None, &[kind.as_str()]);
    let version = binary.as_ref().and_then(|b| probe_version(b));
    AgentProbe {
        kind,
        available: binary.is_some(),
        binary,
        version,
    }
}

fn probe_version(binary: &PathBuf) -> Option<String> {
    let output = Command::new(binary).arg("--version").output().ok()?;
    crate::adapter::parse_version_string(&String::from_utf8_lossy(&output.stdout))
}
