//! Layered settings: an optional `triad.toml` supplies defaults, the
//! environment contract overrides it. Settings are snapshotted at job
//! creation; later environment changes never affect a running job.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::adapter::AgentKind;
use crate::{Result, TriadError};

// Recognized environment keys.
pub const ENV_ANTHROPIC_CRED: &str = "ANTHROPIC_CRED";
pub const ENV_GEMINI_CRED: &str = "GEMINI_CRED";
pub const ENV_OPENAI_CRED: &str = "OPENAI_CRED";
pub const ENV_CLAUDE_MODEL: &str = "CLAUDE_MODEL";
pub const ENV_GEMINI_MODEL: &str = "GEMINI_MODEL";
pub const ENV_OPENAI_MODEL: &str = "OPENAI_MODEL";
pub const ENV_INTEGRATION_MODEL: &str = "INTEGRATION_MODEL";
pub const ENV_MAX_PARALLEL_AGENTS: &str = "MAX_PARALLEL_AGENTS";
pub const ENV_AGENT_TIMEOUT_MINUTES: &str = "AGENT_TIMEOUT_MINUTES";
pub const ENV_WORKSPACE_SIZE_LIMIT_GB: &str = "WORKSPACE_SIZE_LIMIT_GB";

/// Credentials read from the environment at job creation time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub anthropic: Option<String>,
    pub gemini: Option<String>,
    pub openai: Option<String>,
}

impl Credentials {
    /// The credential an agent kind requires, if configured.
    pub fn for_kind(&self, kind: AgentKind) -> Option<&str> {
        match kind {
            AgentKind::Claude => self.anthropic.as_deref(),
            AgentKind::Gemini => self.gemini.as_deref(),
            AgentKind::Codex => self.openai.as_deref(),
        }
    }
}

/// Default model identifiers, overridable per job request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelDefaults {
    pub claude: Option<String>,
    pub gemini: Option<String>,
    pub openai: Option<String>,
    pub integration: Option<String>,
}

impl ModelDefaults {
    pub fn for_kind(&self, kind: AgentKind) -> Option<&str> {
        match kind {
            AgentKind::Claude => self.claude.as_deref(),
            AgentKind::Gemini => self.gemini.as_deref(),
            AgentKind::Codex => self.openai.as_deref(),
        }
    }
}

/// Resolved engine settings, valid for the lifetime of one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Directory under which per-job workspace trees are created.
    pub workspace_root: PathBuf,
    /// Global cap on concurrently running agent processes.
    pub max_parallel_agents: usize,
    /// Wall-clock budget per agent process.
    pub agent_timeout: Duration,
    /// Grace interval between the polite termination signal and the kill.
    pub grace_period: Duration,
    /// Output lines longer than this are truncated with a warning.
    pub max_line_bytes: usize,
    /// Bounded per-subscriber event backlog.
    pub event_backlog: usize,
    /// Maximum launch attempts per agent for transient failures.
    pub launch_attempts: u32,
    /// Workspace materialization quota, if any.
    pub workspace_size_limit_bytes: Option<u64>,
    /// Which command family the integrator runs as.
    pub integrator_kind: AgentKind,
    pub credentials: Credentials,
    pub models: ModelDefaults,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            workspace_root: std::env::temp_dir().join("triad"),
            max_parallel_agents: 5,
            agent_timeout: Duration::from_secs(30 * 60),
            grace_period: Duration::from_secs(5),
            max_line_bytes: 16 * 1024,
            event_backlog: 1024,
            launch_attempts: 3,
            workspace_size_limit_bytes: None,
            integrator_kind: AgentKind::Claude,
            credentials: Credentials::default(),
            models: ModelDefaults::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// File layer
// ---------------------------------------------------------------------------

/// On-disk configuration (`triad.toml`). Every field optional; the
/// environment contract wins over this file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct FileConfig {
    pub workspace_root: Option<PathBuf>,
    pub max_parallel_agents: Option<usize>,
    pub agent_timeout_minutes: Option<u64>,
    pub grace_period_seconds: Option<u64>,
    pub max_line_bytes: Option<usize>,
    pub event_backlog: Option<usize>,
    pub launch_attempts: Option<u32>,
    pub workspace_size_limit_gb: Option<u64>,
    pub integrator_kind: Option<AgentKind>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| TriadError::Config(format!("failed to read {}: {e}", path.display())))?;
        toml::from_str(&contents)
            .map_err(|e| TriadError::Config(format!("failed to parse {}: {e}", path.display())))
    }
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

impl Settings {
    /// Load `./triad.toml` if present, then overlay the process environment.
    pub fn load() -> Result<Self> {
        let path = PathBuf::from("triad.toml");
        let file = if path.exists() {
            match FileConfig::load(&path) {
                Ok(cfg) => Some(cfg),
                Err(e) => {
                    warn!(%e, "failed to load triad.toml, falling back to defaults");
                    None
                }
            }
        } else {
            None
        };
        Self::from_sources(file, std::env::vars())
    }

    /// Build settings from an optional file layer plus environment pairs.
    ///
    /// Separated from [`Settings::load`] so tests can pass a fixed
    /// environment instead of mutating process globals.
    pub fn from_sources(
        file: Option<FileConfig>,
        env: impl IntoIterator<Item = (String, String)>,
    ) -> Result<Self> {
        let mut settings = Self::default();

        if let Some(file) = file {
            if let Some(root) = file.workspace_root {
                settings.workspace_root = root;
            }
            if let Some(n) = file.max_parallel_agents {
                settings.max_parallel_agents = n;
            }
            if let Some(mins) = file.agent_timeout_minutes {
                settings.agent_timeout = Duration::from_secs(mins * 60);
            }
            if let Some(secs) = file.grace_period_seconds {
                settings.grace_period = Duration::from_secs(secs);
            }
            if let Some(n) = file.max_line_bytes {
                settings.max_line_bytes = n;
            }
            if let Some(n) = file.event_backlog {
                settings.event_backlog = n;
            }
            if let Some(n) = file.launch_attempts {
                settings.launch_attempts = n;
            }
            if let Some(gb) = file.workspace_size_limit_gb {
                settings.workspace_size_limit_bytes = Some(gb * 1024 * 1024 * 1024);
            }
            if let Some(kind) = file.integrator_kind {
                settings.integrator_kind = kind;
            }
        }

        for (key, value) in env {
            if value.is_empty() {
                continue;
            }
            match key.as_str() {
                ENV_ANTHROPIC_CRED => settings.credentials.anthropic = Some(value),
                ENV_GEMINI_CRED => settings.credentials.gemini = Some(value),
                ENV_OPENAI_CRED => settings.credentials.openai = Some(value),
                ENV_CLAUDE_MODEL => settings.models.claude = Some(value),
                ENV_GEMINI_MODEL => settings.models.gemini = Some(value),
                ENV_OPENAI_MODEL => settings.models.openai = Some(value),
                ENV_INTEGRATION_MODEL => settings.models.integration = Some(value),
                ENV_MAX_PARALLEL_AGENTS => {
                    settings.max_parallel_agents = parse_env(&key, &value)?;
                }
                ENV_AGENT_TIMEOUT_MINUTES => {
                    let mins: u64 = parse_env(&key, &value)?;
                    settings.agent_timeout = Duration::from_secs(mins * 60);
                }
                ENV_WORKSPACE_SIZE_LIMIT_GB => {
                    let gb: u64 = parse_env(&key, &value)?;
                    settings.workspace_size_limit_bytes = Some(gb * 1024 * 1024 * 1024);
                }
                _ => {}
            }
        }

        settings.validate()?;
        Ok(settings)
    }

    /// Validate the settings and return actionable error messages.
    pub fn validate(&self) -> Result<()> {
        if self.max_parallel_agents == 0 {
            return Err(TriadError::Config(
                "max_parallel_agents must be > 0".into(),
            ));
        }
        if self.agent_timeout.is_zero() {
            return Err(TriadError::Config("agent timeout must be > 0".into()));
        }
        if self.max_line_bytes == 0 {
            return Err(TriadError::Config("max_line_bytes must be > 0".into()));
        }
        if self.event_backlog == 0 {
            return Err(TriadError::Config("event_backlog must be > 0".into()));
        }
        if self.launch_attempts == 0 {
            return Err(TriadError::Config("launch_attempts must be > 0".into()));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| TriadError::Config(format!("{key} has invalid value '{value}'")))
}
