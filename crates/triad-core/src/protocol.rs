//! Wire-facing records for the job subscription protocol.
//!
//! The transport framing itself lives outside this crate; these types are
//! the payloads it carries. A client sends one [`StartRequest`] after
//! binding to a job, then receives a stream of [`EventRecord`]s ending
//! with exactly one `complete` record.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::adapter::AgentKind;
use crate::event::{AgentKey, EventKind, ProgressEvent};
use crate::supervisor::TerminalState;

/// Wire sentinel for job-scoped events.
pub const JOB_SCOPE: &str = "job";

// ---------------------------------------------------------------------------
// Client -> server
// ---------------------------------------------------------------------------

/// First message on a job subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartRequest {
    /// Remote repository URL or local directory path.
    pub source: String,
    pub objective: String,
    /// Model identifier per agent slot. Slots absent here fall back to the
    /// environment's model defaults.
    #[serde(default)]
    pub agent_models: HashMap<AgentKey, String>,
    #[serde(default)]
    pub config: JobOverrides,
}

/// Optional per-job overrides carried in the start message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JobOverrides {
    /// Per-agent wall-clock budget in seconds.
    pub agent_timeout_secs: Option<u64>,
    /// Requested cap on this job's own concurrency; clamped by the global cap.
    pub max_parallel_agents: Option<usize>,
    /// Branch or ref to materialize when the source is a repository URL.
    pub source_ref: Option<String>,
    /// Advanced: bind an agent slot to an explicit argv instead of the
    /// adapter-resolved command. Used by stub-driven tests and escape hatches.
    pub command_overrides: HashMap<AgentKey, Vec<String>>,
}

// ---------------------------------------------------------------------------
// Server -> client
// ---------------------------------------------------------------------------

/// One progress event as encoded for the subscriber.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub job_id: String,
    /// Agent key, or `"job"` for scheduler/controller events.
    pub agent_key: String,
    pub kind: EventKind,
    pub payload: String,
    pub timestamp_ms: i64,
    pub seq: u64,
}

impl From<&ProgressEvent> for EventRecord {
    fn from(event: &ProgressEvent) -> Self {
        Self {
            job_id: event.job_id.to_string(),
            agent_key: event
                .agent
                .map(|a| a.as_str().to_string())
                .unwrap_or_else(|| JOB_SCOPE.to_string()),
            kind: event.kind,
            payload: event.payload.clone(),
            timestamp_ms: event.timestamp.timestamp_millis(),
            seq: event.seq,
        }
    }
}

// ---------------------------------------------------------------------------
// Terminal report
// ---------------------------------------------------------------------------

/// Aggregate classification of a finished job, worst-first ordering.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum JobClassification {
    Succeeded,
    WarningsOnly,
    PartialFailure,
    Failed,
    Timeout,
    Cancelled,
}

impl JobClassification {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobClassification::Succeeded => "succeeded",
            JobClassification::WarningsOnly => "warnings-only",
            JobClassification::PartialFailure => "partial-failure",
            JobClassification::Failed => "failed",
            JobClassification::Timeout => "timeout",
            JobClassification::Cancelled => "cancelled",
        }
    }

    /// Whether a client should treat the job as having produced its artifact.
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            JobClassification::Succeeded | JobClassification::WarningsOnly
        )
    }
}

impl std::fmt::Display for JobClassification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-agent block inside the terminal `complete` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSummary {
    pub agent_key: AgentKey,
    pub kind: Option<AgentKind>,
    pub model: Option<String>,
    pub state: TerminalState,
    pub exit_code: Option<i32>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    /// Failure detail, when the agent did not succeed.
    pub detail: Option<String>,
}

/// Payload of the single terminal `complete` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionReport {
    pub classification: JobClassification,
    pub agents: Vec<AgentSummary>,
}

impl CompletionReport {
    pub fn to_payload(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| self.classification.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn start_request_parses_wire_shape() {
        let raw = r#"{
            "source": "https://example.com/repo.git",
            "objective": "add a readme",
            "agent_models": {
                "primary-1": "claude-sonnet",
                "primary-2": "gemini-pro",
                "primary-3": "codex-mini",
                "integrator": "claude-opus"
            },
            "config": { "agent_timeout_secs": 120 }
        }"#;
        let req: StartRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(req.objective, "add a readme");
        assert_eq!(
            req.agent_models.get(&AgentKey::Integrator).map(String::as_str),
            Some("claude-opus")
        );
        assert_eq!(req.config.agent_timeout_secs, Some(120));
        assert!(req.config.command_overrides.is_empty());
    }

    #[test]
    fn overrides_default_empty() {
        let req: StartRequest =
            serde_json::from_str(r#"{"source":"/tmp/src","objective":"x"}"#).unwrap();
        assert!(req.agent_models.is_empty());
        assert!(req.config.agent_timeout_secs.is_none());
    }

    #[test]
    fn event_record_uses_job_sentinel() {
        let event = ProgressEvent {
            job_id: Uuid::new_v4(),
            agent: None,
            kind: EventKind::Phase,
            payload: "integrating".into(),
            seq: 7,
            timestamp: Utc::now(),
        };
        let record = EventRecord::from(&event);
        assert_eq!(record.agent_key, "job");
        assert_eq!(record.seq, 7);
        assert!(record.timestamp_ms > 0);
    }

    #[test]
    fn event_record_carries_agent_key() {
        let event = ProgressEvent {
            job_id: Uuid::new_v4(),
            agent: Some(AgentKey::Primary3),
            kind: EventKind::Stdout,
            payload: "hello".into(),
            seq: 1,
            timestamp: Utc::now(),
        };
        let record = EventRecord::from(&event);
        assert_eq!(record.agent_key, "primary-3");
    }

    #[test]
    fn classification_ordering_is_worst_last() {
        use JobClassification::*;
        let mut all = vec![Cancelled, Succeeded, Failed, WarningsOnly, Timeout, PartialFailure];
        all.sort();
        assert_eq!(
            all,
            vec![Succeeded, WarningsOnly, PartialFailure, Failed, Timeout, Cancelled]
        );
    }

    #[test]
    fn classification_wire_names() {
        let json = serde_json::to_string(&JobClassification::PartialFailure).unwrap();
        assert_eq!(json, "\"partial-failure\"");
        assert!(JobClassification::WarningsOnly.is_success());
        assert!(!JobClassification::Timeout.is_success());
    }

    #[test]
    fn completion_report_payload_is_json() {
        let report = CompletionReport {
            classification: JobClassification::Succeeded,
            agents: vec![],
        };
        let payload = report.to_payload();
        let parsed: CompletionReport = serde_json::from_str(&payload).unwrap();
        assert_eq!(parsed.classification, JobClassification::Succeeded);
    }
}
