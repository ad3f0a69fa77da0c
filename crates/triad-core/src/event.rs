//! Progress events and the per-job event hub.
//!
//! Every supervisor and the scheduler publish into one hub per job; each
//! subscriber reads an ordered stream over a bounded broadcast channel.
//! A subscriber that stops draining loses oldest events and sees a single
//! synthesized `warning` per lag episode.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Stable key for one agent slot within a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AgentKey {
    #[serde(rename = "primary-1")]
    Primary1,
    #[serde(rename = "primary-2")]
    Primary2,
    #[serde(rename = "primary-3")]
    Primary3,
    #[serde(rename = "integrator")]
    Integrator,
}

/// The three phase-A slots, in order.
pub const PRIMARY_KEYS: [AgentKey; 3] =
    [AgentKey::Primary1, AgentKey::Primary2, AgentKey::Primary3];

impl AgentKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKey::Primary1 => "primary-1",
            AgentKey::Primary2 => "primary-2",
            AgentKey::Primary3 => "primary-3",
            AgentKey::Integrator => "integrator",
        }
    }

    pub fn is_primary(&self) -> bool {
        !matches!(self, AgentKey::Integrator)
    }
}

impl std::fmt::Display for AgentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AgentKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "primary-1" => Ok(AgentKey::Primary1),
            "primary-2" => Ok(AgentKey::Primary2),
            "primary-3" => Ok(AgentKey::Primary3),
            "integrator" => Ok(AgentKey::Integrator),
            other => Err(format!("unknown agent key '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Kind of a progress event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Status,
    Stdout,
    Stderr,
    Phase,
    Warning,
    Error,
    Complete,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventKind::Status => "status",
            EventKind::Stdout => "stdout",
            EventKind::Stderr => "stderr",
            EventKind::Phase => "phase",
            EventKind::Warning => "warning",
            EventKind::Error => "error",
            EventKind::Complete => "complete",
        };
        f.write_str(s)
    }
}

/// One progress event. `agent` is `None` for job-scoped events (the wire
/// encoding uses the sentinel key `"job"` for those).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub job_id: Uuid,
    pub agent: Option<AgentKey>,
    pub kind: EventKind,
    pub payload: String,
    /// Monotonic per-job sequence number assigned by the hub.
    /// Zero for events synthesized on the subscriber side.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    /// Warning synthesized locally when a subscriber fell behind and the
    /// channel dropped its oldest events.
    fn lagged(job_id: Uuid, missed: u64) -> Self {
        Self {
            job_id,
            agent: None,
            kind: EventKind::Warning,
            payload: format!("subscriber lagging; {missed} events dropped"),
            seq: 0,
            timestamp: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Hub
// ---------------------------------------------------------------------------

/// Per-job broadcast point. Publish order is delivery order for every
/// subscriber, which preserves per-agent stream ordering.
pub struct EventHub {
    job_id: Uuid,
    tx: broadcast::Sender<ProgressEvent>,
    seq: AtomicU64,
    warnings: AtomicU64,
}

impl EventHub {
    pub fn new(job_id: Uuid, backlog: usize) -> Self {
        let (tx, _) = broadcast::channel(backlog);
        Self {
            job_id,
            tx,
            seq: AtomicU64::new(1),
            warnings: AtomicU64::new(0),
        }
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    /// Publish an event. Delivery is best-effort: a hub with no live
    /// subscriber drops events silently.
    pub fn publish(&self, agent: Option<AgentKey>, kind: EventKind, payload: impl Into<String>) {
        if kind == EventKind::Warning {
            self.warnings.fetch_add(1, Ordering::Relaxed);
        }
        let event = ProgressEvent {
            job_id: self.job_id,
            agent,
            kind,
            payload: payload.into(),
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            timestamp: Utc::now(),
        };
        if self.tx.send(event).is_err() {
            debug!(job_id = %self.job_id, "no subscriber; event dropped");
        }
    }

    pub fn agent_event(&self, agent: AgentKey, kind: EventKind, payload: impl Into<String>) {
        self.publish(Some(agent), kind, payload);
    }

    pub fn job_event(&self, kind: EventKind, payload: impl Into<String>) {
        self.publish(None, kind, payload);
    }

    /// Number of `warning` events published so far. Feeds the
    /// `warnings-only` job classification.
    pub fn warnings_emitted(&self) -> u64 {
        self.warnings.load(Ordering::Relaxed)
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            job_id: self.job_id,
            rx: self.tx.subscribe(),
        }
    }
}

/// A live observer stream bound to one job.
pub struct Subscription {
    job_id: Uuid,
    rx: broadcast::Receiver<ProgressEvent>,
}

impl Subscription {
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    /// Next event, or `None` once the hub is gone and the backlog drained.
    ///
    /// Falling behind the bounded backlog yields one `warning` event per
    /// lag episode; delivery then resumes with the oldest retained event.
    pub async fn next(&mut self) -> Option<ProgressEvent> {
        match self.rx.recv().await {
            Ok(event) => Some(event),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                debug!(job_id = %self.job_id, missed, "subscriber lagged");
                Some(ProgressEvent::lagged(self.job_id, missed))
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }
}
