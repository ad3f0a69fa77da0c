//! Two-phase job scheduler.
//!
//! Phase A runs the three primary agents concurrently; once every primary
//! is terminal, phase B runs the integrator against the integration
//! workspace. A failing agent never cancels its siblings. The global
//! semaphore caps concurrently running agent processes across all jobs.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::adapter::{adapter_for, integrator_adapter, AgentAdapter, AgentKind};
use crate::config::Settings;
use crate::event::{AgentKey, EventHub, EventKind};
use crate::protocol::{AgentSummary, JobClassification};
use crate::security::SecretRedactor;
use crate::supervisor::{
    AgentCommand, ProcessSupervisor, SupervisorConfig, SupervisorEvent, TerminalState,
};
use crate::workspace::{SourceSpec, WorkspaceManager};
use crate::Result;

/// Base delay for launch retries; doubles per attempt.
const RETRY_BASE: Duration = Duration::from_millis(100);

/// Exponential backoff before launch attempt `attempt + 1`.
pub fn backoff_delay(attempt: u32) -> Duration {
    RETRY_BASE * 2u32.saturating_pow(attempt.saturating_sub(1))
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

/// One agent slot of a job plan.
#[derive(Debug, Clone)]
pub struct AgentPlan {
    pub key: AgentKey,
    pub kind: AgentKind,
    pub model: String,
    /// Explicit argv replacing the adapter-resolved command.
    pub command_override: Option<Vec<String>>,
}

/// Everything the scheduler needs to execute one job.
#[derive(Debug)]
pub struct JobPlan {
    pub job_id: Uuid,
    pub objective: String,
    pub source: SourceSpec,
    /// Three primaries plus the integrator.
    pub agents: Vec<AgentPlan>,
    pub agent_timeout: Duration,
    /// Requested per-job concurrency clamp, layered under the global cap.
    pub job_semaphore: Option<Arc<Semaphore>>,
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Terminal record for one agent of a job.
#[derive(Debug, Clone)]
pub struct AgentOutcome {
    pub key: AgentKey,
    pub kind: AgentKind,
    pub model: String,
    pub state: TerminalState,
    pub exit_code: Option<i32>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub detail: Option<String>,
}

impl AgentOutcome {
    pub fn summary(&self) -> AgentSummary {
        let duration_ms = match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => {
                Some(end.signed_duration_since(start).num_milliseconds().max(0) as u64)
            }
            _ => None,
        };
        AgentSummary {
            agent_key: self.key,
            kind: Some(self.kind),
            model: Some(self.model.clone()),
            state: self.state,
            exit_code: self.exit_code,
            started_at: self.started_at,
            finished_at: self.finished_at,
            duration_ms,
            detail: self.detail.clone(),
        }
    }
}

/// Aggregate classification from per-agent outcomes.
///
/// Worst of the agents' terminal states, except that a successful
/// integrator downgrades primary failures to `partial-failure`, and a
/// clean run that still emitted warnings reports `warnings-only`.
pub fn classify(outcomes: &[AgentOutcome], warnings_emitted: u64) -> JobClassification {
    fn map(state: TerminalState) -> JobClassification {
        match state {
            TerminalState::Succeeded => JobClassification::Succeeded,
            TerminalState::Failed => JobClassification::Failed,
            TerminalState::Timeout => JobClassification::Timeout,
            TerminalState::Cancelled => JobClassification::Cancelled,
        }
    }

    if outcomes.is_empty() {
        return JobClassification::Failed;
    }

    let integrator = outcomes.iter().find(|o| o.key == AgentKey::Integrator);
    let all_primaries_succeeded = outcomes
        .iter()
        .filter(|o| o.key.is_primary())
        .all(|o| o.state == TerminalState::Succeeded);

    let mut result = match integrator {
        Some(integ) if integ.state == TerminalState::Succeeded => {
            if all_primaries_succeeded {
                JobClassification::Succeeded
            } else {
                JobClassification::PartialFailure
            }
        }
        _ => outcomes
            .iter()
            .map(|o| map(o.state))
            .max()
            .unwrap_or(JobClassification::Failed),
    };

    if result == JobClassification::Succeeded && warnings_emitted > 0 {
        result = JobClassification::WarningsOnly;
    }

    result
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Scheduler {
    settings: Arc<Settings>,
    workspaces: Arc<WorkspaceManager>,
    hub: Arc<EventHub>,
    redactor: Arc<SecretRedactor>,
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl Scheduler {
    pub fn new(
        settings: Arc<Settings>,
        workspaces: Arc<WorkspaceManager>,
        hub: Arc<EventHub>,
        semaphore: Arc<Semaphore>,
        cancel: CancellationToken,
    ) -> Self {
        let redactor = Arc::new(SecretRedactor::for_credentials(&settings.credentials));
        Self {
            settings,
            workspaces,
            hub,
            redactor,
            semaphore,
            cancel,
        }
    }

    /// Execute the two-phase plan to completion, returning one outcome per
    /// agent that was considered.
    pub async fn run(&self, plan: Arc<JobPlan>) -> Vec<AgentOutcome> {
        let mut handles = Vec::new();
        for agent in plan.agents.iter().filter(|a| a.key.is_primary()) {
            let scheduler = self.clone();
            let plan = Arc::clone(&plan);
            let agent = agent.clone();
            let key = agent.key;
            handles.push((
                key,
                tokio::spawn(async move { scheduler.run_agent(&plan, &agent).await }),
            ));
        }

        let mut outcomes = Vec::new();
        for (key, handle) in handles {
            match handle.await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    warn!(job_id = %plan.job_id, agent_key = %key, error = %e, "agent task failed");
                    self.hub
                        .agent_event(key, EventKind::Error, format!("internal agent failure: {e}"));
                    self.hub
                        .agent_event(key, EventKind::Status, TerminalState::Failed.as_str());
                    outcomes.push(self.pre_launch_outcome(
                        plan.agent_by_key(key),
                        TerminalState::Failed,
                        Some(format!("internal agent failure: {e}")),
                    ));
                }
            }
        }

        // Barrier: every primary is terminal. Cancellation before phase B
        // means the integrator never starts.
        if self.cancel.is_cancelled() {
            info!(job_id = %plan.job_id, "job cancelled before integration phase");
            return outcomes;
        }

        let Some(integrator) = plan
            .agents
            .iter()
            .find(|a| a.key == AgentKey::Integrator)
        else {
            return outcomes;
        };

        self.hub.job_event(EventKind::Phase, "integrating");
        outcomes.push(self.run_agent(&plan, integrator).await);
        outcomes
    }

    /// Run one agent from workspace allocation to terminal state.
    async fn run_agent(&self, plan: &JobPlan, agent: &AgentPlan) -> AgentOutcome {
        let key = agent.key;

        if self.cancel.is_cancelled() {
            return self.finish_pre_launch(agent, TerminalState::Cancelled, "job cancelled");
        }

        // Workspace first; a failed allocation marks this agent terminal
        // without ever launching a process. Siblings proceed.
        let workspace = match self
            .workspaces
            .allocate(plan.job_id, key, &plan.source)
            .await
        {
            Ok(ws) => ws,
            Err(e) => {
                self.hub
                    .agent_event(key, EventKind::Error, format!("workspace allocation failed: {e}"));
                return self.finish_pre_launch(agent, TerminalState::Failed, e.to_string());
            }
        };

        if key == AgentKey::Integrator {
            if let Err(e) = self.workspaces.stage_integration(plan.job_id).await {
                // Degraded input is acceptable; the integrator still runs.
                self.hub.agent_event(
                    key,
                    EventKind::Warning,
                    format!("integration staging incomplete: {e}"),
                );
            }
        }

        let (command, adapter) = match self.build_command(plan, agent, &workspace) {
            Ok(pair) => pair,
            Err(e) => {
                self.hub
                    .agent_event(key, EventKind::Error, format!("command planning failed: {e}"));
                return self.finish_pre_launch(agent, TerminalState::Failed, e.to_string());
            }
        };

        // Concurrency cap: one global permit per running process, plus the
        // job's own clamp when requested. Held until terminal.
        let _global_permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                return self.finish_pre_launch(agent, TerminalState::Cancelled, "job cancelled");
            }
            permit = self.semaphore.clone().acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => {
                    return self.finish_pre_launch(
                        agent,
                        TerminalState::Failed,
                        "concurrency semaphore closed",
                    );
                }
            }
        };
        let _job_permit = match &plan.job_semaphore {
            Some(sem) => tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    return self.finish_pre_launch(agent, TerminalState::Cancelled, "job cancelled");
                }
                permit = sem.clone().acquire_owned() => permit.ok(),
            },
            None => None,
        };

        let supervisor = ProcessSupervisor::new(SupervisorConfig {
            job_id: plan.job_id,
            agent_key: key,
            timeout: plan.agent_timeout,
            grace: self.settings.grace_period,
            max_line_bytes: self.settings.max_line_bytes,
        });

        // Transient launch failures retry with exponential backoff; nonzero
        // exits of a launched process never do.
        let agent_cancel = self.cancel.child_token();
        let mut attempt = 1u32;
        let rx = loop {
            match supervisor.spawn(command.clone(), agent_cancel.clone()).await {
                Ok(rx) => break rx,
                Err(e) if e.is_transient_launch() && attempt < self.settings.launch_attempts => {
                    let delay = backoff_delay(attempt);
                    self.hub.agent_event(
                        key,
                        EventKind::Warning,
                        format!(
                            "launch attempt {attempt} failed ({e}); retrying in {}ms",
                            delay.as_millis()
                        ),
                    );
                    attempt += 1;
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => {
                            return self.finish_pre_launch(
                                agent,
                                TerminalState::Cancelled,
                                "job cancelled",
                            );
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    self.hub
                        .agent_event(key, EventKind::Error, format!("failed to launch agent: {e}"));
                    return self.finish_pre_launch(agent, TerminalState::Failed, e.to_string());
                }
            }
        };

        self.forward_events(agent, adapter.as_deref(), rx).await
    }

    /// Relay supervisor events into the hub until the agent is terminal.
    async fn forward_events(
        &self,
        agent: &AgentPlan,
        adapter: Option<&dyn AgentAdapter>,
        mut rx: tokio::sync::mpsc::Receiver<SupervisorEvent>,
    ) -> AgentOutcome {
        let key = agent.key;
        let mut started_at = None;
        let mut finished_at = None;
        let mut exit_code = None;
        let mut state = TerminalState::Failed;
        let mut detail = None;

        while let Some(event) = rx.recv().await {
            if let Some(terminal) = event.terminal_state() {
                state = terminal;
            }
            match event {
                SupervisorEvent::Started { pid, at } => {
                    started_at = Some(at);
                    info!(job_id = %self.hub.job_id(), agent_key = %key, pid, "agent started");
                    self.hub.agent_event(key, EventKind::Status, "started");
                }
                SupervisorEvent::Stdout { line } => {
                    let line = self.redactor.redact_line(&line).into_owned();
                    if let Some(hint) = adapter.and_then(|a| a.infer_progress(&line)) {
                        self.hub.agent_event(key, EventKind::Status, hint.render());
                    }
                    self.hub.agent_event(key, EventKind::Stdout, line);
                }
                SupervisorEvent::Stderr { line } => {
                    let line = self.redactor.redact_line(&line).into_owned();
                    if let Some(hint) = adapter.and_then(|a| a.infer_progress(&line)) {
                        self.hub.agent_event(key, EventKind::Status, hint.render());
                    }
                    self.hub.agent_event(key, EventKind::Stderr, line);
                }
                SupervisorEvent::LineTruncated { original_len } => {
                    self.hub.agent_event(
                        key,
                        EventKind::Warning,
                        format!("output line truncated ({original_len} bytes)"),
                    );
                }
                SupervisorEvent::Exited { code, at } => {
                    exit_code = Some(code);
                    finished_at = Some(at);
                    if code != 0 {
                        detail = Some(format!("exited with code {code}"));
                    }
                }
                SupervisorEvent::Failed { error, at } => {
                    finished_at = Some(at);
                    detail = Some(error);
                }
                SupervisorEvent::TimedOut { at } => {
                    finished_at = Some(at);
                    detail = Some("wall-clock budget exceeded".into());
                }
                SupervisorEvent::Cancelled { at } => {
                    finished_at = Some(at);
                    detail = Some("cancelled".into());
                }
            }
        }

        // Terminal status is the last event on this agent's stream.
        self.hub.agent_event(key, EventKind::Status, state.as_str());

        AgentOutcome {
            key,
            kind: agent.kind,
            model: agent.model.clone(),
            state,
            exit_code,
            started_at,
            finished_at,
            detail,
        }
    }

    /// Resolve the concrete command for an agent, either from an explicit
    /// override or from its adapter.
    fn build_command(
        &self,
        plan: &JobPlan,
        agent: &AgentPlan,
        workspace: &std::path::Path,
    ) -> Result<(AgentCommand, Option<Box<dyn AgentAdapter>>)> {
        if let Some(argv) = &agent.command_override {
            let command = AgentCommand::from_argv(argv, workspace.to_path_buf())?;
            return Ok((command, None));
        }

        let adapter = if agent.key == AgentKey::Integrator {
            integrator_adapter(agent.kind)
        } else {
            adapter_for(agent.kind)
        };

        let ctx = crate::adapter::PlanContext {
            objective: plan.objective.clone(),
            model: agent.model.clone(),
            workspace: workspace.to_path_buf(),
            credential: self
                .settings
                .credentials
                .for_kind(agent.kind)
                .map(str::to_owned),
        };
        adapter.prepare(&ctx)?;
        let command = adapter.plan(&ctx)?;
        Ok((command, Some(adapter)))
    }

    /// Emit the terminal status for an agent that never launched.
    fn finish_pre_launch(
        &self,
        agent: &AgentPlan,
        state: TerminalState,
        detail: impl Into<String>,
    ) -> AgentOutcome {
        self.hub
            .agent_event(agent.key, EventKind::Status, state.as_str());
        self.pre_launch_outcome(Some(agent), state, Some(detail.into()))
    }

    fn pre_launch_outcome(
        &self,
        agent: Option<&AgentPlan>,
        state: TerminalState,
        detail: Option<String>,
    ) -> AgentOutcome {
        AgentOutcome {
            key: agent.map(|a| a.key).unwrap_or(AgentKey::Primary1),
            kind: agent.map(|a| a.kind).unwrap_or(AgentKind::Claude),
            model: agent.map(|a| a.model.clone()).unwrap_or_default(),
            state,
            exit_code: None,
            started_at: None,
            finished_at: None,
            detail,
        }
    }
}

impl JobPlan {
    fn agent_by_key(&self, key: AgentKey) -> Option<&AgentPlan> {
        self.agents.iter().find(|a| a.key == key)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(key: AgentKey, state: TerminalState) -> AgentOutcome {
        AgentOutcome {
            key,
            kind: AgentKind::Claude,
            model: "test-model".into(),
            state,
            exit_code: None,
            started_at: None,
            finished_at: None,
            detail: None,
        }
    }

    fn four(states: [TerminalState; 4]) -> Vec<AgentOutcome> {
        vec![
            outcome(AgentKey::Primary1, states[0]),
            outcome(AgentKey::Primary2, states[1]),
            outcome(AgentKey::Primary3, states[2]),
            outcome(AgentKey::Integrator, states[3]),
        ]
    }

    use TerminalState::{Cancelled, Failed, Succeeded, Timeout};

    #[test]
    fn all_succeeded_is_succeeded() {
        let outcomes = four([Succeeded, Succeeded, Succeeded, Succeeded]);
        assert_eq!(classify(&outcomes, 0), JobClassification::Succeeded);
    }

    #[test]
    fn warnings_downgrade_clean_run() {
        let outcomes = four([Succeeded, Succeeded, Succeeded, Succeeded]);
        assert_eq!(classify(&outcomes, 2), JobClassification::WarningsOnly);
    }

    #[test]
    fn one_primary_timeout_with_good_integrator_is_partial() {
        let outcomes = four([Succeeded, Timeout, Succeeded, Succeeded]);
        assert_eq!(classify(&outcomes, 0), JobClassification::PartialFailure);
    }

    #[test]
    fn all_primaries_failed_with_good_integrator_is_partial() {
        let outcomes = four([Failed, Failed, Failed, Succeeded]);
        assert_eq!(classify(&outcomes, 0), JobClassification::PartialFailure);
    }

    #[test]
    fn all_primaries_failed_with_failed_integrator_is_failed() {
        let outcomes = four([Failed, Failed, Failed, Failed]);
        assert_eq!(classify(&outcomes, 0), JobClassification::Failed);
    }

    #[test]
    fn timeout_without_integrator_success_dominates_failed() {
        let outcomes = four([Failed, Timeout, Succeeded, Failed]);
        assert_eq!(classify(&outcomes, 0), JobClassification::Timeout);
    }

    #[test]
    fn cancelled_job_is_cancelled() {
        // No integrator outcome: cancellation hit before phase B.
        let outcomes = vec![
            outcome(AgentKey::Primary1, Cancelled),
            outcome(AgentKey::Primary2, Cancelled),
            outcome(AgentKey::Primary3, Cancelled),
        ];
        assert_eq!(classify(&outcomes, 0), JobClassification::Cancelled);
    }

    #[test]
    fn partial_failure_not_downgraded_by_warnings_rule() {
        let outcomes = four([Failed, Succeeded, Succeeded, Succeeded]);
        assert_eq!(classify(&outcomes, 5), JobClassification::PartialFailure);
    }

    #[test]
    fn empty_outcomes_classify_failed() {
        assert_eq!(classify(&[], 0), JobClassification::Failed);
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        assert_eq!(backoff_delay(1), Duration::from_millis(100));
        assert_eq!(backoff_delay(2), Duration::from_millis(200));
        assert_eq!(backoff_delay(3), Duration::from_millis(400));
    }

    #[test]
    fn summary_computes_duration() {
        let start = Utc::now();
        let end = start + chrono::Duration::milliseconds(1500);
        let mut o = outcome(AgentKey::Primary1, Succeeded);
        o.started_at = Some(start);
        o.finished_at = Some(end);
        let summary = o.summary();
        assert_eq!(summary.duration_ms, Some(1500));
        assert_eq!(summary.state, Succeeded);
    }
}
