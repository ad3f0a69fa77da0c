//! Job controller: the public entry point of the engine.
//!
//! Validates a start request, wires workspaces, scheduler, and event hub,
//! and guarantees that workspaces are torn down before the single terminal
//! `complete` event is dispatched, on every exit path.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use crate::adapter::primary_kind;
use crate::config::Settings;
use crate::event::{AgentKey, EventHub, EventKind, Subscription, PRIMARY_KEYS};
use crate::protocol::{CompletionReport, JobClassification, StartRequest};
use crate::scheduler::{classify, AgentPlan, JobPlan, Scheduler};
use crate::workspace::{SourceSpec, WorkspaceManager};
use crate::{Result, TriadError};

/// Accepts job requests and runs them to completion. One controller per
/// process; the concurrency cap spans every job it starts.
pub struct JobController {
    settings: Arc<Settings>,
    workspaces: Arc<WorkspaceManager>,
    semaphore: Arc<Semaphore>,
}

impl JobController {
    pub fn new(settings: Settings) -> Self {
        let workspaces = Arc::new(WorkspaceManager::new(
            settings.workspace_root.clone(),
            settings.workspace_size_limit_bytes,
        ));
        let semaphore = Arc::new(Semaphore::new(settings.max_parallel_agents));
        Self {
            settings: Arc::new(settings),
            workspaces,
            semaphore,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Start a job. Always returns a handle whose subscription will carry
    /// exactly one `complete` event; configuration errors surface as a
    /// synthetic `error` followed by `complete(failed)` without any agent
    /// ever launching.
    pub fn start(&self, request: StartRequest) -> JobHandle {
        let job_id = Uuid::new_v4();
        let hub = Arc::new(EventHub::new(job_id, self.settings.event_backlog));
        let cancel = CancellationToken::new();
        // Bind the observer before anything publishes so no event is lost.
        let subscription = hub.subscribe();

        let plan = match build_plan(&self.settings, job_id, &request) {
            Ok(plan) => plan,
            Err(e) => {
                error!(%job_id, error = %e, "job refused at creation");
                hub.job_event(EventKind::Error, e.to_string());
                let report = CompletionReport {
                    classification: JobClassification::Failed,
                    agents: Vec::new(),
                };
                hub.job_event(EventKind::Complete, report.to_payload());
                let join = tokio::spawn(async { JobClassification::Failed });
                return JobHandle {
                    job_id,
                    cancel,
                    subscription: Some(subscription),
                    join,
                };
            }
        };

        info!(%job_id, objective = %plan.objective, "job accepted");

        let settings = Arc::clone(&self.settings);
        let workspaces = Arc::clone(&self.workspaces);
        let semaphore = Arc::clone(&self.semaphore);
        let job_cancel = cancel.clone();
        let join = tokio::spawn(async move {
            run_job(settings, workspaces, semaphore, hub, job_cancel, plan).await
        });

        JobHandle {
            job_id,
            cancel,
            subscription: Some(subscription),
            join,
        }
    }
}

/// Handle to a started job.
pub struct JobHandle {
    job_id: Uuid,
    cancel: CancellationToken,
    subscription: Option<Subscription>,
    join: JoinHandle<JobClassification>,
}

impl JobHandle {
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    /// The observing client's event stream. One per job.
    pub fn take_subscription(&mut self) -> Option<Subscription> {
        self.subscription.take()
    }

    /// Request cancellation. Idempotent; fans out to every live agent.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the terminal classification.
    pub async fn wait(self) -> JobClassification {
        match self.join.await {
            Ok(classification) => classification,
            Err(e) => {
                error!(job_id = %self.job_id, error = %e, "job task failed");
                JobClassification::Failed
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Job body
// ---------------------------------------------------------------------------

async fn run_job(
    settings: Arc<Settings>,
    workspaces: Arc<WorkspaceManager>,
    semaphore: Arc<Semaphore>,
    hub: Arc<EventHub>,
    cancel: CancellationToken,
    plan: JobPlan,
) -> JobClassification {
    let job_id = plan.job_id;
    hub.job_event(EventKind::Phase, "creating");

    let scheduler = Scheduler::new(
        Arc::clone(&settings),
        Arc::clone(&workspaces),
        Arc::clone(&hub),
        semaphore,
        cancel,
    );

    hub.job_event(EventKind::Phase, "running");

    // The scheduler runs in its own task so a panic anywhere in the plan
    // still reaches teardown and the terminal event.
    let plan = Arc::new(plan);
    let sched_task = {
        let scheduler = scheduler.clone();
        let plan = Arc::clone(&plan);
        tokio::spawn(async move { scheduler.run(plan).await })
    };

    let outcomes = match sched_task.await {
        Ok(outcomes) => outcomes,
        Err(e) => {
            error!(%job_id, error = %e, "scheduler task failed");
            hub.job_event(EventKind::Error, format!("internal failure: {e}"));
            Vec::new()
        }
    };

    // Teardown strictly precedes the terminal event: a client that sees
    // `complete` knows the disk is clean.
    if let Err(e) = workspaces.release_job(job_id).await {
        hub.job_event(EventKind::Warning, format!("workspace teardown failed: {e}"));
    }

    let classification = classify(&outcomes, hub.warnings_emitted());
    let report = CompletionReport {
        classification,
        agents: outcomes.iter().map(|o| o.summary()).collect(),
    };
    hub.job_event(EventKind::Complete, report.to_payload());

    info!(%job_id, %classification, "job complete");
    classification
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Turn a start request into an executable plan, or refuse with a
/// configuration error.
fn build_plan(settings: &Settings, job_id: Uuid, request: &StartRequest) -> Result<JobPlan> {
    let objective = request.objective.trim();
    if objective.is_empty() {
        return Err(TriadError::Config("objective must not be empty".into()));
    }
    let raw_source = request.source.trim();
    if raw_source.is_empty() {
        return Err(TriadError::Config("source must not be empty".into()));
    }

    let mut agents = Vec::with_capacity(4);
    for key in PRIMARY_KEYS.into_iter().chain([AgentKey::Integrator]) {
        let kind = primary_kind(key).unwrap_or(settings.integrator_kind);
        let command_override = request.config.command_overrides.get(&key).cloned();

        let model = match request.agent_models.get(&key) {
            Some(m) if !m.trim().is_empty() => m.clone(),
            Some(_) => {
                return Err(TriadError::Config(format!(
                    "model identifier for {key} is empty"
                )));
            }
            None => {
                let fallback = if key == AgentKey::Integrator {
                    settings
                        .models
                        .integration
                        .as_deref()
                        .or_else(|| settings.models.for_kind(kind))
                } else {
                    settings.models.for_kind(kind)
                };
                match (fallback, &command_override) {
                    (Some(m), _) => m.to_string(),
                    // An explicit argv needs no model binding.
                    (None, Some(_)) => "override".to_string(),
                    (None, None) => {
                        return Err(TriadError::Config(format!(
                            "missing model identifier for {key}"
                        )));
                    }
                }
            }
        };

        if command_override.is_none() && settings.credentials.for_kind(kind).is_none() {
            return Err(TriadError::Config(format!(
                "missing credential for {key} ({kind})"
            )));
        }

        agents.push(AgentPlan {
            key,
            kind,
            model,
            command_override,
        });
    }

    let agent_timeout = request
        .config
        .agent_timeout_secs
        .map(Duration::from_secs)
        .unwrap_or(settings.agent_timeout);
    if agent_timeout.is_zero() {
        return Err(TriadError::Config("agent timeout must be > 0".into()));
    }

    let job_semaphore = request
        .config
        .max_parallel_agents
        .filter(|n| *n > 0)
        .map(|n| Arc::new(Semaphore::new(n)));

    Ok(JobPlan {
        job_id,
        objective: objective.to_string(),
        source: SourceSpec::parse(raw_source)
            .with_reference(request.config.source_ref.clone()),
        agents,
        agent_timeout,
        job_semaphore,
    })
}
