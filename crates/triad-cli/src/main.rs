use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};

use triad_core::config::Settings;
use triad_core::doctor;
use triad_core::event::{AgentKey, EventKind};
use triad_core::job::JobController;
use triad_core::protocol::{EventRecord, JobOverrides, StartRequest};

#[derive(Parser)]
#[command(name = "triad", version, about = "Parallel agent orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a job against a source tree and stream its events as JSON lines.
    Run(RunArgs),
    /// Check which agent CLIs are installed.
    Doctor,
}

#[derive(Args)]
struct RunArgs {
    /// Remote repository URL or local directory path.
    #[arg(long)]
    source: String,
    /// What the agents should accomplish.
    #[arg(long)]
    objective: String,
    /// Model binding per agent slot, e.g. --model primary-1=claude-sonnet.
    /// Slots left unbound fall back to the environment's model defaults.
    #[arg(long = "model", value_name = "KEY=MODEL")]
    models: Vec<String>,
    /// Per-agent wall-clock budget in seconds.
    #[arg(long)]
    timeout_secs: Option<u64>,
    /// Branch or ref, when the source is a repository URL.
    #[arg(long)]
    git_ref: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    triad_core::init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run(args).await,
        Command::Doctor => run_doctor(),
    }
}

async fn run(args: RunArgs) -> Result<()> {
    let settings = Settings::load().context("failed to load settings")?;
    let controller = JobController::new(settings);

    let request = StartRequest {
        source: args.source,
        objective: args.objective,
        agent_models: parse_models(&args.models)?,
        config: JobOverrides {
            agent_timeout_secs: args.timeout_secs,
            source_ref: args.git_ref,
            ..JobOverrides::default()
        },
    };

    let mut handle = controller.start(request);
    let mut subscription = handle
        .take_subscription()
        .context("job subscription unavailable")?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("interrupt received; cancelling job");
                handle.cancel();
            }
            event = subscription.next() => {
                let Some(event) = event else { break };
                let record = EventRecord::from(&event);
                println!("{}", serde_json::to_string(&record)?);
                if event.kind == EventKind::Complete {
                    break;
                }
            }
        }
    }

    let classification = handle.wait().await;
    if classification.is_success() {
        Ok(())
    } else {
        std::process::exit(1);
    }
}

fn run_doctor() -> Result<()> {
    let report = doctor::probe_all();
    for probe in &report.agents {
        match (&probe.binary, &probe.version) {
            (Some(path), Some(version)) => {
                println!("{}: ready ({version}) at {}", probe.kind, path.display());
            }
            (Some(path), None) => {
                println!("{}: found at {} (version unknown)", probe.kind, path.display());
            }
            (None, _) => println!("{}: missing", probe.kind),
        }
    }
    if report.all_available() {
        Ok(())
    } else {
        std::process::exit(1);
    }
}

fn parse_models(pairs: &[String]) -> Result<HashMap<AgentKey, String>> {
    let mut models = HashMap::new();
    for pair in pairs {
        let Some((key, model)) = pair.split_once('=') else {
            bail!("--model expects KEY=MODEL, got '{pair}'");
        };
        let key: AgentKey = key
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid agent key: {e}"))?;
        models.insert(key, model.to_string());
    }
    Ok(models)
}
