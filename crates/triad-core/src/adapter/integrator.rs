use super::{AgentAdapter, PlanContext, ProgressHint};
use crate::event::PRIMARY_KEYS;
use crate::supervisor::AgentCommand;
use crate::Result;

/// Name of the artifact the integrator must produce in its workspace.
pub const FINAL_REPORT: &str = "final_report.md";

/// Integration instructions persisted alongside the integrator's source copy.
pub const PROMPT_FILE: &str = "integration_prompt.md";

/// The phase-B adapter. Runs the same command family as one of the
/// primaries, but against the integration workspace and with the objective
/// wrapped in an integration prompt.
pub struct IntegratorAdapter {
    inner: Box<dyn AgentAdapter>,
}

impl IntegratorAdapter {
    pub fn new(inner: Box<dyn AgentAdapter>) -> Self {
        Self { inner }
    }
}

/// Wrap the job objective with the integration instructions. The three
/// primary workspaces are exposed read-only under fixed relative paths.
pub fn integration_objective(objective: &str) -> String {
    let mut prompt = String::from(
        "You are the integration agent. Three independent attempts at the \
         objective below are available read-only in this workspace at ",
    );
    for (i, key) in PRIMARY_KEYS.iter().enumerate() {
        if i > 0 {
            prompt.push_str(", ");
        }
        prompt.push_str("./");
        prompt.push_str(key.as_str());
    }
    prompt.push_str(
        ". Do not modify them. Compare the attempts, integrate the strongest \
         parts into this workspace, and write a summary of the integrated \
         result to ",
    );
    prompt.push_str(FINAL_REPORT);
    prompt.push_str(".\n\nObjective:\n");
    prompt.push_str(objective);
    prompt
}

impl AgentAdapter for IntegratorAdapter {
    fn key(&self) -> &'static str {
        "integrator"
    }

    fn prepare(&self, ctx: &PlanContext) -> Result<()> {
        self.inner.prepare(ctx)?;
        std::fs::write(
            ctx.workspace.join(PROMPT_FILE),
            integration_objective(&ctx.objective),
        )?;
        Ok(())
    }

    fn plan(&self, ctx: &PlanContext) -> Result<AgentCommand> {
        let wrapped = PlanContext {
            objective: integration_objective(&ctx.objective),
            ..ctx.clone()
        };
        self.inner.plan(&wrapped)
    }

    fn infer_progress(&self, line: &str) -> Option<ProgressHint> {
        self.inner.infer_progress(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::ClaudeAdapter;
    use std::path::PathBuf;

    #[test]
    fn prompt_names_all_primary_paths_and_artifact() {
        let prompt = integration_objective("add a readme");
        assert!(prompt.contains("./primary-1"));
        assert!(prompt.contains("./primary-2"));
        assert!(prompt.contains("./primary-3"));
        assert!(prompt.contains("final_report.md"));
        assert!(prompt.contains("read-only"));
        assert!(prompt.ends_with("add a readme"));
    }

    #[test]
    fn prepare_persists_prompt_file() {
        let tmp = tempfile::tempdir().unwrap();
        let inner = Box::new(ClaudeAdapter::new(None));
        let adapter = IntegratorAdapter::new(inner);

        adapter
            .prepare(&PlanContext {
                objective: "add a readme".to_string(),
                model: "claude-test-1".to_string(),
                workspace: tmp.path().to_path_buf(),
                credential: None,
            })
            .unwrap();

        let prompt = std::fs::read_to_string(tmp.path().join(PROMPT_FILE)).unwrap();
        assert!(prompt.contains("./primary-3"));
        assert!(prompt.contains("add a readme"));
        // The inner adapter's own preparation ran too.
        assert!(tmp.path().join(".claude/settings.json").is_file());
    }

    #[test]
    fn plan_delegates_with_wrapped_objective() {
        let inner = Box::new(ClaudeAdapter::new(Some("/usr/bin/echo".to_string())));
        let adapter = IntegratorAdapter::new(inner);
        assert_eq!(adapter.key(), "integrator");

        let cmd = adapter
            .plan(&PlanContext {
                objective: "add a readme".to_string(),
                model: "claude-test-1".to_string(),
                workspace: PathBuf::from("/tmp/integ"),
                credential: None,
            })
            .unwrap();

        let objective_arg = cmd
            .args
            .iter()
            .find(|a| a.contains("integration agent"))
            .expect("wrapped objective should be an argument");
        assert!(objective_arg.contains("./primary-2"));
        assert!(objective_arg.contains("add a readme"));
        assert_eq!(cmd.cwd, PathBuf::from("/tmp/integ"));
    }
}
