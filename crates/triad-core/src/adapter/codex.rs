use super::{resolve_binary, AgentAdapter, PlanContext, ProgressHint};
use crate::supervisor::AgentCommand;
use crate::{Result, TriadError};

/// Adapter for the Codex CLI, driven through its non-interactive `exec`
/// subcommand.
pub struct CodexAdapter {
    configured_path: Option<String>,
}

impl CodexAdapter {
    pub fn new(configured_path: Option<String>) -> Self {
        Self { configured_path }
    }

    /// Parse a Codex JSONL event line into a progress hint.
    pub fn parse_jsonl_line(line: &str) -> Option<ProgressHint> {
        let v: serde_json::Value = serde_json::from_str(line).ok()?;
        match v.get("type")?.as_str()? {
            "start" => Some(ProgressHint {
                label: "starting".into(),
                percent: Some(0),
            }),
            "tool_call" => Some(ProgressHint {
                label: "working".into(),
                percent: None,
            }),
            "completed" => Some(ProgressHint {
                label: "finalizing".into(),
                percent: Some(100),
            }),
            _ => None,
        }
    }
}

impl AgentAdapter for CodexAdapter {
    fn key(&self) -> &'static str {
        "codex"
    }

    fn plan(&self, ctx: &PlanContext) -> Result<AgentCommand> {
        let binary = resolve_binary(self.configured_path.as_deref(), &["codex"])
            .ok_or_else(|| TriadError::Adapter("codex binary not found in PATH".into()))?;

        let args = vec![
            "exec".to_string(),
            "--full-auto".to_string(),
            "-m".to_string(),
            ctx.model.clone(),
            "--json".to_string(),
            ctx.objective.clone(),
        ];

        let mut env = Vec::new();
        if let Some(credential) = &ctx.credential {
            env.push(("OPENAI_API_KEY".to_string(), credential.clone()));
        }

        Ok(AgentCommand {
            program: binary.display().to_string(),
            args,
            env,
            cwd: ctx.workspace.clone(),
            stdin_payload: None,
        })
    }

    fn infer_progress(&self, line: &str) -> Option<ProgressHint> {
        Self::parse_jsonl_line(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn ctx() -> PlanContext {
        PlanContext {
            objective: "refactor the parser".to_string(),
            model: "codex-test-mini".to_string(),
            workspace: PathBuf::from("/tmp/ws"),
            credential: Some("sk-proj-test".to_string()),
        }
    }

    #[test]
    fn plan_uses_exec_full_auto() {
        let adapter = CodexAdapter::new(Some("/usr/bin/echo".to_string()));
        let cmd = adapter.plan(&ctx()).unwrap();

        assert_eq!(cmd.args[0], "exec");
        assert!(cmd.args.contains(&"--full-auto".to_string()));
        let m_pos = cmd.args.iter().position(|a| a == "-m").unwrap();
        assert_eq!(cmd.args[m_pos + 1], "codex-test-mini");
        assert_eq!(cmd.args.last().unwrap(), "refactor the parser");
        assert!(cmd
            .env
            .contains(&("OPENAI_API_KEY".to_string(), "sk-proj-test".to_string())));
    }

    #[test]
    fn plan_fails_when_binary_missing() {
        let adapter = CodexAdapter::new(Some("/nonexistent/codex".to_string()));
        assert!(adapter.plan(&ctx()).is_err());
    }

    #[test]
    fn jsonl_progress_inference() {
        let start =
            CodexAdapter::parse_jsonl_line(r#"{"type":"start","task":"t","model":"m"}"#).unwrap();
        assert_eq!(start.percent, Some(0));

        let done = CodexAdapter::parse_jsonl_line(r#"{"type":"completed"}"#).unwrap();
        assert_eq!(done.percent, Some(100));

        assert!(CodexAdapter::parse_jsonl_line("not json").is_none());
    }
}
