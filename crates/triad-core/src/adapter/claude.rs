use super::{resolve_binary, AgentAdapter, PlanContext, ProgressHint};
use crate::supervisor::AgentCommand;
use crate::{Result, TriadError};

/// Adapter for the Claude swarm-mode CLI.
///
/// The model is bound via the environment; the objective is a positional
/// argument. A settings file is pre-materialized under `.claude/` in the
/// workspace so the CLI runs unattended.
pub struct ClaudeAdapter {
    configured_path: Option<String>,
}

const SETTINGS_DIR: &str = ".claude";
const SETTINGS_FILE: &str = "settings.json";

impl ClaudeAdapter {
    pub fn new(configured_path: Option<String>) -> Self {
        Self { configured_path }
    }

    /// Parse a Claude stream-json line into a progress hint.
    ///
    /// One JSON object per line; `type` distinguishes session init,
    /// assistant turns, and the final result.
    pub fn parse_stream_line(line: &str) -> Option<ProgressHint> {
        let v: serde_json::Value = serde_json::from_str(line).ok()?;
        match v.get("type")?.as_str()? {
            "system" => Some(ProgressHint {
                label: "session init".into(),
                percent: Some(0),
            }),
            "assistant" => Some(ProgressHint {
                label: "working".into(),
                percent: None,
            }),
            "result" => Some(ProgressHint {
                label: "finalizing".into(),
                percent: Some(100),
            }),
            _ => None,
        }
    }
}

impl AgentAdapter for ClaudeAdapter {
    fn key(&self) -> &'static str {
        "claude"
    }

    fn prepare(&self, ctx: &PlanContext) -> Result<()> {
        let dir = ctx.workspace.join(SETTINGS_DIR);
        std::fs::create_dir_all(&dir)?;
        let settings = serde_json::json!({
            "permissions": { "defaultMode": "bypassPermissions" },
            "env": { "DISABLE_AUTOUPDATER": "1" },
        });
        let body = serde_json::to_string_pretty(&settings)
            .map_err(|e| TriadError::Adapter(format!("settings encode failed: {e}")))?;
        std::fs::write(dir.join(SETTINGS_FILE), body)?;
        Ok(())
    }

    fn plan(&self, ctx: &PlanContext) -> Result<AgentCommand> {
        let binary = resolve_binary(self.configured_path.as_deref(), &["claude"])
            .ok_or_else(|| TriadError::Adapter("claude binary not found in PATH".into()))?;

        // Objective passed as a single positional argument, quote-safe by
        // construction since nothing re-parses the argv.
        let args = vec![
            "--swarm".to_string(),
            "-p".to_string(),
            ctx.objective.clone(),
            "--output-format".to_string(),
            "stream-json".to_string(),
        ];

        let mut env = vec![("ANTHROPIC_MODEL".to_string(), ctx.model.clone())];
        if let Some(credential) = &ctx.credential {
            env.push(("ANTHROPIC_API_KEY".to_string(), credential.clone()));
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
        Self::parse_stream_line(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn ctx(workspace: PathBuf) -> PlanContext {
        PlanContext {
            objective: "add a readme".to_string(),
            model: "claude-test-1".to_string(),
            workspace,
            credential: Some("sk-ant-test".to_string()),
        }
    }

    #[test]
    fn plan_binds_model_via_environment() {
        let adapter = ClaudeAdapter::new(Some("/usr/bin/echo".to_string()));
        let cmd = adapter.plan(&ctx(PathBuf::from("/tmp/ws"))).unwrap();

        assert_eq!(cmd.program, "/usr/bin/echo");
        assert!(cmd.args.contains(&"--swarm".to_string()));
        assert!(cmd.args.contains(&"add a readme".to_string()));
        assert!(cmd
            .env
            .contains(&("ANTHROPIC_MODEL".to_string(), "claude-test-1".to_string())));
        assert!(cmd
            .env
            .contains(&("ANTHROPIC_API_KEY".to_string(), "sk-ant-test".to_string())));
        assert_eq!(cmd.cwd, PathBuf::from("/tmp/ws"));
    }

    #[test]
    fn plan_without_credential_omits_key() {
        let adapter = ClaudeAdapter::new(Some("/usr/bin/echo".to_string()));
        let mut context = ctx(PathBuf::from("/tmp/ws"));
        context.credential = None;
        let cmd = adapter.plan(&context).unwrap();
        assert!(!cmd.env.iter().any(|(k, _)| k == "ANTHROPIC_API_KEY"));
    }

    #[test]
    fn plan_fails_when_binary_missing() {
        let adapter = ClaudeAdapter::new(Some("/nonexistent/claude".to_string()));
        let err = adapter.plan(&ctx(PathBuf::from("/tmp/ws"))).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn prepare_materializes_settings_file() {
        let tmp = tempfile::tempdir().unwrap();
        let adapter = ClaudeAdapter::new(None);
        adapter.prepare(&ctx(tmp.path().to_path_buf())).unwrap();

        let body =
            std::fs::read_to_string(tmp.path().join(".claude/settings.json")).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(
            parsed["permissions"]["defaultMode"],
            "bypassPermissions"
        );
    }

    #[test]
    fn stream_line_progress_inference() {
        let init = ClaudeAdapter::parse_stream_line(
            r#"{"type":"system","subtype":"init","session_id":"abc"}"#,
        )
        .unwrap();
        assert_eq!(init.percent, Some(0));

        let work = ClaudeAdapter::parse_stream_line(
            r#"{"type":"assistant","message":{"content":"on it"}}"#,
        )
        .unwrap();
        assert_eq!(work.label, "working");

        let done =
            ClaudeAdapter::parse_stream_line(r#"{"type":"result","subtype":"success"}"#).unwrap();
        assert_eq!(done.percent, Some(100));
    }

    #[test]
    fn non_json_lines_produce_no_hint() {
        assert!(ClaudeAdapter::parse_stream_line("plain text").is_none());
        assert!(ClaudeAdapter::parse_stream_line("").is_none());
        assert!(ClaudeAdapter::parse_stream_line(r#"{"type":"unknown"}"#).is_none());
    }
}
