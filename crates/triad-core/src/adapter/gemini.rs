use regex::Regex;

use super::{resolve_binary, AgentAdapter, PlanContext, ProgressHint};
use crate::supervisor::AgentCommand;
use crate::{Result, TriadError};

/// Adapter for the Gemini CLI. Model bound via flag, objective positional.
pub struct GeminiAdapter {
    configured_path: Option<String>,
    percent_re: Regex,
}

impl GeminiAdapter {
    pub fn new(configured_path: Option<String>) -> Self {
        Self {
            configured_path,
            // Plain-text output; a leading "[42%]" marker is the only
            // structured progress this CLI emits.
            percent_re: Regex::new(r"^\[(\d{1,3})%\]").expect("static regex"),
        }
    }
}

impl AgentAdapter for GeminiAdapter {
    fn key(&self) -> &'static str {
        "gemini"
    }

    fn plan(&self, ctx: &PlanContext) -> Result<AgentCommand> {
        let binary = resolve_binary(self.configured_path.as_deref(), &["gemini"])
            .ok_or_else(|| TriadError::Adapter("gemini binary not found in PATH".into()))?;

        let args = vec![
            "-m".to_string(),
            ctx.model.clone(),
            "--approval-mode".to_string(),
            "auto".to_string(),
            "-p".to_string(),
            ctx.objective.clone(),
        ];

        let mut env = Vec::new();
        if let Some(credential) = &ctx.credential {
            env.push(("GEMINI_API_KEY".to_string(), credential.clone()));
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
        let caps = self.percent_re.captures(line.trim())?;
        let percent: u8 = caps.get(1)?.as_str().parse().ok().filter(|p| *p <= 100)?;
        Some(ProgressHint {
            label: "working".into(),
            percent: Some(percent),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn ctx() -> PlanContext {
        PlanContext {
            objective: "fix the tests".to_string(),
            model: "gemini-test-pro".to_string(),
            workspace: PathBuf::from("/tmp/ws"),
            credential: Some("AIzaTestKey1234".to_string()),
        }
    }

    #[test]
    fn plan_binds_model_via_flag() {
        let adapter = GeminiAdapter::new(Some("/usr/bin/echo".to_string()));
        let cmd = adapter.plan(&ctx()).unwrap();

        let m_pos = cmd.args.iter().position(|a| a == "-m").unwrap();
        assert_eq!(cmd.args[m_pos + 1], "gemini-test-pro");
        assert!(cmd.args.contains(&"fix the tests".to_string()));
        assert!(cmd
            .env
            .contains(&("GEMINI_API_KEY".to_string(), "AIzaTestKey1234".to_string())));
    }

    #[test]
    fn plan_fails_when_binary_missing() {
        let adapter = GeminiAdapter::new(Some("/nonexistent/gemini".to_string()));
        assert!(adapter.plan(&ctx()).is_err());
    }

    #[test]
    fn percent_marker_parsed() {
        let adapter = GeminiAdapter::new(None);
        let hint = adapter.infer_progress("[42%] editing src/lib.rs").unwrap();
        assert_eq!(hint.percent, Some(42));
        assert!(adapter.infer_progress("no marker here").is_none());
        assert!(adapter.infer_progress("[999%] bogus").is_none());
    }
}
