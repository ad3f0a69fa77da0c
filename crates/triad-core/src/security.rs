//! Credential redaction for the event stream.
//!
//! Agent output is relayed to subscribers verbatim except for anything that
//! looks like a credential. Known token prefixes are masked everywhere; the
//! exact credential values a job was created with are masked even when they
//! do not match a known shape.

use std::borrow::Cow;

use crate::config::Credentials;

/// Known secret token prefixes, applied in order; first match wins per token.
static SECRET_PREFIXES: &[(&str, &str)] = &[
    ("sk-ant-", "ANTHROPIC_KEY"),
    ("sk-proj-", "OPENAI_KEY"),
    ("sk-", "API_KEY"),
    ("AIza", "GEMINI_KEY"),
    ("ghp_", "GITHUB_PAT"),
    ("xoxb-", "SLACK_TOKEN"),
    ("AKIA", "AWS_ACCESS_KEY"),
];

/// Redacts credential material from single lines of text.
pub struct SecretRedactor {
    literals: Vec<String>,
}

impl SecretRedactor {
    pub fn new() -> Self {
        Self {
            literals: Vec::new(),
        }
    }

    /// Redactor that additionally masks the exact credential values in use.
    pub fn for_credentials(credentials: &Credentials) -> Self {
        let literals = [
            credentials.anthropic.as_deref(),
            credentials.gemini.as_deref(),
            credentials.openai.as_deref(),
        ]
        .into_iter()
        .flatten()
        .filter(|v| v.len() >= 8)
        .map(str::to_owned)
        .collect();
        Self { literals }
    }

    /// Redact secrets from one line. Returns the input untouched when
    /// nothing matched.
    pub fn redact_line<'a>(&self, input: &'a str) -> Cow<'a, str> {
        let mut output: Option<String> = None;

        for literal in &self.literals {
            let current = output.as_deref().unwrap_or(input);
            if current.contains(literal.as_str()) {
                output = Some(current.replace(literal.as_str(), "[REDACTED:CREDENTIAL]"));
            }
        }

        for (prefix, label) in SECRET_PREFIXES {
            let current = output.as_deref().unwrap_or(input);
            if !current.contains(prefix) {
                continue;
            }
            let mut rewritten = String::with_capacity(current.len());
            let replacement = format!("[REDACTED:{label}]");
            let mut rest = current;
            while let Some(pos) = rest.find(prefix) {
                rewritten.push_str(&rest[..pos]);
                rewritten.push_str(&replacement);
                let after = &rest[pos..];
                let token_len = after
                    .find(|c: char| !is_token_char(c))
                    .unwrap_or(after.len());
                rest = &after[token_len..];
            }
            rewritten.push_str(rest);
            output = Some(rewritten);
        }

        match output {
            Some(s) => Cow::Owned(s),
            None => Cow::Borrowed(input),
        }
    }
}

impl Default for SecretRedactor {
    fn default() -> Self {
        Self::new()
    }
}

fn is_token_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn untouched_line_borrows() {
        let redactor = SecretRedactor::new();
        let line = "nothing secret here";
        assert!(matches!(redactor.redact_line(line), Cow::Borrowed(_)));
    }

    #[test]
    fn anthropic_key_masked() {
        let redactor = SecretRedactor::new();
        let out = redactor.redact_line("token sk-ant-api03-abcdef1234 trailing");
        assert_eq!(out, "token [REDACTED:ANTHROPIC_KEY] trailing");
    }

    #[test]
    fn gemini_key_masked() {
        let redactor = SecretRedactor::new();
        let out = redactor.redact_line("key=AIzaSyD-abc_123");
        assert!(out.contains("[REDACTED:GEMINI_KEY]"));
        assert!(!out.contains("AIza"));
    }

    #[test]
    fn multiple_tokens_on_one_line() {
        let redactor = SecretRedactor::new();
        let out = redactor.redact_line("a sk-ant-one b sk-ant-two");
        assert_eq!(out.matches("[REDACTED:ANTHROPIC_KEY]").count(), 2);
    }

    #[test]
    fn literal_credentials_masked_regardless_of_shape() {
        let creds = Credentials {
            anthropic: Some("opaque-credential-value".into()),
            gemini: None,
            openai: None,
        };
        let redactor = SecretRedactor::for_credentials(&creds);
        let out = redactor.redact_line("ANTHROPIC_CRED=opaque-credential-value");
        assert_eq!(out, "ANTHROPIC_CRED=[REDACTED:CREDENTIAL]");
    }

    #[test]
    fn short_literals_not_registered() {
        // Avoids masking every occurrence of a tiny common substring.
        let creds = Credentials {
            anthropic: Some("abc".into()),
            gemini: None,
            openai: None,
        };
        let redactor = SecretRedactor::for_credentials(&creds);
        assert_eq!(redactor.redact_line("abcdef"), "abcdef");
    }
}
