use thiserror::Error;

/// Top-level error type for the triad-core library.
#[derive(Debug, Error)]
pub enum TriadError {
    /// Configuration parse or validation error.
    #[error("config error: {0}")]
    Config(String),

    /// Workspace allocation or teardown error.
    #[error("workspace error: {0}")]
    Workspace(String),

    /// Agent process supervision error.
    #[error("process error: {0}")]
    Process(String),

    /// Agent adapter error (unknown kind, missing binary, bad plan).
    #[error("adapter error: {0}")]
    Adapter(String),

    /// Failure to launch an agent process. `transient` steers the
    /// scheduler's retry policy: only transient launch failures are retried.
    #[error("launch error: {source}")]
    Launch {
        #[source]
        source: std::io::Error,
        transient: bool,
    },

    /// Git command error during source materialization.
    #[error("git error: {0}")]
    Git(String),

    /// Wraps `std::io::Error`.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl TriadError {
    /// Classify a spawn-time io error. Missing binaries and permission
    /// problems never heal on retry; everything else is assumed ephemeral.
    pub fn launch(source: std::io::Error) -> Self {
        let transient = !matches!(
            source.kind(),
            std::io::ErrorKind::NotFound
                | std::io::ErrorKind::PermissionDenied
                | std::io::ErrorKind::InvalidInput
        );
        TriadError::Launch { source, transient }
    }

    pub fn is_transient_launch(&self) -> bool {
        matches!(self, TriadError::Launch { transient: true, .. })
    }
}

/// Convenience alias used throughout the library.
pub type Result<T> = std::result::Result<T, TriadError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launch_classification() {
        let not_found = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        assert!(!TriadError::launch(not_found).is_transient_launch());

        let denied = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        assert!(!TriadError::launch(denied).is_transient_launch());

        let busy = std::io::Error::new(std::io::ErrorKind::WouldBlock, "try again");
        assert!(TriadError::launch(busy).is_transient_launch());
    }

    #[test]
    fn error_display() {
        let err = TriadError::Config("missing objective".into());
        assert_eq!(err.to_string(), "config error: missing objective");
    }
}
