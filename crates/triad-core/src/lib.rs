pub mod adapter;
pub mod config;
pub mod doctor;
pub mod error;
pub mod event;
pub mod job;
pub mod protocol;
pub mod scheduler;
pub mod security;
pub mod supervisor;
pub mod workspace;

pub use error::{Result, TriadError};

use tracing::info;

/// Initialise a default tracing subscriber for the library consumer.
///
/// Call this once at program start. Uses `RUST_LOG` env var for filtering,
/// defaulting to `info` level.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt().with_env_filter(filter).init();

    info!("triad tracing initialised");
}
