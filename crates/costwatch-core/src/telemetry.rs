//! Tracing subscriber setup for binaries and tests embedding the engine.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Default filter when `RUST_LOG` is unset.
pub const DEFAULT_DIRECTIVE: &str = "costwatch_core=info,costwatch_orchestrator=info,warn";

/// Installs a global subscriber: `RUST_LOG` (or `default_directive`) filtering
/// into a human-readable or JSON formatter on stderr.
///
/// Returns `false` if a global subscriber was already installed.
pub fn init_tracing(default_directive: &str, json: bool) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| fmt::layer().json().with_writer(std::io::stderr)))
        .with((!json).then(|| fmt::layer().with_writer(std::io::stderr)))
        .try_init()
        .is_ok()
}
