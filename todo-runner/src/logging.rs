//! Diagnostic tracing for the CLI.
//!
//! Tracing goes to stderr and is for whoever is debugging a run. What a run
//! did for its users is recorded separately as run events (`io/events`),
//! which reach the event sink regardless of the filter set here.

use anyhow::{Context, Result};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when `RUST_LOG` is unset. Dependencies stay at `warn`.
pub fn default_directives(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn",
        1 => "warn,todo_runner=info",
        _ => "warn,todo_runner=debug",
    }
}

/// Install the stderr subscriber.
///
/// `RUST_LOG` overrides `verbosity` when set. Event targets are printed from
/// `-vv` up, where records from the executor and the agents interleave.
///
/// ```bash
/// RUST_LOG=todo_runner::agents=debug todo-runner validate-plan plan.json
/// ```
pub fn init(verbosity: u8) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(verbosity)));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(verbosity > 1)
                .compact(),
        )
        .try_init()
        .context("install tracing subscriber")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_only_raises_the_crate_level() {
        assert_eq!(default_directives(0), "warn");
        assert_eq!(default_directives(1), "warn,todo_runner=info");
        assert_eq!(default_directives(2), "warn,todo_runner=debug");
        assert_eq!(default_directives(7), default_directives(2));
        for verbosity in 0..3 {
            assert!(default_directives(verbosity).parse::<EnvFilter>().is_ok());
        }
    }
}
