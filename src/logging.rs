//! Structured logging to stderr.
//!
//! Stdout belongs to command output (reports, extracted JSON), so every
//! tracing event goes to stderr. The filter comes from `MULTIGEN_LOG`, then
//! `RUST_LOG`, then the verbosity flag.

use std::sync::OnceLock;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Install the global subscriber once. Later calls are no-ops.
pub fn init_logging(verbose: bool) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let directives = log_directives(
            std::env::var("MULTIGEN_LOG").ok(),
            std::env::var("RUST_LOG").ok(),
            verbose,
        );

        let subscriber = tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(verbose)
                    .with_level(true),
            )
            .with(EnvFilter::new(directives));

        // Another subscriber (e.g. a test harness) may already be installed.
        if subscriber.try_init().is_err() {
            tracing::debug!("global tracing subscriber already set");
        }
    });
}

fn log_directives(multigen: Option<String>, rust_log: Option<String>, verbose: bool) -> String {
    multigen
        .filter(|d| !d.trim().is_empty())
        .or_else(|| rust_log.filter(|d| !d.trim().is_empty()))
        .unwrap_or_else(|| {
            if verbose {
                "multigen=debug,info".to_string()
            } else {
                "multigen=info,warn".to_string()
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_directives_win() {
        assert_eq!(
            log_directives(Some("trace".into()), Some("warn".into()), false),
            "trace"
        );
        assert_eq!(log_directives(None, Some("warn".into()), true), "warn");
        assert_eq!(log_directives(Some(" ".into()), None, true), "multigen=debug,info");
        assert_eq!(log_directives(None, None, false), "multigen=info,warn");
    }

    #[test]
    fn init_is_idempotent() {
        init_logging(false);
        init_logging(true);
    }
}
