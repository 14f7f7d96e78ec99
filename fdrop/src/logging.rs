//! Diagnostics go to stderr through `tracing`; stdout is left for reports.

use std::{env, io};

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Filter directives, in `EnvFilter` syntax.
pub const LOG_ENV: &str = "FDROP_LOG";

/// Installs the process-wide subscriber. A second call is a no-op.
///
/// `FDROP_LOG` wins over the default level, which is `warn`, or `debug` when
/// `verbose` is set.
pub fn init(verbose: bool) {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| default_filter(verbose));
    let ansi = env::var_os("NO_COLOR").is_none();

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(io::stderr)
                .with_ansi(ansi)
                .with_target(false),
        )
        .try_init();
}

fn default_filter(verbose: bool) -> EnvFilter {
    EnvFilter::new(if verbose { "debug" } else { "warn" })
}

/// Subscriber for tests: everything at `debug`, captured per test.
pub fn init_for_tests() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(default_filter(true))
        .with_test_writer()
        .try_init();
}
