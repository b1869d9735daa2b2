use std::io::IsTerminal;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;

const LOG_ENV_VAR: &str = "KELVIN_LOG";

/// Initializes the logging system. Per-subsystem traces are gated by
/// the `KELVIN_LOG` filter (for example `kelvin_gc=trace`); enabling
/// them never changes program behaviour.
pub(crate) fn initialize() {
    if std::env::var_os(LOG_ENV_VAR).is_none() {
        return;
    }

    let enable_ansi = std::io::stderr().is_terminal();
    let format = tracing_subscriber::fmt::format()
        .with_ansi(enable_ansi)
        .with_level(true)
        .with_target(true)
        .with_timer(fmt::time::uptime())
        .compact();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_env(LOG_ENV_VAR))
        .with_writer(std::io::stderr)
        .event_format(format)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initialize_without_env_is_a_no_op() {
        // Just checks the early-out path does not panic.
        initialize();
    }
}
