//! Logging configuration surface.
//!
//! All diagnostics go through `tracing`. [`init`] translates the
//! configured [`LogLevel`] and [`Verbosity`] into an env-filter directive
//! and installs a default subscriber; embedding applications that manage
//! their own subscriber can skip it — [`init`] is a no-op once a global
//! subscriber exists.

use tracing_subscriber::EnvFilter;

/// Coarse log level of the kernel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    #[default]
    Warning,
    Error,
    Fatal,
}

/// Debug verbosity grades, effective only at [`LogLevel::Debug`].
/// `Trace` and `Info` keep flow tracing off; `Detail` and above enable the
/// scheduler's per-decision trace lines (`CAUSALITY`, `RELEVANCE`,
/// `WITNESS`, `PATTERN`).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verbosity {
    Trace,
    #[default]
    Info,
    Detail,
    Dump,
    Max,
}

/// The env-filter directive for a level/verbosity pair.
#[must_use]
pub fn filter_directive(level: LogLevel, verbosity: Verbosity) -> &'static str {
    match level {
        LogLevel::Debug => {
            if verbosity >= Verbosity::Detail {
                "reflexgraph=trace"
            } else {
                "reflexgraph=debug"
            }
        }
        LogLevel::Info => "reflexgraph=info",
        LogLevel::Warning => "reflexgraph=warn",
        LogLevel::Error | LogLevel::Fatal => "reflexgraph=error",
    }
}

/// Install a default subscriber honouring the configured level. Does
/// nothing when a global subscriber is already set.
pub fn init(level: LogLevel, verbosity: Verbosity) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter_directive(level, verbosity)))
        .try_init();
}
