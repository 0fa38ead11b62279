//! Constants for categorizing the logging type
//!
//! Every `tracing` call in the workspace should carry one of these as its
//! `target:` so that output can be filtered per subsystem, e.g.
//! `RUST_LOG=otx::client::ledger=trace`.

use anyhow::format_err;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

pub const LOG_CORE: &str = "otx::core";
pub const LOG_TASK: &str = "otx::core::task";
pub const LOG_CLIENT_SESSION: &str = "otx::client::session";
pub const LOG_CLIENT_DELIVERY: &str = "otx::client::delivery";
pub const LOG_CLIENT_LEDGER: &str = "otx::client::ledger";
pub const LOG_CLIENT_NYMBOX: &str = "otx::client::nymbox";
pub const LOG_CLIENT_DISPATCH: &str = "otx::client::dispatch";
pub const LOG_CLIENT_DB: &str = "otx::client::db";
pub const LOG_TEST: &str = "otx::test";

/// Consolidates the setup of the global tracing subscriber
///
/// ```no_run
/// otx_logging::TracingSetup::default()
///     .with_directive("otx::client::ledger=trace")
///     .init()
///     .expect("tracing initialized once");
/// ```
#[derive(Default)]
pub struct TracingSetup {
    base_level: Option<String>,
    extra_directives: Option<String>,
    with_span_events: bool,
}

impl TracingSetup {
    /// Directive used when `RUST_LOG` is not set (defaults to `info`)
    pub fn with_base_level(&mut self, level: impl Into<String>) -> &mut Self {
        self.base_level = Some(level.into());
        self
    }

    /// Add a filter directive on top of `RUST_LOG`
    pub fn with_directive(&mut self, directive: &str) -> &mut Self {
        if let Some(old) = self.extra_directives.as_mut() {
            *old = format!("{old},{directive}");
        } else {
            self.extra_directives = Some(directive.to_owned());
        }
        self
    }

    /// Log span close events (with their busy/idle timings)
    pub fn with_span_events(&mut self, enabled: bool) -> &mut Self {
        self.with_span_events = enabled;
        self
    }

    /// Initialize the global subscriber
    ///
    /// Fails if a global subscriber was already installed.
    pub fn init(&mut self) -> anyhow::Result<()> {
        let var = std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_default();
        let filter_layer = EnvFilter::builder().parse(if var.is_empty() {
            self.base_level.as_deref().unwrap_or("info")
        } else {
            var.as_str()
        })?;
        let filter_layer = match self.extra_directives.as_deref() {
            Some(directives) => directives
                .split(',')
                .filter(|d| !d.is_empty())
                .try_fold(filter_layer, |filter, directive| {
                    Ok::<_, anyhow::Error>(filter.add_directive(directive.parse()?))
                })?,
            None => filter_layer,
        };

        let span_events = if self.with_span_events {
            FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };

        tracing_subscriber::fmt()
            .with_env_filter(filter_layer)
            .with_span_events(span_events)
            .with_writer(std::io::stderr)
            .try_init()
            .map_err(|e| format_err!("Failed to initialize tracing: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directives_accumulate() {
        let mut setup = TracingSetup::default();
        setup
            .with_directive("otx::client=debug")
            .with_directive("")
            .with_directive("otx::core::task=trace");
        assert_eq!(
            setup.extra_directives.as_deref(),
            Some("otx::client=debug,,otx::core::task=trace")
        );
    }
}
