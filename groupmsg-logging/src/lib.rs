//! Constants for categorizing the logging type
//!
//! To help stabilize logging targets, avoid typos and improve consistency,
//! it's preferable for logging statements use static target constants,
//! that we define in this module.
//!
//! Everything lives under the `gm::` namespace, with the queue's
//! sub-components nested below `gm::queue` so that e.g.
//! `RUST_LOG=gm::queue=debug` enables all of them at once.

use std::fs;
use std::io::IsTerminal;
use std::path::PathBuf;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

pub const LOG_DB: &str = "gm::db";
pub const LOG_TASK: &str = "gm::task";
pub const LOG_QUEUE: &str = "gm::queue";
pub const LOG_QUEUE_UPDATE: &str = "gm::queue::update";
pub const LOG_QUEUE_DELIVERY: &str = "gm::queue::delivery";
pub const LOG_TEST: &str = "gm::test";

/// Consolidates the setup of logging and tracing
///
/// The filter is built from a base level, any extra directives added through
/// [`TracingSetup::with_directive`] and finally `RUST_LOG`, so the
/// environment always has the last word.
#[derive(Default)]
pub struct TracingSetup {
    base_level: Option<String>,
    extra_directives: Option<String>,
    with_file: Option<PathBuf>,
}

impl TracingSetup {
    /// Sets the log level applied to most modules. Some overly chatty modules
    /// are muted even if this is set to a lower log level, use the `RUST_LOG`
    /// environment variable to override.
    pub fn with_base_level(&mut self, level: impl Into<String>) -> &mut Self {
        self.base_level = Some(level.into());
        self
    }

    /// Add a filtering directive.
    pub fn with_directive(&mut self, directive: &str) -> &mut Self {
        if let Some(old) = self.extra_directives.as_mut() {
            *old = format!("{old},{directive}");
        } else {
            self.extra_directives = Some(directive.to_owned());
        }
        self
    }

    /// Also write logs to `path`, without ANSI colors.
    pub fn with_file(&mut self, path: impl Into<PathBuf>) -> &mut Self {
        self.with_file = Some(path.into());
        self
    }

    /// Initialize the logging, must be called for tracing to begin
    pub fn init(&mut self) -> anyhow::Result<()> {
        let var = std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_default();

        let filter_layer = EnvFilter::builder().parse(format!(
            // We prefix everything with a default general log level and
            // good per-module specific default. User provided RUST_LOG
            // can override one or both
            "{},{},{}",
            self.base_level.as_deref().unwrap_or("info"),
            self.extra_directives.as_deref().unwrap_or(""),
            var
        ))?;

        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_thread_names(false)
            .with_ansi(std::io::stderr().is_terminal())
            .with_writer(std::io::stderr)
            .with_filter(filter_layer);

        let file_layer = match &self.with_file {
            Some(path) => {
                let file = fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)?;
                Some(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(std::sync::Mutex::new(file))
                        .with_filter(EnvFilter::builder().parse(format!(
                            "{},{}",
                            self.base_level.as_deref().unwrap_or("info"),
                            var
                        ))?),
                )
            }
            None => None,
        };

        tracing_subscriber::registry()
            .with(fmt_layer)
            .with(file_layer)
            .try_init()?;
        Ok(())
    }
}
