//! Timing helpers and subscriber setup for stagechain logs.
//!
//! The library itself only emits `tracing` events; installing a subscriber
//! is left to the application, which may use [`init_tracing`] for a
//! sensible default.

use crate::config::TracingConfig;
use std::time::Instant;
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{fmt, EnvFilter};

/// Measures the wall time of a stage or invocation.
#[derive(Debug)]
pub struct SpanTimer {
    start: Instant,
    name: String,
}

impl SpanTimer {
    /// Starts a new span timer.
    #[must_use]
    pub fn start(name: impl Into<String>) -> Self {
        Self {
            start: Instant::now(),
            name: name.into(),
        }
    }

    /// Returns the elapsed time in milliseconds.
    #[must_use]
    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }

    /// Returns the span name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Finishes the span and returns the duration.
    #[must_use]
    pub fn finish(self) -> f64 {
        self.elapsed_ms()
    }
}

/// Error returned by [`init_tracing`].
#[derive(Debug, Error)]
pub enum TracingInitError {
    /// The fallback filter directive does not parse.
    #[error("invalid log filter: {0}")]
    Filter(#[from] tracing_subscriber::filter::ParseError),

    /// A global subscriber is already installed.
    #[error("failed to install subscriber: {0}")]
    Install(#[from] TryInitError),
}

/// Installs a global `fmt` subscriber.
///
/// `RUST_LOG` takes precedence over `config.filter` when set.
pub fn init_tracing(config: &TracingConfig) -> Result<(), TracingInitError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.filter)?,
    };
    let registry = tracing_subscriber::registry().with(filter);

    if config.json {
        registry
            .with(fmt::layer().json().with_target(config.with_target))
            .try_init()?;
    } else {
        registry
            .with(fmt::layer().with_target(config.with_target))
            .try_init()?;
    }
    Ok(())
}
