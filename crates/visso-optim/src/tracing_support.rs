//! Structured logging for optimizer runs
//!
//! Every training step runs inside a `vi_step` span and every prediction
//! inside a `vi_prediction` span; events inside them (`trace` per Monte-Carlo
//! draw, `warn` on likelihood underflow or a rejected update, `debug` per
//! accepted step) inherit the step counters as fields. [`init_tracing`]
//! installs a subscriber for binaries that do not bring their own and, when
//! asked, reports the duration of each span as it closes.
//!
//! # Example
//!
//! ```ignore
//! use visso_optim::tracing_support::{init_tracing, TracingConfig};
//!
//! init_tracing(TracingConfig {
//!     filter: "visso_optim=debug".to_string(),
//!     span_timings: true,
//!     ..TracingConfig::default()
//! })?;
//! ```
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: filter directive (default `visso_optim=info,warn`)
//! - `VISSO_LOG_FORMAT`: `json` for one JSON object per event, anything else
//!   for compact lines

use anyhow::Result;
use tracing::{debug, debug_span, Span};
#[cfg(feature = "subscriber")]
use tracing_subscriber::{fmt, fmt::format::FmtSpan, EnvFilter};

/// Subscriber settings for [`init_tracing`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracingConfig {
    /// `EnvFilter` directive
    pub filter: String,
    pub json: bool,
    /// Emit an event with the elapsed time whenever a step or prediction span closes
    pub span_timings: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        let json = std::env::var("VISSO_LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));
        let filter =
            std::env::var("RUST_LOG").unwrap_or_else(|_| "visso_optim=info,warn".to_string());
        Self {
            filter,
            json,
            span_timings: false,
        }
    }
}

/// Install a global subscriber; call once at startup
#[cfg(feature = "subscriber")]
pub fn init_tracing(config: TracingConfig) -> Result<()> {
    let span_events = if config.span_timings {
        FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };
    let builder = fmt()
        .with_env_filter(EnvFilter::try_new(&config.filter)?)
        .with_span_events(span_events);
    if config.json {
        builder.json().try_init().map_err(|e| anyhow::anyhow!(e))?;
    } else {
        builder.compact().try_init().map_err(|e| anyhow::anyhow!(e))?;
    }
    Ok(())
}

/// Stub for when the `subscriber` feature is disabled
#[cfg(not(feature = "subscriber"))]
pub fn init_tracing(_config: TracingConfig) -> Result<()> {
    Ok(())
}

/// Span around one call of [`crate::ViOptimizer::step`]
pub(crate) fn step_span(step: u64, acc_step: usize, draws: usize) -> Span {
    debug_span!("vi_step", step, acc_step, draws)
}

/// Span around one call of [`crate::ViOptimizer::prediction`]
pub(crate) fn prediction_span(step: u64, draws: usize) -> Span {
    debug_span!("vi_prediction", step, draws)
}

/// Record an accepted posterior update
pub(crate) fn record_step(step: u64, loss: f64, kl_weighting: f64) {
    debug!(step, loss, kl_weighting, "posterior updated");
}
