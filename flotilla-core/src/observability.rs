//! Tracing setup and span helpers

use std::net::IpAddr;
use tracing::Span;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

const DEFAULT_FILTER: &str = "flotilla_core=info,flotilla_ssh=info";

/// Initialize tracing with environment-based configuration
///
/// `RUST_LOG` takes precedence over the built-in filter. Calling this twice
/// is harmless; the second subscriber is simply not installed.
pub fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let fmt_layer = fmt::layer().with_target(true).with_line_number(true);

    let _ = Registry::default().with(env_filter).with(fmt_layer).try_init();
}

/// Span for a single remote operation
#[inline]
pub fn host_span(operation: &str, host: IpAddr) -> Span {
    tracing::info_span!(
        "host",
        operation = %operation,
        host = %host,
        status = tracing::field::Empty,
    )
}

/// Span for a distribution stage over one mount directory
#[inline]
pub fn stage_span(stage: &str, layer: &str) -> Span {
    tracing::debug_span!("stage", stage = %stage, layer = %layer)
}
