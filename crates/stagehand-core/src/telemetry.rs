//! Tracing setup for embedders and tests.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when `RUST_LOG` is not set.
pub const DEFAULT_DIRECTIVE: &str = "stagehand_core=debug,stagehand_delegate=info,info";

/// Output format of the installed subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Pretty,
    /// One JSON object per event.
    Json,
}

/// Installs a global tracing subscriber.
///
/// `RUST_LOG` takes precedence over `default_directive`. Calling this more than
/// once is harmless: later calls leave the first subscriber in place.
///
/// # Returns
/// `true` if this call installed the subscriber.
pub fn init_tracing(default_directive: &str, format: LogFormat) -> bool {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_directive.into());

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).try_init().is_ok(),
        LogFormat::Json => {
            registry.with(tracing_subscriber::fmt::layer().json()).try_init().is_ok()
        }
    }
}
