//! Tracing initialisation for hosts
//!
//! The library only emits `tracing` events. Hosts that do not install a
//! subscriber of their own call `init_tracing` once at startup.

use serde::{Deserialize, Serialize};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Environment variable holding the filter directives
pub const LOG_ENV: &str = "MARIONETTE_LOG";

/// Log output configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Filter used when `MARIONETTE_LOG` is unset
    pub default_filter: String,
    /// One JSON object per line instead of human readable text
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            default_filter: "info".into(),
            json: false,
        }
    }
}

impl LogConfig {
    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(&self.default_filter))
    }
}

/// Install the global subscriber
///
/// Returns false if one was already installed.
pub fn init_tracing(config: &LogConfig) -> bool {
    let registry = tracing_subscriber::registry().with(config.filter());
    let installed = if config.json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init()
    };
    installed.is_ok()
}
