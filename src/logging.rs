//! Tracing subscriber setup

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

/// Filter used when `RUST_LOG` is unset
pub fn default_filter(level: &str) -> String {
    format!("conductor={},tower_http=debug", level)
}

/// Install the global subscriber. `RUST_LOG` wins over the configured level.
pub fn init_tracing(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(&config.level)));

    let registry = tracing_subscriber::registry().with(filter);
    let result = if config.format.eq_ignore_ascii_case("json") {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };

    if let Err(e) = result {
        eprintln!("Tracing already initialised: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter() {
        assert_eq!(default_filter("debug"), "conductor=debug,tower_http=debug");
        assert!(EnvFilter::try_new(default_filter("info")).is_ok());
    }
}
