//! Tracing subscriber setup

use crate::GlobalConfig;
use matchcast_core::MatchcastError;
use tracing_subscriber::EnvFilter;

/// Install a formatting subscriber for the process
///
/// `RUST_LOG` wins when set; otherwise `debug` if `debug_logging` is on, or
/// `log_filter`. Fails if a global subscriber is already installed.
pub fn init_logging(config: &GlobalConfig) -> Result<(), MatchcastError> {
    let fallback = if config.debug_logging {
        "debug"
    } else {
        config.log_filter.as_str()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| MatchcastError::Initialization {
            reason: format!("Failed to install tracing subscriber: {}", e),
        })?;

    tracing::debug!("Logging initialised");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_fails() {
        let config = GlobalConfig::default();
        let _ = init_logging(&config);
        let err = init_logging(&config).unwrap_err();
        assert_eq!(err.error_code(), "INITIALIZATION_FAILED");
    }
}
