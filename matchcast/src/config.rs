//! Configuration types and defaults

use matchcast_core::{default_ice_servers, IceServerConfig};
use matchcast_media::CaptureConstraints;
use std::time::Duration;

/// Global matchcast configuration
#[derive(Debug, Clone)]
pub struct GlobalConfig {
    /// Enable debug logging
    pub debug_logging: bool,
    /// Filter used when `RUST_LOG` is not set
    pub log_filter: String,
    /// Servers used for network path discovery by every peer
    pub ice_servers: Vec<IceServerConfig>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            debug_logging: false,
            log_filter: "info".to_string(),
            ice_servers: default_ice_servers(),
        }
    }
}

/// Viewer-side configuration
#[derive(Debug, Clone)]
pub struct ViewerConfig {
    /// Wait between subscribing to the inbox and publishing the viewer request
    pub request_delay: Duration,
    /// Servers used for network path discovery
    pub ice_servers: Vec<IceServerConfig>,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            request_delay: Duration::from_millis(500),
            ice_servers: default_ice_servers(),
        }
    }
}

/// Broadcaster-side configuration
#[derive(Debug, Clone)]
pub struct BroadcasterConfig {
    /// A repeated request from a viewer with a peer younger than this is ignored
    pub request_debounce: Duration,
    /// Room rewrite interval while live
    pub heartbeat_interval: Duration,
    /// Upper bound for the interval after throttling backoff
    pub max_heartbeat_interval: Duration,
    /// What to acquire from the camera source
    pub capture: CaptureConstraints,
    /// Servers used for network path discovery
    pub ice_servers: Vec<IceServerConfig>,
}

impl Default for BroadcasterConfig {
    fn default() -> Self {
        Self {
            request_debounce: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(10),
            max_heartbeat_interval: Duration::from_secs(120),
            capture: CaptureConstraints::default(),
            ice_servers: default_ice_servers(),
        }
    }
}
