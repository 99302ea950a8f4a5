//! Timing and limit configuration for every component.
//!
//! Defaults match the behaviour operators expect out of the box; each
//! struct can be overridden from `MULTIVIEW_*` environment variables.

use std::time::Duration;

/// Public STUN server used for relay discovery.
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Maximum number of sources one aggregator displays at once.
pub const MAX_SOURCES: usize = 12;

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.trim().parse::<u64>().ok())
}

fn env_millis(name: &str, default: Duration) -> Duration {
    env_u64(name).map(Duration::from_millis).unwrap_or(default)
}

/// Capture agent discovery and track-readiness policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureConfig {
    /// Discovery polls before the agent gives up.
    pub discovery_attempts: u32,
    pub discovery_interval: Duration,
    /// Delay before re-asking the producer when it yielded no tracks, and
    /// before restarting after a lost connection or an ended track.
    pub track_retry_delay: Duration,
    /// Retries allowed per start, and restarts allowed between answers.
    pub track_retry_limit: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            discovery_attempts: 90,
            discovery_interval: Duration::from_secs(1),
            track_retry_delay: Duration::from_secs(1),
            track_retry_limit: 10,
        }
    }
}

impl CaptureConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            discovery_attempts: env_u64("MULTIVIEW_DISCOVERY_ATTEMPTS")
                .map(|v| v.clamp(1, u32::MAX as u64) as u32)
                .unwrap_or(defaults.discovery_attempts),
            discovery_interval: env_millis(
                "MULTIVIEW_DISCOVERY_INTERVAL_MS",
                defaults.discovery_interval,
            ),
            track_retry_delay: env_millis(
                "MULTIVIEW_TRACK_RETRY_DELAY_MS",
                defaults.track_retry_delay,
            ),
            track_retry_limit: env_u64("MULTIVIEW_TRACK_RETRY_LIMIT")
                .map(|v| v.min(u32::MAX as u64) as u32)
                .unwrap_or(defaults.track_retry_limit),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Wait between injecting the capture capability and the retry.
    pub settle_delay: Duration,
    pub max_capture_targets: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_millis(500),
            max_capture_targets: MAX_SOURCES,
        }
    }
}

impl RelayConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            settle_delay: env_millis("MULTIVIEW_SETTLE_DELAY_MS", defaults.settle_delay),
            max_capture_targets: env_u64("MULTIVIEW_MAX_SOURCES")
                .map(|v| v as usize)
                .unwrap_or(defaults.max_capture_targets)
                .max(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregatorConfig {
    pub reconcile_interval: Duration,
    pub max_streams: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            reconcile_interval: Duration::from_secs(8),
            max_streams: MAX_SOURCES,
        }
    }
}

impl AggregatorConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            reconcile_interval: env_millis(
                "MULTIVIEW_RECONCILE_INTERVAL_MS",
                defaults.reconcile_interval,
            )
            .max(Duration::from_millis(100)),
            max_streams: env_u64("MULTIVIEW_MAX_SOURCES")
                .map(|v| v as usize)
                .unwrap_or(defaults.max_streams)
                .max(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceConfig {
    pub stun_servers: Vec<String>,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec![DEFAULT_STUN_SERVER.to_string()],
        }
    }
}

impl IceConfig {
    /// `MULTIVIEW_STUN_SERVERS` is a comma separated list of `stun:` urls.
    pub fn from_env() -> Self {
        match std::env::var("MULTIVIEW_STUN_SERVERS") {
            Ok(value) => {
                let stun_servers: Vec<String> = value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect();
                if stun_servers.is_empty() {
                    Self::default()
                } else {
                    Self { stun_servers }
                }
            }
            Err(_) => Self::default(),
        }
    }
}
