//! Tunable knobs for the pool, reconnection manager, cache and transfer engine.
//!
//! Mirrors the defaults named in the component design sections; a host may
//! override any field and persist the whole struct (it derives `Serialize`)
//! the same way the reference app persists its connection configs.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// §9 Open Question 1: the source shipped two coexisting reconnection
/// behaviors. Both are kept behind this one knob rather than guessing which
/// call site wanted which; `Exponential` is the default.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RetryPolicy {
    Exponential {
        #[serde(with = "duration_millis")]
        initial: Duration,
        factor: u32,
        #[serde(with = "duration_millis")]
        max_delay: Duration,
        #[serde(with = "duration_millis")]
        jitter: Duration,
        fast_reconnect_max_attempts: u32,
        #[serde(with = "duration_millis")]
        fast_reconnect_delay: Duration,
        adaptive_threshold: f64,
        adaptive_multiplier: f64,
    },
    FixedLegacy {
        #[serde(with = "duration_millis")]
        delay: Duration,
    },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::Exponential {
            initial: Duration::from_secs(1),
            factor: 2,
            max_delay: Duration::from_secs(16),
            jitter: Duration::from_secs(1),
            fast_reconnect_max_attempts: 2,
            fast_reconnect_delay: Duration::from_millis(500),
            adaptive_threshold: 0.7,
            adaptive_multiplier: 1.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CoreConfig {
    pub max_connections: usize,
    #[serde(with = "duration_millis")]
    pub idle_timeout: Duration,
    #[serde(with = "duration_millis")]
    pub health_check_interval: Duration,
    #[serde(with = "duration_millis")]
    pub connect_timeout: Duration,
    pub retry_policy: RetryPolicy,
    /// Binding invariant regardless of retry policy mode (§9).
    pub max_retries: u32,
    #[serde(with = "duration_millis")]
    pub directory_cache_ttl: Duration,
    #[serde(with = "duration_millis")]
    pub directory_cache_debounce: Duration,
    #[serde(with = "duration_millis")]
    pub directory_cache_refresh_timeout: Duration,
    pub sftp_chunk_size: usize,
    pub transfer_speed_ema_window: usize,
    #[serde(with = "duration_millis")]
    pub http_connect_timeout: Duration,
    #[serde(with = "duration_millis")]
    pub socks_connect_timeout: Duration,
    #[serde(with = "duration_millis")]
    pub ssh_keepalive_interval: Duration,
    pub ssh_keepalive_count_max: u32,
    #[serde(with = "duration_millis")]
    pub ssh_ready_timeout: Duration,
    #[serde(with = "duration_millis")]
    pub reconnect_validation_timeout: Duration,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            max_connections: 50,
            idle_timeout: Duration::from_secs(30 * 60),
            health_check_interval: Duration::from_secs(5 * 60),
            connect_timeout: Duration::from_secs(15),
            retry_policy: RetryPolicy::default(),
            max_retries: 5,
            directory_cache_ttl: Duration::from_secs(10),
            directory_cache_debounce: Duration::from_millis(300),
            directory_cache_refresh_timeout: Duration::from_secs(3),
            sftp_chunk_size: 32 * 1024,
            transfer_speed_ema_window: 10,
            http_connect_timeout: Duration::from_secs(15),
            socks_connect_timeout: Duration::from_secs(10),
            ssh_keepalive_interval: Duration::from_secs(15),
            ssh_keepalive_count_max: 6,
            ssh_ready_timeout: Duration::from_secs(12),
            reconnect_validation_timeout: Duration::from_secs(3),
        }
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
