//! Gateway Configuration Settings
//!
//! Configuration types for the gateway, loaded from environment variables.
//! Unparseable values fall back to defaults; structurally invalid values are
//! rejected.

use std::time::Duration;

use crate::domain::subscription::SubscriptionLimits;
use crate::resilience::fallback::FallbackConfig;
use crate::resilience::rate_limiter::RateLimitConfig;

/// Stream connection settings.
#[derive(Debug, Clone)]
pub struct StreamSettings {
    /// WebSocket endpoint.
    pub url: String,
    /// Maximum live subscription tickets.
    pub max_tickets: usize,
    /// Maximum data types per ticket.
    pub max_entries_per_ticket: usize,
    /// Base reconnect delay.
    pub reconnect_base: Duration,
    /// Reconnect delay cap.
    pub reconnect_max: Duration,
    /// Reconnect attempts before the connection is marked failed.
    pub reconnect_max_attempts: u32,
    /// Uptime after which the reconnect counter resets.
    pub stability_window: Duration,
    /// Bound on a single connect attempt.
    pub connect_timeout: Duration,
    /// Interval between pings.
    pub heartbeat_interval: Duration,
    /// Time a ping may go unanswered.
    pub heartbeat_timeout: Duration,
    /// Consecutive misses that force a reconnect.
    pub heartbeat_failure_threshold: u32,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            url: "wss://api.upbit.com/websocket/v1".to_string(),
            max_tickets: 5,
            max_entries_per_ticket: 8,
            reconnect_base: Duration::from_millis(250),
            reconnect_max: Duration::from_secs(5),
            reconnect_max_attempts: 10,
            stability_window: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(10),
            heartbeat_failure_threshold: 3,
        }
    }
}

impl StreamSettings {
    /// Ticket pool limits.
    #[must_use]
    pub const fn subscription_limits(&self) -> SubscriptionLimits {
        SubscriptionLimits {
            max_tickets: self.max_tickets,
            max_entries_per_ticket: self.max_entries_per_ticket,
        }
    }
}

/// Batch API settings.
#[derive(Debug, Clone)]
pub struct RestSettings {
    /// REST base URL.
    pub base_url: String,
    /// Per-request timeout.
    pub request_timeout: Duration,
}

impl Default for RestSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.upbit.com".to_string(),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Token bucket settings for each outbound path.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitSettings {
    /// Stream connect attempts.
    pub connect: RateLimitConfig,
    /// REST calls.
    pub rest: RateLimitConfig,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            connect: RateLimitConfig::connect(),
            rest: RateLimitConfig::rest(),
        }
    }
}

/// Persistent tier selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    /// Process-local store.
    Memory,
    /// SQLite database URL.
    Sqlite(String),
}

impl StoreBackend {
    /// Parse `GATEWAY_DATABASE_URL`.
    #[must_use]
    pub fn from_url(url: &str) -> Self {
        if url.trim().eq_ignore_ascii_case("memory") {
            Self::Memory
        } else {
            Self::Sqlite(url.trim().to_string())
        }
    }
}

/// Cache settings.
#[derive(Debug, Clone)]
pub struct CacheSettings {
    /// Memory ring capacity per series.
    pub memory_size: usize,
    /// Upstream page size.
    pub page_size: usize,
    /// Persistent tier.
    pub store: StoreBackend,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            memory_size: 200,
            page_size: 200,
            store: StoreBackend::Sqlite("sqlite://market_data.db?mode=rwc".to_string()),
        }
    }
}

/// Routing settings.
#[derive(Debug, Clone)]
pub struct RoutingSettings {
    /// Maximum age of the last stream delivery for the stream path.
    pub stream_recency: Duration,
    /// Fallback thresholds.
    pub fallback: FallbackConfig,
}

impl Default for RoutingSettings {
    fn default() -> Self {
        Self {
            stream_recency: Duration::from_secs(10),
            fallback: FallbackConfig::default(),
        }
    }
}

/// Service process settings.
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    /// Health check HTTP port.
    pub health_port: u16,
    /// Bound on draining background work at shutdown.
    pub shutdown_grace: Duration,
    /// Symbols subscribed at startup.
    pub watch_symbols: Vec<String>,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            health_port: 8083,
            shutdown_grace: Duration::from_secs(5),
            watch_symbols: Vec::new(),
        }
    }
}

/// Complete gateway configuration.
#[derive(Debug, Clone, Default)]
pub struct GatewayConfig {
    /// Stream connection settings.
    pub stream: StreamSettings,
    /// Batch API settings.
    pub rest: RestSettings,
    /// Rate limits.
    pub rate_limits: RateLimitSettings,
    /// Cache settings.
    pub cache: CacheSettings,
    /// Routing settings.
    pub routing: RoutingSettings,
    /// Process settings.
    pub service: ServiceSettings,
}

impl GatewayConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a value is structurally invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let stream = StreamSettings {
            url: parse_env_string("GATEWAY_WS_URL", &defaults.stream.url),
            max_tickets: parse_env_usize("GATEWAY_MAX_TICKETS", defaults.stream.max_tickets),
            max_entries_per_ticket: parse_env_usize(
                "GATEWAY_MAX_ENTRIES_PER_TICKET",
                defaults.stream.max_entries_per_ticket,
            ),
            reconnect_base: parse_env_duration_millis(
                "GATEWAY_RECONNECT_BASE_MS",
                defaults.stream.reconnect_base,
            ),
            reconnect_max: parse_env_duration_millis(
                "GATEWAY_RECONNECT_MAX_MS",
                defaults.stream.reconnect_max,
            ),
            reconnect_max_attempts: parse_env_u32(
                "GATEWAY_RECONNECT_MAX_ATTEMPTS",
                defaults.stream.reconnect_max_attempts,
            ),
            stability_window: parse_env_duration_secs(
                "GATEWAY_STABILITY_WINDOW_SECS",
                defaults.stream.stability_window,
            ),
            connect_timeout: parse_env_duration_secs(
                "GATEWAY_CONNECT_TIMEOUT_SECS",
                defaults.stream.connect_timeout,
            ),
            heartbeat_interval: parse_env_duration_secs(
                "GATEWAY_HEARTBEAT_INTERVAL_SECS",
                defaults.stream.heartbeat_interval,
            ),
            heartbeat_timeout: parse_env_duration_secs(
                "GATEWAY_HEARTBEAT_TIMEOUT_SECS",
                defaults.stream.heartbeat_timeout,
            ),
            heartbeat_failure_threshold: parse_env_u32(
                "GATEWAY_HEARTBEAT_FAILURE_THRESHOLD",
                defaults.stream.heartbeat_failure_threshold,
            ),
        };

        let rest = RestSettings {
            base_url: parse_env_string("GATEWAY_REST_URL", &defaults.rest.base_url),
            request_timeout: parse_env_duration_secs(
                "GATEWAY_REQUEST_TIMEOUT_SECS",
                defaults.rest.request_timeout,
            ),
        };

        let rate_limits = RateLimitSettings {
            connect: RateLimitConfig {
                capacity: parse_env_u32(
                    "GATEWAY_CONNECT_RATE_CAPACITY",
                    defaults.rate_limits.connect.capacity,
                ),
                refill_per_sec: parse_env_f64(
                    "GATEWAY_CONNECT_RATE_PER_SEC",
                    defaults.rate_limits.connect.refill_per_sec,
                ),
            },
            rest: RateLimitConfig {
                capacity: parse_env_u32(
                    "GATEWAY_REST_RATE_CAPACITY",
                    defaults.rate_limits.rest.capacity,
                ),
                refill_per_sec: parse_env_f64(
                    "GATEWAY_REST_RATE_PER_SEC",
                    defaults.rate_limits.rest.refill_per_sec,
                ),
            },
        };

        let cache = CacheSettings {
            memory_size: parse_env_usize("GATEWAY_CACHE_MEMORY_SIZE", defaults.cache.memory_size),
            page_size: parse_env_usize("GATEWAY_CACHE_PAGE_SIZE", defaults.cache.page_size),
            store: std::env::var("GATEWAY_DATABASE_URL")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map_or(defaults.cache.store, |v| StoreBackend::from_url(&v)),
        };

        let routing = RoutingSettings {
            stream_recency: parse_env_duration_secs(
                "GATEWAY_STREAM_RECENCY_SECS",
                defaults.routing.stream_recency,
            ),
            fallback: FallbackConfig {
                failure_threshold: parse_env_u32(
                    "GATEWAY_FALLBACK_FAILURE_THRESHOLD",
                    defaults.routing.fallback.failure_threshold,
                ),
                max_silence: parse_env_duration_secs(
                    "GATEWAY_FALLBACK_MAX_SILENCE_SECS",
                    defaults.routing.fallback.max_silence,
                ),
                reinit_interval: parse_env_duration_secs(
                    "GATEWAY_FALLBACK_REINIT_SECS",
                    defaults.routing.fallback.reinit_interval,
                ),
            },
        };

        let service = ServiceSettings {
            health_port: parse_env_u16("GATEWAY_HEALTH_PORT", defaults.service.health_port),
            shutdown_grace: parse_env_duration_secs(
                "GATEWAY_SHUTDOWN_GRACE_SECS",
                defaults.service.shutdown_grace,
            ),
            watch_symbols: std::env::var("GATEWAY_WATCH_SYMBOLS")
                .map(|v| parse_symbol_list(&v))
                .unwrap_or_default(),
        };

        let config = Self {
            stream,
            rest,
            rate_limits,
            cache,
            routing,
            service,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check structural constraints.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the offending variable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stream.max_tickets == 0 {
            return Err(ConfigError::Invalid {
                key: "GATEWAY_MAX_TICKETS".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.stream.max_entries_per_ticket == 0 {
            return Err(ConfigError::Invalid {
                key: "GATEWAY_MAX_ENTRIES_PER_TICKET".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.stream.url.is_empty() {
            return Err(ConfigError::EmptyValue("GATEWAY_WS_URL".to_string()));
        }
        if self.rest.base_url.is_empty() {
            return Err(ConfigError::EmptyValue("GATEWAY_REST_URL".to_string()));
        }
        if self.cache.page_size == 0 || self.cache.page_size > 200 {
            return Err(ConfigError::Invalid {
                key: "GATEWAY_CACHE_PAGE_SIZE".to_string(),
                reason: "must be between 1 and 200".to_string(),
            });
        }
        check_rate(
            "GATEWAY_CONNECT_RATE_CAPACITY",
            "GATEWAY_CONNECT_RATE_PER_SEC",
            self.rate_limits.connect,
        )?;
        check_rate(
            "GATEWAY_REST_RATE_CAPACITY",
            "GATEWAY_REST_RATE_PER_SEC",
            self.rate_limits.rest,
        )?;
        check_nonzero("GATEWAY_CONNECT_TIMEOUT_SECS", self.stream.connect_timeout)?;
        check_nonzero("GATEWAY_HEARTBEAT_INTERVAL_SECS", self.stream.heartbeat_interval)?;
        check_nonzero("GATEWAY_HEARTBEAT_TIMEOUT_SECS", self.stream.heartbeat_timeout)?;
        check_nonzero("GATEWAY_REQUEST_TIMEOUT_SECS", self.rest.request_timeout)?;
        if self.stream.heartbeat_failure_threshold == 0 {
            return Err(ConfigError::Invalid {
                key: "GATEWAY_HEARTBEAT_FAILURE_THRESHOLD".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

fn check_rate(capacity_key: &str, rate_key: &str, config: RateLimitConfig) -> Result<(), ConfigError> {
    if config.capacity == 0 {
        return Err(ConfigError::Invalid {
            key: capacity_key.to_string(),
            reason: "must be at least 1".to_string(),
        });
    }
    if !config.refill_per_sec.is_finite() || config.refill_per_sec <= 0.0 {
        return Err(ConfigError::Invalid {
            key: rate_key.to_string(),
            reason: "must be a positive number".to_string(),
        });
    }
    Ok(())
}

fn check_nonzero(key: &str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::Invalid {
            key: key.to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(())
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable has an unusable value.
    #[error("invalid value for {key}: {reason}")]
    Invalid {
        /// Variable name.
        key: String,
        /// What is wrong with it.
        reason: String,
    },
}

/// Split a comma separated symbol list, dropping blanks.
#[must_use]
pub fn parse_symbol_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_env_string(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_env_u16(key: &str, default: u16) -> u16 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .filter(|v: &f64| v.is_finite() && *v > 0.0)
        .unwrap_or(default)
}

fn parse_env_duration_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map_or(default, Duration::from_secs)
}

fn parse_env_duration_millis(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map_or(default, Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn stream_settings_defaults() {
        let settings = StreamSettings::default();
        assert_eq!(settings.max_tickets, 5);
        assert_eq!(settings.reconnect_base, Duration::from_millis(250));
        assert_eq!(settings.reconnect_max, Duration::from_secs(5));
        assert_eq!(settings.heartbeat_failure_threshold, 3);
        assert_eq!(settings.subscription_limits().max_entries_per_ticket, 8);
    }

    #[test]
    fn rate_limit_defaults_follow_exchange_rules() {
        let settings = RateLimitSettings::default();
        assert_eq!(settings.connect.capacity, 5);
        assert_eq!(settings.rest.capacity, 10);
    }

    #[test]
    fn store_backend_parsing() {
        assert_eq!(StoreBackend::from_url("memory"), StoreBackend::Memory);
        assert_eq!(StoreBackend::from_url(" MEMORY "), StoreBackend::Memory);
        assert_eq!(
            StoreBackend::from_url("sqlite::memory:"),
            StoreBackend::Sqlite("sqlite::memory:".to_string())
        );
    }

    #[test]
    fn zero_tickets_rejected() {
        let mut config = GatewayConfig::default();
        config.stream.max_tickets = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("GATEWAY_MAX_TICKETS"));
    }

    #[test_case(0.0 ; "zero")]
    #[test_case(-2.5 ; "negative")]
    #[test_case(f64::NAN ; "not a number")]
    #[test_case(f64::INFINITY ; "infinite")]
    fn unusable_rest_rate_rejected(rate: f64) {
        let mut config = GatewayConfig::default();
        config.rate_limits.rest.refill_per_sec = rate;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("GATEWAY_REST_RATE_PER_SEC"));
    }

    #[test]
    fn zero_connect_capacity_rejected() {
        let mut config = GatewayConfig::default();
        config.rate_limits.connect.capacity = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("GATEWAY_CONNECT_RATE_CAPACITY"));
    }

    #[test]
    fn zero_heartbeat_durations_rejected() {
        let mut config = GatewayConfig::default();
        config.stream.heartbeat_interval = Duration::ZERO;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("GATEWAY_HEARTBEAT_INTERVAL_SECS"));

        let mut config = GatewayConfig::default();
        config.stream.heartbeat_timeout = Duration::ZERO;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("GATEWAY_HEARTBEAT_TIMEOUT_SECS"));
    }

    #[test]
    fn oversized_page_rejected() {
        let mut config = GatewayConfig::default();
        config.cache.page_size = 500;
        assert!(config.validate().is_err());
        config.cache.page_size = 200;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn symbol_list_parsing() {
        assert_eq!(
            parse_symbol_list("krw-btc, KRW-ETH,,"),
            vec!["KRW-BTC".to_string(), "KRW-ETH".to_string()]
        );
        assert!(parse_symbol_list("").is_empty());
    }

    #[test]
    fn service_settings_defaults() {
        let settings = ServiceSettings::default();
        assert_eq!(settings.health_port, 8083);
        assert_eq!(settings.shutdown_grace, Duration::from_secs(5));
    }
}
