//! Gateway configuration
//!
//! Configuration comes from:
//! 1. Built-in defaults (`Config::default()`)
//! 2. `WSD_*` environment variables, applied as a lowercase key map
//!
//! `Config::apply` takes the key map directly so the same parsing runs for
//! the process environment and for tests.

use std::collections::HashMap;
use std::time::Duration;

use crate::client::ClientSettings;
use crate::dispatch::{AckLevel, RouteTable};
use crate::gateway::SocketLimits;
use crate::protocol::EventFamily;
use crate::ratelimit::{self, LimiterBackend, RateLimitPolicy, RateLimitScope};

/// Environment variable prefix
pub const ENV_PREFIX: &str = "WSD_";

/// Rate-limit policy applied to inbound socket frames
pub const WS_INBOUND_POLICY: &str = "ws_inbound";

/// Rate-limit policy applied to push RPCs, keyed by target connection
pub const PUSH_RPC_POLICY: &str = "push_rpc";

/// Gateway configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP listen address for the WebSocket endpoint
    pub http_addr: String,
    /// gRPC listen address for the push gateway
    pub grpc_addr: String,
    /// Identifier of this gateway process in the connection registry
    pub instance_id: String,
    /// Redis connection string; in-memory registry when absent
    pub redis_url: Option<String>,
    /// Key prefix for registry and limiter keys
    pub redis_prefix: String,
    /// Kafka bootstrap servers; in-memory event sink when absent
    pub kafka_brokers: Option<String>,
    /// Shared secret for handshake tokens
    pub token_secret: Option<String>,
    pub write_buffer_size: usize,
    pub max_message_size: usize,
    pub idle_read_timeout: Duration,
    pub write_timeout: Duration,
    pub ping_period: Duration,
    /// Per-connection outbound queue capacity
    pub outbound_queue_capacity: usize,
    pub worker_count: usize,
    /// Capacity of each worker's hub channels
    pub channel_capacity: usize,
    /// Bounded wait for a hub registration slot
    pub register_timeout: Duration,
    pub max_connections_per_user: usize,
    pub registry_ttl: Duration,
    pub registry_heartbeat: Duration,
    pub rate_limits: Vec<RateLimitPolicy>,
    pub rate_limit_scope: RateLimitScope,
    /// Consecutive rate-limit violations before the socket is closed (0 = never)
    pub max_rate_violations: u32,
    /// Extra publish attempts for ack-required topics
    pub publish_retries: u32,
    pub publish_backoff: Duration,
    /// Bound on one acknowledged publish
    pub publish_timeout: Duration,
    pub routes: RouteTable,
}

impl Default for Config {
    fn default() -> Self {
        let worker_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        Self {
            http_addr: "0.0.0.0:8080".to_string(),
            grpc_addr: "0.0.0.0:50061".to_string(),
            instance_id: uuid::Uuid::new_v4().to_string(),
            redis_url: None,
            redis_prefix: "wsd".to_string(),
            kafka_brokers: None,
            token_secret: None,
            write_buffer_size: 4096,
            max_message_size: 64 * 1024,
            idle_read_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(10),
            ping_period: Duration::from_secs(54),
            outbound_queue_capacity: 256,
            worker_count,
            channel_capacity: 1024,
            register_timeout: Duration::from_secs(2),
            max_connections_per_user: 5,
            registry_ttl: Duration::from_secs(90),
            registry_heartbeat: Duration::from_secs(30),
            rate_limits: vec![
                RateLimitPolicy::new(WS_INBOUND_POLICY, 30, Duration::from_secs(1)),
                RateLimitPolicy::new(PUSH_RPC_POLICY, 100, Duration::from_secs(1))
                    .with_backend(LimiterBackend::Redis),
            ],
            rate_limit_scope: RateLimitScope::Connection,
            max_rate_violations: 10,
            publish_retries: 3,
            publish_backoff: Duration::from_millis(100),
            publish_timeout: Duration::from_secs(5),
            routes: RouteTable::default(),
        }
    }
}

impl Config {
    /// Create config from `WSD_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let vars: HashMap<String, String> = std::env::vars()
            .filter_map(|(key, value)| {
                key.strip_prefix(ENV_PREFIX)
                    .map(|k| (k.to_lowercase(), value))
            })
            .collect();

        let mut config = Self::default();
        config.apply(&vars)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a lowercase key map (`WSD_` prefix stripped)
    pub fn apply(&mut self, vars: &HashMap<String, String>) -> Result<(), ConfigError> {
        if let Some(addr) = non_empty(vars, "http_addr") {
            self.http_addr = addr;
        }
        if let Some(addr) = non_empty(vars, "grpc_addr") {
            self.grpc_addr = addr;
        }
        if let Some(id) = non_empty(vars, "instance_id") {
            self.instance_id = id;
        }
        if let Some(url) = non_empty(vars, "redis_url") {
            self.redis_url = Some(url);
        }
        if let Some(prefix) = non_empty(vars, "redis_prefix") {
            self.redis_prefix = prefix;
        }
        if let Some(brokers) = non_empty(vars, "kafka_brokers") {
            self.kafka_brokers = Some(brokers);
        }
        if let Some(secret) = non_empty(vars, "token_secret") {
            self.token_secret = Some(secret);
        }

        if let Some(n) = parse(vars, "write_buffer_size")? {
            self.write_buffer_size = n;
        }
        if let Some(n) = parse(vars, "max_message_size")? {
            self.max_message_size = n;
        }
        if let Some(ms) = parse(vars, "idle_read_timeout_ms")? {
            self.idle_read_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse(vars, "write_timeout_ms")? {
            self.write_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse(vars, "ping_period_ms")? {
            self.ping_period = Duration::from_millis(ms);
        }
        if let Some(n) = parse(vars, "outbound_queue_capacity")? {
            self.outbound_queue_capacity = n;
        }
        if let Some(n) = parse(vars, "worker_count")? {
            self.worker_count = n;
        }
        if let Some(n) = parse(vars, "channel_capacity")? {
            self.channel_capacity = n;
        }
        if let Some(ms) = parse(vars, "register_timeout_ms")? {
            self.register_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = parse(vars, "max_connections_per_user")? {
            self.max_connections_per_user = n;
        }
        if let Some(secs) = parse(vars, "registry_ttl_secs")? {
            self.registry_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = parse(vars, "registry_heartbeat_secs")? {
            self.registry_heartbeat = Duration::from_secs(secs);
        }

        if let Some(table) = vars.get("rate_limits") {
            let policies = ratelimit::parse_policies(table)
                .map_err(|e| ConfigError::InvalidEnv("WSD_RATE_LIMITS".to_string(), e.to_string()))?;
            for policy in policies {
                match self.rate_limits.iter_mut().find(|p| p.name == policy.name) {
                    Some(existing) => *existing = policy,
                    None => self.rate_limits.push(policy),
                }
            }
        }
        if let Some(scope) = vars.get("rate_limit_scope") {
            self.rate_limit_scope = scope.parse().map_err(|_| {
                ConfigError::InvalidEnv(
                    "WSD_RATE_LIMIT_SCOPE".to_string(),
                    "expected connection or user".to_string(),
                )
            })?;
        }
        if let Some(n) = parse(vars, "max_rate_violations")? {
            self.max_rate_violations = n;
        }
        if let Some(n) = parse(vars, "publish_retries")? {
            self.publish_retries = n;
        }
        if let Some(ms) = parse(vars, "publish_backoff_ms")? {
            self.publish_backoff = Duration::from_millis(ms);
        }
        if let Some(ms) = parse(vars, "publish_timeout_ms")? {
            self.publish_timeout = Duration::from_millis(ms);
        }

        for family in EventFamily::ALL {
            let name = family.as_str();
            let mut route = self.routes.get(family).clone();

            if let Some(topic) = non_empty(vars, &format!("topic_{name}")) {
                route.topic = topic;
            }
            if let Some(ack) = vars.get(&format!("ack_{name}")) {
                route.ack = ack.parse::<AckLevel>().map_err(|_| {
                    ConfigError::InvalidEnv(
                        format!("WSD_ACK_{}", name.to_uppercase()),
                        "expected none, leader or all".to_string(),
                    )
                })?;
            }
            if let Some(keyed) = vars.get(&format!("keyed_{name}")) {
                route.keyed = parse_bool(keyed);
            }

            self.routes.set(family, route);
        }

        Ok(())
    }

    /// Check invariants that defaults cannot guarantee
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.token_secret.is_none() {
            return Err(ConfigError::MissingEnv("WSD_TOKEN_SECRET"));
        }
        if self.worker_count == 0 {
            return Err(invalid("WSD_WORKER_COUNT", "must be at least 1"));
        }
        if self.channel_capacity == 0 {
            return Err(invalid("WSD_CHANNEL_CAPACITY", "must be at least 1"));
        }
        if self.outbound_queue_capacity == 0 {
            return Err(invalid("WSD_OUTBOUND_QUEUE_CAPACITY", "must be at least 1"));
        }
        if self.max_connections_per_user == 0 {
            return Err(invalid("WSD_MAX_CONNECTIONS_PER_USER", "must be at least 1"));
        }
        if self.ping_period >= self.idle_read_timeout {
            return Err(invalid(
                "WSD_PING_PERIOD_MS",
                "must be shorter than the idle read timeout",
            ));
        }
        if self.registry_heartbeat >= self.registry_ttl {
            return Err(invalid(
                "WSD_REGISTRY_HEARTBEAT_SECS",
                "must be shorter than the registry TTL",
            ));
        }
        Ok(())
    }

    /// Socket limits applied at upgrade
    pub fn socket_limits(&self) -> SocketLimits {
        SocketLimits {
            write_buffer_size: self.write_buffer_size,
            max_message_size: self.max_message_size,
        }
    }

    pub fn client_settings(&self) -> ClientSettings {
        ClientSettings {
            outbound_capacity: self.outbound_queue_capacity,
            idle_read_timeout: self.idle_read_timeout,
            write_timeout: self.write_timeout,
            ping_period: self.ping_period,
            max_rate_violations: self.max_rate_violations,
            rate_limit_scope: self.rate_limit_scope,
        }
    }

    /// Look up a rate-limit policy by name
    pub fn rate_limit(&self, name: &str) -> Option<&RateLimitPolicy> {
        self.rate_limits.iter().find(|p| p.name == name)
    }
}

fn non_empty(vars: &HashMap<String, String>, key: &str) -> Option<String> {
    vars.get(key)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn parse<T: std::str::FromStr>(
    vars: &HashMap<String, String>,
    key: &str,
) -> Result<Option<T>, ConfigError> {
    match vars.get(key) {
        Some(value) => value.trim().parse().map(Some).map_err(|_| {
            ConfigError::InvalidEnv(
                format!("{ENV_PREFIX}{}", key.to_uppercase()),
                format!("cannot parse {value:?}"),
            )
        }),
        None => Ok(None),
    }
}

fn parse_bool(value: &str) -> bool {
    value.eq_ignore_ascii_case("true") || value == "1"
}

fn invalid(key: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidEnv(key.to_string(), reason.to_string())
}

/// Configuration error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing environment variable: {0}")]
    MissingEnv(&'static str),
    #[error("invalid environment variable {0}: {1}")]
    InvalidEnv(String, String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults_need_secret() {
        let config = Config::default();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingEnv("WSD_TOKEN_SECRET"))
        ));
    }

    #[test]
    fn test_apply_overrides() {
        let mut config = Config::default();
        config
            .apply(&vars(&[
                ("token_secret", "s3cret"),
                ("worker_count", "3"),
                ("idle_read_timeout_ms", "5000"),
                ("ping_period_ms", "1000"),
                ("max_connections_per_user", "2"),
                ("redis_url", "redis://127.0.0.1/"),
            ]))
            .unwrap();

        assert_eq!(config.token_secret.as_deref(), Some("s3cret"));
        assert_eq!(config.worker_count, 3);
        assert_eq!(config.idle_read_timeout, Duration::from_secs(5));
        assert_eq!(config.ping_period, Duration::from_secs(1));
        assert_eq!(config.max_connections_per_user, 2);
        assert_eq!(config.redis_url.as_deref(), Some("redis://127.0.0.1/"));
        config.validate().unwrap();
    }

    #[test]
    fn test_socket_limits() {
        let mut config = Config::default();
        config
            .apply(&vars(&[
                ("write_buffer_size", "8192"),
                ("max_message_size", "1024"),
            ]))
            .unwrap();

        let limits = config.socket_limits();
        assert_eq!(limits.write_buffer_size, 8192);
        assert_eq!(limits.max_message_size, 1024);
    }

    #[test]
    fn test_invalid_number() {
        let mut config = Config::default();
        let err = config
            .apply(&vars(&[("worker_count", "many")]))
            .unwrap_err();
        assert!(err.to_string().contains("WSD_WORKER_COUNT"));
    }

    #[test]
    fn test_rate_limits_merge_by_name() {
        let mut config = Config::default();
        config
            .apply(&vars(&[("rate_limits", "ws_inbound=5/2s;login=3/1m@redis")]))
            .unwrap();

        let inbound = config.rate_limit(WS_INBOUND_POLICY).unwrap();
        assert_eq!(inbound.limit, 5);
        assert_eq!(inbound.window, Duration::from_secs(2));

        let login = config.rate_limit("login").unwrap();
        assert_eq!(login.backend, LimiterBackend::Redis);
        assert!(config.rate_limit(PUSH_RPC_POLICY).is_some());
    }

    #[test]
    fn test_route_overrides() {
        let mut config = Config::default();
        config
            .apply(&vars(&[
                ("topic_typing", "presence.typing"),
                ("ack_typing", "leader"),
                ("keyed_typing", "true"),
            ]))
            .unwrap();

        let route = config.routes.get(EventFamily::Typing);
        assert_eq!(route.topic, "presence.typing");
        assert_eq!(route.ack, AckLevel::Leader);
        assert!(route.keyed);
    }

    #[test]
    fn test_invalid_ack_level() {
        let mut config = Config::default();
        let err = config
            .apply(&vars(&[("ack_new_message", "maybe")]))
            .unwrap_err();
        assert!(err.to_string().contains("WSD_ACK_NEW_MESSAGE"));
    }

    #[test]
    fn test_ping_must_be_shorter_than_idle() {
        let mut config = Config::default();
        config
            .apply(&vars(&[
                ("token_secret", "x"),
                ("idle_read_timeout_ms", "1000"),
                ("ping_period_ms", "2000"),
            ]))
            .unwrap();
        assert!(config.validate().is_err());
    }
}
