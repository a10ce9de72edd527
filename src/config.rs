//! Firewall configuration — single source of truth for all tunable parameters.
//!
//! Environment variables (`AF_*`) override defaults, 12-factor style. The
//! snapshot is immutable after construction; the host builds it once at
//! startup and passes it by reference.

use std::collections::BTreeSet;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

/// Supported transport modes between agents and the firewall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    Stdio,
    Sse,
    Websocket,
}

impl FromStr for TransportMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "stdio" => Ok(Self::Stdio),
            "sse" => Ok(Self::Sse),
            "websocket" => Ok(Self::Websocket),
            other => Err(Error::Config(format!("unknown transport mode: {other}"))),
        }
    }
}

impl std::fmt::Display for TransportMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdio => write!(f, "stdio"),
            Self::Sse => write!(f, "sse"),
            Self::Websocket => write!(f, "websocket"),
        }
    }
}

/// Default blocked-command literals for the L1 dictionary matcher.
pub const DEFAULT_BLOCKED_COMMANDS: &[&str] = &[
    "rm -rf",
    "/etc/shadow",
    "/etc/passwd",
    "DROP TABLE",
    "DELETE FROM",
    "TRUNCATE",
    "shutdown",
    "mkfs",
    "dd if=",
    "FORMAT C:",
    "wget|sh",
    "curl|bash",
];

/// Immutable runtime configuration. Constructed once at startup.
#[derive(Debug, Clone)]
pub struct FirewallConfig {
    /// Address the firewall accepts agent connections on.
    pub listen_host: String,
    pub listen_port: u16,

    /// Upstream tool server the firewall forwards to.
    pub upstream_host: String,
    pub upstream_port: u16,
    pub transport_mode: TransportMode,

    /// Engine tuning.
    pub l1_enabled: bool,
    pub l2_enabled: bool,
    pub l2_model_endpoint: String,
    pub l2_api_key: String,
    pub l2_model: String,
    pub l2_timeout_seconds: f64,

    /// Session store.
    pub session_ring_buffer_size: usize,
    pub session_ttl_seconds: u64,

    /// Token-bucket rate limiting on the HTTP surface.
    pub rate_limit_requests_per_sec: f64,
    pub rate_limit_burst: u32,

    /// Audit JSONL sink path.
    pub audit_log_path: String,

    /// Command line for the upstream server in stdio mode.
    pub server_command: Vec<String>,

    /// L1 dictionary literals.
    pub blocked_commands: BTreeSet<String>,
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            listen_host: "127.0.0.1".to_string(),
            listen_port: 9090,
            upstream_host: "127.0.0.1".to_string(),
            upstream_port: 3000,
            transport_mode: TransportMode::Sse,
            l1_enabled: true,
            l2_enabled: false,
            l2_model_endpoint: "https://openrouter.ai/api/v1/chat/completions".to_string(),
            l2_api_key: String::new(),
            l2_model: "minimax/minimax-m2.5".to_string(),
            l2_timeout_seconds: 10.0,
            session_ring_buffer_size: 64,
            session_ttl_seconds: 3600,
            rate_limit_requests_per_sec: 100.0,
            rate_limit_burst: 200,
            audit_log_path: "./audit/firewall.jsonl".to_string(),
            server_command: Vec::new(),
            blocked_commands: DEFAULT_BLOCKED_COMMANDS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_flag(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => v == "1" || v.eq_ignore_ascii_case("true"),
        Err(_) => default,
    }
}

impl FirewallConfig {
    /// Build a configuration snapshot from `AF_*` environment variables,
    /// falling back to defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let blocked_commands = match std::env::var("AF_BLOCKED_COMMANDS") {
            Ok(raw) => raw
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            Err(_) => defaults.blocked_commands,
        };

        let server_command = match std::env::var("AF_SERVER_COMMAND") {
            Ok(raw) => raw.split_whitespace().map(|s| s.to_string()).collect(),
            Err(_) => Vec::new(),
        };

        Self {
            listen_host: env_string("AF_LISTEN_HOST", &defaults.listen_host),
            listen_port: env_or("AF_LISTEN_PORT", defaults.listen_port),
            upstream_host: env_string("AF_UPSTREAM_HOST", &defaults.upstream_host),
            upstream_port: env_or("AF_UPSTREAM_PORT", defaults.upstream_port),
            transport_mode: env_or("AF_TRANSPORT_MODE", defaults.transport_mode),
            l1_enabled: env_flag("AF_L1_ENABLED", defaults.l1_enabled),
            l2_enabled: env_flag("AF_L2_ENABLED", defaults.l2_enabled),
            l2_model_endpoint: env_string("AF_L2_MODEL_ENDPOINT", &defaults.l2_model_endpoint),
            l2_api_key: env_string("AF_L2_API_KEY", ""),
            l2_model: env_string("AF_L2_MODEL", &defaults.l2_model),
            l2_timeout_seconds: env_or("AF_L2_TIMEOUT", defaults.l2_timeout_seconds),
            session_ring_buffer_size: env_or(
                "AF_SESSION_BUFFER_SIZE",
                defaults.session_ring_buffer_size,
            ),
            session_ttl_seconds: env_or("AF_SESSION_TTL", defaults.session_ttl_seconds),
            rate_limit_requests_per_sec: env_or(
                "AF_RATE_LIMIT_RPS",
                defaults.rate_limit_requests_per_sec,
            ),
            rate_limit_burst: env_or("AF_RATE_LIMIT_BURST", defaults.rate_limit_burst),
            audit_log_path: env_string("AF_AUDIT_LOG", &defaults.audit_log_path),
            server_command,
            blocked_commands,
        }
    }

    /// Socket address string for the listener.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.listen_host, self.listen_port)
    }

    /// Base URL of the upstream server over HTTP.
    pub fn upstream_http_url(&self) -> String {
        format!("http://{}:{}", self.upstream_host, self.upstream_port)
    }

    /// WebSocket URL of the upstream server.
    pub fn upstream_ws_url(&self) -> String {
        format!("ws://{}:{}/ws", self.upstream_host, self.upstream_port)
    }

    /// L2 outer timeout as a `Duration`.
    pub fn l2_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.l2_timeout_seconds.max(0.0))
    }

    /// Session TTL as a `Duration`.
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let config = FirewallConfig::default();
        assert_eq!(config.listen_port, 9090);
        assert_eq!(config.session_ring_buffer_size, 64);
        assert_eq!(config.session_ttl_seconds, 3600);
        assert_eq!(config.transport_mode, TransportMode::Sse);
        assert!(config.blocked_commands.contains("rm -rf"));
        assert!(config.blocked_commands.contains("curl|bash"));
    }

    #[test]
    fn test_transport_mode_parse() {
        assert_eq!(
            "stdio".parse::<TransportMode>().unwrap(),
            TransportMode::Stdio
        );
        assert_eq!(
            "WebSocket".parse::<TransportMode>().unwrap(),
            TransportMode::Websocket
        );
        assert!("carrier-pigeon".parse::<TransportMode>().is_err());
    }

    #[test]
    fn test_urls() {
        let config = FirewallConfig::default();
        assert_eq!(config.upstream_http_url(), "http://127.0.0.1:3000");
        assert_eq!(config.listen_addr(), "127.0.0.1:9090");
    }
}
