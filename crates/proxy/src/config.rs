//! Application configuration

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::mcp::client::Timeouts;

/// How the upstream client reaches the proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamMode {
    /// Newline-delimited JSON-RPC on stdin/stdout, one session
    Stdio,
    /// HTTP server with one session per SSE stream
    Sse,
}

impl FromStr for UpstreamMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stdio" => Ok(Self::Stdio),
            "sse" => Ok(Self::Sse),
            _ => Err(ConfigError::Invalid {
                var: "MCP_TRANSPORT",
                reason: format!("expected `stdio` or `sse`, got `{}`", s),
            }),
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: UpstreamMode,

    // Credentials
    pub api_key: Option<String>,

    // Server (SSE mode)
    pub bind_address: String,

    // Descriptor resolution
    pub servers_config: String,
    pub api_keys_file: String,
    pub resolver_url: Option<String>,

    // MCP
    pub handshake_timeout_ms: u64,
    pub request_timeout_ms: u64,

    pub log_format: LogFormat,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let mode = match non_empty("MCP_TRANSPORT") {
            Some(value) => value.parse()?,
            None => UpstreamMode::Stdio,
        };

        let api_key = non_empty("MCP_API_KEY");
        if mode == UpstreamMode::Stdio && api_key.is_none() {
            return Err(ConfigError::Missing("MCP_API_KEY"));
        }

        let log_format = match non_empty("LOG_FORMAT").as_deref() {
            Some("json") => LogFormat::Json,
            _ => LogFormat::Pretty,
        };

        Ok(Self {
            mode,
            api_key,

            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3006".to_string()),

            servers_config: env::var("SERVERS_CONFIG")
                .unwrap_or_else(|_| "servers_config.json".to_string()),
            api_keys_file: env::var("API_KEYS_FILE").unwrap_or_else(|_| "api_keys.json".to_string()),
            resolver_url: non_empty("RESOLVER_URL"),

            handshake_timeout_ms: millis("MCP_HANDSHAKE_TIMEOUT_MS", 10_000)?,
            request_timeout_ms: millis("MCP_REQUEST_TIMEOUT_MS", 60_000)?,

            log_format,
        })
    }

    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            handshake: Duration::from_millis(self.handshake_timeout_ms),
            request: Duration::from_millis(self.request_timeout_ms),
        }
    }
}

fn non_empty(var: &str) -> Option<String> {
    env::var(var).ok().filter(|v| !v.trim().is_empty())
}

/// Parse a positive millisecond value, falling back to `default` when unset
fn millis(var: &'static str, default: u64) -> Result<u64, ConfigError> {
    let Some(raw) = non_empty(var) else {
        return Ok(default);
    };
    match raw.trim().parse::<u64>() {
        Ok(0) => Err(ConfigError::Invalid {
            var,
            reason: "must be greater than zero".to_string(),
        }),
        Ok(ms) => Ok(ms),
        Err(e) => Err(ConfigError::Invalid {
            var,
            reason: e.to_string(),
        }),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: &[&str] = &[
        "MCP_TRANSPORT",
        "MCP_API_KEY",
        "BIND_ADDRESS",
        "SERVERS_CONFIG",
        "API_KEYS_FILE",
        "RESOLVER_URL",
        "MCP_HANDSHAKE_TIMEOUT_MS",
        "MCP_REQUEST_TIMEOUT_MS",
        "LOG_FORMAT",
    ];

    /// Helper to clear env vars before and after tests
    fn cleanup_config() {
        for var in VARS {
            env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_stdio_requires_api_key() {
        cleanup_config();

        let result = Config::from_env();
        assert!(
            matches!(result, Err(ConfigError::Missing("MCP_API_KEY"))),
            "got {:?}",
            result
        );

        env::set_var("MCP_API_KEY", "   ");
        assert!(Config::from_env().is_err(), "Blank key should be treated as missing");

        cleanup_config();
    }

    #[test]
    #[serial]
    fn test_defaults() {
        cleanup_config();
        env::set_var("MCP_API_KEY", "key-1");

        let config = Config::from_env().unwrap();
        assert_eq!(config.mode, UpstreamMode::Stdio);
        assert_eq!(config.api_key.as_deref(), Some("key-1"));
        assert_eq!(config.bind_address, "0.0.0.0:3006");
        assert_eq!(config.servers_config, "servers_config.json");
        assert_eq!(config.api_keys_file, "api_keys.json");
        assert!(config.resolver_url.is_none());
        assert_eq!(config.timeouts().handshake, Duration::from_secs(10));
        assert_eq!(config.timeouts().request, Duration::from_secs(60));
        assert_eq!(config.log_format, LogFormat::Pretty);

        cleanup_config();
    }

    #[test]
    #[serial]
    fn test_sse_mode_without_key() {
        cleanup_config();
        env::set_var("MCP_TRANSPORT", "SSE");
        env::set_var("BIND_ADDRESS", "127.0.0.1:9000");
        env::set_var("RESOLVER_URL", "http://directory.local");
        env::set_var("MCP_REQUEST_TIMEOUT_MS", "1500");
        env::set_var("LOG_FORMAT", "json");

        let config = Config::from_env().unwrap();
        assert_eq!(config.mode, UpstreamMode::Sse);
        assert!(config.api_key.is_none());
        assert_eq!(config.bind_address, "127.0.0.1:9000");
        assert_eq!(config.resolver_url.as_deref(), Some("http://directory.local"));
        assert_eq!(config.timeouts().request, Duration::from_millis(1500));
        assert_eq!(config.log_format, LogFormat::Json);

        cleanup_config();
    }

    #[test]
    #[serial]
    fn test_invalid_values_rejected() {
        cleanup_config();
        env::set_var("MCP_API_KEY", "key-1");

        env::set_var("MCP_TRANSPORT", "websocket");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Invalid { var: "MCP_TRANSPORT", .. })
        ));
        env::remove_var("MCP_TRANSPORT");

        env::set_var("MCP_HANDSHAKE_TIMEOUT_MS", "soon");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Invalid { var: "MCP_HANDSHAKE_TIMEOUT_MS", .. })
        ));

        env::set_var("MCP_HANDSHAKE_TIMEOUT_MS", "0");
        assert!(Config::from_env().is_err());

        cleanup_config();
    }
}
