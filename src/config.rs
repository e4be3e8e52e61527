//! Configuration for the relay and the negotiator
//!
//! Values come from the environment (a `.env` file is loaded first when
//! present). Command-line arguments override them in `main`.

use std::env;
use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;

pub const DEFAULT_RELAY_PORT: u16 = 8080;
pub const DEFAULT_OUTBOUND_QUEUE: usize = 256;
pub const DEFAULT_SIGNALING_URL: &str = "ws://127.0.0.1:8080";
pub const DEFAULT_MAX_PENDING_CANDIDATES: usize = 64;

/// Log output selected by `LOG_FORMAT`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format {other}")),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Text => f.write_str("text"),
            LogFormat::Json => f.write_str("json"),
        }
    }
}

/// Relay server configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Interface to listen on
    pub host: String,
    /// Listen port, 0 picks an ephemeral port
    pub port: u16,
    /// Frames buffered per endpoint before new ones are dropped
    pub outbound_queue: usize,
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_RELAY_PORT,
            outbound_queue: DEFAULT_OUTBOUND_QUEUE,
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
        }
    }
}

impl RelayConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        let defaults = RelayConfig::default();
        Ok(RelayConfig {
            host: env::var("RELAY_HOST").unwrap_or(defaults.host),
            port: parse_var("RELAY_PORT")?.unwrap_or(defaults.port),
            outbound_queue: parse_var::<usize>("RELAY_OUTBOUND_QUEUE")?
                .unwrap_or(defaults.outbound_queue)
                .max(1),
            log_level: env::var("LOG_LEVEL").unwrap_or(defaults.log_level),
            log_format: parse_var("LOG_FORMAT")?.unwrap_or(defaults.log_format),
        })
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Negotiator configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatorConfig {
    /// Signaling server address, `ws://host:port`
    pub server_url: Option<String>,
    /// Candidates held while no remote description is set
    pub max_pending_candidates: usize,
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Default for NegotiatorConfig {
    fn default() -> Self {
        NegotiatorConfig {
            server_url: Some(DEFAULT_SIGNALING_URL.to_string()),
            max_pending_candidates: DEFAULT_MAX_PENDING_CANDIDATES,
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
        }
    }
}

impl NegotiatorConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        let defaults = NegotiatorConfig::default();
        Ok(NegotiatorConfig {
            server_url: env::var("SIGNALING_URL").ok().or(defaults.server_url),
            max_pending_candidates: parse_var("MAX_PENDING_CANDIDATES")?
                .unwrap_or(defaults.max_pending_candidates),
            log_level: env::var("LOG_LEVEL").unwrap_or(defaults.log_level),
            log_format: parse_var("LOG_FORMAT")?.unwrap_or(defaults.log_format),
        })
    }

    pub fn with_server_url(mut self, url: impl Into<String>) -> Self {
        self.server_url = Some(url.into());
        self
    }
}

fn parse_var<T: FromStr>(key: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { key, value }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let relay = RelayConfig::default().with_port(0);
        assert_eq!(relay.listen_addr(), "0.0.0.0:0");
        assert_eq!(relay.outbound_queue, DEFAULT_OUTBOUND_QUEUE);

        let negotiator = NegotiatorConfig::default();
        assert_eq!(negotiator.server_url.as_deref(), Some(DEFAULT_SIGNALING_URL));
    }

    #[test]
    fn test_invalid_number_is_reported() {
        // Unique key so parallel tests never observe it.
        env::set_var("ROVER_SIGNAL_TEST_PORT", "eighty");
        let result = parse_var::<u16>("ROVER_SIGNAL_TEST_PORT");
        env::remove_var("ROVER_SIGNAL_TEST_PORT");

        assert!(matches!(
            result,
            Err(ConfigError::Invalid { key: "ROVER_SIGNAL_TEST_PORT", .. })
        ));
        assert_eq!(parse_var::<u16>("ROVER_SIGNAL_TEST_UNSET").unwrap(), None);
    }

    #[test]
    fn test_log_format_from_env() {
        env::set_var("ROVER_SIGNAL_TEST_FORMAT", " JSON ");
        let json = parse_var::<LogFormat>("ROVER_SIGNAL_TEST_FORMAT");
        env::set_var("ROVER_SIGNAL_TEST_FORMAT", "xml");
        let unknown = parse_var::<LogFormat>("ROVER_SIGNAL_TEST_FORMAT");
        env::remove_var("ROVER_SIGNAL_TEST_FORMAT");

        assert_eq!(json.unwrap(), Some(LogFormat::Json));
        assert!(matches!(unknown, Err(ConfigError::Invalid { value, .. }) if value == "xml"));
        assert_eq!(RelayConfig::default().log_format, LogFormat::Text);
        assert_eq!(NegotiatorConfig::default().log_format, LogFormat::Text);
    }
}
