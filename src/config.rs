use std::{env, net::SocketAddr, str::FromStr, time::Duration};

use thiserror::Error;

use crate::mcp::dispatcher::DispatchOptions;
use crate::session::SessionOptions;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Stdio,
    Http,
}

impl FromStr for Transport {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "stdio" => Ok(Self::Stdio),
            "http" | "streamable-http" => Ok(Self::Http),
            other => Err(ConfigError::InvalidTransport(other.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub transport: Transport,
    pub bind_addr: String,
    pub bind_port: u16,
    pub session_idle_timeout: Duration,
    pub session_sweep_interval: Duration,
    pub session_buffer_capacity: usize,
    pub shutdown_grace: Duration,
    pub request_timeout: Option<Duration>,
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("MCP_TRANSPORT must be `stdio` or `http`, got `{0}`")]
    InvalidTransport(String),
    #[error("MCP_PORT must be a valid u16")]
    InvalidPort,
    #[error("{0} must be a positive integer")]
    InvalidNumber(&'static str),
    #[error("invalid bind address or port")]
    InvalidSocket,
}

fn positive(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<u64>, ConfigError> {
    lookup(key)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .map(|value| match value.parse::<u64>() {
            Ok(number) if number > 0 => Ok(number),
            _ => Err(ConfigError::InvalidNumber(key)),
        })
        .transpose()
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let transport = lookup("MCP_TRANSPORT")
            .filter(|value| !value.trim().is_empty())
            .map(|value| value.parse::<Transport>())
            .transpose()?
            .unwrap_or(Transport::Stdio);

        let bind_addr = lookup("MCP_HOST")
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| "0.0.0.0".to_string());
        let bind_port = lookup("MCP_PORT")
            .map(|value| value.trim().parse::<u16>().map_err(|_| ConfigError::InvalidPort))
            .transpose()?
            .unwrap_or(8000);

        let session_idle_timeout =
            positive(&lookup, "MCP_SESSION_IDLE_TIMEOUT_SECS")?.unwrap_or(1800);
        let session_sweep_interval =
            positive(&lookup, "MCP_SESSION_SWEEP_INTERVAL_SECS")?.unwrap_or(60);
        let session_buffer_capacity =
            positive(&lookup, "MCP_SESSION_BUFFER_CAPACITY")?.unwrap_or(256);
        let shutdown_grace = positive(&lookup, "MCP_SHUTDOWN_GRACE_SECS")?.unwrap_or(5);
        let request_timeout = positive(&lookup, "MCP_REQUEST_TIMEOUT_SECS")?;

        let config = Self {
            transport,
            bind_addr,
            bind_port,
            session_idle_timeout: Duration::from_secs(session_idle_timeout),
            session_sweep_interval: Duration::from_secs(session_sweep_interval),
            session_buffer_capacity: usize::try_from(session_buffer_capacity)
                .map_err(|_| ConfigError::InvalidNumber("MCP_SESSION_BUFFER_CAPACITY"))?,
            shutdown_grace: Duration::from_secs(shutdown_grace),
            request_timeout: request_timeout.map(Duration::from_secs),
        };

        if config.transport == Transport::Http {
            let _ = config.bind_socket()?;
        }
        Ok(config)
    }

    pub fn bind_socket(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.bind_addr, self.bind_port)
            .parse::<SocketAddr>()
            .map_err(|_| ConfigError::InvalidSocket)
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            idle_timeout: self.session_idle_timeout,
            buffer_capacity: self.session_buffer_capacity,
        }
    }

    pub fn dispatch_options(&self, instructions: &str) -> DispatchOptions {
        DispatchOptions {
            instructions: Some(instructions.to_string()),
            request_timeout: self.request_timeout,
            ..DispatchOptions::default()
        }
    }
}
