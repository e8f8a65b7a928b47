use std::{env, net::SocketAddr};

use thiserror::Error;

/// Which wire the demo binary serves on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Stdio,
    Sse,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub transport: TransportKind,
    pub bind_addr: String,
    pub bind_port: u16,
    pub sse_path: String,
    pub message_path: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("MCP_TRANSPORT must be one of: stdio, sse")]
    InvalidTransport,
    #[error("BIND_PORT must be a valid u16")]
    InvalidPort,
    #[error("{0} must start with '/'")]
    InvalidPath(&'static str),
    #[error("invalid bind address or port")]
    InvalidSocket,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let transport = match env::var("MCP_TRANSPORT")
            .ok()
            .map(|value| value.trim().to_ascii_lowercase())
            .filter(|value| !value.is_empty())
            .as_deref()
        {
            None | Some("stdio") => TransportKind::Stdio,
            Some("sse") => TransportKind::Sse,
            _ => return Err(ConfigError::InvalidTransport),
        };

        let bind_addr = env::var("BIND_ADDR").unwrap_or_else(|_| "127.0.0.1".to_string());
        let bind_port = env::var("BIND_PORT")
            .ok()
            .map(|value| value.parse::<u16>().map_err(|_| ConfigError::InvalidPort))
            .transpose()?
            .unwrap_or(8080);
        let sse_path = path_from_env("MCP_SSE_PATH", "/sse")?;
        let message_path = path_from_env("MCP_MESSAGE_PATH", "/message")?;

        let config = Self {
            transport,
            bind_addr,
            bind_port,
            sse_path,
            message_path,
        };

        if config.transport == TransportKind::Sse {
            let _ = config.bind_socket()?;
        }
        Ok(config)
    }

    pub fn bind_socket(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.bind_addr, self.bind_port)
            .parse::<SocketAddr>()
            .map_err(|_| ConfigError::InvalidSocket)
    }
}

fn path_from_env(key: &'static str, default: &str) -> Result<String, ConfigError> {
    let value = env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default.to_string());

    if !value.starts_with('/') {
        return Err(ConfigError::InvalidPath(key));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clear_env() {
        env::remove_var("MCP_TRANSPORT");
        env::remove_var("BIND_ADDR");
        env::remove_var("BIND_PORT");
        env::remove_var("MCP_SSE_PATH");
        env::remove_var("MCP_MESSAGE_PATH");
    }

    #[test]
    fn parse_defaults() {
        clear_env();

        let config = Config::from_env().expect("config should parse");
        assert_eq!(config.transport, TransportKind::Stdio);
        assert_eq!(config.bind_addr, "127.0.0.1");
        assert_eq!(config.bind_port, 8080);
        assert_eq!(config.sse_path, "/sse");
        assert_eq!(config.message_path, "/message");
    }

    #[test]
    fn sse_transport_parses_with_custom_paths() {
        clear_env();
        env::set_var("MCP_TRANSPORT", "sse");
        env::set_var("MCP_SSE_PATH", "/events");
        env::set_var("MCP_MESSAGE_PATH", "/rpc");

        let config = Config::from_env().expect("config should parse");
        assert_eq!(config.transport, TransportKind::Sse);
        assert_eq!(config.sse_path, "/events");
        assert_eq!(config.message_path, "/rpc");
        clear_env();
    }

    #[test]
    fn unknown_transport_fails() {
        clear_env();
        env::set_var("MCP_TRANSPORT", "carrier-pigeon");

        let err = Config::from_env().expect_err("expected invalid transport error");
        assert!(matches!(err, ConfigError::InvalidTransport));
        clear_env();
    }

    #[test]
    fn invalid_port_fails() {
        clear_env();
        env::set_var("BIND_PORT", "99999");

        let err = Config::from_env().expect_err("expected invalid port error");
        assert!(matches!(err, ConfigError::InvalidPort));
        clear_env();
    }

    #[test]
    fn relative_path_fails() {
        clear_env();
        env::set_var("MCP_SSE_PATH", "events");

        let err = Config::from_env().expect_err("expected invalid path error");
        assert!(matches!(err, ConfigError::InvalidPath("MCP_SSE_PATH")));
        clear_env();
    }
}
