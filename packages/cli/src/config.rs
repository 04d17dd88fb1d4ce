use mockbox_config::constants::{
    MOCKBOX_API_HOST, MOCKBOX_API_PORT, MOCKBOX_CORS_ORIGIN, MOCKBOX_LOG_JSON, PORT,
};
use mockbox_config::{env_string, parse_env_flag};
use std::net::{IpAddr, SocketAddr};
use std::num::ParseIntError;
use thiserror::Error;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 4080;
const DEFAULT_CORS_ORIGIN: &str = "http://localhost:5173";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid port number: {0}")]
    InvalidPort(#[from] ParseIntError),
    #[error("Port {0} is out of valid range (1-65535)")]
    PortOutOfRange(u16),
    #[error("Invalid host address: {0}")]
    InvalidHost(String),
}

/// Listener settings for the `serve` command
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: IpAddr,
    pub port: u16,
    pub cors_origin: String,
    pub log_json: bool,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let port = match env_string(MOCKBOX_API_PORT).or_else(|| env_string(PORT)) {
            Some(raw) => raw.parse::<u16>()?,
            None => DEFAULT_PORT,
        };
        if port == 0 {
            return Err(ConfigError::PortOutOfRange(port));
        }

        let host_raw = env_string(MOCKBOX_API_HOST).unwrap_or_else(|| DEFAULT_HOST.to_string());
        let host = host_raw
            .parse::<IpAddr>()
            .map_err(|_| ConfigError::InvalidHost(host_raw.clone()))?;

        let cors_origin =
            env_string(MOCKBOX_CORS_ORIGIN).unwrap_or_else(|| DEFAULT_CORS_ORIGIN.to_string());

        Ok(ServerConfig {
            host,
            port,
            cors_origin,
            log_json: parse_env_flag(MOCKBOX_LOG_JSON, false),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}
