//! Server and client settings.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use crate::event::DEFAULT_HOLDING_CAPACITY;

pub const DEFAULT_PORT: u16 = 5555;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(20);
pub const DEFAULT_OUTGOING_CAPACITY: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Reactor housekeeping period; bounds shutdown-drain latency.
    pub poll_interval: Duration,
    /// Events kept for the next subscriber while no client is attached.
    pub holding_capacity: usize,
    /// Messages queued per client before further events for it are dropped.
    pub outgoing_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            holding_capacity: DEFAULT_HOLDING_CAPACITY,
            outgoing_capacity: DEFAULT_OUTGOING_CAPACITY,
        }
    }
}

impl ServerConfig {
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_holding_capacity(mut self, capacity: usize) -> Self {
        self.holding_capacity = capacity;
        self
    }

    pub fn with_outgoing_capacity(mut self, capacity: usize) -> Self {
        self.outgoing_capacity = capacity.max(1);
        self
    }

    pub fn bind_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        let ip: IpAddr = self.host.parse()?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// How long `run_command` waits for the matching response.
    pub response_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
        }
    }
}

impl ClientConfig {
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 5555);
        assert_eq!(config.poll_interval, Duration::from_millis(100));
        assert_eq!(config.holding_capacity, 1024);
        assert_eq!(config.outgoing_capacity, 4096);
        assert_eq!(ServerConfig::default().with_outgoing_capacity(0).outgoing_capacity, 1);
        assert_eq!(config.bind_addr().unwrap().to_string(), "127.0.0.1:5555");
    }

    #[test]
    fn bad_host_is_reported() {
        let config = ServerConfig::default().with_host("bench.local").with_port(0);
        assert!(config.bind_addr().is_err());
    }

    #[test]
    fn client_config_builder() {
        let config = ClientConfig::default().with_response_timeout(Duration::from_secs(3));
        assert_eq!(config.response_timeout, Duration::from_secs(3));
        assert_eq!(ClientConfig::default().response_timeout, Duration::from_secs(20));
    }
}
