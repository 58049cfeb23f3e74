//! # Engine Configuration
//!
//! Host and client settings, loadable from TOML. Every key is optional;
//! missing keys take the defaults below. Durations are written in seconds.
//!
//! ```toml
//! host = "0.0.0.0"
//! port = 7777
//! max_clients = 16
//! secret = "lan-party"
//! broadcast_hz = 30.0
//! compress = true
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tether_shared::{DEFAULT_BIND_HOST, DEFAULT_BROADCAST_HZ, DEFAULT_MAX_CLIENTS, DEFAULT_PORT};

use crate::error::{NetError, NetResult};

/// Default cap on bytes buffered for one frame.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Default listen backlog.
pub const DEFAULT_BACKLOG: u32 = 128;

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or_default()
}

fn check_positive(name: &str, value: f64) -> NetResult<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(NetError::InvalidConfig(format!("{name} must be positive, got {value}")))
    }
}

fn parse_toml<T: for<'de> Deserialize<'de>>(text: &str) -> NetResult<T> {
    toml::from_str(text).map_err(|e| NetError::InvalidConfig(e.to_string()))
}

/// Host engine configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HostConfig {
    /// Listen address.
    pub host: String,
    /// Listen port (0 picks an ephemeral port).
    pub port: u16,
    /// Maximum concurrently established connections.
    pub max_clients: usize,
    /// Shared secret; when set, clients must present `sign(secret)`.
    pub secret: Option<String>,
    /// State broadcast frequency.
    pub broadcast_hz: f64,
    /// Silence after which a connection is evicted.
    pub inactivity_timeout_secs: f64,
    /// Silence after which the tick pings a connection.
    pub ping_interval_secs: f64,
    /// Bound on waiting for the first `hello`.
    pub handshake_timeout_secs: f64,
    /// Receive wait between inactivity checks.
    pub recv_poll_interval_secs: f64,
    /// Compress `state` and `init_state` frames.
    pub compress: bool,
    /// TCP accept backlog.
    pub backlog: u32,
    /// Whether a rebroadcast spawn also goes back to its author.
    pub echo_spawn_to_sender: bool,
    /// Push `init_state` right after `welcome` when a state provider is set.
    pub send_initial_state: bool,
    /// Cap on bytes buffered without a newline.
    pub max_frame_bytes: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_BIND_HOST.to_string(),
            port: DEFAULT_PORT,
            max_clients: DEFAULT_MAX_CLIENTS,
            secret: None,
            broadcast_hz: DEFAULT_BROADCAST_HZ,
            inactivity_timeout_secs: 30.0,
            ping_interval_secs: 5.0,
            handshake_timeout_secs: 5.0,
            recv_poll_interval_secs: 0.25,
            compress: false,
            backlog: DEFAULT_BACKLOG,
            echo_spawn_to_sender: true,
            send_initial_state: true,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl HostConfig {
    /// Loopback host on an ephemeral port.
    #[must_use]
    pub fn local() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            ..Self::default()
        }
    }

    /// Parses a TOML document.
    ///
    /// # Errors
    ///
    /// Returns `NetError::InvalidConfig` on syntax errors, unknown keys, or
    /// values rejected by [`HostConfig::validate`].
    pub fn from_toml_str(text: &str) -> NetResult<Self> {
        let config: Self = parse_toml(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a TOML file.
    ///
    /// # Errors
    ///
    /// Returns `NetError::Io` if the file cannot be read, otherwise as
    /// [`HostConfig::from_toml_str`].
    pub fn load(path: impl AsRef<Path>) -> NetResult<Self> {
        Self::from_toml_str(&std::fs::read_to_string(path)?)
    }

    /// Rejects settings the engine cannot run with.
    ///
    /// # Errors
    ///
    /// Returns `NetError::InvalidConfig` naming the first bad field.
    pub fn validate(&self) -> NetResult<()> {
        if self.max_clients == 0 {
            return Err(NetError::InvalidConfig("max_clients must be at least 1".into()));
        }
        if self.max_frame_bytes == 0 {
            return Err(NetError::InvalidConfig("max_frame_bytes must be at least 1".into()));
        }
        check_positive("broadcast_hz", self.broadcast_hz)?;
        check_positive("inactivity_timeout_secs", self.inactivity_timeout_secs)?;
        check_positive("ping_interval_secs", self.ping_interval_secs)?;
        check_positive("handshake_timeout_secs", self.handshake_timeout_secs)?;
        check_positive("recv_poll_interval_secs", self.recv_poll_interval_secs)?;
        Ok(())
    }

    /// `host:port` for binding.
    #[must_use]
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Time between state broadcasts.
    #[must_use]
    pub fn broadcast_interval(&self) -> Duration {
        secs(1.0 / self.broadcast_hz)
    }

    /// Inactivity timeout.
    #[must_use]
    pub fn inactivity_timeout(&self) -> Duration {
        secs(self.inactivity_timeout_secs)
    }

    /// Keep-alive ping interval.
    #[must_use]
    pub fn ping_interval(&self) -> Duration {
        secs(self.ping_interval_secs)
    }

    /// Handshake timeout.
    #[must_use]
    pub fn handshake_timeout(&self) -> Duration {
        secs(self.handshake_timeout_secs)
    }

    /// Receive poll interval.
    #[must_use]
    pub fn recv_poll_interval(&self) -> Duration {
        secs(self.recv_poll_interval_secs)
    }
}

/// Client engine configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    /// Host to connect to.
    pub host: String,
    /// Host port.
    pub port: u16,
    /// Shared secret matching the host's.
    pub secret: Option<String>,
    /// Bound on establishing the TCP stream.
    pub connect_timeout_secs: f64,
    /// Bound on flushing one frame.
    pub write_timeout_secs: f64,
    /// How often the bridge polls the client.
    pub poll_interval_secs: f64,
    /// Cap on bytes buffered without a newline.
    pub max_frame_bytes: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            secret: None,
            connect_timeout_secs: 5.0,
            write_timeout_secs: 2.0,
            poll_interval_secs: 0.01,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl ClientConfig {
    /// Client for `host:port` with defaults elsewhere.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// Sets the shared secret.
    #[must_use]
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    /// Parses a TOML document.
    ///
    /// # Errors
    ///
    /// Returns `NetError::InvalidConfig` on bad syntax or values.
    pub fn from_toml_str(text: &str) -> NetResult<Self> {
        let config: Self = parse_toml(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a TOML file.
    ///
    /// # Errors
    ///
    /// Returns `NetError::Io` if the file cannot be read, otherwise as
    /// [`ClientConfig::from_toml_str`].
    pub fn load(path: impl AsRef<Path>) -> NetResult<Self> {
        Self::from_toml_str(&std::fs::read_to_string(path)?)
    }

    /// Rejects settings the engine cannot run with.
    ///
    /// # Errors
    ///
    /// Returns `NetError::InvalidConfig` naming the first bad field.
    pub fn validate(&self) -> NetResult<()> {
        if self.max_frame_bytes == 0 {
            return Err(NetError::InvalidConfig("max_frame_bytes must be at least 1".into()));
        }
        check_positive("connect_timeout_secs", self.connect_timeout_secs)?;
        check_positive("write_timeout_secs", self.write_timeout_secs)?;
        check_positive("poll_interval_secs", self.poll_interval_secs)?;
        Ok(())
    }

    /// Connect timeout.
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        secs(self.connect_timeout_secs)
    }

    /// Write deadline per frame.
    #[must_use]
    pub fn write_timeout(&self) -> Duration {
        secs(self.write_timeout_secs)
    }

    /// Bridge poll interval.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        secs(self.poll_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_defaults() {
        let config = HostConfig::default();
        assert_eq!(config.port, 7777);
        assert_eq!(config.backlog, 128);
        assert_eq!(config.handshake_timeout(), Duration::from_secs(5));
        assert_eq!(config.recv_poll_interval(), Duration::from_millis(250));
        assert_eq!(config.broadcast_interval(), Duration::from_millis(50));
        assert!(config.echo_spawn_to_sender);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_host_from_toml_partial() {
        let config = HostConfig::from_toml_str(
            r#"
            port = 9000
            max_clients = 2
            secret = "pw"
            compress = true
            inactivity_timeout_secs = 1.5
            "#,
        )
        .unwrap();

        assert_eq!(config.port, 9000);
        assert_eq!(config.max_clients, 2);
        assert_eq!(config.secret.as_deref(), Some("pw"));
        assert!(config.compress);
        assert_eq!(config.inactivity_timeout(), Duration::from_millis(1500));
        assert_eq!(config.host, "0.0.0.0");
    }

    #[test]
    fn test_host_rejects_bad_values() {
        assert!(matches!(
            HostConfig::from_toml_str("max_clients = 0"),
            Err(NetError::InvalidConfig(_))
        ));
        assert!(HostConfig::from_toml_str("broadcast_hz = 0.0").is_err());
        assert!(HostConfig::from_toml_str("ping_interval_secs = -1.0").is_err());
        assert!(HostConfig::from_toml_str("no_such_key = 1").is_err());
        assert!(HostConfig::from_toml_str("port = \"seven\"").is_err());
    }

    #[test]
    fn test_client_config() {
        let config = ClientConfig::new("10.0.0.2", 7000).with_secret("pw");
        assert_eq!(config.port, 7000);
        assert_eq!(config.secret.as_deref(), Some("pw"));
        assert!(config.validate().is_ok());

        let parsed = ClientConfig::from_toml_str("host = \"example.org\"\nwrite_timeout_secs = 0.5").unwrap();
        assert_eq!(parsed.host, "example.org");
        assert_eq!(parsed.write_timeout(), Duration::from_millis(500));
        assert!(ClientConfig::from_toml_str("connect_timeout_secs = 0.0").is_err());
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        assert!(matches!(
            HostConfig::load("/definitely/not/here.toml"),
            Err(NetError::Io(_))
        ));
    }
}
