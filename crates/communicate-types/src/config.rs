//! Communicator configuration.

use crate::descriptor::ServiceDescriptor;
use crate::error::CommunicateError;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Settings for one communicator and the connections it creates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommunicatorConfig {
    /// Advertised service instance name.
    pub name: String,
    /// Service type tag, without underscore or transport suffix.
    pub service_type: String,
    /// Discovery domain.
    pub domain: String,
    /// Advertised and listening port. `0` binds an ephemeral port.
    pub port: u16,
    /// Address the listening endpoint binds to.
    pub listen_addr: IpAddr,
    /// How long resolution may take before the connection fails.
    pub resolve_timeout_secs: u64,
    /// Progress granularity in percent of a component; also sets chunk size.
    pub progress_percentage: u8,
    /// Largest header, payload or footer accepted from a peer.
    pub max_frame_bytes: u32,
    /// Frames per second for repeated sends in the demo loop.
    pub send_rate_fps: u32,
    /// Capacity of notification channels.
    pub event_capacity: usize,
    /// Hide our own advertisement from search results.
    pub ignore_own_service: bool,
}

impl Default for CommunicatorConfig {
    fn default() -> Self {
        Self {
            name: "communicate-node".to_string(),
            service_type: "communicate".to_string(),
            domain: "local".to_string(),
            port: 0,
            listen_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            resolve_timeout_secs: 10,
            progress_percentage: 5,
            max_frame_bytes: 64 * 1024 * 1024,
            send_rate_fps: 15,
            event_capacity: 256,
            ignore_own_service: true,
        }
    }
}

impl CommunicatorConfig {
    /// Check every field is within range.
    pub fn validate(&self) -> Result<(), CommunicateError> {
        if self.name.trim().is_empty() {
            return Err(CommunicateError::Config("name must not be empty".into()));
        }
        if self.service_type.is_empty()
            || !self
                .service_type
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(CommunicateError::Config(format!(
                "service_type '{}' must be non-empty ASCII letters, digits or '-'",
                self.service_type
            )));
        }
        if self.domain.is_empty() {
            return Err(CommunicateError::Config("domain must not be empty".into()));
        }
        if self.resolve_timeout_secs == 0 {
            return Err(CommunicateError::Config(
                "resolve_timeout_secs must be at least 1".into(),
            ));
        }
        if !(1..=100).contains(&self.progress_percentage) {
            return Err(CommunicateError::Config(format!(
                "progress_percentage must be between 1 and 100, got {}",
                self.progress_percentage
            )));
        }
        if self.max_frame_bytes == 0 {
            return Err(CommunicateError::Config("max_frame_bytes must be positive".into()));
        }
        if self.send_rate_fps == 0 {
            return Err(CommunicateError::Config("send_rate_fps must be positive".into()));
        }
        if self.event_capacity == 0 {
            return Err(CommunicateError::Config("event_capacity must be positive".into()));
        }
        Ok(())
    }

    /// Resolve timeout as a [`Duration`].
    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_secs(self.resolve_timeout_secs)
    }

    /// Interval between frames in the demo send loop.
    pub fn send_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.send_rate_fps.max(1)))
    }

    /// Socket address the listener binds to.
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_addr, self.port)
    }

    /// The descriptor this communicator advertises on `port`.
    pub fn descriptor(&self, port: u16) -> ServiceDescriptor {
        ServiceDescriptor::new(
            self.name.clone(),
            self.service_type.clone(),
            self.domain.clone(),
            port,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = CommunicatorConfig::default();
        config.validate().unwrap();
        assert_eq!(config.resolve_timeout(), Duration::from_secs(10));
        assert_eq!(config.send_rate_fps, 15);
    }

    #[test]
    fn test_rejects_out_of_range() {
        let config = CommunicatorConfig {
            progress_percentage: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(CommunicateError::Config(_))));

        let config = CommunicatorConfig {
            service_type: "_bad._tcp".into(),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = CommunicatorConfig {
            resolve_timeout_secs: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: CommunicatorConfig = toml::from_str(
            r#"
            name = "Test"
            port = 12345
            "#,
        )
        .unwrap();
        assert_eq!(config.name, "Test");
        assert_eq!(config.port, 12345);
        assert_eq!(config.domain, "local");
        assert_eq!(config.descriptor(12345).full_name(), "Test._communicate._tcp.local.");
    }

    #[test]
    fn test_send_interval() {
        let config = CommunicatorConfig {
            send_rate_fps: 4,
            ..Default::default()
        };
        assert_eq!(config.send_interval(), Duration::from_millis(250));
    }
}
