//! Environment-driven configuration.
//!
//! Only the enumerated keys are read; anything else in the environment is
//! ignored. Unparsable values are logged and fall back to the default
//! rather than aborting startup.

use std::{env, time::Duration};

use tracing::warn;

pub const DEFAULT_DEVICE: &str = "/dev/ttyACM0";
pub const DEFAULT_BAUD: u32 = 19_200;
pub const DEFAULT_COMMAND_DELAY: Duration = Duration::from_millis(250);
pub const DEFAULT_HTTP_PORT: u16 = 80;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Serial device path of the command station.
    pub serial_device: String,
    pub serial_baud: u32,
    /// Minimum spacing between consecutive frames on the wire.
    pub command_delay: Duration,
    /// Whether the external status page should be running. The gateway
    /// itself only records the flag; the page is a separate collaborator.
    pub http_server_enable: bool,
    pub http_server_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            serial_device: DEFAULT_DEVICE.to_string(),
            serial_baud: DEFAULT_BAUD,
            command_delay: DEFAULT_COMMAND_DELAY,
            http_server_enable: false,
            http_server_port: DEFAULT_HTTP_PORT,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(v) = env::var("SERIAL_DEVICE") {
            cfg.serial_device = v;
        }
        if let Ok(v) = env::var("SERIAL_BAUD") {
            match v.parse() {
                Ok(baud) => cfg.serial_baud = baud,
                Err(_) => warn!(value = %v, "ignoring unparsable SERIAL_BAUD"),
            }
        }
        if let Ok(v) = env::var("SERIAL_DELAY_MS") {
            match v.parse() {
                Ok(ms) => cfg.command_delay = Duration::from_millis(ms),
                Err(_) => warn!(value = %v, "ignoring unparsable SERIAL_DELAY_MS"),
            }
        }
        if let Ok(v) = env::var("HTTP_SERVER_ENABLE") {
            cfg.http_server_enable = v.eq_ignore_ascii_case("true");
        }
        if let Ok(v) = env::var("HTTP_SERVER_PORT") {
            match v.parse() {
                Ok(port) => cfg.http_server_port = port,
                Err(_) => warn!(value = %v, "ignoring unparsable HTTP_SERVER_PORT"),
            }
        }
        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_deployment() {
        let cfg = Config::default();
        assert_eq!(cfg.serial_device, "/dev/ttyACM0");
        assert_eq!(cfg.serial_baud, 19_200);
        assert_eq!(cfg.command_delay, Duration::from_millis(250));
        assert!(!cfg.http_server_enable);
        assert_eq!(cfg.http_server_port, 80);
    }
}
