//! Serial-attached instruments.

use std::io::{self, Read, Write};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serialport::SerialPort;
use tracing::info;

use super::{closed_error, IoChannel};

/// Serial port settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Device path, e.g. `/dev/ttyUSB0`.
    pub path: String,
    /// Line rate, 8N1.
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Read timeout; an idle port reports would-block after it.
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_timeout() -> Duration {
    Duration::from_millis(100)
}

/// Channel over a serial port.
///
/// Read timeouts are reported as would-block so an idle instrument does not
/// look like an I/O failure.
pub struct SerialChannel {
    name: String,
    port: Option<Box<dyn SerialPort>>,
    buffer_size: usize,
}

impl SerialChannel {
    /// Open `path` at `baud_rate` with the given read timeout.
    pub fn open(path: &str, baud_rate: u32, timeout: Duration) -> io::Result<Self> {
        let port = serialport::new(path, baud_rate)
            .timeout(timeout)
            .flow_control(serialport::FlowControl::None)
            .open()
            .map_err(io::Error::from)?;
        info!(path, baud_rate, "opened serial channel");
        Ok(Self::from_port(path, port))
    }

    /// Open the port described by `config`.
    pub fn from_config(config: &SerialConfig) -> io::Result<Self> {
        Self::open(&config.path, config.baud_rate, config.timeout)
    }

    /// Wrap an already opened port.
    pub fn from_port(name: impl Into<String>, port: Box<dyn SerialPort>) -> Self {
        // One second of data at the port's rate, 8N1, bounded to a sane range.
        let buffer_size = port
            .baud_rate()
            .map(|baud| (baud / 10) as usize)
            .unwrap_or(1024)
            .clamp(64, 8192);
        Self {
            name: name.into(),
            port: Some(port),
            buffer_size,
        }
    }

    fn port(&mut self) -> io::Result<&mut Box<dyn SerialPort>> {
        match self.port.as_mut() {
            Some(port) => Ok(port),
            None => Err(closed_error(&self.name)),
        }
    }
}

impl IoChannel for SerialChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.port()?.read(buf) {
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Err(io::ErrorKind::WouldBlock.into()),
            other => other,
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.port()?.write(buf) {
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Err(io::ErrorKind::WouldBlock.into()),
            other => other,
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.port.as_mut() {
            Some(port) => port.flush(),
            None => Ok(()),
        }
    }

    fn close(&mut self) -> io::Result<()> {
        self.port = None;
        Ok(())
    }

    fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config: SerialConfig = toml::from_str("path = \"/dev/ttyS3\"").unwrap();
        assert_eq!(config.baud_rate, 9600);
        assert_eq!(config.timeout, Duration::from_millis(100));

        let config: SerialConfig =
            toml::from_str("path = \"/dev/ttyS3\"\nbaud_rate = 115200\ntimeout = \"1s\"").unwrap();
        assert_eq!(config.baud_rate, 115_200);
        assert_eq!(config.timeout, Duration::from_secs(1));
        assert!(toml::from_str::<SerialConfig>("baud_rate = 9600").is_err());
    }

    #[test]
    fn missing_device_is_an_open_error() {
        let config = SerialConfig {
            path: "/dev/dsm-no-such-port".into(),
            baud_rate: 38_400,
            timeout: Duration::from_millis(10),
        };
        assert!(SerialChannel::from_config(&config).is_err());
    }
}
