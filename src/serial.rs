//! ==============================================================================
//! serial.rs - SQM-LU transport (USB serial)
//! ==============================================================================
//!
//! purpose:
//!     talks to the USB photometer through its FTDI serial bridge.
//!     replies are CRLF-terminated lines, so `receive` reads one line.
//!
//! discovery:
//!     probes every candidate port name for the platform, sends `ix` and
//!     keeps the first port whose reply starts with `i`.
//!
//! ==============================================================================

use std::io::{Read, Write};
use std::time::{Duration, Instant};

use serialport::SerialPort;
use tracing::{debug, info};

use crate::error::DeviceError;
use crate::protocol::Command;
use crate::transport::Transport;

pub const DEFAULT_BAUD_RATE: u32 = 115_200;

const PROBE_TIMEOUT: Duration = Duration::from_secs(1);
const SESSION_TIMEOUT: Duration = Duration::from_secs(2);
const CLOSE_DRAIN_MAX_READS: usize = 16;

pub struct SerialTransport {
    baud_rate: u32,
    address: Option<String>,
    port: Option<Box<dyn SerialPort>>,
}

impl SerialTransport {
    pub fn new(baud_rate: u32) -> Self {
        Self {
            baud_rate,
            address: None,
            port: None,
        }
    }

    fn open(&self, name: &str, timeout: Duration) -> Result<Box<dyn SerialPort>, DeviceError> {
        let port = serialport::new(name, self.baud_rate)
            .timeout(timeout)
            .flow_control(serialport::FlowControl::None)
            .open()?;
        Ok(port)
    }

    fn probe(&self, name: &str) -> Result<bool, DeviceError> {
        let mut port = self.open(name, PROBE_TIMEOUT)?;
        port.write_all(Command::Identify.request())?;
        let reply = read_line(&mut *port, 256, PROBE_TIMEOUT)?;
        Ok(reply.first() == Some(&Command::Identify.marker()))
    }
}

/// Platform-specific port names worth probing, OS-enumerated ports first.
pub fn candidate_ports() -> Vec<String> {
    let mut ports: Vec<String> = serialport::available_ports()
        .map(|found| found.into_iter().map(|p| p.port_name).collect())
        .unwrap_or_default();

    #[cfg(target_os = "windows")]
    let fixed = (1..100).map(|n| format!("COM{n}"));
    #[cfg(not(target_os = "windows"))]
    let fixed = (0..100).map(|n| format!("/dev/ttyUSB{n}"));

    for name in fixed {
        if !ports.contains(&name) {
            ports.push(name);
        }
    }
    ports
}

/// Read until newline, `max_bytes` or `timeout`. A partial line is returned
/// as-is; nothing at all is a timeout.
fn read_line<R: Read + ?Sized>(
    reader: &mut R,
    max_bytes: usize,
    timeout: Duration,
) -> Result<Vec<u8>, DeviceError> {
    let deadline = Instant::now() + timeout;
    let mut line = Vec::with_capacity(64);
    let mut byte = [0u8; 1];

    while line.len() < max_bytes && Instant::now() < deadline {
        match reader.read(&mut byte) {
            Ok(1) => {
                line.push(byte[0]);
                if byte[0] == b'\n' {
                    break;
                }
            }
            Ok(_) => break,
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => break,
            Err(e) => return Err(DeviceError::from_read(e, "receive")),
        }
    }

    if line.is_empty() {
        return Err(DeviceError::TransportTimeout("receive"));
    }
    Ok(line)
}

impl Transport for SerialTransport {
    fn kind(&self) -> &'static str {
        "serial"
    }

    fn discover(&mut self) -> Result<String, DeviceError> {
        info!("[DISCOVERY] Scanning serial ports");
        for name in candidate_ports() {
            match self.probe(&name) {
                Ok(true) => return Ok(name),
                Ok(false) => debug!("[DISCOVERY] {} answered, but not as a photometer", name),
                Err(e) => debug!("[DISCOVERY] {}: {}", name, e),
            }
        }
        Err(DeviceError::NotFound("no serial port answered ix".into()))
    }

    fn connect(&mut self, address: &str) -> Result<(), DeviceError> {
        self.close();
        let port = self.open(address, SESSION_TIMEOUT)?;
        debug!("[DEVICE] Opened {} at {} baud", address, self.baud_rate);
        self.port = Some(port);
        self.address = Some(address.to_string());
        Ok(())
    }

    fn send(&mut self, bytes: &[u8]) -> Result<(), DeviceError> {
        let port = self.port.as_mut().ok_or(DeviceError::NotConnected)?;
        port.write_all(bytes)
            .map_err(|e| DeviceError::from_read(e, "send"))
    }

    fn receive(&mut self, max_bytes: usize, timeout: Duration) -> Result<Vec<u8>, DeviceError> {
        let port = self.port.as_mut().ok_or(DeviceError::NotConnected)?;
        port.set_timeout(timeout.max(Duration::from_millis(1)))?;
        read_line(&mut **port, max_bytes.max(1), timeout)
    }

    fn close(&mut self) {
        let Some(mut port) = self.port.take() else {
            return;
        };
        if port.set_timeout(Duration::from_millis(200)).is_ok() {
            for _ in 0..CLOSE_DRAIN_MAX_READS {
                if read_line(&mut *port, 256, Duration::from_millis(200)).is_err() {
                    break;
                }
            }
        }
    }

    fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn reads_one_line_at_a_time() {
        let mut input = Cursor::new(b"i,00000004,00000003\r\nr,19.29m\r\n".to_vec());
        let first = read_line(&mut input, 256, Duration::from_secs(1)).unwrap();
        assert_eq!(first, b"i,00000004,00000003\r\n");
        let second = read_line(&mut input, 256, Duration::from_secs(1)).unwrap();
        assert_eq!(second, b"r,19.29m\r\n");
        assert!(matches!(
            read_line(&mut input, 256, Duration::from_secs(1)),
            Err(DeviceError::TransportTimeout(_))
        ));
    }

    #[test]
    fn partial_line_is_returned_and_capped() {
        let mut input = Cursor::new(b"r,19.2".to_vec());
        assert_eq!(read_line(&mut input, 256, Duration::from_secs(1)).unwrap(), b"r,19.2");

        let mut input = Cursor::new(b"abcdefgh\n".to_vec());
        assert_eq!(read_line(&mut input, 4, Duration::from_secs(1)).unwrap(), b"abcd");
    }

    #[test]
    fn candidates_cover_the_platform_names() {
        let ports = candidate_ports();
        #[cfg(not(target_os = "windows"))]
        assert!(ports.iter().any(|p| p == "/dev/ttyUSB0"));
        #[cfg(target_os = "windows")]
        assert!(ports.iter().any(|p| p == "COM1"));
    }

    #[test]
    fn unconnected_port_refuses_io() {
        let mut transport = SerialTransport::new(DEFAULT_BAUD_RATE);
        assert!(matches!(transport.send(b"rx"), Err(DeviceError::NotConnected)));
        assert!(matches!(
            transport.receive(64, Duration::from_millis(10)),
            Err(DeviceError::NotConnected)
        ));
    }
}
