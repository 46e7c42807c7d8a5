//! ==============================================================================
//! transport.rs - byte-stream channel to the photometer
//! ==============================================================================
//!
//! purpose:
//!     one interface for both photometer flavours so the protocol engine
//!     never knows whether it is talking to a socket or a serial port.
//!
//! design:
//!     - network.rs: SQM-LE, TCP with UDP broadcast discovery
//!     - serial.rs: SQM-LU, USB serial with port scan discovery
//!     - every blocking call carries a timeout, so a dead device can stall
//!       a cycle but never the daemon.
//!
//! relationships:
//!     - used by: protocol.rs (ProtocolEngine owns a Transport)
//!     - built by: main.rs via `for_device`
//!
//! ==============================================================================

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::{DeviceConfig, DeviceKind};
use crate::error::DeviceError;
use crate::network::NetworkTransport;
use crate::serial::SerialTransport;

/// Upper bound on reads spent discarding stale input.
const DRAIN_MAX_READS: usize = 16;
const DRAIN_TIMEOUT: Duration = Duration::from_millis(300);

pub trait Transport {
    /// Short label for logs ("tcp", "serial").
    fn kind(&self) -> &'static str;

    /// Find a device without a configured address.
    fn discover(&mut self) -> Result<String, DeviceError>;

    fn connect(&mut self, address: &str) -> Result<(), DeviceError>;

    fn send(&mut self, bytes: &[u8]) -> Result<(), DeviceError>;

    /// Read at most `max_bytes`, waiting no longer than `timeout`.
    fn receive(&mut self, max_bytes: usize, timeout: Duration) -> Result<Vec<u8>, DeviceError>;

    /// Tear down the channel. The last address is kept for `reconnect`.
    fn close(&mut self);

    /// Address of the current (or last) connection.
    fn address(&self) -> Option<&str>;

    fn reconnect(&mut self) -> Result<(), DeviceError> {
        let address = self
            .address()
            .map(str::to_owned)
            .ok_or(DeviceError::NotConnected)?;
        self.close();
        self.connect(&address)
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn kind(&self) -> &'static str {
        (**self).kind()
    }

    fn discover(&mut self) -> Result<String, DeviceError> {
        (**self).discover()
    }

    fn connect(&mut self, address: &str) -> Result<(), DeviceError> {
        (**self).connect(address)
    }

    fn send(&mut self, bytes: &[u8]) -> Result<(), DeviceError> {
        (**self).send(bytes)
    }

    fn receive(&mut self, max_bytes: usize, timeout: Duration) -> Result<Vec<u8>, DeviceError> {
        (**self).receive(max_bytes, timeout)
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn address(&self) -> Option<&str> {
        (**self).address()
    }

    fn reconnect(&mut self) -> Result<(), DeviceError> {
        (**self).reconnect()
    }
}

/// Build the transport matching the configured photometer.
pub fn for_device(device: &DeviceConfig) -> Box<dyn Transport> {
    match device.kind {
        DeviceKind::Network => Box::new(NetworkTransport::new(device.tcp_port)),
        DeviceKind::Serial => Box::new(SerialTransport::new(device.baud_rate)),
    }
}

/// Connect to `preferred` if given, falling back to discovery.
pub fn connect_with_fallback<T: Transport + ?Sized>(
    transport: &mut T,
    preferred: Option<&str>,
) -> Result<String, DeviceError> {
    if let Some(address) = preferred {
        info!("[DEVICE] Trying fixed {} address {}", transport.kind(), address);
        match transport.connect(address) {
            Ok(()) => return Ok(address.to_string()),
            Err(e) => warn!("[DEVICE] Fixed address failed: {}", e),
        }
    }

    info!("[DEVICE] Trying auto {} discovery", transport.kind());
    let address = transport.discover()?;
    info!("[DEVICE] Found device at {}", address);
    transport.connect(&address)?;
    Ok(address)
}

/// Read and discard whatever the device still has queued.
pub fn drain<T: Transport + ?Sized>(transport: &mut T) -> Vec<u8> {
    let mut discarded = Vec::new();
    for _ in 0..DRAIN_MAX_READS {
        match transport.receive(256, DRAIN_TIMEOUT) {
            Ok(bytes) if !bytes.is_empty() => discarded.extend(bytes),
            _ => break,
        }
    }
    if !discarded.is_empty() {
        debug!(
            "[DEVICE] Discarded stale input: {:?}",
            String::from_utf8_lossy(&discarded)
        );
    }
    discarded
}

#[cfg(test)]
pub mod mock {
    use std::collections::VecDeque;
    use std::time::Duration;

    use super::Transport;
    use crate::error::DeviceError;

    pub const IDENTIFY_REPLY: &str = "i,00000004,00000003,00000023,00002142\r\n";
    pub const CALIBRATION_REPLY: &str =
        "c,00000019.84m,0000151.517s, 022.2C,00000008.71m, 023.2C\r\n";
    pub const DATA_REPLY: &str =
        "r, 19.29m,0000005915Hz,0000000000c,0000000.000s, 027.0C\r\n";

    /// In-memory photometer answering ix/cx/rx from a script.
    pub struct ScriptedTransport {
        pub identify: String,
        pub calibration: String,
        /// Replies to `rx`, consumed in order before falling back to `default_data`.
        pub data: VecDeque<String>,
        pub default_data: String,
        pub discovered: Option<String>,
        pub refuse: Vec<String>,
        pub sends: usize,
        pub connects: usize,
        pub reconnects: usize,
        pub closes: usize,
        address: Option<String>,
        pending: Option<Vec<u8>>,
    }

    impl ScriptedTransport {
        pub fn healthy() -> Self {
            Self {
                identify: IDENTIFY_REPLY.to_string(),
                calibration: CALIBRATION_REPLY.to_string(),
                data: VecDeque::new(),
                default_data: DATA_REPLY.to_string(),
                discovered: Some("10.0.0.7".to_string()),
                refuse: Vec::new(),
                sends: 0,
                connects: 0,
                reconnects: 0,
                closes: 0,
                address: None,
                pending: None,
            }
        }

        /// A device that answers every command with garbage.
        pub fn malformed() -> Self {
            let mut transport = Self::healthy();
            transport.identify = "garbage\r\n".to_string();
            transport.calibration = "garbage\r\n".to_string();
            transport.default_data = "garbage\r\n".to_string();
            transport
        }

        pub fn with_data<I: IntoIterator<Item = S>, S: Into<String>>(mut self, frames: I) -> Self {
            self.data.extend(frames.into_iter().map(Into::into));
            self
        }
    }

    impl Transport for ScriptedTransport {
        fn kind(&self) -> &'static str {
            "mock"
        }

        fn discover(&mut self) -> Result<String, DeviceError> {
            self.discovered
                .clone()
                .ok_or_else(|| DeviceError::NotFound("no reply".to_string()))
        }

        fn connect(&mut self, address: &str) -> Result<(), DeviceError> {
            self.connects += 1;
            if self.refuse.iter().any(|a| a == address) {
                return Err(DeviceError::TransportTimeout("connect"));
            }
            self.address = Some(address.to_string());
            Ok(())
        }

        fn send(&mut self, bytes: &[u8]) -> Result<(), DeviceError> {
            self.sends += 1;
            self.pending = Some(bytes.to_vec());
            Ok(())
        }

        fn receive(&mut self, _max: usize, _timeout: Duration) -> Result<Vec<u8>, DeviceError> {
            let request = self
                .pending
                .take()
                .ok_or(DeviceError::TransportTimeout("receive"))?;
            let reply = match request.as_slice() {
                b"ix" => self.identify.clone(),
                b"cx" => self.calibration.clone(),
                b"rx" => self
                    .data
                    .pop_front()
                    .unwrap_or_else(|| self.default_data.clone()),
                _ => String::new(),
            };
            Ok(reply.into_bytes())
        }

        fn close(&mut self) {
            self.closes += 1;
            self.pending = None;
        }

        fn address(&self) -> Option<&str> {
            self.address.as_deref()
        }

        fn reconnect(&mut self) -> Result<(), DeviceError> {
            self.reconnects += 1;
            let address = self.address.clone().ok_or(DeviceError::NotConnected)?;
            self.close();
            self.connect(&address)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::ScriptedTransport;
    use super::*;

    #[test]
    fn fixed_address_is_preferred() {
        let mut transport = ScriptedTransport::healthy();
        let address = connect_with_fallback(&mut transport, Some("192.168.1.50")).unwrap();
        assert_eq!(address, "192.168.1.50");
        assert_eq!(transport.address(), Some("192.168.1.50"));
    }

    #[test]
    fn falls_back_to_discovery_when_fixed_address_fails() {
        let mut transport = ScriptedTransport::healthy();
        transport.refuse.push("192.168.1.50".to_string());
        let address = connect_with_fallback(&mut transport, Some("192.168.1.50")).unwrap();
        assert_eq!(address, "10.0.0.7");
        assert_eq!(transport.connects, 2);
    }

    #[test]
    fn discovery_failure_is_not_found() {
        let mut transport = ScriptedTransport::healthy();
        transport.discovered = None;
        let err = connect_with_fallback(&mut transport, None).unwrap_err();
        assert!(matches!(err, DeviceError::NotFound(_)));
    }

    #[test]
    fn default_reconnect_needs_a_previous_address() {
        struct Never;
        impl Transport for Never {
            fn kind(&self) -> &'static str {
                "never"
            }
            fn discover(&mut self) -> Result<String, DeviceError> {
                Err(DeviceError::NotFound("never".into()))
            }
            fn connect(&mut self, _: &str) -> Result<(), DeviceError> {
                Ok(())
            }
            fn send(&mut self, _: &[u8]) -> Result<(), DeviceError> {
                Ok(())
            }
            fn receive(&mut self, _: usize, _: Duration) -> Result<Vec<u8>, DeviceError> {
                Err(DeviceError::TransportTimeout("receive"))
            }
            fn close(&mut self) {}
            fn address(&self) -> Option<&str> {
                None
            }
        }
        assert!(matches!(Never.reconnect(), Err(DeviceError::NotConnected)));
    }

    #[test]
    fn drain_stops_on_timeout() {
        let mut transport = ScriptedTransport::healthy();
        transport.send(b"ix").unwrap();
        let discarded = drain(&mut transport);
        assert!(String::from_utf8_lossy(&discarded).starts_with("i,"));
    }
}
