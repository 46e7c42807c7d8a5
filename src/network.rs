//! ==============================================================================
//! network.rs - SQM-LE transport (TCP + UDP broadcast discovery)
//! ==============================================================================
//!
//! purpose:
//!     talks to the ethernet photometer. the device answers a 4-byte magic
//!     datagram broadcast on port 30718 and serves its command interface on
//!     TCP port 10001.
//!
//! teardown:
//!     pending input is drained, then the socket is closed with linger-off
//!     (RST). the firmware handles a fresh connection better than a
//!     half-closed one.
//!
//! ==============================================================================

use std::io::{Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};
use std::time::{Duration, Instant};

use socket2::SockRef;
use tracing::{debug, info};

use crate::error::DeviceError;
use crate::transport::Transport;

pub const DEFAULT_PORT: u16 = 10001;

const DISCOVERY_PORT: u16 = 30718;
const DISCOVERY_PROBE: &str = "000000f6";
const DISCOVERY_REPLY_MARKER: u8 = 0xf7;
const DISCOVERY_WINDOW: Duration = Duration::from_secs(3);
const DISCOVERY_POLL: Duration = Duration::from_millis(250);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);
const CLOSE_DRAIN_TIMEOUT: Duration = Duration::from_millis(200);
const CLOSE_DRAIN_MAX_READS: usize = 16;

pub struct NetworkTransport {
    port: u16,
    address: Option<String>,
    stream: Option<TcpStream>,
}

impl NetworkTransport {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            address: None,
            stream: None,
        }
    }

    fn stream(&mut self) -> Result<&mut TcpStream, DeviceError> {
        self.stream.as_mut().ok_or(DeviceError::NotConnected)
    }

    fn resolve(&self, address: &str) -> Result<Vec<SocketAddr>, DeviceError> {
        if let Ok(addr) = address.parse::<SocketAddr>() {
            return Ok(vec![addr]);
        }
        let addrs: Vec<SocketAddr> = (address, self.port).to_socket_addrs()?.collect();
        if addrs.is_empty() {
            return Err(DeviceError::NotFound(format!("{address} does not resolve")));
        }
        Ok(addrs)
    }
}

/// Parse one discovery reply: `Some(mac)` when it comes from a photometer.
fn parse_discovery_reply(reply: &[u8]) -> Option<String> {
    if reply.len() < 4 || reply[3] != DISCOVERY_REPLY_MARKER {
        return None;
    }
    Some(reply.get(24..30).map(hex::encode).unwrap_or_default())
}

impl Transport for NetworkTransport {
    fn kind(&self) -> &'static str {
        "tcp"
    }

    fn discover(&mut self) -> Result<String, DeviceError> {
        let probe = hex::decode(DISCOVERY_PROBE).map_err(|e| DeviceError::NotFound(e.to_string()))?;

        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.set_broadcast(true)?;
        socket.set_read_timeout(Some(DISCOVERY_POLL))?;
        socket.send_to(&probe, (Ipv4Addr::BROADCAST, DISCOVERY_PORT))?;
        info!("[DISCOVERY] Looking for replies ({}s window)", DISCOVERY_WINDOW.as_secs());

        let mut first: Option<IpAddr> = None;
        let mut buf = [0u8; 64];
        let deadline = Instant::now() + DISCOVERY_WINDOW;
        while Instant::now() < deadline {
            match socket.recv_from(&mut buf) {
                Ok((n, from)) => {
                    if let Some(mac) = parse_discovery_reply(&buf[..n]) {
                        info!("[DISCOVERY] Reply from {} (MAC {})", from.ip(), mac);
                        first.get_or_insert(from.ip());
                    }
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) => {}
                Err(e) => return Err(e.into()),
            }
        }

        first
            .map(|ip| ip.to_string())
            .ok_or_else(|| DeviceError::NotFound("no photometer answered the broadcast".into()))
    }

    fn connect(&mut self, address: &str) -> Result<(), DeviceError> {
        self.close();

        let mut last_error = DeviceError::NotFound(address.to_string());
        for target in self.resolve(address)? {
            match TcpStream::connect_timeout(&target, CONNECT_TIMEOUT) {
                Ok(stream) => {
                    SockRef::from(&stream).set_linger(Some(Duration::ZERO))?;
                    stream.set_nodelay(true)?;
                    debug!("[DEVICE] Connected to {}", target);
                    self.stream = Some(stream);
                    self.address = Some(address.to_string());
                    return Ok(());
                }
                Err(e) => last_error = DeviceError::from_read(e, "connect"),
            }
        }
        Err(last_error)
    }

    fn send(&mut self, bytes: &[u8]) -> Result<(), DeviceError> {
        let stream = self.stream()?;
        stream
            .write_all(bytes)
            .map_err(|e| DeviceError::from_read(e, "send"))
    }

    fn receive(&mut self, max_bytes: usize, timeout: Duration) -> Result<Vec<u8>, DeviceError> {
        let stream = self.stream()?;
        // a zero timeout means "block forever" to std; never allow that
        stream.set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;

        let mut buf = vec![0u8; max_bytes.max(1)];
        match stream.read(&mut buf) {
            Ok(0) => Err(DeviceError::TransportClosed),
            Ok(n) => {
                buf.truncate(n);
                Ok(buf)
            }
            Err(e) => Err(DeviceError::from_read(e, "receive")),
        }
    }

    fn close(&mut self) {
        let Some(mut stream) = self.stream.take() else {
            return;
        };

        if stream.set_read_timeout(Some(CLOSE_DRAIN_TIMEOUT)).is_ok() {
            let mut buf = [0u8; 256];
            for _ in 0..CLOSE_DRAIN_MAX_READS {
                match stream.read(&mut buf) {
                    Ok(n) if n > 0 => continue,
                    _ => break,
                }
            }
        }
        // linger is zero, so dropping the stream resets the connection
        drop(stream);
    }

    fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }
}

impl Drop for NetworkTransport {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;
    use std::thread;

    use super::*;

    #[test]
    fn discovery_reply_needs_marker() {
        let mut reply = vec![0u8; 30];
        reply[3] = 0xf7;
        reply[24..30].copy_from_slice(&[0x00, 0x04, 0xa3, 0x12, 0x34, 0x56]);
        assert_eq!(parse_discovery_reply(&reply).as_deref(), Some("0004a3123456"));

        reply[3] = 0xf6;
        assert_eq!(parse_discovery_reply(&reply), None);
        assert_eq!(parse_discovery_reply(&[0, 0]), None);
    }

    #[test]
    fn short_discovery_reply_has_no_mac() {
        assert_eq!(parse_discovery_reply(&[0, 0, 0, 0xf7]).as_deref(), Some(""));
    }

    #[test]
    fn request_response_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut request = [0u8; 2];
            conn.read_exact(&mut request).unwrap();
            assert_eq!(&request, b"rx");
            conn.write_all(b"r, 19.29m,0000005915Hz,0000000000c,0000000.000s, 027.0C\r\n")
                .unwrap();
        });

        let mut transport = NetworkTransport::new(addr.port());
        transport.connect(&addr.to_string()).unwrap();
        transport.send(b"rx").unwrap();
        let reply = transport.receive(256, Duration::from_secs(5)).unwrap();
        assert!(reply.starts_with(b"r,"));
        server.join().unwrap();

        transport.close();
        assert!(matches!(
            transport.send(b"rx"),
            Err(DeviceError::NotConnected)
        ));
        assert_eq!(transport.address(), Some(addr.to_string().as_str()));
    }

    #[test]
    fn silent_device_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut transport = NetworkTransport::new(addr.port());
        transport.connect(&addr.to_string()).unwrap();
        let (_conn, _) = listener.accept().unwrap();

        let err = transport.receive(256, Duration::from_millis(50)).unwrap_err();
        assert!(matches!(err, DeviceError::TransportTimeout("receive")));
    }
}
