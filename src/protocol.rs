//! ==============================================================================
//! protocol.rs - SQM command/response protocol
//! ==============================================================================
//!
//! purpose:
//!     encodes the three photometer commands, validates their replies and
//!     retries with a reconnect when a frame comes back wrong.
//!
//! grammar:
//!     ix -> i,<protocol>,<model>,<feature>,<serial>
//!     cx -> c,...                                  (opaque, kept for headers)
//!     rx -> r,<mag>m,<freq>Hz,<ticks>c,<period>s,<temp>C
//!
//! retry:
//!     a bad frame costs one try: wait, reconnect, wait, send again.
//!     the firmware sometimes truncates frames on a long-lived stream and a
//!     cold reconnect clears it. once the tries are spent the caller gets
//!     `DeviceUnresponsive`, never a placeholder frame.
//!
//! ==============================================================================

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::DeviceConfig;
use crate::error::DeviceError;
use crate::transport::{self, Transport};

/// Below this the frequency field loses resolution and the period is used.
const LOW_FREQUENCY_HZ: f64 = 30.0;
const MAX_REPLY_BYTES: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Identify,
    Calibration,
    Data,
}

impl Command {
    pub fn request(self) -> &'static [u8] {
        match self {
            Command::Identify => b"ix",
            Command::Calibration => b"cx",
            Command::Data => b"rx",
        }
    }

    /// First byte of a valid reply.
    pub fn marker(self) -> u8 {
        match self {
            Command::Identify => b'i',
            Command::Calibration => b'c',
            Command::Data => b'r',
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Command::Identify => "ix",
            Command::Calibration => "cx",
            Command::Data => "rx",
        }
    }
}

/// Numbers from the `ix` reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Identification {
    pub protocol: u32,
    pub model: u32,
    pub feature: u32,
    pub serial: u32,
}

impl Identification {
    pub fn parse(reply: &str) -> Result<Self, DeviceError> {
        let fields = fields_after_marker(reply, Command::Identify)?;
        if fields.len() < 4 {
            return Err(malformed(Command::Identify, format!("expected 4 fields, got {}", fields.len())));
        }
        let number = |i: usize| {
            fields[i].parse::<u32>().map_err(|_| {
                malformed(Command::Identify, format!("field {} is not a number: {:?}", i + 1, fields[i]))
            })
        };
        Ok(Self {
            protocol: number(0)?,
            model: number(1)?,
            feature: number(2)?,
            serial: number(3)?,
        })
    }
}

/// One decoded `rx` frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DataFrame {
    /// Sky brightness, mag/arcsec².
    pub magnitude: f64,
    /// Light-to-frequency output, Hz (already corrected at low light).
    pub frequency: f64,
    pub ticks: f64,
    /// Sensor period, seconds.
    pub period: f64,
    /// Sensor temperature, °C.
    pub temperature: f64,
}

impl DataFrame {
    pub fn parse(reply: &str) -> Result<Self, DeviceError> {
        let fields = fields_after_marker(reply, Command::Data)?;
        if fields.len() < 5 {
            return Err(malformed(Command::Data, format!("expected 5 fields, got {}", fields.len())));
        }
        let number = |i: usize| {
            let digits = fields[i].trim_end_matches(|c: char| c.is_ascii_alphabetic()).trim();
            digits.parse::<f64>().map_err(|_| {
                malformed(Command::Data, format!("field {} is not a number: {:?}", i + 1, fields[i]))
            })
        };

        let period = number(3)?;
        let mut frequency = number(1)?;
        if frequency < LOW_FREQUENCY_HZ && period > 0.0 {
            frequency = 1.0 / period;
        }

        Ok(Self {
            magnitude: number(0)?,
            frequency,
            ticks: number(2)?,
            period,
            temperature: number(4)?,
        })
    }
}

fn malformed(command: Command, reason: impl Into<String>) -> DeviceError {
    DeviceError::Malformed {
        command: command.name(),
        reason: reason.into(),
    }
}

/// Split `<marker>,a,b,...` into trimmed fields after the marker.
fn fields_after_marker(reply: &str, command: Command) -> Result<Vec<&str>, DeviceError> {
    let reply = reply.trim();
    let mut parts = reply.split(',');
    match parts.next() {
        Some(head) if head.as_bytes() == [command.marker()] => {}
        _ => return Err(malformed(command, format!("unexpected reply {reply:?}"))),
    }
    Ok(parts.map(str::trim).collect())
}

/// Expected reply lengths in bytes, terminator included. `None` skips the check.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResponseLengths {
    pub identify: Option<usize>,
    pub calibration: Option<usize>,
    pub data: Option<usize>,
}

impl ResponseLengths {
    fn for_command(&self, command: Command) -> Option<usize> {
        match command {
            Command::Identify => self.identify,
            Command::Calibration => self.calibration,
            Command::Data => self.data,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub tries: u32,
    pub backoff: Duration,
    /// Pause between a request and reading its reply.
    pub settle: Duration,
    pub receive_timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(device: &DeviceConfig) -> Self {
        Self {
            tries: device.read_tries.max(1),
            backoff: device.retry_backoff(),
            settle: device.settle(),
            receive_timeout: device.receive_timeout(),
        }
    }
}

/// Check one raw reply. Returns it without its line terminator.
pub fn validate(
    command: Command,
    raw: &[u8],
    expected_len: Option<usize>,
) -> Result<String, DeviceError> {
    if raw.is_empty() {
        return Err(malformed(command, "empty reply"));
    }
    if let Some(len) = expected_len {
        if raw.len() != len {
            return Err(malformed(command, format!("length {} (expected {})", raw.len(), len)));
        }
    }
    if raw[0] != command.marker() {
        return Err(malformed(command, format!("leading byte {:?}", raw[0] as char)));
    }

    let text = String::from_utf8_lossy(raw).trim_end().to_string();
    match command {
        Command::Identify => {
            Identification::parse(&text)?;
        }
        Command::Data => {
            DataFrame::parse(&text)?;
        }
        Command::Calibration => {}
    }
    Ok(text)
}

/// Owns the transport and runs validated, retried queries over it.
pub struct ProtocolEngine<T: Transport> {
    transport: T,
    policy: RetryPolicy,
    lengths: ResponseLengths,
    clock: Arc<dyn Clock>,
}

impl<T: Transport> ProtocolEngine<T> {
    pub fn new(transport: T, policy: RetryPolicy, lengths: ResponseLengths, clock: Arc<dyn Clock>) -> Self {
        Self {
            transport,
            policy,
            lengths,
            clock,
        }
    }

    #[cfg(test)]
    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    fn attempt(&mut self, command: Command) -> Result<String, DeviceError> {
        self.transport.send(command.request())?;
        self.clock.sleep(self.policy.settle);
        let raw = self
            .transport
            .receive(MAX_REPLY_BYTES, self.policy.receive_timeout)?;
        validate(command, &raw, self.lengths.for_command(command))
    }

    /// Send `command` until a valid reply arrives or the tries run out.
    pub fn query(&mut self, command: Command) -> Result<String, DeviceError> {
        let tries = self.policy.tries.max(1);
        for attempt in 1..=tries {
            match self.attempt(command) {
                Ok(reply) => return Ok(reply),
                Err(e) => {
                    warn!(
                        "[DEVICE] {} attempt {}/{} failed: {}. Reconnecting",
                        command.name(),
                        attempt,
                        tries,
                        e
                    );
                    self.clock.sleep(self.policy.backoff);
                    if let Err(e) = self.transport.reconnect() {
                        warn!("[DEVICE] Reconnect failed: {}", e);
                    }
                    self.clock.sleep(self.policy.backoff);
                }
            }
        }
        Err(DeviceError::DeviceUnresponsive {
            command: command.name(),
            tries,
        })
    }

    pub fn read_data(&mut self) -> Result<DataFrame, DeviceError> {
        let reply = self.query(Command::Data)?;
        DataFrame::parse(&reply)
    }
}

/// Raw replies captured when the session opened, surfaced in file headers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Readouts {
    pub identify: String,
    pub calibration: String,
    pub data: String,
}

/// A connected, identified photometer.
pub struct DeviceSession<T: Transport> {
    engine: ProtocolEngine<T>,
    address: String,
    identification: Identification,
    readouts: Readouts,
}

impl<T: Transport> DeviceSession<T> {
    /// Connect (fixed address first, discovery as fallback) and read ix/cx/rx.
    pub fn open(mut transport: T, device: &DeviceConfig, clock: Arc<dyn Clock>) -> Result<Self, DeviceError> {
        let address = transport::connect_with_fallback(&mut transport, device.address.as_deref())?;
        transport::drain(&mut transport);

        let lengths = ResponseLengths {
            identify: device.identify_length,
            calibration: device.calibration_length,
            data: device.data_length,
        };
        let mut engine = ProtocolEngine::new(transport, RetryPolicy::from_config(device), lengths, clock);

        let identify = engine.query(Command::Identify)?;
        let calibration = engine.query(Command::Calibration)?;
        let data = engine.query(Command::Data)?;
        let identification = Identification::parse(&identify)?;

        info!(
            "[DEVICE] Connected to {} (model {}, serial {}, protocol {}, feature {})",
            address,
            identification.model,
            identification.serial,
            identification.protocol,
            identification.feature
        );
        debug!("[DEVICE] ix: {}", identify);
        debug!("[DEVICE] cx: {}", calibration);
        debug!("[DEVICE] rx: {}", data);

        Ok(Self {
            engine,
            address,
            identification,
            readouts: Readouts {
                identify,
                calibration,
                data,
            },
        })
    }

    pub fn read_data(&mut self) -> Result<DataFrame, DeviceError> {
        self.engine.read_data()
    }

    /// Close and reopen the transport on the same address.
    pub fn reset(&mut self) -> Result<(), DeviceError> {
        info!("[DEVICE] Resetting connection to {}", self.address);
        self.engine.transport_mut().reconnect()
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn identification(&self) -> &Identification {
        &self.identification
    }

    pub fn readouts(&self) -> &Readouts {
        &self.readouts
    }

    #[cfg(test)]
    pub fn transport_mut(&mut self) -> &mut T {
        self.engine.transport_mut()
    }
}
