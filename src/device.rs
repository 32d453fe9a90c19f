/*! Device façade: a typed view of the physical registers built on top of
the frame codec, value interpreters and transport.

Enforces transaction-id correlation and caches the last successful
readings. Not thread-safe on its own — [`crate::daemon`] wraps a `Device`
in a reentrant mutex so a worker recovering from a transport loss can
call [`Device::disconnect`] and [`Device::connect`] while still holding
the guard that serializes exchanges.
*/

use std::time::{Duration, SystemTime};

use crate::error::{Error, ProtocolError, Result};
use crate::frame::{self, Frame, FunctionCode};
use crate::transport::Transport;
use crate::values;

/// Number of metering channels the device exposes.
pub const CHANNEL_COUNT: usize = 50;

const UNIT_ID: u8 = 1;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

const REVISION_ADDR: u16 = 0x0578;
const REVISION_QTY: u16 = 3;
const SERIAL_ADDR: u16 = 0x2710;
const SERIAL_QTY: u16 = 2;
const CHANNELS_ADDR: u16 = 0x0080;
const CHANNELS_QTY: u16 = 2 * CHANNEL_COUNT as u16;

/// Hardware input-register address of channel `k` (1-indexed, `1..=50`).
pub fn channel_address(k: usize) -> u16 {
    CHANNELS_ADDR + 2 * (k as u16 - 1)
}

/// A typed view of the metering device's registers.
pub struct Device {
    host: String,
    service: String,
    transport: Transport,
    timeout: Duration,
    next_tx: u16,
    revision: String,
    serial: u32,
    channels: [u32; CHANNEL_COUNT],
    steady_read_at: Option<SystemTime>,
    last_update: Option<SystemTime>,
}

impl Device {
    /// Create a façade for the device at `(host, service)`. Nothing is
    /// connected yet; call [`Device::connect`] first.
    pub fn new(host: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            service: service.into(),
            transport: Transport::new(),
            timeout: DEFAULT_TIMEOUT,
            next_tx: 0,
            revision: String::new(),
            serial: 0,
            channels: [0; CHANNEL_COUNT],
            steady_read_at: None,
            last_update: None,
        }
    }

    /// Override the per-exchange timeout (default 1 second). Exposed mainly
    /// so tests and the daemon's reconnect loop don't have to wait a full
    /// second to observe a timeout.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Open the underlying TCP connection.
    pub fn connect(&mut self) -> Result<()> {
        self.transport.open(&self.host, &self.service)
    }

    /// Close the underlying TCP connection. Idempotent.
    pub fn disconnect(&mut self) {
        self.transport.close();
    }

    fn next_transaction_id(&mut self) -> u16 {
        let tx = self.next_tx;
        self.next_tx = self.next_tx.wrapping_add(1);
        tx
    }

    /// Run one request/response exchange and validate it per §4.D: exception
    /// responses become `Protocol::Exception`, a frame of the wrong kind
    /// becomes `UnexpectedFrame`, a transaction-id mismatch becomes `Desync`,
    /// and a short register count becomes `Truncated`.
    fn exchange_checked(&mut self, function: FunctionCode, addr: u16, qty: u16) -> Result<Vec<u8>> {
        let tx = self.next_transaction_id();
        let request = match function {
            FunctionCode::ReadHoldingRegisters => frame::encode_read_holding(tx, UNIT_ID, addr, qty)?,
            FunctionCode::ReadInputRegisters => frame::encode_read_input(tx, UNIT_ID, addr, qty)?,
        };
        let response = self.transport.exchange(&request, self.timeout)?;
        let parsed = frame::parse(&response)?;

        if let Frame::ErrorResponse {
            function_code,
            exception,
            ..
        } = &parsed
        {
            if *function_code == function.code() {
                return Err(ProtocolError::Exception(*exception).into());
            }
        }

        let (resp_tx, payload) = match &parsed {
            Frame::ReadHoldingResponse { tx, payload } if function == FunctionCode::ReadHoldingRegisters => {
                (*tx, payload)
            }
            Frame::ReadInputResponse { tx, payload } if function == FunctionCode::ReadInputRegisters => {
                (*tx, payload)
            }
            _ => return Err(ProtocolError::UnexpectedFrame.into()),
        };

        if resp_tx != tx {
            return Err(ProtocolError::Desync.into());
        }
        if values::as_u16_array(payload)?.len() != qty as usize {
            return Err(ProtocolError::Truncated.into());
        }
        Ok(payload.clone())
    }

    /// Read the revision string and serial number (three and two holding
    /// registers respectively) and cache both together. On any failure,
    /// neither cache is touched.
    pub fn read_steady(&mut self) -> Result<()> {
        let revision_payload = self.exchange_checked(FunctionCode::ReadHoldingRegisters, REVISION_ADDR, REVISION_QTY)?;
        let serial_payload = self.exchange_checked(FunctionCode::ReadHoldingRegisters, SERIAL_ADDR, SERIAL_QTY)?;
        let serial = values::as_u32_array(&serial_payload)?[0];
        self.revision = values::as_ascii(&revision_payload);
        self.serial = serial;
        self.steady_read_at = Some(SystemTime::now());
        Ok(())
    }

    /// Read all 50 channels (100 input registers) and cache them along with
    /// the update timestamp.
    pub fn update_volatile(&mut self) -> Result<()> {
        let payload = self.exchange_checked(FunctionCode::ReadInputRegisters, CHANNELS_ADDR, CHANNELS_QTY)?;
        let values = values::as_u32_array(&payload)?;
        self.channels.copy_from_slice(&values);
        self.last_update = Some(SystemTime::now());
        Ok(())
    }

    /// Cached revision string. Fails with [`Error::NotYetRead`] until
    /// [`Device::read_steady`] has succeeded once.
    pub fn revision(&self) -> Result<&str> {
        if self.steady_read_at.is_none() {
            return Err(Error::NotYetRead("revision"));
        }
        Ok(&self.revision)
    }

    /// Cached serial number. Fails with [`Error::NotYetRead`] until
    /// [`Device::read_steady`] has succeeded once.
    pub fn serial_number(&self) -> Result<u32> {
        if self.steady_read_at.is_none() {
            return Err(Error::NotYetRead("serial number"));
        }
        Ok(self.serial)
    }

    /// Cached value of channel `i`, zero-indexed in `[0, 50)`. Fails with
    /// [`Error::OutOfRange`] if `i` is out of bounds, or
    /// [`Error::NotYetRead`] until [`Device::update_volatile`] has succeeded
    /// once.
    pub fn channel(&self, i: usize) -> Result<u32> {
        if i >= CHANNEL_COUNT {
            return Err(Error::OutOfRange(i));
        }
        if self.last_update.is_none() {
            return Err(Error::NotYetRead("channels"));
        }
        Ok(self.channels[i])
    }

    /// Timestamp of the last successful [`Device::update_volatile`], absent
    /// until the first success.
    pub fn last_update(&self) -> Option<SystemTime> {
        self.last_update
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    fn channel_payload(values: &[u32; CHANNEL_COUNT]) -> Vec<u8> {
        let mut payload = Vec::with_capacity(CHANNEL_COUNT * 4);
        for v in values {
            payload.extend_from_slice(&v.to_be_bytes());
        }
        payload
    }

    fn respond(stream: &mut std::net::TcpStream, tx: u16, unit: u8, func: u8, payload: &[u8]) {
        let length = (payload.len() + 3) as u16;
        let mut resp = Vec::new();
        resp.extend_from_slice(&tx.to_be_bytes());
        resp.extend_from_slice(&0u16.to_be_bytes());
        resp.extend_from_slice(&length.to_be_bytes());
        resp.push(unit);
        resp.push(func);
        resp.push(payload.len() as u8);
        resp.extend_from_slice(payload);
        stream.write_all(&resp).unwrap();
    }

    /// Like `respond`, but for an exception response: no byte-count prefix,
    /// just the single exception-code byte.
    fn respond_exception(stream: &mut std::net::TcpStream, tx: u16, unit: u8, func: u8, exception_code: u8) {
        let mut resp = Vec::new();
        resp.extend_from_slice(&tx.to_be_bytes());
        resp.extend_from_slice(&0u16.to_be_bytes());
        resp.extend_from_slice(&3u16.to_be_bytes());
        resp.push(unit);
        resp.push(func);
        resp.push(exception_code);
        stream.write_all(&resp).unwrap();
    }

    fn read_request(stream: &mut std::net::TcpStream) -> (u16, u16, u16) {
        let mut header = [0u8; 8];
        stream.read_exact(&mut header).unwrap();
        let tx = u16::from_be_bytes([header[0], header[1]]);
        let mut rest = [0u8; 4];
        stream.read_exact(&mut rest).unwrap();
        let addr = u16::from_be_bytes([rest[0], rest[1]]);
        let qty = u16::from_be_bytes([rest[2], rest[3]]);
        (tx, addr, qty)
    }

    #[test]
    fn channel_address_matches_hardware_map() {
        assert_eq!(channel_address(1), 0x0080);
        assert_eq!(channel_address(50), 0x00E2);
        for k in 1..=50 {
            assert_eq!(channel_address(k), 0x0080 + 2 * (k as u16 - 1));
        }
    }

    #[test]
    fn caches_are_empty_before_first_read() {
        let dev = Device::new("localhost", "502");
        assert!(matches!(dev.revision(), Err(Error::NotYetRead(_))));
        assert!(matches!(dev.serial_number(), Err(Error::NotYetRead(_))));
        assert!(matches!(dev.channel(0), Err(Error::NotYetRead(_))));
        assert!(dev.last_update().is_none());
    }

    #[test]
    fn channel_out_of_range() {
        let dev = Device::new("localhost", "502");
        assert!(matches!(dev.channel(50), Err(Error::OutOfRange(50))));
    }

    #[test]
    fn read_steady_and_update_volatile_populate_caches() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let (tx, req_addr, qty) = read_request(&mut stream);
            assert_eq!(req_addr, REVISION_ADDR);
            assert_eq!(qty, REVISION_QTY);
            respond(&mut stream, tx, 1, 0x03, b"v1.0\0\0");

            let (tx, req_addr, qty) = read_request(&mut stream);
            assert_eq!(req_addr, SERIAL_ADDR);
            assert_eq!(qty, SERIAL_QTY);
            respond(&mut stream, tx, 1, 0x03, &123_456u32.to_be_bytes());

            let (tx, req_addr, qty) = read_request(&mut stream);
            assert_eq!(req_addr, CHANNELS_ADDR);
            assert_eq!(qty, CHANNELS_QTY);
            let mut values = [0u32; CHANNEL_COUNT];
            values[0] = 42;
            values[49] = 7;
            respond(&mut stream, tx, 1, 0x04, &channel_payload(&values));
        });

        let mut dev = Device::new(addr.ip().to_string(), addr.port().to_string());
        dev.connect().unwrap();
        dev.read_steady().unwrap();
        assert_eq!(dev.revision().unwrap(), "v1.0");
        assert_eq!(dev.serial_number().unwrap(), 123_456);

        dev.update_volatile().unwrap();
        assert_eq!(dev.channel(0).unwrap(), 42);
        assert_eq!(dev.channel(49).unwrap(), 7);
        assert!(dev.last_update().is_some());

        server.join().unwrap();
    }

    #[test]
    fn desync_leaves_cache_untouched() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let (tx, _, _) = read_request(&mut stream);
            // Respond with a mismatched transaction id.
            respond(&mut stream, tx.wrapping_add(1), 1, 0x04, &[0; 200]);
        });

        let mut dev = Device::new(addr.ip().to_string(), addr.port().to_string());
        dev.connect().unwrap();
        let result = dev.update_volatile();
        assert!(matches!(result, Err(Error::Protocol(ProtocolError::Desync))));
        assert!(matches!(dev.channel(0), Err(Error::NotYetRead(_))));
        assert!(dev.last_update().is_none());

        server.join().unwrap();
    }

    #[test]
    fn truncated_channel_read_is_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let (tx, _, _) = read_request(&mut stream);
            // Only 24 channels' worth of data (96 bytes) instead of 200.
            respond(&mut stream, tx, 1, 0x04, &[0u8; 96]);
        });

        let mut dev = Device::new(addr.ip().to_string(), addr.port().to_string());
        dev.connect().unwrap();
        let result = dev.update_volatile();
        assert!(matches!(result, Err(Error::Protocol(ProtocolError::Truncated))));
        assert!(dev.last_update().is_none());

        server.join().unwrap();
    }

    #[test]
    fn exception_response_is_surfaced() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let (tx, _, _) = read_request(&mut stream);
            respond_exception(&mut stream, tx, 1, 0x84, 2);
        });

        let mut dev = Device::new(addr.ip().to_string(), addr.port().to_string());
        dev.connect().unwrap();
        let result = dev.update_volatile();
        assert!(matches!(
            result,
            Err(Error::Protocol(ProtocolError::Exception(frame::ExceptionCode::IllegalAddress)))
        ));

        server.join().unwrap();
    }

    #[test]
    fn transaction_id_wraps_at_2_16() {
        let mut dev = Device::new("localhost", "502");
        dev.next_tx = 0xffff;
        assert_eq!(dev.next_transaction_id(), 0xffff);
        assert_eq!(dev.next_transaction_id(), 0x0000);
    }
}
