/*! Transport & exchange: one TCP connection, one in-flight request at a
time, a deadline enforced per I/O step rather than per call.

State machine: `Closed -> Connecting -> Open -> Closed`. `open` resolves
`(host, service)` to an IPv4 address using the OS resolver (the service
may be numeric or a well-known name) and connects; `exchange` writes a
request and reads back exactly one response, resetting the deadline on
every successful partial write or read. This matches the historical
per-step timeout behavior rather than a hard per-call bound (see
`SPEC_FULL.md`'s notes on this transport).
*/

use std::ffi::CString;
use std::io::{Read, Write};
use std::net::{SocketAddr, SocketAddrV4, TcpStream};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::frame;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// No socket is open.
    Closed,
    /// A connection attempt is in flight.
    Connecting,
    /// The socket is open and ready for an exchange.
    Open,
}

/// A single serial TCP connection to a Modbus device.
pub struct Transport {
    state: ConnState,
    stream: Option<TcpStream>,
}

impl Default for Transport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport {
    /// Create a new, closed transport.
    pub fn new() -> Self {
        Self {
            state: ConnState::Closed,
            stream: None,
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Open one IPv4 TCP connection to `(host, service)`. `service` may be
    /// numeric ("502") or a well-known name, resolved by the OS.
    pub fn open(&mut self, host: &str, service: &str) -> Result<()> {
        self.state = ConnState::Connecting;
        let addr = match resolve_ipv4(host, service) {
            Ok(addr) => addr,
            Err(e) => {
                self.state = ConnState::Closed;
                return Err(e);
            }
        };
        match TcpStream::connect(addr) {
            Ok(stream) => {
                self.stream = Some(stream);
                self.state = ConnState::Open;
                Ok(())
            }
            Err(e) => {
                self.state = ConnState::Closed;
                Err(Error::Io(e))
            }
        }
    }

    /// Close the connection. A no-op if already closed.
    pub fn close(&mut self) {
        self.stream = None;
        self.state = ConnState::Closed;
    }

    /// Write `request` completely, then read back exactly one response
    /// frame. Every partial write or read resets the deadline to `timeout`
    /// from that moment; if any single I/O step doesn't complete within
    /// `timeout`, returns [`Error::Timeout`].
    pub fn exchange(&mut self, request: &[u8], timeout: Duration) -> Result<Vec<u8>> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| Error::Io(std::io::Error::new(std::io::ErrorKind::NotConnected, "transport is closed")))?;
        write_all_with_deadline(stream, request, timeout)?;
        read_frame_with_deadline(stream, timeout)
    }
}

fn is_timeout(e: &std::io::Error) -> bool {
    matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut)
}

fn write_all_with_deadline(stream: &mut TcpStream, buf: &[u8], timeout: Duration) -> Result<()> {
    let mut written = 0;
    while written < buf.len() {
        stream.set_write_timeout(Some(timeout))?;
        match stream.write(&buf[written..]) {
            Ok(0) => {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "write returned 0 bytes",
                )));
            }
            Ok(n) => written += n,
            Err(e) if is_timeout(&e) => return Err(Error::Timeout),
            Err(e) => return Err(Error::Io(e)),
        }
    }
    Ok(())
}

fn read_frame_with_deadline(stream: &mut TcpStream, timeout: Duration) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        if buf.len() >= 6 {
            match frame::missing_bytes(&buf) {
                Ok(0) => return Ok(buf),
                Ok(_) => {}
                Err(e) => return Err(e),
            }
        }
        stream.set_read_timeout(Some(timeout))?;
        match stream.read(&mut chunk) {
            Ok(0) => {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed by peer",
                )));
            }
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(e) if is_timeout(&e) => return Err(Error::Timeout),
            Err(e) => return Err(Error::Io(e)),
        }
    }
}

/// RAII guard freeing a `libc::addrinfo` linked list on drop.
struct AddrInfoList(*mut libc::addrinfo);

impl Drop for AddrInfoList {
    fn drop(&mut self) {
        if !self.0.is_null() {
            // Safety: `self.0` was returned by a successful `getaddrinfo`
            // call and has not been freed yet.
            unsafe { libc::freeaddrinfo(self.0) };
        }
    }
}

/// Resolve `(host, service)` to an IPv4 socket address via the OS resolver.
/// `service` may be numeric or a well-known service name.
fn resolve_ipv4(host: &str, service: &str) -> Result<SocketAddr> {
    let host_c = CString::new(host)
        .map_err(|_| Error::BadArgument("host contains a NUL byte".into()))?;
    let service_c = CString::new(service)
        .map_err(|_| Error::BadArgument("service contains a NUL byte".into()))?;

    let mut hints: libc::addrinfo = unsafe { std::mem::zeroed() };
    hints.ai_family = libc::AF_INET;
    hints.ai_socktype = libc::SOCK_STREAM;

    let mut result: *mut libc::addrinfo = std::ptr::null_mut();
    // Safety: `host_c`/`service_c` are valid NUL-terminated C strings for the
    // duration of the call; `result` is an out-param populated by the OS.
    let rc = unsafe {
        libc::getaddrinfo(host_c.as_ptr(), service_c.as_ptr(), &hints, &mut result)
    };
    if rc != 0 {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("resolving {host}:{service} failed (getaddrinfo rc={rc})"),
        )));
    }
    let list = AddrInfoList(result);

    let mut cursor = list.0;
    while !cursor.is_null() {
        // Safety: `cursor` is non-null and was produced by `getaddrinfo`,
        // which guarantees a valid `addrinfo` at this address.
        let info = unsafe { &*cursor };
        if info.ai_family == libc::AF_INET {
            // Safety: `ai_family == AF_INET` guarantees `ai_addr` points at a
            // `sockaddr_in` of at least that size.
            let sockaddr_in = unsafe { &*(info.ai_addr as *const libc::sockaddr_in) };
            let ip = u32::from_be(sockaddr_in.sin_addr.s_addr);
            let port = u16::from_be(sockaddr_in.sin_port);
            return Ok(SocketAddr::V4(SocketAddrV4::new(ip.into(), port)));
        }
        cursor = info.ai_next;
    }
    Err(Error::Io(std::io::Error::new(
        std::io::ErrorKind::NotFound,
        format!("no IPv4 address found for {host}:{service}"),
    )))
}
