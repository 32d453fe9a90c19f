/*! Frame codec: encoding requests, parsing responses, and classifying
payloads on the wire.

All multi-byte header and payload fields are big-endian; this module is
the single place where byte-order conversion happens. A frame is a
6-byte prefix (transaction-id, protocol-id, length) followed by `length`
bytes of unit-id, function-code and payload. The maximum total frame
length is 260 bytes.
*/

use crate::error::{Error, Result};

/// Bytes before the `length` field's own payload: transaction-id,
/// protocol-id, length.
const PREFIX_LEN: usize = 6;

/// Largest total frame length this core will encode or accept.
pub const MAX_FRAME_LEN: usize = 260;

/// Largest quantity of registers that may be requested in one read.
pub const MAX_QUANTITY: u16 = 0x7d;

/// High bit OR'd into a function code to mark an error response.
const ERROR_BIT: u8 = 0x80;

/// The function codes this core knows how to encode and parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionCode {
    /// Read holding registers (0x03).
    ReadHoldingRegisters,
    /// Read input registers (0x04).
    ReadInputRegisters,
}

impl FunctionCode {
    pub(crate) fn code(self) -> u8 {
        match self {
            FunctionCode::ReadHoldingRegisters => 0x03,
            FunctionCode::ReadInputRegisters => 0x04,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        match code {
            0x03 => Some(FunctionCode::ReadHoldingRegisters),
            0x04 => Some(FunctionCode::ReadInputRegisters),
            _ => None,
        }
    }
}

/// Exception codes a device may answer a request with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionCode {
    /// 1
    IllegalFunction,
    /// 2
    IllegalAddress,
    /// 3
    IllegalValue,
    /// 4
    DeviceFailure,
    /// 5
    Acknowledge,
    /// 6
    DeviceBusy,
    /// 8
    ParityError,
    /// 10
    GatewayUnavailable,
    /// 11
    TargetFailure,
    /// Anything not in the closed enumeration above.
    Unknown(u8),
}

impl From<u8> for ExceptionCode {
    fn from(code: u8) -> Self {
        match code {
            1 => ExceptionCode::IllegalFunction,
            2 => ExceptionCode::IllegalAddress,
            3 => ExceptionCode::IllegalValue,
            4 => ExceptionCode::DeviceFailure,
            5 => ExceptionCode::Acknowledge,
            6 => ExceptionCode::DeviceBusy,
            8 => ExceptionCode::ParityError,
            10 => ExceptionCode::GatewayUnavailable,
            11 => ExceptionCode::TargetFailure,
            other => ExceptionCode::Unknown(other),
        }
    }
}

/// A parsed request or response frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A read-holding/read-input request. Only ever produced by [`parse`]
    /// in tests; the façade builds requests directly via [`encode_read_holding`]
    /// and [`encode_read_input`].
    Request {
        /// Transaction id.
        tx: u16,
        /// Unit id.
        unit: u8,
        /// Which read function was requested.
        function: FunctionCode,
        /// Starting register address.
        addr: u16,
        /// Register quantity.
        qty: u16,
    },
    /// A successful response to a read-holding-registers request.
    ReadHoldingResponse {
        /// Transaction id.
        tx: u16,
        /// Unit id.
        unit: u8,
        /// Raw register data, `byte_count` bytes long.
        payload: Vec<u8>,
    },
    /// A successful response to a read-input-registers request.
    ReadInputResponse {
        /// Transaction id.
        tx: u16,
        /// Unit id.
        unit: u8,
        /// Raw register data, `byte_count` bytes long.
        payload: Vec<u8>,
    },
    /// An exception response: the high bit of the function code was set.
    ErrorResponse {
        /// Transaction id.
        tx: u16,
        /// Unit id.
        unit: u8,
        /// The function code the exception applies to, with the error bit masked off.
        function_code: u8,
        /// The exception reported.
        exception: ExceptionCode,
    },
    /// Any other function code. The core has no semantics for these; they're
    /// passed through so a caller can at least see what arrived.
    Generic {
        /// Transaction id.
        tx: u16,
        /// Unit id.
        unit: u8,
        /// Raw frame bytes, header included.
        raw: Vec<u8>,
    },
}

fn encode_read(
    function: FunctionCode,
    tx: u16,
    unit: u8,
    addr: u16,
    qty: u16,
) -> Result<Vec<u8>> {
    if qty < 1 || qty > MAX_QUANTITY {
        return Err(Error::BadArgument(format!(
            "quantity {qty} outside [1, {MAX_QUANTITY:#x}]"
        )));
    }
    let length: u16 = 6; // unit + funccode + addr(2) + qty(2)
    let mut buf = Vec::with_capacity(PREFIX_LEN + length as usize);
    buf.extend_from_slice(&tx.to_be_bytes());
    buf.extend_from_slice(&0u16.to_be_bytes());
    buf.extend_from_slice(&length.to_be_bytes());
    buf.push(unit);
    buf.push(function.code());
    buf.extend_from_slice(&addr.to_be_bytes());
    buf.extend_from_slice(&qty.to_be_bytes());
    Ok(buf)
}

/// Encode a `ReadHoldingRegisters` request. Fails with [`Error::BadArgument`]
/// if `qty` is outside `[1, 0x7d]`.
pub fn encode_read_holding(tx: u16, unit: u8, addr: u16, qty: u16) -> Result<Vec<u8>> {
    encode_read(FunctionCode::ReadHoldingRegisters, tx, unit, addr, qty)
}

/// Encode a `ReadInputRegisters` request. Fails with [`Error::BadArgument`]
/// if `qty` is outside `[1, 0x7d]`.
pub fn encode_read_input(tx: u16, unit: u8, addr: u16, qty: u16) -> Result<Vec<u8>> {
    encode_read(FunctionCode::ReadInputRegisters, tx, unit, addr, qty)
}

/// Given a buffer of at least 6 bytes, read the length field and return how
/// many additional bytes are needed to complete the frame (0 if complete).
///
/// Fails with [`Error::BadHeader`] if the buffer is shorter than 6 bytes, the
/// protocol-id field is non-zero, or the total frame length would exceed
/// [`MAX_FRAME_LEN`].
pub fn missing_bytes(buf: &[u8]) -> Result<usize> {
    if buf.len() < PREFIX_LEN {
        return Err(Error::BadHeader(format!(
            "need at least {PREFIX_LEN} bytes, got {}",
            buf.len()
        )));
    }
    let protocol_id = u16::from_be_bytes([buf[2], buf[3]]);
    if protocol_id != 0 {
        return Err(Error::BadHeader(format!(
            "protocol-id must be 0, got {protocol_id}"
        )));
    }
    let length = u16::from_be_bytes([buf[4], buf[5]]) as usize;
    let total = PREFIX_LEN + length;
    if total > MAX_FRAME_LEN {
        return Err(Error::BadHeader(format!(
            "frame length {total} exceeds maximum of {MAX_FRAME_LEN}"
        )));
    }
    Ok(total.saturating_sub(buf.len()))
}

/// Parse a complete frame. Requires `missing_bytes(buf) == Ok(0)`.
pub fn parse(buf: &[u8]) -> Result<Frame> {
    if missing_bytes(buf)? != 0 {
        return Err(Error::BadFrame("buffer does not hold a complete frame".into()));
    }
    let tx = u16::from_be_bytes([buf[0], buf[1]]);
    let length = u16::from_be_bytes([buf[4], buf[5]]) as usize;
    let unit = buf[6];
    let function_code = buf[7];
    let rest = &buf[8..PREFIX_LEN + length];

    if function_code & ERROR_BIT != 0 {
        if rest.len() != 1 {
            return Err(Error::Corrupt(format!(
                "exception payload must be 1 byte, got {}",
                rest.len()
            )));
        }
        return Ok(Frame::ErrorResponse {
            tx,
            unit,
            function_code: function_code & !ERROR_BIT,
            exception: ExceptionCode::from(rest[0]),
        });
    }

    match FunctionCode::from_code(function_code) {
        Some(function) => {
            // Could be a request (addr + qty, 4 bytes) or a response
            // (byte-count + data). Requests are only produced in tests.
            // A response's shape is fully self-describing (byte-count is
            // even and accounts for exactly `length - 3` bytes), so check
            // that first; only fall back to the request shape when the
            // buffer doesn't already satisfy it. Checking request-shape
            // first would let a malformed response with an odd byte-count
            // of 3 (rest.len() == 4, same as a real request) slip through
            // as a bogus `Request` instead of failing as `Corrupt`.
            if let Some(&byte_count_byte) = rest.first() {
                let byte_count = byte_count_byte as usize;
                if length == byte_count + 3 {
                    if byte_count % 2 != 0 {
                        return Err(Error::Corrupt(format!(
                            "byte-count {byte_count} must be even"
                        )));
                    }
                    let payload = rest[1..].to_vec();
                    return Ok(match function {
                        FunctionCode::ReadHoldingRegisters => Frame::ReadHoldingResponse { tx, unit, payload },
                        FunctionCode::ReadInputRegisters => Frame::ReadInputResponse { tx, unit, payload },
                    });
                }
            }
            if rest.len() == 4 {
                let addr = u16::from_be_bytes([rest[0], rest[1]]);
                let qty = u16::from_be_bytes([rest[2], rest[3]]);
                if (1..=MAX_QUANTITY).contains(&qty) {
                    return Ok(Frame::Request {
                        tx,
                        unit,
                        function,
                        addr,
                        qty,
                    });
                }
            }
            Err(Error::Corrupt(format!(
                "length {length} does not describe a valid response byte-count or request shape (rest len {})",
                rest.len()
            )))
        }
        None => Ok(Frame::Generic {
            tx,
            unit,
            raw: buf[..PREFIX_LEN + length].to_vec(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_read_input_channel_one() {
        let got = encode_read_input(0x0001, 1, 0x0080, 2).unwrap();
        let want: Vec<u8> = vec![0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x04, 0x00, 0x80, 0x00, 0x02];
        assert_eq!(got, want);
    }

    #[test]
    fn encode_rejects_bad_quantity() {
        assert!(matches!(
            encode_read_holding(1, 1, 0, 0),
            Err(Error::BadArgument(_))
        ));
        assert!(matches!(
            encode_read_holding(1, 1, 0, 0x7e),
            Err(Error::BadArgument(_))
        ));
        assert!(encode_read_holding(1, 1, 0, 0x7d).is_ok());
        assert!(encode_read_holding(1, 1, 0, 1).is_ok());
    }

    #[test]
    fn parse_serial_number_response() {
        let buf: Vec<u8> = vec![
            0x00, 0x05, 0x00, 0x00, 0x00, 0x07, 0x01, 0x03, 0x04, 0x00, 0x01, 0xE2, 0x40,
        ];
        let frame = parse(&buf).unwrap();
        match frame {
            Frame::ReadHoldingResponse { tx, unit, payload } => {
                assert_eq!(tx, 0x0005);
                assert_eq!(unit, 1);
                assert_eq!(payload, vec![0x00, 0x01, 0xE2, 0x40]);
            }
            other => panic!("expected ReadHoldingResponse, got {other:?}"),
        }
        let values = crate::values::as_u32_array(&vec![0x00, 0x01, 0xE2, 0x40]).unwrap();
        assert_eq!(values, vec![123456]);
    }

    #[test]
    fn parse_exception_response() {
        let buf: Vec<u8> = vec![0x00, 0x07, 0x00, 0x00, 0x00, 0x03, 0x01, 0x84, 0x02];
        let frame = parse(&buf).unwrap();
        assert_eq!(
            frame,
            Frame::ErrorResponse {
                tx: 0x0007,
                unit: 1,
                function_code: 0x04,
                exception: ExceptionCode::IllegalAddress,
            }
        );
    }

    #[test]
    fn missing_bytes_rejects_nonzero_protocol_id() {
        let buf = [0, 1, 0, 1, 0, 6];
        assert!(matches!(missing_bytes(&buf), Err(Error::BadHeader(_))));
    }

    #[test]
    fn missing_bytes_rejects_short_buffer() {
        assert!(matches!(missing_bytes(&[0, 1, 0, 0]), Err(Error::BadHeader(_))));
    }

    #[test]
    fn missing_bytes_matches_prefix_length() {
        let full = encode_read_holding(7, 1, 0x0578, 3).unwrap();
        for n in 0..full.len() {
            if n < PREFIX_LEN {
                assert!(missing_bytes(&full[..n]).is_err());
                continue;
            }
            assert_eq!(missing_bytes(&full[..n]).unwrap(), full.len() - n);
        }
        assert_eq!(missing_bytes(&full).unwrap(), 0);
    }

    #[test]
    fn round_trip_request_for_every_valid_quantity() {
        for qty in 1..=MAX_QUANTITY {
            let variants: [(FunctionCode, fn(u16, u8, u16, u16) -> Result<Vec<u8>>); 2] = [
                (FunctionCode::ReadHoldingRegisters, encode_read_holding),
                (FunctionCode::ReadInputRegisters, encode_read_input),
            ];
            for (function, encode) in variants {
                let tx = 0x1234;
                let unit = 1;
                let addr = 0x0080;
                let bytes = encode(tx, unit, addr, qty).unwrap();
                let frame = parse(&bytes).unwrap();
                assert_eq!(
                    frame,
                    Frame::Request {
                        tx,
                        unit,
                        function,
                        addr,
                        qty,
                    }
                );
            }
        }
    }

    #[test]
    fn corrupt_when_byte_count_inconsistent() {
        // length says 7 (byte-count+3) but byte-count field says 6: 6+3=9 != 7.
        let buf: Vec<u8> = vec![0x00, 0x01, 0x00, 0x00, 0x00, 0x07, 0x01, 0x03, 0x06, 0, 0, 0, 0, 0];
        assert!(matches!(parse(&buf), Err(Error::Corrupt(_))));
    }

    #[test]
    fn truncated_channel_read_has_correct_byte_count() {
        // 24 channels worth of data: byte-count 96, length 99.
        let mut buf = vec![0x00, 0x09, 0x00, 0x00, 0x00, 99, 0x01, 0x04, 96];
        buf.extend(std::iter::repeat(0u8).take(96));
        let frame = parse(&buf).unwrap();
        match frame {
            Frame::ReadInputResponse { payload, .. } => assert_eq!(payload.len(), 96),
            other => panic!("expected ReadInputResponse, got {other:?}"),
        }
    }

    #[test]
    fn odd_byte_count_is_corrupt_not_a_request() {
        // rest.len() == 4 looks request-shaped, but length == byte_count + 3
        // also holds with an odd byte-count of 3: a malformed response, not
        // a legitimate request.
        let buf: Vec<u8> = vec![0x00, 0x09, 0x00, 0x00, 0x00, 0x06, 0x01, 0x04, 0x03, 0x00, 0x00, 0x05];
        assert!(matches!(parse(&buf), Err(Error::Corrupt(_))));
    }

    #[test]
    fn missing_bytes_rejects_frame_over_max_length() {
        let buf = [0, 1, 0, 0, 0, 255];
        assert!(matches!(missing_bytes(&buf), Err(Error::BadHeader(_))));
    }

    #[test]
    fn generic_frame_for_unknown_function_code() {
        let buf: Vec<u8> = vec![0x00, 0x01, 0x00, 0x00, 0x00, 0x02, 0x01, 0x10];
        let frame = parse(&buf).unwrap();
        assert!(matches!(frame, Frame::Generic { .. }));
    }
}
