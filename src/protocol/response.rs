use bytes::{Buf, Bytes, BytesMut};

use super::{Operation, HEADER_SIZE, RESPONSE_MAGIC};
use crate::error::{ErrorKind, OperationError};
use crate::{Result, VbkvError};

/// The outcome of a single operation, handed to that operation's handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationResult {
    /// the key of the operation. The client replaces whatever the server echoed with
    /// the key the operation was issued for.
    pub key: Bytes,
    /// the response value (the document for `get`, the counter for `incr`/`decr`)
    pub value: Bytes,
    /// raw response status, `0` on success
    pub status: u16,
    /// version token of the document
    pub cas: u64,
    /// user flags stored with the document, only present on `get`
    pub flags: Option<u32>,
    /// the operation this result belongs to
    pub operation: Operation,
    /// set when `status` is non-zero or the client failed the operation itself
    pub error: Option<OperationError>,
}

impl OperationResult {
    /// a result for an operation the client had to fail without a server response
    pub fn failed(operation: Operation, key: Bytes, kind: ErrorKind, message: impl Into<String>) -> Self {
        OperationResult {
            error: Some(OperationError::local(kind, key.clone(), operation, message)),
            key,
            value: Bytes::new(),
            status: 0,
            cas: 0,
            flags: None,
            operation,
        }
    }

    /// `true` if the operation succeeded
    pub fn success(&self) -> bool {
        self.error.is_none()
    }

    /// the error kind, if the operation failed
    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }

    /// the new counter value of a successful `incr`/`decr`
    pub fn counter(&self) -> Option<u64> {
        match self.operation {
            Operation::Increment | Operation::Decrement if self.success() && self.value.len() == 8 => {
                let mut value = &self.value[..];
                Some(value.get_u64())
            }
            _ => None,
        }
    }
}

/// One decoded response packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// operation decoded from the opcode
    pub operation: Operation,
    /// correlation id echoed back by the server
    pub opaque: u32,
    /// the decoded result
    pub result: OperationResult,
}

/// Parses complete response packets from the front of `buf`.
///
/// The returned iterator removes each packet from `buf` as it is yielded and stops as
/// soon as the buffer does not hold a complete packet. A partial packet is never
/// consumed: its bytes stay in `buf` until the caller appends the rest and parses again.
///
/// A header with a bad magic byte is fatal: the iterator yields a
/// [`VbkvError::Protocol`] and then ends, leaving `buf` untouched. A packet with an
/// opcode this client never sends is consumed and yields
/// [`VbkvError::UnknownResponse`] carrying its opaque.
pub fn parse_responses(buf: &mut BytesMut) -> Responses<'_> {
    Responses { buf, broken: false }
}

/// Iterator returned by [`parse_responses`].
#[derive(Debug)]
pub struct Responses<'a> {
    buf: &'a mut BytesMut,
    broken: bool,
}

impl Iterator for Responses<'_> {
    type Item = Result<Response>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.broken || self.buf.len() < HEADER_SIZE {
            return None;
        }

        let header = &self.buf[..HEADER_SIZE];
        if header[0] != RESPONSE_MAGIC {
            self.broken = true;
            return Some(Err(VbkvError::Protocol(format!("broken packet: {:02x?}", header))));
        }
        let key_len = u16::from_be_bytes([header[2], header[3]]) as usize;
        let extras_len = header[4] as usize;
        let body_len = u32::from_be_bytes([header[8], header[9], header[10], header[11]]) as usize;
        if key_len + extras_len > body_len {
            self.broken = true;
            return Some(Err(VbkvError::Protocol(format!(
                "broken packet: body length {} shorter than extras {} + key {}",
                body_len, extras_len, key_len
            ))));
        }

        if self.buf.len() < HEADER_SIZE + body_len {
            // need more data
            return None;
        }

        let packet = self.buf.split_to(HEADER_SIZE + body_len).freeze();
        Some(decode(packet))
    }
}

fn decode(mut packet: Bytes) -> Result<Response> {
    let _magic = packet.get_u8();
    let opcode = packet.get_u8();
    let key_len = packet.get_u16() as usize;
    let extras_len = packet.get_u8() as usize;
    let _data_type = packet.get_u8();
    let status = packet.get_u16();
    let _body_len = packet.get_u32();
    let opaque = packet.get_u32();
    let cas = packet.get_u64();

    let mut extras = packet.split_to(extras_len);
    let key = packet.split_to(key_len);
    let value = packet;

    let operation = Operation::from_opcode(opcode).map_err(|_| VbkvError::UnknownResponse { opcode, opaque })?;
    let flags = match operation {
        Operation::Get if extras.len() >= 4 => Some(extras.get_u32()),
        _ => None,
    };
    let error = OperationError::from_status(status, key.clone(), cas, operation, &value);

    Ok(Response {
        operation,
        opaque,
        result: OperationResult {
            key,
            value,
            status,
            cas,
            flags,
            operation,
            error,
        },
    })
}
