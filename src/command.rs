use bytes::{BufMut, Bytes, BytesMut};

use crate::protocol::{Operation, HEADER_SIZE, REQUEST_MAGIC, SASL_MECHANISM_PLAIN};
use crate::{Result, VbkvError};

/// Options accepted by a `set` request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetOptions {
    /// opaque user flags stored with the document
    pub flags: u32,
    /// expiration time, `0` means never
    pub expiration: u32,
    /// only store if the current version matches, `0` means unconditional
    pub cas: u64,
}

/// Options accepted by `incr` and `decr` requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArithmeticOptions {
    /// amount to add or subtract
    pub delta: u64,
    /// value stored when the counter does not exist yet
    pub initial: u64,
    /// expiration time, `0` means never
    pub expiration: u32,
    /// only update if the current version matches, `0` means unconditional
    pub cas: u64,
}

impl Default for ArithmeticOptions {
    fn default() -> Self {
        ArithmeticOptions {
            delta: 1,
            initial: 0,
            expiration: 0,
            cas: 0,
        }
    }
}

impl From<u64> for ArithmeticOptions {
    fn from(delta: u64) -> Self {
        ArithmeticOptions {
            delta,
            ..Default::default()
        }
    }
}

/// These are the request "commands" this client can send to a cluster node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// get a value from the store
    Get {
        /// the key to look up
        key: Bytes,
    },
    /// store a value
    Set {
        /// the key to set
        key: Bytes,
        /// the value to set
        value: Bytes,
        /// flags, expiration and cas
        options: SetOptions,
    },
    /// add to a counter
    Increment {
        /// the counter key
        key: Bytes,
        /// delta, initial value, expiration and cas
        options: ArithmeticOptions,
    },
    /// subtract from a counter
    Decrement {
        /// the counter key
        key: Bytes,
        /// delta, initial value, expiration and cas
        options: ArithmeticOptions,
    },
    /// SASL PLAIN authentication
    SaslAuth {
        /// authentication identity, the bucket name
        username: String,
        /// the bucket's SASL password
        password: String,
    },
}

impl Command {
    /// the operation this command performs
    pub fn operation(&self) -> Operation {
        match self {
            Command::Get { .. } => Operation::Get,
            Command::Set { .. } => Operation::Set,
            Command::Increment { .. } => Operation::Increment,
            Command::Decrement { .. } => Operation::Decrement,
            Command::SaslAuth { .. } => Operation::SaslAuth,
        }
    }

    /// the document key this command addresses. Empty for `SaslAuth`.
    pub fn key(&self) -> Bytes {
        match self {
            Command::Get { key }
            | Command::Set { key, .. }
            | Command::Increment { key, .. }
            | Command::Decrement { key, .. } => key.clone(),
            Command::SaslAuth { .. } => Bytes::new(),
        }
    }

    /// Encodes this command as a request packet addressed to partition `vbucket`,
    /// tagged with correlation id `opaque`.
    ///
    /// `SaslAuth` is connection scoped: its vbucket and opaque are always written as `0`.
    ///
    /// # Errors
    /// [`VbkvError::ValueFormat`] if the key does not fit the 16 bit key length field or
    /// the body does not fit the 32 bit body length field
    pub fn encode(&self, opaque: u32, vbucket: u16) -> Result<Bytes> {
        let mut dst = BytesMut::new();
        match self {
            Command::Get { key } => {
                put_header(&mut dst, self.operation(), Frame::new(key, 0, 0), vbucket, opaque, 0)?;
                dst.put_slice(key);
            }
            Command::Set { key, value, options } => {
                let frame = Frame::new(key, 8, value.len());
                put_header(&mut dst, self.operation(), frame, vbucket, opaque, options.cas)?;
                dst.put_u32(options.flags);
                dst.put_u32(options.expiration);
                dst.put_slice(key);
                dst.put_slice(value);
            }
            Command::Increment { key, options } | Command::Decrement { key, options } => {
                let frame = Frame::new(key, 20, 0);
                put_header(&mut dst, self.operation(), frame, vbucket, opaque, options.cas)?;
                dst.put_u64(options.delta);
                dst.put_u64(options.initial);
                dst.put_u32(options.expiration);
                dst.put_slice(key);
            }
            Command::SaslAuth { username, password } => {
                let mechanism = SASL_MECHANISM_PLAIN.as_bytes();
                // empty authorization identity, then authentication identity and password
                let mut credentials = Vec::with_capacity(username.len() + password.len() + 2);
                credentials.push(0);
                credentials.extend_from_slice(username.as_bytes());
                credentials.push(0);
                credentials.extend_from_slice(password.as_bytes());

                let frame = Frame::new(mechanism, 0, credentials.len());
                put_header(&mut dst, self.operation(), frame, 0, 0, 0)?;
                dst.put_slice(mechanism);
                dst.put_slice(&credentials);
            }
        }
        Ok(dst.freeze())
    }
}

/// the lengths that go into a request header
struct Frame {
    key_len: usize,
    extras_len: u8,
    value_len: usize,
}

impl Frame {
    fn new(key: &[u8], extras_len: u8, value_len: usize) -> Self {
        Frame {
            key_len: key.len(),
            extras_len,
            value_len,
        }
    }
}

fn put_header(dst: &mut BytesMut, operation: Operation, frame: Frame, vbucket: u16, opaque: u32, cas: u64) -> Result<()> {
    if frame.key_len > u16::MAX as usize {
        return Err(VbkvError::ValueFormat(format!(
            "key of {} bytes exceeds the maximum key length",
            frame.key_len
        )));
    }
    let body_len = frame.key_len + frame.extras_len as usize + frame.value_len;
    if body_len > u32::MAX as usize {
        return Err(VbkvError::ValueFormat(format!("body of {} bytes is too large", body_len)));
    }

    dst.reserve(HEADER_SIZE + body_len);
    dst.put_u8(REQUEST_MAGIC);
    dst.put_u8(operation.opcode() as u8);
    dst.put_u16(frame.key_len as u16);
    dst.put_u8(frame.extras_len);
    dst.put_u8(0); // data type
    dst.put_u16(vbucket);
    dst.put_u32(body_len as u32);
    dst.put_u32(opaque);
    dst.put_u64(cas);
    Ok(())
}

/// Rewrites the partition id of an already encoded request packet in place.
pub(crate) fn set_vbucket(packet: &Bytes, vbucket: u16) -> Bytes {
    let mut packet = BytesMut::from(&packet[..]);
    packet[6..8].copy_from_slice(&vbucket.to_be_bytes());
    packet.freeze()
}
