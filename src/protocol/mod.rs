//! The binary key-value protocol.
//!
//! Every request and response starts with a fixed 24 byte header, all multi-byte
//! fields are big-endian:
//!
//! ```text
//!  byte | 0       | 1       | 2..4      | 4         | 5        | 6..8               | 8..12    | 12..16 | 16..24
//!       | magic   | opcode  | keyLength | extrasLen | dataType | vbucket / status   | bodyLen  | opaque | cas
//! ```
//!
//! The header is followed by `extrasLen` bytes of extras, `keyLength` bytes of key and
//! `bodyLen - extrasLen - keyLength` bytes of value. Requests carry the partition
//! ("vbucket") id in bytes 6..8, responses carry the status code there.
//!
//! Request encoding lives with the [`Command`](crate::Command) type, response decoding
//! in [`parse_responses`].
use std::convert::TryFrom;
use std::fmt;

use crate::VbkvError;

mod response;

pub use self::response::{parse_responses, OperationResult, Response, Responses};

/// size of both the request and the response header, in bytes
pub const HEADER_SIZE: usize = 24;

/// magic byte of every request packet
pub const REQUEST_MAGIC: u8 = 0x80;

/// magic byte of every response packet
pub const RESPONSE_MAGIC: u8 = 0x81;

/// the only SASL mechanism the cluster supports
pub const SASL_MECHANISM_PLAIN: &str = "PLAIN";

/// Opcodes of the binary protocol.
///
/// Only `Get`, `Set`, `Increment`, `Decrement` and `SaslAuth` are ever sent by this
/// client, the rest are listed so that the wire values have names.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Get = 0x00,
    Set = 0x01,
    Add = 0x02,
    Replace = 0x03,
    Delete = 0x04,
    Increment = 0x05,
    Decrement = 0x06,
    Quit = 0x07,
    Flush = 0x08,
    GetQ = 0x09,
    Noop = 0x0a,
    Version = 0x0b,
    GetK = 0x0c,
    GetKQ = 0x0d,
    Append = 0x0e,
    Prepend = 0x0f,
    Stat = 0x10,
    SetQ = 0x11,
    AddQ = 0x12,
    ReplaceQ = 0x13,
    DeleteQ = 0x14,
    IncrementQ = 0x15,
    DecrementQ = 0x16,
    QuitQ = 0x17,
    FlushQ = 0x18,
    AppendQ = 0x19,
    PrependQ = 0x1a,
    Verbosity = 0x1b,
    Touch = 0x1c,
    Gat = 0x1d,
    GatQ = 0x1e,
    SaslListMechs = 0x20,
    SaslAuth = 0x21,
    SaslStep = 0x22,
}

impl TryFrom<u8> for Opcode {
    type Error = VbkvError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use Opcode::*;
        let opcode = match value {
            0x00 => Get,
            0x01 => Set,
            0x02 => Add,
            0x03 => Replace,
            0x04 => Delete,
            0x05 => Increment,
            0x06 => Decrement,
            0x07 => Quit,
            0x08 => Flush,
            0x09 => GetQ,
            0x0a => Noop,
            0x0b => Version,
            0x0c => GetK,
            0x0d => GetKQ,
            0x0e => Append,
            0x0f => Prepend,
            0x10 => Stat,
            0x11 => SetQ,
            0x12 => AddQ,
            0x13 => ReplaceQ,
            0x14 => DeleteQ,
            0x15 => IncrementQ,
            0x16 => DecrementQ,
            0x17 => QuitQ,
            0x18 => FlushQ,
            0x19 => AppendQ,
            0x1a => PrependQ,
            0x1b => Verbosity,
            0x1c => Touch,
            0x1d => Gat,
            0x1e => GatQ,
            0x20 => SaslListMechs,
            0x21 => SaslAuth,
            0x22 => SaslStep,
            other => return Err(VbkvError::UnknownCommand(other)),
        };
        Ok(opcode)
    }
}

/// The operations this client issues, as reported back on each result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// retrieve a value
    Get,
    /// store a value
    Set,
    /// add to a counter
    Increment,
    /// subtract from a counter
    Decrement,
    /// authenticate the connection
    SaslAuth,
}

impl Operation {
    /// the wire opcode of this operation
    pub fn opcode(self) -> Opcode {
        match self {
            Operation::Get => Opcode::Get,
            Operation::Set => Opcode::Set,
            Operation::Increment => Opcode::Increment,
            Operation::Decrement => Opcode::Decrement,
            Operation::SaslAuth => Opcode::SaslAuth,
        }
    }

    /// maps a response opcode back to an operation.
    ///
    /// # Errors
    /// [`VbkvError::UnknownCommand`] for opcodes this client never sends
    pub fn from_opcode(opcode: u8) -> Result<Operation, VbkvError> {
        match Opcode::try_from(opcode)? {
            Opcode::Get => Ok(Operation::Get),
            Opcode::Set => Ok(Operation::Set),
            Opcode::Increment => Ok(Operation::Increment),
            Opcode::Decrement => Ok(Operation::Decrement),
            Opcode::SaslAuth => Ok(Operation::SaslAuth),
            _ => Err(VbkvError::UnknownCommand(opcode)),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Get => "get",
            Operation::Set => "set",
            Operation::Increment => "incr",
            Operation::Decrement => "decr",
            Operation::SaslAuth => "sasl_auth",
        };
        f.write_str(name)
    }
}
