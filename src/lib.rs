//! Trivial File Transfer Protocol (RFC 1350) server over UDP, backed by a
//! pluggable in-process blob store.

pub mod buffer_pool;
pub mod config;
pub mod connlog;
pub mod error;
pub mod server;
pub mod store;
pub mod transfer;

pub use error::{Result, TftpError};

/// The lock-step block size fixed by RFC 1350. No option negotiation.
pub const BLOCK_SIZE: usize = 512;

/// Maximum legal datagram size.
pub const MAX_PACKET_SIZE: usize = 2048;

/// Read deadline for a transfer socket before retrying.
pub const READ_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(3);

/// Retry budget on a transient read timeout.
pub const MAX_RETRIES: u32 = 3;

/// TFTP opcode, the first two bytes of every packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Opcode {
    Rrq = 1,
    Wrq = 2,
    Data = 3,
    Ack = 4,
    Error = 5,
}

impl Opcode {
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            1 => Some(Self::Rrq),
            2 => Some(Self::Wrq),
            3 => Some(Self::Data),
            4 => Some(Self::Ack),
            5 => Some(Self::Error),
            _ => None,
        }
    }
}

/// Error code carried in an `ERROR` packet, per RFC 1350 §5.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    Unknown = 0,
    NotFound = 1,
    Access = 2,
    Disk = 3,
    BadOp = 4,
    BadId = 5,
    DupFile = 6,
    UnkUser = 7,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "E_UNKNOWN",
            Self::NotFound => "E_NOT_FOUND",
            Self::Access => "E_ACCESS",
            Self::Disk => "E_DISK",
            Self::BadOp => "E_BAD_OP",
            Self::BadId => "E_BAD_ID",
            Self::DupFile => "E_DUP_FILE",
            Self::UnkUser => "E_UNK_USER",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The two request opcodes. Separate from [`Opcode`] so a `Packet::Request`
/// cannot be constructed with a non-request opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Rrq,
    Wrq,
}

/// A parsed TFTP packet, one variant per opcode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Request {
        kind: RequestKind,
        filename: String,
        mode: String,
    },
    Data {
        block: u16,
        payload: Vec<u8>,
    },
    Ack {
        block: u16,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
}

impl Packet {
    pub fn opcode(&self) -> Opcode {
        match self {
            Packet::Request {
                kind: RequestKind::Rrq,
                ..
            } => Opcode::Rrq,
            Packet::Request {
                kind: RequestKind::Wrq,
                ..
            } => Opcode::Wrq,
            Packet::Data { .. } => Opcode::Data,
            Packet::Ack { .. } => Opcode::Ack,
            Packet::Error { .. } => Opcode::Error,
        }
    }

    /// Parse a packet from its wire representation.
    pub fn parse(buf: &[u8]) -> std::result::Result<Self, ParseError> {
        let op_raw = read_u16(buf, 0).ok_or(ParseError::Truncated)?;
        let opcode = Opcode::from_u16(op_raw).ok_or(ParseError::BadOp(op_raw))?;
        match opcode {
            Opcode::Rrq | Opcode::Wrq => {
                let rest = &buf[2..];
                let (filename, rest) = read_cstring(rest)?;
                let (mode, _rest) = read_cstring(rest)?;
                let kind = if opcode == Opcode::Rrq {
                    RequestKind::Rrq
                } else {
                    RequestKind::Wrq
                };
                Ok(Packet::Request {
                    kind,
                    filename,
                    mode,
                })
            }
            Opcode::Data => {
                let block = read_u16(buf, 2).ok_or(ParseError::Truncated)?;
                let payload = buf.get(4..).ok_or(ParseError::Truncated)?.to_vec();
                Ok(Packet::Data { block, payload })
            }
            Opcode::Ack => {
                let block = read_u16(buf, 2).ok_or(ParseError::Truncated)?;
                Ok(Packet::Ack { block })
            }
            Opcode::Error => {
                let code_raw = read_u16(buf, 2).ok_or(ParseError::Truncated)?;
                let code = error_code_from_u16(code_raw);
                let (message, _rest) = read_cstring(buf.get(4..).ok_or(ParseError::Truncated)?)?;
                Ok(Packet::Error { code, message })
            }
        }
    }

    /// Serialize to the canonical wire form.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Packet::Request {
                kind,
                filename,
                mode,
            } => {
                let opcode = if *kind == RequestKind::Rrq {
                    Opcode::Rrq
                } else {
                    Opcode::Wrq
                };
                let mut buf = Vec::with_capacity(2 + filename.len() + 1 + mode.len() + 1);
                buf.extend_from_slice(&(opcode as u16).to_be_bytes());
                buf.extend_from_slice(filename.as_bytes());
                buf.push(0);
                buf.extend_from_slice(mode.as_bytes());
                buf.push(0);
                buf
            }
            Packet::Data { block, payload } => {
                let mut buf = Vec::with_capacity(4 + payload.len());
                buf.extend_from_slice(&(Opcode::Data as u16).to_be_bytes());
                buf.extend_from_slice(&block.to_be_bytes());
                buf.extend_from_slice(payload);
                buf
            }
            Packet::Ack { block } => {
                let mut buf = Vec::with_capacity(4);
                buf.extend_from_slice(&(Opcode::Ack as u16).to_be_bytes());
                buf.extend_from_slice(&block.to_be_bytes());
                buf
            }
            Packet::Error { code, message } => {
                let mut buf = Vec::with_capacity(4 + message.len() + 1);
                buf.extend_from_slice(&(Opcode::Error as u16).to_be_bytes());
                buf.extend_from_slice(&(*code as u16).to_be_bytes());
                buf.extend_from_slice(message.as_bytes());
                buf.push(0);
                buf
            }
        }
    }
}

fn error_code_from_u16(v: u16) -> ErrorCode {
    match v {
        1 => ErrorCode::NotFound,
        2 => ErrorCode::Access,
        3 => ErrorCode::Disk,
        4 => ErrorCode::BadOp,
        5 => ErrorCode::BadId,
        6 => ErrorCode::DupFile,
        7 => ErrorCode::UnkUser,
        _ => ErrorCode::Unknown,
    }
}

fn read_u16(buf: &[u8], offset: usize) -> Option<u16> {
    let bytes = buf.get(offset..offset + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

/// Read a NUL-terminated ASCII string, returning it and the remaining slice.
fn read_cstring(buf: &[u8]) -> std::result::Result<(String, &[u8]), ParseError> {
    let idx = buf.iter().position(|&b| b == 0).ok_or(ParseError::NoTerminator)?;
    let s = String::from_utf8(buf[..idx].to_vec()).map_err(|_| ParseError::NoTerminator)?;
    Ok((s, &buf[idx + 1..]))
}

/// Failure modes of [`Packet::parse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("packet truncated")]
    Truncated,
    #[error("unrecognized opcode {0}")]
    BadOp(u16),
    #[error("string field missing its NUL terminator")]
    NoTerminator,
}
