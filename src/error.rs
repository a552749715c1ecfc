use crate::ErrorCode;
use std::panic::Location;
use thiserror::Error;

/// Errors raised by the protocol engine, dispatcher, store, or config
/// layers. Every variant that maps onto a wire `ERROR` packet carries its
/// [`ErrorCode`]; every variant carries a `location` recording where the
/// error was constructed (captured via `#[track_caller]`, including
/// through the `From` conversions `?` uses), surfaced verbatim in a
/// connection log line's `location: <src>` field.
#[derive(Error, Debug)]
pub enum TftpError {
    #[error("{code}: {message}, location: {location}")]
    Protocol {
        code: ErrorCode,
        message: String,
        location: String,
    },

    #[error("IO error: {source}, location: {location}")]
    Io {
        #[source]
        source: std::io::Error,
        location: String,
    },

    #[error("{message}, location: {location}")]
    Config { message: String, location: String },

    #[error("{source}, location: {location}")]
    Other {
        #[source]
        source: anyhow::Error,
        location: String,
    },
}

impl TftpError {
    #[track_caller]
    pub fn protocol(code: ErrorCode, message: impl Into<String>) -> Self {
        TftpError::Protocol {
            code,
            message: message.into(),
            location: Location::caller().to_string(),
        }
    }

    #[track_caller]
    pub fn config(message: impl Into<String>) -> Self {
        TftpError::Config {
            message: message.into(),
            location: Location::caller().to_string(),
        }
    }

    /// The error code this failure should be reported to a peer as, if any.
    pub fn wire_code(&self) -> ErrorCode {
        match self {
            TftpError::Protocol { code, .. } => *code,
            TftpError::Io { .. } => ErrorCode::Disk,
            TftpError::Config { .. } | TftpError::Other { .. } => ErrorCode::Unknown,
        }
    }
}

impl From<std::io::Error> for TftpError {
    #[track_caller]
    fn from(source: std::io::Error) -> Self {
        TftpError::Io {
            source,
            location: Location::caller().to_string(),
        }
    }
}

impl From<anyhow::Error> for TftpError {
    #[track_caller]
    fn from(source: anyhow::Error) -> Self {
        TftpError::Other {
            source,
            location: Location::caller().to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, TftpError>;
