//! Error types for the signaling core.

use std::io;

use crate::msg::StatusCode;

/// Result type for signaling operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the signaling core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Object lookup failed (module, package, header, resolver target).
    #[error("not found: {0}")]
    NotFound(&'static str),

    /// An object with the same identity is already registered.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// A bounded table is full (module table, transport table, timer heap).
    #[error("too many entries: {0}")]
    TooMany(&'static str),

    /// Precondition failure on caller input.
    #[error("invalid argument: {0}")]
    InvalidArg(String),

    /// Message or header value could not be parsed.
    #[error("parse error: {0}")]
    Parse(String),

    /// A required base header is absent. The payload lists which of
    /// Call-ID, From, To, Via, CSeq were missing.
    #[error("missing header(s): {0}")]
    MissingHeader(String),

    /// No transport factory can reach the destination.
    #[error("no route to destination via {0}")]
    NoRoute(&'static str),

    /// OS-level socket failure.
    #[error("socket error: {0}")]
    Socket(#[from] io::Error),

    /// A printed message exceeds the maximum packet length.
    #[error("packet too large: {len} bytes (max {max})")]
    PacketTooLarge {
        /// Printed length of the message.
        len: usize,
        /// Allowed maximum.
        max: usize,
    },

    /// The Event header names an unknown event package.
    #[error("bad event package: {0}")]
    BadEvent(String),

    /// The message body carries an unsupported content type.
    #[error("unsupported content: {0}")]
    BadContent(String),

    /// A PIDF document failed to parse.
    #[error("bad PIDF document: {0}")]
    BadPidf(String),

    /// An XPIDF document failed to parse.
    #[error("bad XPIDF document: {0}")]
    BadXpidf(String),

    /// A NOTIFY was requested before any presence info was set.
    #[error("no presence info to publish")]
    NoPresenceInfo,

    /// The requested subscription expiry is below the acceptable minimum.
    #[error("expiry interval too brief (minimum {min}s)")]
    IntervalTooBrief {
        /// Smallest acceptable expiry in seconds.
        min: u32,
    },

    /// None of the offered content types is supported.
    #[error("not acceptable")]
    NotAcceptable,

    /// JSON serialization error from dump output.
    #[cfg(feature = "output")]
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Map a package-level semantic failure onto the SIP status code a
    /// notifier answers with. Returns `None` for errors that are not
    /// surfaced as a response.
    pub fn status_code(&self) -> Option<StatusCode> {
        match self {
            Self::BadEvent(_) => Some(StatusCode::BAD_EVENT),
            Self::NotAcceptable | Self::BadContent(_) | Self::BadPidf(_) | Self::BadXpidf(_) => {
                Some(StatusCode::NOT_ACCEPTABLE)
            }
            Self::IntervalTooBrief { .. } => Some(StatusCode::INTERVAL_TOO_BRIEF),
            Self::MissingHeader(_) | Self::Parse(_) | Self::InvalidArg(_) => {
                Some(StatusCode::BAD_REQUEST)
            }
            _ => None,
        }
    }

    /// Check if this error indicates a missing object rather than a
    /// protocol violation.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Check if this is a transient transport-level failure the caller
    /// may retry on another route.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::NoRoute(_) | Self::Socket(_))
    }
}
