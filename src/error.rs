//! Error types for connection establishment.
//!
//! [`ConnError`] is what callers of [`crate::incoming::IncomingConnection`]
//! see. It separates transport failures, protocol violations, timeouts and
//! authentication failures so a listener can tell a slow peer from a
//! malformed one, and a planned shutdown ([`ConnError::ConnectionClosed`])
//! from either.

use std::io;

use thiserror::Error;

/// Failures raised by the frame codec.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Not enough bytes to finish decoding.
    #[error("unexpected end of buffer: needed {needed} more bytes")]
    Truncated { needed: usize },

    #[error("invalid protocol header: {0}")]
    InvalidProtoHeader(String),

    #[error("unsupported protocol version {0}.{1}.{2}")]
    UnsupportedVersion(u8, u8, u8),

    #[error("invalid frame header: {0}")]
    InvalidFrameHeader(String),

    #[error("unknown type constructor {0:#04x}")]
    UnknownConstructor(u8),

    /// A value decoded fine but has the wrong type for the field.
    #[error("invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("invalid utf-8 in {0}")]
    InvalidUtf8(&'static str),

    #[error("value too large to encode: {0}")]
    TooLarge(&'static str),
}

/// Errors returned by a SASL mechanism continuation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SaslError {
    /// The peer's credentials were rejected.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// The mechanism itself broke.
    #[error("mechanism failure: {0}")]
    System(String),
}

/// Connection establishment errors.
#[derive(Debug, Error)]
pub enum ConnError {
    /// Socket read or write failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// No data within the configured connect timeout.
    #[error("amqp: timeout waiting for response")]
    Timeout,

    /// The connection was closed in an orderly way, locally or by the peer.
    #[error("amqp: connection closed")]
    ConnectionClosed,

    /// TLS-wrapped transport was requested.
    #[error("AMQP protocol {0} unsupported by this server")]
    UnsupportedProtocol(u8),

    #[error("unknown protocol ID {0:#04x}")]
    UnknownProtocol(u8),

    #[error("unexpected frame {got} when expecting {expected}")]
    UnexpectedFrame {
        expected: &'static str,
        got: String,
    },

    #[error("unexpected protocol header (protocol ID {0:#04x})")]
    UnexpectedHeader(u8),

    /// An outgoing frame exceeds the peer's advertised maximum.
    #[error("{kind} frame size {size} larger than peer's max frame size {max}")]
    FrameTooLarge {
        kind: &'static str,
        size: usize,
        max: u32,
    },

    /// An incoming frame header declares an unreasonable size.
    #[error("payload too large: declared frame size {0}")]
    PayloadTooLarge(u32),

    #[error("unsupported auth mechanism selected: {0}")]
    UnknownMechanism(String),

    #[error("SASL error whilst negotiating {mechanism}: {source}")]
    Sasl {
        mechanism: String,
        #[source]
        source: SaslError,
    },

    #[error("SASL negotiation ended without providing outcome")]
    MissingOutcome,

    /// Plain AMQP header arrived before SASL completed.
    #[error("AMQP protocol {0} unexpected at this time - AMQP SASL is required first")]
    SaslRequired(u8),

    /// `accept` or `reject` called before negotiation succeeded.
    #[error("connection is not ready to accept")]
    NotReady,
}

impl ConnError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ConnError::Timeout)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, ConnError::ConnectionClosed)
    }

    /// True for authentication failures reported by a mechanism.
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            ConnError::Sasl {
                source: SaslError::AuthFailed(_),
                ..
            }
        )
    }
}

pub type Result<T, E = ConnError> = std::result::Result<T, E>;
