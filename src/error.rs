//! Crate-wide error types.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Errors produced while decoding or encoding DHCPv4 packets.
#[derive(Error, Debug)]
pub enum PacketError {
    #[error("packet too short: need {expected} bytes, have {actual}")]
    TooShort { expected: usize, actual: usize },

    #[error("packet has no DHCP magic cookie")]
    InvalidMagicCookie,

    #[error("unsupported hardware address (htype {htype}, hlen {hlen})")]
    UnsupportedHardware { htype: u8, hlen: u8 },

    #[error("packet has duplicate option {0}")]
    DuplicateOption(u8),

    #[error("option {option} is truncated")]
    TruncatedOption { option: u8 },

    #[error("packet has no message type (option 53)")]
    MissingMessageType,

    #[error("invalid message type {0}")]
    InvalidMessageType(u8),

    #[error("option {option} has wrong length: need {expected} bytes, have {actual}")]
    WrongLength {
        option: u8,
        expected: usize,
        actual: usize,
    },

    #[error("option {0} is missing")]
    MissingOption(u8),

    #[error("option {0} is not valid UTF-8")]
    NotUtf8(u8),

    #[error("malformed client GUID (option 97): {0}")]
    MalformedGuid(&'static str),

    #[error("option {0} has value >255 bytes")]
    Oversized(u8),
}

/// Errors produced while decoding DHCPv6 packets.
#[derive(Error, Debug)]
pub enum Packet6Error {
    #[error("packet too short: need {expected} bytes, have {actual}")]
    TooShort { expected: usize, actual: usize },

    #[error("option {option} claims {claimed} bytes of payload, but only {actual} remain")]
    TruncatedOption {
        option: u16,
        claimed: usize,
        actual: usize,
    },

    #[error("option request (6) length must be an even number of bytes, got {0}")]
    OddOro(usize),

    #[error("'{kind}' packet rejected: {reason}")]
    Discard { kind: &'static str, reason: String },

    #[error("unknown packet type {0}")]
    UnknownType(u8),
}

/// Signed-URL encode/decode failures. Deliberately carries no detail
/// about which step failed; callers map it to an opaque 404.
#[derive(Error, Debug)]
pub enum SignError {
    #[error("invalid file id")]
    Invalid,

    #[error("file id failed authentication")]
    Verification,
}

/// Failures talking to or interpreting the boot policy backend.
#[derive(Error, Debug)]
pub enum BooterError {
    #[error("policy backend: {0}")]
    Backend(String),

    #[error("invalid boot spec: {0}")]
    InvalidSpec(String),

    #[error(transparent)]
    Sign(#[from] SignError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// HTTP handler errors, mapped onto status codes for axum.
#[derive(Error, Debug)]
pub enum HttpError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            HttpError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            HttpError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            HttpError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };

        tracing::debug!("{}: {}", status, message);
        (status, message).into_response()
    }
}
