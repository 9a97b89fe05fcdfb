use crate::packet::checksum::Checksum;

/// Failure to decode a value from a byte buffer.
#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum CodecError {
    #[error("not enough data")]
    NotEnoughData,

    #[error("invalid {what} tag {tag}")]
    InvalidTag { what: &'static str, tag: i64 },

    #[error("invalid {what} length {len}")]
    InvalidLength { what: &'static str, len: usize },

    #[error("{0} unexpected trailing bytes")]
    TrailingData(usize),

    #[error("invalid string: {0}")]
    InvalidString(#[from] std::str::Utf8Error),
}

/// Reasons for rejecting a candidate frame. All of these are recovered from locally by
///  resynchronizing the byte scanner, they are never propagated beyond the link.
#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum FrameError {
    #[error("frame too short ({0} bytes)")]
    TooShort(usize),

    #[error("frame does not start with the separator")]
    BadSeparator,

    #[error("declared length {declared} does not match actual frame length {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("declared length {declared} exceeds the maximum of {max}")]
    Oversized { declared: usize, max: usize },

    #[error("checksum mismatch: received {received:?}, calculated {calculated:?}")]
    ChecksumMismatch { received: Checksum, calculated: Checksum },

    #[error("invalid header: {0}")]
    InvalidHeader(#[source] CodecError),
}

/// A channel handler's verdict on a packet it can not process. This is reported back to the
///  sender of a reliable packet through a receipt, it does not affect the link.
#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum HandlerError {
    /// The payload was understood but rejected, answered with a `PayloadError` receipt
    #[error("payload rejected: {0}")]
    PayloadRejected(&'static str),

    /// This endpoint does not process packets of this kind, answered with a `PacketError` receipt
    #[error("packet not supported")]
    Unsupported,
}
