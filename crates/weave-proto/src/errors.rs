//! Codec error types and the wire error-code taxonomy.
//!
//! [`ProtocolError`] is what the decoders return; [`ErrorCode`] is what
//! travels on the wire inside an error response. Every decode failure maps
//! to exactly one wire code via [`ProtocolError::error_code`], so the
//! worker can mirror any local decode failure back to its peer.

use thiserror::Error;

/// Convenience alias used throughout the codec.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Wire error codes carried in error responses.
///
/// The integer values are fixed by the protocol and must never be
/// renumbered. Codes 1 through 7 describe requests the peer can fix
/// (status 400); the rest are worker-side failures (status 500).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    /// No error. Never valid inside an error response.
    None = 0,
    /// Header magic did not match.
    InvalidMagic = 1,
    /// Protocol version outside the supported range.
    UnsupportedVersion = 2,
    /// Unknown model identifier.
    InvalidModelId = 3,
    /// Prompt slice out of range, empty, oversized, or not UTF-8.
    InvalidPrompt = 4,
    /// Image dimensions out of bounds, misaligned, or inconsistent.
    InvalidDimensions = 5,
    /// Step count outside 1..=100.
    InvalidSteps = 6,
    /// CFG scale not a finite value in 0.0..=20.0.
    InvalidCfg = 7,
    /// The worker ran out of memory.
    OutOfMemory = 8,
    /// The GPU device failed.
    GpuError = 9,
    /// The generation timed out.
    Timeout = 10,
    /// Unclassified worker-side failure.
    Internal = 99,
}

impl ErrorCode {
    /// Parse a raw wire code. `None` if the value is not in the taxonomy.
    #[must_use]
    pub const fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::InvalidMagic),
            2 => Some(Self::UnsupportedVersion),
            3 => Some(Self::InvalidModelId),
            4 => Some(Self::InvalidPrompt),
            5 => Some(Self::InvalidDimensions),
            6 => Some(Self::InvalidSteps),
            7 => Some(Self::InvalidCfg),
            8 => Some(Self::OutOfMemory),
            9 => Some(Self::GpuError),
            10 => Some(Self::Timeout),
            99 => Some(Self::Internal),
            _ => None,
        }
    }

    /// Wire representation of this code.
    #[must_use]
    pub const fn to_u32(self) -> u32 {
        self as u32
    }

    /// The HTTP-style status class this code maps to.
    ///
    /// Request-side violations (codes 1..=7) are 400; worker-side failures
    /// (8..=10 and 99) are 500. `None` is listed for totality but is never
    /// placed inside an error response.
    #[must_use]
    pub const fn status(self) -> u32 {
        match self {
            Self::InvalidMagic
            | Self::UnsupportedVersion
            | Self::InvalidModelId
            | Self::InvalidPrompt
            | Self::InvalidDimensions
            | Self::InvalidSteps
            | Self::InvalidCfg => 400,
            Self::None | Self::OutOfMemory | Self::GpuError | Self::Timeout | Self::Internal => 500,
        }
    }

    /// True for codes the requesting side caused (status 400).
    #[must_use]
    pub const fn is_client_error(self) -> bool {
        self.status() == 400
    }
}

/// Errors produced while encoding or decoding wire messages.
///
/// Struct variants carry the observed values so logs can say what was
/// actually seen, not just that something was wrong.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProtocolError {
    /// Buffer shorter than the fixed header.
    #[error("header too short: need {expected} bytes, have {actual}")]
    HeaderTooShort {
        /// Bytes required.
        expected: usize,
        /// Bytes available.
        actual: usize,
    },

    /// Magic number mismatch.
    #[error("invalid magic number")]
    InvalidMagic,

    /// Version outside the supported bounds.
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u16),

    /// Unrecognized `msg_type` field.
    #[error("unknown message type: {0:#06x}")]
    UnknownMessageType(u16),

    /// Header's type does not match what the caller tried to decode.
    #[error("unexpected message type: expected {expected:#06x}, found {found:#06x}")]
    UnexpectedMessageType {
        /// Type the decoder was invoked for.
        expected: u16,
        /// Type the header actually carried.
        found: u16,
    },

    /// Claimed payload length exceeds the protocol maximum.
    #[error("payload too large: {size} bytes exceeds maximum of {max}")]
    PayloadTooLarge {
        /// Claimed or actual size.
        size: usize,
        /// Protocol maximum.
        max: usize,
    },

    /// Fewer bytes present than the header (or a length field) claims.
    #[error("message truncated: need {expected} bytes, have {actual}")]
    Truncated {
        /// Bytes required.
        expected: usize,
        /// Bytes available.
        actual: usize,
    },

    /// More bytes present than the header accounts for.
    #[error("message carries {extra} trailing bytes")]
    TrailingBytes {
        /// Byte count past the declared end.
        extra: usize,
    },

    /// Destination buffer cannot hold the encoded message.
    #[error("buffer too small: need {needed} bytes, have {actual}")]
    BufferTooSmall {
        /// Bytes required.
        needed: usize,
        /// Bytes available.
        actual: usize,
    },

    /// Model identifier is not a known model.
    #[error("invalid model id: {0}")]
    InvalidModelId(u32),

    /// Dimensions out of bounds or not 64-aligned.
    #[error("invalid dimensions: {width}x{height}")]
    InvalidDimensions {
        /// Requested width.
        width: u32,
        /// Requested height.
        height: u32,
    },

    /// Image byte count inconsistent with width x height x channels.
    #[error("image data length mismatch: expected {expected} bytes, header claims {actual}")]
    ImageDataMismatch {
        /// Widened product of the dimensions.
        expected: u64,
        /// Length the message claims or carries.
        actual: u64,
    },

    /// Channel count other than 3 (RGB) or 4 (RGBA).
    #[error("invalid channel count: {0}")]
    InvalidChannels(u32),

    /// Step count outside 1..=100.
    #[error("invalid step count: {0}")]
    InvalidSteps(u32),

    /// CFG scale rejected (non-finite or out of range).
    #[error("invalid cfg scale: {0}")]
    InvalidCfg(f32),

    /// Prompt slice rejected. The string names the offending slice.
    #[error("invalid prompt: {0}")]
    InvalidPrompt(String),

    /// Status field inconsistent with the message or its error code.
    #[error("invalid status: {0}")]
    InvalidStatus(u32),

    /// Error response carried code 0 or a value outside the taxonomy.
    #[error("invalid error code: {0}")]
    InvalidErrorCode(u32),

    /// Error response message bytes are not UTF-8.
    #[error("error message is not valid UTF-8")]
    InvalidErrorMessage,
}

impl ProtocolError {
    /// The wire code a worker reports when this failure occurred while
    /// decoding a peer's message.
    ///
    /// Every variant maps to exactly one code. Framing violations that
    /// have no dedicated slot in the taxonomy (truncation, oversized
    /// payloads, unknown types) report as [`ErrorCode::Internal`].
    #[must_use]
    pub const fn error_code(&self) -> ErrorCode {
        match self {
            Self::InvalidMagic => ErrorCode::InvalidMagic,
            Self::UnsupportedVersion(_) => ErrorCode::UnsupportedVersion,
            Self::InvalidModelId(_) => ErrorCode::InvalidModelId,
            Self::InvalidPrompt(_) => ErrorCode::InvalidPrompt,
            Self::InvalidDimensions { .. }
            | Self::ImageDataMismatch { .. }
            | Self::InvalidChannels(_) => ErrorCode::InvalidDimensions,
            Self::InvalidSteps(_) => ErrorCode::InvalidSteps,
            Self::InvalidCfg(_) => ErrorCode::InvalidCfg,
            Self::HeaderTooShort { .. }
            | Self::UnknownMessageType(_)
            | Self::UnexpectedMessageType { .. }
            | Self::PayloadTooLarge { .. }
            | Self::Truncated { .. }
            | Self::TrailingBytes { .. }
            | Self::BufferTooSmall { .. }
            | Self::InvalidStatus(_)
            | Self::InvalidErrorCode(_)
            | Self::InvalidErrorMessage => ErrorCode::Internal,
        }
    }
}
