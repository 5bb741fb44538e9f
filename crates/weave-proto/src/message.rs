//! Error responses and the closed message union.
//!
//! Error payload layout after the 16-byte header (all Big Endian):
//!
//! | Offset | Size | Field            |
//! |--------|------|------------------|
//! | 0      | 8    | request id       |
//! | 8      | 4    | status (400/500) |
//! | 12     | 4    | error code       |
//! | 16     | 2    | message length   |
//! | 18     | var  | UTF-8 message    |
//!
//! The request id is zero when the failing request could not be parsed
//! far enough to recover it.

use bytes::{Buf, BufMut};

use crate::{
    errors::{ErrorCode, ProtocolError, Result},
    header::{MessageHeader, MessageType, framed_payload},
    request::GenerateRequest,
    response::GenerateResponse,
};

/// Size of the fixed-layout portion of an error payload.
const FIXED_SIZE: usize = 18;

/// A decoded error response.
///
/// The status field on the wire is derived from the code and checked for
/// consistency on decode, so the struct stores only the code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorResponse {
    /// Correlation id echoed from the request, or zero.
    pub request_id: u64,
    /// Taxonomy code describing the failure.
    pub code: ErrorCode,
    /// Human-readable detail.
    pub message: String,
}

impl ErrorResponse {
    /// Build an error response for a failure described by `code`.
    #[must_use]
    pub fn new(request_id: u64, code: ErrorCode, message: impl Into<String>) -> Self {
        Self { request_id, code, message: message.into() }
    }

    /// Build the error response mirroring a local decode failure.
    #[must_use]
    pub fn from_protocol_error(request_id: u64, err: &ProtocolError) -> Self {
        Self::new(request_id, err.error_code(), err.to_string())
    }

    /// Status class for this response (400 or 500), derived from the code.
    #[must_use]
    pub const fn status(&self) -> u32 {
        self.code.status()
    }

    /// Encode as a complete wire message (header plus payload).
    ///
    /// # Errors
    ///
    /// `InvalidErrorCode` when the code is [`ErrorCode::None`], and
    /// `PayloadTooLarge` when the message does not fit the u16 length
    /// field.
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<()> {
        if self.code == ErrorCode::None {
            return Err(ProtocolError::InvalidErrorCode(0));
        }
        let msg = self.message.as_bytes();
        if msg.len() > usize::from(u16::MAX) {
            return Err(ProtocolError::PayloadTooLarge {
                size: msg.len(),
                max: usize::from(u16::MAX),
            });
        }

        let header = MessageHeader::new(MessageType::Error, (FIXED_SIZE + msg.len()) as u32)?;
        dst.put_slice(&header.to_bytes());

        dst.put_u64(self.request_id);
        dst.put_u32(self.status());
        dst.put_u32(self.code.to_u32());
        dst.put_u16(msg.len() as u16);
        dst.put_slice(msg);

        Ok(())
    }

    /// Encode into a freshly sized buffer.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(MessageHeader::SIZE + FIXED_SIZE + self.message.len());
        self.encode(&mut buf)?;
        Ok(buf)
    }

    /// Decode a complete wire message.
    ///
    /// # Errors
    ///
    /// Header and framing violations, a status outside {400, 500}, a
    /// status inconsistent with the code, a code outside the taxonomy
    /// (or the never-emitted code 0), and a non-UTF-8 message.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let payload = framed_payload(bytes, MessageType::Error)?;
        if payload.len() < FIXED_SIZE {
            return Err(ProtocolError::Truncated { expected: FIXED_SIZE, actual: payload.len() });
        }

        let mut buf = payload;
        let request_id = buf.get_u64();
        let status = buf.get_u32();
        let raw_code = buf.get_u32();
        let msg_len = usize::from(buf.get_u16());

        if status != 400 && status != 500 {
            return Err(ProtocolError::InvalidStatus(status));
        }
        let code = match ErrorCode::from_u32(raw_code) {
            Some(ErrorCode::None) | None => return Err(ProtocolError::InvalidErrorCode(raw_code)),
            Some(code) => code,
        };
        if status != code.status() {
            return Err(ProtocolError::InvalidStatus(status));
        }

        let msg_bytes = &payload[FIXED_SIZE..];
        if msg_bytes.len() < msg_len {
            return Err(ProtocolError::Truncated {
                expected: FIXED_SIZE + msg_len,
                actual: payload.len(),
            });
        }
        if msg_bytes.len() > msg_len {
            return Err(ProtocolError::TrailingBytes { extra: msg_bytes.len() - msg_len });
        }
        let message = std::str::from_utf8(msg_bytes)
            .map_err(|_| ProtocolError::InvalidErrorMessage)?
            .to_owned();

        Ok(Self { request_id, code, message })
    }
}

/// The closed union of everything the wire can carry.
///
/// Decoders dispatch on the header's 16-bit type field and callers
/// pattern-match on the result; there is no fourth shape.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// A generation request.
    Request(GenerateRequest),
    /// A successful generation response.
    Response(GenerateResponse),
    /// An error response.
    Error(ErrorResponse),
}

impl Message {
    /// Decode one complete wire message, dispatching on the header type.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let header = MessageHeader::from_bytes(bytes)?;
        // from_bytes rejects unknown types, so the enum lookup holds.
        match header.message_type_enum() {
            Some(MessageType::Request) => Ok(Self::Request(GenerateRequest::decode(bytes)?)),
            Some(MessageType::Response) => Ok(Self::Response(GenerateResponse::decode(bytes)?)),
            Some(MessageType::Error) => Ok(Self::Error(ErrorResponse::decode(bytes)?)),
            None => Err(ProtocolError::UnknownMessageType(header.message_type())),
        }
    }

    /// Encode as a complete wire message.
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<()> {
        match self {
            Self::Request(inner) => inner.encode(dst),
            Self::Response(inner) => inner.encode(dst),
            Self::Error(inner) => inner.encode(dst),
        }
    }

    /// Encode into a freshly sized buffer.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        match self {
            Self::Request(inner) => inner.to_bytes(),
            Self::Response(inner) => inner.to_bytes(),
            Self::Error(inner) => inner.to_bytes(),
        }
    }

    /// The correlation id carried by this message.
    #[must_use]
    pub const fn request_id(&self) -> u64 {
        match self {
            Self::Request(inner) => inner.request_id,
            Self::Response(inner) => inner.request_id,
            Self::Error(inner) => inner.request_id,
        }
    }
}

/// Read the correlation id out of a raw payload without decoding it.
///
/// Every payload shape stores the id in its first eight bytes, so both
/// connection loops can route frames before (or instead of) a full
/// decode. `None` when the payload cannot contain an id.
#[must_use]
pub fn peek_request_id(payload: &[u8]) -> Option<u64> {
    let bytes: [u8; 8] = payload.get(..8)?.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}
