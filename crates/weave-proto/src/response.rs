//! Successful generation response encoding and decoding.
//!
//! Payload layout after the 16-byte header (all Big Endian):
//!
//! | Offset | Size | Field              |
//! |--------|------|--------------------|
//! | 0      | 8    | request id         |
//! | 8      | 4    | status (200)       |
//! | 12     | 4    | generation time ms |
//! | 16     | 4    | image width        |
//! | 20     | 4    | image height       |
//! | 24     | 4    | channels (3 or 4)  |
//! | 28     | 4    | image data length  |
//! | 32     | var  | raw pixel bytes    |
//!
//! The decoder recomputes `width * height * channels` in 64-bit arithmetic
//! and requires exact agreement with both the declared length and the
//! trailing slice, so a forged length can neither overflow nor oversize an
//! allocation.

use bytes::{Buf, BufMut, Bytes};

use crate::{
    errors::{ProtocolError, Result},
    header::{MessageHeader, MessageType, framed_payload},
    request::validate_dimensions,
};

/// Size of the fixed-layout portion of a success-response payload.
const FIXED_SIZE: usize = 32;

/// Status value carried by every successful response.
pub const STATUS_OK: u32 = 200;

/// A decoded successful generation response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerateResponse {
    /// Correlation id echoed from the request.
    pub request_id: u64,
    /// Wall-clock generation time in milliseconds.
    pub generation_time_ms: u32,
    /// Image width in pixels.
    pub width: u32,
    /// Image height in pixels.
    pub height: u32,
    /// Samples per pixel: 3 (RGB) or 4 (RGBA).
    pub channels: u32,
    /// Raw interleaved pixel bytes, row-major.
    pub pixels: Bytes,
}

impl GenerateResponse {
    /// Check the image geometry against its documented bounds and the
    /// pixel buffer length.
    pub fn validate(&self) -> Result<()> {
        validate_dimensions(self.width, self.height)?;
        if self.channels != 3 && self.channels != 4 {
            return Err(ProtocolError::InvalidChannels(self.channels));
        }
        let expected = expected_image_bytes(self.width, self.height, self.channels)?;
        if expected != self.pixels.len() as u64 {
            return Err(ProtocolError::ImageDataMismatch {
                expected,
                actual: self.pixels.len() as u64,
            });
        }
        Ok(())
    }

    /// Encode as a complete wire message (header plus payload).
    ///
    /// # Errors
    ///
    /// Any [`Self::validate`] violation, or `PayloadTooLarge` when the
    /// pixel buffer pushes the message past the 10 MiB cap.
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<()> {
        self.validate()?;

        let header =
            MessageHeader::new(MessageType::Response, (FIXED_SIZE + self.pixels.len()) as u32)?;
        dst.put_slice(&header.to_bytes());

        dst.put_u64(self.request_id);
        dst.put_u32(STATUS_OK);
        dst.put_u32(self.generation_time_ms);
        dst.put_u32(self.width);
        dst.put_u32(self.height);
        dst.put_u32(self.channels);
        dst.put_u32(self.pixels.len() as u32);
        dst.put_slice(&self.pixels);

        Ok(())
    }

    /// Encode into a buffer sized up front from the image dimensions.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(MessageHeader::SIZE + FIXED_SIZE + self.pixels.len());
        self.encode(&mut buf)?;
        Ok(buf)
    }

    /// Decode a complete wire message.
    ///
    /// # Errors
    ///
    /// Header violations from [`MessageHeader::from_bytes`], framing
    /// violations, a status other than 200, and every geometry invariant
    /// from [`Self::validate`].
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let payload = framed_payload(bytes, MessageType::Response)?;
        if payload.len() < FIXED_SIZE {
            return Err(ProtocolError::Truncated { expected: FIXED_SIZE, actual: payload.len() });
        }

        let mut buf = payload;
        let request_id = buf.get_u64();
        let status = buf.get_u32();
        let generation_time_ms = buf.get_u32();
        let width = buf.get_u32();
        let height = buf.get_u32();
        let channels = buf.get_u32();
        let image_data_len = buf.get_u32();

        if status != STATUS_OK {
            return Err(ProtocolError::InvalidStatus(status));
        }
        validate_dimensions(width, height)?;
        if channels != 3 && channels != 4 {
            return Err(ProtocolError::InvalidChannels(channels));
        }

        let expected = expected_image_bytes(width, height, channels)?;
        if expected != u64::from(image_data_len) {
            return Err(ProtocolError::ImageDataMismatch {
                expected,
                actual: u64::from(image_data_len),
            });
        }

        let data = &payload[FIXED_SIZE..];
        if data.len() as u64 != expected {
            return Err(ProtocolError::ImageDataMismatch { expected, actual: data.len() as u64 });
        }

        Ok(Self {
            request_id,
            generation_time_ms,
            width,
            height,
            channels,
            pixels: Bytes::copy_from_slice(data),
        })
    }
}

/// `width * height * channels` in widened arithmetic.
///
/// The product must fit the wire's 32-bit length field; anything larger
/// is reported as a dimension violation, never truncated.
fn expected_image_bytes(width: u32, height: u32, channels: u32) -> Result<u64> {
    let expected = u64::from(width) * u64::from(height) * u64::from(channels);
    if expected > u64::from(u32::MAX) {
        return Err(ProtocolError::InvalidDimensions { width, height });
    }
    Ok(expected)
}
