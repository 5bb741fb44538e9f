//! Generation request encoding and decoding.
//!
//! Payload layout after the 16-byte header (all Big Endian):
//!
//! | Offset | Size | Field        |
//! |--------|------|--------------|
//! | 0      | 8    | request id   |
//! | 8      | 4    | model id     |
//! | 12     | 4    | width        |
//! | 16     | 4    | height       |
//! | 20     | 4    | steps        |
//! | 24     | 4    | cfg scale (IEEE-754) |
//! | 28     | 8    | seed         |
//! | 36     | 24   | three (offset, length) u32 pairs: clip_l, clip_g, t5 |
//! | 60     | var  | concatenated prompt bytes |
//!
//! Prompt `(offset, length)` pairs address into the trailing byte array.
//! The pairs may overlap; the decoder never assumes disjointness. Every
//! bounds check is written in the `offset > len - length` form so that no
//! intermediate addition can wrap.

use bytes::{Buf, BufMut};

use crate::{
    MODEL_SD35,
    errors::{ProtocolError, Result},
    header::{MessageHeader, MessageType, framed_payload},
};

/// Size of the fixed-layout portion of a request payload.
const FIXED_SIZE: usize = 60;

/// The three text-encoder prompts of an SD-3.5 generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptSet {
    /// CLIP-L encoder prompt.
    pub clip_l: String,
    /// CLIP-G encoder prompt.
    pub clip_g: String,
    /// T5 encoder prompt.
    pub t5: String,
}

impl PromptSet {
    /// Use one prompt string for all three encoders.
    #[must_use]
    pub fn uniform(prompt: impl Into<String>) -> Self {
        let prompt = prompt.into();
        Self { clip_l: prompt.clone(), clip_g: prompt.clone(), t5: prompt }
    }
}

/// A validated SD-3.5 generation request.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateRequest {
    /// Caller-chosen correlation id; responses echo it.
    pub request_id: u64,
    /// Model selector. Only [`MODEL_SD35`] is recognized.
    pub model_id: u32,
    /// Output width in pixels.
    pub width: u32,
    /// Output height in pixels.
    pub height: u32,
    /// Diffusion step count.
    pub steps: u32,
    /// Classifier-free guidance scale.
    pub cfg_scale: f32,
    /// Sampler seed.
    pub seed: u64,
    /// Per-encoder prompts.
    pub prompts: PromptSet,
}

impl GenerateRequest {
    /// Smallest accepted image dimension.
    pub const MIN_DIMENSION: u32 = 64;
    /// Largest accepted image dimension.
    pub const MAX_DIMENSION: u32 = 2048;
    /// Dimensions must be multiples of this.
    pub const DIMENSION_ALIGN: u32 = 64;
    /// Smallest accepted step count.
    pub const MIN_STEPS: u32 = 1;
    /// Largest accepted step count.
    pub const MAX_STEPS: u32 = 100;
    /// Largest accepted CFG scale.
    pub const MAX_CFG_SCALE: f32 = 20.0;
    /// Smallest accepted per-encoder prompt, in bytes.
    pub const MIN_PROMPT_LEN: usize = 1;
    /// Largest accepted per-encoder prompt, in bytes.
    pub const MAX_PROMPT_LEN: usize = 256;
    /// Largest accepted total prompt byte array (three encoders).
    pub const MAX_PROMPT_DATA: usize = 3 * Self::MAX_PROMPT_LEN;

    /// Check every field against its documented bound.
    ///
    /// Violations are reported in field order: model id, dimensions,
    /// steps, cfg scale, prompts. The first violation wins.
    pub fn validate(&self) -> Result<()> {
        if self.model_id != MODEL_SD35 {
            return Err(ProtocolError::InvalidModelId(self.model_id));
        }
        validate_dimensions(self.width, self.height)?;
        if !(Self::MIN_STEPS..=Self::MAX_STEPS).contains(&self.steps) {
            return Err(ProtocolError::InvalidSteps(self.steps));
        }
        validate_cfg(self.cfg_scale)?;
        for (name, prompt) in [
            ("clip_l", &self.prompts.clip_l),
            ("clip_g", &self.prompts.clip_g),
            ("t5", &self.prompts.t5),
        ] {
            let len = prompt.len();
            if !(Self::MIN_PROMPT_LEN..=Self::MAX_PROMPT_LEN).contains(&len) {
                return Err(ProtocolError::InvalidPrompt(format!(
                    "{name}: {len} bytes outside {}..={}",
                    Self::MIN_PROMPT_LEN,
                    Self::MAX_PROMPT_LEN
                )));
            }
        }
        Ok(())
    }

    /// Encode as a complete wire message (header plus payload).
    ///
    /// The three prompts are laid out back to back in the trailing byte
    /// array with sequential, non-overlapping offsets.
    ///
    /// # Errors
    ///
    /// Any [`Self::validate`] violation.
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<()> {
        self.validate()?;

        let clip_l = self.prompts.clip_l.as_bytes();
        let clip_g = self.prompts.clip_g.as_bytes();
        let t5 = self.prompts.t5.as_bytes();
        // Bounded by validate(): at most 3 * 256 bytes.
        let data_len = clip_l.len() + clip_g.len() + t5.len();

        let header = MessageHeader::new(MessageType::Request, (FIXED_SIZE + data_len) as u32)?;
        dst.put_slice(&header.to_bytes());

        dst.put_u64(self.request_id);
        dst.put_u32(self.model_id);
        dst.put_u32(self.width);
        dst.put_u32(self.height);
        dst.put_u32(self.steps);
        dst.put_f32(self.cfg_scale);
        dst.put_u64(self.seed);

        dst.put_u32(0);
        dst.put_u32(clip_l.len() as u32);
        dst.put_u32(clip_l.len() as u32);
        dst.put_u32(clip_g.len() as u32);
        dst.put_u32((clip_l.len() + clip_g.len()) as u32);
        dst.put_u32(t5.len() as u32);

        dst.put_slice(clip_l);
        dst.put_slice(clip_g);
        dst.put_slice(t5);

        Ok(())
    }

    /// Encode into a freshly sized buffer.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let data_len =
            self.prompts.clip_l.len() + self.prompts.clip_g.len() + self.prompts.t5.len();
        let mut buf = Vec::with_capacity(MessageHeader::SIZE + FIXED_SIZE + data_len);
        self.encode(&mut buf)?;
        Ok(buf)
    }

    /// Decode a complete wire message.
    ///
    /// The buffer must contain exactly one message: the 16-byte header
    /// followed by precisely `payload_len` bytes.
    ///
    /// # Errors
    ///
    /// Header violations from [`MessageHeader::from_bytes`], framing
    /// violations (truncation, trailing bytes), and every field bound
    /// from [`Self::validate`]. Prompt slices are additionally checked
    /// against the trailing array with overflow-safe arithmetic and must
    /// be well-formed UTF-8.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let payload = framed_payload(bytes, MessageType::Request)?;
        if payload.len() < FIXED_SIZE {
            return Err(ProtocolError::Truncated { expected: FIXED_SIZE, actual: payload.len() });
        }

        // Fixed-layout reads are safe: length checked just above.
        let mut buf = payload;
        let request_id = buf.get_u64();
        let model_id = buf.get_u32();
        let width = buf.get_u32();
        let height = buf.get_u32();
        let steps = buf.get_u32();
        let cfg_scale = buf.get_f32();
        let seed = buf.get_u64();
        let clip_l_off = buf.get_u32();
        let clip_l_len = buf.get_u32();
        let clip_g_off = buf.get_u32();
        let clip_g_len = buf.get_u32();
        let t5_off = buf.get_u32();
        let t5_len = buf.get_u32();

        if model_id != MODEL_SD35 {
            return Err(ProtocolError::InvalidModelId(model_id));
        }
        validate_dimensions(width, height)?;
        if !(Self::MIN_STEPS..=Self::MAX_STEPS).contains(&steps) {
            return Err(ProtocolError::InvalidSteps(steps));
        }
        validate_cfg(cfg_scale)?;

        let data = &payload[FIXED_SIZE..];
        if data.len() > Self::MAX_PROMPT_DATA {
            return Err(ProtocolError::InvalidPrompt(format!(
                "prompt data is {} bytes, maximum is {}",
                data.len(),
                Self::MAX_PROMPT_DATA
            )));
        }

        let clip_l = prompt_slice(data, "clip_l", clip_l_off, clip_l_len)?;
        let clip_g = prompt_slice(data, "clip_g", clip_g_off, clip_g_len)?;
        let t5 = prompt_slice(data, "t5", t5_off, t5_len)?;

        Ok(Self {
            request_id,
            model_id,
            width,
            height,
            steps,
            cfg_scale,
            seed,
            prompts: PromptSet {
                clip_l: clip_l.to_owned(),
                clip_g: clip_g.to_owned(),
                t5: t5.to_owned(),
            },
        })
    }
}

/// Resolve one `(offset, length)` prompt pair against the trailing array.
///
/// Written so that no addition can wrap: the length bound is checked
/// first, then the offset is compared against `data_len - length`.
fn prompt_slice<'a>(data: &'a [u8], name: &str, offset: u32, length: u32) -> Result<&'a str> {
    let len = length as usize;
    if !(GenerateRequest::MIN_PROMPT_LEN..=GenerateRequest::MAX_PROMPT_LEN).contains(&len) {
        return Err(ProtocolError::InvalidPrompt(format!(
            "{name}: length {length} outside {}..={}",
            GenerateRequest::MIN_PROMPT_LEN,
            GenerateRequest::MAX_PROMPT_LEN
        )));
    }
    if len > data.len() {
        return Err(ProtocolError::InvalidPrompt(format!(
            "{name}: length {length} exceeds prompt data ({} bytes)",
            data.len()
        )));
    }
    let off = offset as usize;
    if off > data.len() - len {
        return Err(ProtocolError::InvalidPrompt(format!(
            "{name}: offset {offset} puts slice past prompt data ({} bytes)",
            data.len()
        )));
    }
    std::str::from_utf8(&data[off..off + len])
        .map_err(|_| ProtocolError::InvalidPrompt(format!("{name}: not valid UTF-8")))
}

/// Shared dimension bounds: 64..=2048, multiples of 64.
pub(crate) fn validate_dimensions(width: u32, height: u32) -> Result<()> {
    for dim in [width, height] {
        if !(GenerateRequest::MIN_DIMENSION..=GenerateRequest::MAX_DIMENSION).contains(&dim)
            || dim % GenerateRequest::DIMENSION_ALIGN != 0
        {
            return Err(ProtocolError::InvalidDimensions { width, height });
        }
    }
    Ok(())
}

/// CFG scale must be a finite value in 0.0..=20.0.
fn validate_cfg(cfg: f32) -> Result<()> {
    if !cfg.is_finite() || cfg < 0.0 || cfg > GenerateRequest::MAX_CFG_SCALE {
        return Err(ProtocolError::InvalidCfg(cfg));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> GenerateRequest {
        GenerateRequest {
            request_id: 12345,
            model_id: MODEL_SD35,
            width: 512,
            height: 768,
            steps: 28,
            cfg_scale: 7.0,
            seed: 9999,
            prompts: PromptSet {
                clip_l: "a red fox".into(),
                clip_g: "a red fox, detailed".into(),
                t5: "a red fox sitting in the snow".into(),
            },
        }
    }

    #[test]
    fn round_trip() {
        let request = sample_request();
        let wire = request.to_bytes().unwrap();
        let decoded = GenerateRequest::decode(&wire).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn encode_is_big_endian() {
        let wire = sample_request().to_bytes().unwrap();
        // request_id sits right after the header.
        assert_eq!(wire[16..24], 12345u64.to_be_bytes());
        // cfg_scale is the IEEE-754 bit pattern, big-endian.
        assert_eq!(wire[40..44], 7.0f32.to_be_bytes());
    }

    #[test]
    fn reject_bad_model_id() {
        let mut request = sample_request();
        request.model_id = 1;
        let mut wire = sample_request().to_bytes().unwrap();
        wire[24..28].copy_from_slice(&1u32.to_be_bytes());
        assert_eq!(GenerateRequest::decode(&wire), Err(ProtocolError::InvalidModelId(1)));
        assert_eq!(request.to_bytes(), Err(ProtocolError::InvalidModelId(1)));
    }

    #[test]
    fn reject_misaligned_dimensions() {
        let mut wire = sample_request().to_bytes().unwrap();
        wire[28..32].copy_from_slice(&100u32.to_be_bytes());
        assert_eq!(
            GenerateRequest::decode(&wire),
            Err(ProtocolError::InvalidDimensions { width: 100, height: 768 })
        );
    }

    #[test]
    fn reject_out_of_range_dimensions() {
        for dim in [0u32, 63, 2112, 4096] {
            let mut request = sample_request();
            request.height = dim;
            assert!(matches!(
                request.to_bytes(),
                Err(ProtocolError::InvalidDimensions { .. })
            ));
        }
    }

    #[test]
    fn reject_bad_steps() {
        for steps in [0u32, 101, u32::MAX] {
            let mut request = sample_request();
            request.steps = steps;
            assert_eq!(request.to_bytes(), Err(ProtocolError::InvalidSteps(steps)));
        }
    }

    #[test]
    fn reject_non_finite_cfg() {
        for cfg in [f32::NAN, f32::INFINITY, f32::NEG_INFINITY, -0.5, 20.5] {
            let mut wire = sample_request().to_bytes().unwrap();
            wire[40..44].copy_from_slice(&cfg.to_be_bytes());
            assert!(
                matches!(GenerateRequest::decode(&wire), Err(ProtocolError::InvalidCfg(_))),
                "cfg {cfg} should be rejected"
            );
        }
    }

    #[test]
    fn first_violation_in_field_order_wins() {
        // Both the model id and the steps are invalid; the model id is
        // earlier in the field order and must be the reported violation.
        let mut wire = sample_request().to_bytes().unwrap();
        wire[24..28].copy_from_slice(&9u32.to_be_bytes());
        wire[36..40].copy_from_slice(&0u32.to_be_bytes());
        assert_eq!(GenerateRequest::decode(&wire), Err(ProtocolError::InvalidModelId(9)));
    }

    #[test]
    fn overlapping_prompt_slices_accepted() {
        // Hand-build a request whose three pairs all alias the same bytes.
        let data = b"shared prompt";
        let mut request = sample_request();
        request.prompts = PromptSet::uniform("xxxxxxxxxxxxx");
        assert_eq!(request.prompts.clip_l.len(), data.len());

        let mut wire = request.to_bytes().unwrap();
        let fixed_end = MessageHeader::SIZE + FIXED_SIZE;
        // Rewrite all three pairs to (0, data.len()) and shrink the data
        // region to a single copy.
        wire.truncate(fixed_end);
        for pair in 0..3u32 {
            let at = MessageHeader::SIZE + 36 + (pair as usize) * 8;
            wire[at..at + 4].copy_from_slice(&0u32.to_be_bytes());
            wire[at + 4..at + 8].copy_from_slice(&(data.len() as u32).to_be_bytes());
        }
        wire.extend_from_slice(data);
        let payload_len = (wire.len() - MessageHeader::SIZE) as u32;
        wire[8..12].copy_from_slice(&payload_len.to_be_bytes());

        let decoded = GenerateRequest::decode(&wire).unwrap();
        assert_eq!(decoded.prompts.clip_l, "shared prompt");
        assert_eq!(decoded.prompts.clip_g, "shared prompt");
        assert_eq!(decoded.prompts.t5, "shared prompt");
    }

    #[test]
    fn reject_prompt_offset_overflow() {
        // offset = u32::MAX with a valid length must fail cleanly instead
        // of wrapping in the bounds arithmetic.
        let mut wire = sample_request().to_bytes().unwrap();
        wire[52..56].copy_from_slice(&u32::MAX.to_be_bytes());
        assert!(matches!(
            GenerateRequest::decode(&wire),
            Err(ProtocolError::InvalidPrompt(_))
        ));
    }

    #[test]
    fn reject_zero_length_prompt() {
        let mut request = sample_request();
        request.prompts.clip_g = String::new();
        assert!(matches!(request.to_bytes(), Err(ProtocolError::InvalidPrompt(_))));
    }

    #[test]
    fn reject_oversized_prompt() {
        let mut request = sample_request();
        request.prompts.t5 = "x".repeat(257);
        assert!(matches!(request.to_bytes(), Err(ProtocolError::InvalidPrompt(_))));
    }

    #[test]
    fn reject_non_utf8_prompt() {
        let mut wire = sample_request().to_bytes().unwrap();
        // First prompt byte lives right after the fixed section.
        wire[MessageHeader::SIZE + FIXED_SIZE] = 0xFF;
        assert!(matches!(
            GenerateRequest::decode(&wire),
            Err(ProtocolError::InvalidPrompt(_))
        ));
    }

    #[test]
    fn reject_truncated_and_padded_messages() {
        let wire = sample_request().to_bytes().unwrap();

        let mut short = wire.clone();
        short.pop();
        assert!(matches!(
            GenerateRequest::decode(&short),
            Err(ProtocolError::Truncated { .. })
        ));

        let mut long = wire;
        long.push(0);
        assert_eq!(
            GenerateRequest::decode(&long),
            Err(ProtocolError::TrailingBytes { extra: 1 })
        );
    }

    #[test]
    fn reject_response_framed_as_request() {
        let mut wire = sample_request().to_bytes().unwrap();
        wire[6..8].copy_from_slice(&MessageType::Response.to_u16().to_be_bytes());
        assert!(matches!(
            GenerateRequest::decode(&wire),
            Err(ProtocolError::UnexpectedMessageType { .. })
        ));
    }
}
