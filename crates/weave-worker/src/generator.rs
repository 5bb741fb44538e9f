//! The generator capability boundary.
//!
//! The worker itself knows nothing about diffusion models. It hands
//! validated parameters to a [`Generator`] and frames whatever comes
//! back. A GPU-backed implementation lives outside this crate; the
//! in-tree [`PatternGenerator`] is the CPU backend used by the test
//! suites and by the binary when no GPU backend is linked.

use thiserror::Error;
use weave_proto::{ErrorCode, GenerateRequest, PromptSet};

/// Validated parameters of one generation, converted from a decoded
/// request.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateParams {
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

impl From<&GenerateRequest> for GenerateParams {
    fn from(request: &GenerateRequest) -> Self {
        Self {
            width: request.width,
            height: request.height,
            steps: request.steps,
            cfg_scale: request.cfg_scale,
            seed: request.seed,
            prompts: request.prompts.clone(),
        }
    }
}

/// One generated image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageOutput {
    /// Image width in pixels.
    pub width: u32,
    /// Image height in pixels.
    pub height: u32,
    /// Samples per pixel: 3 (RGB) or 4 (RGBA).
    pub channels: u32,
    /// Raw interleaved pixel bytes, row-major.
    pub pixels: Vec<u8>,
}

/// Failures a generator backend can report.
///
/// Each variant maps to one wire error code so the worker can mirror
/// backend failures to its peer without interpretation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GeneratorError {
    /// The backend rejected a prompt.
    #[error("prompt rejected: {0}")]
    InvalidPrompt(String),

    /// The backend rejected the requested geometry.
    #[error("dimensions rejected: {0}")]
    InvalidDimensions(String),

    /// The backend ran out of memory.
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// The device failed.
    #[error("device failure: {0}")]
    Device(String),

    /// The generation exceeded the backend's own time budget.
    #[error("generation timed out: {0}")]
    Timeout(String),

    /// Anything else.
    #[error("internal generator failure: {0}")]
    Internal(String),
}

impl GeneratorError {
    /// The wire code reported for this failure.
    #[must_use]
    pub const fn error_code(&self) -> ErrorCode {
        match self {
            Self::InvalidPrompt(_) => ErrorCode::InvalidPrompt,
            Self::InvalidDimensions(_) => ErrorCode::InvalidDimensions,
            Self::OutOfMemory(_) => ErrorCode::OutOfMemory,
            Self::Device(_) => ErrorCode::GpuError,
            Self::Timeout(_) => ErrorCode::Timeout,
            Self::Internal(_) => ErrorCode::Internal,
        }
    }
}

/// An image generation backend.
///
/// The worker drives exactly one generator from its single thread, one
/// generation at a time. `reset` runs before every generation; backends
/// for which consecutive generations with differing prompt lengths are
/// known to be safe may implement it as a no-op.
pub trait Generator {
    /// Drop and recreate any per-generation state.
    fn reset(&mut self) -> Result<(), GeneratorError>;

    /// Produce one image from validated parameters.
    fn generate(&mut self, params: &GenerateParams) -> Result<ImageOutput, GeneratorError>;
}

/// Deterministic CPU backend producing an 8x8-block checkerboard.
///
/// Every channel of a pixel is 0xFF or 0x00 depending on the parity of
/// its 8x8 block, regardless of prompt or seed. Useful wherever a real
/// model would only slow things down: integration tests, development
/// without a GPU.
#[derive(Debug, Default)]
pub struct PatternGenerator {
    resets: u64,
}

impl PatternGenerator {
    /// Pixel block edge length.
    pub const BLOCK: u32 = 8;

    /// Channels produced per pixel (RGB).
    pub const CHANNELS: u32 = 3;

    /// Create a fresh pattern backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// How many times `reset` has run. The accept loop resets before
    /// every generation; tests assert on this.
    #[must_use]
    pub fn resets(&self) -> u64 {
        self.resets
    }

    /// The checkerboard value at a pixel.
    #[must_use]
    pub fn value_at(x: u32, y: u32) -> u8 {
        if (x / Self::BLOCK + y / Self::BLOCK) % 2 == 0 { 0xFF } else { 0x00 }
    }
}

impl Generator for PatternGenerator {
    fn reset(&mut self) -> Result<(), GeneratorError> {
        self.resets += 1;
        Ok(())
    }

    fn generate(&mut self, params: &GenerateParams) -> Result<ImageOutput, GeneratorError> {
        let len = params.width as usize * params.height as usize * Self::CHANNELS as usize;
        let mut pixels = Vec::with_capacity(len);
        for y in 0..params.height {
            for x in 0..params.width {
                let value = Self::value_at(x, y);
                for _ in 0..Self::CHANNELS {
                    pixels.push(value);
                }
            }
        }
        Ok(ImageOutput {
            width: params.width,
            height: params.height,
            channels: Self::CHANNELS,
            pixels,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(width: u32, height: u32) -> GenerateParams {
        GenerateParams {
            width,
            height,
            steps: 28,
            cfg_scale: 7.0,
            seed: 1,
            prompts: PromptSet::uniform("test prompt"),
        }
    }

    #[test]
    fn checkerboard_geometry() {
        let mut generator = PatternGenerator::new();
        let image = generator.generate(&params(64, 64)).unwrap();

        assert_eq!(image.width, 64);
        assert_eq!(image.height, 64);
        assert_eq!(image.channels, 3);
        assert_eq!(image.pixels.len(), 64 * 64 * 3);

        // Top-left block is lit, its right neighbor is dark, and all
        // channels of a pixel agree.
        assert_eq!(image.pixels[0], 0xFF);
        assert_eq!(image.pixels[1], 0xFF);
        assert_eq!(image.pixels[2], 0xFF);
        let neighbor = 8 * 3;
        assert_eq!(image.pixels[neighbor], 0x00);
    }

    #[test]
    fn checkerboard_alternates_by_block() {
        let mut generator = PatternGenerator::new();
        let image = generator.generate(&params(64, 64)).unwrap();

        for (x, y) in [(0u32, 0u32), (8, 0), (0, 8), (8, 8), (63, 63)] {
            let expected = PatternGenerator::value_at(x, y);
            let at = ((y * 64 + x) * 3) as usize;
            assert_eq!(image.pixels[at], expected, "pixel ({x},{y})");
        }
    }

    #[test]
    fn reset_is_counted() {
        let mut generator = PatternGenerator::new();
        assert_eq!(generator.resets(), 0);
        generator.reset().unwrap();
        generator.reset().unwrap();
        assert_eq!(generator.resets(), 2);
    }

    #[test]
    fn failure_codes_follow_taxonomy() {
        assert_eq!(
            GeneratorError::InvalidPrompt(String::new()).error_code(),
            ErrorCode::InvalidPrompt
        );
        assert_eq!(
            GeneratorError::InvalidDimensions(String::new()).error_code(),
            ErrorCode::InvalidDimensions
        );
        assert_eq!(GeneratorError::OutOfMemory(String::new()).error_code(), ErrorCode::OutOfMemory);
        assert_eq!(GeneratorError::Device(String::new()).error_code(), ErrorCode::GpuError);
        assert_eq!(GeneratorError::Timeout(String::new()).error_code(), ErrorCode::Timeout);
        assert_eq!(GeneratorError::Internal(String::new()).error_code(), ErrorCode::Internal);
    }
}
