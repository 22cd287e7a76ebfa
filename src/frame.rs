//! Frame container.
//!
//! - `Frame`: one decoded image, immutable once produced. Stages hand frames to each
//!   other by value; nothing in the pipeline mutates a frame in place.
//! - `PixelFormat`: packed layouts the pipeline understands.
//! - `Resolution`: frame dimensions, plus output-size resolution for scaling.
//!
//! Sources produce tightly packed rows (no stride padding). Backends that receive
//! padded buffers must repack them before calling `Frame::new`.

use anyhow::{anyhow, Result};
use image::imageops::{self, FilterType};
use image::{GrayImage, ImageBuffer, Rgb, RgbImage};
use std::fmt;

/// Largest pixel buffer a frame may hold (1 GiB, well above 8K RGB).
pub const MAX_FRAME_BYTES: usize = 1 << 30;

// ----------------------------------------------------------------------------
// PixelFormat / Resolution
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelFormat {
    /// Packed 8-bit RGB, 3 bytes per pixel.
    Rgb24,
    /// Single 8-bit luma channel.
    Gray8,
}

impl PixelFormat {
    pub fn channels(self) -> usize {
        match self {
            PixelFormat::Rgb24 => 3,
            PixelFormat::Gray8 => 1,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Output resolution for a scale factor.
    ///
    /// Dimensions are truncated toward zero and clamped to at least one pixel.
    /// A factor of exactly 1.0 returns the input unchanged.
    pub fn scaled(self, factor: f64) -> Self {
        if factor == 1.0 {
            return self;
        }
        let scale = |v: u32| ((v as f64 * factor) as u32).max(1);
        Self {
            width: scale(self.width),
            height: scale(self.height),
        }
    }

    /// Buffer size for `format` at this resolution. Fails above `MAX_FRAME_BYTES`.
    pub(crate) fn byte_len(self, format: PixelFormat) -> Result<usize> {
        (self.width as usize)
            .checked_mul(self.height as usize)
            .and_then(|v| v.checked_mul(format.channels()))
            .filter(|len| *len <= MAX_FRAME_BYTES)
            .ok_or_else(|| anyhow!("frame size {} exceeds {} bytes", self, MAX_FRAME_BYTES))
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// One decoded image.
///
/// Pixel bytes are only reachable through `&self` accessors or by consuming the
/// frame, so a frame observed by one stage can never be changed under it.
#[derive(Clone)]
pub struct Frame {
    data: Vec<u8>,
    resolution: Resolution,
    format: PixelFormat,
}

impl Frame {
    /// Create a frame, checking that `data` matches the declared dimensions.
    pub fn new(data: Vec<u8>, width: u32, height: u32, format: PixelFormat) -> Result<Self> {
        let resolution = Resolution::new(width, height);
        let expected = resolution.byte_len(format)?;
        if data.len() != expected {
            return Err(anyhow!(
                "{:?} frame length mismatch: expected {}, got {}",
                format,
                expected,
                data.len()
            ));
        }
        Ok(Self {
            data,
            resolution,
            format,
        })
    }

    pub fn width(&self) -> u32 {
        self.resolution.width
    }

    pub fn height(&self) -> u32 {
        self.resolution.height
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Resize to `target` with bilinear filtering. Returns `self` untouched when
    /// the frame already has that size.
    pub fn resize(self, target: Resolution) -> Result<Self> {
        if self.resolution == target {
            return Ok(self);
        }
        let Resolution { width, height } = self.resolution;
        let data = match self.format {
            PixelFormat::Rgb24 => {
                let img = RgbImage::from_raw(width, height, self.data)
                    .ok_or_else(|| anyhow!("RGB buffer does not match {}", self.resolution))?;
                imageops::resize(&img, target.width, target.height, FilterType::Triangle)
                    .into_raw()
            }
            PixelFormat::Gray8 => {
                let img = GrayImage::from_raw(width, height, self.data)
                    .ok_or_else(|| anyhow!("gray buffer does not match {}", self.resolution))?;
                imageops::resize(&img, target.width, target.height, FilterType::Triangle)
                    .into_raw()
            }
        };
        Self::new(data, target.width, target.height, self.format)
    }

    /// Convert to packed RGB, the layout every encoding sink expects.
    pub fn into_rgb(self) -> Self {
        match self.format {
            PixelFormat::Rgb24 => self,
            PixelFormat::Gray8 => {
                let mut rgb = Vec::with_capacity(self.data.len() * 3);
                for &luma in &self.data {
                    rgb.extend_from_slice(&[luma, luma, luma]);
                }
                Self {
                    data: rgb,
                    resolution: self.resolution,
                    format: PixelFormat::Rgb24,
                }
            }
        }
    }

    /// Convert to single-channel luma.
    pub fn into_gray(self) -> Self {
        if self.format == PixelFormat::Gray8 {
            return self;
        }
        let Resolution { width, height } = self.resolution;
        let gray = ImageBuffer::<Rgb<u8>, &[u8]>::from_raw(width, height, self.data.as_slice())
            .map(|rgb| imageops::grayscale(&rgb).into_raw());
        // Length was validated by Frame::new.
        let Some(gray) = gray else {
            return self;
        };
        Self {
            data: gray,
            resolution: self.resolution,
            format: PixelFormat::Gray8,
        }
    }
}

impl fmt::Debug for Frame {
    // Pixel bytes are deliberately left out; frames are large.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("resolution", &self.resolution)
            .field("format", &self.format)
            .field("bytes", &self.data.len())
            .finish()
    }
}

pub(crate) fn clamp_to_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn solid_rgb(width: u32, height: u32, value: u8) -> Frame {
        let len = (width * height * 3) as usize;
        Frame::new(vec![value; len], width, height, PixelFormat::Rgb24).unwrap()
    }

    #[test]
    fn frame_rejects_length_mismatch() {
        assert!(Frame::new(vec![0u8; 10], 2, 2, PixelFormat::Rgb24).is_err());
        assert!(Frame::new(vec![0u8; 4], 2, 2, PixelFormat::Gray8).is_ok());
    }

    #[test]
    fn oversized_frames_are_rejected() {
        assert!(Resolution::new(70_000, 70_000).byte_len(PixelFormat::Rgb24).is_err());
        assert!(Resolution::new(u32::MAX, u32::MAX).byte_len(PixelFormat::Gray8).is_err());
        assert_eq!(
            Resolution::new(7680, 4320).byte_len(PixelFormat::Rgb24).unwrap(),
            7680 * 4320 * 3
        );
    }

    #[test]
    fn scale_half_of_vga_is_qvga() {
        let out = Resolution::new(640, 480).scaled(0.5);
        assert_eq!(out, Resolution::new(320, 240));
    }

    #[test]
    fn scale_truncates_and_never_reaches_zero() {
        assert_eq!(Resolution::new(641, 481).scaled(0.5), Resolution::new(320, 240));
        assert_eq!(Resolution::new(3, 3).scaled(0.1), Resolution::new(1, 1));
        assert_eq!(Resolution::new(640, 480).scaled(1.0), Resolution::new(640, 480));
    }

    #[test]
    fn resize_produces_target_dimensions() -> Result<()> {
        let frame = solid_rgb(640, 480, 90).resize(Resolution::new(320, 240))?;
        assert_eq!(frame.resolution(), Resolution::new(320, 240));
        assert_eq!(frame.data().len(), 320 * 240 * 3);
        // Uniform input stays uniform under bilinear filtering.
        assert!(frame.data().iter().all(|&b| b == 90));
        Ok(())
    }

    #[test]
    fn resize_to_same_size_keeps_pixels() -> Result<()> {
        let data: Vec<u8> = (0..48).map(|i| i as u8).collect();
        let frame = Frame::new(data.clone(), 4, 4, PixelFormat::Rgb24)?;
        let same = frame.resize(Resolution::new(4, 4))?;
        assert_eq!(same.data(), data.as_slice());
        Ok(())
    }

    #[test]
    fn gray_to_rgb_replicates_luma() -> Result<()> {
        let frame = Frame::new(vec![10, 200], 2, 1, PixelFormat::Gray8)?.into_rgb();
        assert_eq!(frame.format(), PixelFormat::Rgb24);
        assert_eq!(frame.data(), &[10, 10, 10, 200, 200, 200]);
        Ok(())
    }

    #[test]
    fn rgb_to_gray_uses_luma_weights() -> Result<()> {
        let frame = Frame::new(vec![255, 255, 255, 0, 0, 0], 2, 1, PixelFormat::Rgb24)?;
        let gray = frame.into_gray();
        assert_eq!(gray.data(), &[255, 0]);
        Ok(())
    }
}
