//! Per-frame transforms.
//!
//! The controller applies exactly one `FrameTransform` to every frame between
//! acquisition and the sinks. Transforms may change the channel layout (an edge map
//! is single-channel); the pipeline normalizes before encoding sinks.

use image::imageops;
use image::GrayImage;
use imageproc::edges::canny;

use crate::frame::{Frame, PixelFormat};

pub trait FrameTransform: Send {
    fn process(&mut self, frame: Frame) -> Frame;
}

/// Passes frames through unchanged.
#[derive(Clone, Copy, Debug, Default)]
pub struct Identity;

impl FrameTransform for Identity {
    fn process(&mut self, frame: Frame) -> Frame {
        frame
    }
}

impl<F> FrameTransform for F
where
    F: FnMut(Frame) -> Frame + Send,
{
    fn process(&mut self, frame: Frame) -> Frame {
        self(frame)
    }
}

// ----------------------------------------------------------------------------
// EdgeFilter
// ----------------------------------------------------------------------------

const DEFAULT_LOW_THRESHOLD: f32 = 70.0;
const DEFAULT_HIGH_THRESHOLD: f32 = 135.0;
/// Sigma of a 3x3 Gaussian kernel.
const BLUR_SIGMA: f32 = 0.8;

/// Canny edge map: grayscale, 3x3 blur, then `imageproc` Canny with the
/// `low`/`high` hysteresis thresholds. Output is `Gray8`, 255 on edges.
#[derive(Clone, Copy, Debug)]
pub struct EdgeFilter {
    pub low: f32,
    pub high: f32,
}

impl Default for EdgeFilter {
    fn default() -> Self {
        Self {
            low: DEFAULT_LOW_THRESHOLD,
            high: DEFAULT_HIGH_THRESHOLD,
        }
    }
}

impl FrameTransform for EdgeFilter {
    fn process(&mut self, frame: Frame) -> Frame {
        let (width, height) = (frame.width(), frame.height());
        let gray = frame.into_gray();
        let Some(img) = GrayImage::from_raw(width, height, gray.data().to_vec()) else {
            return gray;
        };
        let blurred = imageops::blur(&img, BLUR_SIGMA);
        // canny requires low <= high.
        let (low, high) = (self.low.min(self.high), self.low.max(self.high));
        let edges = canny(&blurred, low, high);
        Frame::new(edges.into_raw(), width, height, PixelFormat::Gray8).unwrap_or(gray)
    }
}
