//! Synthetic (`stub://`) backend.
//!
//! Generates a moving test pattern without any media library. URL form:
//!
//! `stub://<name>?frames=<N>&size=<W>x<H>&fps=<F>`
//!
//! All query keys are optional. Without `frames` the backend never runs out.
//! Paced backends sleep so reads arrive at `fps`, like a capture device; unpaced
//! backends return immediately, like a file decoder.

use anyhow::{anyhow, bail, Context, Result};
use std::thread;
use std::time::{Duration, Instant};

use super::{CaptureBackend, StreamInfo};
use crate::frame::{Frame, PixelFormat, Resolution};

const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const DEFAULT_FPS: f64 = 30.0;

#[derive(Clone, Debug, PartialEq)]
pub struct SyntheticConfig {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    /// Total frames before end of stream. `None` is endless.
    pub frames: Option<u64>,
    /// Sleep between reads to match `fps`.
    pub paced: bool,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            name: "synthetic".to_string(),
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            fps: DEFAULT_FPS,
            frames: None,
            paced: false,
        }
    }
}

impl SyntheticConfig {
    /// Parse the part of a stub URL after `stub://`.
    pub fn parse(spec: &str, default_frames: Option<u64>) -> Result<Self> {
        let (name, query) = spec.split_once('?').unwrap_or((spec, ""));
        let mut config = Self {
            name: if name.is_empty() {
                "synthetic".to_string()
            } else {
                name.to_string()
            },
            frames: default_frames,
            ..Self::default()
        };

        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| anyhow!("stub option '{}' is missing a value", pair))?;
            match key {
                "frames" => {
                    config.frames = Some(value.parse().context("stub frames must be an integer")?)
                }
                "size" => {
                    let (w, h) = value
                        .split_once('x')
                        .ok_or_else(|| anyhow!("stub size must look like 640x480"))?;
                    config.width = w.parse().context("stub width must be an integer")?;
                    config.height = h.parse().context("stub height must be an integer")?;
                }
                "fps" => config.fps = value.parse().context("stub fps must be a number")?,
                other => bail!("unknown stub option '{}'", other),
            }
        }

        if config.width == 0 || config.height == 0 {
            bail!("stub size must be non-zero");
        }
        Resolution::new(config.width, config.height)
            .byte_len(PixelFormat::Rgb24)
            .context("stub size is too large")?;
        if !(config.fps.is_finite() && config.fps > 0.0) {
            bail!("stub fps must be positive");
        }
        Ok(config)
    }

    pub fn paced(mut self) -> Self {
        self.paced = true;
        self
    }
}

pub struct SyntheticBackend {
    config: SyntheticConfig,
    opened: bool,
    frame_count: u64,
    /// Simulated "scene" state so consecutive frames differ.
    scene_state: u8,
    next_due: Option<Instant>,
}

impl SyntheticBackend {
    pub fn new(config: SyntheticConfig) -> Self {
        Self {
            config,
            opened: false,
            frame_count: 0,
            scene_state: 0,
            next_due: None,
        }
    }

    pub fn frames_generated(&self) -> u64 {
        self.frame_count
    }

    fn generate_pixels(&mut self) -> Vec<u8> {
        let pixel_count = self.config.width as usize * self.config.height as usize * 3;

        if self.frame_count % 50 == 0 {
            self.scene_state = self.scene_state.wrapping_add(1);
        }

        let mut pixels = vec![0u8; pixel_count];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            *pixel = ((i as u64 + self.frame_count + self.scene_state as u64) % 256) as u8;
        }
        pixels
    }

    fn pace(&mut self) {
        let interval = Duration::from_secs_f64(1.0 / self.config.fps);
        let now = Instant::now();
        let due = self.next_due.unwrap_or(now);
        if due > now {
            thread::sleep(due - now);
        }
        self.next_due = Some(due.max(now) + interval);
    }
}

impl CaptureBackend for SyntheticBackend {
    fn describe(&self) -> String {
        format!("stub://{}", self.config.name)
    }

    /// Synthetic sources are always available at any sane size.
    fn open(&mut self) -> Result<StreamInfo> {
        let resolution = Resolution::new(self.config.width, self.config.height);
        resolution.byte_len(PixelFormat::Rgb24)?;
        self.opened = true;
        Ok(StreamInfo::new(resolution, self.config.fps))
    }

    fn read(&mut self) -> Result<Option<Frame>> {
        if !self.opened {
            bail!("{} is not open", self.describe());
        }
        if self.config.frames.is_some_and(|limit| self.frame_count >= limit) {
            return Ok(None);
        }
        if self.config.paced {
            self.pace();
        }

        self.frame_count += 1;
        let pixels = self.generate_pixels();
        Frame::new(
            pixels,
            self.config.width,
            self.config.height,
            PixelFormat::Rgb24,
        )
        .map(Some)
    }

    fn close(&mut self) {
        self.opened = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_reads_all_options() -> Result<()> {
        let config = SyntheticConfig::parse("lobby?frames=12&size=320x240&fps=15", None)?;
        assert_eq!(config.name, "lobby");
        assert_eq!(config.frames, Some(12));
        assert_eq!((config.width, config.height), (320, 240));
        assert_eq!(config.fps, 15.0);
        assert!(!config.paced);
        Ok(())
    }

    #[test]
    fn parse_applies_defaults() -> Result<()> {
        let config = SyntheticConfig::parse("", Some(10))?;
        assert_eq!(config.name, "synthetic");
        assert_eq!(config.frames, Some(10));
        assert_eq!((config.width, config.height), (640, 480));
        Ok(())
    }

    #[test]
    fn parse_rejects_bad_options() {
        assert!(SyntheticConfig::parse("x?size=0x10", None).is_err());
        assert!(SyntheticConfig::parse("x?fps=0", None).is_err());
        assert!(SyntheticConfig::parse("x?colour=red", None).is_err());
        assert!(SyntheticConfig::parse("x?frames", None).is_err());
    }

    #[test]
    fn oversized_stub_is_an_error_not_a_panic() {
        assert!(SyntheticConfig::parse("x?size=70000x70000", None).is_err());

        let mut backend = SyntheticBackend::new(SyntheticConfig {
            width: 70_000,
            height: 70_000,
            ..SyntheticConfig::default()
        });
        assert!(backend.open().is_err());
        assert!(backend.read().is_err(), "never opened");
    }

    #[test]
    fn finite_backend_ends_after_limit() -> Result<()> {
        let config = SyntheticConfig::parse("clip?frames=2&size=4x4", None)?;
        let mut backend = SyntheticBackend::new(config);
        assert!(backend.read().is_err(), "read before open");

        let info = backend.open()?;
        assert_eq!(info.resolution, Resolution::new(4, 4));
        assert!(backend.read()?.is_some());
        assert!(backend.read()?.is_some());
        assert!(backend.read()?.is_none());
        assert_eq!(backend.frames_generated(), 2);
        Ok(())
    }

    #[test]
    fn consecutive_frames_differ() -> Result<()> {
        let mut backend = SyntheticBackend::new(SyntheticConfig::parse("x?size=4x4", None)?);
        backend.open()?;
        let a = backend.read()?.expect("frame");
        let b = backend.read()?.expect("frame");
        assert_ne!(a.data(), b.data());
        Ok(())
    }
}
