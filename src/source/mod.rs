//! Frame sources.
//!
//! This module provides the sources a pipeline can read from:
//! - Capture devices (feature: ingest-v4l2)
//! - Network streams (feature: gstreamer-media)
//! - Local video files (feature: ingest-file-ffmpeg)
//! - Stub source (`stub://` URLs and paths, testing)
//!
//! Each concrete decoder implements `CaptureBackend`. A `FrameSource` wraps one
//! backend in one of two modes:
//! - **Live** (device, stream): the backend runs on a `BackgroundAcquirer` thread and
//!   `read()` takes whatever is in the single-slot holder. An empty slot is
//!   `SourceRead::Pending`, never end-of-stream.
//! - **Local** (file): `read()` decodes synchronously, in lockstep with the caller.
//!   `SourceRead::EndOfStream` is returned exactly when the file is exhausted.

#[cfg(feature = "ingest-v4l2")]
pub mod device;
#[cfg(feature = "ingest-file-ffmpeg")]
pub mod file;
#[cfg_attr(not(feature = "ingest-v4l2"), allow(dead_code))]
mod normalize;
pub mod stream;
pub mod synthetic;

use anyhow::{anyhow, bail, Result};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::acquire::{AcquirerHealth, AcquirerPolicy, BackgroundAcquirer};
use crate::frame::{Frame, Resolution};
use crate::slot::{FrameSlot, SlotStats};

pub use stream::{stream_pipeline_description, StreamOptions};
pub use synthetic::{SyntheticBackend, SyntheticConfig};

/// Frame rate assumed when a backend cannot report one.
pub const FALLBACK_FPS: f64 = 30.0;

const STUB_SCHEME: &str = "stub://";
const DEFAULT_STUB_FILE_FRAMES: u64 = 10;

// ----------------------------------------------------------------------------
// Backend contract
// ----------------------------------------------------------------------------

/// What an opened backend reports about its output.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StreamInfo {
    pub resolution: Resolution,
    /// Nominal frames per second. Zero when unknown.
    pub fps: f64,
}

impl StreamInfo {
    pub fn new(resolution: Resolution, fps: f64) -> Self {
        Self { resolution, fps }
    }

    /// Frame rate to hand to encoders: the reported rate, or `FALLBACK_FPS`.
    pub fn effective_fps(&self) -> f64 {
        if self.fps.is_finite() && self.fps > 0.0 {
            self.fps
        } else {
            FALLBACK_FPS
        }
    }
}

/// A decoder for one concrete source (device, stream, file).
///
/// `read()` blocks until a frame is decoded. `Ok(None)` means the backend has no
/// more frames: the natural end for files, an error condition for live feeds.
pub trait CaptureBackend: Send {
    /// Human-readable identity for logs (device path, URL, file path).
    fn describe(&self) -> String;

    fn open(&mut self) -> Result<StreamInfo>;

    fn read(&mut self) -> Result<Option<Frame>>;

    /// Release the underlying resource. Must tolerate being called more than once.
    fn close(&mut self);
}

// ----------------------------------------------------------------------------
// SourceDescriptor
// ----------------------------------------------------------------------------

/// Which source to open. Exactly one per pipeline.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceDescriptor {
    /// Capture device index (`/dev/video<N>`).
    Device(u32),
    /// Network stream URL.
    Stream(String),
    /// Local video file.
    File(PathBuf),
}

impl SourceDescriptor {
    /// Pick one source from the configured candidates.
    ///
    /// Priority is local file > network stream > device. Blank strings count as
    /// absent. Fails when nothing is configured.
    pub fn select(
        device: Option<u32>,
        stream: Option<&str>,
        file: Option<&Path>,
    ) -> Result<Self> {
        if let Some(path) = file.filter(|p| !p.as_os_str().is_empty()) {
            return Ok(Self::File(path.to_path_buf()));
        }
        if let Some(url) = stream.map(str::trim).filter(|u| !u.is_empty()) {
            return Ok(Self::Stream(url.to_string()));
        }
        if let Some(index) = device {
            return Ok(Self::Device(index));
        }
        Err(anyhow!("no video source specified"))
    }

    pub fn kind(&self) -> SourceKind {
        match self {
            Self::File(_) => SourceKind::Local,
            Self::Device(_) | Self::Stream(_) => SourceKind::Live,
        }
    }
}

impl fmt::Display for SourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Device(index) => write!(f, "device {}", index),
            Self::Stream(url) => write!(f, "stream {}", url),
            Self::File(path) => write!(f, "file {}", path.display()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceKind {
    Live,
    Local,
}

/// Backend settings that do not belong to the descriptor itself.
#[derive(Clone, Debug, Default)]
pub struct SourceOptions {
    pub stream: StreamOptions,
    pub acquirer: AcquirerPolicy,
}

/// Build the backend for `descriptor` without opening it.
pub fn backend_for(
    descriptor: &SourceDescriptor,
    options: &SourceOptions,
) -> Result<Box<dyn CaptureBackend>> {
    match descriptor {
        SourceDescriptor::File(path) => {
            let path_str = path.to_string_lossy();
            if let Some(rest) = path_str.strip_prefix(STUB_SCHEME) {
                let config = SyntheticConfig::parse(rest, Some(DEFAULT_STUB_FILE_FRAMES))?;
                return Ok(Box::new(SyntheticBackend::new(config)));
            }
            if path_str.contains("://") {
                bail!("file sources only accept local paths (got {})", path_str);
            }
            #[cfg(feature = "ingest-file-ffmpeg")]
            {
                Ok(Box::new(file::FfmpegFileBackend::new(path.clone())))
            }
            #[cfg(not(feature = "ingest-file-ffmpeg"))]
            {
                bail!("local file sources require the ingest-file-ffmpeg feature")
            }
        }
        SourceDescriptor::Stream(url) => {
            if let Some(rest) = url.strip_prefix(STUB_SCHEME) {
                let config = SyntheticConfig::parse(rest, None)?.paced();
                return Ok(Box::new(SyntheticBackend::new(config)));
            }
            #[cfg(feature = "gstreamer-media")]
            {
                Ok(Box::new(stream::GstreamerStreamBackend::new(
                    url.clone(),
                    options.stream.clone(),
                )))
            }
            #[cfg(not(feature = "gstreamer-media"))]
            {
                let _ = options;
                bail!("network stream sources require the gstreamer-media feature")
            }
        }
        SourceDescriptor::Device(index) => {
            #[cfg(feature = "ingest-v4l2")]
            {
                Ok(Box::new(device::V4l2DeviceBackend::new(*index)))
            }
            #[cfg(not(feature = "ingest-v4l2"))]
            {
                bail!(
                    "capture device {} requires the ingest-v4l2 feature",
                    index
                )
            }
        }
    }
}

/// Open the source named by `descriptor`. Live sources start acquiring immediately.
pub fn open(descriptor: &SourceDescriptor, options: &SourceOptions) -> Result<FrameSource> {
    let backend = backend_for(descriptor, options)?;
    match descriptor.kind() {
        SourceKind::Live => FrameSource::live(backend, options.acquirer.clone()),
        SourceKind::Local => FrameSource::local(backend),
    }
}

// ----------------------------------------------------------------------------
// FrameSource
// ----------------------------------------------------------------------------

/// Outcome of one `FrameSource::read`.
#[derive(Debug)]
pub enum SourceRead {
    Frame(Frame),
    /// Live source has nothing new yet. Skip the iteration.
    Pending,
    /// Local source is exhausted.
    EndOfStream,
}

pub struct FrameSource {
    name: String,
    info: StreamInfo,
    mode: SourceMode,
}

enum SourceMode {
    Live {
        slot: Arc<FrameSlot>,
        health: Arc<AcquirerHealth>,
        acquirer: Option<BackgroundAcquirer>,
    },
    Local {
        backend: Option<Box<dyn CaptureBackend>>,
    },
}

impl FrameSource {
    /// Open `backend` and hand it to a background acquirer.
    pub fn live(mut backend: Box<dyn CaptureBackend>, policy: AcquirerPolicy) -> Result<Self> {
        let name = backend.describe();
        let info = open_backend(backend.as_mut())?;
        let slot = Arc::new(FrameSlot::new());
        let acquirer = BackgroundAcquirer::spawn(backend, Arc::clone(&slot), policy)?;
        Ok(Self {
            name,
            info,
            mode: SourceMode::Live {
                slot,
                health: acquirer.health(),
                acquirer: Some(acquirer),
            },
        })
    }

    /// Open `backend` for synchronous reads.
    pub fn local(mut backend: Box<dyn CaptureBackend>) -> Result<Self> {
        let name = backend.describe();
        let info = open_backend(backend.as_mut())?;
        Ok(Self {
            name,
            info,
            mode: SourceMode::Local {
                backend: Some(backend),
            },
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn info(&self) -> StreamInfo {
        self.info
    }

    pub fn kind(&self) -> SourceKind {
        match self.mode {
            SourceMode::Live { .. } => SourceKind::Live,
            SourceMode::Local { .. } => SourceKind::Local,
        }
    }

    /// Fetch the next frame.
    ///
    /// Live sources never block here; local sources block for one decode. An
    /// error from a live source means the acquirer gave up on the backend.
    pub fn read(&mut self) -> Result<SourceRead> {
        match &mut self.mode {
            SourceMode::Live { slot, health, .. } => {
                if let Some(frame) = slot.take() {
                    return Ok(SourceRead::Frame(frame));
                }
                if health.is_failed() {
                    return Err(health.failure());
                }
                Ok(SourceRead::Pending)
            }
            SourceMode::Local { backend } => {
                let Some(backend) = backend.as_mut() else {
                    bail!("source {} is closed", self.name);
                };
                Ok(match backend.read()? {
                    Some(frame) => SourceRead::Frame(frame),
                    None => SourceRead::EndOfStream,
                })
            }
        }
    }

    /// Slot counters for live sources.
    pub fn slot_stats(&self) -> Option<SlotStats> {
        match &self.mode {
            SourceMode::Live { slot, .. } => Some(slot.stats()),
            SourceMode::Local { .. } => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        match &self.mode {
            SourceMode::Live { acquirer, .. } => acquirer.is_none(),
            SourceMode::Local { backend } => backend.is_none(),
        }
    }

    /// Stop acquisition (joining the thread) and release the backend. Idempotent.
    pub fn close(&mut self) {
        let backend = match &mut self.mode {
            SourceMode::Live { acquirer, .. } => acquirer.take().and_then(|mut a| a.stop()),
            SourceMode::Local { backend } => backend.take(),
        };
        if let Some(mut backend) = backend {
            backend.close();
            log::info!("FrameSource: released {}", self.name);
        }
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.close();
    }
}

fn open_backend(backend: &mut dyn CaptureBackend) -> Result<StreamInfo> {
    let name = backend.describe();
    let info = backend
        .open()
        .map_err(|err| err.context(format!("video source {} is unavailable", name)))?;
    log::info!(
        "FrameSource: opened {} ({} @ {:.1} fps)",
        name,
        info.resolution,
        info.fps
    );
    Ok(info)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
