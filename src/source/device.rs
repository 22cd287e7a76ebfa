//! Capture device backend (V4L2).
//!
//! Opens `/dev/video<N>`, asks for packed RGB and falls back to whatever the
//! driver negotiates (YUYV and NV12 are converted in software). Reads block on the
//! driver's mmap queue, which is why device sources always run on an acquirer.

use anyhow::{bail, Context, Result};
use ouroboros::self_referencing;

use super::normalize::{normalize_to_rgb, CaptureFormat};
use super::{CaptureBackend, StreamInfo};
use crate::frame::{Frame, PixelFormat, Resolution};

const PREFERRED_WIDTH: u32 = 640;
const PREFERRED_HEIGHT: u32 = 480;
const MMAP_BUFFERS: u32 = 4;

pub(crate) struct V4l2DeviceBackend {
    path: String,
    state: Option<DeviceState>,
    format: CaptureFormat,
    resolution: Resolution,
}

#[self_referencing]
struct DeviceState {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

impl V4l2DeviceBackend {
    pub(crate) fn new(index: u32) -> Self {
        Self {
            path: format!("/dev/video{}", index),
            state: None,
            format: CaptureFormat::Rgb24,
            resolution: Resolution::new(PREFERRED_WIDTH, PREFERRED_HEIGHT),
        }
    }
}

impl CaptureBackend for V4l2DeviceBackend {
    fn describe(&self) -> String {
        self.path.clone()
    }

    fn open(&mut self) -> Result<StreamInfo> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        let mut device = v4l::Device::with_path(&self.path)
            .with_context(|| format!("open v4l2 device {}", self.path))?;
        let mut format = device.format().context("read v4l2 format")?;
        format.width = PREFERRED_WIDTH;
        format.height = PREFERRED_HEIGHT;
        format.fourcc = v4l::FourCC::new(b"RGB3");

        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!("DeviceBackend: failed to set format on {}: {}", self.path, err);
                device
                    .format()
                    .context("read v4l2 format after set failure")?
            }
        };
        let Some(capture_format) = CaptureFormat::from_fourcc(&format.fourcc.repr) else {
            bail!(
                "{} negotiated unsupported pixel format {}",
                self.path,
                format.fourcc
            );
        };

        let fps = device
            .params()
            .ok()
            .map(|params| params.interval)
            .filter(|interval| interval.numerator > 0)
            .map(|interval| interval.denominator as f64 / interval.numerator as f64)
            .unwrap_or(0.0);

        let state = DeviceStateBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, MMAP_BUFFERS)
                    .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
            },
        }
        .try_build()?;

        self.state = Some(state);
        self.format = capture_format;
        self.resolution = Resolution::new(format.width, format.height);
        Ok(StreamInfo::new(self.resolution, fps))
    }

    fn read(&mut self) -> Result<Option<Frame>> {
        use v4l::io::traits::CaptureStream;

        let Resolution { width, height } = self.resolution;
        let format = self.format;
        let state = self.state.as_mut().context("v4l2 device not open")?;
        // The mmap buffer is only valid until the next dequeue; convert in place.
        let pixels = state.with_mut(|fields| -> Result<Vec<u8>> {
            let (buf, meta) = fields.stream.next().context("capture v4l2 frame")?;
            let used = match meta.bytesused as usize {
                0 => buf.len(),
                n => n.min(buf.len()),
            };
            normalize_to_rgb(&buf[..used], width, height, format)
        })?;
        Frame::new(pixels, width, height, PixelFormat::Rgb24).map(Some)
    }

    fn close(&mut self) {
        self.state = None;
    }
}
