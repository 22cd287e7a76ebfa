//! Network stream backend.
//!
//! Decodes an RTSP H.264 feed with GStreamer into packed RGB frames. The reader
//! pipeline is tuned for latency over smoothness: zero jitter-buffer latency,
//! no clock sync at the sink and a one-buffer appsink that drops stale samples.

#[cfg(feature = "gstreamer-media")]
use anyhow::{anyhow, Context, Result};
#[cfg(feature = "gstreamer-media")]
use gstreamer::prelude::*;
#[cfg(feature = "gstreamer-media")]
use std::time::Duration;

#[cfg(feature = "gstreamer-media")]
use super::{CaptureBackend, StreamInfo};
#[cfg(feature = "gstreamer-media")]
use crate::frame::{Frame, PixelFormat, Resolution};

const DEFAULT_STREAM_WIDTH: u32 = 640;
const DEFAULT_STREAM_HEIGHT: u32 = 480;

/// Decode parameters for network streams.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamOptions {
    /// Width frames are scaled to inside the decode pipeline.
    pub width: u32,
    /// Height frames are scaled to inside the decode pipeline.
    pub height: u32,
    /// `rtspsrc` jitter-buffer latency in milliseconds.
    pub latency_ms: u32,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            width: DEFAULT_STREAM_WIDTH,
            height: DEFAULT_STREAM_HEIGHT,
            latency_ms: 0,
        }
    }
}

/// GStreamer launch description for reading `url`.
pub fn stream_pipeline_description(url: &str, options: &StreamOptions) -> String {
    format!(
        "rtspsrc location={} latency={} ! queue ! rtph264depay ! h264parse ! avdec_h264 ! \
         videoconvert ! videoscale ! video/x-raw,format=RGB,width={},height={} ! \
         appsink name=appsink sync=false max-buffers=1 drop=true",
        url, options.latency_ms, options.width, options.height
    )
}

// ----------------------------------------------------------------------------
// GStreamer backend
// ----------------------------------------------------------------------------

#[cfg(feature = "gstreamer-media")]
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Upper bound on one blocking read, which also bounds acquirer stop latency.
#[cfg(feature = "gstreamer-media")]
const FRAME_TIMEOUT: Duration = Duration::from_millis(500);

#[cfg(feature = "gstreamer-media")]
pub(crate) struct GstreamerStreamBackend {
    url: String,
    options: StreamOptions,
    pipeline: Option<gstreamer::Pipeline>,
    appsink: Option<gstreamer_app::AppSink>,
    /// Frame pulled while probing caps in `open`, returned by the first `read`.
    first_frame: Option<Frame>,
    last_error: Option<String>,
}

#[cfg(feature = "gstreamer-media")]
impl GstreamerStreamBackend {
    pub(crate) fn new(url: String, options: StreamOptions) -> Self {
        Self {
            url,
            options,
            pipeline: None,
            appsink: None,
            first_frame: None,
            last_error: None,
        }
    }

    fn poll_bus(&mut self) {
        let Some(bus) = self.pipeline.as_ref().and_then(|p| p.bus()) else {
            return;
        };
        while let Some(message) = bus.pop() {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    self.last_error = Some(format!(
                        "gstreamer error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    ));
                }
                MessageView::Eos(..) => {
                    self.last_error = Some("stream reached EOS".to_string());
                }
                _ => {}
            }
        }
    }
}

#[cfg(feature = "gstreamer-media")]
impl CaptureBackend for GstreamerStreamBackend {
    fn describe(&self) -> String {
        self.url.clone()
    }

    fn open(&mut self) -> Result<StreamInfo> {
        gstreamer::init().context("initialize gstreamer")?;

        let description = stream_pipeline_description(&self.url, &self.options);
        let pipeline = gstreamer::parse::launch(&description)
            .context("build stream pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow!("stream pipeline is not a Pipeline"))?;
        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow!("appsink element has unexpected type"))?;

        pipeline
            .set_state(gstreamer::State::Playing)
            .context("set stream pipeline to Playing")?;
        self.pipeline = Some(pipeline);

        // Pull one sample so the reported resolution and rate come from the
        // negotiated caps rather than the request.
        let sample = appsink
            .try_pull_sample(gstreamer::ClockTime::from_mseconds(
                CONNECT_TIMEOUT.as_millis() as u64,
            ))
            .ok_or_else(|| {
                self.poll_bus();
                match &self.last_error {
                    Some(err) => anyhow!("stream {} unreachable: {}", self.url, err),
                    None => anyhow!(
                        "stream {} produced no frames within {:?}",
                        self.url,
                        CONNECT_TIMEOUT
                    ),
                }
            })?;
        let (frame, fps) = sample_to_frame(&sample)?;
        let info = StreamInfo::new(frame.resolution(), fps);

        self.appsink = Some(appsink);
        self.first_frame = Some(frame);
        Ok(info)
    }

    fn read(&mut self) -> Result<Option<Frame>> {
        if let Some(frame) = self.first_frame.take() {
            return Ok(Some(frame));
        }
        self.poll_bus();
        if let Some(err) = &self.last_error {
            return Err(anyhow!("{}", err));
        }

        let appsink = self.appsink.as_ref().context("stream not open")?;
        match appsink.try_pull_sample(gstreamer::ClockTime::from_mseconds(
            FRAME_TIMEOUT.as_millis() as u64,
        )) {
            Some(sample) => sample_to_frame(&sample).map(|(frame, _)| Some(frame)),
            None if appsink.is_eos() => Ok(None),
            None => Err(anyhow!("stream stalled for {:?}", FRAME_TIMEOUT)),
        }
    }

    fn close(&mut self) {
        self.appsink = None;
        self.first_frame = None;
        if let Some(pipeline) = self.pipeline.take() {
            if let Err(err) = pipeline.set_state(gstreamer::State::Null) {
                log::warn!("StreamBackend: failed to stop {}: {}", self.url, err);
            }
        }
    }
}

#[cfg(feature = "gstreamer-media")]
fn sample_to_frame(sample: &gstreamer::Sample) -> Result<(Frame, f64)> {
    let buffer = sample.buffer().context("stream sample missing buffer")?;
    let caps = sample.caps().context("stream sample missing caps")?;
    let info =
        gstreamer_video::VideoInfo::from_caps(caps).context("parse stream caps as video info")?;

    let resolution = Resolution::new(info.width(), info.height());
    let fps = {
        let rate = info.fps();
        if rate.denom() == 0 {
            0.0
        } else {
            rate.numer() as f64 / rate.denom() as f64
        }
    };

    let row_bytes = (resolution.width as usize) * 3;
    let stride = info.stride()[0] as usize;
    let map = buffer.map_readable().context("map stream buffer")?;
    let data = map.as_slice();

    let pixels = if stride == row_bytes {
        data.get(..row_bytes * resolution.height as usize)
            .context("stream buffer is shorter than its caps")?
            .to_vec()
    } else {
        let mut pixels = Vec::with_capacity(row_bytes * resolution.height as usize);
        for row in 0..resolution.height as usize {
            let start = row * stride;
            pixels.extend_from_slice(
                data.get(start..start + row_bytes)
                    .context("stream buffer row is out of bounds")?,
            );
        }
        pixels
    };

    let frame = Frame::new(
        pixels,
        resolution.width,
        resolution.height,
        PixelFormat::Rgb24,
    )?;
    Ok((frame, fps))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_description_matches_low_latency_reader() {
        let description = stream_pipeline_description(
            "rtsp://10.0.0.5:8554/cam",
            &StreamOptions {
                width: 800,
                height: 600,
                latency_ms: 0,
            },
        );
        assert!(description.starts_with("rtspsrc location=rtsp://10.0.0.5:8554/cam latency=0 !"));
        assert!(description.contains("avdec_h264"));
        assert!(description.contains("video/x-raw,format=RGB,width=800,height=600"));
        assert!(description.ends_with("appsink name=appsink sync=false max-buffers=1 drop=true"));
    }

    #[test]
    fn default_options_decode_at_vga() {
        let options = StreamOptions::default();
        assert_eq!((options.width, options.height, options.latency_ms), (640, 480, 0));
    }
}
