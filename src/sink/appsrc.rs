//! GStreamer pipelines fed from an `appsrc`.
//!
//! Shared by the display, encoded-recording and retransmission sinks. The caller
//! supplies a launch description containing `appsrc name=src`; this type fixes the
//! source caps to packed RGB at the output geometry and timestamps every pushed
//! frame from the nominal frame rate.

use anyhow::{anyhow, Context, Result};
use gstreamer::prelude::*;
use std::time::Duration;

use super::fps_rational;
use crate::frame::{Frame, PixelFormat, Resolution};

const EOS_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) struct AppSrcPipeline {
    label: String,
    pipeline: gstreamer::Pipeline,
    appsrc: gstreamer_app::AppSrc,
    resolution: Resolution,
    frame_duration: gstreamer::ClockTime,
    frames: u64,
    finished: bool,
}

impl AppSrcPipeline {
    /// Parse `description`, configure its `src` element and set it playing.
    pub(crate) fn launch(
        label: &str,
        description: &str,
        resolution: Resolution,
        fps: f64,
    ) -> Result<Self> {
        gstreamer::init().context("initialize gstreamer")?;

        let pipeline = gstreamer::parse::launch(description)
            .with_context(|| format!("build {} pipeline", label))?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow!("{} pipeline is not a Pipeline", label))?;
        let appsrc = pipeline
            .by_name("src")
            .with_context(|| format!("appsrc element missing from {} pipeline", label))?
            .downcast::<gstreamer_app::AppSrc>()
            .map_err(|_| anyhow!("{} src element has unexpected type", label))?;

        let (num, den) = match fps_rational(fps) {
            (0, _) => fps_rational(crate::source::FALLBACK_FPS),
            rate => rate,
        };
        let caps = gstreamer::Caps::builder("video/x-raw")
            .field("format", "RGB")
            .field("width", resolution.width as i32)
            .field("height", resolution.height as i32)
            .field("framerate", gstreamer::Fraction::new(num, den))
            .build();
        appsrc.set_caps(Some(&caps));
        appsrc.set_format(gstreamer::Format::Time);
        appsrc.set_is_live(true);

        pipeline
            .set_state(gstreamer::State::Playing)
            .with_context(|| format!("start {} pipeline", label))?;

        let frame_duration =
            gstreamer::ClockTime::from_nseconds(1_000_000_000u64 * den as u64 / num.max(1) as u64);

        Ok(Self {
            label: label.to_string(),
            pipeline,
            appsrc,
            resolution,
            frame_duration,
            frames: 0,
            finished: false,
        })
    }

    pub(crate) fn bus(&self) -> Option<gstreamer::Bus> {
        self.pipeline.bus()
    }

    /// Surface any error the pipeline posted since the last push.
    fn check_bus(&self) -> Result<()> {
        let Some(bus) = self.bus() else {
            return Ok(());
        };
        while let Some(message) = bus.pop_filtered(&[gstreamer::MessageType::Error]) {
            if let gstreamer::MessageView::Error(err) = message.view() {
                return Err(anyhow!(
                    "{} pipeline error from {:?}: {}",
                    self.label,
                    err.src().map(|s| s.path_string()),
                    err.error()
                ));
            }
        }
        Ok(())
    }

    pub(crate) fn push(&mut self, frame: &Frame) -> Result<()> {
        if frame.format() != PixelFormat::Rgb24 || frame.resolution() != self.resolution {
            return Err(anyhow!(
                "{} expects RGB {} frames, got {:?} {}",
                self.label,
                self.resolution,
                frame.format(),
                frame.resolution()
            ));
        }
        self.check_bus()?;

        let mut buffer = gstreamer::Buffer::from_mut_slice(frame.data().to_vec());
        {
            let buffer = buffer
                .get_mut()
                .context("new gstreamer buffer is not writable")?;
            buffer.set_pts(self.frame_duration * self.frames);
            buffer.set_duration(self.frame_duration);
        }
        self.appsrc
            .push_buffer(buffer)
            .map_err(|flow| anyhow!("{} rejected frame: {:?}", self.label, flow))?;
        self.frames += 1;
        Ok(())
    }

    /// Send EOS, optionally wait for it to drain through, then stop the pipeline.
    pub(crate) fn finish(&mut self, wait_for_eos: bool) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;

        let mut result = Ok(());
        if let Err(flow) = self.appsrc.end_of_stream() {
            result = Err(anyhow!("{} failed to send EOS: {:?}", self.label, flow));
        } else if wait_for_eos {
            if let Some(bus) = self.bus() {
                let timeout = gstreamer::ClockTime::from_mseconds(EOS_TIMEOUT.as_millis() as u64);
                match bus.timed_pop_filtered(
                    timeout,
                    &[gstreamer::MessageType::Eos, gstreamer::MessageType::Error],
                ) {
                    Some(message) => {
                        if let gstreamer::MessageView::Error(err) = message.view() {
                            result = Err(anyhow!(
                                "{} pipeline error while finishing: {}",
                                self.label,
                                err.error()
                            ));
                        }
                    }
                    None => log::warn!(
                        "{}: EOS did not drain within {:?}; output may be truncated",
                        self.label,
                        EOS_TIMEOUT
                    ),
                }
            }
        }

        if let Err(err) = self.pipeline.set_state(gstreamer::State::Null) {
            log::warn!("{}: failed to stop pipeline: {}", self.label, err);
        }
        log::debug!("{}: finished after {} frames", self.label, self.frames);
        result
    }
}

impl Drop for AppSrcPipeline {
    fn drop(&mut self) {
        let _ = self.finish(false);
    }
}
