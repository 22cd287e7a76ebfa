//! On-screen display sink.
//!
//! Frames are shown in an `autovideosink` window. The window's navigation events
//! are read back from the bus so a `q` key press (or closing the window) can
//! request shutdown.

use anyhow::Result;
use gstreamer::prelude::*;

use super::appsrc::AppSrcPipeline;
use super::FrameSink;
use crate::frame::{Frame, Resolution};

const DISPLAY_PIPELINE: &str = "appsrc name=src ! videoconvert ! autovideosink sync=false";
const QUIT_KEY: &str = "q";
/// Bounded UI wait per poll.
const POLL_WAIT_MS: u64 = 1;

pub struct DisplaySink {
    pipeline: AppSrcPipeline,
    quit_requested: bool,
}

impl DisplaySink {
    pub fn open(resolution: Resolution, fps: f64) -> Result<Self> {
        let pipeline = AppSrcPipeline::launch("display", DISPLAY_PIPELINE, resolution, fps)?;
        log::debug!("DisplaySink: window opened at {}", resolution);
        Ok(Self {
            pipeline,
            quit_requested: false,
        })
    }

    fn inspect(&mut self, message: &gstreamer::Message) {
        use gstreamer::MessageView;

        match message.view() {
            MessageView::Element(element) => {
                if element
                    .structure()
                    .is_some_and(|s| is_quit_key_press(s))
                {
                    log::info!("DisplaySink: quit key pressed");
                    self.quit_requested = true;
                }
            }
            MessageView::Error(err) => {
                log::warn!("DisplaySink: window error: {}", err.error());
                self.quit_requested = true;
            }
            MessageView::Eos(_) => self.quit_requested = true,
            _ => {}
        }
    }
}

fn is_quit_key_press(structure: &gstreamer::StructureRef) -> bool {
    if !structure.has_name("GstNavigationMessage") {
        return false;
    }
    let Ok(event) = structure.get::<gstreamer::Event>("event") else {
        return false;
    };
    let Some(fields) = event.structure() else {
        return false;
    };
    fields.get::<&str>("event").ok() == Some("key-press")
        && fields.get::<&str>("key").ok() == Some(QUIT_KEY)
}

impl FrameSink for DisplaySink {
    fn name(&self) -> &str {
        "display"
    }

    fn write(&mut self, frame: &Frame) -> Result<()> {
        self.pipeline.push(frame)
    }

    fn poll_quit(&mut self) -> bool {
        if self.quit_requested {
            return true;
        }
        let Some(bus) = self.pipeline.bus() else {
            return false;
        };
        let types = [
            gstreamer::MessageType::Element,
            gstreamer::MessageType::Error,
            gstreamer::MessageType::Eos,
        ];
        let mut next =
            bus.timed_pop_filtered(gstreamer::ClockTime::from_mseconds(POLL_WAIT_MS), &types);
        while let Some(message) = next {
            self.inspect(&message);
            next = bus.pop_filtered(&types);
        }
        self.quit_requested
    }

    fn close(&mut self) -> Result<()> {
        self.pipeline.finish(false)
    }
}
