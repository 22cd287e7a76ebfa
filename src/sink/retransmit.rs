//! Network retransmission sink.
//!
//! Processed frames are re-encoded with a fixed low-latency H.264 setup and
//! published to an RTSP server through `rtspclientsink`.

#[cfg(feature = "gstreamer-media")]
use anyhow::Result;

#[cfg(feature = "gstreamer-media")]
use super::appsrc::AppSrcPipeline;
#[cfg(feature = "gstreamer-media")]
use super::FrameSink;
#[cfg(feature = "gstreamer-media")]
use crate::frame::{Frame, Resolution};

const DEFAULT_RTSP_SERVER: &str = "rtsp://localhost:8554";

/// Expand a bare stream name to a path on the local RTSP server.
///
/// Anything that already carries a scheme is returned unchanged.
pub fn resolve_location(location: &str) -> String {
    let location = location.trim();
    if location.contains("://") {
        return location.to_string();
    }
    format!(
        "{}/{}",
        DEFAULT_RTSP_SERVER,
        location.trim_start_matches('/')
    )
}

pub fn retransmit_pipeline_description(location: &str) -> String {
    format!(
        "appsrc name=src ! videoconvert ! x264enc speed-preset=ultrafast tune=zerolatency ! \
         video/x-h264,profile=high ! rtspclientsink location={}",
        location
    )
}

#[cfg(feature = "gstreamer-media")]
pub struct RetransmitSink {
    name: String,
    location: String,
    pipeline: AppSrcPipeline,
}

#[cfg(feature = "gstreamer-media")]
impl RetransmitSink {
    pub fn connect(location: &str, resolution: Resolution, fps: f64) -> Result<Self> {
        let location = resolve_location(location);
        let description = retransmit_pipeline_description(&location);
        let pipeline = AppSrcPipeline::launch("retransmission", &description, resolution, fps)?;
        Ok(Self {
            name: format!("retransmit:{}", location),
            location,
            pipeline,
        })
    }

    pub fn location(&self) -> &str {
        &self.location
    }
}

#[cfg(feature = "gstreamer-media")]
impl FrameSink for RetransmitSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn write(&mut self, frame: &Frame) -> Result<()> {
        self.pipeline.push(frame)
    }

    fn close(&mut self) -> Result<()> {
        // A live RTSP publish has nothing to flush; don't wait on the server.
        self.pipeline.finish(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_names_go_to_local_server() {
        assert_eq!(resolve_location("edges"), "rtsp://localhost:8554/edges");
        assert_eq!(resolve_location("/edges"), "rtsp://localhost:8554/edges");
        assert_eq!(
            resolve_location("rtsp://cam.local:8554/out"),
            "rtsp://cam.local:8554/out"
        );
    }

    #[test]
    fn pipeline_uses_zero_latency_encode() {
        let desc = retransmit_pipeline_description("rtsp://localhost:8554/out");
        assert!(desc.starts_with("appsrc name=src ! videoconvert ! x264enc"));
        assert!(desc.contains("speed-preset=ultrafast tune=zerolatency"));
        assert!(desc.ends_with("rtspclientsink location=rtsp://localhost:8554/out"));
    }
}
