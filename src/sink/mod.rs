//! Frame sinks.
//!
//! A sink consumes processed frames: on-screen display, local recording, or network
//! retransmission. Every sink is optional and independent. `SinkSet` owns the
//! enabled sinks for one pipeline run and applies one failure policy to all of
//! them: a sink whose `write` fails is logged, closed and skipped for the rest of
//! the run, while the remaining sinks keep receiving frames.

#[cfg(feature = "gstreamer-media")]
mod appsrc;
#[cfg(feature = "gstreamer-media")]
pub mod display;
pub mod record;
pub mod retransmit;

use anyhow::Result;
#[cfg(not(feature = "gstreamer-media"))]
use anyhow::bail;
use std::path::PathBuf;

use crate::frame::{Frame, PixelFormat, Resolution};

#[cfg(feature = "gstreamer-media")]
pub use display::DisplaySink;
pub use record::{RecordCodec, RecordingSink};
#[cfg(feature = "gstreamer-media")]
pub use retransmit::RetransmitSink;
pub use retransmit::{resolve_location, retransmit_pipeline_description};

pub trait FrameSink: Send {
    fn name(&self) -> &str;

    /// Whether the sink only accepts packed RGB. Single-channel frames are
    /// expanded before reaching such sinks.
    fn requires_rgb(&self) -> bool {
        true
    }

    fn write(&mut self, frame: &Frame) -> Result<()>;

    /// Bounded check for an interactive quit request. Only display sinks have one.
    fn poll_quit(&mut self) -> bool {
        false
    }

    /// Flush and release the underlying writer. Called at most once by `SinkSet`.
    fn close(&mut self) -> Result<()>;
}

/// Which sinks to open and where they write.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct OutputOptions {
    pub display: bool,
    pub record_path: Option<PathBuf>,
    pub retransmit_location: Option<String>,
}

impl OutputOptions {
    pub fn any(&self) -> bool {
        self.display || self.record_path.is_some() || self.retransmit_location.is_some()
    }
}

/// Convert a frame rate to a `numerator/denominator` pair for encoders.
pub fn fps_rational(fps: f64) -> (i32, i32) {
    if !(fps.is_finite() && fps > 0.0) {
        return (0, 1);
    }
    if (fps - fps.round()).abs() < 1e-3 {
        return (fps.round() as i32, 1);
    }
    ((fps * 1000.0).round() as i32, 1000)
}

// ----------------------------------------------------------------------------
// SinkSet
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SinkState {
    Active,
    Disabled,
    Closed,
}

struct SinkEntry {
    sink: Box<dyn FrameSink>,
    state: SinkState,
}

#[derive(Default)]
pub struct SinkSet {
    entries: Vec<SinkEntry>,
    disabled: Vec<String>,
}

impl SinkSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open every sink named in `outputs` at the given output geometry.
    ///
    /// Fails on the first sink that cannot be opened; sinks opened before it are
    /// closed again when the partial set is dropped.
    pub fn open(outputs: &OutputOptions, resolution: Resolution, fps: f64) -> Result<Self> {
        let mut sinks = Self::new();

        if outputs.display {
            #[cfg(feature = "gstreamer-media")]
            sinks.push(DisplaySink::open(resolution, fps)?);
            #[cfg(not(feature = "gstreamer-media"))]
            bail!("display output requires the gstreamer-media feature");
        }

        if let Some(location) = &outputs.retransmit_location {
            #[cfg(feature = "gstreamer-media")]
            {
                let sink = RetransmitSink::connect(location, resolution, fps)?;
                log::info!("retransmitting video at: {}", sink.location());
                sinks.push(sink);
            }
            #[cfg(not(feature = "gstreamer-media"))]
            bail!(
                "retransmission to {} requires the gstreamer-media feature",
                location
            );
        }

        if let Some(path) = &outputs.record_path {
            let sink = RecordingSink::create(path, resolution, fps)?;
            log::info!("processed video saved at: {}", path.display());
            sinks.push(sink);
        }

        Ok(sinks)
    }

    pub fn push(&mut self, sink: impl FrameSink + 'static) {
        self.push_boxed(Box::new(sink));
    }

    pub fn push_boxed(&mut self, sink: Box<dyn FrameSink>) {
        self.entries.push(SinkEntry {
            sink,
            state: SinkState::Active,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.state == SinkState::Active)
            .count()
    }

    /// Names of sinks disabled after a write failure, in failure order.
    pub fn disabled(&self) -> &[String] {
        &self.disabled
    }

    /// Hand `frame` to every active sink.
    pub fn write_all(&mut self, frame: &Frame) {
        let needs_rgb = frame.format() != PixelFormat::Rgb24
            && self
                .entries
                .iter()
                .any(|e| e.state == SinkState::Active && e.sink.requires_rgb());
        let rgb = needs_rgb.then(|| frame.clone().into_rgb());

        for entry in self.entries.iter_mut() {
            if entry.state != SinkState::Active {
                continue;
            }
            let input = match &rgb {
                Some(rgb) if entry.sink.requires_rgb() => rgb,
                _ => frame,
            };
            if let Err(err) = entry.sink.write(input) {
                log::warn!(
                    "SinkSet: disabling {} after write failure: {:#}",
                    entry.sink.name(),
                    err
                );
                if let Err(err) = entry.sink.close() {
                    log::warn!("SinkSet: closing {} failed: {:#}", entry.sink.name(), err);
                }
                entry.state = SinkState::Disabled;
                self.disabled.push(entry.sink.name().to_string());
            }
        }
    }

    /// True when any active sink reports an interactive quit request.
    pub fn poll_quit(&mut self) -> bool {
        let mut quit = false;
        for entry in self.entries.iter_mut() {
            if entry.state == SinkState::Active && entry.sink.poll_quit() {
                quit = true;
            }
        }
        quit
    }

    /// Close every sink that is still open, in reverse open order. Safe to call
    /// repeatedly.
    pub fn close_all(&mut self) {
        for entry in self.entries.iter_mut().rev() {
            if entry.state != SinkState::Active {
                continue;
            }
            entry.state = SinkState::Closed;
            match entry.sink.close() {
                Ok(()) => log::debug!("SinkSet: closed {}", entry.sink.name()),
                Err(err) => log::warn!("SinkSet: closing {} failed: {:#}", entry.sink.name(), err),
            }
        }
    }
}

impl Drop for SinkSet {
    fn drop(&mut self) {
        self.close_all();
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Calls {
        writes: AtomicUsize,
        closes: AtomicUsize,
        formats: Mutex<Vec<PixelFormat>>,
    }

    struct TallySink {
        name: String,
        rgb_only: bool,
        fail_on_write: Option<usize>,
        calls: Arc<Calls>,
    }

    impl TallySink {
        fn new(name: &str) -> (Self, Arc<Calls>) {
            let calls = Arc::new(Calls::default());
            let sink = Self {
                name: name.to_string(),
                rgb_only: true,
                fail_on_write: None,
                calls: Arc::clone(&calls),
            };
            (sink, calls)
        }
    }

    impl FrameSink for TallySink {
        fn name(&self) -> &str {
            &self.name
        }

        fn requires_rgb(&self) -> bool {
            self.rgb_only
        }

        fn write(&mut self, frame: &Frame) -> Result<()> {
            let n = self.calls.writes.fetch_add(1, Ordering::SeqCst) + 1;
            self.calls.formats.lock().unwrap().push(frame.format());
            if self.fail_on_write == Some(n) {
                return Err(anyhow!("disk full"));
            }
            Ok(())
        }

        fn close(&mut self) -> Result<()> {
            self.calls.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn gray_frame() -> Frame {
        Frame::new(vec![9u8; 4], 2, 2, PixelFormat::Gray8).unwrap()
    }

    #[test]
    fn failing_sink_is_disabled_and_others_continue() {
        let (mut bad, bad_calls) = TallySink::new("record");
        bad.fail_on_write = Some(2);
        let (good, good_calls) = TallySink::new("retransmit");

        let mut sinks = SinkSet::new();
        sinks.push(bad);
        sinks.push(good);

        for _ in 0..5 {
            sinks.write_all(&gray_frame());
        }

        assert_eq!(bad_calls.writes.load(Ordering::SeqCst), 2);
        assert_eq!(bad_calls.closes.load(Ordering::SeqCst), 1);
        assert_eq!(good_calls.writes.load(Ordering::SeqCst), 5);
        assert_eq!(sinks.disabled(), &["record".to_string()]);
        assert_eq!(sinks.active_count(), 1);

        sinks.close_all();
        sinks.close_all();
        assert_eq!(bad_calls.closes.load(Ordering::SeqCst), 1);
        assert_eq!(good_calls.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn gray_frames_are_expanded_only_for_rgb_sinks() {
        let (rgb_sink, rgb_calls) = TallySink::new("record");
        let (mut raw_sink, raw_calls) = TallySink::new("raw");
        raw_sink.rgb_only = false;

        let mut sinks = SinkSet::new();
        sinks.push(rgb_sink);
        sinks.push(raw_sink);
        sinks.write_all(&gray_frame());

        assert_eq!(*rgb_calls.formats.lock().unwrap(), vec![PixelFormat::Rgb24]);
        assert_eq!(*raw_calls.formats.lock().unwrap(), vec![PixelFormat::Gray8]);
    }

    #[test]
    fn dropping_set_closes_sinks_once() {
        let (sink, calls) = TallySink::new("record");
        let mut sinks = SinkSet::new();
        sinks.push(sink);
        sinks.close_all();
        drop(sinks);
        assert_eq!(calls.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn empty_set_accepts_frames() {
        let mut sinks = SinkSet::open(
            &OutputOptions::default(),
            Resolution::new(2, 2),
            30.0,
        )
        .unwrap();
        assert!(sinks.is_empty());
        sinks.write_all(&gray_frame());
        assert!(!sinks.poll_quit());
    }

    #[test]
    fn fps_rational_handles_fractional_rates() {
        assert_eq!(fps_rational(30.0), (30, 1));
        assert_eq!(fps_rational(29.97), (29970, 1000));
        assert_eq!(fps_rational(0.0), (0, 1));
        assert_eq!(fps_rational(f64::NAN), (0, 1));
    }
}
