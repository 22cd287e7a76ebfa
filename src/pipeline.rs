//! Pipeline controller.
//!
//! `Pipeline` owns one `FrameSource`, one `FrameTransform` and a `SinkSet` and runs
//! the acquire, scale, transform, fan-out loop until the cancellation token is set
//! or a local source reaches end of stream. Every exit path, including errors and
//! a pipeline dropped without running, goes through a single teardown that stops
//! the acquirer, releases the source and closes the sinks exactly once.

use anyhow::{bail, Context, Result};
use std::fmt;
use std::time::Duration;

use crate::cancel::CancellationToken;
use crate::config::Settings;
use crate::frame::{PixelFormat, Resolution};
use crate::sink::{OutputOptions, SinkSet};
use crate::source::{self, FrameSource, SourceDescriptor, SourceOptions, SourceRead};
use crate::transform::FrameTransform;

const DEFAULT_IDLE_WAIT: Duration = Duration::from_millis(2);

/// Per-run settings, fixed once the pipeline is built.
#[derive(Clone, Debug, PartialEq)]
pub struct PipelineConfig {
    /// Resize factor applied before the transform. 1.0 leaves frames untouched.
    pub scale: f64,
    pub outputs: OutputOptions,
    /// Pause after a live read found no new frame.
    pub idle_wait: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            scale: 1.0,
            outputs: OutputOptions::default(),
            idle_wait: DEFAULT_IDLE_WAIT,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.scale.is_finite() && self.scale > 0.0) {
            bail!("scale factor must be a positive number (got {})", self.scale);
        }
        Ok(())
    }

    /// Resolution frames have when they reach the transform and the sinks.
    pub fn output_resolution(&self, native: Resolution) -> Resolution {
        native.scaled(self.scale)
    }

    /// `output_resolution`, rejected when a frame of that size could not be held.
    pub fn resolve_output(&self, native: Resolution) -> Result<Resolution> {
        let output = self.output_resolution(native);
        output.byte_len(PixelFormat::Rgb24).with_context(|| {
            format!(
                "scale {} turns {} into an unusable output size {}",
                self.scale, native, output
            )
        })?;
        Ok(output)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineState {
    Running,
    Stopped,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    Cancelled,
    EndOfStream,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled => f.write_str("cancelled"),
            Self::EndOfStream => f.write_str("end of stream"),
        }
    }
}

/// What one `Pipeline::run` did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunSummary {
    pub frames_processed: u64,
    /// Live-source iterations that found no new frame.
    pub frames_skipped: u64,
    /// Live frames replaced in the slot before the controller took them.
    /// `None` for local sources.
    pub frames_dropped: Option<u64>,
    pub stop_reason: StopReason,
    /// Sinks disabled after a write failure.
    pub disabled_sinks: Vec<String>,
}

pub struct Pipeline {
    source: FrameSource,
    transform: Box<dyn FrameTransform>,
    sinks: SinkSet,
    cancel: CancellationToken,
    config: PipelineConfig,
    output: Resolution,
    state: PipelineState,
    torn_down: bool,
}

impl Pipeline {
    /// Assemble a pipeline from an already opened source and sink set.
    pub fn new(
        source: FrameSource,
        transform: Box<dyn FrameTransform>,
        sinks: SinkSet,
        cancel: CancellationToken,
        config: PipelineConfig,
    ) -> Result<Self> {
        config.validate()?;
        let native = source.info().resolution;
        let output = config.resolve_output(native)?;
        if output != native {
            log::info!("Pipeline: scaling {} -> {}", native, output);
        }
        Ok(Self {
            source,
            transform,
            sinks,
            cancel,
            config,
            output,
            state: PipelineState::Running,
            torn_down: false,
        })
    }

    /// Open the source for `descriptor`, then every sink in `config.outputs` at the
    /// resolved output geometry and the source frame rate.
    ///
    /// Fails if the source or any configured sink cannot be opened. Anything opened
    /// before the failure is released.
    pub fn open(
        descriptor: &SourceDescriptor,
        source_options: &SourceOptions,
        transform: Box<dyn FrameTransform>,
        cancel: CancellationToken,
        config: PipelineConfig,
    ) -> Result<Self> {
        config.validate()?;
        let source = source::open(descriptor, source_options)?;
        let info = source.info();
        let output = config.resolve_output(info.resolution)?;
        let sinks = SinkSet::open(&config.outputs, output, info.effective_fps())
            .context("open output sinks")?;
        Self::new(source, transform, sinks, cancel, config)
    }

    pub fn from_settings(
        settings: &Settings,
        transform: Box<dyn FrameTransform>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let descriptor = settings.source_descriptor()?;
        Self::open(
            &descriptor,
            &settings.source_options(),
            transform,
            cancel,
            settings.pipeline_config(),
        )
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn output_resolution(&self) -> Resolution {
        self.output
    }

    pub fn source(&self) -> &FrameSource {
        &self.source
    }

    /// Run until cancelled or end of stream, then tear down.
    ///
    /// A source failure (sustained acquirer errors, a failed local decode) stops
    /// the loop; teardown still runs before the error is returned.
    pub fn run(&mut self) -> Result<RunSummary> {
        if self.state == PipelineState::Stopped {
            bail!("pipeline has already stopped");
        }
        log::info!(
            "Pipeline: running {} -> {} with {} sink(s)",
            self.source.name(),
            self.output,
            self.sinks.len()
        );
        let result = self.run_loop();
        self.state = PipelineState::Stopped;
        self.teardown();

        match &result {
            Ok(summary) => log::info!(
                "Pipeline: stopped ({}) after {} frames",
                summary.stop_reason,
                summary.frames_processed
            ),
            Err(err) => log::error!("Pipeline: aborted: {:#}", err),
        }
        result
    }

    fn run_loop(&mut self) -> Result<RunSummary> {
        let scaling = self.config.scale != 1.0;
        let display = self.config.outputs.display;
        let mut processed = 0u64;
        let mut skipped = 0u64;

        let stop_reason = loop {
            if self.cancel.is_cancelled() {
                break StopReason::Cancelled;
            }

            let frame = match self
                .source
                .read()
                .with_context(|| format!("read from {}", self.source.name()))?
            {
                SourceRead::Frame(frame) => frame,
                SourceRead::EndOfStream => break StopReason::EndOfStream,
                SourceRead::Pending => {
                    skipped += 1;
                    if display {
                        self.poll_quit();
                    } else {
                        std::thread::sleep(self.config.idle_wait);
                    }
                    continue;
                }
            };

            let frame = if scaling && frame.resolution() != self.output {
                frame.resize(self.output).context("scale frame")?
            } else {
                frame
            };
            let processed_frame = self.transform.process(frame);
            self.sinks.write_all(&processed_frame);
            processed += 1;

            if display {
                self.poll_quit();
            }
        };

        Ok(RunSummary {
            frames_processed: processed,
            frames_skipped: skipped,
            frames_dropped: self.source.slot_stats().map(|stats| stats.overwritten),
            stop_reason,
            disabled_sinks: self.sinks.disabled().to_vec(),
        })
    }

    fn poll_quit(&mut self) {
        if self.sinks.poll_quit() && self.cancel.cancel() {
            log::info!("Pipeline: quit requested from display");
        }
    }

    /// Stop acquisition, release the source, close the sinks. Runs once.
    fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        self.source.close();
        self.sinks.close_all();
        log::debug!("Pipeline: teardown complete");
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.teardown();
    }
}
