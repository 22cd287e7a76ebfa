//! Command-line plumbing shared by the pipeline binaries.

use anyhow::Result;
use std::path::PathBuf;
use std::process::ExitCode;

use framepipe::{CancellationToken, FrameTransform, Pipeline, RunSummary, Settings};

/// Source, output and processing flags. Each one overrides the config file and
/// the `FRAMEPIPE_*` environment.
#[derive(clap::Args, Debug)]
pub struct PipelineArgs {
    /// Config file (JSON, or TOML with a .toml extension).
    #[arg(long, env = "FRAMEPIPE_CONFIG")]
    pub config: Option<PathBuf>,
    /// Capture device index (/dev/video<N>).
    #[arg(long)]
    pub camera: Option<u32>,
    /// Network stream URL (rtsp://...). Takes priority over --camera.
    #[arg(long)]
    pub stream: Option<String>,
    /// Local video file. Takes priority over --stream and --camera.
    #[arg(long)]
    pub file: Option<PathBuf>,
    /// Retransmit processed video to this RTSP location or stream name.
    #[arg(long)]
    pub location: Option<String>,
    /// Record processed video to this file (.y4m, .mp4, .mkv).
    #[arg(long)]
    pub output: Option<PathBuf>,
    /// Show processed video in a window. Press q in the window to stop.
    #[arg(long)]
    pub display: bool,
    /// Resize factor applied before processing.
    #[arg(long)]
    pub scale: Option<f64>,
    /// Log filter (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,
}

impl PipelineArgs {
    pub fn settings(&self) -> Result<Settings> {
        let mut settings = Settings::load_from(self.config.as_deref())?;
        if let Some(index) = self.camera {
            settings.source.device = Some(index);
        }
        if let Some(url) = &self.stream {
            settings.source.stream = Some(url.clone());
        }
        if let Some(path) = &self.file {
            settings.source.file = Some(path.clone());
        }
        if let Some(location) = &self.location {
            settings.outputs.retransmit_location = Some(location.clone());
        }
        if let Some(path) = &self.output {
            settings.outputs.record_path = Some(path.clone());
        }
        if self.display {
            settings.outputs.display = true;
        }
        if let Some(scale) = self.scale {
            settings.scale = scale;
        }
        if let Some(level) = &self.log_level {
            settings.log_level = level.clone();
        }
        settings.validate()?;
        Ok(settings)
    }
}

/// Load settings, start logging, run one pipeline and map the outcome to an exit code.
pub fn run(args: &PipelineArgs, transform: Box<dyn FrameTransform>) -> ExitCode {
    let settings = match args.settings() {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("error: {:#}", err);
            return ExitCode::FAILURE;
        }
    };
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(settings.log_level.as_str()),
    )
    .init();

    match run_pipeline(&settings, transform) {
        Ok(summary) => {
            log::info!(
                "processed {} frames ({} idle polls), stopped: {}",
                summary.frames_processed,
                summary.frames_skipped,
                summary.stop_reason
            );
            if let Some(dropped) = summary.frames_dropped {
                log::info!("{} live frames replaced before processing", dropped);
            }
            if !summary.disabled_sinks.is_empty() {
                log::warn!("sinks disabled during run: {}", summary.disabled_sinks.join(", "));
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            log::error!("{:#}", err);
            ExitCode::FAILURE
        }
    }
}

fn run_pipeline(settings: &Settings, transform: Box<dyn FrameTransform>) -> Result<RunSummary> {
    let cancel = CancellationToken::new();
    cancel.install_signal_handler()?;
    let mut pipeline = Pipeline::from_settings(settings, transform, cancel)?;
    pipeline.run()
}
