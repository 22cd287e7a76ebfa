//! framepipe - acquire, transform and fan out video frames
//!
//! Reads one source (device, network stream or file), applies the selected
//! transform and writes the result to any of: a display window, a recording,
//! an RTSP retransmission. Stops at end of file, on Ctrl-C/SIGTERM, or when q is
//! pressed in the display window.

mod cli;

use clap::{Parser, ValueEnum};
use std::process::ExitCode;

use framepipe::{EdgeFilter, FrameTransform, Identity};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum TransformKind {
    /// Pass frames through unchanged.
    Identity,
    /// Canny edge map.
    Edges,
}

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    #[command(flatten)]
    pipeline: cli::PipelineArgs,
    /// Per-frame transform.
    #[arg(long, value_enum, default_value_t = TransformKind::Identity)]
    transform: TransformKind,
}

fn main() -> ExitCode {
    let args = Args::parse();
    let transform: Box<dyn FrameTransform> = match args.transform {
        TransformKind::Identity => Box::new(Identity),
        TransformKind::Edges => Box::new(EdgeFilter::default()),
    };
    cli::run(&args.pipeline, transform)
}
