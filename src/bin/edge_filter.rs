//! edge_filter - edge-detection video filter
//!
//! Runs the frame pipeline with an edge-map transform: grayscale, a 3x3 blur,
//! then Canny with thresholds 70/135. Source and output flags match `framepipe`.

mod cli;

use clap::Parser;
use std::process::ExitCode;

use framepipe::EdgeFilter;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    #[command(flatten)]
    pipeline: cli::PipelineArgs,
    /// Gradient magnitude below which a pixel is never an edge.
    #[arg(long, default_value_t = 70.0)]
    low: f32,
    /// Gradient magnitude at or above which a pixel is always an edge.
    #[arg(long, default_value_t = 135.0)]
    high: f32,
}

fn main() -> ExitCode {
    let args = Args::parse();
    if !(args.low >= 0.0 && args.low <= args.high) {
        eprintln!("error: --low must be between 0 and --high");
        return ExitCode::FAILURE;
    }
    let filter = EdgeFilter {
        low: args.low,
        high: args.high,
    };
    cli::run(&args.pipeline, Box::new(filter))
}
