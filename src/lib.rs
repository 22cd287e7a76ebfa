//! Real-time video frame pipeline.
//!
//! Frames are acquired from one source (capture device, network stream or local
//! file), optionally scaled, passed through a pluggable transform and fanned out
//! to any combination of sinks (display window, recording, RTSP retransmission).
//!
//! # Architecture
//!
//! - Live sources run their decoder on a `BackgroundAcquirer` thread that keeps
//!   overwriting a single-slot `FrameSlot`; the controller always takes the newest
//!   frame and never waits on the acquirer.
//! - Local sources are read synchronously, one decode per loop iteration, and end
//!   the run at end of stream.
//! - `Pipeline::run` polls a `CancellationToken` once per iteration and funnels every
//!   exit path through one teardown.
//!
//! # Module Structure
//!
//! - `frame`: Frame buffers, resolution, resize and channel conversion
//! - `cancel`: Cooperative cancellation and signal registration
//! - `slot`, `acquire`: Latest-wins holder and the acquisition thread
//! - `source`: Source selection and capture backends
//! - `transform`: Per-frame transforms (identity, edge map)
//! - `sink`: Display, recording and retransmission sinks
//! - `pipeline`: The controller loop and teardown
//! - `config`: File and environment settings

pub mod acquire;
pub mod cancel;
pub mod config;
pub mod frame;
pub mod pipeline;
pub mod sink;
pub mod slot;
pub mod source;
pub mod transform;

pub use acquire::{AcquirerHealth, AcquirerPolicy, BackgroundAcquirer};
pub use cancel::CancellationToken;
pub use config::Settings;
pub use frame::{Frame, PixelFormat, Resolution};
pub use pipeline::{Pipeline, PipelineConfig, PipelineState, RunSummary, StopReason};
pub use sink::{FrameSink, OutputOptions, SinkSet};
pub use slot::FrameSlot;
pub use source::{
    CaptureBackend, FrameSource, SourceDescriptor, SourceKind, SourceOptions, SourceRead,
    StreamInfo,
};
pub use transform::{EdgeFilter, FrameTransform, Identity};
