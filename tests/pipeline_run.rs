use anyhow::{anyhow, Result};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use framepipe::{
    AcquirerPolicy, CancellationToken, CaptureBackend, Frame, FrameSink, FrameSource,
    Identity, OutputOptions, Pipeline, PipelineConfig, Resolution, Settings, SinkSet,
    SourceDescriptor, SourceOptions, StopReason, StreamInfo,
};

fn stub_file(spec: &str) -> SourceDescriptor {
    SourceDescriptor::File(PathBuf::from(format!("stub://{}", spec)))
}

fn counting_transform(calls: &Arc<AtomicUsize>) -> Box<dyn framepipe::FrameTransform> {
    let calls = Arc::clone(calls);
    Box::new(move |frame: Frame| {
        calls.fetch_add(1, Ordering::SeqCst);
        frame
    })
}

/// Live backend that blocks for `block` on every read and never yields a frame.
struct SilentBackend {
    block: Duration,
    reads: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
}

impl CaptureBackend for SilentBackend {
    fn describe(&self) -> String {
        "silent".to_string()
    }

    fn open(&mut self) -> Result<StreamInfo> {
        Ok(StreamInfo::new(Resolution::new(32, 24), 25.0))
    }

    fn read(&mut self) -> Result<Option<Frame>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        thread::sleep(self.block);
        Err(anyhow!("no signal"))
    }

    fn close(&mut self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct SinkCalls {
    writes: AtomicUsize,
    closes: AtomicUsize,
    sizes: Mutex<Vec<Resolution>>,
}

struct CountingSink {
    name: &'static str,
    fail_after: Option<usize>,
    calls: Arc<SinkCalls>,
}

impl FrameSink for CountingSink {
    fn name(&self) -> &str {
        self.name
    }

    fn write(&mut self, frame: &Frame) -> Result<()> {
        let n = self.calls.writes.fetch_add(1, Ordering::SeqCst) + 1;
        self.calls.sizes.lock().unwrap().push(frame.resolution());
        if self.fail_after.is_some_and(|limit| n > limit) {
            return Err(anyhow!("connection reset"));
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.calls.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[test]
fn local_file_with_ten_frames_processes_exactly_ten() -> Result<()> {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut pipeline = Pipeline::open(
        &stub_file("clip?size=64x48"),
        &SourceOptions::default(),
        counting_transform(&calls),
        CancellationToken::new(),
        PipelineConfig::default(),
    )?;

    let summary = pipeline.run()?;
    assert_eq!(summary.frames_processed, 10);
    assert_eq!(summary.stop_reason, StopReason::EndOfStream);
    assert!(summary.disabled_sinks.is_empty());
    assert_eq!(calls.load(Ordering::SeqCst), 10);
    assert!(pipeline.source().is_closed());
    Ok(())
}

#[test]
fn silent_live_source_exits_cleanly_on_cancel() -> Result<()> {
    let reads = Arc::new(AtomicUsize::new(0));
    let closes = Arc::new(AtomicUsize::new(0));
    let backend = SilentBackend {
        block: Duration::from_millis(5),
        reads: Arc::clone(&reads),
        closes: Arc::clone(&closes),
    };
    let policy = AcquirerPolicy {
        max_consecutive_failures: u32::MAX,
        retry_backoff: Duration::from_millis(1),
    };
    let source = FrameSource::live(Box::new(backend), policy)?;

    let cancel = CancellationToken::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let mut pipeline = Pipeline::new(
        source,
        counting_transform(&calls),
        SinkSet::new(),
        cancel.clone(),
        PipelineConfig::default(),
    )?;

    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(60));
        cancel.cancel();
    });
    let summary = pipeline.run()?;
    canceller.join().unwrap();

    assert_eq!(summary.stop_reason, StopReason::Cancelled);
    assert_eq!(summary.frames_processed, 0);
    assert!(summary.frames_skipped > 0);
    assert_eq!(summary.frames_dropped, Some(0));
    assert_eq!(calls.load(Ordering::SeqCst), 0, "transform never invoked");
    assert!(reads.load(Ordering::SeqCst) > 0);
    assert!(pipeline.source().is_closed());
    assert_eq!(closes.load(Ordering::SeqCst), 1, "acquirer released the backend");
    Ok(())
}

#[test]
fn cancel_waits_for_an_in_flight_live_read() -> Result<()> {
    let block = Duration::from_millis(300);
    let reads = Arc::new(AtomicUsize::new(0));
    let closes = Arc::new(AtomicUsize::new(0));
    let backend = SilentBackend {
        block,
        reads: Arc::clone(&reads),
        closes: Arc::clone(&closes),
    };
    let start = Instant::now();
    let source = FrameSource::live(Box::new(backend), AcquirerPolicy::default())?;

    let cancel = CancellationToken::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let mut pipeline = Pipeline::new(
        source,
        counting_transform(&calls),
        SinkSet::new(),
        cancel.clone(),
        PipelineConfig::default(),
    )?;

    let started = Arc::clone(&reads);
    let canceller = thread::spawn(move || {
        while started.load(Ordering::SeqCst) == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        thread::sleep(Duration::from_millis(40));
        cancel.cancel();
    });
    let summary = pipeline.run()?;
    canceller.join().unwrap();

    assert_eq!(summary.stop_reason, StopReason::Cancelled);
    assert_eq!(summary.frames_processed, 0);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(start.elapsed() >= block, "teardown joined before the read returned");
    assert_eq!(reads.load(Ordering::SeqCst), 1, "no read after stop");
    assert_eq!(closes.load(Ordering::SeqCst), 1);
    assert!(pipeline.source().is_closed());
    Ok(())
}

#[test]
fn sustained_acquirer_failure_tears_down_then_errors() -> Result<()> {
    let closes = Arc::new(AtomicUsize::new(0));
    let backend = SilentBackend {
        block: Duration::from_millis(5),
        reads: Arc::new(AtomicUsize::new(0)),
        closes: Arc::clone(&closes),
    };
    let policy = AcquirerPolicy {
        max_consecutive_failures: 3,
        retry_backoff: Duration::from_millis(1),
    };
    let sink_calls = Arc::new(SinkCalls::default());
    let mut sinks = SinkSet::new();
    sinks.push(CountingSink {
        name: "record",
        fail_after: None,
        calls: Arc::clone(&sink_calls),
    });

    let mut pipeline = Pipeline::new(
        FrameSource::live(Box::new(backend), policy)?,
        Box::new(Identity),
        sinks,
        CancellationToken::new(),
        PipelineConfig::default(),
    )?;

    let err = pipeline.run().unwrap_err();
    assert!(format!("{:#}", err).contains("no signal"));
    assert!(pipeline.source().is_closed());
    assert_eq!(closes.load(Ordering::SeqCst), 1);
    assert_eq!(sink_calls.closes.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn cancel_during_iteration_stops_before_next_frame() -> Result<()> {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&seen);
    let transform = move |frame: Frame| {
        if counter.fetch_add(1, Ordering::SeqCst) + 1 == 5 {
            token.cancel();
        }
        frame
    };

    let mut pipeline = Pipeline::open(
        &SourceDescriptor::Stream("stub://cam?size=32x24&fps=200".to_string()),
        &SourceOptions::default(),
        Box::new(transform),
        cancel,
        PipelineConfig::default(),
    )?;
    let summary = pipeline.run()?;

    assert_eq!(summary.stop_reason, StopReason::Cancelled);
    assert_eq!(summary.frames_processed, 5);
    assert_eq!(seen.load(Ordering::SeqCst), 5);
    assert!(pipeline.source().is_closed());
    Ok(())
}

#[test]
fn failing_sink_does_not_stop_the_others() -> Result<()> {
    let flaky = Arc::new(SinkCalls::default());
    let steady = Arc::new(SinkCalls::default());
    let mut sinks = SinkSet::new();
    sinks.push(CountingSink {
        name: "retransmit",
        fail_after: Some(3),
        calls: Arc::clone(&flaky),
    });
    sinks.push(CountingSink {
        name: "record",
        fail_after: None,
        calls: Arc::clone(&steady),
    });

    let source = framepipe::source::open(&stub_file("clip?size=64x48"), &SourceOptions::default())?;
    let config = PipelineConfig {
        scale: 0.5,
        ..PipelineConfig::default()
    };
    let mut pipeline = Pipeline::new(
        source,
        Box::new(Identity),
        sinks,
        CancellationToken::new(),
        config,
    )?;
    let summary = pipeline.run()?;

    assert_eq!(summary.frames_processed, 10);
    assert_eq!(summary.disabled_sinks, vec!["retransmit".to_string()]);
    assert_eq!(flaky.writes.load(Ordering::SeqCst), 4);
    assert_eq!(flaky.closes.load(Ordering::SeqCst), 1);
    assert_eq!(steady.writes.load(Ordering::SeqCst), 10);
    assert_eq!(steady.closes.load(Ordering::SeqCst), 1);
    let sizes = steady.sizes.lock().unwrap();
    assert!(sizes.iter().all(|r| *r == Resolution::new(32, 24)));
    Ok(())
}

#[test]
fn records_scaled_output_to_y4m() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let record_path = dir.path().join("edges.y4m");
    let config = PipelineConfig {
        scale: 0.5,
        outputs: OutputOptions {
            record_path: Some(record_path.clone()),
            ..OutputOptions::default()
        },
        ..PipelineConfig::default()
    };

    let mut pipeline = Pipeline::open(
        &stub_file("clip?frames=4&size=64x48&fps=25"),
        &SourceOptions::default(),
        Box::new(framepipe::EdgeFilter::default()),
        CancellationToken::new(),
        config,
    )?;
    let summary = pipeline.run()?;
    assert_eq!(summary.frames_processed, 4);
    drop(pipeline);

    let bytes = std::fs::read(&record_path)?;
    let header = b"YUV4MPEG2 W32 H24 F25:1 Ip A1:1 C444\n";
    assert!(bytes.starts_with(header));
    let frame_len = b"FRAME\n".len() + 32 * 24 * 3;
    assert_eq!(bytes.len(), header.len() + 4 * frame_len);
    Ok(())
}

#[test]
fn unusable_outputs_fail_at_construction() {
    let config = PipelineConfig {
        outputs: OutputOptions {
            record_path: Some(PathBuf::from("/nonexistent-framepipe-dir/out.y4m")),
            ..OutputOptions::default()
        },
        ..PipelineConfig::default()
    };
    let result = Pipeline::open(
        &stub_file("clip"),
        &SourceOptions::default(),
        Box::new(Identity),
        CancellationToken::new(),
        config,
    );
    assert!(result.is_err());
}

#[test]
fn oversized_scale_fails_before_sinks_open() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let record_path = dir.path().join("huge.y4m");
    let config = PipelineConfig {
        scale: 100_000.0,
        outputs: OutputOptions {
            record_path: Some(record_path.clone()),
            ..OutputOptions::default()
        },
        ..PipelineConfig::default()
    };
    let result = Pipeline::open(
        &stub_file("clip?frames=1&size=64x48"),
        &SourceOptions::default(),
        Box::new(Identity),
        CancellationToken::new(),
        config,
    );
    let err = result.err().expect("oversized output rejected");
    assert!(format!("{:#}", err).contains("unusable output size"), "{:#}", err);
    assert!(!record_path.exists(), "no recording created");
    Ok(())
}

#[test]
fn missing_source_fails_at_construction() {
    let err = Pipeline::from_settings(
        &Settings::default(),
        Box::new(Identity),
        CancellationToken::new(),
    )
    .err()
    .expect("no source configured");
    assert!(err.to_string().contains("no video source specified"));
}

#[test]
fn settings_drive_a_full_run() -> Result<()> {
    let mut settings = Settings::default();
    settings.source.device = Some(0);
    settings.source.file = Some(PathBuf::from("stub://clip?frames=3&size=16x16"));

    let mut pipeline =
        Pipeline::from_settings(&settings, Box::new(Identity), CancellationToken::new())?;
    let summary = pipeline.run()?;
    assert_eq!(summary.frames_processed, 3);
    assert_eq!(summary.stop_reason, StopReason::EndOfStream);
    Ok(())
}
