//! Background acquisition for live sources.
//!
//! A `BackgroundAcquirer` owns a live `CaptureBackend` on a dedicated thread and
//! publishes every frame it reads into a shared `FrameSlot`. The loop:
//! 1. Checks the stop flag (once per iteration, before the next read)
//! 2. Performs one blocking backend read
//! 3. Publishes the frame, overwriting any frame the controller has not taken
//!
//! Stopping never interrupts an in-flight read, so `stop()` may wait for the
//! current read call to return before the thread joins.
//!
//! Read failures are counted in `AcquirerHealth`. Once the consecutive failure
//! count reaches the policy limit the health is marked failed and the thread
//! exits; the controller observes this on its next read.

use anyhow::{anyhow, Context, Result};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::slot::FrameSlot;
use crate::source::CaptureBackend;

const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 50;
const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(20);
/// Log the first failure of a streak, then every Nth one.
const FAILURE_LOG_INTERVAL: u32 = 10;

/// Failure handling for the acquisition thread.
#[derive(Clone, Debug)]
pub struct AcquirerPolicy {
    /// Consecutive failed reads tolerated before the source is declared unusable.
    pub max_consecutive_failures: u32,
    /// Pause after a failed read so a broken device does not spin the thread.
    pub retry_backoff: Duration,
}

impl Default for AcquirerPolicy {
    fn default() -> Self {
        Self {
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        }
    }
}

// ----------------------------------------------------------------------------
// AcquirerHealth
// ----------------------------------------------------------------------------

/// Failure state shared between the acquisition thread and the controller.
#[derive(Debug, Default)]
pub struct AcquirerHealth {
    consecutive_failures: AtomicU32,
    total_failures: AtomicU64,
    failed: AtomicBool,
    last_error: Mutex<Option<String>>,
}

impl AcquirerHealth {
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    pub fn total_failures(&self) -> u64 {
        self.total_failures.load(Ordering::SeqCst)
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Error describing why the source was declared unusable.
    pub fn failure(&self) -> anyhow::Error {
        anyhow!(
            "live source failed after {} consecutive read errors (last error: {})",
            self.consecutive_failures(),
            self.last_error().unwrap_or_else(|| "unknown".to_string())
        )
    }

    fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
    }

    /// Returns the length of the current failure streak.
    fn record_failure(&self, error: String) -> u32 {
        self.total_failures.fetch_add(1, Ordering::SeqCst);
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(error);
        self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn mark_failed(&self) {
        self.failed.store(true, Ordering::SeqCst);
    }
}

// ----------------------------------------------------------------------------
// BackgroundAcquirer
// ----------------------------------------------------------------------------

pub struct BackgroundAcquirer {
    name: String,
    stop: Arc<AtomicBool>,
    health: Arc<AcquirerHealth>,
    handle: Option<JoinHandle<Option<Box<dyn CaptureBackend>>>>,
}

impl BackgroundAcquirer {
    /// Start the acquisition thread. `backend` must already be open.
    pub fn spawn(
        backend: Box<dyn CaptureBackend>,
        slot: Arc<FrameSlot>,
        policy: AcquirerPolicy,
    ) -> Result<Self> {
        let name = backend.describe();
        let stop = Arc::new(AtomicBool::new(false));
        let health = Arc::new(AcquirerHealth::default());

        // Closed by the guard if the thread never starts.
        let pending = ClosingBackend(Some(backend));
        let handle = {
            let stop = Arc::clone(&stop);
            let health = Arc::clone(&health);
            thread::Builder::new()
                .name("frame-acquirer".to_string())
                .spawn(move || {
                    pending
                        .into_inner()
                        .map(|backend| acquire_loop(backend, slot, stop, health, policy))
                })
                .context("spawn frame acquisition thread")?
        };
        log::debug!("BackgroundAcquirer: started for {}", name);

        Ok(Self {
            name,
            stop,
            health,
            handle: Some(handle),
        })
    }

    pub fn health(&self) -> Arc<AcquirerHealth> {
        Arc::clone(&self.health)
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Signal the thread to stop and join it, handing the backend back for release.
    ///
    /// Only the first call does anything; later calls return `None`. Also returns
    /// `None` if the thread panicked (the backend was dropped during unwinding).
    pub fn stop(&mut self) -> Option<Box<dyn CaptureBackend>> {
        let handle = self.handle.take()?;
        self.stop.store(true, Ordering::SeqCst);
        match handle.join() {
            Ok(backend) => {
                log::debug!("BackgroundAcquirer: stopped for {}", self.name);
                backend
            }
            Err(_) => {
                log::error!("BackgroundAcquirer: thread for {} panicked", self.name);
                None
            }
        }
    }
}

impl Drop for BackgroundAcquirer {
    fn drop(&mut self) {
        if let Some(mut backend) = self.stop() {
            backend.close();
        }
    }
}

/// Open backend that is closed on drop unless taken out first.
struct ClosingBackend(Option<Box<dyn CaptureBackend>>);

impl ClosingBackend {
    fn into_inner(mut self) -> Option<Box<dyn CaptureBackend>> {
        self.0.take()
    }
}

impl Drop for ClosingBackend {
    fn drop(&mut self) {
        if let Some(mut backend) = self.0.take() {
            log::debug!("BackgroundAcquirer: closing unstarted {}", backend.describe());
            backend.close();
        }
    }
}

/// Marks the health failed if the acquisition thread unwinds.
struct PanicGuard(Arc<AcquirerHealth>);

impl Drop for PanicGuard {
    fn drop(&mut self) {
        if thread::panicking() {
            self.0.record_failure("acquisition thread panicked".to_string());
            self.0.mark_failed();
        }
    }
}

fn acquire_loop(
    mut backend: Box<dyn CaptureBackend>,
    slot: Arc<FrameSlot>,
    stop: Arc<AtomicBool>,
    health: Arc<AcquirerHealth>,
    policy: AcquirerPolicy,
) -> Box<dyn CaptureBackend> {
    let _guard = PanicGuard(Arc::clone(&health));
    let limit = policy.max_consecutive_failures.max(1);

    while !stop.load(Ordering::SeqCst) {
        let error = match backend.read() {
            Ok(Some(frame)) => {
                health.record_success();
                slot.publish(frame);
                continue;
            }
            Ok(None) => "live source reported end of stream".to_string(),
            Err(err) => format!("{:#}", err),
        };

        let streak = health.record_failure(error.clone());
        if streak == 1 || streak % FAILURE_LOG_INTERVAL == 0 {
            log::warn!(
                "BackgroundAcquirer: read from {} failed ({} in a row): {}",
                backend.describe(),
                streak,
                error
            );
        }
        if streak >= limit {
            log::error!(
                "BackgroundAcquirer: giving up on {} after {} consecutive failures",
                backend.describe(),
                streak
            );
            health.mark_failed();
            break;
        }
        thread::sleep(policy.retry_backoff);
    }

    backend
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Frame, PixelFormat, Resolution};
    use crate::source::StreamInfo;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    /// Live backend that yields `good` frames, then fails forever.
    struct FlakyBackend {
        good: usize,
        reads: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
    }

    impl CaptureBackend for FlakyBackend {
        fn describe(&self) -> String {
            "flaky".to_string()
        }

        fn open(&mut self) -> Result<StreamInfo> {
            Ok(StreamInfo::new(Resolution::new(2, 2), 30.0))
        }

        fn read(&mut self) -> Result<Option<Frame>> {
            let n = self.reads.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(1));
            if n < self.good {
                let frame = Frame::new(vec![n as u8; 12], 2, 2, PixelFormat::Rgb24)?;
                Ok(Some(frame))
            } else {
                Err(anyhow!("device unplugged"))
            }
        }

        fn close(&mut self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn flaky(good: usize) -> (Box<dyn CaptureBackend>, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let reads = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));
        let backend = FlakyBackend {
            good,
            reads: Arc::clone(&reads),
            closes: Arc::clone(&closes),
        };
        (Box::new(backend), reads, closes)
    }

    fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        cond()
    }

    #[test]
    fn acquirer_publishes_frames_and_stops() -> Result<()> {
        let slot = Arc::new(FrameSlot::new());
        let (backend, _reads, closes) = flaky(usize::MAX);
        let mut acquirer =
            BackgroundAcquirer::spawn(backend, Arc::clone(&slot), AcquirerPolicy::default())?;

        assert!(wait_until(Duration::from_secs(2), || slot.stats().published >= 3));
        assert!(acquirer.is_running());

        let mut backend = acquirer.stop().expect("backend returned");
        assert!(!acquirer.is_running());
        assert!(acquirer.stop().is_none(), "stop is one-shot");
        backend.close();
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(!acquirer.health().is_failed());
        Ok(())
    }

    #[test]
    fn backend_that_never_reaches_the_thread_is_closed() {
        let (backend, reads, closes) = flaky(usize::MAX);
        drop(ClosingBackend(Some(backend)));
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(reads.load(Ordering::SeqCst), 0);

        let (backend, _reads, closes) = flaky(usize::MAX);
        let taken = ClosingBackend(Some(backend)).into_inner();
        assert!(taken.is_some());
        assert_eq!(closes.load(Ordering::SeqCst), 0, "taken backend stays open");
        drop(taken);
        assert_eq!(closes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn sustained_failures_mark_health_failed() -> Result<()> {
        let slot = Arc::new(FrameSlot::new());
        let (backend, _reads, _closes) = flaky(2);
        let policy = AcquirerPolicy {
            max_consecutive_failures: 5,
            retry_backoff: Duration::from_millis(1),
        };
        let mut acquirer = BackgroundAcquirer::spawn(backend, Arc::clone(&slot), policy)?;
        let health = acquirer.health();

        assert!(wait_until(Duration::from_secs(2), || health.is_failed()));
        assert_eq!(health.consecutive_failures(), 5);
        assert_eq!(slot.stats().published, 2);
        let message = format!("{}", health.failure());
        assert!(message.contains("device unplugged"), "{}", message);

        // Thread already exited; stop still hands the backend back exactly once.
        assert!(acquirer.stop().is_some());
        Ok(())
    }

    #[test]
    fn dropping_acquirer_closes_backend() -> Result<()> {
        let slot = Arc::new(FrameSlot::new());
        let (backend, _reads, closes) = flaky(usize::MAX);
        let acquirer = BackgroundAcquirer::spawn(backend, slot, AcquirerPolicy::default())?;
        drop(acquirer);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        Ok(())
    }
}
