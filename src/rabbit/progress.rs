//! Progress reporting and cooperative stop/pause.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use tracing::info;

use crate::signature::RecordId;

/// One progress report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// Records handled so far, including skipped ones.
    pub processed: usize,
    /// Records in the batch.
    pub total: usize,
    /// Record handled last.
    pub current_record: Option<RecordId>,
}

/// Receives progress reports. Purely observational.
pub trait ProgressMonitor: Send + Sync {
    /// Called after each reporting interval and once at the end of a batch.
    fn report(&self, progress: Progress);
}

/// Logs progress at `info` level.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogMonitor;

impl ProgressMonitor for LogMonitor {
    fn report(&self, progress: Progress) {
        info!(
            processed = progress.processed,
            total = progress.total,
            record = ?progress.current_record,
            "rabbit progress"
        );
    }
}

/// Forwards progress over a bounded channel.
///
/// Never blocks the batch: reports are dropped when the receiver lags.
#[derive(Debug)]
pub struct ChannelMonitor {
    tx: Sender<Progress>,
    dropped: AtomicU64,
}

impl ChannelMonitor {
    /// Creates a monitor and the receiving end of its channel.
    #[must_use]
    pub fn bounded(capacity: usize) -> (Self, Receiver<Progress>) {
        let (tx, rx) = bounded(capacity.max(1));
        (
            Self {
                tx,
                dropped: AtomicU64::new(0),
            },
            rx,
        )
    }

    /// Reports dropped because the channel was full or closed.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl ProgressMonitor for ChannelMonitor {
    fn report(&self, progress: Progress) {
        match self.tx.try_send(progress) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

type PauseHook = Arc<dyn Fn(RecordId) + Send + Sync>;

/// Stop flag and pause hook checked between records.
///
/// Clones share the same flag, so a scheduler can keep one clone and stop
/// a running batch from another thread.
#[derive(Clone, Default)]
pub struct BatchControl {
    stop: Arc<AtomicBool>,
    pause: Option<PauseHook>,
}

impl fmt::Debug for BatchControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchControl")
            .field("stop", &self.stop.load(Ordering::Relaxed))
            .field("pause", &self.pause.is_some())
            .finish()
    }
}

impl BatchControl {
    /// Creates a control that never stops on its own.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a hook called before each record; it may block to pause.
    #[must_use]
    pub fn with_pause_hook(mut self, hook: impl Fn(RecordId) + Send + Sync + 'static) -> Self {
        self.pause = Some(Arc::new(hook));
        self
    }

    /// Asks the batch to stop before the next record.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Returns true once a stop was requested.
    #[must_use]
    pub fn is_stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Suspension point before `next`. Returns false if the batch must stop.
    pub fn checkpoint(&self, next: RecordId) -> bool {
        if let Some(pause) = &self.pause {
            pause(next);
        }
        !self.is_stop_requested()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_channel_monitor_delivers_and_drops_when_full() {
        let (monitor, rx) = ChannelMonitor::bounded(1);
        let p = Progress {
            processed: 1,
            total: 2,
            current_record: Some(5),
        };
        monitor.report(p);
        monitor.report(p);
        assert_eq!(rx.try_recv().unwrap(), p);
        assert_eq!(monitor.dropped(), 1);
    }

    #[test]
    fn test_stop_is_shared_between_clones() {
        let control = BatchControl::new();
        let handle = control.clone();
        assert!(control.checkpoint(1));
        handle.request_stop();
        assert!(!control.checkpoint(2));
    }

    #[test]
    fn test_pause_hook_sees_every_checkpoint() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let control = BatchControl::new().with_pause_hook(move |record| {
            sink.lock().unwrap().push(record);
        });
        control.checkpoint(3);
        control.checkpoint(9);
        assert_eq!(*seen.lock().unwrap(), vec![3, 9]);
    }
}
