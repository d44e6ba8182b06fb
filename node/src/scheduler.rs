//! One-shot wakeups at absolute wall-clock instants.
//!
//! A wakeup is identified by its [`TimerHandle`]; scheduling a kind again
//! supersedes the pending timer of that kind. Timers sleep in bounded slices
//! and re-read the wall clock after each slice, so a host suspend that stalls
//! the monotonic clock cannot push a wakeup past its instant by more than one
//! slice.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use geotrace_primitives::{next_grid_after, Epoch, CALIBRATION_GRID_MS};
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::clock::Clock;

pub const DEFAULT_MAX_SLEEP_SLICE: Duration = Duration::from_secs(30);

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum WakeupKind {
    RestartClient,
    RestartServer,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct TimerHandle {
    pub kind: WakeupKind,
    pub id: u64,
    pub at_ms: u64,
}

/// Receiver of fired wakeups.
pub trait WakeupSink: Send + Sync {
    /// Delivers a fired wakeup; false when the receiver is gone.
    fn wake(&self, handle: TimerHandle) -> bool;

    fn is_closed(&self) -> bool;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("no wakeup sink attached")]
    Detached,
    #[error("no async runtime available to arm the timer")]
    NoRuntime,
    #[error("orchestrator loop is gone")]
    LoopClosed,
    #[error("wakeup instant {at_ms} is out of range")]
    OutOfRange { at_ms: u64 },
}

pub trait Scheduler: Send {
    fn attach(&mut self, sink: Arc<dyn WakeupSink>);

    fn schedule_at(&mut self, at_ms: u64, kind: WakeupKind) -> Result<TimerHandle, SchedulerError>;

    /// Cancels `handle` if it is still the pending timer of its kind.
    fn cancel(&mut self, handle: TimerHandle);

    fn cancel_all(&mut self);
}

/// Instant of the next scan-window restart on the absolute grid of
/// `interval_ms`.
///
/// An instant already on the grid is returned unchanged, so a scan window
/// that ends exactly on a grid point restarts immediately.
pub fn next_client_restart_at(now_ms: u64, interval_ms: u64) -> u64 {
    if interval_ms == 0 {
        return now_ms;
    }
    match now_ms % interval_ms {
        0 => now_ms,
        rem => now_ms.saturating_add(interval_ms - rem),
    }
}

/// Instant of the next transmitter restart: the end of `epoch`, or the next
/// minute boundary in calibration mode.
pub fn next_server_restart_at(epoch: &Epoch, now_ms: u64, calibration: bool) -> u64 {
    if calibration {
        next_grid_after(now_ms, CALIBRATION_GRID_MS)
    } else {
        epoch.next().start_ms
    }
}

pub struct TokioScheduler {
    clock: Arc<dyn Clock>,
    sink: Option<Arc<dyn WakeupSink>>,
    pending: HashMap<WakeupKind, (TimerHandle, JoinHandle<()>)>,
    next_id: u64,
    max_slice: Duration,
}

impl TokioScheduler {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_max_slice(clock, DEFAULT_MAX_SLEEP_SLICE)
    }

    pub fn with_max_slice(clock: Arc<dyn Clock>, max_slice: Duration) -> Self {
        Self {
            clock,
            sink: None,
            pending: HashMap::new(),
            next_id: 0,
            max_slice: max_slice.max(Duration::from_millis(1)),
        }
    }

    pub fn pending(&self, kind: WakeupKind) -> Option<TimerHandle> {
        self.pending
            .get(&kind)
            .filter(|(_, task)| !task.is_finished())
            .map(|(handle, _)| *handle)
    }
}

impl Scheduler for TokioScheduler {
    fn attach(&mut self, sink: Arc<dyn WakeupSink>) {
        self.sink = Some(sink);
    }

    fn schedule_at(&mut self, at_ms: u64, kind: WakeupKind) -> Result<TimerHandle, SchedulerError> {
        let sink = self.sink.clone().ok_or(SchedulerError::Detached)?;
        if sink.is_closed() {
            return Err(SchedulerError::LoopClosed);
        }
        if at_ms == u64::MAX {
            return Err(SchedulerError::OutOfRange { at_ms });
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| SchedulerError::NoRuntime)?;

        if let Some((_, superseded)) = self.pending.remove(&kind) {
            superseded.abort();
        }

        self.next_id += 1;
        let handle = TimerHandle {
            kind,
            id: self.next_id,
            at_ms,
        };
        let clock = self.clock.clone();
        let max_slice = self.max_slice;
        let task = runtime.spawn(async move {
            loop {
                let now = clock.now_ms();
                if now >= at_ms {
                    break;
                }
                let wait = Duration::from_millis(at_ms - now).min(max_slice);
                tokio::time::sleep(wait).await;
            }
            if !sink.wake(handle) {
                log::debug!("Wakeup {:?} dropped, loop is gone", handle.kind);
            }
        });
        self.pending.insert(kind, (handle, task));
        Ok(handle)
    }

    fn cancel(&mut self, handle: TimerHandle) {
        let matches = self
            .pending
            .get(&handle.kind)
            .is_some_and(|(pending, _)| *pending == handle);
        if matches {
            if let Some((_, task)) = self.pending.remove(&handle.kind) {
                task.abort();
            }
        }
    }

    fn cancel_all(&mut self) {
        for (_, (_, task)) in self.pending.drain() {
            task.abort();
        }
    }
}

impl Drop for TokioScheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
