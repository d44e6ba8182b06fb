//! Tracing orchestrator.
//!
//! The orchestrator owns the transmitter, the scanner and the periodic
//! location task, and drives them from a single loop. Every state mutation,
//! timer wakeup, host event and scanner report is a message on that loop's
//! inbox; radio and storage work happens elsewhere and reports back as
//! messages. [`TracingHandle`] is the only way in.

mod command;
mod event_loop;

pub use command::{
    ExternalEvent, Lifecycle, StartHint, TracingCommand, TracingStatus, ACTION_RESTART_CLIENT,
    ACTION_RESTART_SERVER, ACTION_START, ACTION_STOP,
};

use std::sync::Arc;

use geotrace_primitives::ErrorSet;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};

use crate::clock::Clock;
use crate::config::TracingConfig;
use crate::ephid::EphidSource;
use crate::host::{Presence, WakeLease};
use crate::location::LocationProvider;
use crate::radio::Radio;
use crate::scheduler::{Scheduler, TimerHandle, WakeupSink};
use crate::store::StoreWriter;
use command::LoopEvent;
use event_loop::EventLoop;

/// Everything the orchestrator drives, injected by the host.
pub struct Capabilities {
    pub clock: Arc<dyn Clock>,
    pub scheduler: Box<dyn Scheduler>,
    pub ephids: Arc<dyn EphidSource>,
    pub radio: Arc<dyn Radio>,
    pub location: Box<dyn LocationProvider>,
    pub store: StoreWriter,
    pub wake_lease: Box<dyn WakeLease>,
    pub presence: Box<dyn Presence>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandleError {
    #[error("tracing orchestrator has shut down")]
    Closed,
}

struct InboxWakeups(mpsc::WeakUnboundedSender<LoopEvent>);

impl WakeupSink for InboxWakeups {
    fn wake(&self, handle: TimerHandle) -> bool {
        self.0
            .upgrade()
            .is_some_and(|tx| tx.send(LoopEvent::Wakeup(handle)).is_ok())
    }

    fn is_closed(&self) -> bool {
        self.0.upgrade().map_or(true, |tx| tx.is_closed())
    }
}

/// Spawns the orchestrator loop on the current tokio runtime.
///
/// The loop starts IDLE; `config` applies to restart commands that arrive
/// before the first `Start`.
pub fn spawn(mut capabilities: Capabilities, config: TracingConfig) -> TracingHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let (errors_tx, errors_rx) = watch::channel(ErrorSet::new());

    capabilities
        .scheduler
        .attach(Arc::new(InboxWakeups(tx.downgrade())));
    let store = capabilities.store.clone();
    let event_loop = EventLoop::new(capabilities, config, tx.downgrade(), errors_tx);
    tokio::spawn(event_loop.run(rx));

    TracingHandle {
        tx,
        store,
        errors: errors_rx,
    }
}

#[derive(Clone)]
pub struct TracingHandle {
    tx: mpsc::UnboundedSender<LoopEvent>,
    store: StoreWriter,
    errors: watch::Receiver<ErrorSet>,
}

impl TracingHandle {
    pub async fn start(&self, config: TracingConfig) -> Result<(), HandleError> {
        self.command(TracingCommand::Start(config)).await
    }

    pub async fn restart_client(&self) -> Result<(), HandleError> {
        self.command(TracingCommand::RestartClient).await
    }

    pub async fn restart_server(&self) -> Result<(), HandleError> {
        self.command(TracingCommand::RestartServer).await
    }

    pub async fn stop(&self) -> Result<(), HandleError> {
        self.command(TracingCommand::Stop).await
    }

    /// Runs a raw host action.
    ///
    /// A missing or unknown action leaves the state unchanged and asks the
    /// host not to redeliver it.
    pub async fn deliver(
        &self,
        action: Option<&str>,
        config: &TracingConfig,
    ) -> Result<StartHint, HandleError> {
        match TracingCommand::parse(action, config) {
            Some(command) => {
                self.command(command).await?;
                Ok(StartHint::Redeliver)
            }
            None => {
                log::warn!("Ignoring host action {:?}", action);
                Ok(StartHint::NotSticky)
            }
        }
    }

    pub fn notify(&self, event: ExternalEvent) -> Result<(), HandleError> {
        self.tx
            .send(LoopEvent::External(event))
            .map_err(|_| HandleError::Closed)
    }

    /// Status with record counts as of every write queued so far.
    pub async fn status(&self) -> Result<TracingStatus, HandleError> {
        if let Err(e) = self.store.flush().await {
            log::warn!("Store flush before status failed: {}", e);
        }
        let mut status = self.snapshot().await?;
        status.counts = self.store.store().lock().counts();
        Ok(status)
    }

    /// Loop state only; does not wait for the store.
    pub(crate) async fn snapshot(&self) -> Result<TracingStatus, HandleError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(LoopEvent::Status { reply })
            .map_err(|_| HandleError::Closed)?;
        rx.await.map_err(|_| HandleError::Closed)
    }

    /// Receives the error set every time it changes.
    pub fn subscribe_errors(&self) -> watch::Receiver<ErrorSet> {
        self.errors.clone()
    }

    /// Stops tracing if it runs and ends the loop.
    pub async fn shutdown(&self) -> Result<(), HandleError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(LoopEvent::Shutdown { reply })
            .map_err(|_| HandleError::Closed)?;
        rx.await.map_err(|_| HandleError::Closed)
    }

    async fn command(&self, command: TracingCommand) -> Result<(), HandleError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(LoopEvent::Command { command, reply })
            .map_err(|_| HandleError::Closed)?;
        rx.await.map_err(|_| HandleError::Closed)
    }
}
