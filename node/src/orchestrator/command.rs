//! Messages exchanged with the orchestrator loop.

use geotrace_primitives::ErrorSet;
use tokio::sync::oneshot;

use crate::config::TracingConfig;
use crate::radio::Observation;
use crate::scheduler::TimerHandle;
use crate::store::StoreCounts;

pub const ACTION_START: &str = "START";
pub const ACTION_RESTART_CLIENT: &str = "RESTART_CLIENT";
pub const ACTION_RESTART_SERVER: &str = "RESTART_SERVER";
pub const ACTION_STOP: &str = "STOP";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TracingCommand {
    Start(TracingConfig),
    RestartClient,
    RestartServer,
    Stop,
}

impl TracingCommand {
    /// Maps a raw host action to a command; `None` for a missing or unknown
    /// action.
    pub fn parse(action: Option<&str>, config: &TracingConfig) -> Option<Self> {
        match action? {
            ACTION_START => Some(Self::Start(config.clone())),
            ACTION_RESTART_CLIENT => Some(Self::RestartClient),
            ACTION_RESTART_SERVER => Some(Self::RestartServer),
            ACTION_STOP => Some(Self::Stop),
            _ => None,
        }
    }

    pub fn action(&self) -> &'static str {
        match self {
            Self::Start(_) => ACTION_START,
            Self::RestartClient => ACTION_RESTART_CLIENT,
            Self::RestartServer => ACTION_RESTART_SERVER,
            Self::Stop => ACTION_STOP,
        }
    }
}

/// Whether the host should redeliver the command if the process dies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartHint {
    Redeliver,
    NotSticky,
}

/// State changes reported by the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExternalEvent {
    RadioPower(bool),
    LocationMode(bool),
    LocationPermission(bool),
    ErrorsUpdated,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Lifecycle {
    #[default]
    Idle,
    Running,
    Stopped,
}

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct TracingStatus {
    pub lifecycle: Lifecycle,
    pub advertising: bool,
    pub receiving: bool,
    pub errors: ErrorSet,
    pub counts: StoreCounts,
}

pub(crate) enum LoopEvent {
    Command {
        command: TracingCommand,
        reply: oneshot::Sender<()>,
    },
    External(ExternalEvent),
    Status {
        reply: oneshot::Sender<TracingStatus>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
    Wakeup(TimerHandle),
    ScanWindowElapsed {
        window: u64,
        ends_at: u64,
    },
    SampleLocation {
        generation: u64,
    },
    Observed {
        scanner: u64,
        observation: Observation,
    },
}
