//! Tracing error states surfaced to the host.

use alloc::collections::BTreeSet;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use parity_scale_codec::{Decode, Encode};

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Encode, Decode)]
pub enum ErrorState {
    RadioUnsupported,
    RadioDisabled,
    PermissionMissing,
    LocationDisabled,
    PersistenceFailure,
    SchedulerFailure,
}

impl ErrorState {
    pub const fn label(&self) -> &'static str {
        match self {
            Self::RadioUnsupported => "bluetooth not supported",
            Self::RadioDisabled => "bluetooth disabled",
            Self::PermissionMissing => "permission missing",
            Self::LocationDisabled => "location disabled",
            Self::PersistenceFailure => "storage failure",
            Self::SchedulerFailure => "wakeup scheduling failed",
        }
    }

    /// Sticky states survive until the next `Start`; the others follow
    /// external state-change events.
    pub const fn is_sticky(&self) -> bool {
        matches!(self, Self::RadioUnsupported | Self::SchedulerFailure)
    }

    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::SchedulerFailure)
    }
}

impl fmt::Display for ErrorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Ordered set of active error states.
#[derive(Clone, PartialEq, Eq, Debug, Default, Encode, Decode)]
pub struct ErrorSet(BTreeSet<ErrorState>);

impl ErrorSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when the set changed.
    pub fn insert(&mut self, state: ErrorState) -> bool {
        self.0.insert(state)
    }

    /// Returns true when the set changed.
    pub fn remove(&mut self, state: ErrorState) -> bool {
        self.0.remove(&state)
    }

    /// Inserts or removes `state`; returns true when the set changed.
    pub fn set(&mut self, state: ErrorState, present: bool) -> bool {
        if present {
            self.insert(state)
        } else {
            self.remove(state)
        }
    }

    pub fn clear_sticky(&mut self) -> bool {
        let before = self.0.len();
        self.0.retain(|s| !s.is_sticky());
        before != self.0.len()
    }

    pub fn contains(&self, state: ErrorState) -> bool {
        self.0.contains(&state)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = ErrorState> + '_ {
        self.0.iter().copied()
    }

    /// Labels joined the way the presence indicator lists them.
    pub fn joined(&self) -> String {
        let labels: Vec<&str> = self.0.iter().map(ErrorState::label).collect();
        labels.join(", ")
    }
}

impl FromIterator<ErrorState> for ErrorSet {
    fn from_iter<I: IntoIterator<Item = ErrorState>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
