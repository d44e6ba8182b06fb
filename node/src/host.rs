//! Host services held while tracing runs: the wake lease and the presence
//! indicator.

pub trait WakeLease: Send {
    fn acquire(&mut self);

    fn release(&mut self);

    fn is_held(&self) -> bool;
}

pub trait Presence: Send {
    fn show(&mut self, text: &str);

    fn update(&mut self, text: &str);

    fn withdraw(&mut self);
}

/// Lease that only tracks its state; desktop hosts do not suspend the CPU.
#[derive(Debug, Default)]
pub struct HeldWakeLease {
    held: bool,
}

impl WakeLease for HeldWakeLease {
    fn acquire(&mut self) {
        if self.held {
            log::warn!("Wake lease acquired twice");
            return;
        }
        self.held = true;
        log::debug!("Wake lease acquired");
    }

    fn release(&mut self) {
        if !self.held {
            log::warn!("Wake lease released while not held");
            return;
        }
        self.held = false;
        log::debug!("Wake lease released");
    }

    fn is_held(&self) -> bool {
        self.held
    }
}

/// Presence rendered to the log.
#[derive(Debug, Default)]
pub struct LogPresence {
    current: Option<String>,
}

impl LogPresence {
    pub fn current(&self) -> Option<&str> {
        self.current.as_deref()
    }
}

impl Presence for LogPresence {
    fn show(&mut self, text: &str) {
        log::info!("Tracing presence: {}", text.replace('\n', " | "));
        self.current = Some(text.to_owned());
    }

    fn update(&mut self, text: &str) {
        if self.current.as_deref() == Some(text) {
            return;
        }
        self.show(text);
    }

    fn withdraw(&mut self) {
        if self.current.take().is_some() {
            log::info!("Tracing presence withdrawn");
        }
    }
}
