//! Stop/quit signal for one controller thread.

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    /// A stop was posted; the controller should send its stop requests.
    StopRequested,
    /// The daemon is shutting down.
    Quit,
}

#[derive(Debug, Default)]
struct Flags {
    stop_ready: bool,
    quit: bool,
}

/// Two latched predicates behind one condition variable.
///
/// Both flags are sticky, so posting before anyone waits is never lost and a
/// spurious wakeup simply re-checks them.
#[derive(Debug, Default)]
pub struct StopSignal {
    flags: Mutex<Flags>,
    cond: Condvar,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latch `stop_ready`. Returns true for the first post only.
    pub fn post_stop(&self) -> bool {
        let mut flags = self.flags.lock();
        let first = !flags.stop_ready;
        flags.stop_ready = true;
        self.cond.notify_all();
        first
    }

    pub fn quit(&self) {
        self.flags.lock().quit = true;
        self.cond.notify_all();
    }

    /// Block until either predicate holds. A posted stop wins over quit.
    pub fn wait(&self) -> WakeReason {
        let mut flags = self.flags.lock();
        loop {
            if let Some(reason) = Self::reason(&flags) {
                return reason;
            }
            self.cond.wait(&mut flags);
        }
    }

    fn reason(flags: &Flags) -> Option<WakeReason> {
        if flags.stop_ready {
            Some(WakeReason::StopRequested)
        } else if flags.quit {
            Some(WakeReason::Quit)
        } else {
            None
        }
    }
}
