//! Expiration Timer
//!
//! Single background thread that sleeps until the earliest pending deadline,
//! then asks the store to sweep expired entries.

use std::io;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, info};

use crate::clock::{until, Clock};

/// Longest single wait; later deadlines are reached in several hops.
pub(crate) const MAX_TIMER_PERIOD: Duration = Duration::from_millis(4_294_967_294);

// == Sweeper ==
/// Store side of the timer.
pub(crate) trait ExpirySweeper: Send + Sync {
    /// Removes or refreshes every entry that is due and returns the next
    /// pending deadline.
    fn sweep_expired(&self) -> Option<DateTime<Utc>>;
}

#[derive(Debug, Default)]
struct TimerState {
    due: Option<DateTime<Utc>>,
    shutdown: bool,
}

struct TimerShared {
    state: Mutex<TimerState>,
    signal: Condvar,
    clock: Arc<dyn Clock>,
}

// == Expiration Timer ==
/// Handle to the timer thread. Dropping it stops the thread.
pub(crate) struct ExpirationTimer {
    shared: Arc<TimerShared>,
}

impl ExpirationTimer {
    /// Starts the timer thread, unarmed.
    ///
    /// The thread holds only a weak reference to the sweeper and exits once
    /// the sweeper is gone.
    pub fn spawn(sweeper: Weak<dyn ExpirySweeper>, clock: Arc<dyn Clock>) -> io::Result<Self> {
        let shared = Arc::new(TimerShared {
            state: Mutex::new(TimerState::default()),
            signal: Condvar::new(),
            clock,
        });

        let worker = shared.clone();
        thread::Builder::new()
            .name("cache-expiry".into())
            .spawn(move || run(worker, sweeper))?;

        info!("Started expiration timer");
        Ok(Self { shared })
    }

    // == Arm ==
    /// Makes the timer fire at `deadline` unless it is already due earlier.
    pub fn arm_if_earlier(&self, deadline: DateTime<Utc>) {
        let mut state = self.shared.state.lock();
        if state.due.is_some_and(|due| due <= deadline) {
            return;
        }
        state.due = Some(deadline);
        self.shared.signal.notify_one();
    }

    /// Deadline the timer is currently armed for.
    #[allow(dead_code)]
    pub fn due(&self) -> Option<DateTime<Utc>> {
        self.shared.state.lock().due
    }
}

impl Drop for ExpirationTimer {
    fn drop(&mut self) {
        self.shared.state.lock().shutdown = true;
        self.shared.signal.notify_one();
    }
}

fn run(shared: Arc<TimerShared>, sweeper: Weak<dyn ExpirySweeper>) {
    let mut state = shared.state.lock();
    loop {
        if state.shutdown {
            break;
        }
        let Some(due) = state.due else {
            shared.signal.wait(&mut state);
            continue;
        };

        let now = shared.clock.now();
        if now < due {
            let wait = until(now, due).min(MAX_TIMER_PERIOD);
            shared.signal.wait_for(&mut state, wait);
            continue;
        }

        state.due = None;
        let swept = MutexGuard::unlocked(&mut state, || {
            sweeper.upgrade().map(|sweeper| sweeper.sweep_expired())
        });
        let Some(next) = swept else {
            break;
        };
        if let Some(next) = next {
            if state.due.map_or(true, |due| next < due) {
                state.due = Some(next);
            }
        }
    }
    debug!("Expiration timer stopped");
}
