//! Blocking policy for acquire calls.
//!
//! Every blocking operation takes a [`Wait`]. [`Wait::Immediate`] never
//! parks the caller; the condition is checked once and the call reports
//! [`IoError::Timeout`](crate::IoError::Timeout) if it does not hold.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, MutexGuard};

/// How long a blocking call may park the calling thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Wait {
    /// Check once, never block.
    Immediate,
    /// Block for at most this long.
    For(Duration),
    /// Block until the condition holds or the bus is aborted.
    #[default]
    Forever,
}

impl Wait {
    /// Wait for `ms` milliseconds; `0` means [`Wait::Immediate`].
    pub fn ms(ms: u64) -> Self {
        if ms == 0 {
            Wait::Immediate
        } else {
            Wait::For(Duration::from_millis(ms))
        }
    }

    /// Starts the clock for this policy.
    pub(crate) fn deadline(self) -> Deadline {
        match self {
            Wait::Immediate => Deadline::Now,
            Wait::For(d) => Deadline::At(Instant::now() + d),
            Wait::Forever => Deadline::Never,
        }
    }
}

/// A [`Wait`] anchored at the moment the operation started.
///
/// Repeated waits inside one acquire share the same deadline, so spurious
/// wakeups never extend the total time a caller can block.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Deadline {
    Now,
    At(Instant),
    Never,
}

impl Deadline {
    /// Parks on `cv`, releasing `guard` while blocked.
    ///
    /// Returns `false` once the deadline has passed.
    pub(crate) fn wait<T>(self, cv: &Condvar, guard: &mut MutexGuard<'_, T>) -> bool {
        match self {
            Deadline::Now => false,
            Deadline::At(at) => {
                if Instant::now() >= at {
                    return false;
                }
                // A timed-out wait may still race with a notify; the caller
                // re-checks its condition before giving up.
                cv.wait_until(guard, at);
                true
            }
            Deadline::Never => {
                cv.wait(guard);
                true
            }
        }
    }
}
