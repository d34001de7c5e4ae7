//! Wake-the-consumer primitive.
//!
//! Senders never hand message payloads to the notification layer; they
//! push onto the shared queue first and then ping, so by the time the
//! consumer wakes the message is already visible. The default
//! [`CondvarPingee`] counts pings under a mutex, which means a ping that
//! lands between a queue check and the wait cannot be lost.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Background-side half: fired once per message sent.
pub trait Pinger: Send + Sync {
    /// Signals the consumer that something new is waiting.
    fn ping(&self);
}

/// Foreground-side half: owned by a router, woken by its pingers.
pub trait Pingee {
    /// Prepares the pingee to receive pings.
    fn connect(&mut self);

    /// Tears the pingee down; pings after this are ignored.
    fn disconnect(&mut self);

    /// Returns a new pinger wired to this pingee.
    fn pinger(&self) -> Arc<dyn Pinger>;

    /// Blocks until at least one ping arrives or `timeout` passes.
    ///
    /// Returns `true` if woken by a ping, `false` on timeout. Consumes
    /// all pings accumulated so far.
    fn wait(&self, timeout: Duration) -> bool;
}

#[derive(Default)]
struct PingState {
    pending: Mutex<u64>,
    condvar: Condvar,
}

struct CountingPinger {
    state: Arc<PingState>,
}

impl Pinger for CountingPinger {
    fn ping(&self) {
        let mut pending = self.state.pending.lock();
        *pending += 1;
        self.state.condvar.notify_one();
    }
}

/// Counter-and-condvar pingee suitable for a blocking consumer thread.
///
/// GUI integrations substitute their own [`Pingee`] that posts to an
/// event loop instead of blocking.
#[derive(Default)]
pub struct CondvarPingee {
    state: Arc<PingState>,
}

impl CondvarPingee {
    /// Creates a pingee with no pending pings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Pingee for CondvarPingee {
    fn connect(&mut self) {
        *self.state.pending.lock() = 0;
    }

    fn disconnect(&mut self) {
        *self.state.pending.lock() = 0;
    }

    fn pinger(&self) -> Arc<dyn Pinger> {
        Arc::new(CountingPinger {
            state: Arc::clone(&self.state),
        })
    }

    fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut pending = self.state.pending.lock();
        while *pending == 0 {
            if self
                .state
                .condvar
                .wait_until(&mut pending, deadline)
                .timed_out()
            {
                return false;
            }
        }
        *pending = 0;
        true
    }
}
