//! Message routers.
//!
//! A router multiplexes many per-task pipes onto one foreground
//! consumer. The thread variant drains a shared in-process queue; the
//! process variant adds a monitor thread that forwards wire entries from
//! a process-safe transport into the same kind of local queue. Both
//! share the dispatch bookkeeping and the deadline-based drain loop in
//! this module.

use crate::errors::{PumpError, RouterError, TimeoutError};
use crate::message::{ConnectionId, TaskMessage};
use std::time::{Duration, Instant};

mod process;
mod thread;

pub use process::{
    FramedReceiver, FramedSender, MemoryReceiver, MemorySender, ProcessRouter, ProcessSender,
    TransportReceiver, TransportSender, memory_transport,
};
pub use thread::ThreadRouter;

/// What a handler did with a delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// The message was intermediate; more will follow on this pipe.
    Continue,
    /// The message was final; the pipe is done and will be closed.
    Final,
}

/// Foreground callback bound to one pipe.
pub type MessageHandler = Box<dyn FnMut(TaskMessage) -> Result<Dispatch, crate::errors::FutureError>>;

/// Outcome of routing one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteReport {
    /// Pipe the message was addressed to.
    pub connection_id: ConnectionId,
    /// What happened to it.
    pub delivery: Delivery,
}

/// Disposition of a routed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Handed to the bound handler.
    Delivered(Dispatch),
    /// No receiver was open for the pipe; the message was dropped with a
    /// logged warning.
    NoReceiver,
}

/// Drains `route_one` until `condition` holds, recomputing the remaining
/// timeout from a fixed deadline on every blocking wait.
///
/// Each wakeup may deliver several queued messages, so the wait budget
/// must shrink as time passes; reusing the full timeout per iteration
/// would let the total wait grow without bound.
pub(crate) fn route_until(
    mut condition: impl FnMut() -> bool,
    timeout: Duration,
    mut route_one: impl FnMut() -> Result<Option<RouteReport>, RouterError>,
    mut wait: impl FnMut(Duration) -> bool,
) -> Result<(), PumpError> {
    let started = Instant::now();
    let deadline = started + timeout;
    loop {
        while route_one()?.is_some() {
            if condition() {
                return Ok(());
            }
        }
        if condition() {
            return Ok(());
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(TimeoutError {
                timeout,
                elapsed: now - started,
            }
            .into());
        }
        wait(deadline - now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn route_until_returns_once_condition_holds() {
        let routed = Cell::new(0);
        let result = route_until(
            || routed.get() >= 3,
            Duration::from_secs(5),
            || {
                routed.set(routed.get() + 1);
                Ok(Some(RouteReport {
                    connection_id: crate::message::ConnectionId::new(1),
                    delivery: Delivery::NoReceiver,
                }))
            },
            |_| true,
        );
        assert!(result.is_ok());
        assert_eq!(routed.get(), 3);
    }

    #[test]
    fn route_until_times_out_against_a_fixed_deadline() {
        // Wakeups arrive constantly but the condition never holds; the
        // loop must still give up once the original deadline passes.
        let timeout = Duration::from_millis(50);
        let started = Instant::now();
        let result = route_until(
            || false,
            timeout,
            || Ok(None),
            |remaining| {
                std::thread::sleep(remaining.min(Duration::from_millis(5)));
                true
            },
        );
        let elapsed = started.elapsed();
        assert!(matches!(result, Err(PumpError::Timeout(_))));
        assert!(elapsed >= timeout);
        assert!(elapsed < timeout * 10, "elapsed {elapsed:?}");
    }

    #[test]
    fn route_until_checks_condition_before_first_wait() {
        let result = route_until(
            || true,
            Duration::ZERO,
            || Ok(None),
            |_| panic!("should not wait"),
        );
        assert!(result.is_ok());
    }
}
