//! Background task machinery.
//!
//! [`run_task`] is the wrapper every submitted job runs inside. It owns
//! the message lifecycle around a [`Runnable`]: open the sink, honour a
//! cancellation that landed before the task started, run the body, send
//! exactly one final message, close the sink. Task bodies never touch
//! the sink discipline themselves.

use crate::cancellation::{CancelSource, CancelToken};
use crate::channel::MessageSink;
use crate::errors::SendError;
use crate::exception::MarshalledException;
use crate::future::ManagedFuture;
use crate::message::Payload;
use crate::router::MessageHandler;
use std::cell::RefCell;
use std::rc::Rc;

mod call;
mod iteration;
mod progress;
mod steps;

pub use call::{BackgroundCall, CallFuture};
pub use iteration::{BackgroundIteration, IterationFuture};
pub use progress::{BackgroundProgress, ProgressFuture, ProgressReporter};
pub use steps::{BackgroundSteps, StepsFuture, StepsInfo, StepsReporter};

/// Boxed error task bodies can bubble out with `?`.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// How a task body finished.
pub enum RunOutcome {
    /// Ran to completion; the payload becomes the future's result.
    Returned(Payload),
    /// Failed; the exception becomes the future's failure.
    Raised(MarshalledException),
    /// Observed its cancellation token and unwound cooperatively.
    Cancelled,
}

/// Background-side access handed to a running task body.
pub struct TaskContext<'a> {
    sink: &'a mut dyn MessageSink,
    token: &'a CancelToken,
}

impl TaskContext<'_> {
    /// Sends a custom payload to the foreground.
    pub fn send(&mut self, payload: Payload) -> Result<(), SendError> {
        self.sink.send_custom(payload)
    }

    /// Whether the foreground has requested cancellation.
    #[must_use]
    pub fn cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// A prepared task body, ready to run on a worker.
pub trait Runnable: Send {
    /// Runs the body to its outcome. Must not panic; implementations
    /// catch unwinds from user code and marshal them.
    fn run(&mut self, cx: &mut TaskContext<'_>) -> RunOutcome;
}

/// Runs one task to completion inside the message lifecycle.
///
/// Transport failures here cannot reach any foreground future, so they
/// are logged and swallowed rather than allowed to unwind the worker.
pub fn run_task<S: MessageSink>(
    mut sink: S,
    token: &CancelToken,
    mut runnable: Box<dyn Runnable>,
) {
    if let Err(error) = drive(&mut sink, token, runnable.as_mut()) {
        tracing::error!(%error, "background task messaging failed");
    }
}

fn drive(
    sink: &mut dyn MessageSink,
    token: &CancelToken,
    runnable: &mut dyn Runnable,
) -> Result<(), SendError> {
    sink.start()?;
    if token.is_cancelled() {
        sink.send_abandoned()?;
    } else {
        sink.send_started()?;
        let outcome = {
            let mut cx = TaskContext { sink, token };
            runnable.run(&mut cx)
        };
        match outcome {
            RunOutcome::Returned(payload) => sink.send_returned(payload)?,
            RunOutcome::Raised(exception) => sink.send_raised(exception)?,
            // A cooperative unwind is an orderly exit; the foreground
            // is already cancelling and will discard the payload.
            RunOutcome::Cancelled => sink.send_returned(Box::new(()))?,
        }
    }
    sink.stop()
}

/// One submittable kind of background task.
///
/// A specification knows how to split itself into the foreground future
/// the caller keeps and the runnable the worker pool executes.
pub trait TaskSpecification {
    /// Foreground handle type produced at submission.
    type Future;

    /// Splits the specification into its foreground and background
    /// parts, wiring `cancel` into the future.
    fn build(self, cancel: CancelSource) -> TaskParts<Self::Future>;
}

/// Product of [`TaskSpecification::build`], consumed by the executor.
pub struct TaskParts<F> {
    pub(crate) future: F,
    pub(crate) managed: Rc<RefCell<dyn ManagedFuture>>,
    pub(crate) handler: MessageHandler,
    pub(crate) runnable: Box<dyn Runnable>,
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Sender;
    use crate::message::{ConnectionId, MessageKind, Routed};
    use crate::notify::Pinger;
    use crossbeam_queue::SegQueue;
    use std::sync::Arc;

    struct NullPinger;

    impl Pinger for NullPinger {
        fn ping(&self) {}
    }

    struct Fixed(Option<RunOutcome>);

    impl Runnable for Fixed {
        fn run(&mut self, _cx: &mut TaskContext<'_>) -> RunOutcome {
            self.0.take().unwrap()
        }
    }

    fn run_to_kinds(token: &CancelToken, runnable: Box<dyn Runnable>) -> Vec<MessageKind> {
        let queue = Arc::new(SegQueue::new());
        let sender = Sender::new(
            ConnectionId::new(1),
            Arc::clone(&queue),
            Arc::new(NullPinger),
        );
        run_task(sender, token, runnable);
        std::iter::from_fn(|| queue.pop())
            .map(|routed: Routed| routed.message.kind())
            .collect()
    }

    #[test]
    fn normal_run_sends_started_then_final() {
        let token = CancelSource::new().token();
        let kinds = run_to_kinds(
            &token,
            Box::new(Fixed(Some(RunOutcome::Returned(Box::new(3u8))))),
        );
        assert_eq!(kinds, [MessageKind::Started, MessageKind::Returned]);
    }

    #[test]
    fn failed_run_sends_raised() {
        let token = CancelSource::new().token();
        let kinds = run_to_kinds(
            &token,
            Box::new(Fixed(Some(RunOutcome::Raised(
                MarshalledException::from_panic(&"boom"),
            )))),
        );
        assert_eq!(kinds, [MessageKind::Started, MessageKind::Raised]);
    }

    #[test]
    fn cancellation_before_start_abandons_without_running() {
        struct MustNotRun;
        impl Runnable for MustNotRun {
            fn run(&mut self, _cx: &mut TaskContext<'_>) -> RunOutcome {
                panic!("body ran after pre-start cancellation")
            }
        }
        let source = CancelSource::new();
        source.request();
        let kinds = run_to_kinds(&source.token(), Box::new(MustNotRun));
        assert_eq!(kinds, [MessageKind::Abandoned]);
    }

    #[test]
    fn cooperative_cancellation_maps_to_returned() {
        let token = CancelSource::new().token();
        let kinds = run_to_kinds(&token, Box::new(Fixed(Some(RunOutcome::Cancelled))));
        assert_eq!(kinds, [MessageKind::Started, MessageKind::Returned]);
    }

    #[test]
    fn cancellation_after_task_message_sequence_is_exactly_one_final() {
        let token = CancelSource::new().token();
        let kinds = run_to_kinds(
            &token,
            Box::new(Fixed(Some(RunOutcome::Raised(
                MarshalledException::from_panic(&"late failure"),
            )))),
        );
        assert_eq!(
            kinds.iter().filter(|kind| kind.is_final()).count(),
            1,
            "{kinds:?}"
        );
    }
}
