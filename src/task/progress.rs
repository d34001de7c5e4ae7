//! Background tasks reporting typed progress.

use crate::cancellation::{CancelSource, Cancelled};
use crate::errors::FutureError;
use crate::exception::MarshalledException;
use crate::future::{FutureEvent, FutureHandle};
use crate::states::FutureState;
use crate::task::{
    BoxError, RunOutcome, Runnable, TaskContext, TaskParts, TaskSpecification,
};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::Rc;

/// Handed to a progress task body for reporting.
///
/// `report` doubles as the cancellation checkpoint: it fails with
/// [`Cancelled`] once the foreground has cancelled, and the body is
/// expected to bubble that out with `?`.
pub trait ProgressReporter<P> {
    /// Sends one progress value to the foreground.
    fn report(&mut self, progress: P) -> Result<(), Cancelled>;
}

type ProgressBody<T, P> =
    Box<dyn FnOnce(&mut dyn ProgressReporter<P>) -> Result<T, BoxError> + Send>;

/// Runs a closure that reports progress while it works.
pub struct BackgroundProgress<T, P> {
    body: ProgressBody<T, P>,
}

impl<T, P> BackgroundProgress<T, P>
where
    T: Send + 'static,
    P: Send + 'static,
{
    /// Wraps a progress-reporting closure.
    pub fn new(
        body: impl FnOnce(&mut dyn ProgressReporter<P>) -> Result<T, BoxError>
        + Send
        + 'static,
    ) -> Self {
        Self {
            body: Box::new(body),
        }
    }
}

impl<T, P> TaskSpecification for BackgroundProgress<T, P>
where
    T: Send + 'static,
    P: Send + 'static,
{
    type Future = ProgressFuture<T, P>;

    fn build(self, cancel: CancelSource) -> TaskParts<Self::Future> {
        let handle = FutureHandle::<T>::new(cancel);
        let reports = Rc::new(RefCell::new(VecDeque::new()));
        let inbox = Rc::clone(&reports);
        handle.with_core(|core| {
            core.set_custom_handler(Box::new(move |payload| {
                match payload.downcast::<P>() {
                    Ok(progress) => {
                        inbox.borrow_mut().push_back(*progress);
                        Ok(())
                    }
                    Err(_) => Err(FutureError::PayloadType),
                }
            }));
        });
        TaskParts {
            managed: handle.managed(),
            handler: handle.message_handler(),
            runnable: Box::new(ProgressRunnable {
                body: Some(self.body),
            }),
            future: ProgressFuture { handle, reports },
        }
    }
}

/// Future returned by a [`BackgroundProgress`] submission.
pub struct ProgressFuture<T, P> {
    handle: FutureHandle<T>,
    reports: Rc<RefCell<VecDeque<P>>>,
}

impl<T, P> Clone for ProgressFuture<T, P> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
            reports: Rc::clone(&self.reports),
        }
    }
}

impl<T: 'static, P> ProgressFuture<T, P> {
    /// Current externally visible state.
    #[must_use]
    pub fn state(&self) -> FutureState {
        self.handle.state()
    }

    /// Whether [`cancel`](Self::cancel) can still take effect.
    #[must_use]
    pub fn cancellable(&self) -> bool {
        self.handle.cancellable()
    }

    /// Whether the task has reached a terminal state.
    #[must_use]
    pub fn done(&self) -> bool {
        self.handle.done()
    }

    /// Requests cooperative cancellation.
    pub fn cancel(&self) -> bool {
        self.handle.cancel()
    }

    /// The task's result. Available only in the completed state.
    pub fn result(&self) -> Result<T, FutureError>
    where
        T: Clone,
    {
        self.handle.result()
    }

    /// The marshalled exception. Available only in the failed state.
    pub fn exception(&self) -> Result<MarshalledException, FutureError> {
        self.handle.exception()
    }

    /// Installs the observer notified of state changes.
    pub fn observe(&self, observer: impl FnMut(FutureEvent) + 'static) {
        self.handle.observe(observer);
    }

    /// Takes the next delivered progress value, if any.
    pub fn next_progress(&self) -> Option<P> {
        self.reports.borrow_mut().pop_front()
    }
}

struct SinkReporter<'cx, 'task, P> {
    cx: &'cx mut TaskContext<'task>,
    _progress: PhantomData<fn(P)>,
}

impl<P: Send + 'static> ProgressReporter<P> for SinkReporter<'_, '_, P> {
    fn report(&mut self, progress: P) -> Result<(), Cancelled> {
        if self.cx.cancelled() {
            return Err(Cancelled);
        }
        if let Err(error) = self.cx.send(Box::new(progress)) {
            tracing::error!(%error, "progress report undeliverable");
        }
        Ok(())
    }
}

struct ProgressRunnable<T, P> {
    body: Option<ProgressBody<T, P>>,
}

impl<T, P> Runnable for ProgressRunnable<T, P>
where
    T: Send + 'static,
    P: Send + 'static,
{
    fn run(&mut self, cx: &mut TaskContext<'_>) -> RunOutcome {
        let Some(body) = self.body.take() else {
            return RunOutcome::Raised(MarshalledException::machinery(
                "task body already consumed",
            ));
        };
        let result = catch_unwind(AssertUnwindSafe(|| {
            let mut reporter = SinkReporter {
                cx,
                _progress: PhantomData,
            };
            body(&mut reporter)
        }));
        classify(result)
    }
}

/// Maps a caught body outcome onto the message protocol: a cooperative
/// [`Cancelled`] unwind is orderly, anything else raised is a failure.
pub(crate) fn classify<T: Send + 'static>(
    result: Result<Result<T, BoxError>, Box<dyn std::any::Any + Send>>,
) -> RunOutcome {
    match result {
        Ok(Ok(value)) => RunOutcome::Returned(Box::new(value)),
        Ok(Err(error)) if error.is::<Cancelled>() => RunOutcome::Cancelled,
        Ok(Err(error)) => RunOutcome::Raised(MarshalledException::from_dyn(&*error)),
        Err(panic) => RunOutcome::Raised(MarshalledException::from_panic(panic.as_ref())),
    }
}
