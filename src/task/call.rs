//! Plain background calls.

use crate::cancellation::CancelSource;
use crate::exception::MarshalledException;
use crate::future::FutureHandle;
use crate::task::{BoxError, RunOutcome, Runnable, TaskContext, TaskParts, TaskSpecification};
use std::panic::{AssertUnwindSafe, catch_unwind};

/// Future returned by a [`BackgroundCall`] submission.
pub type CallFuture<T> = FutureHandle<T>;

type CallBody<T> = Box<dyn FnOnce() -> Result<T, MarshalledException> + Send>;

/// Runs a closure once on a worker and delivers its value.
///
/// A plain call never observes its cancellation token; cancelling one
/// only disowns the eventual outcome.
pub struct BackgroundCall<T> {
    body: CallBody<T>,
}

impl<T: Send + 'static> BackgroundCall<T> {
    /// A call that cannot fail except by panicking.
    pub fn new(body: impl FnOnce() -> T + Send + 'static) -> Self {
        Self {
            body: Box::new(|| Ok(body())),
        }
    }

    /// A call whose error is marshalled into the future's failure.
    pub fn fallible(
        body: impl FnOnce() -> Result<T, BoxError> + Send + 'static,
    ) -> Self {
        Self {
            body: Box::new(|| {
                body().map_err(|error| MarshalledException::from_dyn(&*error))
            }),
        }
    }
}

impl<T: Send + 'static> TaskSpecification for BackgroundCall<T> {
    type Future = CallFuture<T>;

    fn build(self, cancel: CancelSource) -> TaskParts<Self::Future> {
        let future = FutureHandle::new(cancel);
        TaskParts {
            managed: future.managed(),
            handler: future.message_handler(),
            runnable: Box::new(CallRunnable {
                body: Some(self.body),
            }),
            future,
        }
    }
}

struct CallRunnable<T> {
    body: Option<CallBody<T>>,
}

impl<T: Send + 'static> Runnable for CallRunnable<T> {
    fn run(&mut self, _cx: &mut TaskContext<'_>) -> RunOutcome {
        let Some(body) = self.body.take() else {
            return RunOutcome::Raised(MarshalledException::machinery(
                "task body already consumed",
            ));
        };
        match catch_unwind(AssertUnwindSafe(body)) {
            Ok(Ok(value)) => RunOutcome::Returned(Box::new(value)),
            Ok(Err(exception)) => RunOutcome::Raised(exception),
            Err(panic) => RunOutcome::Raised(MarshalledException::from_panic(panic.as_ref())),
        }
    }
}
