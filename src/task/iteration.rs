//! Background iterations streaming items to the foreground.

use crate::cancellation::CancelSource;
use crate::errors::{FutureError, SendError};
use crate::exception::MarshalledException;
use crate::future::{FutureEvent, FutureHandle};
use crate::states::FutureState;
use crate::task::{RunOutcome, Runnable, TaskContext, TaskParts, TaskSpecification};
use std::collections::VecDeque;
use std::cell::RefCell;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::Rc;

/// Runs an iterator on a worker, streaming each item back as it is
/// produced.
///
/// The factory builds the iterator on the worker, so an expensive or
/// blocking construction never touches the foreground. Cancellation is
/// polled before every `next` call.
pub struct BackgroundIteration<F> {
    factory: F,
}

impl<F, I> BackgroundIteration<F>
where
    F: FnOnce() -> I + Send + 'static,
    I: IntoIterator,
    I::Item: Send + 'static,
{
    /// Wraps an iterator factory.
    pub fn new(factory: F) -> Self {
        Self { factory }
    }
}

impl<F, I> TaskSpecification for BackgroundIteration<F>
where
    F: FnOnce() -> I + Send + 'static,
    I: IntoIterator,
    I::Item: Send + 'static,
{
    type Future = IterationFuture<I::Item>;

    fn build(self, cancel: CancelSource) -> TaskParts<Self::Future> {
        let handle = FutureHandle::<()>::new(cancel);
        let items = Rc::new(RefCell::new(VecDeque::new()));
        let inbox = Rc::clone(&items);
        handle.with_core(|core| {
            core.set_custom_handler(Box::new(move |payload| {
                match payload.downcast::<I::Item>() {
                    Ok(item) => {
                        inbox.borrow_mut().push_back(*item);
                        Ok(())
                    }
                    Err(_) => Err(FutureError::PayloadType),
                }
            }));
        });
        TaskParts {
            managed: handle.managed(),
            handler: handle.message_handler(),
            runnable: Box::new(IterationRunnable {
                factory: Some(self.factory),
            }),
            future: IterationFuture { handle, items },
        }
    }
}

/// Future returned by a [`BackgroundIteration`] submission.
///
/// Items accumulate as the router delivers them; drain them with
/// [`next_item`](Self::next_item). Items already delivered stay
/// available after the future is done or cancelled.
pub struct IterationFuture<T> {
    handle: FutureHandle<()>,
    items: Rc<RefCell<VecDeque<T>>>,
}

impl<T> Clone for IterationFuture<T> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
            items: Rc::clone(&self.items),
        }
    }
}

impl<T> IterationFuture<T> {
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

    /// Whether the iteration has reached a terminal state.
    #[must_use]
    pub fn done(&self) -> bool {
        self.handle.done()
    }

    /// Requests cooperative cancellation.
    pub fn cancel(&self) -> bool {
        self.handle.cancel()
    }

    /// The marshalled exception. Available only in the failed state.
    pub fn exception(&self) -> Result<MarshalledException, FutureError> {
        self.handle.exception()
    }

    /// Installs the observer notified of state changes.
    pub fn observe(&self, observer: impl FnMut(FutureEvent) + 'static) {
        self.handle.observe(observer);
    }

    /// Takes the next delivered item, if any.
    pub fn next_item(&self) -> Option<T> {
        self.items.borrow_mut().pop_front()
    }

    /// Number of delivered items not yet taken.
    #[must_use]
    pub fn pending_items(&self) -> usize {
        self.items.borrow().len()
    }
}

struct IterationRunnable<F> {
    factory: Option<F>,
}

impl<F, I> Runnable for IterationRunnable<F>
where
    F: FnOnce() -> I + Send + 'static,
    I: IntoIterator,
    I::Item: Send + 'static,
{
    fn run(&mut self, cx: &mut TaskContext<'_>) -> RunOutcome {
        let Some(factory) = self.factory.take() else {
            return RunOutcome::Raised(MarshalledException::machinery(
                "task body already consumed",
            ));
        };
        let result = catch_unwind(AssertUnwindSafe(|| -> Result<RunOutcome, SendError> {
            let mut items = factory().into_iter();
            loop {
                if cx.cancelled() {
                    return Ok(RunOutcome::Cancelled);
                }
                match items.next() {
                    Some(item) => cx.send(Box::new(item))?,
                    None => return Ok(RunOutcome::Returned(Box::new(()))),
                }
            }
        }));
        match result {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(error)) => RunOutcome::Raised(MarshalledException::machinery(
                &format!("item delivery failed: {error}"),
            )),
            Err(panic) => {
                RunOutcome::Raised(MarshalledException::from_panic(panic.as_ref()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancellation::CancelSource;
    use crate::message::TaskMessage;
    use crate::task::test_support::{RecordingSink, run_direct};

    fn built(
        factory: impl FnOnce() -> Vec<u32> + Send + 'static,
    ) -> (IterationFuture<u32>, crate::router::MessageHandler) {
        let spec = BackgroundIteration::new(factory);
        let parts = spec.build(CancelSource::new());
        let handler = parts.future.handle.message_handler();
        (parts.future, handler)
    }

    #[test]
    fn delivered_items_queue_in_order() {
        let (future, mut handler) = built(|| vec![10, 20, 30]);
        handler(TaskMessage::Started).unwrap();
        for item in [10u32, 20, 30] {
            handler(TaskMessage::Sent(Box::new(item))).unwrap();
        }
        handler(TaskMessage::Returned(Box::new(()))).unwrap();

        assert!(future.done());
        assert_eq!(future.state(), FutureState::Completed);
        assert_eq!(future.next_item(), Some(10));
        assert_eq!(future.next_item(), Some(20));
        assert_eq!(future.next_item(), Some(30));
        assert_eq!(future.next_item(), None);
    }

    #[test]
    fn mistyped_item_is_a_fault() {
        let (_future, mut handler) = built(Vec::new);
        handler(TaskMessage::Started).unwrap();
        assert_eq!(
            handler(TaskMessage::Sent(Box::new("wrong"))).unwrap_err(),
            FutureError::PayloadType
        );
    }

    #[test]
    fn runnable_stops_at_cancellation_checkpoint() {
        let source = CancelSource::new();
        let token = source.token();
        source.request();

        let mut runnable = IterationRunnable {
            factory: Some(|| 0u32..1_000_000),
        };
        let mut sink = RecordingSink::default();
        let outcome = run_direct(&mut runnable, &token, &mut sink);
        assert!(matches!(outcome, RunOutcome::Cancelled));
        assert!(sink.custom.is_empty());
    }

    #[test]
    fn iterator_panic_is_marshalled() {
        let token = CancelSource::new().token();
        let mut runnable = IterationRunnable {
            factory: Some(|| {
                (0u32..).map(|n| {
                    assert!(n < 2, "iterator blew up");
                    n
                })
            }),
        };
        let mut sink = RecordingSink::default();
        let RunOutcome::Raised(exception) = run_direct(&mut runnable, &token, &mut sink)
        else {
            panic!("expected a raised outcome");
        };
        assert_eq!(exception.exception_type, "panic");
        assert_eq!(sink.custom.len(), 2);
    }
}
