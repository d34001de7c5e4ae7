//! Background tasks reporting named steps.
//!
//! A steps task is a progress task with a fixed reporting vocabulary:
//! an optional step count, a running step number, and a human-readable
//! message, kept up to date on the future as the task advances.

use crate::cancellation::{CancelSource, Cancelled};
use crate::errors::FutureError;
use crate::exception::MarshalledException;
use crate::future::{FutureEvent, FutureHandle};
use crate::states::FutureState;
use crate::task::progress::classify;
use crate::task::{
    BoxError, RunOutcome, Runnable, TaskContext, TaskParts, TaskSpecification,
};
use std::cell::RefCell;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::Rc;

/// Handed to a steps task body for reporting.
///
/// Every method is a cancellation checkpoint, failing with
/// [`Cancelled`] once the foreground has cancelled.
pub trait StepsReporter {
    /// Announces the work ahead.
    fn start(
        &mut self,
        total: Option<u64>,
        message: Option<String>,
    ) -> Result<(), Cancelled>;

    /// Marks one step done, optionally describing the next one.
    fn step(&mut self, message: Option<String>) -> Result<(), Cancelled>;

    /// Announces completion of the reported work.
    fn stop(&mut self, message: Option<String>) -> Result<(), Cancelled>;
}

pub(crate) enum StepEvent {
    Start {
        total: Option<u64>,
        message: Option<String>,
    },
    Advance {
        message: Option<String>,
    },
    Finish {
        message: Option<String>,
    },
}

type StepsBody<T> =
    Box<dyn FnOnce(&mut dyn StepsReporter) -> Result<T, BoxError> + Send>;

/// Runs a closure that reports its progress as discrete steps.
pub struct BackgroundSteps<T> {
    body: StepsBody<T>,
}

impl<T: Send + 'static> BackgroundSteps<T> {
    /// Wraps a steps-reporting closure.
    pub fn new(
        body: impl FnOnce(&mut dyn StepsReporter) -> Result<T, BoxError> + Send + 'static,
    ) -> Self {
        Self {
            body: Box::new(body),
        }
    }
}

impl<T: Send + 'static> TaskSpecification for BackgroundSteps<T> {
    type Future = StepsFuture<T>;

    fn build(self, cancel: CancelSource) -> TaskParts<Self::Future> {
        let handle = FutureHandle::<T>::new(cancel);
        let info = Rc::new(RefCell::new(StepsInfo::default()));
        let sink = Rc::clone(&info);
        handle.with_core(|core| {
            core.set_custom_handler(Box::new(move |payload| {
                match payload.downcast::<StepEvent>() {
                    Ok(event) => {
                        sink.borrow_mut().apply(*event);
                        Ok(())
                    }
                    Err(_) => Err(FutureError::PayloadType),
                }
            }));
        });
        TaskParts {
            managed: handle.managed(),
            handler: handle.message_handler(),
            runnable: Box::new(StepsRunnable {
                body: Some(self.body),
            }),
            future: StepsFuture { handle, info },
        }
    }
}

/// Snapshot of a steps task's reported position.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepsInfo {
    /// Steps completed so far.
    pub step: u64,
    /// Total steps, when the task announced one.
    pub total: Option<u64>,
    /// Most recent descriptive message.
    pub message: Option<String>,
}

impl StepsInfo {
    fn apply(&mut self, event: StepEvent) {
        match event {
            StepEvent::Start { total, message } => {
                self.step = 0;
                self.total = total;
                self.message = message;
            }
            StepEvent::Advance { message } => {
                self.step += 1;
                if message.is_some() {
                    self.message = message;
                }
            }
            StepEvent::Finish { message } => {
                if message.is_some() {
                    self.message = message;
                }
            }
        }
    }
}

/// Future returned by a [`BackgroundSteps`] submission.
pub struct StepsFuture<T> {
    handle: FutureHandle<T>,
    info: Rc<RefCell<StepsInfo>>,
}

impl<T> Clone for StepsFuture<T> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
            info: Rc::clone(&self.info),
        }
    }
}

impl<T: 'static> StepsFuture<T> {
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

    /// Latest reported position.
    #[must_use]
    pub fn info(&self) -> StepsInfo {
        self.info.borrow().clone()
    }
}

struct SinkStepsReporter<'cx, 'task> {
    cx: &'cx mut TaskContext<'task>,
}

impl SinkStepsReporter<'_, '_> {
    fn emit(&mut self, event: StepEvent) -> Result<(), Cancelled> {
        if self.cx.cancelled() {
            return Err(Cancelled);
        }
        if let Err(error) = self.cx.send(Box::new(event)) {
            tracing::error!(%error, "step report undeliverable");
        }
        Ok(())
    }
}

impl StepsReporter for SinkStepsReporter<'_, '_> {
    fn start(
        &mut self,
        total: Option<u64>,
        message: Option<String>,
    ) -> Result<(), Cancelled> {
        self.emit(StepEvent::Start { total, message })
    }

    fn step(&mut self, message: Option<String>) -> Result<(), Cancelled> {
        self.emit(StepEvent::Advance { message })
    }

    fn stop(&mut self, message: Option<String>) -> Result<(), Cancelled> {
        self.emit(StepEvent::Finish { message })
    }
}

struct StepsRunnable<T> {
    body: Option<StepsBody<T>>,
}

impl<T: Send + 'static> Runnable for StepsRunnable<T> {
    fn run(&mut self, cx: &mut TaskContext<'_>) -> RunOutcome {
        let Some(body) = self.body.take() else {
            return RunOutcome::Raised(MarshalledException::machinery(
                "task body already consumed",
            ));
        };
        let result = catch_unwind(AssertUnwindSafe(|| {
            let mut reporter = SinkStepsReporter { cx };
            body(&mut reporter)
        }));
        classify(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::TaskMessage;
    use crate::task::test_support::{RecordingSink, run_direct};

    #[test]
    fn reported_steps_update_the_future() {
        let spec = BackgroundSteps::<()>::new(|_| Ok(()));
        let parts = spec.build(CancelSource::new());
        let future = parts.future;
        let mut handler = future.handle.message_handler();

        handler(TaskMessage::Started).unwrap();
        handler(TaskMessage::Sent(Box::new(StepEvent::Start {
            total: Some(3),
            message: Some("indexing".to_owned()),
        })))
        .unwrap();
        assert_eq!(
            future.info(),
            StepsInfo {
                step: 0,
                total: Some(3),
                message: Some("indexing".to_owned()),
            }
        );

        handler(TaskMessage::Sent(Box::new(StepEvent::Advance { message: None })))
            .unwrap();
        handler(TaskMessage::Sent(Box::new(StepEvent::Advance {
            message: Some("writing".to_owned()),
        })))
        .unwrap();
        let info = future.info();
        assert_eq!(info.step, 2);
        assert_eq!(info.message.as_deref(), Some("writing"));

        handler(TaskMessage::Sent(Box::new(StepEvent::Finish {
            message: Some("done".to_owned()),
        })))
        .unwrap();
        handler(TaskMessage::Returned(Box::new(()))).unwrap();
        assert_eq!(future.state(), FutureState::Completed);
        assert_eq!(future.info().message.as_deref(), Some("done"));
    }

    #[test]
    fn reporter_emits_one_event_per_call() {
        let token = CancelSource::new().token();
        let mut runnable = StepsRunnable::<()> {
            body: Some(Box::new(|reporter| {
                reporter.start(Some(2), None)?;
                reporter.step(None)?;
                reporter.step(None)?;
                reporter.stop(None)?;
                Ok(())
            })),
        };
        let mut sink = RecordingSink::default();
        let outcome = run_direct(&mut runnable, &token, &mut sink);
        assert!(matches!(outcome, RunOutcome::Returned(_)));
        assert_eq!(sink.custom.len(), 4);
    }

    #[test]
    fn every_reporter_method_is_a_cancellation_checkpoint() {
        let source = CancelSource::new();
        let token = source.token();
        source.request();
        let mut runnable = StepsRunnable::<()> {
            body: Some(Box::new(|reporter| {
                reporter.step(None)?;
                panic!("unreachable past a failed report");
            })),
        };
        let mut sink = RecordingSink::default();
        let outcome = run_direct(&mut runnable, &token, &mut sink);
        assert!(matches!(outcome, RunOutcome::Cancelled));
        assert!(sink.custom.is_empty());
    }
}
