//! Foreground task state.
//!
//! A future owns the foreground view of one background task: its state
//! machine, eventual result or marshalled exception, and its half of
//! the cancellation pair. Futures never block; they change state only
//! when the router feeds them messages on the consumer thread, so
//! observers always fire there too.

use crate::cancellation::CancelSource;
use crate::errors::FutureError;
use crate::exception::MarshalledException;
use crate::message::{Payload, TaskMessage};
use crate::router::{Dispatch, MessageHandler};
use crate::states::{FutureState, InternalState};
use std::cell::RefCell;
use std::rc::Rc;

/// Change notification delivered to a future's observer.
///
/// `Cancellable` and `Done` each fire at most once over a future's
/// lifetime: cancellable starts true and can only become false, done
/// starts false and can only become true.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FutureEvent {
    /// The externally visible state changed.
    State {
        /// State before the message.
        from: FutureState,
        /// State after the message.
        to: FutureState,
    },
    /// Whether `cancel` can still do anything.
    Cancellable(bool),
    /// Whether the future has reached a terminal state.
    Done(bool),
}

/// Observer callback for state changes.
pub type FutureObserver = Box<dyn FnMut(FutureEvent)>;

pub(crate) type CustomHandler = Box<dyn FnMut(Payload) -> Result<(), FutureError>>;

/// State machine and storage behind every future handle.
pub(crate) struct FutureCore<T> {
    internal: InternalState,
    result: Option<T>,
    exception: Option<MarshalledException>,
    cancel: Option<CancelSource>,
    observer: Option<FutureObserver>,
    on_custom: Option<CustomHandler>,
}

impl<T: 'static> FutureCore<T> {
    pub(crate) fn new(cancel: CancelSource) -> Self {
        Self {
            internal: InternalState::Waiting,
            result: None,
            exception: None,
            cancel: Some(cancel),
            observer: None,
            on_custom: None,
        }
    }

    pub(crate) fn set_custom_handler(&mut self, handler: CustomHandler) {
        self.on_custom = Some(handler);
    }

    pub(crate) fn set_observer(&mut self, observer: FutureObserver) {
        self.observer = Some(observer);
    }

    pub(crate) fn state(&self) -> FutureState {
        self.internal.external()
    }

    pub(crate) fn cancellable(&self) -> bool {
        self.cancel.is_some()
    }

    pub(crate) fn done(&self) -> bool {
        self.state().is_done()
    }

    pub(crate) fn result(&self) -> Result<&T, FutureError> {
        match self.internal {
            InternalState::Completed => match self.result.as_ref() {
                Some(result) => Ok(result),
                None => Err(FutureError::PayloadType),
            },
            _ => Err(FutureError::ResultUnavailable { state: self.state() }),
        }
    }

    pub(crate) fn exception(&self) -> Result<&MarshalledException, FutureError> {
        match self.internal {
            InternalState::Failed => match self.exception.as_ref() {
                Some(exception) => Ok(exception),
                None => Err(FutureError::ExceptionUnavailable { state: self.state() }),
            },
            _ => Err(FutureError::ExceptionUnavailable { state: self.state() }),
        }
    }

    /// Requests cancellation if still possible.
    ///
    /// Returns `false` without effect when the future is no longer
    /// cancellable, so racing a task's natural completion is benign.
    pub(crate) fn cancel(&mut self) -> bool {
        let Some(source) = self.cancel.take() else {
            return false;
        };
        source.request();
        let next = match self.internal {
            InternalState::Waiting => InternalState::CancellingBeforeStart,
            InternalState::Executing => InternalState::CancellingAfterStart,
            // The source only survives in cancellable states.
            other => other,
        };
        self.transition(next);
        true
    }

    /// Applies one task message, returning whether it was final.
    ///
    /// Any message outside the legal transitions of the current state
    /// is a loud protocol fault: it means the worker pool violated the
    /// one-final-message contract or messages arrived out of order.
    pub(crate) fn receive(&mut self, message: TaskMessage) -> Result<bool, FutureError> {
        let next = match (self.internal, message) {
            (InternalState::Waiting, TaskMessage::Started) => InternalState::Executing,
            (InternalState::Waiting, TaskMessage::Raised(exception)) => {
                self.exception = Some(exception);
                InternalState::Failed
            }
            (InternalState::CancellingBeforeStart, TaskMessage::Started) => {
                InternalState::CancellingAfterStart
            }
            (InternalState::CancellingBeforeStart, TaskMessage::Abandoned) => {
                InternalState::CancelledAbandoned
            }
            (InternalState::Executing, TaskMessage::Returned(payload)) => {
                match payload.downcast::<T>() {
                    Ok(result) => self.result = Some(*result),
                    Err(_) => return Err(FutureError::PayloadType),
                }
                InternalState::Completed
            }
            (InternalState::Executing, TaskMessage::Raised(exception)) => {
                self.exception = Some(exception);
                InternalState::Failed
            }
            (InternalState::Executing, TaskMessage::Sent(payload)) => {
                match self.on_custom.as_mut() {
                    Some(handler) => handler(payload)?,
                    None => {
                        return Err(FutureError::ProtocolViolation {
                            message: crate::message::MessageKind::Sent,
                            state: self.state(),
                        });
                    }
                }
                return Ok(false);
            }
            (InternalState::CancellingAfterStart, TaskMessage::Returned(_)) => {
                InternalState::CancelledCompleted
            }
            (InternalState::CancellingAfterStart, TaskMessage::Raised(exception)) => {
                tracing::debug!(%exception, "discarding exception from cancelled task");
                InternalState::CancelledFailed
            }
            (InternalState::CancellingAfterStart, TaskMessage::Sent(_)) => {
                // Lands here when cancellation raced an in-flight custom
                // message; the task is already disowned.
                tracing::debug!("dropping custom message from cancelled task");
                return Ok(false);
            }
            (_, message) => {
                return Err(FutureError::ProtocolViolation {
                    message: message.kind(),
                    state: self.state(),
                });
            }
        };
        self.transition(next);
        Ok(self.done())
    }

    fn transition(&mut self, next: InternalState) {
        let from = self.internal.external();
        self.internal = next;
        let to = next.external();
        if !to.is_cancellable() {
            self.cancel = None;
        }
        if from == to {
            return;
        }
        if let Some(observer) = self.observer.as_mut() {
            observer(FutureEvent::State { from, to });
            if from.is_cancellable() != to.is_cancellable() {
                observer(FutureEvent::Cancellable(to.is_cancellable()));
            }
            if from.is_done() != to.is_done() {
                observer(FutureEvent::Done(to.is_done()));
            }
        }
    }
}

/// Cancellation-only view the executor keeps of every live future,
/// regardless of its result type.
pub(crate) trait ManagedFuture {
    fn cancellable(&self) -> bool;
    fn cancel(&mut self) -> bool;
}

impl<T: 'static> ManagedFuture for FutureCore<T> {
    fn cancellable(&self) -> bool {
        FutureCore::cancellable(self)
    }

    fn cancel(&mut self) -> bool {
        FutureCore::cancel(self)
    }
}

/// Shared foreground handle to one background task.
///
/// Handles are `!Send`: all futures live on the consumer thread that
/// drives the router.
pub struct FutureHandle<T> {
    core: Rc<RefCell<FutureCore<T>>>,
}

impl<T> Clone for FutureHandle<T> {
    fn clone(&self) -> Self {
        Self {
            core: Rc::clone(&self.core),
        }
    }
}

impl<T: 'static> FutureHandle<T> {
    pub(crate) fn new(cancel: CancelSource) -> Self {
        Self {
            core: Rc::new(RefCell::new(FutureCore::new(cancel))),
        }
    }

    pub(crate) fn with_core<R>(&self, f: impl FnOnce(&mut FutureCore<T>) -> R) -> R {
        f(&mut self.core.borrow_mut())
    }

    pub(crate) fn managed(&self) -> Rc<RefCell<dyn ManagedFuture>> {
        Rc::clone(&self.core) as Rc<RefCell<dyn ManagedFuture>>
    }

    /// Builds the router handler that feeds this future.
    pub(crate) fn message_handler(&self) -> MessageHandler {
        let core = Rc::clone(&self.core);
        Box::new(move |message| {
            let done = core.borrow_mut().receive(message)?;
            Ok(if done { Dispatch::Final } else { Dispatch::Continue })
        })
    }

    /// Current externally visible state.
    #[must_use]
    pub fn state(&self) -> FutureState {
        self.core.borrow().state()
    }

    /// Whether [`cancel`](Self::cancel) can still take effect.
    #[must_use]
    pub fn cancellable(&self) -> bool {
        self.core.borrow().cancellable()
    }

    /// Whether the future has reached a terminal state.
    #[must_use]
    pub fn done(&self) -> bool {
        self.core.borrow().done()
    }

    /// Requests cooperative cancellation.
    ///
    /// Returns `false` without effect when the future is no longer
    /// cancellable.
    pub fn cancel(&self) -> bool {
        self.core.borrow_mut().cancel()
    }

    /// The task's result. Available only in the completed state.
    pub fn result(&self) -> Result<T, FutureError>
    where
        T: Clone,
    {
        self.core.borrow().result().cloned()
    }

    /// The marshalled exception. Available only in the failed state.
    pub fn exception(&self) -> Result<MarshalledException, FutureError> {
        self.core.borrow().exception().cloned()
    }

    /// Installs the observer notified of state changes.
    ///
    /// Observers run on the consumer thread, inside message routing.
    pub fn observe(&self, observer: impl FnMut(FutureEvent) + 'static) {
        self.core.borrow_mut().set_observer(Box::new(observer));
    }
}
