//! The foreground executor.
//!
//! An executor ties the pieces together: it owns a router and a worker
//! pool, turns task specifications into (future, job) pairs, and keeps
//! a cancellation handle on every future that has not yet received its
//! final message. It is single-threaded by construction and must be
//! driven from the thread that created it.

use crate::cancellation::CancelSource;
use crate::errors::{ExecutorError, TimeoutError};
use crate::future::ManagedFuture;
use crate::message::ConnectionId;
use crate::notify::{CondvarPingee, Pingee};
use crate::pool::{Job, ThreadPool, WorkerPool};
use crate::router::{Delivery, Dispatch, RouteReport, ThreadRouter};
use crate::states::ExecutorState;
use crate::task::{
    BackgroundCall, BackgroundIteration, BackgroundProgress, BackgroundSteps, BoxError,
    CallFuture, IterationFuture, ProgressFuture, ProgressReporter, StepsFuture,
    StepsReporter, TaskSpecification, run_task,
};
use std::collections::HashMap;
use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Observer callback for executor state changes.
pub type StateObserver = Box<dyn FnMut(ExecutorState)>;

/// Submits background tasks and routes their messages to futures.
pub struct Executor {
    state: ExecutorState,
    router: ThreadRouter,
    pool: Box<dyn WorkerPool>,
    owns_pool: bool,
    live: HashMap<ConnectionId, Rc<RefCell<dyn ManagedFuture>>>,
    observer: Option<StateObserver>,
}

impl Executor {
    /// A running executor with its own worker pool and a blocking
    /// notification primitive.
    pub fn new() -> Result<Self, ExecutorError> {
        Self::with_parts(None, Box::new(CondvarPingee::new()))
    }

    /// A running executor over a caller-supplied pool.
    ///
    /// The pool is shared: `stop` stops routing to it but does not shut
    /// it down.
    pub fn with_pool(pool: Box<dyn WorkerPool>) -> Result<Self, ExecutorError> {
        Self::with_parts(Some(pool), Box::new(CondvarPingee::new()))
    }

    /// A running executor with full control over pool and notification.
    ///
    /// Event-loop hosts pass a [`Pingee`] that posts to their loop and
    /// call [`pump`](Self::pump) from the resulting wakeup.
    pub fn with_parts(
        pool: Option<Box<dyn WorkerPool>>,
        pingee: Box<dyn Pingee>,
    ) -> Result<Self, ExecutorError> {
        let mut router = ThreadRouter::new(pingee);
        router.start()?;
        let owns_pool = pool.is_none();
        Ok(Self {
            state: ExecutorState::Running,
            router,
            pool: pool.unwrap_or_else(|| Box::new(ThreadPool::default())),
            owns_pool,
            live: HashMap::new(),
            observer: None,
        })
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ExecutorState {
        self.state
    }

    /// Whether new submissions are accepted.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state.is_running()
    }

    /// Whether all resources have been released.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.state.is_stopped()
    }

    /// Number of futures still awaiting their final message.
    #[must_use]
    pub fn live_tasks(&self) -> usize {
        self.live.len()
    }

    /// Installs the observer notified of lifecycle changes.
    pub fn observe(&mut self, observer: impl FnMut(ExecutorState) + 'static) {
        self.observer = Some(Box::new(observer));
    }

    /// Submits any task specification, returning its future.
    pub fn submit<S: TaskSpecification>(
        &mut self,
        specification: S,
    ) -> Result<S::Future, ExecutorError> {
        if !self.state.is_running() {
            return Err(ExecutorError::NotRunning { state: self.state });
        }
        let (sender, receiver) = self.router.pipe()?;
        let connection_id = receiver.connection_id();
        let source = CancelSource::new();
        let token = source.token();
        let parts = specification.build(source);
        self.router.bind(receiver, parts.handler)?;
        self.live.insert(connection_id, parts.managed);

        let runnable = parts.runnable;
        let job: Job = Box::new(move || run_task(sender, &token, runnable));
        if let Err(error) = self.pool.submit(job) {
            self.live.remove(&connection_id);
            self.router.close_pipe(receiver)?;
            return Err(error.into());
        }
        Ok(parts.future)
    }

    /// Submits a plain call.
    pub fn submit_call<T, F>(&mut self, body: F) -> Result<CallFuture<T>, ExecutorError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.submit(BackgroundCall::new(body))
    }

    /// Submits a call whose error becomes the future's failure.
    pub fn submit_fallible<T, F>(
        &mut self,
        body: F,
    ) -> Result<CallFuture<T>, ExecutorError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, BoxError> + Send + 'static,
    {
        self.submit(BackgroundCall::fallible(body))
    }

    /// Submits an iteration streaming its items back.
    pub fn submit_iteration<F, I>(
        &mut self,
        factory: F,
    ) -> Result<IterationFuture<I::Item>, ExecutorError>
    where
        F: FnOnce() -> I + Send + 'static,
        I: IntoIterator,
        I::Item: Send + 'static,
    {
        self.submit(BackgroundIteration::new(factory))
    }

    /// Submits a progress-reporting call.
    pub fn submit_progress<T, P, F>(
        &mut self,
        body: F,
    ) -> Result<ProgressFuture<T, P>, ExecutorError>
    where
        T: Send + 'static,
        P: Send + 'static,
        F: FnOnce(&mut dyn ProgressReporter<P>) -> Result<T, BoxError> + Send + 'static,
    {
        self.submit(BackgroundProgress::new(body))
    }

    /// Submits a steps-reporting call.
    pub fn submit_steps<T, F>(
        &mut self,
        body: F,
    ) -> Result<StepsFuture<T>, ExecutorError>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn StepsReporter) -> Result<T, BoxError> + Send + 'static,
    {
        self.submit(BackgroundSteps::new(body))
    }

    /// Routes one pending message, if any. Returns whether one was
    /// routed. Event-loop hosts call this once per wakeup burst.
    pub fn pump(&mut self) -> Result<bool, ExecutorError> {
        Ok(self.route_one()?.is_some())
    }

    /// Routes every message currently queued.
    pub fn drain(&mut self) -> Result<(), ExecutorError> {
        while self.route_one()?.is_some() {}
        Ok(())
    }

    /// Routes messages until `condition` holds or `timeout` passes.
    ///
    /// The condition usually watches future handles cloned before the
    /// call. On timeout the background keeps progressing; calling again
    /// resumes cleanly.
    pub fn run_until(
        &mut self,
        mut condition: impl FnMut() -> bool,
        timeout: Duration,
    ) -> Result<(), ExecutorError> {
        let started = Instant::now();
        let deadline = started + timeout;
        loop {
            while self.route_one()?.is_some() {
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
            self.router.wait(deadline - now);
        }
    }

    /// Begins shutdown: refuses new submissions and cancels every
    /// future that can still be cancelled.
    ///
    /// The executor reaches `Stopped` once the final message of every
    /// live task has been routed; keep pumping until then, or use
    /// [`shutdown`](Self::shutdown) to block for it.
    pub fn stop(&mut self) -> Result<(), ExecutorError> {
        if !self.state.is_running() {
            return Err(ExecutorError::NotRunning { state: self.state });
        }
        self.set_state(ExecutorState::Stopping);
        for future in self.live.values() {
            future.borrow_mut().cancel();
        }
        self.finish_stop_if_idle()
    }

    /// Stops and blocks until fully stopped or `timeout` passes.
    pub fn shutdown(&mut self, timeout: Duration) -> Result<(), ExecutorError> {
        let started = Instant::now();
        let deadline = started + timeout;
        if self.state.is_running() {
            self.stop()?;
        }
        loop {
            self.drain()?;
            if self.state.is_stopped() {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ExecutorError::ShutdownTimeout {
                    state: self.state,
                    live: self.live.len(),
                    timeout,
                    elapsed: now - started,
                });
            }
            self.router.wait(deadline - now);
        }
    }

    fn route_one(&mut self) -> Result<Option<RouteReport>, ExecutorError> {
        // Routing the last final message stops the router; later calls
        // in the same drain burst must see an empty queue, not an error.
        if self.state.is_stopped() {
            return Ok(None);
        }
        let report = self.router.route_message()?;
        if let Some(report) = &report {
            if report.delivery == Delivery::Delivered(Dispatch::Final) {
                self.live.remove(&report.connection_id);
                if self.state == ExecutorState::Stopping {
                    self.finish_stop_if_idle()?;
                }
            }
        }
        Ok(report)
    }

    fn finish_stop_if_idle(&mut self) -> Result<(), ExecutorError> {
        if self.state != ExecutorState::Stopping || !self.live.is_empty() {
            return Ok(());
        }
        if self.owns_pool {
            self.pool.shutdown();
        }
        self.router.stop()?;
        self.set_state(ExecutorState::Stopped);
        Ok(())
    }

    fn set_state(&mut self, state: ExecutorState) {
        if self.state == state {
            return;
        }
        tracing::debug!(from = %self.state, to = %state, "executor state change");
        self.state = state;
        if let Some(observer) = self.observer.as_mut() {
            observer(state);
        }
    }
}
