//! Foreman: cancellable background tasks with typed message routing to a
//! single foreground consumer.
//!
//! # Overview
//!
//! Foreman runs long work off the foreground thread and feeds the results
//! back as messages. Each submitted task gets a future on the foreground
//! and a wrapped job on a worker; the job reports its lifecycle and any
//! custom payloads over a dedicated pipe, and a router delivers those
//! messages to the future on the consumer thread. Futures never block and
//! never change state behind the consumer's back.
//!
//! # Core Guarantees
//!
//! - **One final message**: every task ends in exactly one of returned,
//!   raised, or abandoned; the future's terminal state follows from it
//! - **Cooperative cancellation**: cancelling sets a flag the task polls;
//!   a cancelled task's late result or failure is discarded, never lost
//!   into a wrong state
//! - **Ordered delivery**: messages on one pipe arrive in send order
//! - **Loud protocol faults**: a message outside the legal transitions of
//!   a future's state machine is an error, not a silent drop
//! - **Non-blocking sends**: queues are unbounded; a worker never stalls
//!   on a slow foreground
//!
//! # Module Structure
//!
//! - [`states`]: externally visible state enums and their projections
//! - [`message`]: task messages, pipe ids, and wire envelopes
//! - [`exception`]: marshalled exceptions crossing thread or process
//!   boundaries
//! - [`cancellation`]: the cancel source/token pair
//! - [`channel`]: per-task pipes and the background sink trait
//! - [`future`]: the foreground future state machine
//! - [`notify`]: the ping primitive that wakes the consumer
//! - [`router`]: thread and process message routers
//! - [`pool`]: worker pools
//! - [`task`]: the task wrapper and the four task kinds
//! - [`executor`]: the foreground executor tying it all together
//!
//! # Example
//!
//! ```no_run
//! use foreman::{Executor, FutureState};
//! use std::time::Duration;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut executor = Executor::new()?;
//! let future = executor.submit_call(|| 6 * 7)?;
//!
//! let probe = future.clone();
//! executor.run_until(move || probe.done(), Duration::from_secs(5))?;
//! assert_eq!(future.state(), FutureState::Completed);
//! assert_eq!(future.result()?, 42);
//!
//! executor.shutdown(Duration::from_secs(5))?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::doc_markdown)]
#![cfg_attr(test, allow(clippy::redundant_clone))]

pub mod cancellation;
pub mod channel;
pub mod errors;
pub mod exception;
pub mod executor;
pub mod future;
pub mod message;
pub mod notify;
pub mod pool;
pub mod router;
pub mod states;
pub mod task;

pub use cancellation::{CancelSource, CancelToken, Cancelled};
pub use channel::{MessageSink, Receiver, Sender};
pub use errors::{
    ExecutorError, FutureError, PoolError, PumpError, RouterError, SendError, TimeoutError,
};
pub use exception::MarshalledException;
pub use executor::Executor;
pub use future::{FutureEvent, FutureHandle, FutureObserver};
pub use message::{ConnectionId, MessageKind, Payload, TaskMessage};
pub use notify::{CondvarPingee, Pingee, Pinger};
pub use pool::{Job, ThreadPool, WorkerPool};
pub use router::{
    Delivery, Dispatch, MessageHandler, ProcessRouter, ProcessSender, RouteReport,
    ThreadRouter,
};
pub use states::{ExecutorState, FutureState, SenderState};
pub use task::{
    BackgroundCall, BackgroundIteration, BackgroundProgress, BackgroundSteps, BoxError,
    CallFuture, IterationFuture, ProgressFuture, ProgressReporter, RunOutcome, Runnable,
    StepsFuture, StepsInfo, StepsReporter, TaskContext, TaskParts, TaskSpecification,
    run_task,
};
