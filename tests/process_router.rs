//! Wire-path scenarios: typed payloads serialized across a
//! process-safe transport and routed back to foreground handlers.

mod common;

use foreman::channel::MessageSink;
use foreman::notify::CondvarPingee;
use foreman::router::{
    Dispatch, FramedReceiver, FramedSender, ProcessRouter, ProcessSender, memory_transport,
};
use foreman::task::{RunOutcome, Runnable, TaskContext, run_task};
use foreman::{CancelSource, MessageKind, TaskMessage};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

const LONG: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Tally {
    scanned: u64,
    matched: u64,
}

struct Scanner {
    haystack: Vec<u64>,
    needle: u64,
}

impl Runnable for Scanner {
    fn run(&mut self, cx: &mut TaskContext<'_>) -> RunOutcome {
        let mut tally = Tally {
            scanned: 0,
            matched: 0,
        };
        for value in &self.haystack {
            if cx.cancelled() {
                return RunOutcome::Cancelled;
            }
            tally.scanned += 1;
            if *value == self.needle {
                tally.matched += 1;
            }
            if tally.scanned % 2 == 0 && cx.send(Box::new(tally.scanned)).is_err() {
                return RunOutcome::Cancelled;
            }
        }
        RunOutcome::Returned(Box::new(tally))
    }
}

#[test]
fn worker_task_round_trips_through_the_wire() {
    common::init_tracing();
    let (control, stream) = memory_transport();
    let mut router = ProcessRouter::new(control, stream, Box::new(CondvarPingee::new()));
    router.start().unwrap();

    let (sender, receiver) = router.pipe::<Tally, u64>().unwrap();
    let seen = Rc::new(RefCell::new(Vec::new()));
    let result = Rc::new(RefCell::new(None));
    let seen_sink = Rc::clone(&seen);
    let result_sink = Rc::clone(&result);
    router
        .bind(
            receiver,
            Box::new(move |message| match message {
                TaskMessage::Started => Ok(Dispatch::Continue),
                TaskMessage::Sent(payload) => {
                    seen_sink
                        .borrow_mut()
                        .push(*payload.downcast::<u64>().unwrap());
                    Ok(Dispatch::Continue)
                }
                TaskMessage::Returned(payload) => {
                    *result_sink.borrow_mut() =
                        Some(*payload.downcast::<Tally>().unwrap());
                    Ok(Dispatch::Final)
                }
                other => panic!("unexpected message {other:?}"),
            }),
        )
        .unwrap();

    let source = CancelSource::new();
    let token = source.token();
    let worker = std::thread::spawn(move || {
        run_task(
            sender,
            &token,
            Box::new(Scanner {
                haystack: vec![3, 1, 4, 1, 5, 9],
                needle: 1,
            }),
        );
    });

    let done = Rc::clone(&result);
    router
        .route_until(move || done.borrow().is_some(), LONG)
        .unwrap();
    worker.join().unwrap();

    assert_eq!(*seen.borrow(), [2, 4, 6]);
    assert_eq!(
        *result.borrow(),
        Some(Tally {
            scanned: 6,
            matched: 2,
        })
    );
    router.stop().unwrap();
}

#[test]
fn pre_start_cancellation_crosses_the_wire_as_abandoned() {
    common::init_tracing();
    let (control, stream) = memory_transport();
    let mut router = ProcessRouter::new(control, stream, Box::new(CondvarPingee::new()));
    router.start().unwrap();

    let (sender, receiver) = router.pipe::<Tally, u64>().unwrap();
    let kinds = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&kinds);
    router
        .bind(
            receiver,
            Box::new(move |message| {
                let kind = message.kind();
                sink.borrow_mut().push(kind);
                Ok(if kind.is_final() {
                    Dispatch::Final
                } else {
                    Dispatch::Continue
                })
            }),
        )
        .unwrap();

    let source = CancelSource::new();
    source.request();
    let token = source.token();
    run_task(
        sender,
        &token,
        Box::new(Scanner {
            haystack: vec![1, 2, 3],
            needle: 1,
        }),
    );

    let progress = Rc::clone(&kinds);
    router
        .route_until(move || !progress.borrow().is_empty(), LONG)
        .unwrap();
    assert_eq!(*kinds.borrow(), [MessageKind::Abandoned]);
    router.stop().unwrap();
}

#[test]
fn framed_transport_carries_a_full_task_lifecycle() {
    common::init_tracing();
    let (read_half, write_half) = std::io::pipe().unwrap();
    let control = FramedSender::new(write_half.try_clone().unwrap());
    let mut router = ProcessRouter::new(
        control,
        FramedReceiver::new(read_half),
        Box::new(CondvarPingee::new()),
    );
    router.start().unwrap();

    // The worker builds its own sender from the connection id, the way
    // a spawned process would after receiving it at startup.
    let receiver = router.register_pipe::<u64, String>().unwrap();
    let connection_id = receiver.connection_id();
    let kinds = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&kinds);
    router
        .bind(
            receiver,
            Box::new(move |message| {
                let kind = message.kind();
                if let TaskMessage::Returned(payload) = message {
                    assert_eq!(*payload.downcast::<u64>().unwrap(), 128);
                }
                sink.borrow_mut().push(kind);
                Ok(if kind.is_final() {
                    Dispatch::Final
                } else {
                    Dispatch::Continue
                })
            }),
        )
        .unwrap();

    let worker = std::thread::spawn(move || {
        let mut sender: ProcessSender<u64, String, _> =
            ProcessSender::new(connection_id, FramedSender::new(write_half));
        sender.start().unwrap();
        sender.send_started().unwrap();
        sender
            .send_custom(Box::new("warming up".to_owned()))
            .unwrap();
        sender.send_returned(Box::new(128u64)).unwrap();
        sender.stop().unwrap();
    });

    let progress = Rc::clone(&kinds);
    router
        .route_until(
            move || progress.borrow().last().is_some_and(|kind| kind.is_final()),
            LONG,
        )
        .unwrap();
    worker.join().unwrap();

    assert_eq!(
        *kinds.borrow(),
        [MessageKind::Started, MessageKind::Sent, MessageKind::Returned]
    );
    router.stop().unwrap();
}
