//! Router behavior under concurrent producers.

mod common;

use foreman::channel::MessageSink;
use foreman::notify::CondvarPingee;
use foreman::router::{Dispatch, ThreadRouter};
use foreman::{PumpError, TaskMessage};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

const PIPES: usize = 32;
const MESSAGES: u32 = 64;

#[test]
fn concurrent_pipes_never_cross_talk() {
    common::init_tracing();
    let mut router = ThreadRouter::new(Box::new(CondvarPingee::new()));
    router.start().unwrap();

    let received: Rc<RefCell<HashMap<usize, Vec<u32>>>> =
        Rc::new(RefCell::new(HashMap::new()));
    let finals = Rc::new(RefCell::new(0usize));

    let mut workers = Vec::new();
    for pipe in 0..PIPES {
        let (mut sender, receiver) = router.pipe().unwrap();
        let sink = Rc::clone(&received);
        let done = Rc::clone(&finals);
        router
            .bind(
                receiver,
                Box::new(move |message| match message {
                    TaskMessage::Started => Ok(Dispatch::Continue),
                    TaskMessage::Sent(payload) => {
                        let value = *payload.downcast::<u32>().unwrap();
                        sink.borrow_mut().entry(pipe).or_default().push(value);
                        Ok(Dispatch::Continue)
                    }
                    TaskMessage::Returned(_) => {
                        *done.borrow_mut() += 1;
                        Ok(Dispatch::Final)
                    }
                    other => panic!("unexpected message {other:?}"),
                }),
            )
            .unwrap();

        workers.push(std::thread::spawn(move || {
            sender.start().unwrap();
            sender.send_started().unwrap();
            for value in 0..MESSAGES {
                sender.send_custom(Box::new(value)).unwrap();
            }
            sender.send_returned(Box::new(())).unwrap();
            sender.stop().unwrap();
        }));
    }

    let progress = Rc::clone(&finals);
    router
        .route_until(move || *progress.borrow() == PIPES, Duration::from_secs(30))
        .unwrap();

    for worker in workers {
        worker.join().unwrap();
    }
    let received = received.borrow();
    assert_eq!(received.len(), PIPES);
    let expected: Vec<u32> = (0..MESSAGES).collect();
    for values in received.values() {
        assert_eq!(*values, expected, "per-pipe order must be send order");
    }
    router.stop().unwrap();
}

#[test]
fn route_until_honours_its_deadline_despite_constant_traffic() {
    common::init_tracing();
    let mut router = ThreadRouter::new(Box::new(CondvarPingee::new()));
    router.start().unwrap();

    let (mut sender, receiver) = router.pipe().unwrap();
    router
        .bind(receiver, Box::new(|_| Ok(Dispatch::Continue)))
        .unwrap();

    // A producer that keeps the consumer waking up. Each wakeup must
    // shrink the remaining budget; with a fresh timeout per wakeup this
    // call would never return.
    let running = Arc::new(AtomicBool::new(true));
    let producer_running = Arc::clone(&running);
    let producer = std::thread::spawn(move || {
        sender.start().unwrap();
        sender.send_started().unwrap();
        while producer_running.load(Ordering::Relaxed) {
            sender.send_custom(Box::new(0u8)).unwrap();
            std::thread::sleep(Duration::from_millis(10));
        }
        sender.send_returned(Box::new(())).unwrap();
        sender.stop().unwrap();
    });

    let timeout = Duration::from_millis(200);
    let started = Instant::now();
    let result = router.route_until(|| false, timeout);
    let elapsed = started.elapsed();

    running.store(false, Ordering::Relaxed);
    producer.join().unwrap();

    assert!(matches!(result, Err(PumpError::Timeout(_))));
    assert!(elapsed >= timeout, "returned early after {elapsed:?}");
    assert!(elapsed < timeout * 10, "overran to {elapsed:?}");
    router.stop().unwrap();
}
