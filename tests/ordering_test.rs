//! Posts from one thread to one target arrive in posting order for every serial affinity.

mod common;

use async_event_bus::{ContextThread, EventBus};
use common::*;
use std::sync::Arc;

const POSTS: usize = 10_000;

fn post_sequence<const AFFINITY: u8>(bus: &EventBus, recorder: &Arc<SequenceRecorder<AFFINITY>>) {
    for sequence in 0..POSTS {
        bus.post_to_target(OrderPlaced::numbered(sequence), recorder);
    }
    assert!(
        wait_until(PATIENCE * 3, || recorder.len() == POSTS),
        "only {} of {POSTS} deliveries arrived",
        recorder.len()
    );
    assert_eq!(*recorder.sequences.lock(), (0..POSTS).collect::<Vec<_>>());
}

#[test]
fn test_caller_thread_preserves_post_order() {
    let bus = EventBus::named("order-caller").unwrap();
    let recorder = Arc::new(CallerRecorder::default());
    bus.register(&recorder).unwrap();

    post_sequence(&bus, &recorder);
    assert_eq!(recorder.last_thread().unwrap(), "order-caller-dispatch");
}

#[test]
fn test_dispatch_thread_preserves_post_order() {
    let bus = EventBus::named("order-dispatch").unwrap();
    let recorder = Arc::new(DispatchRecorder::default());
    bus.register(&recorder).unwrap();

    post_sequence(&bus, &recorder);
}

#[test]
fn test_as_registered_preserves_post_order() {
    let bus = EventBus::named("order-registered").unwrap();
    let recorder = Arc::new(RegisteredRecorder::default());

    let owner = ContextThread::spawn("order-owner").unwrap();
    let (done_tx, done_rx) = crossbeam::channel::bounded(1);
    let (register_bus, target) = (bus.clone(), Arc::clone(&recorder));
    owner
        .context()
        .run(move || {
            register_bus.register(&target).unwrap();
            let _ = done_tx.send(());
        })
        .unwrap();
    done_rx.recv().unwrap();

    post_sequence(&bus, &recorder);
    assert!(recorder.threads.lock().iter().all(|name| name == "order-owner"));
}

#[test]
fn test_main_preserves_post_order() {
    let bus = EventBus::named("order-main").unwrap();
    let recorder = Arc::new(MainRecorder::default());
    bus.register(&recorder).unwrap();

    post_sequence(&bus, &recorder);
}

#[test]
fn test_sends_from_one_thread_preserve_order_on_dispatch_thread() {
    let bus = EventBus::named("order-send").unwrap();
    let recorder = Arc::new(DispatchRecorder::default());
    bus.register(&recorder).unwrap();

    for sequence in 0..1_000 {
        bus.send(OrderPlaced::numbered(sequence));
    }
    assert!(wait_until(PATIENCE, || recorder.len() == 1_000));
    assert_eq!(*recorder.sequences.lock(), (0..1_000).collect::<Vec<_>>());
}
