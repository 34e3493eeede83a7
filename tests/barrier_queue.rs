// Barrier queue integration tests: epoch completion, release, and multi-producer ordering.
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use tickmerge::api::BarrierQueue;

#[test]
fn epoch_completes_on_last_mark_and_reset_releases_waiters() {
    let producers = 4;
    let queue = Arc::new(BarrierQueue::<u32>::new(producers));
    let mut consumer = queue.consumer().expect("consumer");
    let released = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..producers - 1 {
        let queue = Arc::clone(&queue);
        let released = Arc::clone(&released);
        handles.push(thread::spawn(move || {
            queue.finish_epoch();
            released.fetch_add(1, Ordering::SeqCst);
        }));
    }

    while queue.done_count() < producers - 1 {
        thread::yield_now();
    }
    assert!(!queue.is_epoch_complete());
    thread::sleep(Duration::from_millis(20));
    assert_eq!(released.load(Ordering::SeqCst), 0);

    let ticket = queue.mark_producer_epoch_done();
    assert!(queue.is_epoch_complete());

    consumer.reset_epoch();
    assert!(!queue.is_epoch_complete());
    queue.wait_for_epoch_reset(ticket);

    for handle in handles {
        handle.join().expect("join");
    }
    assert_eq!(released.load(Ordering::SeqCst), producers - 1);
    assert_eq!(queue.epoch(), 1);
}

#[test]
fn each_drained_epoch_holds_exactly_one_bucket() {
    let producers = 3u64;
    let epochs = 5u64;
    let per_epoch = 40u64;
    let queue = Arc::new(BarrierQueue::<(u64, u64)>::new(producers as usize));
    let mut consumer = queue.consumer().expect("consumer");

    let mut handles = Vec::new();
    for producer in 0..producers {
        let queue = Arc::clone(&queue);
        handles.push(thread::spawn(move || {
            let _registration = queue.registration();
            for epoch in 0..epochs {
                if epoch > 0 {
                    queue.finish_epoch();
                }
                for i in 0..per_epoch {
                    queue.enqueue((epoch, producer * 1000 + i));
                }
            }
        }));
    }

    let mut seen_epochs = Vec::new();
    loop {
        let batch = consumer.drain_epoch();
        if let Some((bucket, _)) = batch.records.first() {
            assert!(batch.records.iter().all(|(b, _)| b == bucket));
            assert_eq!(batch.records.len() as u64, producers * per_epoch);
            seen_epochs.push(*bucket);
        }
        if batch.closed {
            break;
        }
        consumer.reset_epoch();
    }

    for handle in handles {
        handle.join().expect("join");
    }
    assert_eq!(seen_epochs, (0..epochs).collect::<Vec<_>>());
}

#[test]
fn producer_order_is_preserved_per_producer() {
    let queue = Arc::new(BarrierQueue::<(usize, usize)>::new(2));
    let mut consumer = queue.consumer().expect("consumer");

    let handles: Vec<_> = (0..2)
        .map(|producer| {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                let _registration = queue.registration();
                for i in 0..1000 {
                    queue.enqueue((producer, i));
                }
            })
        })
        .collect();

    let mut next = [0usize; 2];
    while let Some((producer, i)) = consumer.dequeue_until_closed() {
        assert_eq!(i, next[producer]);
        next[producer] += 1;
    }
    for handle in handles {
        handle.join().expect("join");
    }
    assert_eq!(next, [1000, 1000]);
}

#[test]
fn early_exit_does_not_stall_remaining_producers() {
    let queue = Arc::new(BarrierQueue::<u8>::new(2));
    let mut consumer = queue.consumer().expect("consumer");

    let short = {
        let queue = Arc::clone(&queue);
        thread::spawn(move || {
            let _registration = queue.registration();
            queue.enqueue(1);
        })
    };
    let long = {
        let queue = Arc::clone(&queue);
        thread::spawn(move || {
            let _registration = queue.registration();
            queue.enqueue(2);
            queue.finish_epoch();
            queue.enqueue(3);
        })
    };

    let first = consumer.drain_epoch();
    assert!(!first.closed);
    let mut first_records = first.records;
    first_records.sort_unstable();
    assert_eq!(first_records, [1, 2]);
    consumer.reset_epoch();

    let second = consumer.drain_epoch();
    assert!(second.closed);
    assert_eq!(second.records, [3]);

    short.join().expect("join");
    long.join().expect("join");
}
