//! Background buckets through the scheduler facade.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use weft::{Scheduler, SchedulerConfig};

fn scheduler() -> Scheduler {
    Scheduler::new(&SchedulerConfig::default()).expect("scheduler construction failed")
}

#[test]
fn background_work_runs_off_the_job_threads() {
    let scheduler = scheduler();
    let ran = Arc::new(AtomicU32::new(0));
    let inner = Arc::clone(&ran);
    scheduler.background().schedule("assets", "load", move |_| {
        inner.fetch_add(1, Ordering::SeqCst);
    });
    // Foreground work is unaffected while the bucket runs.
    let fg = Arc::new(AtomicU32::new(0));
    let fg_inner = Arc::clone(&fg);
    scheduler.spawn("foreground", move |_| {
        fg_inner.fetch_add(1, Ordering::SeqCst);
    });
    scheduler.flush();
    assert_eq!(fg.load(Ordering::SeqCst), 1);
    scheduler.shutdown().unwrap();
    assert_eq!(ran.load(Ordering::SeqCst), 1);
}

#[test]
fn jobs_can_hand_results_back_through_counters() {
    let scheduler = scheduler();
    let loaded = scheduler.create_counter("asset-loaded", 1);
    let payload = Arc::new(AtomicU32::new(0));

    let bg_payload = Arc::clone(&payload);
    let bg_scheduler = scheduler.clone();
    scheduler.background().schedule("assets", "slow-load", move |token| {
        thread::sleep(Duration::from_millis(10));
        if !token.is_cancelled() {
            bg_payload.store(7, Ordering::SeqCst);
            bg_scheduler.signal_counter(loaded, 1);
        }
    });

    // A foreground job suspends until the background load lands.
    let consumer_payload = Arc::clone(&payload);
    let consumer = scheduler.clone();
    let saw = Arc::new(AtomicU32::new(0));
    let saw_inner = Arc::clone(&saw);
    scheduler.spawn("consume-asset", move |_| {
        consumer.wait_for_counter_and_release(loaded);
        saw_inner.store(consumer_payload.load(Ordering::SeqCst), Ordering::SeqCst);
    });

    scheduler.flush();
    assert_eq!(saw.load(Ordering::SeqCst), 7);
    scheduler.shutdown().unwrap();
}

#[test]
fn cancelled_job_stops_at_its_next_checkpoint() {
    let scheduler = scheduler();
    let finished_cleanly = Arc::new(AtomicU32::new(0));
    let inner = Arc::clone(&finished_cleanly);
    let token = scheduler.background().schedule("sim", "long-run", move |token| {
        for _ in 0..1000 {
            if token.is_cancelled() {
                inner.store(1, Ordering::SeqCst);
                return;
            }
            thread::sleep(Duration::from_millis(1));
        }
    });
    thread::sleep(Duration::from_millis(10));
    token.cancel();
    scheduler.shutdown().unwrap();
    assert_eq!(finished_cleanly.load(Ordering::SeqCst), 1);
}
