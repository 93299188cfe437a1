// Copyright 2025 the rhiza authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Integration tests for dispatch through contexts and queue threads.
//!
//! Work pended before a context runs, graceful versus immediate drains, and
//! time-delayed dispatch are all verified end to end against real threads.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use rhiza_core::{Context, QueueThread, Runnable, ShutdownMode, StopSignal, WorkerThread};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn test_queue_thread_processes_work_in_order() {
    init_logging();
    let root = Context::root_named("qt");
    let ops = Arc::new(QueueThread::new("ops"));
    root.add_runnable(Arc::clone(&ops) as Arc<dyn Runnable>);
    root.initiate();

    let (tx, rx) = mpsc::channel();
    for i in 0..10 {
        let tx = tx.clone();
        assert!(ops.pend(move || tx.send(i).unwrap()));
    }

    let got: Vec<i32> = (0..10)
        .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap())
        .collect();
    assert_eq!(got, (0..10).collect::<Vec<_>>(), "dispatch keeps FIFO order");

    root.signal_shutdown(true, ShutdownMode::Graceful);
    assert!(!ops.is_running());
}

#[test]
fn test_graceful_shutdown_drains_work_pended_before_start() {
    init_logging();
    let root = Context::root();
    let ops = Arc::new(QueueThread::new("drain"));
    root.add_runnable(Arc::clone(&ops) as Arc<dyn Runnable>);

    let count = Arc::new(AtomicUsize::new(0));
    for _ in 0..100 {
        let count = Arc::clone(&count);
        assert!(ops.pend(move || {
            count.fetch_add(1, Ordering::SeqCst);
        }));
    }

    root.initiate();
    root.signal_shutdown(true, ShutdownMode::Graceful);
    assert_eq!(
        count.load(Ordering::SeqCst),
        100,
        "graceful shutdown drains everything already pended"
    );
}

#[test]
fn test_immediate_shutdown_discards_queued_work() {
    init_logging();
    let root = Context::root();
    let ops = Arc::new(QueueThread::new("discard"));
    root.add_runnable(Arc::clone(&ops) as Arc<dyn Runnable>);

    let count = Arc::new(AtomicUsize::new(0));
    let (entered_tx, entered_rx) = mpsc::channel::<()>();
    let (gate_tx, gate_rx) = mpsc::channel::<()>();
    {
        let count = Arc::clone(&count);
        assert!(ops.pend(move || {
            entered_tx.send(()).unwrap();
            let _ = gate_rx.recv();
            count.fetch_add(1, Ordering::SeqCst);
        }));
    }
    for _ in 0..99 {
        let count = Arc::clone(&count);
        assert!(ops.pend(move || {
            count.fetch_add(1, Ordering::SeqCst);
        }));
    }

    root.initiate();
    // Wait until the worker is inside the gated item, then cut the queue
    // out from under it.
    entered_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    root.signal_shutdown(false, ShutdownMode::Immediate);
    gate_tx.send(()).unwrap();
    root.wait();

    assert_eq!(
        count.load(Ordering::SeqCst),
        1,
        "only the in-flight item survives an immediate shutdown"
    );
}

#[test]
fn test_near_delay_is_not_stuck_behind_far_delay() {
    init_logging();
    let root = Context::root();
    let timers = Arc::new(QueueThread::new("timers"));
    root.add_runnable(Arc::clone(&timers) as Arc<dyn Runnable>);
    root.initiate();

    let (tx, rx) = mpsc::channel();
    {
        let tx = tx.clone();
        assert!(timers.pend_after(Duration::from_secs(3600), move || {
            let _ = tx.send("hour");
        }));
    }
    let pended = Instant::now();
    assert!(timers.pend_after(Duration::from_nanos(1), move || {
        let _ = tx.send("nano");
    }));

    assert_eq!(
        rx.recv_timeout(Duration::from_secs(2)).unwrap(),
        "nano",
        "the near item must run first"
    );
    assert!(
        pended.elapsed() < Duration::from_millis(500),
        "the near item waited behind the far one"
    );

    root.signal_shutdown(false, ShutdownMode::Immediate);
    root.wait();
}

#[test]
fn test_work_submitted_before_start_replays_on_the_adopted_pool() {
    init_logging();
    let root = Context::root_named("buffered");

    let (tx, rx) = mpsc::channel();
    for i in 0..5 {
        let tx = tx.clone();
        root.submit(move || {
            tx.send(i).unwrap();
        });
    }
    // Nothing runs while the placeholder is buffering.
    assert!(rx.try_recv().is_err());

    root.initiate();
    let mut got: Vec<i32> = (0..5)
        .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap())
        .collect();
    got.sort_unstable();
    assert_eq!(got, vec![0, 1, 2, 3, 4]);

    root.signal_shutdown(true, ShutdownMode::Graceful);
}

#[test]
fn test_worker_thread_stops_on_signal() {
    init_logging();
    let root = Context::root();
    let (tx, rx) = mpsc::channel();
    let ticker = Arc::new(WorkerThread::new("ticker", move |signal: &StopSignal| {
        let mut ticks = 0u32;
        while !signal.wait_for(Duration::from_millis(1)) {
            ticks += 1;
        }
        tx.send(ticks).unwrap();
    }));
    root.add_runnable(ticker as Arc<dyn Runnable>);
    root.initiate();

    thread::sleep(Duration::from_millis(20));
    root.signal_shutdown(true, ShutdownMode::Graceful);

    let ticks = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert!(ticks > 0, "the worker never got to run");
}
