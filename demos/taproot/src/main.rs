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

//! Guided tour of the rhiza runtime.
//!
//! Builds a small service tree, wires dependencies through it, routes a
//! heartbeat event, dispatches work onto a queue thread, and tears the
//! whole thing down gracefully. Run with `RUST_LOG=debug` for the full
//! lifecycle narration.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rhiza_core::{
    Context, EventSink, Injection, QueueThread, Runnable, ShutdownMode, StopSignal, WorkerThread,
};

/// Application-wide settings, injected at the root so every subsystem can
/// resolve them.
struct AppSettings {
    service: &'static str,
    heartbeat: Duration,
}

/// The facet subsystems consume; they never see the concrete recorder.
trait Recorder: Send + Sync {
    fn record(&self, sample: &str);
}

struct LogRecorder;

impl Recorder for LogRecorder {
    fn record(&self, sample: &str) {
        log::info!("recorded {sample}");
    }
}

/// Published at the root on every beat; heard by sinks in the subtree.
struct Heartbeat {
    beat: u64,
}

struct HeartbeatSink;

impl EventSink<Heartbeat> for HeartbeatSink {
    fn receive(&self, event: &Heartbeat) {
        log::info!("pump heard heartbeat #{}", event.beat);
    }
}

fn main() -> Result<()> {
    use env_logger::{Builder, Env};

    Builder::from_env(Env::default().default_filter_or("info")).init();

    let runtime_events = rhiza_core::observe::subscribe();

    let root = Context::root_named("taproot");
    root.attrs().watch(Arc::new(|key, value| {
        log::debug!("attr {key} = {value}");
    }));
    root.attrs().set("region", "local");

    // Wire the shared objects: settings under their concrete type, the
    // recorder under both its concrete type and its trait facet.
    root.inject(Arc::new(AppSettings {
        service: "taproot",
        heartbeat: Duration::from_millis(200),
    }))?;
    let recorder = Arc::new(LogRecorder);
    root.inject_with(Injection::of(Arc::clone(&recorder)).facet(recorder as Arc<dyn Recorder>))?;

    root.when_wired::<AppSettings, _>(|settings| {
        log::info!("settings wired for service `{}`", settings.service);
    })?;

    // A child context owning the pump machinery: a queue thread registered
    // both as a runnable (so the context drives it) and as an injectable
    // (so anything in the subtree can resolve it).
    let pump = root.create_child_named("pump", |ctx| {
        let ops = Arc::new(QueueThread::new("pump-ops"));
        ctx.add_runnable(Arc::clone(&ops) as Arc<dyn Runnable>);
        ctx.inject(ops)?;
        Ok(())
    })?;
    // Registered before the pump runs, so the route goes live at initiation.
    pump.add_event_sink::<Heartbeat>(Arc::new(HeartbeatSink));

    root.initiate();
    pump.initiate();
    log::info!("tree running: root={:?} pump={:?}", root.state(), pump.state());

    // Heartbeats published at the root are heard by the pump's sink.
    let heart = {
        let publisher = Arc::clone(&root);
        let period = root
            .resolve::<AppSettings>()?
            .map(|settings| settings.heartbeat)
            .unwrap_or(Duration::from_millis(250));
        Arc::new(WorkerThread::new("heart", move |signal: &StopSignal| {
            let mut beat = 0;
            while !signal.wait_for(period) {
                beat += 1;
                publisher.publish(&Heartbeat { beat });
            }
        }))
    };
    root.add_runnable(heart as Arc<dyn Runnable>);

    // Resolve through the tree and dispatch onto the pump's queue thread.
    let ops = pump
        .resolve::<QueueThread>()?
        .ok_or_else(|| anyhow::anyhow!("pump queue not wired"))?;
    let sink = root
        .resolve::<dyn Recorder>()?
        .ok_or_else(|| anyhow::anyhow!("recorder not wired"))?;
    for i in 0..3 {
        let sink = Arc::clone(&sink);
        ops.pend(move || sink.record(&format!("sample-{i}")));
    }
    ops.pend_after(Duration::from_millis(350), || {
        log::info!("delayed dispatch fired");
    });

    std::thread::sleep(Duration::from_millis(700));

    log::info!("shutting down");
    root.signal_shutdown(true, ShutdownMode::Graceful);
    log::info!(
        "tree quiescent: {}; {} runtime events observed",
        root.is_quiescent(),
        runtime_events.try_iter().count()
    );
    Ok(())
}
