use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{debug, error};

use crate::events::{Event, EventBus};
use crate::models::Stage;

/// One stage's work source and worker. The pipeline template owns demand,
/// pause, and rate limiting; the handler owns stage semantics.
#[async_trait]
pub trait StageHandler: Send + Sync + 'static {
    type Item: Send + 'static;

    fn stage(&self) -> Stage;

    /// Pull up to `n` eligible work items in queue order. Must be empty when
    /// the queue is drained; never blocks waiting for new rows.
    async fn next_batch(&self, n: usize) -> anyhow::Result<Vec<Self::Item>>;

    /// Process one item to completion. All failures are classified and
    /// recorded inside; the pipeline treats every return as "message
    /// processed" so a bad file can never wedge the stage.
    async fn process(&self, item: Self::Item);
}

/// Authoritative pause/running flags for one stage. The UI collaborator
/// reads these instead of inferring liveness from process state.
pub struct StageControl {
    paused: AtomicBool,
    in_flight: AtomicBool,
    wake: Notify,
}

impl StageControl {
    pub fn new() -> Arc<StageControl> {
        Arc::new(StageControl {
            paused: AtomicBool::new(false),
            in_flight: AtomicBool::new(false),
            wake: Notify::new(),
        })
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// True while the processor is inside a handler invocation.
    pub fn is_running(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Poke the producer to look for work.
    pub fn dispatch_available(&self) {
        self.wake.notify_one();
    }

    fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
        self.wake.notify_one();
    }

    fn set_in_flight(&self, in_flight: bool) {
        self.in_flight.store(in_flight, Ordering::SeqCst);
    }

    async fn wait_for_wake(&self) {
        self.wake.notified().await;
    }
}

/// Operator-facing handle for one stage: pause/resume plus the poke used to
/// trigger a downstream stage after an upstream success.
#[derive(Clone)]
pub struct PipelineHandle {
    stage: Stage,
    control: Arc<StageControl>,
    bus: Arc<EventBus>,
}

impl PipelineHandle {
    pub fn new(stage: Stage, control: Arc<StageControl>, bus: Arc<EventBus>) -> PipelineHandle {
        PipelineHandle {
            stage,
            control,
            bus,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Freeze new demand. The currently running subprocess, if any, finishes
    /// naturally.
    pub fn pause(&self) {
        if !self.control.is_paused() {
            self.control.set_paused(true);
            self.bus.publish(self.stage, Event::Paused);
        }
    }

    pub fn resume(&self) {
        if self.control.is_paused() {
            self.control.set_paused(false);
            self.bus.publish(self.stage, Event::Resumed);
        }
    }

    pub fn dispatch_available(&self) {
        self.control.dispatch_available();
    }

    pub fn is_paused(&self) -> bool {
        self.control.is_paused()
    }

    pub fn is_running(&self) -> bool {
        self.control.is_running()
    }
}

struct Window {
    started: tokio::time::Instant,
    used: u32,
}

/// Token-bucket limiter on handler invocations: at most `max` message
/// starts per `interval`, so a drained-then-refilled queue cannot stampede
/// subprocess launches.
pub struct RateLimiter {
    max: u32,
    interval: Duration,
    window: Mutex<Window>,
}

impl RateLimiter {
    pub fn new(max: u32, interval: Duration) -> RateLimiter {
        RateLimiter {
            max: max.max(1),
            interval,
            window: Mutex::new(Window {
                started: tokio::time::Instant::now(),
                used: 0,
            }),
        }
    }

    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut window = self.window.lock().await;
                let now = tokio::time::Instant::now();
                if now.duration_since(window.started) >= self.interval {
                    window.started = now;
                    window.used = 0;
                }
                if window.used < self.max {
                    window.used += 1;
                    return;
                }
                self.interval - now.duration_since(window.started)
            };
            tokio::time::sleep(wait).await;
        }
    }
}

/// Run one stage until the process shuts down: a demand-driven producer
/// feeding a single-worker processor over a depth-1 channel.
pub async fn run_stage<H: StageHandler>(
    handler: Arc<H>,
    control: Arc<StageControl>,
    limiter: Arc<RateLimiter>,
    poll_interval: Duration,
) {
    let stage = handler.stage();
    let (work_tx, mut work_rx) = mpsc::channel::<H::Item>(1);
    let (ready_tx, mut ready_rx) = mpsc::channel::<()>(4);

    let producer = {
        let handler = handler.clone();
        let control = control.clone();
        async move {
            // The processor starts idle, so it owes us one unit of demand.
            let mut demand: usize = 1;
            loop {
                while ready_rx.try_recv().is_ok() {
                    demand += 1;
                }

                if control.is_paused() || demand == 0 {
                    tokio::select! {
                        _ = control.wait_for_wake() => {}
                        ready = ready_rx.recv() => match ready {
                            Some(()) => demand += 1,
                            None => return,
                        },
                    }
                    continue;
                }

                match handler.next_batch(demand).await {
                    Ok(items) if !items.is_empty() => {
                        for item in items {
                            if control.is_paused() {
                                // Pause cancels the pending dispatch; the
                                // rows stay eligible and are re-selected on
                                // resume.
                                break;
                            }
                            if work_tx.send(item).await.is_err() {
                                return;
                            }
                            demand -= 1;
                        }
                    }
                    Ok(_) => {
                        debug!("{} queue empty, waiting", stage);
                        tokio::select! {
                            _ = control.wait_for_wake() => {}
                            _ = tokio::time::sleep(poll_interval) => {}
                            ready = ready_rx.recv() => match ready {
                                Some(()) => demand += 1,
                                None => return,
                            },
                        }
                    }
                    Err(e) => {
                        error!("{} selector query failed: {:#}", stage, e);
                        tokio::time::sleep(poll_interval).await;
                    }
                }
            }
        }
    };

    let processor = {
        let handler = handler.clone();
        let control = control.clone();
        async move {
            while let Some(item) = work_rx.recv().await {
                limiter.acquire().await;
                control.set_in_flight(true);
                handler.process(item).await;
                control.set_in_flight(false);
                if ready_tx.send(()).await.is_err() {
                    return;
                }
                // The producer may be idle-waiting; make it look again.
                control.dispatch_available();
            }
        }
    };

    tokio::join!(producer, processor);
}
