use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::events::{Event, EventBus, Subscription};
use crate::models::{FailureCategory, Stage};
use crate::runner;
use crate::store::Store;

#[derive(Debug, Clone, Copy)]
pub struct WatchdogConfig {
    pub warn_threshold: Duration,
    pub kill_threshold: Duration,
}

struct Tracked {
    video_id: i64,
    os_pid: Option<u32>,
    last_progress: Instant,
    warned: bool,
    killed: bool,
}

/// Per-stage stall observer. Acts purely on bus events; it never inspects
/// the runner's internals. A subprocess that stops emitting progress gets a
/// warning alert at `warn_threshold` and a process-group kill at
/// `kill_threshold`.
pub async fn run_watchdog(
    stage: Stage,
    mut subscription: Subscription,
    bus: Arc<EventBus>,
    store: Store,
    config: WatchdogConfig,
) {
    let mut tracked: Option<Tracked> = None;

    loop {
        // After a kill there is nothing left to time; wait for the terminal
        // event to clear tracking.
        let deadline = match &tracked {
            Some(t) if !t.killed => Some(if !t.warned {
                t.last_progress + config.warn_threshold
            } else {
                t.last_progress + config.kill_threshold
            }),
            _ => None,
        };

        let Some(deadline) = deadline else {
            let event = subscription.recv().await;
            apply_event(stage, &mut tracked, event);
            continue;
        };

        tokio::select! {
            event = subscription.recv() => {
                apply_event(stage, &mut tracked, event);
            }
            _ = tokio::time::sleep_until(deadline) => {
                if let Some(t) = &mut tracked {
                    let quiet = Instant::now().duration_since(t.last_progress);
                    if quiet >= config.kill_threshold && !t.killed {
                        t.killed = true;
                        handle_stall_kill(stage, t, &bus, &store, quiet).await;
                    } else if !t.warned {
                        t.warned = true;
                        warn!(
                            "{} has made no progress on video {} for {}s",
                            stage,
                            t.video_id,
                            quiet.as_secs()
                        );
                        bus.publish(
                            stage,
                            Event::HealthAlert {
                                video_id: t.video_id,
                                message: format!("No progress for {}s", quiet.as_secs()),
                            },
                        );
                    }
                }
            }
        }
    }
}

async fn handle_stall_kill(
    stage: Stage,
    tracked: &Tracked,
    bus: &Arc<EventBus>,
    store: &Store,
    quiet: Duration,
) {
    error!(
        "{} stalled on video {} for {}s, killing the subprocess",
        stage,
        tracked.video_id,
        quiet.as_secs()
    );

    if let Some(os_pid) = tracked.os_pid {
        runner::kill(os_pid);
    } else {
        warn!(
            "{} stalled on video {} but no pid was recorded",
            stage, tracked.video_id
        );
    }

    bus.publish(
        stage,
        Event::HealthAlert {
            video_id: tracked.video_id,
            message: format!("Killed after {}s without progress", quiet.as_secs()),
        },
    );

    if let Err(e) = store
        .record_failure(
            tracked.video_id,
            stage,
            FailureCategory::Stalled,
            "killed_stuck_process",
            &format!(
                "Subprocess made no progress for {}s and was killed",
                quiet.as_secs()
            ),
            None,
        )
        .await
    {
        error!("failed to record stall for video {}: {:#}", tracked.video_id, e);
    }
}

fn apply_event(stage: Stage, tracked: &mut Option<Tracked>, event: Event) {
    match event {
        Event::Started { video_id, os_pid } => {
            debug!("{} watchdog tracking video {} (pid {:?})", stage, video_id, os_pid);
            *tracked = Some(Tracked {
                video_id,
                os_pid,
                last_progress: Instant::now(),
                warned: false,
                killed: false,
            });
        }
        Event::Progress { video_id, .. } => {
            if let Some(t) = tracked {
                if t.video_id == video_id {
                    t.last_progress = Instant::now();
                    t.warned = false;
                }
            }
        }
        Event::Completed { video_id } | Event::Failed { video_id, .. } => {
            if tracked.as_ref().map(|t| t.video_id) == Some(video_id) {
                debug!("{} watchdog clearing video {}", stage, video_id);
                *tracked = None;
            }
        }
        Event::Paused | Event::Resumed | Event::HealthAlert { .. } => {}
    }
}
