use shrinkarr_daemon::events::{Event, EventBus, Progress};
use shrinkarr_daemon::models::{FailureCategory, Stage, VideoState};
use shrinkarr_daemon::store::{NewVideo, Store};
use shrinkarr_daemon::watchdog::{run_watchdog, WatchdogConfig};
use std::path::PathBuf;
use std::time::Duration;

async fn test_store() -> (Store, i64) {
    let store = Store::connect("sqlite::memory:", 1).await.expect("connect");
    store.migrate().await.expect("migrate");
    let video = store
        .insert_video(NewVideo {
            path: PathBuf::from("/m/a.mkv"),
            size: 1000,
            bitrate: Some(100),
            service_type: None,
            service_id: None,
            library_id: None,
        })
        .await
        .expect("insert");
    (store, video.id)
}

fn config() -> WatchdogConfig {
    WatchdogConfig {
        warn_threshold: Duration::from_millis(100),
        kill_threshold: Duration::from_millis(300),
    }
}

fn progress(video_id: i64) -> Event {
    Event::Progress {
        video_id,
        progress: Progress {
            percent: Some(10.0),
            ..Default::default()
        },
    }
}

fn drain_alerts(sub: &mut shrinkarr_daemon::events::Subscription) -> Vec<String> {
    let mut alerts = Vec::new();
    while let Some(event) = sub.try_recv() {
        if let Event::HealthAlert { message, .. } = event {
            alerts.push(message);
        }
    }
    alerts
}

#[tokio::test(start_paused = true)]
async fn test_silent_subprocess_warns_then_kills() {
    let (store, video_id) = test_store().await;
    let bus = EventBus::new();
    let mut observer = bus.subscribe(Stage::Encoder);
    let watchdog_sub = bus.subscribe(Stage::Encoder);

    let watchdog = tokio::spawn(run_watchdog(
        Stage::Encoder,
        watchdog_sub,
        bus.clone(),
        store.clone(),
        config(),
    ));
    tokio::time::sleep(Duration::from_millis(1)).await;

    // No pid recorded: the kill step degrades to the alert + audit trail.
    bus.publish(
        Stage::Encoder,
        Event::Started {
            video_id,
            os_pid: None,
        },
    );

    // Quiet past the warn threshold, short of the kill threshold.
    tokio::time::sleep(Duration::from_millis(150)).await;
    let alerts = drain_alerts(&mut observer);
    assert_eq!(alerts.len(), 1, "expected one warn alert, got {:?}", alerts);
    assert!(alerts[0].contains("No progress"));

    // Quiet past the kill threshold.
    tokio::time::sleep(Duration::from_millis(250)).await;
    let alerts = drain_alerts(&mut observer);
    assert_eq!(alerts.len(), 1, "expected one kill alert, got {:?}", alerts);
    assert!(alerts[0].contains("Killed"));

    // The stall lands in the audit log with its canonical code.
    let failures = store.failures_for_video(video_id).await.expect("failures");
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].code, "killed_stuck_process");
    assert_eq!(failures[0].category, FailureCategory::Stalled);

    // No repeat kill while the same stall persists.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(drain_alerts(&mut observer).is_empty());
    let failures = store.failures_for_video(video_id).await.expect("failures");
    assert_eq!(failures.len(), 1);

    watchdog.abort();
}

#[tokio::test(start_paused = true)]
async fn test_progress_resets_the_stall_timer() {
    let (store, video_id) = test_store().await;
    let bus = EventBus::new();
    let mut observer = bus.subscribe(Stage::CrfSearch);
    let watchdog_sub = bus.subscribe(Stage::CrfSearch);

    let watchdog = tokio::spawn(run_watchdog(
        Stage::CrfSearch,
        watchdog_sub,
        bus.clone(),
        store.clone(),
        config(),
    ));
    tokio::time::sleep(Duration::from_millis(1)).await;

    bus.publish(
        Stage::CrfSearch,
        Event::Started {
            video_id,
            os_pid: None,
        },
    );

    // Keep feeding progress before the warn threshold elapses.
    for _ in 0..5 {
        tokio::time::sleep(Duration::from_millis(80)).await;
        bus.publish(Stage::CrfSearch, progress(video_id));
    }

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(
        drain_alerts(&mut observer).is_empty(),
        "progress should keep the watchdog quiet"
    );

    watchdog.abort();
}

#[tokio::test(start_paused = true)]
async fn test_completion_clears_tracking() {
    let (store, video_id) = test_store().await;
    let bus = EventBus::new();
    let mut observer = bus.subscribe(Stage::Encoder);
    let watchdog_sub = bus.subscribe(Stage::Encoder);

    let watchdog = tokio::spawn(run_watchdog(
        Stage::Encoder,
        watchdog_sub,
        bus.clone(),
        store.clone(),
        config(),
    ));
    tokio::time::sleep(Duration::from_millis(1)).await;

    bus.publish(
        Stage::Encoder,
        Event::Started {
            video_id,
            os_pid: None,
        },
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    bus.publish(Stage::Encoder, Event::Completed { video_id });

    // Way past every threshold: a completed run must never alert.
    tokio::time::sleep(Duration::from_millis(1000)).await;
    assert!(drain_alerts(&mut observer).is_empty());
    assert!(store
        .failures_for_video(video_id)
        .await
        .expect("failures")
        .is_empty());

    watchdog.abort();
}

#[tokio::test(start_paused = true)]
async fn test_warning_alone_does_not_touch_the_audit_log() {
    let (store, video_id) = test_store().await;
    let bus = EventBus::new();
    let mut observer = bus.subscribe(Stage::Encoder);
    let watchdog_sub = bus.subscribe(Stage::Encoder);

    let watchdog = tokio::spawn(run_watchdog(
        Stage::Encoder,
        watchdog_sub,
        bus.clone(),
        store.clone(),
        config(),
    ));
    tokio::time::sleep(Duration::from_millis(1)).await;

    bus.publish(
        Stage::Encoder,
        Event::Started {
            video_id,
            os_pid: None,
        },
    );
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(drain_alerts(&mut observer).len(), 1);
    assert!(store
        .failures_for_video(video_id)
        .await
        .expect("failures")
        .is_empty());

    // A new video row stays untouched too: the video is not marked failed
    // by a warning.
    let video = store.fetch_video(video_id).await.unwrap().unwrap();
    assert!(!video.failed);
    assert_eq!(video.state, VideoState::NeedsAnalysis);

    watchdog.abort();
}
