use shrinkarr_daemon::events::{Event, EventBus, Progress};
use shrinkarr_daemon::models::Stage;

fn progress_event(video_id: i64, percent: f64) -> Event {
    Event::Progress {
        video_id,
        progress: Progress {
            percent: Some(percent),
            ..Default::default()
        },
    }
}

#[tokio::test]
async fn test_events_delivered_in_publish_order() {
    let bus = EventBus::new();
    let mut sub = bus.subscribe(Stage::Encoder);

    bus.publish(
        Stage::Encoder,
        Event::Started {
            video_id: 1,
            os_pid: Some(42),
        },
    );
    bus.publish(Stage::Encoder, progress_event(1, 10.0));
    bus.publish(Stage::Encoder, Event::Completed { video_id: 1 });

    assert_eq!(
        sub.recv().await,
        Event::Started {
            video_id: 1,
            os_pid: Some(42)
        }
    );
    assert_eq!(sub.recv().await, progress_event(1, 10.0));
    assert_eq!(sub.recv().await, Event::Completed { video_id: 1 });
}

#[tokio::test]
async fn test_topics_are_isolated_per_stage() {
    let bus = EventBus::new();
    let mut encoder_sub = bus.subscribe(Stage::Encoder);
    let mut search_sub = bus.subscribe(Stage::CrfSearch);

    bus.publish(Stage::CrfSearch, Event::Completed { video_id: 7 });

    assert_eq!(search_sub.try_recv(), Some(Event::Completed { video_id: 7 }));
    assert_eq!(encoder_sub.try_recv(), None);
}

/// A slow subscriber sheds its oldest progress events first and never a
/// lifecycle event.
#[tokio::test]
async fn test_overflow_sheds_oldest_progress_first() {
    let bus = EventBus::new();
    let mut sub = bus.subscribe_with_capacity(Stage::Encoder, 3);

    bus.publish(
        Stage::Encoder,
        Event::Started {
            video_id: 1,
            os_pid: None,
        },
    );
    for percent in 1..=5 {
        bus.publish(Stage::Encoder, progress_event(1, percent as f64));
    }
    bus.publish(Stage::Encoder, Event::Completed { video_id: 1 });

    let mut received = Vec::new();
    while let Some(event) = sub.try_recv() {
        received.push(event);
    }

    // Lifecycle events survive; only the newest progress events remain.
    assert!(received.contains(&Event::Started {
        video_id: 1,
        os_pid: None
    }));
    assert!(received.contains(&Event::Completed { video_id: 1 }));
    assert!(!received.contains(&progress_event(1, 1.0)));
    assert!(received.len() <= 4);
}

/// Lifecycle events are delivered even when the queue is already full of
/// other lifecycle events.
#[tokio::test]
async fn test_lifecycle_never_dropped() {
    let bus = EventBus::new();
    let mut sub = bus.subscribe_with_capacity(Stage::CrfSearch, 1);

    bus.publish(Stage::CrfSearch, Event::Paused);
    bus.publish(Stage::CrfSearch, Event::Resumed);
    bus.publish(Stage::CrfSearch, Event::Completed { video_id: 3 });

    assert_eq!(sub.try_recv(), Some(Event::Paused));
    assert_eq!(sub.try_recv(), Some(Event::Resumed));
    assert_eq!(sub.try_recv(), Some(Event::Completed { video_id: 3 }));
}

/// A full queue with no progress events sheds the incoming progress event
/// rather than a lifecycle one.
#[tokio::test]
async fn test_incoming_progress_dropped_when_queue_is_lifecycle_only() {
    let bus = EventBus::new();
    let mut sub = bus.subscribe_with_capacity(Stage::CrfSearch, 1);

    bus.publish(Stage::CrfSearch, Event::Paused);
    bus.publish(Stage::CrfSearch, progress_event(1, 50.0));
    bus.publish(Stage::CrfSearch, Event::Resumed);

    assert_eq!(sub.try_recv(), Some(Event::Paused));
    assert_eq!(sub.try_recv(), Some(Event::Resumed));
    assert_eq!(sub.try_recv(), None);
}

#[tokio::test]
async fn test_dropped_subscribers_are_pruned() {
    let bus = EventBus::new();
    let sub = bus.subscribe(Stage::Analyzer);
    assert_eq!(bus.subscriber_count(Stage::Analyzer), 1);

    drop(sub);
    bus.publish(Stage::Analyzer, Event::Completed { video_id: 1 });
    assert_eq!(bus.subscriber_count(Stage::Analyzer), 0);
}

#[tokio::test]
async fn test_recv_wakes_on_late_publish() {
    let bus = EventBus::new();
    let mut sub = bus.subscribe(Stage::Analyzer);

    let publisher = {
        let bus = bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            bus.publish(Stage::Analyzer, Event::Completed { video_id: 9 });
        })
    };

    let event = tokio::time::timeout(std::time::Duration::from_secs(5), sub.recv())
        .await
        .expect("recv should wake");
    assert_eq!(event, Event::Completed { video_id: 9 });
    publisher.await.unwrap();
}
