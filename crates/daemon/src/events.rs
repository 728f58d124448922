use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

use crate::models::Stage;

/// Single progress record shared between the parser layer and event-bus
/// payloads; fields are filled in as far as the source line provided them.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Progress {
    pub percent: Option<f64>,
    pub crf: Option<f64>,
    pub score: Option<f64>,
    pub fps: Option<f64>,
    pub eta: Option<Duration>,
}

/// Lifecycle and progress events published per stage topic.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Started {
        video_id: i64,
        os_pid: Option<u32>,
    },
    Progress {
        video_id: i64,
        progress: Progress,
    },
    Completed {
        video_id: i64,
    },
    Failed {
        video_id: i64,
        code: String,
        reason: String,
    },
    Paused,
    Resumed,
    HealthAlert {
        video_id: i64,
        message: String,
    },
}

impl Event {
    /// Progress events may be shed under back-pressure; everything else is
    /// a lifecycle event and must reach every subscriber.
    pub fn is_progress(&self) -> bool {
        matches!(self, Event::Progress { .. })
    }
}

const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;

struct SubscriberShared {
    queue: Mutex<VecDeque<Event>>,
    notify: Notify,
    closed: AtomicBool,
    capacity: usize,
}

/// Receiving end of a topic subscription. Dropping it detaches the
/// subscriber from the bus.
pub struct Subscription {
    shared: Arc<SubscriberShared>,
}

impl Subscription {
    /// Wait for the next event.
    pub async fn recv(&mut self) -> Event {
        loop {
            if let Some(event) = self.shared.queue.lock().unwrap().pop_front() {
                return event;
            }
            self.shared.notify.notified().await;
        }
    }

    /// Non-blocking pop, mainly for tests and snapshot reads.
    pub fn try_recv(&mut self) -> Option<Event> {
        self.shared.queue.lock().unwrap().pop_front()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::Relaxed);
    }
}

/// In-process publish/subscribe with one topic per stage. Delivery is
/// best-effort to current subscribers: no persistence, no replay. A slow
/// subscriber loses its oldest progress events first and never loses a
/// lifecycle event, at the cost of its queue briefly exceeding capacity.
#[derive(Default)]
pub struct EventBus {
    topics: Mutex<HashMap<Stage, Vec<Arc<SubscriberShared>>>>,
}

impl EventBus {
    pub fn new() -> Arc<EventBus> {
        Arc::new(EventBus::default())
    }

    pub fn subscribe(&self, stage: Stage) -> Subscription {
        self.subscribe_with_capacity(stage, DEFAULT_SUBSCRIBER_CAPACITY)
    }

    pub fn subscribe_with_capacity(&self, stage: Stage, capacity: usize) -> Subscription {
        let shared = Arc::new(SubscriberShared {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            capacity: capacity.max(1),
        });

        self.topics
            .lock()
            .unwrap()
            .entry(stage)
            .or_default()
            .push(shared.clone());

        Subscription { shared }
    }

    /// Publish to a stage topic. Never blocks the publisher.
    pub fn publish(&self, stage: Stage, event: Event) {
        let mut topics = self.topics.lock().unwrap();
        let Some(subscribers) = topics.get_mut(&stage) else {
            return;
        };

        subscribers.retain(|s| !s.closed.load(Ordering::Relaxed));

        for subscriber in subscribers.iter() {
            let mut queue = subscriber.queue.lock().unwrap();

            if queue.len() >= subscriber.capacity {
                if let Some(pos) = queue.iter().position(|e| e.is_progress()) {
                    queue.remove(pos);
                } else if event.is_progress() {
                    // Queue is all lifecycle events; shed the new progress
                    // event instead.
                    continue;
                }
            }

            queue.push_back(event.clone());
            drop(queue);
            subscriber.notify.notify_one();
        }
    }

    /// Number of live subscribers on a topic.
    pub fn subscriber_count(&self, stage: Stage) -> usize {
        let mut topics = self.topics.lock().unwrap();
        match topics.get_mut(&stage) {
            Some(subs) => {
                subs.retain(|s| !s.closed.load(Ordering::Relaxed));
                subs.len()
            }
            None => 0,
        }
    }
}
