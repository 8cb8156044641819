// Subscriber registry and per-subscriber queues
//
// Each subscriber owns a bounded queue. Publishing never blocks on a
// slow subscriber: when a queue is full the oldest alert is dropped and
// counted, and the newest takes its place.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use agentsight_contracts::Alert;
use tokio::sync::{Mutex, Notify, RwLock};
use uuid::Uuid;

/// Bounded drop-oldest queue feeding one subscriber's send task.
pub struct SubscriberQueue {
    inner: Mutex<VecDeque<Alert>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

impl SubscriberQueue {
    fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    async fn push(&self, alert: Alert) {
        {
            let mut queue = self.inner.lock().await;
            if queue.len() == self.capacity {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(alert);
        }
        self.notify.notify_one();
    }

    /// Wait for the next alert.
    pub async fn pop(&self) -> Alert {
        loop {
            let notified = self.notify.notified();
            if let Some(alert) = self.inner.lock().await.pop_front() {
                return alert;
            }
            notified.await;
        }
    }

    /// Alerts discarded because this subscriber fell behind.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }
}

struct Subscriber {
    project_filter: Option<String>,
    queue: Arc<SubscriberQueue>,
}

/// Fan-out registry for live alert subscribers.
pub struct BroadcastHub {
    subscribers: RwLock<HashMap<Uuid, Subscriber>>,
    queue_capacity: usize,
}

impl BroadcastHub {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            queue_capacity,
        }
    }

    /// Register a subscriber; a null filter receives every project's
    /// alerts. The returned id is the cancel handle for `unsubscribe`.
    pub async fn subscribe(&self, project_filter: Option<String>) -> (Uuid, Arc<SubscriberQueue>) {
        let id = Uuid::new_v4();
        let queue = Arc::new(SubscriberQueue::new(self.queue_capacity));
        self.subscribers.write().await.insert(
            id,
            Subscriber {
                project_filter,
                queue: queue.clone(),
            },
        );
        tracing::info!(subscriber_id = %id, "subscriber registered");
        (id, queue)
    }

    pub async fn unsubscribe(&self, id: Uuid) {
        if self.subscribers.write().await.remove(&id).is_some() {
            tracing::info!(subscriber_id = %id, "subscriber removed");
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    /// Deliver an alert to every matching subscriber's queue; returns the
    /// number of queues it reached.
    pub async fn publish(&self, alert: &Alert) -> usize {
        let subscribers = self.subscribers.read().await;
        let mut delivered = 0;
        for subscriber in subscribers.values() {
            let matches = subscriber
                .project_filter
                .as_ref()
                .map_or(true, |filter| *filter == alert.project_id);
            if matches {
                subscriber.queue.push(alert.clone()).await;
                delivered += 1;
            }
        }
        delivered
    }
}
