//! Log fan-out to live subscribers and persistence into the `logs` table.
//!
//! [`PersistLayer`] is a `tracing_subscriber` layer. Every event becomes a
//! [`LogEvent`] that is published on a [`LogBroadcaster`] and, when
//! persistence is on, queued for [`spawn_log_writer`].

use haul_metadata::MetadataStore;
use haul_metadata::repos::LogRepo;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::Context;

/// One rendered log event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEvent {
    pub level: String,
    pub message: String,
    /// Structured fields as a JSON object.
    pub fields_json: String,
}

/// A live subscription. Dropping the receiver unsubscribes lazily.
pub struct Subscription {
    pub id: u64,
    pub receiver: mpsc::Receiver<LogEvent>,
}

/// Bounded-channel multicast of log events.
///
/// Publishing never blocks: a subscriber whose buffer is full misses the event.
pub struct LogBroadcaster {
    subscribers: Mutex<HashMap<u64, mpsc::Sender<LogEvent>>>,
    next_id: AtomicU64,
    capacity: usize,
}

impl LogBroadcaster {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            capacity: capacity.max(1),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        let (tx, receiver) = mpsc::channel(self.capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().insert(id, tx);
        Subscription { id, receiver }
    }

    /// Remove a subscriber, closing its channel.
    pub fn unsubscribe(&self, id: u64) {
        self.lock().remove(&id);
    }

    /// Offer `event` to every subscriber. Returns how many accepted it.
    pub fn publish(&self, event: &LogEvent) -> usize {
        let mut delivered = 0;
        self.lock().retain(|_, tx| match tx.try_send(event.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, mpsc::Sender<LogEvent>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Tracing layer feeding the broadcaster and the persisted log.
pub struct PersistLayer {
    broadcaster: Arc<LogBroadcaster>,
    sink: Option<mpsc::UnboundedSender<LogEvent>>,
}

impl PersistLayer {
    /// `sink` receives every event for [`spawn_log_writer`]; `None` disables persistence.
    pub fn new(
        broadcaster: Arc<LogBroadcaster>,
        sink: Option<mpsc::UnboundedSender<LogEvent>>,
    ) -> Self {
        Self { broadcaster, sink }
    }
}

/// Events from the database driver and from this module would feed back into
/// the writer, so they are not captured.
fn is_captured(target: &str) -> bool {
    !target.starts_with("sqlx") && !target.starts_with(module_path!())
}

impl<S: Subscriber> Layer<S> for PersistLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if !is_captured(metadata.target()) {
            return;
        }

        let mut visitor = JsonVisitor::default();
        event.record(&mut visitor);
        let log = LogEvent {
            level: metadata.level().to_string(),
            message: visitor.message,
            fields_json: serde_json::Value::Object(visitor.fields).to_string(),
        };

        self.broadcaster.publish(&log);
        if let Some(sink) = &self.sink {
            // Closed once the writer is gone; nothing left to persist to.
            let _ = sink.send(log);
        }
    }
}

#[derive(Default)]
struct JsonVisitor {
    message: String,
    fields: serde_json::Map<String, serde_json::Value>,
}

impl JsonVisitor {
    fn insert(&mut self, field: &Field, value: serde_json::Value) {
        if field.name() == "message" {
            self.message = match value {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
        } else {
            self.fields.insert(field.name().to_string(), value);
        }
    }
}

impl Visit for JsonVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.insert(field, format!("{value:?}").into());
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.insert(field, value.into());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.insert(field, value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.insert(field, value.into());
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.insert(field, value.into());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.insert(field, value.into());
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.insert(field, value.to_string().into());
    }
}

/// Spawn the task writing queued events into the store.
///
/// It runs until every sender of `events` has been dropped or `shutdown`
/// fires. On shutdown the channel is closed and events already queued are
/// still written.
pub fn spawn_log_writer(
    store: Arc<dyn MetadataStore>,
    mut events: mpsc::UnboundedReceiver<LogEvent>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                event = events.recv() => match event {
                    Some(event) => persist(store.as_ref(), &event).await,
                    None => return,
                },
                _ = shutdown.cancelled() => break,
            }
        }

        events.close();
        while let Some(event) = events.recv().await {
            persist(store.as_ref(), &event).await;
        }
    })
}

async fn persist(store: &dyn MetadataStore, event: &LogEvent) {
    if let Err(e) = store
        .insert_log(&event.level, &event.message, &event.fields_json)
        .await
    {
        tracing::warn!(error = %e, "Failed to persist log event");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    fn event(message: &str) -> LogEvent {
        LogEvent {
            level: "INFO".to_string(),
            message: message.to_string(),
            fields_json: "{}".to_string(),
        }
    }

    #[tokio::test]
    async fn test_full_subscriber_drops_without_blocking() {
        let broadcaster = LogBroadcaster::new(1);
        let mut sub = broadcaster.subscribe();

        assert_eq!(broadcaster.publish(&event("one")), 1);
        assert_eq!(broadcaster.publish(&event("two")), 0);
        assert_eq!(sub.receiver.recv().await.unwrap().message, "one");
        assert_eq!(broadcaster.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_closed_subscribers_are_pruned() {
        let broadcaster = LogBroadcaster::new(4);
        let keep = broadcaster.subscribe();
        let gone = broadcaster.subscribe();
        drop(gone);

        assert_eq!(broadcaster.publish(&event("x")), 1);
        assert_eq!(broadcaster.subscriber_count(), 1);

        broadcaster.unsubscribe(keep.id);
        assert_eq!(broadcaster.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_layer_renders_fields() {
        let broadcaster = Arc::new(LogBroadcaster::new(8));
        let mut sub = broadcaster.subscribe();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscriber =
            tracing_subscriber::registry().with(PersistLayer::new(broadcaster.clone(), Some(tx)));

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(target: "haul::test", job_id = 7, url = "https://x/1", "Job recorded");
        });

        let live = sub.receiver.recv().await.unwrap();
        assert_eq!(live.level, "INFO");
        assert_eq!(live.message, "Job recorded");
        let fields: serde_json::Value = serde_json::from_str(&live.fields_json).unwrap();
        assert_eq!(fields["job_id"], 7);
        assert_eq!(fields["url"], "https://x/1");

        assert_eq!(rx.recv().await.unwrap(), live);
    }

    #[test]
    fn test_driver_and_writer_events_are_skipped() {
        assert!(!is_captured("sqlx::query"));
        assert!(!is_captured("haul_server::logs"));
        assert!(is_captured("haul_server::cache"));
    }

    #[tokio::test]
    async fn test_writer_drains_queue_on_shutdown() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn MetadataStore> = Arc::new(
            haul_metadata::SqliteStore::new(temp_dir.path().join("logs.db"), None)
                .await
                .unwrap(),
        );
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        // queued before the writer ever runs
        for message in ["one", "two", "Shutdown complete"] {
            tx.send(event(message)).unwrap();
        }
        shutdown.cancel();
        spawn_log_writer(store.clone(), rx, shutdown).await.unwrap();

        let (rows, total) = store
            .list_logs(&haul_metadata::models::LogFilter::default())
            .await
            .unwrap();
        assert_eq!(total, 3);
        assert_eq!(rows[0].message, "Shutdown complete");
        // the sink is closed once the writer has stopped
        assert!(tx.send(event("late")).is_err());
    }
}
