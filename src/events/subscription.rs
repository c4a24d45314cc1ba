//! Per-RPC-call subscription manager (spec.md §4.4).
//!
//! Aggregates one or more of the listener's per-app subscribers into a
//! single merged channel with a shared, set-once error cell. Closing is
//! tied to `Drop`, so "handlers must in all cases close the subscription
//! in a scoped release" (spec.md §5) falls out of ordinary Rust scoping
//! rather than a manual try/finally.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::listener::EventListener;
use crate::domain::{Event, ObjectType};
use crate::error::ControllerError;

/// Bound on the merged channel handed to RPC handlers.
const MERGED_CHANNEL_CAPACITY: usize = 256;

/// Builds [`Subscription`]s against a shared [`EventListener`]. One
/// instance is created per RPC call (spec.md §4.4 heading).
#[derive(Clone)]
pub struct SubscriptionManager {
    listener: Arc<EventListener>,
}

impl SubscriptionManager {
    /// Build a manager over the process-wide listener.
    pub fn new(listener: Arc<EventListener>) -> Self {
        SubscriptionManager { listener }
    }

    /// Open a merged subscription across `app_ids` (empty means "all
    /// apps", spec.md §4.4), filtered by `object_types` and an optional
    /// `object_id`.
    pub async fn subscribe_events(
        &self,
        app_ids: &[String],
        object_types: HashSet<ObjectType>,
        object_id: Option<String>,
    ) -> Result<Subscription, ControllerError> {
        let targets: Vec<String> = if app_ids.is_empty() {
            vec![String::new()]
        } else {
            app_ids.to_vec()
        };

        let (merged_tx, merged_rx) = mpsc::channel(MERGED_CHANNEL_CAPACITY);
        let error: Arc<std::sync::OnceLock<ControllerError>> = Arc::new(std::sync::OnceLock::new());
        let cancel = CancellationToken::new();
        let mut forwarders = Vec::with_capacity(targets.len());

        for app_id in targets {
            let mut handle = self
                .listener
                .subscribe(&app_id, object_types.clone(), object_id.clone())
                .await?;
            let tx = merged_tx.clone();
            let error = error.clone();
            let cancel = cancel.clone();
            forwarders.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        maybe = handle.recv() => {
                            match maybe {
                                Some(event) => {
                                    if tx.send(event).await.is_err() {
                                        break;
                                    }
                                }
                                None => break,
                            }
                        }
                    }
                }
                if let Some(err) = handle.error() {
                    let _ = error.set(err);
                }
                handle.close();
            }));
        }
        drop(merged_tx);

        Ok(Subscription {
            rx: merged_rx,
            error,
            cancel,
            forwarders,
        })
    }
}

/// A merged, per-RPC-call event channel (spec.md §3 Subscription entity).
pub struct Subscription {
    rx: mpsc::Receiver<Event>,
    error: Arc<std::sync::OnceLock<ControllerError>>,
    cancel: CancellationToken,
    forwarders: Vec<JoinHandle<()>>,
}

impl Subscription {
    /// Receive the next merged event. Ordering is guaranteed only within
    /// a single underlying subscriber; across app ids the merged channel
    /// is arbitrarily interleaved (spec.md §3 Invariants, §5 Ordering).
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// The first non-nil error observed by any underlying forwarder, if
    /// any (spec.md §4.4 "first non-nil wins").
    pub fn error(&self) -> Option<ControllerError> {
        self.error.get().cloned()
    }

    /// Close every underlying subscriber. Idempotent. Also runs on
    /// `Drop`, so callers do not need to call this explicitly on every
    /// path — only where an RPC wants to stop tailing before its scope
    /// ends.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Operation;
    use crate::events::listener::EventListener;
    use crate::store::memory::MemoryChangeFeed;
    use chrono::Utc;
    use std::time::Duration;

    fn test_event(app_id: &str, id: i64, object_id: &str) -> Event {
        Event {
            id,
            app_id: app_id.to_string(),
            object_type: ObjectType::Release,
            object_id: object_id.to_string(),
            operation: Operation::Create,
            payload: serde_json::Value::Null,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn merges_multiple_app_subscriptions() {
        let feed = Arc::new(MemoryChangeFeed::new());
        let listener = EventListener::new(feed.clone());
        let manager = SubscriptionManager::new(listener);

        let mut sub = manager
            .subscribe_events(
                &["app1".to_string(), "app2".to_string()],
                HashSet::from([ObjectType::Release]),
                None,
            )
            .await
            .unwrap();

        feed.publish(test_event("app1", 1, "r1"));
        feed.publish(test_event("app2", 2, "r2"));

        let mut seen = vec![sub.recv().await.unwrap().app_id, sub.recv().await.unwrap().app_id];
        seen.sort();
        assert_eq!(seen, vec!["app1".to_string(), "app2".to_string()]);
    }

    #[tokio::test]
    async fn empty_app_ids_subscribes_wildcard() {
        let feed = Arc::new(MemoryChangeFeed::new());
        let listener = EventListener::new(feed.clone());
        let manager = SubscriptionManager::new(listener);

        let mut sub = manager
            .subscribe_events(&[], HashSet::from([ObjectType::Release]), None)
            .await
            .unwrap();

        feed.publish(test_event("any-app", 1, "r1"));
        let event = sub.recv().await.unwrap();
        assert_eq!(event.app_id, "any-app");
    }

    #[tokio::test]
    async fn close_releases_merged_channel_in_finite_time() {
        let feed = Arc::new(MemoryChangeFeed::new());
        let listener = EventListener::new(feed.clone());
        let manager = SubscriptionManager::new(listener);

        let mut sub = manager
            .subscribe_events(
                &["app1".to_string()],
                HashSet::from([ObjectType::Release]),
                None,
            )
            .await
            .unwrap();
        sub.close();

        let result = tokio::time::timeout(Duration::from_secs(1), sub.recv()).await;
        assert_eq!(result.unwrap(), None);
        assert!(sub.error().is_none());
    }

    #[tokio::test]
    async fn drop_closes_subscription() {
        let feed = Arc::new(MemoryChangeFeed::new());
        let listener = EventListener::new(feed.clone());
        let manager = SubscriptionManager::new(listener);

        let sub = manager
            .subscribe_events(
                &["app1".to_string()],
                HashSet::from([ObjectType::Release]),
                None,
            )
            .await
            .unwrap();
        drop(sub);
        // No panic, no hang: forwarders observe cancellation and exit.
    }
}
