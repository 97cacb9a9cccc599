//! Signal transport: relays offers, answers, candidates and hangups between
//! the two participants of a call.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::api::ApiClient;
use crate::config::SchemaConfig;
use crate::error::{Error, Result};
use crate::models::Signal;
use crate::realtime::RealtimeClient;

/// Tears a subscription down once, on `unsubscribe()` or drop.
pub struct SubscriptionHandle {
    teardown: Option<Box<dyn FnOnce() + Send>>,
}

impl SubscriptionHandle {
    pub fn new(teardown: impl FnOnce() + Send + 'static) -> Self {
        Self {
            teardown: Some(Box::new(teardown)),
        }
    }

    pub fn noop() -> Self {
        Self { teardown: None }
    }

    pub fn unsubscribe(&mut self) {
        if let Some(teardown) = self.teardown.take() {
            teardown();
        }
    }

    pub fn is_active(&self) -> bool {
        self.teardown.is_some()
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

/// Signals for one call that were authored by the other participant.
pub struct SignalSubscription {
    pub inbox: mpsc::UnboundedReceiver<Signal>,
    pub handle: SubscriptionHandle,
}

impl SignalSubscription {
    pub fn into_parts(self) -> (mpsc::UnboundedReceiver<Signal>, SubscriptionHandle) {
        (self.inbox, self.handle)
    }
}

#[async_trait]
pub trait SignalTransport: Send + Sync {
    /// Publishes one signal. No acknowledgment beyond the insert itself.
    async fn send(&self, signal: &Signal) -> Result<()>;

    /// Opens the call's channel; own signals are filtered out.
    async fn subscribe(&self, call_id: &str, local_user_id: &str) -> Result<SignalSubscription>;

    /// Signals already stored for the call and addressed to `local_user_id`.
    async fn fetch_pending(&self, call_id: &str, local_user_id: &str) -> Result<Vec<Signal>>;
}

// ============================================================================
// In-process hub
// ============================================================================

struct Subscriber {
    id: u64,
    user_id: String,
    tx: mpsc::UnboundedSender<Signal>,
}

#[derive(Default)]
struct HubState {
    subscribers: HashMap<String, Vec<Subscriber>>,
    history: HashMap<String, Vec<Signal>>,
}

/// Broadcasts signals between sessions in the same process.
///
/// Every signal is kept per call so late subscribers can replay it through
/// `fetch_pending`, the way rows stay in the backend table. Nothing is pruned
/// on its own; long-lived hosts call [`MemorySignalHub::clear_call`] once a
/// call is over.
#[derive(Clone, Default)]
pub struct MemorySignalHub {
    state: Arc<Mutex<HubState>>,
    next_id: Arc<AtomicU64>,
}

impl MemorySignalHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscriber_count(&self, call_id: &str) -> usize {
        self.state
            .lock()
            .subscribers
            .get(call_id)
            .map(|s| s.len())
            .unwrap_or(0)
    }

    /// Drops the stored signals of a call that has no subscribers left.
    /// Returns `false` and keeps everything while someone is still listening.
    pub fn clear_call(&self, call_id: &str) -> bool {
        let mut state = self.state.lock();
        if let Some(subscribers) = state.subscribers.get_mut(call_id) {
            subscribers.retain(|s| !s.tx.is_closed());
            if !subscribers.is_empty() {
                return false;
            }
            state.subscribers.remove(call_id);
        }
        state.history.remove(call_id);
        true
    }

    /// Every signal published for the call, in insertion order.
    pub fn history(&self, call_id: &str) -> Vec<Signal> {
        self.state
            .lock()
            .history
            .get(call_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl SignalTransport for MemorySignalHub {
    async fn send(&self, signal: &Signal) -> Result<()> {
        let mut state = self.state.lock();
        state
            .history
            .entry(signal.call_id.clone())
            .or_default()
            .push(signal.clone());

        if let Some(subscribers) = state.subscribers.get_mut(&signal.call_id) {
            subscribers.retain(|s| !s.tx.is_closed());
            for sub in subscribers.iter().filter(|s| s.user_id != signal.from_user_id) {
                let _ = sub.tx.send(signal.clone());
            }
        }

        tracing::debug!(
            "Hub relayed {} for {}",
            signal.signal_type().as_str(),
            signal.call_id
        );
        Ok(())
    }

    async fn subscribe(&self, call_id: &str, local_user_id: &str) -> Result<SignalSubscription> {
        if call_id.is_empty() {
            return Err(Error::Signaling("empty call id".to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.state
            .lock()
            .subscribers
            .entry(call_id.to_string())
            .or_default()
            .push(Subscriber {
                id,
                user_id: local_user_id.to_string(),
                tx,
            });

        let state = Arc::clone(&self.state);
        let call_id = call_id.to_string();
        let handle = SubscriptionHandle::new(move || {
            let mut state = state.lock();
            if let Some(subscribers) = state.subscribers.get_mut(&call_id) {
                subscribers.retain(|s| s.id != id);
                if subscribers.is_empty() {
                    state.subscribers.remove(&call_id);
                }
            }
        });

        Ok(SignalSubscription { inbox: rx, handle })
    }

    async fn fetch_pending(&self, call_id: &str, local_user_id: &str) -> Result<Vec<Signal>> {
        Ok(self
            .history(call_id)
            .into_iter()
            .filter(|s| s.to_user_id == local_user_id)
            .collect())
    }
}

// ============================================================================
// Hosted backend
// ============================================================================

/// Signals stored as rows of the signaling table and pushed back out through
/// the realtime insert feed.
pub struct RealtimeSignalTransport {
    api: Arc<ApiClient>,
    realtime: Arc<RealtimeClient>,
    table: String,
}

impl RealtimeSignalTransport {
    pub fn new(api: Arc<ApiClient>, realtime: Arc<RealtimeClient>, schema: &SchemaConfig) -> Self {
        Self {
            api,
            realtime,
            table: schema.signals_table.clone(),
        }
    }
}

#[async_trait]
impl SignalTransport for RealtimeSignalTransport {
    async fn send(&self, signal: &Signal) -> Result<()> {
        self.api.insert_row(&self.table, &signal.to_row()).await?;
        tracing::debug!("Sent {} for {}", signal.signal_type().as_str(), signal.call_id);
        Ok(())
    }

    async fn subscribe(&self, call_id: &str, local_user_id: &str) -> Result<SignalSubscription> {
        if call_id.is_empty() {
            return Err(Error::Signaling("empty call id".to_string()));
        }

        let channel = self
            .realtime
            .subscribe_inserts(&self.table, &format!("call_id=eq.{}", call_id))?;
        let topic = channel.topic;
        let mut records = channel.records;
        let (tx, rx) = mpsc::unbounded_channel();

        let local = local_user_id.to_string();
        let forward = tokio::spawn(async move {
            while let Some(record) = records.recv().await {
                let signal = match Signal::from_value(record) {
                    Ok(signal) => signal,
                    Err(e) => {
                        tracing::warn!("Dropping undecodable signal: {}", e);
                        continue;
                    }
                };
                if signal.from_user_id == local {
                    continue;
                }
                if tx.send(signal).is_err() {
                    break;
                }
            }
        });

        let realtime = Arc::clone(&self.realtime);
        let handle = SubscriptionHandle::new(move || {
            forward.abort();
            realtime.leave(&topic);
        });

        Ok(SignalSubscription { inbox: rx, handle })
    }

    async fn fetch_pending(&self, call_id: &str, local_user_id: &str) -> Result<Vec<Signal>> {
        let rows: Vec<serde_json::Value> = self
            .api
            .select_rows(&self.table, &[("call_id", call_id), ("to_user_id", local_user_id)])
            .await?;

        Ok(rows
            .into_iter()
            .filter_map(|row| match Signal::from_value(row) {
                Ok(signal) => Some(signal),
                Err(e) => {
                    tracing::warn!("Skipping stored signal: {}", e);
                    None
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SignalPayload;

    fn hangup(call_id: &str, from: &str, to: &str) -> Signal {
        Signal::new(
            call_id,
            from,
            to,
            SignalPayload::Hangup {
                reason: "hangup".to_string(),
            },
        )
    }

    #[tokio::test]
    async fn test_own_signals_filtered() {
        let hub = MemorySignalHub::new();
        let mut alice = hub.subscribe("c1", "alice").await.unwrap();
        let mut bob = hub.subscribe("c1", "bob").await.unwrap();

        hub.send(&hangup("c1", "alice", "bob")).await.unwrap();

        let received = bob.inbox.recv().await.unwrap();
        assert_eq!(received.from_user_id, "alice");
        assert!(alice.inbox.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_signals_scoped_to_call() {
        let hub = MemorySignalHub::new();
        let mut bob = hub.subscribe("c1", "bob").await.unwrap();

        hub.send(&hangup("c2", "alice", "bob")).await.unwrap();
        assert!(bob.inbox.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unsubscribe_removes_subscriber() {
        let hub = MemorySignalHub::new();
        let sub = hub.subscribe("c1", "bob").await.unwrap();
        assert_eq!(hub.subscriber_count("c1"), 1);

        let (_inbox, mut handle) = sub.into_parts();
        handle.unsubscribe();
        assert!(!handle.is_active());
        assert_eq!(hub.subscriber_count("c1"), 0);

        // Second call is a no-op
        handle.unsubscribe();
    }

    #[tokio::test]
    async fn test_clear_call_waits_for_listeners() {
        let hub = MemorySignalHub::new();
        let sub = hub.subscribe("c1", "bob").await.unwrap();
        hub.send(&hangup("c1", "alice", "bob")).await.unwrap();
        hub.send(&hangup("c2", "alice", "bob")).await.unwrap();

        assert!(!hub.clear_call("c1"));
        assert_eq!(hub.history("c1").len(), 1);

        drop(sub);
        assert!(hub.clear_call("c1"));
        assert!(hub.history("c1").is_empty());
        assert!(hub.fetch_pending("c1", "bob").await.unwrap().is_empty());
        assert_eq!(hub.history("c2").len(), 1);
    }

    #[tokio::test]
    async fn test_drop_unsubscribes() {
        let hub = MemorySignalHub::new();
        {
            let _sub = hub.subscribe("c1", "bob").await.unwrap();
            assert_eq!(hub.subscriber_count("c1"), 1);
        }
        assert_eq!(hub.subscriber_count("c1"), 0);
    }

    #[tokio::test]
    async fn test_fetch_pending_addressed_only() {
        let hub = MemorySignalHub::new();
        hub.send(&hangup("c1", "alice", "bob")).await.unwrap();
        hub.send(&hangup("c1", "bob", "alice")).await.unwrap();

        let pending = hub.fetch_pending("c1", "bob").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].to_user_id, "bob");
    }
}
