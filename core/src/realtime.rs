//! Realtime row-insert feed over the backend's Phoenix-channel websocket

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

use crate::config::ClientConfig;
use crate::error::{Error, Result};

// ============================================================================
// Frames
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Insert { topic: String, record: Value },
    Reply { topic: String, ok: bool, response: Value },
    ChannelError { topic: String },
    Other,
}

pub fn parse_frame(text: &str) -> Option<Frame> {
    let data: Value = serde_json::from_str(text).ok()?;
    let topic = data["topic"].as_str().unwrap_or_default().to_string();

    let frame = match data["event"].as_str()? {
        "postgres_changes" => {
            let change = &data["payload"]["data"];
            if change["type"] != "INSERT" {
                return Some(Frame::Other);
            }
            Frame::Insert {
                topic,
                record: change["record"].clone(),
            }
        }
        "phx_reply" => Frame::Reply {
            topic,
            ok: data["payload"]["status"] == "ok",
            response: data["payload"]["response"].clone(),
        },
        "phx_error" => Frame::ChannelError { topic },
        _ => Frame::Other,
    };
    Some(frame)
}

pub fn join_message(topic: &str, table: &str, filter: &str, access_token: Option<&str>, msg_ref: u64) -> Value {
    let mut payload = json!({
        "config": {
            "broadcast": { "self": false },
            "presence": { "key": "" },
            "postgres_changes": [{
                "event": "INSERT",
                "schema": "public",
                "table": table,
                "filter": filter,
            }]
        }
    });
    if let Some(token) = access_token {
        payload["access_token"] = json!(token);
    }

    json!({
        "topic": topic,
        "event": "phx_join",
        "payload": payload,
        "ref": msg_ref.to_string(),
        "join_ref": msg_ref.to_string(),
    })
}

fn leave_message(topic: &str, msg_ref: u64) -> Value {
    json!({
        "topic": topic,
        "event": "phx_leave",
        "payload": {},
        "ref": msg_ref.to_string(),
    })
}

fn heartbeat_message(msg_ref: u64) -> Value {
    json!({
        "topic": "phoenix",
        "event": "heartbeat",
        "payload": {},
        "ref": msg_ref.to_string(),
    })
}

// ============================================================================
// Client
// ============================================================================

struct ChannelEntry {
    table: String,
    filter: String,
    records: mpsc::UnboundedSender<Value>,
}

struct Shared {
    outgoing: Mutex<Option<mpsc::UnboundedSender<String>>>,
    channels: Mutex<HashMap<String, ChannelEntry>>,
    next_ref: AtomicU64,
    connected: AtomicBool,
}

impl Shared {
    fn next_ref(&self) -> u64 {
        self.next_ref.fetch_add(1, Ordering::Relaxed)
    }

    fn send(&self, msg: Value) -> Result<()> {
        match *self.outgoing.lock() {
            Some(ref sender) => sender
                .send(msg.to_string())
                .map_err(|e| Error::WebSocket(e.to_string())),
            None => Err(Error::WebSocket("not connected".to_string())),
        }
    }

    fn dispatch(&self, frame: Frame) {
        match frame {
            Frame::Insert { topic, record } => {
                let mut channels = self.channels.lock();
                let closed = match channels.get(&topic) {
                    Some(entry) => entry.records.send(record).is_err(),
                    None => false,
                };
                if closed {
                    channels.remove(&topic);
                }
            }
            Frame::Reply { topic, ok, response } => {
                if !ok {
                    tracing::warn!("Realtime subscription error on {}: {}", topic, response);
                }
            }
            Frame::ChannelError { topic } => {
                tracing::warn!("Realtime channel error on {}", topic);
            }
            Frame::Other => {}
        }
    }
}

/// Rows arriving on one joined topic.
pub struct RealtimeChannel {
    pub topic: String,
    pub records: mpsc::UnboundedReceiver<Value>,
}

pub struct RealtimeClient {
    url: url::Url,
    heartbeat: Duration,
    access_token: Mutex<Option<String>>,
    shared: Arc<Shared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RealtimeClient {
    pub async fn connect(config: &ClientConfig, access_token: Option<String>) -> Result<Arc<Self>> {
        let client = Arc::new(Self {
            url: config.ws_url()?,
            heartbeat: Duration::from_secs(config.realtime.heartbeat_interval_secs.max(1)),
            access_token: Mutex::new(access_token),
            shared: Arc::new(Shared {
                outgoing: Mutex::new(None),
                channels: Mutex::new(HashMap::new()),
                next_ref: AtomicU64::new(1),
                connected: AtomicBool::new(false),
            }),
            tasks: Mutex::new(Vec::new()),
        });
        client.open_socket().await?;
        Ok(client)
    }

    async fn open_socket(&self) -> Result<()> {
        let (ws_stream, _) = connect_async(self.url.as_str()).await?;
        let (mut write, mut read) = ws_stream.split();

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        *self.shared.outgoing.lock() = Some(tx);
        self.shared.connected.store(true, Ordering::SeqCst);

        // Receive task
        let shared = Arc::clone(&self.shared);
        let reader = tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(WsMessage::Text(text)) => {
                        if let Some(frame) = parse_frame(&text) {
                            shared.dispatch(frame);
                        }
                    }
                    Ok(WsMessage::Close(_)) | Err(_) => {
                        tracing::warn!("Realtime socket closed");
                        shared.connected.store(false, Ordering::SeqCst);
                        break;
                    }
                    _ => {}
                }
            }
        });

        // Send task
        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if write.send(WsMessage::Text(msg)).await.is_err() {
                    break;
                }
            }
        });

        let shared = Arc::clone(&self.shared);
        let period = self.heartbeat;
        let heartbeat = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let msg = heartbeat_message(shared.next_ref());
                if shared.send(msg).is_err() {
                    break;
                }
            }
        });

        let mut tasks = self.tasks.lock();
        for task in tasks.drain(..) {
            task.abort();
        }
        tasks.extend([reader, writer, heartbeat]);

        tracing::info!("Realtime connected to {}", self.url.host_str().unwrap_or_default());
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    pub fn set_access_token(&self, token: Option<String>) {
        *self.access_token.lock() = token;
    }

    /// Joins a fresh topic delivering every row inserted into `table` that
    /// matches `filter` (PostgREST syntax, e.g. `call_id=eq.abc`).
    pub fn subscribe_inserts(&self, table: &str, filter: &str) -> Result<RealtimeChannel> {
        let topic = format!("realtime:wavecall-{}", uuid::Uuid::new_v4());
        let (tx, rx) = mpsc::unbounded_channel();

        self.shared.channels.lock().insert(
            topic.clone(),
            ChannelEntry {
                table: table.to_string(),
                filter: filter.to_string(),
                records: tx,
            },
        );

        let token = self.access_token.lock().clone();
        let join = join_message(&topic, table, filter, token.as_deref(), self.shared.next_ref());
        if let Err(e) = self.shared.send(join) {
            self.shared.channels.lock().remove(&topic);
            return Err(e);
        }

        tracing::debug!("Joined {} ({} where {})", topic, table, filter);
        Ok(RealtimeChannel { topic, records: rx })
    }

    pub fn leave(&self, topic: &str) {
        if self.shared.channels.lock().remove(topic).is_some() {
            let msg = leave_message(topic, self.shared.next_ref());
            if let Err(e) = self.shared.send(msg) {
                tracing::debug!("Leave for {} not sent: {}", topic, e);
            }
        }
    }

    pub fn channel_count(&self) -> usize {
        self.shared.channels.lock().len()
    }

    /// Reopens the socket and re-joins every live topic. Used after the host
    /// application returns from suspension.
    pub async fn resume(&self) -> Result<()> {
        self.open_socket().await?;

        let token = self.access_token.lock().clone();
        let joins: Vec<Value> = self
            .shared
            .channels
            .lock()
            .iter()
            .filter(|(_, entry)| !entry.records.is_closed())
            .map(|(topic, entry)| {
                join_message(topic, &entry.table, &entry.filter, token.as_deref(), self.shared.next_ref())
            })
            .collect();

        let count = joins.len();
        for join in joins {
            self.shared.send(join)?;
        }
        tracing::info!("Realtime resumed, re-joined {} channel(s)", count);
        Ok(())
    }

    pub fn close(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        *self.shared.outgoing.lock() = None;
        self.shared.connected.store(false, Ordering::SeqCst);
    }
}

impl Drop for RealtimeClient {
    fn drop(&mut self) {
        self.close();
    }
}
