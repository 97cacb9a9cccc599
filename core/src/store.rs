//! Call record persistence

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::api::ApiClient;
use crate::config::SchemaConfig;
use crate::error::{Error, Result};
use crate::models::{CallRecord, CallRecordUpdate, CallStatus, CallType, IncomingCall};
use crate::realtime::RealtimeClient;
use crate::signaling::SubscriptionHandle;

#[async_trait]
pub trait CallStore: Send + Sync {
    async fn create(&self, record: &CallRecord) -> Result<()>;

    /// Applies the set fields of `update`; unknown ids are not an error.
    async fn update(&self, call_id: &str, update: &CallRecordUpdate) -> Result<()>;

    async fn get(&self, call_id: &str) -> Result<Option<CallRecord>>;

    /// New records addressed to `user_id`.
    async fn watch_incoming(&self, user_id: &str) -> Result<IncomingCalls>;
}

/// Stream of newly created call records for one receiver.
pub struct IncomingCalls {
    records: mpsc::UnboundedReceiver<CallRecord>,
    handle: SubscriptionHandle,
}

impl IncomingCalls {
    pub fn new(records: mpsc::UnboundedReceiver<CallRecord>, handle: SubscriptionHandle) -> Self {
        Self { records, handle }
    }

    /// Next call still waiting to be picked up. Records created in any other
    /// status are skipped.
    pub async fn recv(&mut self) -> Option<IncomingCall> {
        loop {
            let record = self.records.recv().await?;
            if record.status == CallStatus::Initiated {
                return Some(IncomingCall::from_record(&record));
            }
        }
    }

    pub fn unsubscribe(&mut self) {
        self.handle.unsubscribe();
        self.records.close();
    }
}

// ============================================================================
// SQLite
// ============================================================================

struct Watcher {
    id: u64,
    user_id: String,
    tx: mpsc::UnboundedSender<CallRecord>,
}

/// Local call log backed by SQLite.
pub struct SqliteCallStore {
    conn: Mutex<Connection>,
    table: String,
    watchers: Arc<Mutex<Vec<Watcher>>>,
    next_id: AtomicU64,
}

impl SqliteCallStore {
    pub fn open(path: &Path, schema: &SchemaConfig) -> Result<Self> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }
        Self::with_connection(Connection::open(path)?, schema)
    }

    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, &SchemaConfig::default())
    }

    fn with_connection(conn: Connection, schema: &SchemaConfig) -> Result<Self> {
        schema.validate()?;
        let store = Self {
            conn: Mutex::new(conn),
            table: schema.calls_table.clone(),
            watchers: Arc::new(Mutex::new(Vec::new())),
            next_id: AtomicU64::new(1),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                call_id TEXT PRIMARY KEY,
                caller_id TEXT NOT NULL,
                receiver_id TEXT NOT NULL,
                call_type TEXT NOT NULL,
                status TEXT NOT NULL,
                started_at INTEGER NOT NULL,
                answered_at INTEGER,
                ended_at INTEGER,
                duration_seconds INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_{table}_receiver ON {table}(receiver_id);
            "#,
            table = self.table
        ))?;
        Ok(())
    }

    /// Most recent calls involving `user_id`, newest first.
    pub fn history(&self, user_id: &str, limit: i64) -> Result<Vec<CallRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT call_id, caller_id, receiver_id, call_type, status, started_at,
                    answered_at, ended_at, duration_seconds
             FROM {} WHERE caller_id = ?1 OR receiver_id = ?1
             ORDER BY started_at DESC LIMIT ?2",
            self.table
        ))?;

        let rows = stmt.query_map(params![user_id, limit], read_row)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?.into_record()?);
        }
        Ok(records)
    }

    fn notify(&self, record: &CallRecord) {
        let mut watchers = self.watchers.lock();
        watchers.retain(|w| !w.tx.is_closed());
        for watcher in watchers.iter().filter(|w| w.user_id == record.receiver_id) {
            let _ = watcher.tx.send(record.clone());
        }
    }
}

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| Error::Storage(format!("Invalid timestamp: {}", ms)))
}

fn parse_call_type(s: &str) -> Result<CallType> {
    match s {
        "audio" => Ok(CallType::Audio),
        "video" => Ok(CallType::Video),
        "screen" => Ok(CallType::Screen),
        other => Err(Error::Storage(format!("Unknown call type: {}", other))),
    }
}

struct RawRow {
    call_id: String,
    caller_id: String,
    receiver_id: String,
    call_type: String,
    status: String,
    started_at: i64,
    answered_at: Option<i64>,
    ended_at: Option<i64>,
    duration_seconds: i64,
}

impl RawRow {
    fn into_record(self) -> Result<CallRecord> {
        let status = CallStatus::parse(&self.status)
            .ok_or_else(|| Error::Storage(format!("Unknown call status: {}", self.status)))?;

        Ok(CallRecord {
            call_id: self.call_id,
            caller_id: self.caller_id,
            receiver_id: self.receiver_id,
            call_type: parse_call_type(&self.call_type)?,
            status,
            started_at: from_millis(self.started_at)?,
            answered_at: self.answered_at.map(from_millis).transpose()?,
            ended_at: self.ended_at.map(from_millis).transpose()?,
            duration_seconds: self.duration_seconds,
        })
    }
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<RawRow> {
    Ok(RawRow {
        call_id: row.get(0)?,
        caller_id: row.get(1)?,
        receiver_id: row.get(2)?,
        call_type: row.get(3)?,
        status: row.get(4)?,
        started_at: row.get(5)?,
        answered_at: row.get(6)?,
        ended_at: row.get(7)?,
        duration_seconds: row.get(8)?,
    })
}

#[async_trait]
impl CallStore for SqliteCallStore {
    async fn create(&self, record: &CallRecord) -> Result<()> {
        {
            let conn = self.conn.lock();
            conn.execute(
                &format!(
                    "INSERT INTO {} (call_id, caller_id, receiver_id, call_type, status,
                                     started_at, answered_at, ended_at, duration_seconds)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    self.table
                ),
                params![
                    record.call_id,
                    record.caller_id,
                    record.receiver_id,
                    record.call_type.as_str(),
                    record.status.as_str(),
                    millis(record.started_at),
                    record.answered_at.map(millis),
                    record.ended_at.map(millis),
                    record.duration_seconds,
                ],
            )?;
        }
        self.notify(record);
        Ok(())
    }

    async fn update(&self, call_id: &str, update: &CallRecordUpdate) -> Result<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            &format!(
                "UPDATE {} SET
                    status = COALESCE(?2, status),
                    answered_at = COALESCE(?3, answered_at),
                    ended_at = COALESCE(?4, ended_at),
                    duration_seconds = COALESCE(?5, duration_seconds)
                 WHERE call_id = ?1",
                self.table
            ),
            params![
                call_id,
                update.status.map(|s| s.as_str()),
                update.answered_at.map(millis),
                update.ended_at.map(millis),
                update.duration_seconds,
            ],
        )?;
        if changed == 0 {
            tracing::debug!("No call record {} to update", call_id);
        }
        Ok(())
    }

    async fn get(&self, call_id: &str) -> Result<Option<CallRecord>> {
        let conn = self.conn.lock();
        let record = conn
            .query_row(
                &format!(
                    "SELECT call_id, caller_id, receiver_id, call_type, status, started_at,
                            answered_at, ended_at, duration_seconds
                     FROM {} WHERE call_id = ?1",
                    self.table
                ),
                params![call_id],
                read_row,
            )
            .optional()?;
        record.map(RawRow::into_record).transpose()
    }

    async fn watch_incoming(&self, user_id: &str) -> Result<IncomingCalls> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.watchers.lock().push(Watcher {
            id,
            user_id: user_id.to_string(),
            tx,
        });

        let watchers = Arc::clone(&self.watchers);
        let handle = SubscriptionHandle::new(move || {
            watchers.lock().retain(|w| w.id != id);
        });
        Ok(IncomingCalls::new(rx, handle))
    }
}

// ============================================================================
// Hosted backend
// ============================================================================

/// Call records in the backend's call table.
pub struct RestCallStore {
    api: Arc<ApiClient>,
    realtime: Arc<RealtimeClient>,
    table: String,
}

impl RestCallStore {
    pub fn new(api: Arc<ApiClient>, realtime: Arc<RealtimeClient>, schema: &SchemaConfig) -> Self {
        Self {
            api,
            realtime,
            table: schema.calls_table.clone(),
        }
    }
}

#[async_trait]
impl CallStore for RestCallStore {
    async fn create(&self, record: &CallRecord) -> Result<()> {
        self.api.insert_row(&self.table, record).await
    }

    async fn update(&self, call_id: &str, update: &CallRecordUpdate) -> Result<()> {
        self.api.update_rows(&self.table, "call_id", call_id, update).await
    }

    async fn get(&self, call_id: &str) -> Result<Option<CallRecord>> {
        let rows: Vec<CallRecord> = self.api.select_rows(&self.table, &[("call_id", call_id)]).await?;
        Ok(rows.into_iter().next())
    }

    async fn watch_incoming(&self, user_id: &str) -> Result<IncomingCalls> {
        let channel = self
            .realtime
            .subscribe_inserts(&self.table, &format!("receiver_id=eq.{}", user_id))?;
        let topic = channel.topic;
        let mut rows = channel.records;
        let (tx, rx) = mpsc::unbounded_channel();

        let forward = tokio::spawn(async move {
            while let Some(row) = rows.recv().await {
                match serde_json::from_value::<CallRecord>(row) {
                    Ok(record) => {
                        if tx.send(record).is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::warn!("Dropping undecodable call record: {}", e),
                }
            }
        });

        let realtime = Arc::clone(&self.realtime);
        let handle = SubscriptionHandle::new(move || {
            forward.abort();
            realtime.leave(&topic);
        });
        Ok(IncomingCalls::new(rx, handle))
    }
}
