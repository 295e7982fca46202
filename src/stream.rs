//! Durable, at-least-once message log: the inbound command stream and the
//! reply stream are both named, append-only sequences of JSON entries.
//!
//! `PgMessageLog` keeps entries in a bigserial-keyed table and polls;
//! `MemoryLog` backs tests and single-process wiring with a notified Vec.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use tokio::sync::{Mutex, Notify};

use crate::persistence;
use crate::store::StoreError;

/// Inbound command stream name.
pub const ENGINE_STREAM: &str = "engine-stream";
/// Reply stream name.
pub const REPLY_STREAM: &str = "callback-queue";

/// Entries per read; bounds the work done between cursor saves.
const BATCH_LIMIT: i64 = 64;

pub type EntryId = i64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub id: EntryId,
    pub data: String,
}

#[async_trait]
pub trait MessageLog: Send + Sync {
    /// Append one entry, returning its id. Ids are strictly increasing per
    /// stream; an entry is never updated in place.
    async fn append(&self, stream: &str, data: &str) -> Result<EntryId, StoreError>;

    /// Entries with id > `after`, oldest first, up to `limit`.
    async fn read_after(
        &self,
        stream: &str,
        after: EntryId,
        limit: i64,
    ) -> Result<Vec<LogEntry>, StoreError>;

    /// Block until at least one entry past `after` exists, then return a
    /// batch. The consumer's suspension point between reads.
    async fn wait_for(&self, stream: &str, after: EntryId) -> Result<Vec<LogEntry>, StoreError>;

    /// Id of the newest entry, or 0 for an empty stream. Lets a consumer
    /// start at the current tail.
    async fn last_id(&self, stream: &str) -> Result<EntryId, StoreError>;
}

/// Postgres-backed log. `wait_for` is a poll loop; the interval trades
/// latency against idle query load.
pub struct PgMessageLog {
    pool: PgPool,
    poll_interval: Duration,
}

impl PgMessageLog {
    pub fn new(pool: PgPool, poll_interval: Duration) -> Self {
        Self {
            pool,
            poll_interval,
        }
    }
}

#[async_trait]
impl MessageLog for PgMessageLog {
    async fn append(&self, stream: &str, data: &str) -> Result<EntryId, StoreError> {
        Ok(persistence::append_entry(&self.pool, stream, data).await?)
    }

    async fn read_after(
        &self,
        stream: &str,
        after: EntryId,
        limit: i64,
    ) -> Result<Vec<LogEntry>, StoreError> {
        let rows = persistence::read_entries_after(&self.pool, stream, after, limit).await?;
        Ok(rows
            .into_iter()
            .map(|row| LogEntry {
                id: row.id,
                data: row.data,
            })
            .collect())
    }

    async fn wait_for(&self, stream: &str, after: EntryId) -> Result<Vec<LogEntry>, StoreError> {
        loop {
            let batch = self.read_after(stream, after, BATCH_LIMIT).await?;
            if !batch.is_empty() {
                return Ok(batch);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn last_id(&self, stream: &str) -> Result<EntryId, StoreError> {
        Ok(persistence::last_entry_id(&self.pool, stream).await?)
    }
}

/// In-process log with the same ordering contract. Entry ids are 1-based
/// offsets into the per-stream Vec.
#[derive(Default)]
pub struct MemoryLog {
    streams: Mutex<HashMap<String, Vec<String>>>,
    appended: Notify,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageLog for MemoryLog {
    async fn append(&self, stream: &str, data: &str) -> Result<EntryId, StoreError> {
        let mut streams = self.streams.lock().await;
        let entries = streams.entry(stream.to_string()).or_default();
        entries.push(data.to_string());
        let id = entries.len() as EntryId;
        drop(streams);
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn read_after(
        &self,
        stream: &str,
        after: EntryId,
        limit: i64,
    ) -> Result<Vec<LogEntry>, StoreError> {
        let streams = self.streams.lock().await;
        let entries = match streams.get(stream) {
            Some(entries) => entries,
            None => return Ok(Vec::new()),
        };
        let start = (after.max(0) as usize).min(entries.len());
        Ok(entries[start..]
            .iter()
            .take(limit.max(0) as usize)
            .enumerate()
            .map(|(offset, data)| LogEntry {
                id: (start + offset + 1) as EntryId,
                data: data.clone(),
            })
            .collect())
    }

    async fn wait_for(&self, stream: &str, after: EntryId) -> Result<Vec<LogEntry>, StoreError> {
        loop {
            // Register before checking so an append between the check and the
            // await cannot be missed.
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = self.read_after(stream, after, BATCH_LIMIT).await?;
            if !batch.is_empty() {
                return Ok(batch);
            }
            notified.await;
        }
    }

    async fn last_id(&self, stream: &str) -> Result<EntryId, StoreError> {
        let streams = self.streams.lock().await;
        Ok(streams
            .get(stream)
            .map(|entries| entries.len() as EntryId)
            .unwrap_or(0))
    }
}
