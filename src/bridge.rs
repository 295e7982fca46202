//! Correlation bridge: lets a request/response caller submit a command to the
//! inbound stream and await its reply. A background consumer tails the reply
//! stream and resolves waiters by correlation id; replies nobody is waiting
//! for are discarded.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error};
use tokio::sync::{oneshot, Mutex};
use uuid::Uuid;

use crate::store::StoreError;
use crate::stream::{MessageLog, ENGINE_STREAM, REPLY_STREAM};
use crate::types::envelope::{CommandEnvelope, ReplyEnvelope};

/// How long a caller waits for the engine before giving up.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// No reply arrived in time. The command may still be applied; timeout
    /// only abandons the wait.
    #[error("timed out waiting for a reply")]
    Timeout,
    #[error(transparent)]
    Log(#[from] StoreError),
    #[error("failed to encode command: {0}")]
    Encode(#[from] serde_json::Error),
}

type PendingMap = Arc<Mutex<HashMap<Uuid, oneshot::Sender<ReplyEnvelope>>>>;

pub struct CorrelationBridge {
    log: Arc<dyn MessageLog>,
    pending: PendingMap,
    timeout: Duration,
}

impl CorrelationBridge {
    /// Start the bridge: records the reply stream's current tail and spawns
    /// the consumer from there, so stale replies from before this process are
    /// never matched.
    pub async fn start(
        log: Arc<dyn MessageLog>,
        timeout: Duration,
    ) -> Result<Self, BridgeError> {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let tail = log.last_id(REPLY_STREAM).await?;
        tokio::spawn(consume_replies(log.clone(), pending.clone(), tail));
        Ok(Self {
            log,
            pending,
            timeout,
        })
    }

    /// Publish `envelope` under `id` and await the matching reply.
    pub async fn submit(
        &self,
        id: Uuid,
        envelope: &CommandEnvelope,
    ) -> Result<ReplyEnvelope, BridgeError> {
        let data = envelope.encode()?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        if let Err(err) = self.log.append(ENGINE_STREAM, &data).await {
            self.pending.lock().await.remove(&id);
            return Err(err.into());
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            // Receiver error means the consumer dropped our sender without
            // sending, which it never does; treat it like a timeout.
            Ok(Err(_)) | Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(BridgeError::Timeout)
            }
        }
    }
}

async fn consume_replies(log: Arc<dyn MessageLog>, pending: PendingMap, mut cursor: i64) {
    loop {
        let batch = match log.wait_for(REPLY_STREAM, cursor).await {
            Ok(batch) => batch,
            Err(err) => {
                error!("reply stream read failed: {err}");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        for entry in batch {
            cursor = entry.id;
            let reply: ReplyEnvelope = match serde_json::from_str(&entry.data) {
                Ok(reply) => reply,
                Err(err) => {
                    debug!("skipping malformed reply entry: {err}");
                    continue;
                }
            };

            match pending.lock().await.remove(&reply.id) {
                Some(tx) => {
                    // A send error means the waiter timed out between our
                    // remove and this send; the reply is late either way.
                    let _ = tx.send(reply);
                }
                None => {
                    debug!("discarding unclaimed reply for {}", reply.id);
                }
            }
        }
    }
}
