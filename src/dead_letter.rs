//! Terminal records for poison messages and the stores that hold them.
//!
//! A [`DeadLetterRecord`] is created exactly once, when the retry engine
//! determines no further redelivery is warranted, and is never mutated or
//! re-enqueued afterwards. Stores keep records for inspection until the
//! configured TTL expires.

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{BusError, BusResult};
use crate::message::MessageEnvelope;
use crate::retry::DeadLetterReason;

/// Everything an operator needs to inspect a poison message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterRecord {
    pub message_id: String,
    pub subject: String,
    pub body: Vec<u8>,
    pub reason: DeadLetterReason,
    /// Display chain of the error that condemned the message.
    pub error_detail: String,
    pub delivery_count: u32,
    pub application_properties:
        std::collections::HashMap<String, serde_json::Value>,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetterRecord {
    pub fn from_envelope(
        envelope: &MessageEnvelope,
        reason: DeadLetterReason,
        error_detail: impl Into<String>,
    ) -> Self {
        Self {
            message_id: envelope.message_id.clone(),
            subject: envelope.subject.clone(),
            body: envelope.body.clone(),
            reason,
            error_detail: error_detail.into(),
            delivery_count: envelope.delivery_count,
            application_properties: envelope.application_properties.clone(),
            dead_lettered_at: Utc::now(),
        }
    }
}

/// Store for dead-letter records.
pub trait DeadLetterStore: Send + Sync {
    /// Persist one record. Called exactly once per poison message.
    fn record(&self, record: &DeadLetterRecord) -> BusResult<()>;

    /// All retained records, oldest first.
    fn records(&self) -> BusResult<Vec<DeadLetterRecord>>;

    /// Drop records older than `ttl`; returns how many were removed.
    fn purge_expired(&self, ttl: Duration) -> BusResult<usize>;
}

/// Durable store backed by a sled tree. Keys are
/// `{dead_lettered_at nanos}:{message_id}` so iteration is oldest-first.
pub struct SledDeadLetterStore {
    tree: sled::Tree,
}

impl SledDeadLetterStore {
    pub fn open(path: &std::path::Path) -> BusResult<Self> {
        let db = sled::open(path)?;
        let tree = db.open_tree("dead_letters")?;
        Ok(Self { tree })
    }

    fn key_for(record: &DeadLetterRecord) -> Vec<u8> {
        let nanos = record
            .dead_lettered_at
            .timestamp_nanos_opt()
            .unwrap_or(i64::MAX);
        format!("{nanos:020}:{}", record.message_id).into_bytes()
    }
}

impl DeadLetterStore for SledDeadLetterStore {
    fn record(&self, record: &DeadLetterRecord) -> BusResult<()> {
        let value = serde_json::to_vec(record)?;
        self.tree.insert(Self::key_for(record), value)?;
        self.tree.flush()?;
        Ok(())
    }

    fn records(&self) -> BusResult<Vec<DeadLetterRecord>> {
        let mut out = Vec::new();
        for item in self.tree.iter() {
            let (_, value) = item?;
            out.push(serde_json::from_slice(&value)?);
        }
        Ok(out)
    }

    fn purge_expired(&self, ttl: Duration) -> BusResult<usize> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(ttl)
                .unwrap_or_else(|_| chrono::Duration::days(365));
        let mut purged = 0;
        for item in self.tree.iter() {
            let (key, value) = item?;
            let record: DeadLetterRecord = serde_json::from_slice(&value)?;
            if record.dead_lettered_at < cutoff {
                self.tree.remove(key)?;
                purged += 1;
            }
        }
        if purged > 0 {
            self.tree.flush()?;
        }
        Ok(purged)
    }
}

/// In-memory store for tests and infrastructure-less environments.
#[derive(Default)]
pub struct MemoryDeadLetterStore {
    records: Mutex<Vec<DeadLetterRecord>>,
}

impl MemoryDeadLetterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DeadLetterStore for MemoryDeadLetterStore {
    fn record(&self, record: &DeadLetterRecord) -> BusResult<()> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| BusError::transport("dead-letter store poisoned"))?;
        records.push(record.clone());
        Ok(())
    }

    fn records(&self) -> BusResult<Vec<DeadLetterRecord>> {
        let records = self
            .records
            .lock()
            .map_err(|_| BusError::transport("dead-letter store poisoned"))?;
        Ok(records.clone())
    }

    fn purge_expired(&self, ttl: Duration) -> BusResult<usize> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(ttl)
                .unwrap_or_else(|_| chrono::Duration::days(365));
        let mut records = self
            .records
            .lock()
            .map_err(|_| BusError::transport("dead-letter store poisoned"))?;
        let before = records.len();
        records.retain(|r| r.dead_lettered_at >= cutoff);
        Ok(before - records.len())
    }
}
