//! Durable register for an in-flight bulk migration.
//!
//! The batch lives under one consensus key so that leader hand-over keeps its
//! progress. Items are popped in order and durably removed before their
//! condition tasks are scheduled; a crash in between loses at most the popped
//! items, which an out-of-band reconcile can re-emit.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::cluster::{keys, MigrationItem};
use crate::consensus::ConsensusKv;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MigrateRecord {
    token: u64,
    items: Vec<MigrationItem>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrateStatus {
    Empty,
    Active { remaining: usize, token: u64 },
}

pub struct MigrateRegister {
    kv: Arc<dyn ConsensusKv>,
    // Serializes read-modify-write of the register key.
    lock: Mutex<()>,
}

impl MigrateRegister {
    pub fn new(kv: Arc<dyn ConsensusKv>) -> Self {
        Self {
            kv,
            lock: Mutex::new(()),
        }
    }

    async fn read(&self) -> Result<Option<MigrateRecord>> {
        match self.kv.get(keys::MIGRATE).await? {
            Some(bytes) => Ok(Some(
                serde_json::from_slice(&bytes)
                    .map_err(|err| Error::Corruption(format!("migrate record: {err}")))?,
            )),
            None => Ok(None),
        }
    }

    /// Store a fresh batch. Rejected while a non-empty batch is active.
    pub async fn init(&self, items: Vec<MigrationItem>) -> Result<u64> {
        if items.is_empty() {
            return Err(Error::InvalidArgument("empty migration batch".into()));
        }
        let _guard = self.lock.lock().await;
        if let Some(record) = self.read().await? {
            if !record.items.is_empty() {
                return Err(Error::InvalidArgument(format!(
                    "migration {} still has {} items",
                    record.token,
                    record.items.len()
                )));
            }
        }
        let record = MigrateRecord {
            token: crate::now_micros(),
            items,
        };
        self.kv
            .set(keys::MIGRATE, serde_json::to_vec(&record)?)
            .await?;
        Ok(record.token)
    }

    /// Pop up to `n` head items, persisting the truncated queue before
    /// returning them. `NotFound` iff the queue is empty.
    pub async fn get_n(&self, n: usize) -> Result<Vec<MigrationItem>> {
        let _guard = self.lock.lock().await;
        let mut record = match self.read().await? {
            Some(record) if !record.items.is_empty() => record,
            _ => return Err(Error::NotFound("no pending migration item".into())),
        };
        let take = n.min(record.items.len());
        let popped: Vec<MigrationItem> = record.items.drain(..take).collect();
        self.kv
            .set(keys::MIGRATE, serde_json::to_vec(&record)?)
            .await?;
        Ok(popped)
    }

    pub async fn cancel(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.kv.delete(keys::MIGRATE).await
    }

    pub async fn status(&self) -> Result<MigrateStatus> {
        let _guard = self.lock.lock().await;
        Ok(match self.read().await? {
            Some(record) => MigrateStatus::Active {
                remaining: record.items.len(),
                token: record.token,
            },
            None => MigrateStatus::Empty,
        })
    }
}
