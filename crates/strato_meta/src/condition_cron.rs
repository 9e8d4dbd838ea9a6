//! Offset-gated deferred updates.
//!
//! Structural changes that must wait for data-plane replication are parked
//! here as (condition, task) pairs. A ticker scans the pending entries in
//! insertion order; every entry whose candidate has caught up with its
//! reference fires its task into the update pipeline. Entries whose offsets
//! stay unknown past the wait bound are abandoned — the partition is left in
//! whatever state it holds, typically Stuck, for an operator to clear.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::cluster::{Node, UpdateTask};
use crate::offsets::NodeOffsetMap;
use crate::update_thread::UpdateThread;

/// Satisfied once `candidate`'s reported offset reaches `reference`'s.
#[derive(Debug, Clone, PartialEq)]
pub struct OffsetCondition {
    pub table: String,
    pub partition: u32,
    pub reference: Node,
    pub candidate: Node,
}

#[derive(Debug, Clone, Copy)]
pub struct ConditionCronConfig {
    pub tick: Duration,
    /// Abandon an entry whose offsets have been unknown this long.
    pub max_wait: Duration,
}

impl Default for ConditionCronConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(500),
            max_wait: Duration::from_secs(600),
        }
    }
}

struct CronEntry {
    cond: OffsetCondition,
    task: UpdateTask,
    added: Instant,
}

#[derive(Clone)]
pub struct ConditionCron {
    entries: Arc<Mutex<Vec<CronEntry>>>,
}

impl ConditionCron {
    pub fn spawn(
        offsets: Arc<NodeOffsetMap>,
        update: UpdateThread,
        cfg: ConditionCronConfig,
    ) -> Self {
        let cron = Self {
            entries: Arc::new(Mutex::new(Vec::new())),
        };
        let entries = cron.entries.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cfg.tick);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                tick_once(&entries, &offsets, &update, cfg.max_wait);
            }
        });
        cron
    }

    pub fn add_cron_task(&self, cond: OffsetCondition, task: UpdateTask) {
        let mut entries = self.entries.lock().expect("cron entries poisoned");
        entries.push(CronEntry {
            cond,
            task,
            added: Instant::now(),
        });
    }

    pub fn pending_len(&self) -> usize {
        self.entries.lock().expect("cron entries poisoned").len()
    }
}

fn tick_once(
    entries: &Mutex<Vec<CronEntry>>,
    offsets: &NodeOffsetMap,
    update: &UpdateThread,
    max_wait: Duration,
) {
    let mut entries = entries.lock().expect("cron entries poisoned");
    let mut kept = Vec::with_capacity(entries.len());
    for entry in entries.drain(..) {
        let reference = offsets.lookup(
            &entry.cond.table,
            entry.cond.partition,
            &entry.cond.reference,
        );
        let candidate = offsets.lookup(
            &entry.cond.table,
            entry.cond.partition,
            &entry.cond.candidate,
        );
        match (reference, candidate) {
            (Some(reference), Some(candidate)) if candidate >= reference => {
                tracing::info!(
                    table = %entry.cond.table,
                    partition = entry.cond.partition,
                    candidate = %entry.cond.candidate,
                    reference = %entry.cond.reference,
                    "offset condition met, firing deferred update"
                );
                update.pending_update(entry.task);
            }
            (None, _) | (_, None) if entry.added.elapsed() >= max_wait => {
                tracing::warn!(
                    table = %entry.cond.table,
                    partition = entry.cond.partition,
                    candidate = %entry.cond.candidate,
                    reference = %entry.cond.reference,
                    "offsets unknown past wait bound, abandoning deferred update"
                );
            }
            _ => kept.push(entry),
        }
    }
    *entries = kept;
}
