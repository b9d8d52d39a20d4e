//! Priority scheduler.
//!
//! Decides which eligible job a requesting worker receives next. Each class
//! has a weight: the number of worker slots conceptually reserved for it.
//! Classes below their weight are scanned first, highest to lowest; classes at
//! their cap follow, so a free slot is never left idle while eligible work
//! exists.
//!
//! The scan order is handed to [`JobStore::lease`](crate::store::JobStore::lease)
//! in one call, so selection and the lease transition are a single atomic
//! store operation. Caps are soft: two workers racing can briefly exceed one.

use crate::job::{JobRecord, Priority};
use crate::metrics::JobMetrics;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Tracks per-class activity and produces lease scan orders.
#[derive(Debug, Clone)]
pub struct PriorityScheduler {
    /// Configured classes with weights, highest priority first.
    weights: Vec<(Priority, u32)>,

    /// Jobs currently executing, per class.
    active: Arc<Mutex<HashMap<Priority, u32>>>,
}

impl PriorityScheduler {
    /// Create a scheduler for the configured classes.
    pub fn new(weights: &BTreeMap<Priority, u32>) -> Self {
        // BTreeMap iterates lowest first.
        let weights = weights.iter().rev().map(|(p, w)| (*p, *w)).collect();
        Self {
            weights,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Returns true if `priority` is a configured class.
    pub fn accepts(&self, priority: Priority) -> bool {
        self.weights.iter().any(|(p, _)| *p == priority)
    }

    /// Configured classes, highest first.
    pub fn classes(&self) -> Vec<Priority> {
        self.weights.iter().map(|(p, _)| *p).collect()
    }

    /// Jobs of `priority` currently executing.
    pub fn active_count(&self, priority: Priority) -> u32 {
        self.active.lock().get(&priority).copied().unwrap_or(0)
    }

    /// Order in which classes should be tried for the next lease.
    pub fn lease_order(&self) -> Vec<Priority> {
        let active = self.active.lock();
        let (under_cap, at_cap): (Vec<(Priority, u32)>, Vec<(Priority, u32)>) = self
            .weights
            .iter()
            .copied()
            .partition(|(p, w)| active.get(p).copied().unwrap_or(0) < *w);

        under_cap
            .into_iter()
            .chain(at_cap)
            .map(|(p, _)| p)
            .collect()
    }

    /// Count `record` as executing until the returned lease is dropped.
    pub fn track(&self, record: JobRecord) -> ActiveLease {
        let priority = record.priority;
        let count = {
            let mut active = self.active.lock();
            let count = active.entry(priority).or_insert(0);
            *count += 1;
            *count
        };
        JobMetrics::active_changed(priority, count);

        ActiveLease {
            record,
            slot: ActiveSlot {
                priority,
                active: Arc::clone(&self.active),
            },
        }
    }
}

/// A leased job counted against its class while it executes.
#[derive(Debug)]
pub struct ActiveLease {
    /// The leased record.
    pub record: JobRecord,
    slot: ActiveSlot,
}

impl ActiveLease {
    /// Priority class of the leased job.
    pub fn priority(&self) -> Priority {
        self.slot.priority
    }
}

#[derive(Debug)]
struct ActiveSlot {
    priority: Priority,
    active: Arc<Mutex<HashMap<Priority, u32>>>,
}

impl Drop for ActiveSlot {
    fn drop(&mut self) {
        let count = {
            let mut active = self.active.lock();
            let count = active.entry(self.priority).or_insert(0);
            *count = count.saturating_sub(1);
            *count
        };
        JobMetrics::active_changed(self.priority, count);
    }
}
