//! Store operation counters.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct StoreMetrics {
    creates: AtomicU64,
    creates_external: AtomicU64,
    create_batches: AtomicU64,
    create_batch_items: AtomicU64,
    record_too_big_promotions: AtomicU64,
    tx_exists: AtomicU64,
    spends: AtomicU64,
    spend_rejections: AtomicU64,
    unspends: AtomicU64,
    freezes: AtomicU64,
    unfreezes: AtomicU64,
    reassignments: AtomicU64,
    unlocks: AtomicU64,
    mined_updates: AtomicU64,
    unmined_updates: AtomicU64,
    conflicting_marked: AtomicU64,
    dah_assigned: AtomicU64,
    dah_cleared: AtomicU64,
    records_swept: AtomicU64,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct StoreMetricsSnapshot {
    pub creates: u64,
    pub creates_external: u64,
    pub create_batches: u64,
    pub create_batch_items: u64,
    pub record_too_big_promotions: u64,
    pub tx_exists: u64,
    pub spends: u64,
    pub spend_rejections: u64,
    pub unspends: u64,
    pub freezes: u64,
    pub unfreezes: u64,
    pub reassignments: u64,
    pub unlocks: u64,
    pub mined_updates: u64,
    pub unmined_updates: u64,
    pub conflicting_marked: u64,
    pub dah_assigned: u64,
    pub dah_cleared: u64,
    pub records_swept: u64,
}

impl StoreMetrics {
    pub fn record_create(&self) {
        self.creates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_create_external(&self) {
        self.creates_external.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batch(&self, items: usize) {
        self.create_batches.fetch_add(1, Ordering::Relaxed);
        self.create_batch_items
            .fetch_add(items as u64, Ordering::Relaxed);
    }

    pub fn record_too_big_promotion(&self) {
        self.record_too_big_promotions
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tx_exists(&self) {
        self.tx_exists.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_spends(&self, count: usize) {
        self.spends.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_spend_rejection(&self) {
        self.spend_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unspends(&self, count: usize) {
        self.unspends.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_freezes(&self, count: usize) {
        self.freezes.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_unfreezes(&self, count: usize) {
        self.unfreezes.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_reassignment(&self) {
        self.reassignments.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unlock(&self) {
        self.unlocks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_mined(&self) {
        self.mined_updates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unmined(&self) {
        self.unmined_updates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_conflicting_marked(&self) {
        self.conflicting_marked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dah_assigned(&self) {
        self.dah_assigned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dah_cleared(&self) {
        self.dah_cleared.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_swept(&self, count: usize) {
        self.records_swept.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StoreMetricsSnapshot {
        StoreMetricsSnapshot {
            creates: self.creates.load(Ordering::Relaxed),
            creates_external: self.creates_external.load(Ordering::Relaxed),
            create_batches: self.create_batches.load(Ordering::Relaxed),
            create_batch_items: self.create_batch_items.load(Ordering::Relaxed),
            record_too_big_promotions: self.record_too_big_promotions.load(Ordering::Relaxed),
            tx_exists: self.tx_exists.load(Ordering::Relaxed),
            spends: self.spends.load(Ordering::Relaxed),
            spend_rejections: self.spend_rejections.load(Ordering::Relaxed),
            unspends: self.unspends.load(Ordering::Relaxed),
            freezes: self.freezes.load(Ordering::Relaxed),
            unfreezes: self.unfreezes.load(Ordering::Relaxed),
            reassignments: self.reassignments.load(Ordering::Relaxed),
            unlocks: self.unlocks.load(Ordering::Relaxed),
            mined_updates: self.mined_updates.load(Ordering::Relaxed),
            unmined_updates: self.unmined_updates.load(Ordering::Relaxed),
            conflicting_marked: self.conflicting_marked.load(Ordering::Relaxed),
            dah_assigned: self.dah_assigned.load(Ordering::Relaxed),
            dah_cleared: self.dah_cleared.load(Ordering::Relaxed),
            records_swept: self.records_swept.load(Ordering::Relaxed),
        }
    }
}
