use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Snapshot of the engine's counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnifferStats {
    /// Faults resolved against a tracked region.
    pub faults_handled: u64,

    /// Faults on addresses no tracked region covers.
    pub faults_foreign: u64,

    /// Faults parked because the registry was busy on the faulting thread.
    pub faults_deferred: u64,

    /// Faults on pages that were released while the fault was in flight.
    pub faults_stale: u64,

    /// Failed attempts to restore write access from the fault path.
    pub restore_failures: u64,

    /// Successful protection changes requested by the engine.
    pub protection_changes: u64,
}

#[derive(Default)]
pub(crate) struct Counters {
    pub faults_handled: AtomicU64,
    pub faults_foreign: AtomicU64,
    pub faults_deferred: AtomicU64,
    pub faults_stale: AtomicU64,
    pub restore_failures: AtomicU64,
    pub protection_changes: AtomicU64,
}

impl Counters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SnifferStats {
        SnifferStats {
            faults_handled: self.faults_handled.load(Ordering::Relaxed),
            faults_foreign: self.faults_foreign.load(Ordering::Relaxed),
            faults_deferred: self.faults_deferred.load(Ordering::Relaxed),
            faults_stale: self.faults_stale.load(Ordering::Relaxed),
            restore_failures: self.restore_failures.load(Ordering::Relaxed),
            protection_changes: self.protection_changes.load(Ordering::Relaxed),
        }
    }
}
