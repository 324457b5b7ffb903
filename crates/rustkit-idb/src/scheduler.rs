//! Admission of transactions by scope overlap.

use tracing::debug;

use crate::ids::TransactionId;
use crate::transaction::TransactionMode;

#[derive(Debug, Clone)]
struct Entry {
    id: TransactionId,
    scope: Vec<String>,
    versionchange: bool,
    running: bool,
}

impl Entry {
    fn overlaps(&self, other: &Entry) -> bool {
        self.versionchange
            || other.versionchange
            || self.scope.iter().any(|name| other.scope.contains(name))
    }
}

/// Per-database scheduler.
///
/// Transactions with intersecting scopes never run at the same time. A
/// waiting transaction also waits behind every earlier waiting transaction
/// it overlaps, so a stream of later work cannot starve it.
#[derive(Debug, Default)]
pub struct TransactionScheduler {
    /// Unfinished transactions in submission order.
    entries: Vec<Entry>,
}

impl TransactionScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a transaction.
    pub fn submit(&mut self, id: TransactionId, scope: &[String], mode: TransactionMode) {
        self.entries.push(Entry {
            id,
            scope: scope.to_vec(),
            versionchange: mode == TransactionMode::VersionChange,
            running: false,
        });
    }

    /// Start every waiting transaction that may now run. Returns the newly
    /// started ones in submission order.
    pub fn admit(&mut self) -> Vec<TransactionId> {
        let mut admitted = Vec::new();
        for i in 0..self.entries.len() {
            if self.entries[i].running {
                continue;
            }
            let candidate = &self.entries[i];
            let blocked = self.entries.iter().enumerate().any(|(j, other)| {
                j != i && (other.running || j < i) && candidate.overlaps(other)
            });
            if !blocked {
                self.entries[i].running = true;
                debug!(txn = %self.entries[i].id, "Transaction admitted");
                admitted.push(self.entries[i].id);
            }
        }
        admitted
    }

    /// Forget a finished (or never started) transaction.
    pub fn finish(&mut self, id: TransactionId) {
        self.entries.retain(|entry| entry.id != id);
    }

    pub fn is_running(&self, id: TransactionId) -> bool {
        self.entries.iter().any(|entry| entry.id == id && entry.running)
    }

    /// Transactions still waiting to start.
    pub fn waiting(&self) -> usize {
        self.entries.iter().filter(|entry| !entry.running).count()
    }

    pub fn is_idle(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_disjoint_scopes_run_together() {
        let mut scheduler = TransactionScheduler::new();
        let a = TransactionId::new();
        let b = TransactionId::new();
        scheduler.submit(a, &scope(&["books"]), TransactionMode::ReadWrite);
        scheduler.submit(b, &scope(&["authors"]), TransactionMode::ReadWrite);

        assert_eq!(scheduler.admit(), vec![a, b]);
        assert!(scheduler.is_running(a) && scheduler.is_running(b));
    }

    #[test]
    fn test_overlapping_scopes_serialize() {
        let mut scheduler = TransactionScheduler::new();
        let a = TransactionId::new();
        let b = TransactionId::new();
        scheduler.submit(a, &scope(&["books", "authors"]), TransactionMode::ReadWrite);
        scheduler.submit(b, &scope(&["authors"]), TransactionMode::ReadOnly);

        assert_eq!(scheduler.admit(), vec![a]);
        assert!(scheduler.admit().is_empty());

        scheduler.finish(a);
        assert_eq!(scheduler.admit(), vec![b]);
    }

    #[test]
    fn test_earlier_waiter_blocks_later_transaction() {
        let mut scheduler = TransactionScheduler::new();
        let a = TransactionId::new();
        let b = TransactionId::new();
        let c = TransactionId::new();
        scheduler.submit(a, &scope(&["x"]), TransactionMode::ReadWrite);
        scheduler.submit(b, &scope(&["x", "y"]), TransactionMode::ReadWrite);
        scheduler.submit(c, &scope(&["y"]), TransactionMode::ReadWrite);

        // c does not overlap a, but must wait behind b.
        assert_eq!(scheduler.admit(), vec![a]);
        assert_eq!(scheduler.waiting(), 2);

        scheduler.finish(a);
        assert_eq!(scheduler.admit(), vec![b]);
        scheduler.finish(b);
        assert_eq!(scheduler.admit(), vec![c]);
    }

    #[test]
    fn test_versionchange_is_exclusive() {
        let mut scheduler = TransactionScheduler::new();
        let upgrade = TransactionId::new();
        let other = TransactionId::new();
        scheduler.submit(upgrade, &[], TransactionMode::VersionChange);
        scheduler.submit(other, &scope(&["books"]), TransactionMode::ReadOnly);

        assert_eq!(scheduler.admit(), vec![upgrade]);
        assert!(scheduler.admit().is_empty());
        scheduler.finish(upgrade);
        assert_eq!(scheduler.admit(), vec![other]);
        scheduler.finish(other);
        assert!(scheduler.is_idle());
    }
}
