//! Track the next upgrade to install.
//!
//! The [Tracker] holds at most one pending [Proposal]. A newly observed actionable proposal
//! always replaces the pending one, in arrival order (a later-arriving proposal with a lower id
//! still wins). The slot is emptied when a download begins, not when the install succeeds, and
//! it is never persisted: a crash in between loses the pending upgrade until it is observed again.

use crate::proposal::Proposal;
use std::sync::{Arc, Mutex};

/// Shared handle to the pending upgrade slot.
#[derive(Clone, Default)]
pub struct Tracker {
    pending: Arc<Mutex<Option<Proposal>>>,
}

impl Tracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `proposal` as the next upgrade if it is actionable.
    ///
    /// Returns whether the pending slot was replaced.
    pub fn observe(&self, proposal: Proposal) -> bool {
        if !proposal.is_actionable() {
            return false;
        }
        *self.lock() = Some(proposal);
        true
    }

    /// Atomically remove and return the pending upgrade.
    pub fn take(&self) -> Option<Proposal> {
        self.lock().take()
    }

    /// Return a copy of the pending upgrade without clearing it.
    pub fn peek(&self) -> Option<Proposal> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Proposal>> {
        // A poisoned slot still holds a complete value
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proposal::{Kind, Status, Strategy};
    use std::thread;

    fn proposal(id: u64, kind: Kind, status: Status) -> Proposal {
        Proposal {
            id,
            kind,
            strategy: Strategy::Simple,
            proposer: String::new(),
            title: String::new(),
            description: String::new(),
            block_number: id * 10,
            total_votes: 0,
            pass_votes: Vec::new(),
            reject_votes: Vec::new(),
            status,
            download_urls: vec![format!("http://mirror/{id}.tar.gz")],
            check_hash: String::new(),
        }
    }

    #[test]
    fn test_last_actionable_wins() {
        let tracker = Tracker::new();
        let sequence = [
            proposal(1, Kind::NodeUpgrade, Status::Approved),
            proposal(2, Kind::NodeUpgrade, Status::Voting),
            proposal(5, Kind::NodeUpgrade, Status::Approved),
            proposal(6, Kind::NodeAdd, Status::Approved),
            // Lower id arriving later still replaces the slot
            proposal(3, Kind::NodeUpgrade, Status::Approved),
            proposal(7, Kind::NodeUpgrade, Status::Rejected),
            proposal(8, Kind::CouncilElect, Status::Approved),
        ];

        let mut expected = None;
        for p in sequence {
            let actionable = p.is_actionable();
            if actionable {
                expected = Some(p.clone());
            }
            assert_eq!(tracker.observe(p), actionable);
            assert_eq!(tracker.peek(), expected);
        }
        assert_eq!(tracker.peek().unwrap().id, 3);
    }

    #[test]
    fn test_non_actionable_never_fills() {
        let tracker = Tracker::new();
        assert!(!tracker.observe(proposal(1, Kind::NodeRemove, Status::Approved)));
        assert!(!tracker.observe(proposal(2, Kind::NodeUpgrade, Status::Voting)));
        assert!(tracker.take().is_none());
    }

    #[test]
    fn test_take_clears() {
        let tracker = Tracker::new();
        tracker.observe(proposal(1, Kind::NodeUpgrade, Status::Approved));
        assert_eq!(tracker.take().unwrap().id, 1);
        assert!(tracker.take().is_none());
        assert!(tracker.peek().is_none());
    }

    #[test]
    fn test_take_is_atomic() {
        for _ in 0..50 {
            let tracker = Tracker::new();
            tracker.observe(proposal(0, Kind::NodeUpgrade, Status::Approved));

            // Race observers against a single take
            let observers: Vec<_> = (1..=4)
                .map(|i| {
                    let tracker = tracker.clone();
                    thread::spawn(move || {
                        for j in 0..100 {
                            let id = i * 1000 + j;
                            tracker.observe(proposal(id, Kind::NodeUpgrade, Status::Approved));
                        }
                    })
                })
                .collect();
            let first = tracker.take();
            for observer in observers {
                observer.join().unwrap();
            }
            assert!(first.is_some());

            // Once observers are done, a take empties the slot for good
            let _ = tracker.take();
            assert!(tracker.take().is_none());
        }
    }
}
