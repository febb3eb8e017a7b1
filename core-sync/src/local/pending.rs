//! Pending local deletions
//!
//! An unlink is not reported right away: the file may reappear elsewhere
//! with the same content, which makes it a move. Each deferred deletion sits
//! in a [`PendingMap`] under its path, with a cancellation token for its
//! timer. Whoever takes an entry out of the map owns it: the timer executes
//! it, a correlating add turns it into a move, shutdown flushes it.

use core_metadata::{parent_path, Metadata};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
struct PendingOp {
    ticket: u64,
    doc: Metadata,
    timer: CancellationToken,
}

/// Handle given to the timer of a pending deletion
#[derive(Debug, Clone)]
pub struct Ticket {
    pub path: String,
    pub id: u64,
    pub cancelled: CancellationToken,
}

#[derive(Debug, Default)]
pub struct PendingMap {
    ops: Mutex<HashMap<String, PendingOp>>,
    next_ticket: AtomicU64,
}

impl PendingMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defer the deletion of `doc`, replacing any deletion pending at its path
    pub fn add(&self, doc: Metadata) -> Ticket {
        let id = self.next_ticket.fetch_add(1, Ordering::SeqCst);
        let timer = CancellationToken::new();
        let path = doc.path.clone();
        let previous = self.lock().insert(
            path.clone(),
            PendingOp {
                ticket: id,
                doc,
                timer: timer.clone(),
            },
        );
        if let Some(previous) = previous {
            previous.timer.cancel();
        }
        Ticket {
            path,
            id,
            cancelled: timer,
        }
    }

    /// Remove the deletion pending at `path`, stopping its timer
    pub fn take(&self, path: &str) -> Option<Metadata> {
        let op = self.lock().remove(path)?;
        op.timer.cancel();
        Some(op.doc)
    }

    /// Remove the entry `ticket` was issued for, unless it was replaced
    pub fn take_ticket(&self, ticket: &Ticket) -> Option<Metadata> {
        let mut ops = self.lock();
        match ops.get(&ticket.path) {
            Some(op) if op.ticket == ticket.id => ops.remove(&ticket.path).map(|op| op.doc),
            _ => None,
        }
    }

    pub fn contains(&self, path: &str) -> bool {
        self.lock().contains_key(path)
    }

    /// Whether a direct child of `folder` is still pending
    pub fn has_pending_child(&self, folder: &str) -> bool {
        self.lock()
            .keys()
            .any(|path| parent_path(path) == Some(folder))
    }

    /// Paths with a pending deletion
    pub fn paths(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Take every entry, deepest path first, stopping all timers
    pub fn drain(&self) -> Vec<Metadata> {
        let mut ops: Vec<PendingOp> = self.lock().drain().map(|(_, op)| op).collect();
        for op in &ops {
            op.timer.cancel();
        }
        ops.sort_by(|a, b| b.doc.path.cmp(&a.doc.path));
        ops.into_iter().map(|op| op.doc).collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, PendingOp>> {
        // A poisoned map still holds consistent entries
        self.ops.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_cancels_timer() {
        let pending = PendingMap::new();
        let ticket = pending.add(Metadata::file("a.txt"));
        assert!(pending.contains("a.txt"));

        let doc = pending.take("a.txt").unwrap();
        assert_eq!(doc.path, "a.txt");
        assert!(ticket.cancelled.is_cancelled());
        assert!(pending.is_empty());
        assert!(pending.take_ticket(&ticket).is_none());
    }

    #[test]
    fn test_replaced_entry_ignores_old_ticket() {
        let pending = PendingMap::new();
        let old = pending.add(Metadata::file("a.txt"));
        let new = pending.add(Metadata::file("a.txt").with_size(4));

        assert!(old.cancelled.is_cancelled());
        assert!(pending.take_ticket(&old).is_none());
        assert_eq!(pending.take_ticket(&new).unwrap().size, Some(4));
    }

    #[test]
    fn test_direct_children_only() {
        let pending = PendingMap::new();
        pending.add(Metadata::file("a/b/c.txt"));

        assert!(pending.has_pending_child("a/b"));
        assert!(!pending.has_pending_child("a"));
    }

    #[test]
    fn test_drain_goes_deepest_first() {
        let pending = PendingMap::new();
        pending.add(Metadata::folder("a"));
        pending.add(Metadata::file("a/b.txt"));
        pending.add(Metadata::folder("a/c"));

        let paths: Vec<_> = pending.drain().into_iter().map(|d| d.path).collect();
        assert_eq!(paths, vec!["a/c", "a/b.txt", "a"]);
        assert!(pending.is_empty());
    }
}
