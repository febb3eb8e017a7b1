//! # Sync State
//!
//! Observable summary of the pipeline: up to date, syncing, or stopped on an
//! error.
//!
//! ## Overview
//!
//! The state is derived, never set directly: it follows from the operations
//! in flight, the changes committed to the store but not read by the engine
//! yet, and the last fatal condition. Each operation holds an [`InFlight`]
//! guard for its duration; dropping the guard recomputes the state. Queued
//! changes are the distance between the store's committed sequence and the
//! engine's read position. Subscribers receive updates through a
//! `tokio::sync::watch` channel.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncState {
    UpToDate,
    Syncing { in_flight: u64, queued: u64 },
    Error { message: String },
}

impl SyncState {
    pub fn is_up_to_date(&self) -> bool {
        matches!(self, SyncState::UpToDate)
    }
}

/// Committed sequence of the store against the last one read
#[derive(Debug)]
struct FeedPosition {
    committed: watch::Receiver<i64>,
    read: i64,
}

impl FeedPosition {
    fn queued(&self) -> u64 {
        (*self.committed.borrow() - self.read).max(0) as u64
    }
}

#[derive(Debug)]
struct Inner {
    in_flight: AtomicU64,
    feed: Mutex<Option<FeedPosition>>,
    fatal: Mutex<Option<String>>,
    sender: watch::Sender<SyncState>,
}

impl Inner {
    fn publish(&self) {
        let fatal = self.fatal.lock().map(|f| f.clone()).unwrap_or(None);
        let in_flight = self.in_flight.load(Ordering::SeqCst);
        let queued = self
            .feed
            .lock()
            .ok()
            .and_then(|feed| feed.as_ref().map(FeedPosition::queued))
            .unwrap_or(0);
        let state = match (fatal, in_flight, queued) {
            (Some(message), _, _) => SyncState::Error { message },
            (None, 0, 0) => SyncState::UpToDate,
            (None, in_flight, queued) => SyncState::Syncing { in_flight, queued },
        };
        self.sender.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }
}

/// Shared, cloneable tracker
#[derive(Debug, Clone)]
pub struct SyncStateTracker {
    inner: Arc<Inner>,
}

impl Default for SyncStateTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncStateTracker {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(SyncState::UpToDate);
        Self {
            inner: Arc::new(Inner {
                in_flight: AtomicU64::new(0),
                feed: Mutex::new(None),
                fatal: Mutex::new(None),
                sender,
            }),
        }
    }

    /// Count an operation as in flight until the guard is dropped
    pub fn begin(&self) -> InFlight {
        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        self.inner.publish();
        InFlight {
            inner: self.inner.clone(),
        }
    }

    pub fn in_flight(&self) -> u64 {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Count changes committed to `committed` after `read` as queued
    pub fn follow_feed(&self, committed: watch::Receiver<i64>, read: i64) {
        if let Ok(mut feed) = self.inner.feed.lock() {
            *feed = Some(FeedPosition { committed, read });
        }
        self.inner.publish();
    }

    /// The engine read the feed up to `seq`
    pub fn feed_read(&self, seq: i64) {
        if let Ok(mut feed) = self.inner.feed.lock() {
            if let Some(feed) = feed.as_mut() {
                feed.read = seq;
            }
        }
        self.inner.publish();
    }

    /// Recompute after the store committed something
    pub fn refresh(&self) {
        self.inner.publish();
    }

    pub fn set_fatal(&self, message: impl Into<String>) {
        if let Ok(mut fatal) = self.inner.fatal.lock() {
            *fatal = Some(message.into());
        }
        self.inner.publish();
    }

    pub fn clear_fatal(&self) {
        if let Ok(mut fatal) = self.inner.fatal.lock() {
            *fatal = None;
        }
        self.inner.publish();
    }

    pub fn current(&self) -> SyncState {
        self.inner.publish();
        self.inner.sender.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncState> {
        self.inner.sender.subscribe()
    }
}

/// Guard returned by [`SyncStateTracker::begin`]
#[derive(Debug)]
pub struct InFlight {
    inner: Arc<Inner>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.inner.publish();
    }
}
