//! Change notification for committed transactions.
//!
//! Every commit produces one [`ChangeSet`] that is handed to all registered
//! [`NodeChangeListener`]s, after the transaction's locks are released.
//! [`ChangeFeed`] is a ready listener that flattens those sets into
//! sequenced [`ChangeEvent`]s for channel subscribers and pollers.
//!
//! ```rust,ignore
//! let feed = Arc::new(ChangeFeed::new());
//! let engine = Engine::builder().listener(feed.clone()).build()?;
//! let receiver = feed.subscribe();
//!
//! std::thread::spawn(move || {
//!     for event in receiver {
//!         println!("{} {:?}", event.key, event.change_type);
//!     }
//! });
//! ```

use crate::key::Key;
use crate::types::SequenceNumber;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver, Sender};

/// Everything one commit changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    /// Commit sequence.
    pub sequence: SequenceNumber,
    /// Nodes inserted.
    pub inserted: Vec<Key>,
    /// Nodes updated.
    pub updated: Vec<Key>,
    /// Nodes deleted.
    pub deleted: Vec<Key>,
    /// Nodes whose child collection changed.
    pub parents: Vec<Key>,
}

impl ChangeSet {
    /// Returns true if the commit changed nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty()
            && self.updated.is_empty()
            && self.deleted.is_empty()
            && self.parents.is_empty()
    }
}

/// Receives one callback per commit.
pub trait NodeChangeListener: Send + Sync {
    /// Called after a transaction committed.
    fn nodes_changed(&self, changes: &ChangeSet);
}

/// What happened to a node in a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    /// The node was inserted.
    Insert,
    /// The node was updated.
    Update,
    /// The node was deleted.
    Delete,
    /// The node's child collection changed.
    Touch,
}

/// One changed key of one commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    /// Commit sequence.
    pub sequence: u64,
    /// The changed node.
    pub key: Key,
    /// What happened to it.
    pub change_type: ChangeType,
}

impl ChangeEvent {
    /// Creates an event.
    #[must_use]
    pub fn new(sequence: u64, key: Key, change_type: ChangeType) -> Self {
        Self {
            sequence,
            key,
            change_type,
        }
    }

    /// Expands a change set into events: inserts, updates, deletes, then
    /// touched parents.
    #[must_use]
    pub fn from_change_set(changes: &ChangeSet) -> Vec<ChangeEvent> {
        let seq = changes.sequence.as_u64();
        let tagged = [
            (&changes.inserted, ChangeType::Insert),
            (&changes.updated, ChangeType::Update),
            (&changes.deleted, ChangeType::Delete),
            (&changes.parents, ChangeType::Touch),
        ];
        tagged
            .into_iter()
            .flat_map(|(keys, ty)| keys.iter().map(move |k| ChangeEvent::new(seq, k.clone(), ty)))
            .collect()
    }
}

#[derive(Default)]
struct FeedState {
    subscribers: Vec<Sender<ChangeEvent>>,
    history: VecDeque<ChangeEvent>,
}

/// A listener that turns commits into a stream of [`ChangeEvent`]s.
///
/// Events reach every subscriber channel in commit order and are kept in a
/// bounded history for cursor-based polling. Subscribers whose receiver
/// was dropped are forgotten on the next commit.
pub struct ChangeFeed {
    state: Mutex<FeedState>,
    capacity: usize,
}

impl ChangeFeed {
    /// Creates a feed keeping the last 10 000 events.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_history(10_000)
    }

    /// Creates a feed keeping at most `capacity` events.
    #[must_use]
    pub fn with_max_history(capacity: usize) -> Self {
        Self {
            state: Mutex::new(FeedState::default()),
            capacity,
        }
    }

    /// Returns a channel receiving every event published from now on.
    ///
    /// Drain it; undelivered events stay buffered in the channel.
    pub fn subscribe(&self) -> Receiver<ChangeEvent> {
        let (tx, rx) = mpsc::channel();
        self.state.lock().subscribers.push(tx);
        rx
    }

    /// Publishes one event.
    pub fn emit(&self, event: ChangeEvent) {
        self.publish(std::iter::once(event));
    }

    /// Publishes the events of one commit under a single lock, so
    /// concurrent commits never interleave.
    pub fn emit_batch(&self, events: Vec<ChangeEvent>) {
        self.publish(events);
    }

    fn publish(&self, events: impl IntoIterator<Item = ChangeEvent>) {
        let mut state = self.state.lock();
        for event in events {
            state
                .subscribers
                .retain(|tx| tx.send(event.clone()).is_ok());
            if state.history.len() == self.capacity {
                state.history.pop_front();
            }
            if self.capacity > 0 {
                state.history.push_back(event);
            }
        }
    }

    /// Returns up to `limit` events with a sequence above `cursor`.
    #[must_use]
    pub fn poll(&self, cursor: u64, limit: usize) -> Vec<ChangeEvent> {
        let state = self.state.lock();
        let start = state.history.partition_point(|e| e.sequence <= cursor);
        state.history.range(start..).take(limit).cloned().collect()
    }

    /// Returns the sequence of the newest retained event, or 0.
    #[must_use]
    pub fn latest_sequence(&self) -> u64 {
        self.state.lock().history.back().map_or(0, |e| e.sequence)
    }

    /// Returns the number of live subscribers as of the last publish.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    /// Returns the number of retained events.
    #[must_use]
    pub fn history_len(&self) -> usize {
        self.state.lock().history.len()
    }

    /// Drops retained events with a sequence below `min_sequence`.
    pub fn truncate_history(&self, min_sequence: u64) {
        let mut state = self.state.lock();
        let keep_from = state.history.partition_point(|e| e.sequence < min_sequence);
        state.history.drain(..keep_from);
    }
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ChangeFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeFeed")
            .field("capacity", &self.capacity)
            .field("retained", &self.history_len())
            .finish_non_exhaustive()
    }
}

impl NodeChangeListener for ChangeFeed {
    fn nodes_changed(&self, changes: &ChangeSet) {
        self.emit_batch(ChangeEvent::from_change_set(changes));
    }
}
