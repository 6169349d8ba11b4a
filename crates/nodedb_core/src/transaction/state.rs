//! Transaction state.

use crate::engine::Shared;
use crate::error::{CoreError, CoreResult};
use crate::key::Key;
use crate::node::Node;
use crate::types::TransactionId;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Instant;

/// State of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Transaction is active and can perform operations.
    Active,
    /// Transaction has been committed.
    Committed,
    /// Transaction has been aborted.
    Aborted,
}

/// Nodes a transaction has touched.
#[derive(Default)]
pub(crate) struct Ledger {
    /// Nodes with pending writes or held locks, in registration order.
    pub(crate) dirty: Vec<Arc<Node>>,
    dirty_serials: HashSet<u64>,
    /// Nodes fetched in this transaction, by every key they were found
    /// under.
    pub(crate) clean: HashMap<Key, Arc<Node>>,
    /// Nodes whose child collection changed.
    pub(crate) parents: Vec<Arc<Node>>,
    parent_serials: HashSet<u64>,
}

/// The unit of work bound to one thread.
pub(crate) struct Transactor {
    id: TransactionId,
    engine: Weak<Shared>,
    deadline: Instant,
    state: Mutex<TransactionState>,
    ledger: Mutex<Ledger>,
}

impl Transactor {
    pub(crate) fn new(id: TransactionId, engine: Weak<Shared>, deadline: Instant) -> Self {
        Self {
            id,
            engine,
            deadline,
            state: Mutex::new(TransactionState::Active),
            ledger: Mutex::new(Ledger::default()),
        }
    }

    pub(crate) fn id(&self) -> TransactionId {
        self.id
    }

    pub(crate) fn state(&self) -> TransactionState {
        *self.state.lock()
    }

    pub(crate) fn is_active(&self) -> bool {
        self.state() == TransactionState::Active
    }

    pub(crate) fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    pub(crate) fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Returns true if this transaction belongs to `engine`.
    pub(crate) fn belongs_to(&self, engine: &Arc<Shared>) -> bool {
        std::ptr::eq(self.engine.as_ptr(), Arc::as_ptr(engine))
    }

    /// Fails unless the transaction may still take locks.
    pub(crate) fn ensure_usable(&self) -> CoreResult<()> {
        if !self.is_active() {
            return Err(CoreError::TransactionInactive {
                transaction: self.id,
            });
        }
        if self.is_expired() {
            return Err(CoreError::Timeout {
                transaction: self.id,
            });
        }
        Ok(())
    }

    /// Moves the transaction out of `Active`. Returns false if it already
    /// was.
    pub(crate) fn finish(&self, to: TransactionState) -> bool {
        let mut state = self.state.lock();
        if *state != TransactionState::Active {
            return false;
        }
        *state = to;
        true
    }

    pub(crate) fn visit_dirty(&self, node: &Arc<Node>) {
        let mut ledger = self.ledger.lock();
        if ledger.dirty_serials.insert(node.serial()) {
            ledger.dirty.push(Arc::clone(node));
        }
    }

    pub(crate) fn drop_dirty(&self, node: &Arc<Node>) {
        let mut ledger = self.ledger.lock();
        if ledger.dirty_serials.remove(&node.serial()) {
            ledger.dirty.retain(|n| !Arc::ptr_eq(n, node));
        }
    }

    pub(crate) fn visit_clean(&self, key: Key, node: &Arc<Node>) {
        self.ledger.lock().clean.insert(key, Arc::clone(node));
    }

    pub(crate) fn drop_clean(&self, key: &Key) {
        self.ledger.lock().clean.remove(key);
    }

    pub(crate) fn clean_node(&self, key: &Key) -> Option<Arc<Node>> {
        self.ledger.lock().clean.get(key).cloned()
    }

    pub(crate) fn visit_parent(&self, node: &Arc<Node>) {
        let mut ledger = self.ledger.lock();
        if ledger.parent_serials.insert(node.serial()) {
            ledger.parents.push(Arc::clone(node));
        }
    }

    /// Returns copies of the dirty and parent lists.
    pub(crate) fn pending(&self) -> (Vec<Arc<Node>>, Vec<Arc<Node>>) {
        let ledger = self.ledger.lock();
        (ledger.dirty.clone(), ledger.parents.clone())
    }

    /// Empties the ledger and returns what it held.
    pub(crate) fn take_ledger(&self) -> Ledger {
        std::mem::take(&mut *self.ledger.lock())
    }

    pub(crate) fn dirty_count(&self) -> usize {
        self.ledger.lock().dirty.len()
    }
}
