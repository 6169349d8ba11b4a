//! Thread-bound transactions.
//!
//! A transaction is bound to the thread that began it and is found
//! implicitly by every node operation on that thread. Write locks are taken
//! per node on first mutation and fail fast; nothing here ever blocks on
//! another transaction.
//!
//! - **Atomic visibility per node**: a node's changes become visible to
//!   other transactions only after its flush at commit
//! - **Fail-fast locking**: a second writer gets a conflict, not a wait
//! - **Abort on drop**: an uncommitted [`Transaction`] aborts when dropped

mod manager;
mod state;

pub(crate) use manager::{abort, bind, commit, current, unbind};
pub(crate) use state::Transactor;
pub use state::TransactionState;

use crate::change_feed::ChangeSet;
use crate::engine::Engine;
use crate::error::CoreResult;
use crate::types::TransactionId;
use std::marker::PhantomData;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Guard for the transaction bound to the current thread.
///
/// The guard cannot leave its thread. Dropping it without calling
/// [`Transaction::commit`] aborts the transaction.
pub struct Transaction {
    transactor: Arc<Transactor>,
    engine: Engine,
    _thread_bound: PhantomData<Rc<()>>,
}

impl Transaction {
    pub(crate) fn new(transactor: Arc<Transactor>, engine: Engine) -> Self {
        Self {
            transactor,
            engine,
            _thread_bound: PhantomData,
        }
    }

    /// Returns the transaction id.
    #[must_use]
    pub fn id(&self) -> TransactionId {
        self.transactor.id()
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> TransactionState {
        self.transactor.state()
    }

    /// Returns the time left before lock checks start failing.
    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.transactor
            .deadline()
            .saturating_duration_since(Instant::now())
    }

    /// Commits the transaction.
    ///
    /// # Errors
    ///
    /// Returns the first write error, after aborting. Returns
    /// [`crate::CoreError::Timeout`] if the deadline has passed.
    pub fn commit(self) -> CoreResult<ChangeSet> {
        commit(&self.engine, &self.transactor)
    }

    /// Aborts the transaction, discarding all pending changes.
    pub fn abort(self) {
        abort(&self.engine, &self.transactor);
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.transactor.is_active() {
            abort(&self.engine, &self.transactor);
        }
        unbind(&self.transactor);
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}
