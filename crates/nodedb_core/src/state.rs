//! Node lifecycle states.

use crate::error::{CoreError, CoreResult};

/// Lifecycle state of a node.
///
/// ```text
/// Transient -> New -> Clean <-> Modified
///                     Clean/Modified -> Deleted -> Modified (re-attached)
///              any persisted state   -> Invalid (terminal)
/// Transient -> Virtual              (derived views, never New or Clean)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeState {
    /// Not yet persistable; invisible to the shared cache.
    Transient,
    /// Derived view materialized from a parent and relation. Never stored.
    Virtual,
    /// Evicted or deleted by a committed transaction. Must be refetched.
    Invalid,
    /// Matches the backing store.
    Clean,
    /// Created in the current transaction, not yet inserted.
    New,
    /// Changed in the current transaction.
    Modified,
    /// Deleted in the current transaction.
    Deleted,
}

impl NodeState {
    /// Returns true if `to` is a legal successor of this state.
    #[must_use]
    pub fn can_transition_to(self, to: NodeState) -> bool {
        use NodeState::{Clean, Deleted, Invalid, Modified, New, Transient, Virtual};
        match (self, to) {
            (Invalid, _) => false,
            (_, Invalid) => self != Transient,
            (Transient, New | Virtual | Transient) => true,
            (Virtual, Virtual) => true,
            (New, New | Clean | Deleted) => true,
            (Clean | Modified, Clean | Modified | Deleted) => true,
            (Deleted, Deleted | Clean | Modified) => true,
            _ => false,
        }
    }

    /// Validates a transition.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::IllegalTransition`] if the move is not allowed.
    pub fn transition(self, to: NodeState) -> CoreResult<NodeState> {
        if self.can_transition_to(to) {
            Ok(to)
        } else {
            Err(CoreError::IllegalTransition { from: self, to })
        }
    }

    /// Returns true for states that have pending writes.
    #[must_use]
    pub fn is_dirty(self) -> bool {
        matches!(self, NodeState::New | NodeState::Modified | NodeState::Deleted)
    }

    /// Returns true for states whose changes are never written.
    ///
    /// Status changes requested on passive nodes are ignored.
    #[must_use]
    pub fn is_passive(self) -> bool {
        matches!(
            self,
            NodeState::Transient | NodeState::Virtual | NodeState::Invalid
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_is_terminal() {
        for to in [
            NodeState::Transient,
            NodeState::Virtual,
            NodeState::Clean,
            NodeState::New,
            NodeState::Modified,
            NodeState::Deleted,
            NodeState::Invalid,
        ] {
            assert!(!NodeState::Invalid.can_transition_to(to));
        }
    }

    #[test]
    fn virtual_never_becomes_persistent() {
        assert!(NodeState::Virtual.transition(NodeState::New).is_err());
        assert!(NodeState::Virtual.transition(NodeState::Clean).is_err());
        assert!(NodeState::Virtual.transition(NodeState::Invalid).is_ok());
    }

    #[test]
    fn normal_lifecycle() {
        let s = NodeState::Transient.transition(NodeState::New).unwrap();
        let s = s.transition(NodeState::Clean).unwrap();
        let s = s.transition(NodeState::Modified).unwrap();
        let s = s.transition(NodeState::Clean).unwrap();
        let s = s.transition(NodeState::Deleted).unwrap();
        assert_eq!(s.transition(NodeState::Invalid).unwrap(), NodeState::Invalid);
    }

    #[test]
    fn transient_cannot_skip_to_clean() {
        let err = NodeState::Transient.transition(NodeState::Clean).unwrap_err();
        assert!(matches!(
            err,
            CoreError::IllegalTransition {
                from: NodeState::Transient,
                to: NodeState::Clean
            }
        ));
    }
}
