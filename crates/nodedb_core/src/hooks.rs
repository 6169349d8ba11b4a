//! Application lifecycle hooks.

use crate::node::Node;
use std::error::Error;
use std::sync::Arc;

/// A lifecycle hook the engine invokes on nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hook {
    /// After a fetched node has been registered in the cache.
    OnInit,
    /// Before a node is inserted or updated.
    OnPersist,
    /// Before a node's row or record is deleted.
    OnRemove,
}

impl Hook {
    /// Returns the hook's conventional name.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Hook::OnInit => "onInit",
            Hook::OnPersist => "onPersist",
            Hook::OnRemove => "onRemove",
        }
    }
}

/// The request-processing environment the engine runs in.
///
/// Hook failures are logged and counted, never propagated.
pub trait RequestContext: Send + Sync {
    /// Returns true if a processing context is active on the calling
    /// thread. Fetched nodes are only cached while one is.
    fn is_active(&self) -> bool;

    /// Runs a hook on a node.
    ///
    /// # Errors
    ///
    /// Returns whatever the application's hook reported.
    fn invoke(&self, node: &Arc<Node>, hook: Hook) -> Result<(), Box<dyn Error + Send + Sync>>;
}

/// A context that is always active and runs no hooks.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopContext;

impl RequestContext for NoopContext {
    fn is_active(&self) -> bool {
        true
    }

    fn invoke(&self, _node: &Arc<Node>, _hook: Hook) -> Result<(), Box<dyn Error + Send + Sync>> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::Key;

    #[test]
    fn hook_names() {
        assert_eq!(Hook::OnInit.name(), "onInit");
        assert_eq!(Hook::OnPersist.name(), "onPersist");
        assert_eq!(Hook::OnRemove.name(), "onRemove");
    }

    #[test]
    fn noop_context_is_active() {
        let ctx = NoopContext;
        assert!(ctx.is_active());
        assert!(ctx
            .invoke(&Node::for_test(Key::embedded("1")), Hook::OnInit)
            .is_ok());
    }
}
