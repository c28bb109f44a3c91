//! Cancellation registry
//!
//! One CancellationToken per in-flight execution, shared between the
//! dispatcher (which triggers) and the worker driving the run (which
//! observes at suspension points). Cancellation is cooperative.

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Shared map of cancellation tokens keyed by execution id
#[derive(Default)]
pub struct CancellationRegistry {
    tokens: DashMap<Uuid, CancellationToken>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token for an execution, created on first access
    pub fn token_for(&self, execution_id: Uuid) -> CancellationToken {
        self.tokens
            .entry(execution_id)
            .or_insert_with(CancellationToken::new)
            .clone()
    }

    /// Signal cancellation. Returns true if a live token was present.
    pub fn cancel(&self, execution_id: Uuid) -> bool {
        match self.tokens.get(&execution_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Drop the token once the execution reaches a terminal state
    pub fn remove(&self, execution_id: Uuid) {
        self.tokens.remove(&execution_id);
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_is_shared() {
        let registry = CancellationRegistry::new();
        let id = Uuid::now_v7();

        let a = registry.token_for(id);
        let b = registry.token_for(id);
        assert!(!a.is_cancelled());

        registry.cancel(id);
        assert!(a.is_cancelled());
        assert!(b.is_cancelled());
    }

    #[test]
    fn test_cancel_unknown_execution() {
        let registry = CancellationRegistry::new();
        assert!(!registry.cancel(Uuid::now_v7()));
    }

    #[test]
    fn test_remove_clears_entry() {
        let registry = CancellationRegistry::new();
        let id = Uuid::now_v7();
        registry.token_for(id);
        assert_eq!(registry.len(), 1);
        registry.remove(id);
        assert!(registry.is_empty());
    }
}
