//! Swappable cancellation scopes.
//!
//! The dispatcher holds an ambient scope built from two tokens: a caller-supplied parent and a
//! "clear" token derived from it. Every submission captures the clear token current at the
//! time. Draining cancels that token and installs a fresh child of the same parent; replacing
//! the scope installs a new parent. Reads go through `ArcSwap` so submissions never contend
//! with each other.

use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
struct ScopeState {
    parent: CancellationToken,
    clear: CancellationToken,
}

impl ScopeState {
    fn under(parent: CancellationToken) -> Self {
        let clear = parent.child_token();
        Self { parent, clear }
    }
}

/// Ambient cancellation scope shared by every handle of one dispatcher.
#[derive(Debug, Clone)]
pub struct CancellationScope {
    inner: Arc<ArcSwap<ScopeState>>,
}

impl Default for CancellationScope {
    fn default() -> Self {
        Self::new(CancellationToken::new())
    }
}

impl CancellationScope {
    pub fn new(parent: CancellationToken) -> Self {
        Self { inner: Arc::new(ArcSwap::from_pointee(ScopeState::under(parent))) }
    }

    /// Token that submissions made right now are bound to.
    pub fn current(&self) -> CancellationToken {
        self.inner.load().clear.clone()
    }

    /// Install a new parent. Work bound to the previous scope is left alone.
    pub fn replace(&self, parent: CancellationToken) {
        self.inner.store(Arc::new(ScopeState::under(parent)));
    }

    /// Cancel everything bound to the current scope and start a fresh one under the same
    /// parent.
    pub fn drain(&self) {
        let previous = self.inner.rcu(|state| ScopeState::under(state.parent.clone()));
        previous.clear.cancel();
    }
}

/// Cancellation view captured by one request: the ambient scope at submission time, plus an
/// optional per-call token.
#[derive(Debug, Clone)]
pub struct RequestScope {
    ambient: CancellationToken,
    own: Option<CancellationToken>,
}

impl RequestScope {
    pub fn new(ambient: CancellationToken, own: Option<CancellationToken>) -> Self {
        Self { ambient, own }
    }

    pub fn is_cancelled(&self) -> bool {
        self.ambient.is_cancelled() || self.own.as_ref().is_some_and(|t| t.is_cancelled())
    }

    /// Resolves once either token fires.
    pub async fn cancelled(&self) {
        match &self.own {
            Some(own) => {
                tokio::select! {
                    _ = self.ambient.cancelled() => {}
                    _ = own.cancelled() => {}
                }
            }
            None => self.ambient.cancelled().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_cancels_captured_tokens_only() {
        let scope = CancellationScope::default();
        let before = scope.current();
        scope.drain();
        let after = scope.current();

        assert!(before.is_cancelled());
        assert!(!after.is_cancelled());

        scope.drain();
        assert!(after.is_cancelled());
    }

    #[test]
    fn replace_leaves_previous_scope_running() {
        let scope = CancellationScope::default();
        let old = scope.current();

        let parent = CancellationToken::new();
        scope.replace(parent.clone());
        let new = scope.current();
        assert!(!old.is_cancelled());

        parent.cancel();
        assert!(new.is_cancelled());
        assert!(!old.is_cancelled());
    }

    #[test]
    fn cancelled_parent_keeps_scope_cancelled_after_drain() {
        let parent = CancellationToken::new();
        let scope = CancellationScope::new(parent.clone());
        parent.cancel();
        scope.drain();
        assert!(scope.current().is_cancelled());
    }

    #[tokio::test]
    async fn request_scope_observes_either_token() {
        let ambient = CancellationToken::new();
        let own = CancellationToken::new();
        let scope = RequestScope::new(ambient.clone(), Some(own.clone()));
        assert!(!scope.is_cancelled());

        own.cancel();
        assert!(scope.is_cancelled());
        scope.cancelled().await;
    }
}
