//! Undo stacks for multi-step mutations.
//!
//! A reverter collects undo hooks while an operation makes progress. On
//! success the stack is discarded; on failure the hooks run in reverse
//! insertion order. Hooks must be idempotent; their own errors are logged
//! and never mask the original failure.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tracing::warn;

type Hook = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

/// A LIFO stack of async undo hooks.
///
/// Clones share the same stack, so a reverter can be handed into closures
/// while the creator decides the outcome.
#[derive(Clone, Default)]
pub struct Reverter {
    hooks: Arc<Mutex<Vec<Hook>>>,
}

impl Reverter {
    /// Create an empty reverter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Push an undo hook. Hooks run in reverse insertion order on failure.
    pub fn add<F, Fut>(&self, hook: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut hooks = self.hooks.lock().expect("reverter lock poisoned");
        hooks.push(Box::new(move || Box::pin(hook())));
    }

    /// Number of pending hooks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.hooks.lock().expect("reverter lock poisoned").len()
    }

    /// Whether the stack is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Discard all hooks; the mutation succeeded.
    pub fn success(&self) {
        self.hooks.lock().expect("reverter lock poisoned").clear();
    }

    /// Run all hooks in reverse insertion order; the mutation failed.
    pub async fn fail(&self) {
        let hooks: Vec<Hook> = {
            let mut guard = self.hooks.lock().expect("reverter lock poisoned");
            guard.drain(..).collect()
        };

        for hook in hooks.into_iter().rev() {
            hook().await;
        }
    }
}

impl Drop for Reverter {
    fn drop(&mut self) {
        // Only the last clone checks; a non-empty stack at that point means
        // neither success() nor fail() was called.
        if Arc::strong_count(&self.hooks) == 1 {
            let hooks = self.hooks.lock().expect("reverter lock poisoned");
            if !hooks.is_empty() {
                warn!(pending = hooks.len(), "Reverter dropped with pending undo hooks");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_fail_runs_in_reverse_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let reverter = Reverter::new();

        for i in 0..3 {
            let order = order.clone();
            reverter.add(move || async move {
                order.lock().unwrap().push(i);
            });
        }

        reverter.fail().await;
        assert_eq!(*order.lock().unwrap(), vec![2, 1, 0]);
        assert!(reverter.is_empty());
    }

    #[tokio::test]
    async fn test_success_discards_hooks() {
        let calls = Arc::new(AtomicUsize::new(0));
        let reverter = Reverter::new();

        let counter = calls.clone();
        reverter.add(move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        reverter.success();
        reverter.fail().await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
