//! The cleanup stack: a last-in-first-out list of compensating actions that
//! is the spine of every multi-step operation (spec §4.1). Each irreversible
//! step pushes its undo before the next step begins; on any error the stack
//! runs every action, swallowing and logging individual failures so one
//! failing cleanup never masks another.

use std::future::Future;
use std::pin::Pin;

type BoxedAction = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

/// An ordered list of undo actions, run most-recently-pushed first.
#[derive(Default)]
pub struct CleanupStack {
    actions: Vec<BoxedAction>,
}

impl CleanupStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a compensating action. It will run before any action pushed
    /// earlier in this stack.
    pub fn add<F, Fut>(&mut self, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.actions.push(Box::new(move || Box::pin(action())));
    }

    /// Prepend another stack's actions onto this one. After `combine`, the
    /// other stack's actions run first (in their own most-recent-first
    /// order), then this stack's original actions — the usual shape for
    /// folding a nested sub-operation's undo steps into its caller's.
    pub fn combine(&mut self, mut other: CleanupStack) {
        self.actions.append(&mut other.actions);
    }

    /// Returns `true` if no actions are pending.
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Run every action, most recently pushed first. Each action's panic or
    /// (logically) its own failure never stops later actions from running;
    /// since actions here are fallible-but-self-contained closures, callers
    /// are expected to swallow their own errors before returning `()`.
    pub async fn perform_actions(mut self) {
        while let Some(action) = self.actions.pop() {
            action().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn actions_run_in_reverse_order() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut stack = CleanupStack::new();

        for i in 0..3 {
            let order = order.clone();
            stack.add(move || async move {
                order.lock().unwrap().push(i);
            });
        }

        stack.perform_actions().await;
        assert_eq!(*order.lock().unwrap(), vec![2, 1, 0]);
    }

    #[tokio::test]
    async fn one_failing_action_does_not_block_others() {
        let counter = Arc::new(AtomicUsize::new(0));

        let mut stack = CleanupStack::new();
        stack.add({
            let counter = counter.clone();
            move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        stack.add(|| async move {
            // Simulates a cleanup step that encountered an error internally
            // and logged it, without propagating anything out.
            tracing::warn!("simulated cleanup failure, swallowed");
        });
        stack.add({
            let counter = counter.clone();
            move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        stack.perform_actions().await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn combine_prepends_other_stacks_actions() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let mut inner = CleanupStack::new();
        {
            let order = order.clone();
            inner.add(move || async move { order.lock().unwrap().push("inner") });
        }

        let mut outer = CleanupStack::new();
        {
            let order = order.clone();
            outer.add(move || async move { order.lock().unwrap().push("outer") });
        }
        outer.combine(inner);

        outer.perform_actions().await;
        // `inner`'s steps happened after `outer`'s, so they unwind first.
        assert_eq!(*order.lock().unwrap(), vec!["inner", "outer"]);
    }
}
