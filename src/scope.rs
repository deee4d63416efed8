//! Cancellation Scope Tree
//!
//! Hierarchical cancellation tokens. Cancelling a scope flips its flag, cancels
//! every descendant and runs every waiter registered anywhere in that subtree.
//! Cancellation is one-way.
//!
//! ```text
//!            root
//!           /    \
//!      caller    monitor
//!       /   \
//!   press   hold
//! ```
//!
//! Parents hold their children weakly, children hold their parent strongly, so
//! a scope with no handles left simply disappears.
//!
//! Async waits go through [`CancellationScope::cancelled`], which is backed by a
//! `tokio_util` token wired up as a child of the parent's token.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::SessionError;

static NEXT_SCOPE_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_WAITER_ID: AtomicU64 = AtomicU64::new(1);

type Waiter = Box<dyn FnOnce() + Send>;

/// Handle returned by [`CancellationScope::register_waiter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WaiterId(u64);

struct ScopeNode {
    id: u64,
    parent: Option<Arc<ScopeNode>>,
    token: CancellationToken,
    state: Mutex<ScopeState>,
}

#[derive(Default)]
struct ScopeState {
    cancelled: bool,
    children: Vec<Weak<ScopeNode>>,
    waiters: Vec<(WaiterId, Waiter)>,
}

impl ScopeNode {
    fn lock(&self) -> MutexGuard<'_, ScopeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A cheap, clonable reference to one node of the tree.
#[derive(Clone)]
pub struct CancellationScope {
    node: Arc<ScopeNode>,
}

impl CancellationScope {
    pub fn root() -> Self {
        Self {
            node: Arc::new(ScopeNode {
                id: NEXT_SCOPE_ID.fetch_add(1, Ordering::Relaxed),
                parent: None,
                token: CancellationToken::new(),
                state: Mutex::new(ScopeState::default()),
            }),
        }
    }

    /// Creates a child. A child of a cancelled scope is born cancelled.
    pub fn child(&self) -> Self {
        let node = Arc::new(ScopeNode {
            id: NEXT_SCOPE_ID.fetch_add(1, Ordering::Relaxed),
            parent: Some(self.node.clone()),
            token: self.node.token.child_token(),
            state: Mutex::new(ScopeState::default()),
        });

        let mut parent = self.node.lock();
        if parent.cancelled {
            node.lock().cancelled = true;
            node.token.cancel();
        } else {
            parent.children.retain(|child| child.strong_count() > 0);
            parent.children.push(Arc::downgrade(&node));
        }
        drop(parent);

        Self { node }
    }

    pub fn id(&self) -> u64 {
        self.node.id
    }

    pub fn is_cancelled(&self) -> bool {
        self.node.lock().cancelled
    }

    /// `Err(Cancelled)` once this scope has been cancelled.
    pub fn check(&self) -> Result<(), SessionError> {
        if self.is_cancelled() {
            Err(SessionError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Cancels this scope and its whole subtree, then runs the collected waiters
    /// with no scope lock held.
    pub fn cancel(&self) {
        let mut waiters: Vec<Waiter> = Vec::new();
        let mut stack = vec![self.node.clone()];

        while let Some(node) = stack.pop() {
            let mut state = node.lock();
            if state.cancelled {
                continue;
            }
            state.cancelled = true;
            waiters.extend(state.waiters.drain(..).map(|(_, waiter)| waiter));
            stack.extend(state.children.drain(..).filter_map(|child| child.upgrade()));
            drop(state);
            node.token.cancel();
        }

        debug!(
            "Cancelled scope {} ({} waiters woken)",
            self.node.id,
            waiters.len()
        );
        for waiter in waiters {
            waiter();
        }
    }

    /// Registers a callback run exactly once when this scope (or an ancestor)
    /// is cancelled. Fails with `Cancelled` if that already happened, in which
    /// case the callback is dropped without running.
    pub fn register_waiter<F>(&self, waiter: F) -> Result<WaiterId, SessionError>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.node.lock();
        if state.cancelled {
            return Err(SessionError::Cancelled);
        }
        let id = WaiterId(NEXT_WAITER_ID.fetch_add(1, Ordering::Relaxed));
        state.waiters.push((id, Box::new(waiter)));
        Ok(id)
    }

    /// Drops a waiter that is no longer interested. Unknown ids are ignored.
    pub fn deregister_waiter(&self, id: WaiterId) {
        self.node.lock().waiters.retain(|(waiter, _)| *waiter != id);
    }

    /// Resolves once this scope is cancelled.
    pub async fn cancelled(&self) {
        self.node.token.cancelled().await
    }

    /// True if `ancestor` is this scope or one of its ancestors.
    pub fn is_within(&self, ancestor: &CancellationScope) -> bool {
        let mut current = Some(&self.node);
        while let Some(node) = current {
            if Arc::ptr_eq(node, &ancestor.node) {
                return true;
            }
            current = node.parent.as_ref();
        }
        false
    }

    #[cfg(test)]
    fn waiter_count(&self) -> usize {
        self.node.lock().waiters.len()
    }

    #[cfg(test)]
    fn child_count(&self) -> usize {
        self.node
            .lock()
            .children
            .iter()
            .filter(|child| child.strong_count() > 0)
            .count()
    }
}

impl std::fmt::Debug for CancellationScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationScope")
            .field("id", &self.node.id)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn cancelling_a_parent_cancels_all_descendants() {
        let root = CancellationScope::root();
        let child = root.child();
        let grandchild = child.child();
        let sibling = root.child();

        child.cancel();
        assert!(child.is_cancelled());
        assert!(grandchild.is_cancelled());
        assert!(!root.is_cancelled());
        assert!(!sibling.is_cancelled());

        root.cancel();
        assert!(sibling.is_cancelled());
        assert_eq!(root.check(), Err(SessionError::Cancelled));
    }

    #[test]
    fn children_of_a_cancelled_scope_are_born_cancelled() {
        let root = CancellationScope::root();
        root.cancel();
        let late = root.child();
        assert!(late.is_cancelled());
        assert!(late.register_waiter(|| {}).is_err());
    }

    #[test]
    fn waiters_across_the_subtree_run_exactly_once() {
        let root = CancellationScope::root();
        let child = root.child();
        let grandchild = child.child();
        let hits = Arc::new(AtomicUsize::new(0));

        for scope in [&root, &child, &grandchild] {
            let hits = hits.clone();
            scope
                .register_waiter(move || {
                    hits.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }

        root.cancel();
        root.cancel();
        child.cancel();
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert_eq!(grandchild.waiter_count(), 0);
    }

    #[test]
    fn deregistered_waiters_do_not_run() {
        let root = CancellationScope::root();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let id = root
            .register_waiter(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        root.deregister_waiter(id);
        root.cancel();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn dropped_children_are_discarded() {
        let root = CancellationScope::root();
        let kept = root.child();
        drop(root.child());
        let _another = root.child();
        assert_eq!(root.child_count(), 2);
        assert!(kept.is_within(&root));
        assert!(!root.is_within(&kept));
    }

    #[tokio::test]
    async fn async_waits_wake_on_ancestor_cancellation() {
        let root = CancellationScope::root();
        let leaf = root.child().child();

        let waiter = tokio::spawn({
            let leaf = leaf.clone();
            async move { leaf.cancelled().await }
        });

        tokio::task::yield_now().await;
        std::thread::spawn(move || root.cancel()).join().unwrap();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter woke")
            .unwrap();
        assert!(leaf.is_cancelled());
    }
}
