// Copyright 2025 Molt Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The cooperative interrupt tree.
//!
//! Every thread's active scopes form a chain of [`Interrupt`] nodes (at
//! most one child per node). Interrupting a node marks it and all of its
//! transitive children. Notification callbacks come in two kinds: *inline*
//! callbacks run while the tree locks are held and may only do short,
//! lock-bounded work (the branch fan-out uses this to enqueue its
//! children); *deferred* callbacks are queued and run by
//! [`InterruptQueue::finish`] once every lock along the chain has been
//! released, so arbitrary user code cannot deadlock against the tree.

use crate::error::Error;
use crate::state;
use crate::sync;
use core::fmt;
use std::sync::Arc;
use std::vec::Vec;

type InlineFn = Box<dyn Fn(&mut InterruptQueue) + Send + Sync>;
type DeferredFn = Box<dyn Fn() -> Result<(), Error> + Send + Sync>;

enum Notify {
    /// Runs while the node's lock is held; must only take short locks.
    Inline(InlineFn),
    /// Queued and run by [`InterruptQueue::finish`] outside all locks.
    Deferred(DeferredFn),
}

/// One node of the interrupt tree.
pub struct Interrupt {
    inner: sync::Mutex<Inner>,
    notify: Notify,
}

struct Inner {
    interrupted: bool,
    parent: Option<Arc<Interrupt>>,
    child: Option<Arc<Interrupt>>,
    /// Guards against double-enqueueing a deferred notification.
    queued: bool,
}

/// Collects notification work while tree locks are held; drained by
/// [`finish`](InterruptQueue::finish) after they are released.
pub struct InterruptQueue {
    deferred: Vec<Arc<Interrupt>>,
}

// === impl Interrupt ===

impl Interrupt {
    /// A node whose notification runs inline, under the tree locks. The
    /// callback must only take short locks of its own.
    pub fn new_inline(notify: impl Fn(&mut InterruptQueue) + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            inner: sync::Mutex::new(Inner {
                interrupted: false,
                parent: None,
                child: None,
                queued: false,
            }),
            notify: Notify::Inline(Box::new(notify)),
        })
    }

    /// A node whose notification is deferred to
    /// [`InterruptQueue::finish`], outside every tree lock. Errors from the
    /// callback are reported and swallowed; the interrupt still counts as
    /// delivered.
    pub fn new_deferred(
        notify: impl Fn() -> Result<(), Error> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            inner: sync::Mutex::new(Inner {
                interrupted: false,
                parent: None,
                child: None,
                queued: false,
            }),
            notify: Notify::Deferred(Box::new(notify)),
        })
    }

    /// Pushes this node as the calling thread's innermost interrupt point.
    ///
    /// If the parent is already interrupted the new node's notification
    /// fires immediately (outside the locks): there is no window in which
    /// a freshly pushed child escapes an already-cancelled parent.
    ///
    /// # Panics
    ///
    /// Panics if the node is already linked into a tree.
    pub fn push(self: &Arc<Self>) {
        let parent = state::with_current(|ts| ts.interrupt_point());

        {
            let inner = self.inner.lock();
            assert!(inner.parent.is_none(), "interrupt node pushed twice");
            assert!(inner.child.is_none(), "interrupt node pushed twice");
        }

        let mut run_callbacks = false;
        if let Some(parent) = &parent {
            // The parent link is set before publication in the parent's
            // child slot, so a concurrent interrupter that reaches us
            // through the parent finds a fully formed node.
            self.inner.lock().parent = Some(Arc::clone(parent));

            let mut parent_inner = parent.inner.lock();
            assert!(
                parent_inner.child.is_none(),
                "interrupt parent already has a child"
            );
            parent_inner.child = Some(Arc::clone(self));
            if parent_inner.interrupted {
                run_callbacks = true;
            }
        }

        state::with_current(|ts| ts.set_interrupt_point(Some(Arc::clone(self))));

        if run_callbacks {
            let mut queue = InterruptQueue::new();
            queue.add_from_parent(self);
            // Mark ourselves (and anything already hanging below) too, so
            // cooperative checks on this thread observe the state at once.
            queue.add(self);
            queue.finish();
        }
    }

    /// Pops this node; it must be the calling thread's innermost point and
    /// have no child.
    pub fn pop(self: &Arc<Self>) {
        let current = state::with_current(|ts| ts.interrupt_point());
        assert!(
            current.is_some_and(|point| Arc::ptr_eq(&point, self)),
            "popping wrong interrupt point"
        );
        assert!(self.inner.lock().child.is_none(), "popping interrupt with child");

        let parent = self.inner.lock().parent.take();
        state::with_current(|ts| ts.set_interrupt_point(parent.clone()));
        if let Some(parent) = parent {
            let mut parent_inner = parent.inner.lock();
            debug_assert!(
                parent_inner
                    .child
                    .as_ref()
                    .is_some_and(|child| Arc::ptr_eq(child, self))
            );
            parent_inner.child = None;
        }

        // Other threads may still hold a reference and be mid-interrupt;
        // cycling our lock makes sure none is inside before the node is
        // reused or dropped.
        drop(self.inner.lock());
    }

    /// Marks this node and its transitive children, running notifications
    /// as described at the module level. The node's own notification runs
    /// too (when it is linked), so a scope interrupted directly behaves
    /// exactly as if the signal had arrived from an ancestor.
    pub fn interrupt(self: &Arc<Self>) {
        let mut queue = InterruptQueue::new();
        queue.add_from_parent(self);
        queue.add(self);
        queue.finish();
    }

    pub fn is_interrupted(&self) -> bool {
        self.inner.lock().interrupted
    }

    /// Pre-marks a node that has never been pushed (used for work
    /// submitted to an already-interrupting scope).
    pub(crate) fn mark_interrupted(&self) {
        let mut inner = self.inner.lock();
        debug_assert!(inner.parent.is_none() && inner.child.is_none());
        inner.interrupted = true;
    }
}

impl fmt::Debug for Interrupt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Interrupt")
            .field("interrupted", &inner.interrupted)
            .field("has_parent", &inner.parent.is_some())
            .field("has_child", &inner.child.is_some())
            .finish_non_exhaustive()
    }
}

// === impl InterruptQueue ===

impl InterruptQueue {
    #[expect(clippy::new_without_default, reason = "queues are short-lived locals")]
    pub fn new() -> Self {
        Self {
            deferred: Vec::new(),
        }
    }

    /// Marks `node` interrupted and propagates down its subtree,
    /// collecting notification work. Safe to call while holding other
    /// short locks.
    pub fn add(&mut self, node: &Arc<Interrupt>) {
        let mut inner = node.inner.lock();
        if inner.interrupted {
            return;
        }
        inner.interrupted = true;
        let child = inner.child.clone();
        drop(inner);
        if let Some(child) = child {
            // Notify the child that its parent was interrupted, then mark
            // the rest of the subtree the same way.
            self.add_from_parent(&child);
            self.add(&child);
        }
    }

    /// Queues `node`'s parent-notification: its parent was interrupted.
    /// Inline notifications run right here (under the node's lock);
    /// deferred ones wait for [`finish`](InterruptQueue::finish).
    pub fn add_from_parent(&mut self, node: &Arc<Interrupt>) {
        let inner = node.inner.lock();
        if inner.parent.is_none() {
            // Unlinked concurrently; the scope is already gone.
            return;
        }
        match &node.notify {
            Notify::Inline(callback) => {
                // Runs with `node.inner` held: inline callbacks are bound
                // to short lock-only work.
                callback(self);
                drop(inner);
            }
            Notify::Deferred(_) => {
                drop(inner);
                let mut inner = node.inner.lock();
                if !inner.queued {
                    inner.queued = true;
                    drop(inner);
                    self.deferred.push(Arc::clone(node));
                }
            }
        }
    }

    /// Runs every deferred notification. Must be called with no tree locks
    /// held. Callback errors are reported as unraisable and swallowed.
    pub fn finish(mut self) {
        for node in self.deferred.drain(..) {
            let result = match &node.notify {
                Notify::Deferred(callback) => callback(),
                Notify::Inline(_) => unreachable!("inline notification queued as deferred"),
            };
            node.inner.lock().queued = false;
            if let Err(err) = result {
                tracing::warn!(error = %err, "unraisable error in interrupt callback");
            }
        }
    }
}

impl Drop for InterruptQueue {
    fn drop(&mut self) {
        debug_assert!(
            self.deferred.is_empty(),
            "interrupt queue dropped without finish"
        );
    }
}

/// Raises `Interrupted` if the calling thread's innermost interrupt point
/// has been marked.
///
/// # Errors
///
/// Returns [`Error::interrupted`] when interrupted.
pub fn check_interrupted() -> Result<(), Error> {
    let point = state::with_current(|ts| ts.interrupt_point())
        .expect("thread has no interrupt point");
    if point.is_interrupted() {
        Err(Error::interrupted())
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Runtime;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn interrupt_marks_node() {
        let runtime = Runtime::new();
        let frame = runtime.enter();

        let node = Interrupt::new_inline(|_| {});
        node.push();
        assert!(check_interrupted().is_ok());

        node.interrupt();
        assert!(node.is_interrupted());
        assert!(check_interrupted().unwrap_err().is_interrupted());

        node.pop();
        frame.exit();
    }

    #[test]
    fn interrupt_propagates_to_children() {
        let runtime = Runtime::new();
        let frame = runtime.enter();

        let fired = Arc::new(AtomicUsize::new(0));
        let outer = Interrupt::new_inline(|_| {});
        let inner = Interrupt::new_deferred({
            let fired = fired.clone();
            move || {
                fired.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        outer.push();
        inner.push();

        outer.interrupt();
        assert!(outer.is_interrupted());
        assert!(inner.is_interrupted());
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        inner.pop();
        outer.pop();
        frame.exit();
    }

    #[test]
    fn push_under_interrupted_parent_fires_immediately() {
        let runtime = Runtime::new();
        let frame = runtime.enter();

        let fired = Arc::new(AtomicUsize::new(0));
        let outer = Interrupt::new_inline(|_| {});
        outer.push();
        outer.interrupt();

        let inner = Interrupt::new_deferred({
            let fired = fired.clone();
            move || {
                fired.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        inner.push();
        // No escape window: the freshly pushed child is already notified.
        assert!(inner.is_interrupted() || fired.load(Ordering::SeqCst) == 1);
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        inner.pop();
        outer.pop();
        frame.exit();
    }

    #[test]
    fn interrupting_twice_notifies_once() {
        let runtime = Runtime::new();
        let frame = runtime.enter();

        let fired = Arc::new(AtomicUsize::new(0));
        let outer = Interrupt::new_inline(|_| {});
        let inner = Interrupt::new_deferred({
            let fired = fired.clone();
            move || {
                fired.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        outer.push();
        inner.push();

        outer.interrupt();
        outer.interrupt();
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        inner.pop();
        outer.pop();
        frame.exit();
    }

    #[test]
    fn callback_errors_are_swallowed() {
        let runtime = Runtime::new();
        let frame = runtime.enter();

        let node = Interrupt::new_deferred(|| Err(Error::value_error("callback failed")));
        let parent = Interrupt::new_inline(|_| {});
        parent.push();
        node.push();

        // The error is reported as unraisable; the interrupt still counts
        // as delivered.
        parent.interrupt();
        assert!(node.is_interrupted());

        node.pop();
        parent.pop();
        frame.exit();
    }
}
