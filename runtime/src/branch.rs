// Copyright 2025 Molt Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Structured concurrency: [`Branch`] and [`Collate`] scopes.
//!
//! A branch scope spawns OS-thread children bound to the enclosing scope:
//! the scope cannot exit until every child has terminated. Each child runs
//! on its own thread state with its own interrupt node hanging under the
//! branch's base node, so one failure (or an interrupt arriving from
//! outside) fans out to every sibling.
//!
//! On exit, `Branch` re-raises one representative error (the single
//! "interesting" non-interrupted failure when there is exactly one), while
//! `Collate` aggregates every failure unchanged. Both attach the full list
//! of child errors, in submission order, as the cause chain.

use crate::cancel::CancelScope;
use crate::error::Error;
use crate::interrupt::{Interrupt, InterruptQueue};
use crate::object::{self, ObjectRef};
use crate::shareable::{require_shareable, require_shareable_args};
use crate::state::{self, Runtime};
use crate::sync::{self, Semaphore};
use core::cell::UnsafeCell;
use core::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::vec::Vec;

/// A child worker's body: receives the (shareable) argument objects and
/// returns a (shareable) result object.
pub type ChildFn = Box<dyn FnOnce(Vec<ObjectRef>) -> Result<ObjectRef, Error> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BranchState {
    New,
    Alive,
    Dying,
    Dead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Branch,
    Collate,
}

struct BranchCore {
    kind: Kind,
    lock: sync::Mutex<Locked>,
    /// Toggled between 1 and 0 on the "any live children" transition; exit
    /// takes the permit and blocks until the last child posts it back.
    nothreads: Semaphore,
    /// Set once the base interrupt fired; children submitted afterwards
    /// start pre-interrupted.
    interrupting: AtomicBool,
}

struct Locked {
    state: BranchState,
    /// All child records (including the main-body record) in submission
    /// order.
    children: Vec<Arc<Child>>,
    main_child: Option<Arc<Child>>,
    base_interrupt: Option<Arc<Interrupt>>,
    /// The cancel scope the branch pushes on the scope owner's stack, so
    /// that cancelling an enclosing scope interrupts the whole branch.
    body_scope: Option<Arc<CancelScope>>,
    thread_count: usize,
    result_count: usize,
    exception_count: usize,
}

struct Child {
    interrupt: Arc<Interrupt>,
    save_result: bool,
    /// Lets the child's interrupt notification reach the cancel scope the
    /// child pushes once it is running.
    bridge: Arc<OnceLock<Arc<CancelScope>>>,
    /// Written by the child thread while it runs; read by the scope owner
    /// only after the branch is `Dead` (the no-threads semaphore is the
    /// barrier).
    slot: UnsafeCell<ChildSlot>,
}

#[derive(Default)]
struct ChildSlot {
    result: Option<ObjectRef>,
    error: Option<Error>,
}

// Safety: `slot` is written exclusively by the child thread before it
// detaches and read only after the semaphore barrier; everything else is
// synchronized.
unsafe impl Send for Child {}
// Safety: see above.
unsafe impl Sync for Child {}

// === impl Child ===

impl Child {
    fn new(save_result: bool) -> Arc<Self> {
        let bridge: Arc<OnceLock<Arc<CancelScope>>> = Arc::new(OnceLock::new());
        let interrupt = Interrupt::new_deferred({
            let bridge = Arc::clone(&bridge);
            move || {
                // The child may not have started (or may have finished);
                // the bridge scope is only present in between.
                if let Some(scope) = bridge.get() {
                    scope.cancel();
                }
                Ok(())
            }
        });
        Arc::new(Self {
            interrupt,
            save_result,
            bridge,
            slot: UnsafeCell::new(ChildSlot::default()),
        })
    }
}

// === impl BranchCore ===

impl BranchCore {
    fn new(kind: Kind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            lock: sync::Mutex::new(Locked {
                state: BranchState::New,
                children: Vec::new(),
                main_child: None,
                base_interrupt: None,
                body_scope: None,
                thread_count: 0,
                result_count: 0,
                exception_count: 0,
            }),
            nothreads: Semaphore::new(1),
            interrupting: AtomicBool::new(false),
        })
    }

    fn run(
        self: &Arc<Self>,
        body: impl FnOnce(&BranchScope<'_>) -> Result<(), Error>,
    ) -> Result<(), Error> {
        self.enter()?;
        let scope = BranchScope { core: self };
        let outcome = body(&scope);
        self.exit(outcome)
    }

    fn enter(self: &Arc<Self>) -> Result<(), Error> {
        let main_child = Child::new(false);
        let base_interrupt = Interrupt::new_inline({
            let core = Arc::downgrade(self);
            move |queue| base_interrupt_fired(&core, queue)
        });

        {
            let mut locked = self.lock.lock();
            if locked.state != BranchState::New {
                return Err(Error::state("branch entered in wrong state"));
            }
            locked.main_child = Some(Arc::clone(&main_child));
            locked.children.push(Arc::clone(&main_child));
            locked.base_interrupt = Some(Arc::clone(&base_interrupt));
            locked.state = BranchState::Alive;
        }

        base_interrupt.push();
        main_child.interrupt.push();

        // Bridge from the owner's cancel stack into the interrupt tree:
        // cancelling any enclosing scope fires the base interrupt.
        let body_scope = CancelScope::new({
            let core = Arc::downgrade(self);
            move || {
                if let Some(core) = core.upgrade() {
                    let base = core.lock.lock().base_interrupt.clone();
                    if let Some(base) = base {
                        base.interrupt();
                    }
                }
            }
        });
        body_scope.push();
        self.lock.lock().body_scope = Some(body_scope);

        tracing::debug!(kind = ?self.kind, "branch entered");
        Ok(())
    }

    fn exit(self: &Arc<Self>, outcome: Result<(), Error>) -> Result<(), Error> {
        let main_child;
        let mut queue = None;
        let body_failed = outcome.is_err();

        {
            let mut locked = self.lock.lock();
            assert_eq!(locked.state, BranchState::Alive, "branch exit in wrong state");
            locked.state = BranchState::Dying;
            main_child = locked.main_child.clone().expect("branch has no main child");

            if let Err(err) = outcome {
                // Safety: the scope owner writes the main record's slot;
                // children never touch it.
                unsafe { (*main_child.slot.get()).error = Some(err) };
                locked.exception_count += 1;
                if locked.exception_count == 1 {
                    self.interrupting.store(true, Ordering::SeqCst);
                    let mut iq = InterruptQueue::new();
                    fan_out(&mut iq, &locked.children);
                    queue = Some(iq);
                }
            }
        }

        if let Some(iq) = queue {
            iq.finish();
        }

        // Block until the last child has fully exited its runtime.
        state::suspended(|| self.nothreads.wait());

        {
            let mut locked = self.lock.lock();
            assert_eq!(locked.thread_count, 0);
            assert_eq!(locked.state, BranchState::Dying);
            locked.state = BranchState::Dead;
        }

        let body_scope = self.lock.lock().body_scope.take();
        body_scope.expect("branch has no body scope").pop();

        main_child.interrupt.pop();
        let base = self.lock.lock().base_interrupt.take();
        base.expect("branch has no base interrupt").pop();

        // From here the branch is dead: no other thread can reach it, so
        // the bookkeeping below runs without interleavings to worry about.
        let mut locked = self.lock.lock();
        if !body_failed {
            let main = locked.main_child.take().expect("branch has no main child");
            let index = locked
                .children
                .iter()
                .position(|child| Arc::ptr_eq(child, &main))
                .expect("main child not in list");
            locked.children.remove(index);
        }

        if locked.exception_count > 0 {
            if locked.result_count > 0 {
                // Results are never mixed with failures.
                locked.children.retain(|child| {
                    // Safety: the branch is dead; slots are quiescent.
                    unsafe { (*child.slot.get()).result.take() }.is_none()
                });
                locked.result_count = 0;
            }
            let causes: Vec<Error> = locked
                .children
                .iter()
                .filter_map(|child| {
                    // Safety: the branch is dead; slots are quiescent.
                    unsafe { (*child.slot.get()).error.take() }
                })
                .collect();
            locked.children.clear();
            locked.exception_count = 0;
            let interrupting = self.interrupting.load(Ordering::SeqCst);
            drop(locked);

            tracing::debug!(kind = ?self.kind, causes = causes.len(), "branch failed");
            return Err(aggregate(self.kind, causes, interrupting));
        }

        tracing::debug!(kind = ?self.kind, results = locked.result_count, "branch exited");
        Ok(())
    }

    fn add_common(
        self: &Arc<Self>,
        name: &str,
        args: Vec<ObjectRef>,
        f: ChildFn,
        save_result: bool,
    ) -> Result<(), Error> {
        require_shareable_args(&args, "branch argument")?;
        assert_eq!(state::import_depth(), 0, "importing is not thread-safe");

        let runtime = state::with_current(|ts| ts.runtime());
        let child = Child::new(save_result);

        let mut locked = self.lock.lock();
        if locked.state != BranchState::Alive {
            return Err(Error::state(format!("{name} called in wrong state")));
        }

        // Checked under the lock: a fan-out either happened before (we see
        // the flag) or will happen after (it sees this child in the list).
        if self.interrupting.load(Ordering::SeqCst) {
            child.interrupt.mark_interrupted();
        }

        locked.children.push(Arc::clone(&child));

        let spawned = std::thread::Builder::new().spawn({
            let core = Arc::clone(self);
            let child = Arc::clone(&child);
            move || child_bootstrap(&core, &child, f, args, &runtime)
        });
        if spawned.is_err() {
            let index = locked
                .children
                .iter()
                .position(|other| Arc::ptr_eq(other, &child))
                .expect("freshly pushed child missing");
            locked.children.remove(index);
            return Err(Error::state(format!("{name} cannot spawn a new thread")));
        }

        if locked.thread_count == 0 {
            // Take the semaphore's permit: there is a live child now.
            assert!(self.nothreads.try_wait(), "no-threads semaphore out of sync");
        }
        locked.thread_count += 1;

        Ok(())
    }

    fn results(&self) -> Result<Vec<ObjectRef>, Error> {
        let mut locked = self.lock.lock();
        if locked.state != BranchState::Dead {
            return Err(Error::state("branch results requested in wrong state"));
        }

        assert_eq!(locked.exception_count, 0);
        let results: Vec<ObjectRef> = locked
            .children
            .iter()
            .filter_map(|child| {
                // Safety: the branch is dead; slots are quiescent.
                unsafe { (*child.slot.get()).result.take() }
            })
            .collect();
        locked.children.clear();
        locked.result_count = 0;
        Ok(results)
    }
}

impl fmt::Debug for BranchCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let locked = self.lock.lock();
        f.debug_struct("BranchCore")
            .field("kind", &self.kind)
            .field("state", &locked.state)
            .field("children", &locked.children.len())
            .field("thread_count", &locked.thread_count)
            .finish_non_exhaustive()
    }
}

/// Fans an interrupt out to every child record: run each child node's own
/// parent-notification first (for a running child that is the deferred
/// bridge cancellation, which is what actually wakes it), then mark its
/// subtree. A node the child has not pushed yet (or has already popped) is
/// skipped by the notification and covered by the pre-mark checks in
/// `child_bootstrap` instead.
fn fan_out(queue: &mut InterruptQueue, children: &[Arc<Child>]) {
    for child in children {
        queue.add_from_parent(&child.interrupt);
        queue.add(&child.interrupt);
    }
}

/// The base interrupt's inline notification: fan out to every child,
/// letting the queue run their (deferred) bridges outside the tree locks.
fn base_interrupt_fired(core: &Weak<BranchCore>, queue: &mut InterruptQueue) {
    let Some(core) = core.upgrade() else {
        return;
    };
    core.interrupting.store(true, Ordering::SeqCst);
    let locked = core.lock.lock();
    tracing::debug!(children = locked.children.len(), "branch interrupted");
    fan_out(queue, &locked.children);
}

fn child_bootstrap(
    core: &Arc<BranchCore>,
    child: &Arc<Child>,
    f: ChildFn,
    args: Vec<ObjectRef>,
    runtime: &Arc<Runtime>,
) {
    let frame = runtime.enter();
    child.interrupt.push();

    // The bridge scope ties the child's interrupt node to its cancel
    // stack: interrupting the node cancels the scope (and everything the
    // child nests below it).
    let bridge = CancelScope::new(|| {});
    child
        .bridge
        .set(Arc::clone(&bridge))
        .expect("child bridge installed twice");
    bridge.push();
    if child.interrupt.is_interrupted() {
        // The interrupt beat the bridge installation (or the child was
        // submitted to an already-interrupting branch).
        bridge.cancel();
    }

    let outcome = run_child_body(f, args);

    bridge.pop();
    child.interrupt.pop();

    let mut queue = None;
    {
        let mut locked = core.lock.lock();
        match outcome {
            Ok(result) => {
                if child.save_result {
                    // Safety: only this child writes its slot before the
                    // semaphore barrier.
                    unsafe { (*child.slot.get()).result = Some(result) };
                    locked.result_count += 1;
                } else {
                    drop(result);
                    let index = locked
                        .children
                        .iter()
                        .position(|other| Arc::ptr_eq(other, child))
                        .expect("finished child missing from list");
                    locked.children.remove(index);
                }
            }
            Err(err) => {
                // Safety: only this child writes its slot before the
                // semaphore barrier.
                unsafe { (*child.slot.get()).error = Some(err) };
                locked.exception_count += 1;
                if locked.exception_count == 1 {
                    core.interrupting.store(true, Ordering::SeqCst);
                    let mut iq = InterruptQueue::new();
                    fan_out(&mut iq, &locked.children);
                    queue = Some(iq);
                }
            }
        }
    }
    if let Some(iq) = queue {
        iq.finish();
    }

    frame.exit();

    // Past this point the child no longer has a thread state, but it still
    // owns a share of the branch; the scope owner is blocked on the
    // semaphore (or will be), keeping the branch alive.
    let mut locked = core.lock.lock();
    locked.thread_count -= 1;
    if locked.thread_count == 0 {
        core.nothreads.post();
    }
}

fn run_child_body(f: ChildFn, args: Vec<ObjectRef>) -> Result<ObjectRef, Error> {
    let result = std::panic::catch_unwind(core::panic::AssertUnwindSafe(move || f(args)));
    match result {
        Ok(Ok(value)) => {
            require_shareable(&value, "branch return value")?;
            Ok(value)
        }
        Ok(Err(err)) => Err(err),
        Err(panic) => Err(Error::state(format!(
            "branch child panicked: {}",
            object::panic_message(&*panic)
        ))),
    }
}

/// Picks the error a dead scope re-raises, attaching the full cause chain
/// in submission order.
fn aggregate(kind: Kind, causes: Vec<Error>, interrupting: bool) -> Error {
    debug_assert!(!causes.is_empty());
    match kind {
        Kind::Branch => {
            let mut interesting: Option<&Error> = None;
            let mut interesting_count = 0_usize;
            for cause in &causes {
                if !cause.is_interrupted() && !cause.is_cancelled() {
                    interesting_count += 1;
                    interesting = Some(cause);
                }
            }
            if interesting_count == 1 {
                let chosen = interesting.expect("counted one interesting error").clone();
                chosen.with_causes(causes)
            } else if interrupting && interesting_count == 0 {
                Error::interrupted().with_causes(causes)
            } else {
                Error::multiple(causes)
            }
        }
        Kind::Collate => {
            if causes.len() == 1 {
                causes.into_iter().next().expect("one cause")
            } else {
                Error::multiple(causes)
            }
        }
    }
}

/// A structured-concurrency scope that re-raises one representative child
/// failure. See the module docs.
#[derive(Clone, Debug)]
pub struct Branch {
    core: Arc<BranchCore>,
}

/// Like [`Branch`], but failures are always aggregated rather than
/// collapsed to a representative one.
#[derive(Clone, Debug)]
pub struct Collate {
    core: Arc<BranchCore>,
}

/// Handle passed to the body of [`Branch::run`]/[`Collate::run`]; spawning
/// is only possible through it, which confines children to the scope.
pub struct BranchScope<'a> {
    core: &'a Arc<BranchCore>,
}

// === impl Branch ===

impl Default for Branch {
    fn default() -> Self {
        Self::new()
    }
}

impl Branch {
    pub fn new() -> Self {
        Self {
            core: BranchCore::new(Kind::Branch),
        }
    }

    /// Enters the scope, runs `body`, then blocks until every spawned
    /// child has terminated.
    ///
    /// # Errors
    ///
    /// If the body or any child failed, every retained result is discarded
    /// and the representative error is returned with all child errors (in
    /// submission order) as its causes.
    pub fn run(&self, body: impl FnOnce(&BranchScope<'_>) -> Result<(), Error>) -> Result<(), Error> {
        self.core.run(body)
    }

    /// The results retained by `add_result`, in submission order. Only
    /// legal once the scope has exited successfully; a second call yields
    /// an empty list.
    ///
    /// # Errors
    ///
    /// Returns a `State` error if the scope has not exited yet.
    pub fn results(&self) -> Result<Vec<ObjectRef>, Error> {
        self.core.results()
    }
}

// === impl Collate ===

impl Default for Collate {
    fn default() -> Self {
        Self::new()
    }
}

impl Collate {
    pub fn new() -> Self {
        Self {
            core: BranchCore::new(Kind::Collate),
        }
    }

    /// Enters the scope, runs `body`, then blocks until every spawned
    /// child has terminated.
    ///
    /// # Errors
    ///
    /// A single child failure is re-raised unchanged; several are raised
    /// together as one `Multiple` error with every failure (in submission
    /// order) among its causes.
    pub fn run(&self, body: impl FnOnce(&BranchScope<'_>) -> Result<(), Error>) -> Result<(), Error> {
        self.core.run(body)
    }

    /// See [`Branch::results`].
    ///
    /// # Errors
    ///
    /// Returns a `State` error if the scope has not exited yet.
    pub fn results(&self) -> Result<Vec<ObjectRef>, Error> {
        self.core.results()
    }
}

// === impl BranchScope ===

impl BranchScope<'_> {
    /// Spawns a child whose result is discarded.
    ///
    /// # Errors
    ///
    /// Returns a `Type` error if an argument is not shareable, or a
    /// `State` error if the scope is not alive or the thread cannot be
    /// spawned.
    pub fn add(
        &self,
        args: Vec<ObjectRef>,
        f: impl FnOnce(Vec<ObjectRef>) -> Result<ObjectRef, Error> + Send + 'static,
    ) -> Result<(), Error> {
        self.core.add_common("branch.add()", args, Box::new(f), false)
    }

    /// Spawns a child whose (shareable) result is retained for
    /// [`Branch::results`].
    ///
    /// # Errors
    ///
    /// Returns a `Type` error if an argument is not shareable, or a
    /// `State` error if the scope is not alive or the thread cannot be
    /// spawned.
    pub fn add_result(
        &self,
        args: Vec<ObjectRef>,
        f: impl FnOnce(Vec<ObjectRef>) -> Result<ObjectRef, Error> + Send + 'static,
    ) -> Result<(), Error> {
        self.core
            .add_common("branch.addresult()", args, Box::new(f), true)
    }

    /// Interrupts the whole scope, as an external interrupt arriving at
    /// its base node would.
    pub fn interrupt(&self) {
        let base = self.core.lock.lock().base_interrupt.clone();
        if let Some(base) = base {
            base.interrupt();
        }
    }
}

impl fmt::Debug for BranchScope<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BranchScope").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::object::values;
    use crate::state::Runtime;
    use core::time::Duration;

    #[test]
    fn results_in_submission_order() {
        let runtime = Runtime::new();
        let frame = runtime.enter();

        let branch = Branch::new();
        branch
            .run(|scope| {
                scope.add_result(vec![values::int(1)], |args| {
                    Ok(values::int(values::as_int(&args[0]).unwrap() + 1))
                })?;
                scope.add_result(vec![values::int(3)], |args| {
                    Ok(values::int(values::as_int(&args[0]).unwrap() * 2))
                })?;
                Ok(())
            })
            .unwrap();

        let results = branch.results().unwrap();
        let values: Vec<i64> = results.iter().map(|r| values::as_int(r).unwrap()).collect();
        assert_eq!(values, vec![2, 6]);
        drop(results);

        // Results were drained; a second harvest is empty.
        assert!(branch.results().unwrap().is_empty());

        frame.exit();
    }

    #[test]
    fn aggregate_failure_carries_causes() {
        let runtime = Runtime::new();
        let frame = runtime.enter();

        let branch = Branch::new();
        let err = branch
            .run(|scope| {
                scope.add(vec![], |_| Err(Error::value_error("division by zero")))?;
                scope.add(vec![], |_| Err(Error::value_error("division by zero")))?;
                Ok(())
            })
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Multiple);
        assert_eq!(err.causes().len(), 2);
        assert!(err.causes().iter().all(|cause| cause.kind() == ErrorKind::Value));

        frame.exit();
    }

    #[test]
    fn single_interesting_failure_is_reraised() {
        let runtime = Runtime::new();
        let frame = runtime.enter();

        let branch = Branch::new();
        let err = branch
            .run(|scope| {
                scope.add(vec![], |_| Err(Error::value_error("the interesting one")))?;
                scope.add(vec![], |_| {
                    // Sit in a cancellable sleep until the sibling's failure
                    // interrupts us.
                    crate::cancel::sleep(Duration::from_secs(10))?;
                    Ok(values::unit())
                })?;
                Ok(())
            })
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Value);
        assert_eq!(err.causes().len(), 2);

        frame.exit();
    }

    #[test]
    fn results_discarded_on_failure() {
        let runtime = Runtime::new();
        let frame = runtime.enter();

        let branch = Branch::new();
        let err = branch
            .run(|scope| {
                scope.add_result(vec![], |_| Ok(values::int(42)))?;
                scope.add(vec![], |_| Err(Error::value_error("poisoned")))?;
                Ok(())
            })
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Value);

        assert!(branch.results().unwrap().is_empty());

        frame.exit();
    }

    #[test]
    fn body_failure_interrupts_children() {
        let runtime = Runtime::new();
        let frame = runtime.enter();

        let branch = Branch::new();
        let err = branch
            .run(|scope| {
                scope.add(vec![], |_| {
                    crate::cancel::sleep(Duration::from_secs(10))?;
                    Ok(values::unit())
                })?;
                Err(Error::value_error("body failed"))
            })
            .unwrap_err();

        // The body's failure is the interesting one; the child reports the
        // cancellation it observed.
        assert_eq!(err.kind(), ErrorKind::Value);
        assert_eq!(err.causes().len(), 2);
        assert!(
            err.causes()
                .iter()
                .any(|cause| cause.is_cancelled() || cause.is_interrupted())
        );

        frame.exit();
    }

    #[test]
    fn unshareable_argument_is_rejected_at_submission() {
        let runtime = Runtime::new();
        let frame = runtime.enter();

        let branch = Branch::new();
        branch
            .run(|scope| {
                let err = scope
                    .add(vec![values::list(vec![])], |_| Ok(values::unit()))
                    .unwrap_err();
                assert_eq!(err.kind(), ErrorKind::Type);
                Ok(())
            })
            .unwrap();

        frame.exit();
    }

    #[test]
    fn unshareable_result_fails_the_child() {
        let runtime = Runtime::new();
        let frame = runtime.enter();

        let branch = Branch::new();
        let err = branch
            .run(|scope| {
                scope.add_result(vec![], |_| Ok(values::list(vec![])))?;
                Ok(())
            })
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Type);

        frame.exit();
    }

    #[test]
    fn add_after_exit_is_a_state_error() {
        let runtime = Runtime::new();
        let frame = runtime.enter();

        let branch = Branch::new();
        branch.run(|_| Ok(())).unwrap();

        // Entering again is equally invalid: the scope is dead.
        let err = branch.run(|_| Ok(())).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::State);

        frame.exit();
    }

    #[test]
    fn results_before_exit_is_a_state_error() {
        let runtime = Runtime::new();
        let frame = runtime.enter();

        let branch = Branch::new();
        branch
            .run(|_| {
                let err = branch.results().unwrap_err();
                assert_eq!(err.kind(), ErrorKind::State);
                Ok(())
            })
            .unwrap();

        frame.exit();
    }

    #[test]
    fn collate_reraises_single_failure_unchanged() {
        let runtime = Runtime::new();
        let frame = runtime.enter();

        let collate = Collate::new();
        let err = collate
            .run(|scope| {
                scope.add(vec![], |_| Err(Error::value_error("alone")))?;
                Ok(())
            })
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Value);
        assert_eq!(err.message(), Some("alone"));
        assert!(err.causes().is_empty());

        frame.exit();
    }

    #[test]
    fn collate_aggregates_everything() {
        let runtime = Runtime::new();
        let frame = runtime.enter();

        let collate = Collate::new();
        let err = collate
            .run(|scope| {
                scope.add(vec![], |_| Err(Error::value_error("first")))?;
                scope.add(vec![], |_| Err(Error::state("second")))?;
                Ok(())
            })
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Multiple);
        assert_eq!(err.causes().len(), 2);

        frame.exit();
    }

    #[test]
    fn scope_interrupt_cancels_children() {
        let runtime = Runtime::new();
        let frame = runtime.enter();

        let branch = Branch::new();
        let err = branch
            .run(|scope| {
                scope.add(vec![], |_| {
                    crate::cancel::sleep(Duration::from_secs(10))?;
                    Ok(values::unit())
                })?;
                std::thread::sleep(Duration::from_millis(20));
                scope.interrupt();
                Ok(())
            })
            .unwrap_err();
        assert!(err.is_interrupted() || err.is_cancelled());

        frame.exit();
    }

    #[test]
    fn children_spawned_while_interrupting_start_cancelled() {
        let runtime = Runtime::new();
        let frame = runtime.enter();

        let branch = Branch::new();
        let err = branch
            .run(|scope| {
                scope.interrupt();
                scope.add(vec![], |_| {
                    crate::cancel::sleep(Duration::from_secs(10))?;
                    Ok(values::unit())
                })?;
                Ok(())
            })
            .unwrap_err();
        assert!(err.is_interrupted() || err.is_cancelled());

        frame.exit();
    }
}
