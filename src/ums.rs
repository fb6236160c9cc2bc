//! User-mode scheduling, the substrate standing in for a native RTOS
//! scheduler on a hosted target.
//!
//! A [`ThreadGroup`] owns a set of worker threads of which **at most one runs
//! at any instant**, so code running inside the group observes single-core
//! semantics. Which worker runs is decided by a [`Scheduler`] supplied by the
//! client. Scheduling decisions are taken at two kinds of points:
//!
//!  - [`yield_now`], the cooperative reschedule point, called by the running
//!    worker itself;
//!  - [`ThreadGroupLockGuard::preempt`], the asynchronous reschedule point,
//!    which stops the running worker at an arbitrary instruction boundary
//!    (via [`crate::threading::Thread::park`]) when the scheduler chooses
//!    another one.
//!
//! Workers are born parked; they don't execute a single instruction until the
//! scheduler chooses them for the first time. Shutting the group down stops
//! scheduling and releases the join handle; workers that never terminate
//! (typical for benchmark workloads) are left parked for the life of the
//! process.
use slab::Slab;
use spin::Mutex as SpinMutex;
use std::{
    any::Any,
    cell::RefCell,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{mpsc, Arc},
};

use crate::threading;

#[cfg(test)]
#[path = "ums/tests.rs"]
mod tests;

/// Identifies a worker thread within a [`ThreadGroup`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(usize);

/// Decides which worker thread of a [`ThreadGroup`] runs. All methods are
/// called with the thread group locked.
pub trait Scheduler: Send + 'static {
    /// Choose the next thread to run. Returning `None` leaves the processor
    /// idle until the next reschedule point.
    fn choose_next_thread(&mut self) -> Option<ThreadId>;

    /// Called when a thread exits by returning from its entry closure.
    fn thread_exited(&mut self, thread_id: ThreadId) {
        let _ = thread_id;
    }
}

type ExitPayload = Result<(), Box<dyn Any + Send>>;

struct State<Sched> {
    sched: Sched,
    threads: Slab<WorkerThread>,
    /// The thread currently designated to run, if any.
    cur: Option<ThreadId>,
    shutdown: bool,
    result_send: Option<mpsc::Sender<ExitPayload>>,
}

struct WorkerThread {
    thread: threading::Thread,
}

struct Shared<Sched> {
    state: SpinMutex<State<Sched>>,
}

/// A group of worker threads sharing one virtual processor.
pub struct ThreadGroup<Sched>(Arc<Shared<Sched>>);

impl<Sched> Clone for ThreadGroup<Sched> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

/// Completes when the group shuts down or a worker thread panics.
pub struct ThreadGroupJoinHandle {
    result_recv: mpsc::Receiver<ExitPayload>,
}

impl ThreadGroupJoinHandle {
    /// Wait for the group to shut down. Returns the payload of the first
    /// worker panic, if any.
    pub fn join(self) -> Result<(), Box<dyn Any + Send>> {
        self.result_recv.recv().unwrap_or(Ok(()))
    }
}

/// Exclusive access to a [`ThreadGroup`]'s state.
pub struct ThreadGroupLockGuard<'a, Sched: Scheduler> {
    shared: &'a Arc<Shared<Sched>>,
    guard: spin::mutex::MutexGuard<'a, State<Sched>>,
}

struct ThreadLocalBlock {
    thread_id: ThreadId,
    shared: Arc<dyn AnyShared>,
}

thread_local! {
    /// The current worker thread's identity and group.
    static TLB: RefCell<Option<ThreadLocalBlock>> = RefCell::new(None);
}

impl<Sched: Scheduler> ThreadGroup<Sched> {
    /// Construct a `ThreadGroup` driven by the given scheduler.
    pub fn new(sched: Sched) -> (Self, ThreadGroupJoinHandle) {
        let (result_send, result_recv) = mpsc::channel();

        let shared = Arc::new(Shared {
            state: SpinMutex::new(State {
                sched,
                threads: Slab::new(),
                cur: None,
                shutdown: false,
                result_send: Some(result_send),
            }),
        });

        (Self(shared), ThreadGroupJoinHandle { result_recv })
    }

    pub fn lock(&self) -> ThreadGroupLockGuard<'_, Sched> {
        ThreadGroupLockGuard {
            shared: &self.0,
            guard: self.0.state.lock(),
        }
    }
}

impl<Sched: Scheduler> ThreadGroupLockGuard<'_, Sched> {
    /// Spawn a worker thread. The thread is born parked and will not run
    /// until the scheduler chooses it.
    pub fn spawn(&mut self, f: impl FnOnce(ThreadId) + Send + 'static) -> ThreadId {
        let thread_id = ThreadId(self.guard.threads.vacant_key());
        let shared = Arc::clone(self.shared);

        let jh = threading::spawn(move || {
            TLB.with(|c| {
                *c.borrow_mut() = Some(ThreadLocalBlock {
                    thread_id,
                    shared: Arc::clone(&shared) as Arc<dyn AnyShared>,
                });
            });

            // Wait to be scheduled for the first time
            threading::park();

            match catch_unwind(AssertUnwindSafe(move || f(thread_id))) {
                Ok(()) => shared.thread_exited(thread_id),
                Err(payload) => shared.thread_panicked(thread_id, payload),
            }
        });

        let i = self.guard.threads.insert(WorkerThread {
            thread: jh.thread().clone(),
        });
        debug_assert_eq!(i, thread_id.0);

        log::trace!("spawned thread {thread_id:?}");
        thread_id
    }

    /// Re-evaluate the scheduling decision, asynchronously stopping the
    /// currently running thread if the scheduler now chooses another one.
    ///
    /// Must not be called by a worker thread of this group on itself; workers
    /// use [`yield_now`] instead.
    pub fn preempt(&mut self) {
        let state = &mut *self.guard;
        let chosen = if state.shutdown {
            None
        } else {
            state.sched.choose_next_thread()
        };
        if chosen == state.cur {
            return;
        }

        log::trace!("preempt: {:?} -> {:?}", state.cur, chosen);

        if let Some(prev) = state.cur.take() {
            debug_assert_ne!(
                current_thread(),
                Some(prev),
                "a worker thread can't preempt itself"
            );
            state.threads[prev.0].thread.park();
        }
        if let Some(id) = chosen {
            state.cur = Some(id);
            state.threads[id.0].thread.unpark();
        }
    }

    /// Initiate shutdown: stop making scheduling decisions and release the
    /// join handle. Worker threads that never exit are left parked.
    ///
    /// When called from a worker thread of this group, the caller keeps
    /// running until its next reschedule point.
    pub fn shutdown(&mut self) {
        let state = &mut *self.guard;
        if state.shutdown {
            return;
        }
        log::trace!("shutting down the thread group");
        state.shutdown = true;

        if let Some(prev) = state.cur.take() {
            if current_thread() != Some(prev) {
                state.threads[prev.0].thread.park();
            }
        }

        if let Some(send) = state.result_send.take() {
            let _ = send.send(Ok(()));
        }
    }

    pub fn scheduler(&mut self) -> &mut Sched {
        &mut self.guard.sched
    }
}

impl<Sched: Scheduler> State<Sched> {
    /// Ask the scheduler for the next thread and hand the processor over to
    /// it. Must only be called while no thread is designated as running.
    fn dispatch_next(&mut self) {
        debug_assert!(self.cur.is_none());
        if self.shutdown {
            return;
        }
        if let Some(id) = self.sched.choose_next_thread() {
            self.cur = Some(id);
            self.threads[id.0].thread.unpark();
        }
    }
}

impl<Sched: Scheduler> Shared<Sched> {
    fn thread_exited(&self, thread_id: ThreadId) {
        let mut state = self.state.lock();
        log::trace!("thread {thread_id:?} exited");
        state.sched.thread_exited(thread_id);
        if state.threads.contains(thread_id.0) {
            state.threads.remove(thread_id.0);
        }
        if state.cur == Some(thread_id) {
            state.cur = None;
            state.dispatch_next();
        }
    }

    fn thread_panicked(&self, thread_id: ThreadId, payload: Box<dyn Any + Send>) {
        let mut state = self.state.lock();
        log::warn!("thread {thread_id:?} panicked; shutting down the thread group");
        state.shutdown = true;
        state.cur = None;
        if let Some(send) = state.result_send.take() {
            let _ = send.send(Err(payload));
        }
    }
}

/// The group-agnostic part of [`Shared`]'s interface, used by [`yield_now`].
trait AnyShared: Send + Sync {
    fn yield_current(&self, me: ThreadId);
}

impl<Sched: Scheduler> AnyShared for Shared<Sched> {
    fn yield_current(&self, me: ThreadId) {
        let mut state = self.state.lock();
        let chosen = if state.shutdown {
            None
        } else {
            state.sched.choose_next_thread()
        };
        if chosen == Some(me) {
            return;
        }

        log::trace!("yield: {me:?} -> {chosen:?}");

        if state.cur == Some(me) {
            state.cur = None;
        }
        if let Some(id) = chosen {
            state.cur = Some(id);
            state.threads[id.0].thread.unpark();
        }
        drop(state);

        // Wait until this thread is scheduled again. On shutdown this never
        // returns.
        threading::park();
    }
}

/// Relinquish the virtual processor and let the scheduler re-evaluate which
/// thread should run. Returns when the current thread is chosen again.
///
/// Panics when called from a thread not managed by a [`ThreadGroup`].
pub fn yield_now() {
    let (shared, me) = TLB.with(|c| {
        let b = c.borrow();
        let b = b
            .as_ref()
            .expect("`yield_now` called from a non-worker thread");
        (Arc::clone(&b.shared), b.thread_id)
    });
    shared.yield_current(me);
}

/// The [`ThreadId`] of the current worker thread, or `None` when called from
/// a thread not managed by a [`ThreadGroup`].
pub fn current_thread() -> Option<ThreadId> {
    TLB.with(|c| c.borrow().as_ref().map(|b| b.thread_id))
}
