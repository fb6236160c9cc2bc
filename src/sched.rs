//! The priority scheduler driving the [`crate::ums`] thread group, plus the
//! shared state every translator operation mutates under the group lock.
use std::collections::HashMap;

use crate::{
    registry::{Registry, WaitOrder},
    trap::TrapState,
    ums, PortError, Priority,
};

/// Per-thread scheduling state.
///
/// These don't exactly align with the thread states a native kernel would
/// expose; `Ready` covers both "running" and "ready to run" because the
/// `ums` layer tracks which single thread actually runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunState {
    Ready,
    Suspended,
    Sleeping,
    Blocked,
}

#[derive(Debug)]
struct ThreadSched {
    priority: Priority,
    state: RunState,
    /// Readiness order among equal priorities; smaller runs first.
    seq: u64,
}

/// The scheduler state: one entry per live simulated thread, the resource
/// slot tables, and the synthetic trap state. Everything lives in one place
/// so that a single thread group lock covers every translator operation.
pub(crate) struct SchedState {
    threads: HashMap<ums::ThreadId, ThreadSched>,
    next_seq: u64,
    pub registry: Registry,
    pub trap: TrapState,
}

impl SchedState {
    pub fn new() -> Self {
        Self {
            threads: HashMap::new(),
            next_seq: 0,
            registry: Registry::new(),
            trap: TrapState::new(),
        }
    }

    fn take_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Bring a newly spawned worker thread under this scheduler's control.
    pub fn register(&mut self, id: ums::ThreadId, priority: Priority, state: RunState) {
        let seq = self.take_seq();
        let old = self.threads.insert(
            id,
            ThreadSched {
                priority,
                state,
                seq,
            },
        );
        debug_assert!(old.is_none(), "thread {id:?} registered twice");
    }

    /// Remove a thread from scheduling and from every waiter queue. Further
    /// operations naming it fail with a native error.
    pub fn remove(&mut self, id: ums::ThreadId) {
        self.threads.remove(&id);
        self.registry.purge_waiters(id);
    }

    pub fn priority_of(&self, id: ums::ThreadId) -> Option<Priority> {
        self.threads.get(&id).map(|t| t.priority)
    }

    /// `Suspended` -> `Ready`.
    pub fn resume(&mut self, id: ums::ThreadId) -> Result<(), PortError> {
        let seq = self.take_seq();
        let t = self.threads.get_mut(&id).ok_or(PortError)?;
        if t.state != RunState::Suspended {
            return Err(PortError);
        }
        t.state = RunState::Ready;
        t.seq = seq;
        Ok(())
    }

    /// `Ready` -> `Suspended`.
    pub fn suspend(&mut self, id: ums::ThreadId) -> Result<(), PortError> {
        let t = self.threads.get_mut(&id).ok_or(PortError)?;
        if t.state != RunState::Ready {
            return Err(PortError);
        }
        t.state = RunState::Suspended;
        Ok(())
    }

    /// `Sleeping` or `Blocked` -> `Ready`. Unknown threads (detached while
    /// asleep) are ignored.
    pub fn wake(&mut self, id: ums::ThreadId) {
        let seq = self.take_seq();
        if let Some(t) = self.threads.get_mut(&id) {
            if matches!(t.state, RunState::Sleeping | RunState::Blocked) {
                t.state = RunState::Ready;
                t.seq = seq;
            }
        } else {
            log::trace!("wake: {id:?} is gone, ignoring");
        }
    }

    pub fn set_sleeping(&mut self, id: ums::ThreadId) {
        let t = self.threads.get_mut(&id).expect("unknown thread");
        debug_assert_eq!(t.state, RunState::Ready);
        t.state = RunState::Sleeping;
    }

    /// Move the thread behind its equal-priority peers.
    pub fn rotate(&mut self, id: ums::ThreadId) {
        let seq = self.take_seq();
        if let Some(t) = self.threads.get_mut(&id) {
            t.seq = seq;
        }
    }

    /// Take the semaphore's count if it's available.
    pub fn sem_try_acquire(&mut self, sem_id: usize) -> Result<bool, PortError> {
        let sem = self.registry.semaphores[sem_id].as_mut().ok_or(PortError)?;
        if sem.count > 0 {
            sem.count -= 1;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Append the thread to the semaphore's waiter queue (position decided
    /// by the semaphore's wait order) and mark it blocked.
    pub fn sem_enqueue_waiter(&mut self, sem_id: usize, id: ums::ThreadId) {
        let Self {
            threads, registry, ..
        } = self;
        let sem = registry.semaphores[sem_id]
            .as_mut()
            .expect("semaphore vanished");

        match sem.order {
            WaitOrder::Fifo => sem.waiters.push_back(id),
            WaitOrder::Priority => {
                let priority = threads[&id].priority;
                // Behind all waiters of the same priority
                let pos = sem
                    .waiters
                    .iter()
                    .position(|w| threads[w].priority > priority)
                    .unwrap_or(sem.waiters.len());
                sem.waiters.insert(pos, id);
            }
        }

        let t = threads.get_mut(&id).expect("unknown thread");
        debug_assert_eq!(t.state, RunState::Ready);
        t.state = RunState::Blocked;
    }

    /// Release the semaphore. If a thread was waiting, the count is handed
    /// to it directly and its id is returned.
    pub fn sem_release(&mut self, sem_id: usize) -> Result<Option<ums::ThreadId>, PortError> {
        let sem = self.registry.semaphores[sem_id].as_mut().ok_or(PortError)?;
        if let Some(waiter) = sem.waiters.pop_front() {
            self.wake(waiter);
            Ok(Some(waiter))
        } else {
            sem.count += 1;
            Ok(None)
        }
    }
}

impl ums::Scheduler for SchedState {
    fn choose_next_thread(&mut self) -> Option<ums::ThreadId> {
        // A trap handler runs at interrupt level and is not preemptible. Any
        // wake-up arriving meanwhile (a timer expiry, typically) must not
        // switch threads mid-handler; the decision is deferred to trap exit.
        if self.trap.in_trap {
            self.trap.resched_pending = true;
            return self.trap.interrupted;
        }

        self.threads
            .iter()
            .filter(|(_, t)| t.state == RunState::Ready)
            .min_by_key(|(_, t)| (t.priority, t.seq))
            .map(|(id, _)| *id)
    }

    fn thread_exited(&mut self, thread_id: ums::ThreadId) {
        self.remove(thread_id);
    }
}
