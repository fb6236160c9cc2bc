//! Hosted porting layer for RTOS benchmark workloads.
//!
//! This crate lets a benchmark harness written against a small RTOS service
//! vocabulary (threads, binary semaphores, fixed-message queues, fixed-block
//! memory pools, a synthetic interrupt) run on a hosted environment. The
//! simulated kernel is cooperative *from the host's point of view* but
//! preemptive from the benchmark's: a sleeping thread's expiry can stop a
//! busy lower-priority thread mid-loop, exactly as a hardware tick would.
//!
//! The implementation stands on three layers:
//!
//!  - `threading` (not public) extends `std::thread` with counted park
//!    tokens and a remote park operation so a running thread can be stopped
//!    at an arbitrary instruction boundary.
//!  - [`ums`] builds a thread group on top of that, with at most one worker
//!    running at any instant, scheduled by a pluggable [`ums::Scheduler`].
//!  - [`Port`] is the translator: it maps the benchmark-facing operations
//!    onto a priority scheduler and fixed slot tables driving the thread
//!    group.
//!
//! # Usage
//!
//! Construct a [`Port`] with a [`TrapHandlers`] vector table, then call
//! [`Port::initialize`] with the benchmark's setup callback. The callback
//! runs on a simulated thread of priority [`SETUP_THREAD_PRIORITY`] and
//! creates the benchmark's resources through the `Port` methods.
//!
//! Thread priorities follow the native convention: a *lower* value means a
//! *higher* priority. Among equally prioritized ready threads the one that
//! became ready first runs first.
#![deny(unsafe_op_in_unsafe_fn)]

use once_cell::sync::OnceCell;
use spin::Mutex as SpinMutex;
use std::{
    fmt,
    sync::{
        atomic::{AtomicU8, Ordering},
        mpsc,
    },
    time::{Duration, Instant},
};

#[cfg(feature = "smp")]
compile_error!(
    "the simulated kernel models a single processor; the `smp` feature is a \
     placeholder and cannot be enabled"
);

#[cfg(unix)]
mod threading;
#[cfg(not(unix))]
compile_error!("the remote park machinery requires a Unix host");

mod registry;
mod sched;
mod trap;
pub mod ums;


pub use crate::registry::{PoolBlock, WaitOrder};
pub use crate::trap::{
    TrapHandler, TrapHandlers, TRAP_CODE_INTERRUPT, TRAP_CODE_INTERRUPT_PREEMPT,
};

use crate::sched::{RunState, SchedState};
use crate::trap::{TrapFrame, TrapKind};

/// Number of thread slots.
pub const NUM_THREADS: usize = 10;
/// Number of semaphore slots.
pub const NUM_SEMAPHORES: usize = 4;
/// Number of message queue slots.
pub const NUM_QUEUES: usize = 4;
/// Number of memory pool slots.
pub const NUM_POOLS: usize = 4;

/// Message size in bytes.
pub const MESSAGE_SIZE: usize = 16;
/// Maximum number of messages a queue holds.
pub const QUEUE_DEPTH: usize = 8;
/// Memory pool block size in bytes.
pub const POOL_BLOCK_SIZE: usize = 128;
/// Number of blocks per memory pool.
pub const POOL_BLOCK_COUNT: usize = 8;

/// The nominal per-thread stack budget of the modeled target, in bytes.
/// Simulated threads actually run on host threads with host-sized stacks;
/// the constant documents the workload the harness is calibrated for.
pub const THREAD_STACK_SIZE: usize = 1024;

/// The priority the setup callback runs at. Every benchmark thread is
/// expected to use a numerically greater (lower) priority so that resuming
/// one doesn't preempt the setup flow.
pub const SETUP_THREAD_PRIORITY: Priority = 0;

/// Thread priority. Lower values run first.
pub type Priority = i32;

/// A message as the queue operations see it.
pub type Message = [u8; MESSAGE_SIZE];

/// A thread entry function. The three arguments mirror the native entry
/// signature; this layer always passes zeroes.
pub type ThreadEntry = Box<dyn FnOnce(usize, usize, usize) + Send + 'static>;

/// Uniform failure indicator, standing in for the native error status. The
/// operations don't discriminate failure causes any further than the native
/// API does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortError;

impl fmt::Display for PortError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("kernel service failed")
    }
}

impl std::error::Error for PortError {}

/// Failure modes of [`Port::thread_create`], reported separately because the
/// native operation is a create + suspend pair that can fail at either step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadCreateError {
    /// The thread could not be created. Nothing was allocated.
    CreationFailed,
    /// The thread was created but could not be moved to the suspended state.
    /// The creation has been rolled back.
    SuspensionFailed,
}

impl fmt::Display for ThreadCreateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CreationFailed => f.write_str("thread creation failed"),
            Self::SuspensionFailed => f.write_str("created thread could not be suspended"),
        }
    }
}

impl std::error::Error for ThreadCreateError {}

/// How long an acquiring operation is willing to wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode {
    /// Fail immediately when the resource is unavailable.
    NoWait,
    /// Block until the resource becomes available.
    Forever,
}

enum TimerCmd {
    WakeAt {
        thread: ums::ThreadId,
        at: Instant,
    },
}

/// The porting layer instance. One `Port` hosts one benchmark run.
///
/// All operations except [`Port::new`], [`Port::initialize`], and
/// [`Port::set_trap_code`] must be called from a simulated thread, i.e. from
/// inside the setup callback or a thread it created.
pub struct Port {
    thread_group: OnceCell<ums::ThreadGroup<SchedState>>,
    timer_cmd_send: SpinMutex<Option<mpsc::Sender<TimerCmd>>>,
    trap_selector: AtomicU8,
    handlers: TrapHandlers,
}

impl Port {
    pub fn new(handlers: TrapHandlers) -> Self {
        Self {
            thread_group: OnceCell::new(),
            timer_cmd_send: SpinMutex::new(None),
            trap_selector: AtomicU8::new(TRAP_CODE_INTERRUPT),
            handlers,
        }
    }

    fn group(&self) -> &ums::ThreadGroup<SchedState> {
        self.thread_group.get().expect("the port is not initialized")
    }

    /// Start the simulated kernel and run `setup` on a simulated thread of
    /// priority [`SETUP_THREAD_PRIORITY`].
    ///
    /// Blocks until [`Port::shutdown`] is called, then returns to the caller.
    /// If a simulated thread panics, the panic is propagated to the caller.
    pub fn initialize(&self, setup: impl FnOnce() + Send + 'static) {
        let (thread_group, join_handle) = ums::ThreadGroup::new(SchedState::new());
        self.thread_group
            .set(thread_group)
            .ok()
            .expect("the port is already initialized");

        log::trace!("starting the timer thread");
        let (timer_cmd_send, timer_cmd_recv) = mpsc::channel();
        let timer_group = self.group().clone();
        let timer_join_handle = std::thread::spawn(move || timer_thread(timer_group, timer_cmd_recv));
        *self.timer_cmd_send.lock() = Some(timer_cmd_send);

        {
            let mut lock = self.group().lock();
            let thread_id = lock.spawn(move |_| setup());
            log::trace!("setup thread = {thread_id:?}");
            lock.scheduler()
                .register(thread_id, SETUP_THREAD_PRIORITY, RunState::Ready);
            lock.preempt();
        }

        let result = join_handle.join();

        // Stop the timer thread. `recv` in the timer thread returns `Err(_)`
        // when we drop the sender.
        log::trace!("stopping the timer thread");
        *self.timer_cmd_send.lock() = None;
        timer_join_handle.join().unwrap();

        if let Err(payload) = result {
            std::panic::resume_unwind(payload);
        }
    }

    /// End the benchmark run: stop scheduling and release [`Port::initialize`].
    ///
    /// Benchmark threads typically never return from their entry functions;
    /// they are left parked for the life of the process. A simulated thread
    /// calling this keeps running until its next reschedule point.
    pub fn shutdown(&self) {
        log::trace!("shutdown");
        self.group().lock().shutdown();
    }

    /// Run the scheduler after a state change that may have readied a
    /// higher-priority thread. Inside a trap handler the decision is
    /// deferred to the trap exit.
    fn reschedule(&self, mut lock: ums::ThreadGroupLockGuard<'_, SchedState>) {
        let sched = lock.scheduler();
        if sched.trap.in_trap {
            sched.trap.resched_pending = true;
            return;
        }
        drop(lock);
        ums::yield_now();
    }

    // ---- Thread operations ----

    /// Create a thread in slot `thread_id` with the given priority and entry
    /// function. The thread is created suspended; it doesn't run until
    /// [`Port::thread_resume`] makes it ready, and not a single instruction
    /// of `entry` executes before that.
    pub fn thread_create(
        &self,
        thread_id: usize,
        priority: Priority,
        entry: ThreadEntry,
    ) -> Result<(), ThreadCreateError> {
        log::trace!("thread_create({thread_id}, {priority})");
        let mut lock = self.group().lock();
        if lock.scheduler().registry.threads[thread_id].is_some() {
            return Err(ThreadCreateError::CreationFailed);
        }

        // The native equivalent is a start + immediate-suspend pair. A
        // worker is born parked, so registering it as suspended completes
        // both steps before it could run anything.
        let id = lock.spawn(move |_| entry(0, 0, 0));
        lock.scheduler().register(id, priority, RunState::Suspended);
        lock.scheduler().registry.threads[thread_id] = Some(registry::ThreadSlot {
            thread: id,
            priority,
        });
        Ok(())
    }

    /// Make the suspended thread in slot `thread_id` ready. Fails if the
    /// slot is empty or the thread isn't suspended.
    pub fn thread_resume(&self, thread_id: usize) -> Result<(), PortError> {
        log::trace!("thread_resume({thread_id})");
        let mut lock = self.group().lock();
        let sched = lock.scheduler();
        let id = sched.registry.threads[thread_id]
            .as_ref()
            .ok_or(PortError)?
            .thread;
        sched.resume(id)?;
        self.reschedule(lock);
        Ok(())
    }

    /// Suspend the ready thread in slot `thread_id`. Suspending the calling
    /// thread takes effect before this returns.
    pub fn thread_suspend(&self, thread_id: usize) -> Result<(), PortError> {
        log::trace!("thread_suspend({thread_id})");
        let mut lock = self.group().lock();
        let sched = lock.scheduler();
        let id = sched.registry.threads[thread_id]
            .as_ref()
            .ok_or(PortError)?
            .thread;
        sched.suspend(id)?;
        if ums::current_thread() == Some(id) {
            self.reschedule(lock);
        }
        Ok(())
    }

    /// Yield the processor to the next ready thread of the same priority.
    /// Returns immediately when the caller is alone at its priority.
    pub fn thread_relinquish(&self) {
        log::trace!("thread_relinquish");
        let me = ums::current_thread().expect("not a simulated thread");
        let mut lock = self.group().lock();
        let sched = lock.scheduler();
        assert!(!sched.trap.in_trap, "can't relinquish inside a trap handler");
        sched.rotate(me);
        drop(lock);
        ums::yield_now();
    }

    /// Put the calling thread to sleep for the given number of seconds.
    /// Lower-priority threads run in the meantime; the expiry preempts them
    /// even mid-computation.
    pub fn thread_sleep(&self, seconds: u32) {
        log::trace!("thread_sleep({seconds})");
        let me = ums::current_thread().expect("not a simulated thread");
        let at = Instant::now() + Duration::from_secs(u64::from(seconds));

        let mut lock = self.group().lock();
        assert!(
            !lock.scheduler().trap.in_trap,
            "can't sleep inside a trap handler"
        );
        lock.scheduler().set_sleeping(me);

        // Send while holding the group lock so the timer thread can't
        // observe the wake-up request before the sleeping state.
        let send = self.timer_cmd_send.lock();
        send.as_ref()
            .expect("the port is not initialized")
            .send(TimerCmd::WakeAt { thread: me, at })
            .unwrap();
        drop(send);
        drop(lock);

        ums::yield_now();
    }

    /// Tear down every thread created through [`Port::thread_create`],
    /// emptying all thread slots. Subsequent operations naming a torn-down
    /// slot fail. Idempotent.
    ///
    /// The underlying host threads are left parked for the life of the
    /// process; the native operation's stack reclamation has no counterpart
    /// here.
    pub fn thread_detach(&self) {
        log::trace!("thread_detach");
        let mut lock = self.group().lock();
        let sched = lock.scheduler();
        for slot in 0..NUM_THREADS {
            if let Some(entry) = sched.registry.threads[slot].take() {
                log::debug!("detaching thread slot {slot}");
                sched.remove(entry.thread);
            }
        }
    }

    // ---- Semaphore operations ----

    /// Create a binary semaphore (initial count 1) in slot `sem_id`.
    /// `order` decides how blocked getters are released.
    pub fn semaphore_create(&self, sem_id: usize, order: WaitOrder) -> Result<(), PortError> {
        log::trace!("semaphore_create({sem_id}, {order:?})");
        let mut lock = self.group().lock();
        lock.scheduler().registry.semaphores[sem_id] = Some(registry::Semaphore::new(order));
        Ok(())
    }

    /// Take the semaphore's count. With [`WaitMode::NoWait`] an unavailable
    /// count fails immediately; with [`WaitMode::Forever`] the caller blocks
    /// until a [`Port::semaphore_put`] hands the count over.
    pub fn semaphore_get(&self, sem_id: usize, mode: WaitMode) -> Result<(), PortError> {
        log::trace!("semaphore_get({sem_id}, {mode:?})");
        let mut lock = self.group().lock();
        let sched = lock.scheduler();
        if sched.sem_try_acquire(sem_id)? {
            return Ok(());
        }
        match mode {
            WaitMode::NoWait => Err(PortError),
            WaitMode::Forever => {
                let me = ums::current_thread().expect("not a simulated thread");
                assert!(!sched.trap.in_trap, "can't block inside a trap handler");
                sched.sem_enqueue_waiter(sem_id, me);
                drop(lock);
                ums::yield_now();
                // Woken by `semaphore_put`; the count was handed over
                // directly.
                Ok(())
            }
        }
    }

    /// Release the semaphore, waking the first waiter per the semaphore's
    /// wait order, or incrementing the count when nobody waits.
    pub fn semaphore_put(&self, sem_id: usize) -> Result<(), PortError> {
        log::trace!("semaphore_put({sem_id})");
        let mut lock = self.group().lock();
        if let Some(waiter) = lock.scheduler().sem_release(sem_id)? {
            log::trace!("semaphore_put({sem_id}): waking {waiter:?}");
            self.reschedule(lock);
        }
        Ok(())
    }

    // ---- Message queue operations ----

    /// Create a message queue in slot `queue_id`. `order` selects the waiter
    /// release order of the native object; both queue operations here are
    /// non-blocking, so it never creates waiters.
    pub fn queue_create(&self, queue_id: usize, order: WaitOrder) -> Result<(), PortError> {
        log::trace!("queue_create({queue_id}, {order:?})");
        let mut lock = self.group().lock();
        lock.scheduler().registry.queues[queue_id] = Some(registry::MessageQueue::new(order));
        Ok(())
    }

    /// Copy a message into the queue. Fails when the queue is full or the
    /// slot is empty; never blocks.
    pub fn queue_send(&self, queue_id: usize, message: &Message) -> Result<(), PortError> {
        let mut lock = self.group().lock();
        lock.scheduler().registry.queues[queue_id]
            .as_mut()
            .ok_or(PortError)?
            .send(message)
            .map_err(|()| PortError)
    }

    /// Copy the oldest message out of the queue. Fails when the queue is
    /// empty or the slot is empty; never blocks.
    pub fn queue_receive(&self, queue_id: usize) -> Result<Message, PortError> {
        let mut lock = self.group().lock();
        lock.scheduler().registry.queues[queue_id]
            .as_mut()
            .ok_or(PortError)?
            .receive()
            .ok_or(PortError)
    }

    // ---- Memory pool operations ----

    /// Create a fixed-block memory pool in slot `pool_id`.
    pub fn memory_pool_create(&self, pool_id: usize) -> Result<(), PortError> {
        log::trace!("memory_pool_create({pool_id})");
        let mut lock = self.group().lock();
        lock.scheduler().registry.pools[pool_id] = Some(registry::MemoryPool::new());
        Ok(())
    }

    /// Allocate a block. Fails when the pool is exhausted or the slot is
    /// empty; never blocks.
    pub fn memory_pool_allocate(&self, pool_id: usize) -> Result<PoolBlock, PortError> {
        let mut lock = self.group().lock();
        lock.scheduler().registry.pools[pool_id]
            .as_mut()
            .ok_or(PortError)?
            .allocate()
            .ok_or(PortError)
    }

    /// Return a block to the pool. Always succeeds, like the native free
    /// operation; returning a block to a recreated or wrong slot is the
    /// caller's bug.
    pub fn memory_pool_deallocate(
        &self,
        pool_id: usize,
        block: PoolBlock,
    ) -> Result<(), PortError> {
        let mut lock = self.group().lock();
        if let Some(pool) = lock.scheduler().registry.pools[pool_id].as_mut() {
            pool.deallocate(block);
        }
        Ok(())
    }

    // ---- Synthetic interrupt operations ----

    /// Select the trap code the next [`Port::cause_interrupt`] raises.
    /// Defaults to [`TRAP_CODE_INTERRUPT`].
    pub fn set_trap_code(&self, code: u8) {
        self.trap_selector.store(code, Ordering::Relaxed);
    }

    /// Raise a synthetic trap on the calling thread, as if it had executed a
    /// software-interrupt instruction carrying the selected trap code.
    ///
    /// The trap code is saved into a trap frame, the trap entry point reads
    /// it back and dispatches through the vector table, and control returns
    /// here when the handler finishes. An unrecognized code dispatches no
    /// handler. The [`TRAP_CODE_INTERRUPT_PREEMPT`] variant forces a
    /// scheduling decision before returning to the interrupted thread;
    /// wake-ups performed inside either handler are honored at that same
    /// point.
    pub fn cause_interrupt(&self) {
        let code = self.trap_selector.load(Ordering::Relaxed);
        assert!(
            ums::current_thread().is_some(),
            "`cause_interrupt` must be called from a simulated thread"
        );
        log::trace!("cause_interrupt (trap code {code})");

        // Trap entry: save the program state a hardware exception would
        let mut lock = self.group().lock();
        let trap = &mut lock.scheduler().trap;
        assert!(!trap.in_trap, "nested synthetic interrupts are not modeled");
        trap.in_trap = true;
        trap.frame = Some(TrapFrame { code });
        trap.interrupted = ums::current_thread();
        drop(lock);

        self.trap_entry();

        // Trap exit: restore the interrupted context
        let mut lock = self.group().lock();
        let trap = &mut lock.scheduler().trap;
        let frame = trap.frame.take().unwrap();
        trap.in_trap = false;
        trap.interrupted = None;
        let deferred = std::mem::take(&mut trap.resched_pending);
        drop(lock);

        if matches!(trap::vector(frame.code), Some(TrapKind::InterruptPreempt)) || deferred {
            ums::yield_now();
        }
    }

    /// The trap entry point: reads the trap code back out of the saved frame
    /// and dispatches through the vector table.
    fn trap_entry(&self) {
        let frame = self
            .group()
            .lock()
            .scheduler()
            .trap
            .frame
            .expect("no trap in progress");

        match trap::vector(frame.code) {
            Some(TrapKind::Interrupt) => {
                log::trace!("trap {}: interrupt handler", frame.code);
                (self.handlers.interrupt)(self);
            }
            Some(TrapKind::InterruptPreempt) => {
                log::trace!("trap {}: interrupt handler (preemption)", frame.code);
                (self.handlers.interrupt_preemption)(self);
            }
            None => {
                log::warn!("unrecognized trap code {}; no handler invoked", frame.code);
            }
        }
    }
}

/// The timer thread: delivers `thread_sleep` expiries. Each expiry readies
/// the sleeping thread and forces a scheduling decision, preempting whatever
/// was running.
fn timer_thread(group: ums::ThreadGroup<SchedState>, recv: mpsc::Receiver<TimerCmd>) {
    let mut wakeups: Vec<(Instant, ums::ThreadId)> = Vec::new();

    loop {
        // Fire the due wake-ups
        let now = Instant::now();
        let mut i = 0;
        while i < wakeups.len() {
            if wakeups[i].0 <= now {
                let (_, thread) = wakeups.swap_remove(i);
                log::trace!("timer: waking {thread:?}");
                let mut lock = group.lock();
                lock.scheduler().wake(thread);
                lock.preempt();
            } else {
                i += 1;
            }
        }

        let next = wakeups.iter().map(|&(at, _)| at).min();
        let cmd = if let Some(next) = next {
            match recv.recv_timeout(next.saturating_duration_since(Instant::now())) {
                Ok(cmd) => cmd,
                Err(mpsc::RecvTimeoutError::Timeout) => continue,
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        } else {
            match recv.recv() {
                Ok(cmd) => cmd,
                Err(mpsc::RecvError) => break,
            }
        };

        let TimerCmd::WakeAt { thread, at } = cmd;
        wakeups.push((at, thread));
    }

    log::trace!("timer: exiting");
}
