//! The resource slot tables and the objects they hold.
//!
//! Every kernel object a benchmark can name lives in a fixed-size table,
//! addressed by a small integer id the way the native API addresses objects
//! by control block. Slot bounds are not range-checked here; an out-of-range
//! id is a harness bug and panics via the array index.
use std::collections::VecDeque;

use crate::{
    ums, Message, Priority, NUM_POOLS, NUM_QUEUES, NUM_SEMAPHORES, NUM_THREADS, POOL_BLOCK_COUNT,
    POOL_BLOCK_SIZE, QUEUE_DEPTH,
};

/// The order in which waiting threads are released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOrder {
    /// First blocked, first released.
    Fifo,
    /// Highest priority first; FIFO among equals.
    Priority,
}

pub(crate) struct Registry {
    pub threads: [Option<ThreadSlot>; NUM_THREADS],
    pub semaphores: [Option<Semaphore>; NUM_SEMAPHORES],
    pub queues: [Option<MessageQueue>; NUM_QUEUES],
    pub pools: [Option<MemoryPool>; NUM_POOLS],
}

impl Registry {
    pub fn new() -> Self {
        Self {
            threads: std::array::from_fn(|_| None),
            semaphores: std::array::from_fn(|_| None),
            queues: std::array::from_fn(|_| None),
            pools: std::array::from_fn(|_| None),
        }
    }

    /// Drop the thread from every waiter queue it might be sitting in.
    pub fn purge_waiters(&mut self, id: ums::ThreadId) {
        for sem in self.semaphores.iter_mut().flatten() {
            sem.waiters.retain(|w| *w != id);
        }
    }
}

pub(crate) struct ThreadSlot {
    pub thread: ums::ThreadId,
    pub priority: Priority,
}

/// A counting semaphore created with one count, making it binary in the
/// benchmark's usage.
pub(crate) struct Semaphore {
    pub count: u32,
    pub order: WaitOrder,
    pub waiters: VecDeque<ums::ThreadId>,
}

impl Semaphore {
    pub fn new(order: WaitOrder) -> Self {
        Self {
            count: 1,
            order,
            waiters: VecDeque::new(),
        }
    }
}

/// A fixed-message queue: [`crate::MESSAGE_SIZE`]-byte messages, at most
/// [`QUEUE_DEPTH`] of them, delivered in FIFO order.
pub(crate) struct MessageQueue {
    /// Waiter release order, retained the way the native control block
    /// retains its creation flag. Both queue operations in this layer are
    /// non-blocking, so no waiter queue ever forms.
    #[allow(dead_code)]
    order: WaitOrder,
    buf: VecDeque<Message>,
}

impl MessageQueue {
    pub fn new(order: WaitOrder) -> Self {
        Self {
            order,
            buf: VecDeque::with_capacity(QUEUE_DEPTH),
        }
    }

    /// Copy a message into the queue, or report it full.
    pub fn send(&mut self, message: &Message) -> Result<(), ()> {
        if self.buf.len() == QUEUE_DEPTH {
            return Err(());
        }
        self.buf.push_back(*message);
        Ok(())
    }

    /// Copy the oldest message out of the queue, or report it empty.
    pub fn receive(&mut self) -> Option<Message> {
        self.buf.pop_front()
    }
}

/// A fixed-block memory pool: [`POOL_BLOCK_COUNT`] blocks of
/// [`POOL_BLOCK_SIZE`] bytes each, carved out of one backing allocation.
pub(crate) struct MemoryPool {
    storage: Box<[u8]>,
    /// Free block indices, used as a stack.
    free: Vec<usize>,
}

impl MemoryPool {
    pub fn new() -> Self {
        Self {
            storage: vec![0u8; POOL_BLOCK_COUNT * POOL_BLOCK_SIZE].into_boxed_slice(),
            free: (0..POOL_BLOCK_COUNT).rev().collect(),
        }
    }

    pub fn allocate(&mut self) -> Option<PoolBlock> {
        let index = self.free.pop()?;
        let addr = self.storage.as_ptr() as usize + index * POOL_BLOCK_SIZE;
        Some(PoolBlock { index, addr })
    }

    /// Return a block to the pool. The block's origin is not validated;
    /// returning a block to the wrong pool is the caller's bug, as with the
    /// native allocator.
    pub fn deallocate(&mut self, block: PoolBlock) {
        self.free.push(block.index);
    }

    #[cfg(test)]
    fn free_blocks(&self) -> usize {
        self.free.len()
    }
}

/// A block handed out by a memory pool. The handle is linear: deallocating
/// consumes it, so a block can't be returned twice.
#[derive(Debug, PartialEq, Eq)]
pub struct PoolBlock {
    index: usize,
    addr: usize,
}

impl PoolBlock {
    /// The block's address. Valid for [`POOL_BLOCK_SIZE`] bytes until the
    /// block is deallocated or the pool's slot is recreated.
    pub fn as_ptr(&self) -> *mut u8 {
        self.addr as *mut u8
    }
}
