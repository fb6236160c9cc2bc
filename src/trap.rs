//! The synthetic trap subsystem: trap codes, the saved trap frame, and the
//! two-entry vector table.
use crate::{ums, Port};

/// Trap code requesting the plain interrupt handler.
pub const TRAP_CODE_INTERRUPT: u8 = 254;

/// Trap code requesting the interrupt handler that forces a scheduling
/// decision before returning to the interrupted thread.
pub const TRAP_CODE_INTERRUPT_PREEMPT: u8 = 255;

/// An interrupt handler. Runs logically at interrupt level: ahead of every
/// thread priority and not preemptible.
pub type TrapHandler = Box<dyn Fn(&Port) + Send + Sync + 'static>;

/// The two-entry vector table supplied at [`Port`] construction.
pub struct TrapHandlers {
    pub interrupt: TrapHandler,
    pub interrupt_preemption: TrapHandler,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TrapKind {
    Interrupt,
    InterruptPreempt,
}

/// Map a trap code to a vector table entry.
pub(crate) fn vector(code: u8) -> Option<TrapKind> {
    match code {
        TRAP_CODE_INTERRUPT => Some(TrapKind::Interrupt),
        TRAP_CODE_INTERRUPT_PREEMPT => Some(TrapKind::InterruptPreempt),
        _ => None,
    }
}

/// The trap frame: the program state a real CPU would save on exception
/// entry, reduced to the one datum the handlers read back.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TrapFrame {
    pub code: u8,
}

#[derive(Debug)]
pub(crate) struct TrapState {
    /// A handler is currently running on the virtual processor.
    pub in_trap: bool,
    /// The saved frame, present exactly while `in_trap`.
    pub frame: Option<TrapFrame>,
    /// The thread the trap interrupted, present exactly while `in_trap`.
    /// The scheduler keeps choosing it so nothing can preempt the handler
    /// running on its host thread.
    pub interrupted: Option<ums::ThreadId>,
    /// A wake-up during a trap requested a scheduling decision; honored
    /// when the trap exits.
    pub resched_pending: bool,
}

impl TrapState {
    pub const fn new() -> Self {
        Self {
            in_trap: false,
            frame: None,
            interrupted: None,
            resched_pending: false,
        }
    }
}
