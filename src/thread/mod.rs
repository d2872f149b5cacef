//! Thread control blocks and the wait-state handshake word.
//!
//! Threads live in a fixed arena inside [`crate::Kernel`]; a [`ThreadId`]
//! is an index into it. Everything another subsystem needs to remember
//! about a thread is reachable from its control block, and every
//! back-reference in the core (queue → waiter, scheduler node → thread)
//! is a plain identifier lookup, never shared ownership.

pub mod budget;
pub mod dispatch;

use crate::status::Status;
use crate::wait::WaitBlock;
use bitflags::bitflags;
use core::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};
use spin::Mutex;

/// Identifies a thread: an index into the kernel's thread table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadId(u16);

impl ThreadId {
    #[must_use]
    pub const fn new(index: usize) -> Self {
        ThreadId(index as u16)
    }

    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

bitflags! {
    /// A thread's execution state. The bits are orthogonal and may
    /// combine (a dormant thread can also be suspended); a thread is
    /// ready exactly when no bit is set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ThreadState: u32 {
        /// Created but not yet started.
        const DORMANT = 1 << 0;

        /// Explicitly suspended by another thread.
        const SUSPENDED = 1 << 1;

        /// Blocked on a thread queue.
        const WAITING = 1 << 2;
    }
}

/// The subsystem a blocked thread can be satisfied by. The class rides in
/// the wait-flags word so a producer can assert it is waking a thread
/// that is actually waiting on *its* kind of condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum WaitClass {
    /// Waiting for event bits.
    Event = 0x100,

    /// Waiting for a system-internal event.
    SystemEvent = 0x200,

    /// Waiting on a synchronization object (semaphore, mutex, message
    /// queue, barrier...).
    Object = 0x400,
}

/// Wait-state values held in the low byte of the wait-flags word. The
/// transitions between them are the lock-free handshake that prevents
/// lost wakeups; see [`crate::wait`] for the full protocol.
pub mod wait_state {
    /// Not waiting at all.
    pub const READY: u32 = 0x0;

    /// The thread announced it is about to block but has not yet
    /// committed. A producer that wins a compare-and-swap out of this
    /// state satisfies the thread without it ever sleeping.
    pub const INTEND_TO_BLOCK: u32 = 0x1;

    /// The thread is genuinely blocked.
    pub const BLOCKED: u32 = 0x2;

    /// The wait is over; the outcome status is packed alongside.
    pub const READY_AGAIN: u32 = 0x4;

    pub const STATE_MASK: u32 = 0xff;
    pub const CLASS_MASK: u32 = 0xff00;
    pub const STATUS_SHIFT: u32 = 16;
}

/// The wait state a waker transitioned a thread out of. The waker needs
/// it to know how much undoing is left: a thread claimed out of
/// `INTEND_TO_BLOCK` never reached the scheduler, while one claimed out
/// of `BLOCKED` must be unblocked and its timeout canceled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimedFrom {
    IntendToBlock,
    Blocked,
}

/// One slot of the kernel's thread table.
///
/// The fields are grouped by the lock that protects them: the wait-flags
/// word and the execution state are atomics driven by the handshake, the
/// wait block is guarded by its own short-held lock (acquired only by the
/// thread itself and by wakers that already claimed it), and the rest are
/// independent atomics.
#[derive(Debug)]
pub struct ThreadControl {
    /// Slot allocation flag; a free slot can be claimed by thread
    /// creation.
    pub(crate) in_use: AtomicBool,

    /// The packed wait-flags word: state byte, class byte, outcome
    /// status byte. All handshake transitions are compare-and-swaps on
    /// this single word so that the outcome travels atomically with the
    /// `READY_AGAIN` transition.
    wait_flags: AtomicU32,

    /// Execution state bits; empty means ready.
    state: AtomicU32,

    /// The wait block, populated only while the thread is between a
    /// seize and its completion.
    pub(crate) wait: Mutex<WaitBlock>,

    /// Base priority and active boosts.
    pub(crate) priority: Mutex<crate::priority::Aggregation>,

    /// CPU-budget accounting.
    pub(crate) budget: Mutex<budget::Budget>,

    /// Deferred one-shot actions drained right after a context switch
    /// onto this thread.
    pub(crate) post_switch: Mutex<dispatch::ActionList>,

    /// The processor this thread is currently assigned to (or was last
    /// assigned to). Timeout entries are armed on this processor's
    /// watchdog headers.
    pub(crate) cpu: AtomicU8,

    /// The scheduler instance this thread belongs to.
    pub(crate) scheduler: AtomicU8,

    /// Whether the thread may be preempted by equal-priority timeslicing.
    pub(crate) preemptible: AtomicBool,

    /// Reserved idle threads never block and are never counted as real
    /// work; one exists per online processor.
    pub(crate) idle: AtomicBool,
}

impl ThreadControl {
    #[must_use]
    pub(crate) const fn new() -> Self {
        Self {
            in_use: AtomicBool::new(false),
            wait_flags: AtomicU32::new(wait_state::READY),
            state: AtomicU32::new(ThreadState::DORMANT.bits()),
            wait: Mutex::new(WaitBlock::new()),
            priority: Mutex::new(crate::priority::Aggregation::new(
                crate::priority::Priority::DEFAULT,
            )),
            budget: Mutex::new(budget::Budget::new(
                budget::Policy::None,
                config::DEFAULT_TIMESLICE,
            )),
            post_switch: Mutex::new(dispatch::ActionList::new()),
            cpu: AtomicU8::new(0),
            scheduler: AtomicU8::new(0),
            preemptible: AtomicBool::new(true),
            idle: AtomicBool::new(false),
        }
    }

    /// Resets a freshly claimed slot to its initial condition: dormant,
    /// not waiting, no stale wait parameters from a previous owner.
    pub(crate) fn reinitialize(&self) {
        self.state
            .store(ThreadState::DORMANT.bits(), Ordering::Release);
        self.wait_flags.store(wait_state::READY, Ordering::Release);
        *self.wait.lock() = crate::wait::WaitBlock::new();
        self.post_switch.lock().clear();
    }

    /// The current execution state bits.
    #[must_use]
    pub fn state(&self) -> ThreadState {
        ThreadState::from_bits_truncate(self.state.load(Ordering::Acquire))
    }

    /// Whether the thread is ready to run (no state bit set).
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state().is_empty()
    }

    /// Sets state bits, reporting whether the thread left the ready
    /// state with this change (the caller then blocks it in its
    /// scheduler).
    pub(crate) fn set_state(&self, bits: ThreadState) -> bool {
        let previous = self.state.fetch_or(bits.bits(), Ordering::AcqRel);
        previous == 0 && !bits.is_empty()
    }

    /// Clears state bits, reporting whether the thread became ready with
    /// this change (the caller then unblocks it in its scheduler).
    pub(crate) fn clear_state(&self, bits: ThreadState) -> bool {
        let previous = self.state.fetch_and(!bits.bits(), Ordering::AcqRel);
        previous != 0 && (previous & !bits.bits()) == 0
    }

    /// The current wait-state byte.
    #[must_use]
    pub fn wait_state(&self) -> u32 {
        self.wait_flags.load(Ordering::Acquire) & wait_state::STATE_MASK
    }

    /// The outcome status packed by the waker that ended the wait. Only
    /// meaningful once the wait state is `READY_AGAIN`.
    #[must_use]
    pub fn wait_outcome(&self) -> Status {
        let word = self.wait_flags.load(Ordering::Acquire);
        Status::from_u8((word >> wait_state::STATUS_SHIFT) as u8)
    }

    /// Announces the intention to block on behalf of the given wait
    /// class. Called with the queue lock held, before it is released for
    /// the blocking transition.
    pub(crate) fn announce_intent(&self, class: WaitClass) {
        self.wait_flags
            .store(class as u32 | wait_state::INTEND_TO_BLOCK, Ordering::Release);
    }

    /// The consumer's commit point: tries to move `INTEND_TO_BLOCK` to
    /// `BLOCKED`. Failure means a waker already ended the wait and the
    /// consumer was satisfied without ever sleeping.
    pub(crate) fn commit_block(&self) -> bool {
        let word = self.wait_flags.load(Ordering::Acquire);
        if word & wait_state::STATE_MASK != wait_state::INTEND_TO_BLOCK {
            return false;
        }
        let target = (word & wait_state::CLASS_MASK) | wait_state::BLOCKED;
        self.wait_flags
            .compare_exchange(word, target, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// A waker's claim: tries to end the wait with the given outcome.
    ///
    /// Exactly one waker can succeed per wait — the transition to
    /// `READY_AGAIN` is a compare-and-swap and `READY_AGAIN` is terminal
    /// until the consumer resets the word. Returns which state the
    /// thread was claimed from, or `None` if another waker (producer,
    /// timeout, flush) already ended this wait.
    pub(crate) fn claim(&self, outcome: Status) -> Option<ClaimedFrom> {
        loop {
            let word = self.wait_flags.load(Ordering::Acquire);
            let (claimed, state) = match word & wait_state::STATE_MASK {
                wait_state::INTEND_TO_BLOCK => (ClaimedFrom::IntendToBlock, word),
                wait_state::BLOCKED => (ClaimedFrom::Blocked, word),
                _ => return None,
            };
            let target = (word & wait_state::CLASS_MASK)
                | wait_state::READY_AGAIN
                | (u32::from(outcome.as_u8()) << wait_state::STATUS_SHIFT);
            if self
                .wait_flags
                .compare_exchange(state, target, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(claimed);
            }
        }
    }

    /// Resets the wait-flags word after the consumer has collected its
    /// outcome.
    pub(crate) fn finish_wait(&self) {
        self.wait_flags.store(wait_state::READY, Ordering::Release);
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.idle.load(Ordering::Relaxed)
    }

    /// The processor the thread is currently assigned to.
    #[must_use]
    pub fn assigned_cpu(&self) -> usize {
        self.cpu.load(Ordering::Acquire) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::{ClaimedFrom, ThreadControl, ThreadState, WaitClass, wait_state};
    use crate::status::Status;

    #[test]
    fn ready_is_the_empty_state() {
        let thread = ThreadControl::new();
        assert!(!thread.is_ready());
        assert!(thread.clear_state(ThreadState::DORMANT));
        assert!(thread.is_ready());
    }

    #[test]
    fn leaving_and_entering_ready_is_reported_once() {
        let thread = ThreadControl::new();
        thread.clear_state(ThreadState::DORMANT);

        assert!(thread.set_state(ThreadState::WAITING));
        assert!(!thread.set_state(ThreadState::SUSPENDED));
        assert!(!thread.clear_state(ThreadState::WAITING));
        assert!(thread.clear_state(ThreadState::SUSPENDED));
    }

    #[test]
    fn producer_claim_before_commit_wins() {
        let thread = ThreadControl::new();
        thread.announce_intent(WaitClass::Object);

        assert_eq!(
            thread.claim(Status::Successful),
            Some(ClaimedFrom::IntendToBlock)
        );
        assert!(!thread.commit_block());
        assert_eq!(thread.wait_outcome(), Status::Successful);
    }

    #[test]
    fn commit_then_claim_reports_blocked() {
        let thread = ThreadControl::new();
        thread.announce_intent(WaitClass::Event);

        assert!(thread.commit_block());
        assert_eq!(thread.wait_state(), wait_state::BLOCKED);
        assert_eq!(thread.claim(Status::Timeout), Some(ClaimedFrom::Blocked));
        assert_eq!(thread.wait_outcome(), Status::Timeout);
    }

    #[test]
    fn only_one_waker_can_claim() {
        let thread = ThreadControl::new();
        thread.announce_intent(WaitClass::Object);
        thread.commit_block();

        assert!(thread.claim(Status::Successful).is_some());
        assert!(thread.claim(Status::Timeout).is_none());
        assert_eq!(thread.wait_outcome(), Status::Successful);
    }
}
