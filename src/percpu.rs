//! Per-processor control records.
//!
//! One record exists per potential processor, collected in a fixed array
//! inside [`crate::Kernel`] and cache-padded so two processors never
//! false-share a line. A record owns everything only its processor
//! touches on the hot path: the executing/heir thread pair, the
//! dispatch-deferral counters, the three watchdog headers and the
//! inbound job queue of the cross-processor rendezvous mechanism.

use crate::kernel::Kernel;
use crate::thread::ThreadId;
use crate::watchdog;
use core::sync::atomic::{AtomicBool, AtomicU8, AtomicU16, AtomicU32, AtomicU64, Ordering};
use heapless::Deque;
use spin::Mutex;

/// Sentinel for "no thread" in the executing/heir slots.
const NO_THREAD: u16 = u16::MAX;

/// The handler of a cross-processor job. Handlers run on the target
/// processor, synchronously with respect to the initiator, and must not
/// block.
pub type JobHandler = fn(&Kernel, usize);

/// One pending cross-processor job. The slot is a copy of the submitted
/// job — handler, argument and the identity of the initiating processor,
/// whose completion counter the target bumps after executing it.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Job {
    pub handler: JobHandler,
    pub arg: usize,
    pub initiator: usize,
}

/// The control record of one processor.
#[derive(Debug)]
pub struct PerCpu {
    /// Whether the processor has been brought online.
    pub(crate) online: AtomicBool,

    /// The thread currently executing on this processor.
    executing: AtomicU16,

    /// The thread that should be executing according to the scheduler.
    /// When it differs from `executing`, a dispatch is necessary.
    heir: AtomicU16,

    /// Dispatch deferral nesting. While non-zero, context switches are
    /// postponed; re-enabling at level zero performs any pending switch.
    pub(crate) dispatch_disable_level: AtomicU32,

    /// Set whenever a scheduler decision changed the heir.
    pub(crate) dispatch_necessary: AtomicBool,

    /// This processor's tick counter, the time base of its tick-driven
    /// watchdog header and of relative timeouts armed on it.
    pub(crate) tick_count: AtomicU64,

    /// The scheduler instance this processor belongs to.
    pub(crate) scheduler: AtomicU8,

    /// This processor's reserved idle thread.
    pub(crate) idle: AtomicU16,

    /// Tick-driven watchdog header.
    pub(crate) watchdog_ticks: Mutex<watchdog::Header>,

    /// Monotonic-timestamp watchdog header.
    pub(crate) watchdog_monotonic: Mutex<watchdog::Header>,

    /// Real-time-timestamp watchdog header.
    pub(crate) watchdog_realtime: Mutex<watchdog::Header>,

    /// Inbound cross-processor jobs, drained at every tick and at every
    /// dispatch point so submission-to-execution latency is bounded.
    pub(crate) jobs: Mutex<Deque<Job, { config::MAX_PROCESSORS }>>,

    /// Completions observed for a multicast this processor initiated.
    pub(crate) multicast_done: AtomicU32,
}

impl PerCpu {
    #[must_use]
    pub(crate) const fn new() -> Self {
        Self {
            online: AtomicBool::new(false),
            executing: AtomicU16::new(NO_THREAD),
            heir: AtomicU16::new(NO_THREAD),
            dispatch_disable_level: AtomicU32::new(0),
            dispatch_necessary: AtomicBool::new(false),
            tick_count: AtomicU64::new(0),
            scheduler: AtomicU8::new(0),
            idle: AtomicU16::new(NO_THREAD),
            watchdog_ticks: Mutex::new(watchdog::Header::new()),
            watchdog_monotonic: Mutex::new(watchdog::Header::new()),
            watchdog_realtime: Mutex::new(watchdog::Header::new()),
            jobs: Mutex::new(Deque::new()),
            multicast_done: AtomicU32::new(0),
        }
    }

    /// Whether this processor is online.
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    /// The thread currently executing here, if the processor is online.
    #[must_use]
    pub fn executing(&self) -> Option<ThreadId> {
        match self.executing.load(Ordering::Acquire) {
            NO_THREAD => None,
            index => Some(ThreadId::new(index as usize)),
        }
    }

    /// The thread that should be executing here.
    #[must_use]
    pub fn heir(&self) -> Option<ThreadId> {
        match self.heir.load(Ordering::Acquire) {
            NO_THREAD => None,
            index => Some(ThreadId::new(index as usize)),
        }
    }

    pub(crate) fn set_executing(&self, thread: ThreadId) {
        self.executing
            .store(thread.index() as u16, Ordering::Release);
    }

    /// Installs a new heir. Returns `true` if this changed the heir and
    /// the caller should flag a dispatch.
    pub(crate) fn set_heir(&self, thread: ThreadId) -> bool {
        let previous = self.heir.swap(thread.index() as u16, Ordering::AcqRel);
        previous != thread.index() as u16
    }

    /// This processor's current tick count.
    #[must_use]
    pub fn now_ticks(&self) -> u64 {
        self.tick_count.load(Ordering::Acquire)
    }

    /// The reserved idle thread, available once the processor is online.
    #[must_use]
    pub fn idle_thread(&self) -> Option<ThreadId> {
        match self.idle.load(Ordering::Acquire) {
            NO_THREAD => None,
            index => Some(ThreadId::new(index as usize)),
        }
    }

    /// Whether a dispatch is pending on this processor.
    #[must_use]
    pub fn dispatch_needed(&self) -> bool {
        self.dispatch_necessary.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::{NO_THREAD, PerCpu};
    use crate::thread::ThreadId;

    #[test]
    fn fresh_record_is_offline_and_empty() {
        let cpu = PerCpu::new();
        assert!(!cpu.is_online());
        assert!(cpu.executing().is_none());
        assert!(cpu.heir().is_none());
        assert!(cpu.idle_thread().is_none());
    }

    #[test]
    fn heir_change_is_reported_once() {
        let cpu = PerCpu::new();
        let thread = ThreadId::new(3);
        assert!(cpu.set_heir(thread));
        assert!(!cpu.set_heir(thread));
        assert_eq!(cpu.heir(), Some(thread));
        assert_ne!(thread.index() as u16, NO_THREAD);
    }
}
