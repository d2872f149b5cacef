//! The pluggable scheduler abstraction.
//!
//! A scheduler instance owns one schedulable domain: a set of processors
//! and the ready structure deciding which thread runs on each of them.
//! Every algorithm implements the same operation table, [`SchedulerOps`];
//! the instance is selected when the domain is configured and never
//! replaced afterwards. Two algorithms ship with the core: the O(1)
//! priority-bitmap scheduler for a single processor and the global
//! earliest-deadline-first scheduler for a processor group.

pub mod bitmap;
pub mod edf;

use crate::kernel::Kernel;
use crate::priority::Priority;
use crate::thread::ThreadId;

/// The operation table every scheduling algorithm implements.
///
/// All operations take the kernel so they can update per-processor
/// heirs; each implementation serializes itself with its own
/// ready-structure lock. The queue-lock-before-scheduler-lock ordering
/// means callers may hold a thread-queue lock here, but never the
/// reverse.
pub trait SchedulerOps: Sync {
    /// Prepares the thread's node on this instance. Called at thread
    /// creation (and affinity change) before any other operation may
    /// touch the thread.
    fn node_initialize(&self, kernel: &Kernel, thread: ThreadId, priority: Priority);

    /// Retires the thread's node. The thread must not be ready or
    /// scheduled on this instance anymore.
    fn node_destroy(&self, kernel: &Kernel, thread: ThreadId);

    /// Removes the thread from the ready structure because it blocked.
    fn block(&self, kernel: &Kernel, thread: ThreadId);

    /// Reinserts the thread after its wait ended.
    fn unblock(&self, kernel: &Kernel, thread: ThreadId);

    /// Re-keys the thread after an effective-priority change.
    fn update_priority(&self, kernel: &Kernel, thread: ThreadId, priority: Priority);

    /// Moves the thread behind its equal-key peers.
    fn yield_now(&self, kernel: &Kernel, thread: ThreadId);

    /// Offers an unassigned ready thread to a processor of this
    /// instance. Returns whether the thread is (now) scheduled.
    fn ask_for_help(&self, kernel: &Kernel, thread: ThreadId) -> bool;

    /// Re-evaluates an earlier help request after the thread's
    /// situation changed.
    fn reconsider_help_request(&self, kernel: &Kernel, thread: ThreadId);

    /// Removes the thread's node unconditionally (thread deleted or
    /// migrating to another instance) and reconciles assignments.
    fn withdraw_node(&self, kernel: &Kernel, thread: ThreadId);

    /// Donates one processor's worth of capacity to this instance. The
    /// processor's idle thread must already exist.
    fn add_processor(&self, kernel: &Kernel, cpu: usize);

    /// Reclaims a processor from this instance.
    fn remove_processor(&self, kernel: &Kernel, cpu: usize);

    /// Establishes a deadline for the thread's current job. Only
    /// deadline-aware algorithms order by it; others ignore the call.
    fn release_job(&self, kernel: &Kernel, thread: ThreadId, deadline: u64);

    /// Withdraws the thread's deadline; it competes by priority alone
    /// again.
    fn cancel_job(&self, kernel: &Kernel, thread: ThreadId);
}

/// The algorithm to install into a scheduler slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    /// Single-processor two-level-bitmap priority scheduling.
    PriorityBitmap,

    /// Global multiprocessor earliest-deadline-first scheduling.
    EdfSmp,
}

/// An installed scheduler instance.
#[derive(Debug)]
pub enum Instance {
    Bitmap(bitmap::BitmapScheduler),
    EdfSmp(edf::EdfSmpScheduler),
}

impl Instance {
    #[must_use]
    pub(crate) fn new(algorithm: Algorithm) -> Self {
        match algorithm {
            Algorithm::PriorityBitmap => Instance::Bitmap(bitmap::BitmapScheduler::new()),
            Algorithm::EdfSmp => Instance::EdfSmp(edf::EdfSmpScheduler::new()),
        }
    }

    /// The operation table of this instance.
    #[must_use]
    pub fn ops(&self) -> &dyn SchedulerOps {
        match self {
            Instance::Bitmap(scheduler) => scheduler,
            Instance::EdfSmp(scheduler) => scheduler,
        }
    }
}
