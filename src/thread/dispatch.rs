//! Deferred thread dispatching and post-switch actions.
//!
//! Scheduler operations never context-switch directly; they update the
//! heir and set the dispatch-necessary flag. The switch happens when
//! dispatching is re-enabled at nesting level zero. Right after a switch,
//! before the new thread resumes its own code, its pending post-switch
//! actions run exactly once — the hook used for asynchronous signal
//! delivery and similar deferred, non-reentrant work.
//!
//! In this core the "switch" is the bookkeeping half of a real one: the
//! executing/heir slots change hands, budgets are replenished and the
//! deferred actions run. Saving and restoring register state is the
//! embedder's architecture layer, driven by [`Kernel::thread_dispatch`]
//! returning work to do.

use crate::kernel::Kernel;
use crate::thread::ThreadId;
use core::sync::atomic::Ordering;
use heapless::Vec;

/// A one-shot action run on the new thread's context right after a
/// switch onto it.
pub type Action = fn(&Kernel, ThreadId);

/// The bounded per-thread list of pending post-switch actions.
pub(crate) type ActionList = Vec<Action, { config::MAX_POST_SWITCH_ACTIONS }>;

impl Kernel {
    /// Defers context switches on the given processor. Nests; every
    /// disable must be paired with [`Kernel::dispatch_enable`].
    pub fn dispatch_disable(&self, cpu: usize) {
        self.percpu(cpu)
            .dispatch_disable_level
            .fetch_add(1, Ordering::AcqRel);
    }

    /// Re-enables context switches on the given processor. Dropping the
    /// nesting level to zero performs any dispatch that became necessary
    /// while it was held.
    pub fn dispatch_enable(&self, cpu: usize) {
        let previous = self
            .percpu(cpu)
            .dispatch_disable_level
            .fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous != 0, "dispatch enable without disable");
        if previous == 1 {
            self.thread_dispatch(cpu);
        }
    }

    /// Performs a pending context switch on the given processor, if
    /// dispatching is enabled and one is due. Safe to call from any
    /// scheduling point; does nothing when there is nothing to do.
    pub fn thread_dispatch(&self, cpu: usize) {
        let record = self.percpu(cpu);
        if record.dispatch_disable_level.load(Ordering::Acquire) != 0 {
            return;
        }

        // Every dispatch point is also a job-drain point, so a
        // multicast initiator never waits longer than the target's next
        // scheduling opportunity.
        self.perform_jobs(cpu);

        while record.dispatch_necessary.swap(false, Ordering::AcqRel) {
            let Some(heir) = record.heir() else {
                continue;
            };
            if record.executing() == Some(heir) {
                continue;
            }

            record.set_executing(heir);
            log::trace!("cpu {cpu}: dispatched thread {}", heir.index());

            self.thread(heir).budget.lock().on_dispatch();
            self.run_post_switch_actions(heir);
        }
    }

    /// Queues a one-shot action to run right after the next context
    /// switch onto the thread.
    ///
    /// # Errors
    /// Returns [`crate::Status::TooMany`] if the thread's action list is
    /// full.
    pub fn add_post_switch_action(
        &self,
        thread: ThreadId,
        action: Action,
    ) -> Result<(), crate::Status> {
        self.thread(thread)
            .post_switch
            .lock()
            .push(action)
            .map_err(|_| crate::Status::TooMany)
    }

    /// Drains and runs the thread's pending post-switch actions. The
    /// list is emptied before any action runs, so an action re-queuing
    /// work sees a clean list and runs on the *next* switch.
    fn run_post_switch_actions(&self, thread: ThreadId) {
        let drained = {
            let mut actions = self.thread(thread).post_switch.lock();
            let drained = actions.clone();
            actions.clear();
            drained
        };
        for action in &drained {
            action(self, thread);
        }
    }
}
