//! The cross-processor job rendezvous.
//!
//! A multicast action submits one job — handler, argument — into the
//! inbound queue of each target processor and then waits until every
//! target has executed it. The mechanism is strictly synchronous: the
//! initiator never returns early, which is what makes it safe for
//! callers to pass arguments referring to their own stack. Targets
//! drain their queue at every tick and at every dispatch point, so
//! submission-to-execution latency is bounded by the slowest target's
//! next such opportunity.
//!
//! The initiator also drains its *own* queue while it waits. That keeps
//! self-targeted multicasts trivial and lets two processors multicast
//! at each other simultaneously without deadlocking the rendezvous.
//! What remains forbidden is a handler that itself waits on another
//! multicast targeting its own processor — the classic circular
//! dependency the original design rules out too.

use crate::kernel::Kernel;
use crate::percpu::{Job, JobHandler};
use crate::status::Status;
use core::sync::atomic::Ordering;
use crossbeam::utils::Backoff;
use heapless::Vec;

impl Kernel {
    /// Runs `handler(arg)` on every target processor, returning once
    /// all of them have executed it.
    ///
    /// Submission is all-or-nothing: every target queue is locked (in
    /// ascending processor order, so concurrent multicasts cannot
    /// deadlock) and checked for room before any job is enqueued.
    ///
    /// # Errors
    /// [`Status::IncorrectState`] if a target is offline,
    /// [`Status::TooMany`] if a target queue is full — nothing was
    /// submitted, the caller may retry.
    pub fn multicast_action(
        &self,
        initiator: usize,
        targets: &[usize],
        handler: JobHandler,
        arg: usize,
    ) -> Status {
        if targets.is_empty() {
            return Status::Successful;
        }
        if targets
            .iter()
            .any(|&cpu| cpu >= config::MAX_PROCESSORS || !self.percpu(cpu).is_online())
        {
            return Status::IncorrectState;
        }

        let mut sorted: Vec<usize, { config::MAX_PROCESSORS }> = Vec::new();
        for &cpu in targets {
            if sorted.push(cpu).is_err() {
                return Status::InvalidNumber;
            }
        }
        sorted.as_mut_slice().sort_unstable();

        // Deduplicate: a processor is targeted at most once, and the
        // ascending lock order below must never take a queue lock twice.
        let mut ordered: Vec<usize, { config::MAX_PROCESSORS }> = Vec::new();
        for &cpu in &sorted {
            if ordered.last() != Some(&cpu) {
                let _ = ordered.push(cpu);
            }
        }

        let record = self.percpu(initiator);
        record.multicast_done.store(0, Ordering::Release);

        {
            let mut queues: Vec<_, { config::MAX_PROCESSORS }> = Vec::new();
            for &cpu in &ordered {
                // Capacity bound: one slot per potential initiator.
                let _ = queues.push(self.percpu(cpu).jobs.lock());
            }
            if queues.iter().any(|queue| queue.is_full()) {
                return Status::TooMany;
            }
            for queue in &mut queues {
                let _ = queue.push_back(Job {
                    handler,
                    arg,
                    initiator,
                });
            }
        }

        log::trace!(
            "cpu {initiator}: multicast to {} processors submitted",
            ordered.len()
        );

        let expected = ordered.len() as u32;
        let backoff = Backoff::new();
        while record.multicast_done.load(Ordering::Acquire) < expected {
            // Keep our own inbound queue moving while we wait; one of
            // the targets may be multicasting at us right now.
            self.perform_jobs(initiator);
            backoff.snooze();
        }

        log::trace!("cpu {initiator}: multicast complete");
        Status::Successful
    }

    /// Drains and executes this processor's inbound jobs. Called from
    /// the tick path and from every dispatch point; embedders with an
    /// inter-processor interrupt wire it to that handler as well.
    pub fn perform_jobs(&self, cpu: usize) {
        loop {
            let job = self.percpu(cpu).jobs.lock().pop_front();
            let Some(job) = job else {
                return;
            };
            (job.handler)(self, job.arg);
            self.percpu(job.initiator)
                .multicast_done
                .fetch_add(1, Ordering::AcqRel);
        }
    }
}
