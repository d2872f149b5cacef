//! The thread queue: the blocking/wakeup protocol under every
//! synchronization object.
//!
//! A [`ThreadQueue`] guards both the chain of blocked threads and the
//! condition state `T` of the owning object (a semaphore's count, an
//! event set's pending bits...) with one short-held lock, because the
//! decision "is the condition satisfied?" and the decision "then I will
//! block" must be atomic with respect to producers. The blocking
//! transition itself, though, runs with no lock held at all; consumers
//! and producers meet on the thread's wait-flags word instead:
//!
//! 1. The consumer tests the condition under the queue lock. Satisfied:
//!    consume and return, nothing ever blocks. Unsatisfied with
//!    `NO_WAIT`: return [`Status::Unsatisfied`].
//! 2. Otherwise it records its wait parameters, announces
//!    `INTEND_TO_BLOCK`, links itself into the chain and releases the
//!    lock.
//! 3. With dispatching disabled it arms its timeout, blocks itself in
//!    its scheduler, and tries to commit `INTEND_TO_BLOCK → BLOCKED`.
//! 4. A producer that finds the condition satisfiable for the chain's
//!    first eligible waiter tries `INTEND_TO_BLOCK → READY_AGAIN`
//!    first. Winning means the consumer had not committed: the
//!    producer consumes on the consumer's behalf and walks away; the
//!    consumer notices its failed commit and undoes its own blocking.
//!    If the waiter was already `BLOCKED`, the producer claims
//!    `BLOCKED → READY_AGAIN`, cancels the waiter's timeout and
//!    unblocks it in its scheduler.
//!
//! Every transition into `READY_AGAIN` is a single compare-and-swap
//! carrying the outcome status, so exactly one waker wins each wait and
//! the consumer cannot observe a half-delivered outcome. A timeout is
//! just another waker that happens to deliver [`Status::Timeout`]; it
//! acts on the thread alone and leaves unlinking to the consumer, which
//! producers tolerate by skipping waiters whose wait already ended.

use crate::kernel::Kernel;
use crate::priority::Priority;
use crate::status::Status;
use crate::thread::{ClaimedFrom, ThreadId, WaitClass, wait_state};
use crate::time::Deadline;
use crate::watchdog;
use bitflags::bitflags;
use crossbeam::utils::Backoff;
use heapless::Vec;
use spin::Mutex;

bitflags! {
    /// Options modifying a seize.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WaitOptions: u32 {
        /// Do not block; report [`Status::Unsatisfied`] instead.
        const NO_WAIT = 1 << 0;
    }
}

/// The per-thread wait parameters, populated only between a seize and
/// its completion. The queue back-reference of the original design is
/// the `in_queue` flag plus the consumer's own knowledge of which queue
/// it called into; both are only meaningful while blocked.
#[derive(Debug)]
pub struct WaitBlock {
    /// What the consumer asked for, interpreted by the owning object
    /// (e.g. the requested event bits). Read by producers deciding
    /// satisfiability; never modified by the wait itself.
    pub requested: u32,

    /// What the wait delivered, written by the satisfying producer
    /// before it claims the waiter (or by the consumer itself on the
    /// immediate path).
    pub captured: u32,

    /// The armed timeout entry, if any.
    pub(crate) timeout: Option<watchdog::Ticket>,

    /// Whether the thread is still linked into the waiter chain.
    /// Guarded by the queue lock.
    pub(crate) in_queue: bool,
}

impl WaitBlock {
    #[must_use]
    pub(crate) const fn new() -> Self {
        Self {
            requested: 0,
            captured: 0,
            timeout: None,
            in_queue: false,
        }
    }
}

/// A producer's view of one waiter, handed to the satisfiability and
/// consumption closures.
#[derive(Debug, Clone, Copy)]
pub struct WaitInfo {
    pub thread: ThreadId,
    pub requested: u32,
    pub priority: Priority,
}

/// The result of a seize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    pub status: Status,

    /// The value delivered by whoever satisfied the wait (e.g. the
    /// matched event bits). Zero unless the status is
    /// [`Status::Successful`].
    pub value: u32,
}

impl Outcome {
    const fn of(status: Status) -> Self {
        Self { status, value: 0 }
    }
}

/// The waiter ordering of a queue, fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisciplineKind {
    /// First come, first served.
    Fifo,

    /// More urgent effective priority first; FIFO among equals.
    Priority,
}

type Chain = Vec<ThreadId, { config::MAX_THREADS }>;

/// The insertion half of the waiter-ordering operations table.
/// Extraction and "first" are position-based and shared by both
/// disciplines.
trait Discipline: Sync + core::fmt::Debug {
    fn enqueue(&self, kernel: &Kernel, chain: &mut Chain, thread: ThreadId);
}

#[derive(Debug)]
struct FifoDiscipline;

#[derive(Debug)]
struct PriorityDiscipline;

impl Discipline for FifoDiscipline {
    fn enqueue(&self, _kernel: &Kernel, chain: &mut Chain, thread: ThreadId) {
        if chain.push(thread).is_err() {
            crate::fatal::terminate(crate::fatal::Source::ThreadQueue, thread.index() as u32);
        }
    }
}

impl Discipline for PriorityDiscipline {
    fn enqueue(&self, kernel: &Kernel, chain: &mut Chain, thread: ThreadId) {
        let priority = kernel.effective_priority(thread);
        // Behind every waiter that is at least as urgent: equal
        // priorities stay FIFO.
        let position = chain
            .iter()
            .position(|&other| kernel.effective_priority(other) > priority)
            .unwrap_or(chain.len());
        if chain.insert(position, thread).is_err() {
            crate::fatal::terminate(crate::fatal::Source::ThreadQueue, thread.index() as u32);
        }
    }
}

const FIFO: &dyn Discipline = &FifoDiscipline;
const PRIORITY: &dyn Discipline = &PriorityDiscipline;

#[derive(Debug)]
struct Inner<T> {
    state: T,
    chain: Chain,
}

/// A blockable queue of threads plus the condition state it guards.
#[derive(Debug)]
pub struct ThreadQueue<T> {
    discipline: &'static dyn Discipline,
    inner: Mutex<Inner<T>>,
}

impl<T> ThreadQueue<T> {
    /// Creates a queue with the given waiter ordering and initial
    /// condition state.
    #[must_use]
    pub const fn new(discipline: DisciplineKind, state: T) -> Self {
        let discipline = match discipline {
            DisciplineKind::Fifo => FIFO,
            DisciplineKind::Priority => PRIORITY,
        };
        Self {
            discipline,
            inner: Mutex::new(Inner {
                state,
                chain: Vec::new(),
            }),
        }
    }

    /// Runs a closure against the condition state under the queue lock.
    /// For producers whose update can never satisfy a waiter and for
    /// inspection; everything else goes through [`Self::seize`] and
    /// [`Self::surrender`].
    pub fn with_state<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.inner.lock().state)
    }

    /// The consumer path: consume the condition or block until some
    /// producer does it on our behalf.
    ///
    /// `try_consume` is evaluated under the queue lock; returning
    /// `Some(value)` means the condition was satisfied and consumed
    /// immediately. Otherwise the thread blocks with the recorded
    /// `requested` word visible to producers, until a surrender, flush
    /// or timeout ends the wait. The outcome carries the status and the
    /// value delivered by whoever satisfied the wait.
    pub fn seize(
        &self,
        kernel: &Kernel,
        executing: ThreadId,
        class: WaitClass,
        options: WaitOptions,
        requested: u32,
        deadline: Deadline,
        try_consume: impl FnOnce(&mut T) -> Option<u32>,
    ) -> Outcome {
        let thread = kernel.thread(executing);

        let mut inner = self.inner.lock();
        if let Some(value) = try_consume(&mut inner.state) {
            return Outcome {
                status: Status::Successful,
                value,
            };
        }
        if options.contains(WaitOptions::NO_WAIT) {
            return Outcome::of(Status::Unsatisfied);
        }

        {
            let mut wait = thread.wait.lock();
            wait.requested = requested;
            wait.captured = 0;
            wait.timeout = None;
            wait.in_queue = true;
        }
        thread.announce_intent(class);
        self.discipline.enqueue(kernel, &mut inner.chain, executing);
        drop(inner);

        let cpu = thread.assigned_cpu();
        kernel.dispatch_disable(cpu);

        if let Some(ticket) = kernel.arm_thread_timeout(executing, deadline) {
            thread.wait.lock().timeout = Some(ticket);
        }
        kernel.block_thread(executing);

        if !thread.commit_block() {
            // A waker won between the announcement and the commit: the
            // wait is already over and the thread never truly slept.
            // Undo the timeout and the scheduler bookkeeping.
            kernel.cancel_thread_timeout(executing);
            kernel.unblock_thread(executing);
        }
        kernel.dispatch_enable(cpu);

        // A real kernel context-switches away here and resumes once the
        // wait state reaches READY_AGAIN; parking the calling context on
        // the wait-flags word is this library's stand-in for that.
        let backoff = Backoff::new();
        while thread.wait_state() != wait_state::READY_AGAIN {
            backoff.snooze();
        }

        // Unlink ourselves unless the waker already did. A timeout
        // leaves the chain entry in place on purpose; producers skip
        // and reap such entries lazily.
        let mut inner = self.inner.lock();
        if thread.wait.lock().in_queue {
            if let Some(position) = inner.chain.iter().position(|&t| t == executing) {
                inner.chain.remove(position);
            }
            thread.wait.lock().in_queue = false;
        }
        drop(inner);

        let status = thread.wait_outcome();
        let value = thread.wait.lock().captured;
        thread.finish_wait();
        Outcome { status, value }
    }

    /// The producer path: update the condition, then satisfy the first
    /// eligible waiter if the updated condition allows it.
    ///
    /// `satisfiable` inspects without consuming and reports the value
    /// the wait would deliver; `consume` applies the consumption once
    /// the waiter is successfully claimed. The split exists because a
    /// waiter can lose its wait to a concurrent timeout at the last
    /// instant, in which case nothing must have been consumed yet and
    /// the producer moves on to the next waiter. Returns the woken
    /// thread, if any; otherwise the update is simply recorded for a
    /// future seize.
    pub fn surrender(
        &self,
        kernel: &Kernel,
        update: impl FnOnce(&mut T),
        mut satisfiable: impl FnMut(&T, &WaitInfo) -> Option<u32>,
        mut consume: impl FnMut(&mut T, &WaitInfo),
    ) -> Option<ThreadId> {
        let mut inner = self.inner.lock();
        update(&mut inner.state);

        loop {
            let Some(&candidate) = inner.chain.first() else {
                return None;
            };
            let thread = kernel.thread(candidate);

            // Reap waiters whose wait already ended (timeout, deletion);
            // they will see `in_queue == false` and skip their own
            // unlink.
            if thread.wait_state() == wait_state::READY_AGAIN {
                inner.chain.remove(0);
                thread.wait.lock().in_queue = false;
                continue;
            }

            let info = WaitInfo {
                thread: candidate,
                requested: thread.wait.lock().requested,
                priority: kernel.effective_priority(candidate),
            };
            let Some(value) = satisfiable(&inner.state, &info) else {
                return None;
            };

            // Publish the delivered value, then claim. The claim is the
            // commit point: after it the consumer may resume at any
            // moment and must find its value in place.
            thread.wait.lock().captured = value;
            let Some(claimed) = thread.claim(Status::Successful) else {
                // A timeout won at the last instant; nothing has been
                // consumed. Drop the stale waiter, try the next one.
                inner.chain.remove(0);
                thread.wait.lock().in_queue = false;
                continue;
            };

            consume(&mut inner.state, &info);
            inner.chain.remove(0);
            thread.wait.lock().in_queue = false;

            if claimed == ClaimedFrom::Blocked {
                kernel.cancel_thread_timeout(candidate);
                kernel.unblock_thread(candidate);
            }
            return Some(candidate);
        }
    }

    /// Ends every pending wait with the given status, without touching
    /// the condition state. Object deletion flushes with
    /// [`Status::ObjectWasDeleted`]. Flushing an empty queue is a
    /// no-op. Returns the number of waits actually ended.
    pub fn flush(&self, kernel: &Kernel, status: Status) -> usize {
        let mut inner = self.inner.lock();
        let mut woken = 0;

        while let Some(&candidate) = inner.chain.first() {
            inner.chain.remove(0);
            let thread = kernel.thread(candidate);
            thread.wait.lock().in_queue = false;

            if let Some(claimed) = thread.claim(status) {
                woken += 1;
                if claimed == ClaimedFrom::Blocked {
                    kernel.cancel_thread_timeout(candidate);
                    kernel.unblock_thread(candidate);
                }
            }
        }
        woken
    }

    /// The number of threads currently linked into the chain. Stale
    /// entries of already-ended waits may be included until a producer
    /// or the waiters themselves reap them.
    #[must_use]
    pub fn waiter_count(&self) -> usize {
        self.inner.lock().chain.len()
    }
}
