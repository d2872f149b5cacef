//! End-to-end scheduling scenarios.
//!
//! Real `std::thread`s stand in for the threads of the embedding system:
//! a blocking seize parks the calling OS thread until a producer, flush
//! or timeout ends the wait, exactly as a context switch would park a
//! real thread. The fixtures below are the minimal synchronization
//! objects an API layer would build on the thread queue.

use kestrel::priority::Priority;
use kestrel::sched::Algorithm;
use kestrel::thread::{ThreadId, WaitClass, budget::Policy, wait_state};
use kestrel::time::Deadline;
use kestrel::wait::{DisciplineKind, ThreadQueue, WaitOptions};
use kestrel::{Kernel, Status};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

/// A counting semaphore on a thread queue.
struct Semaphore {
    queue: ThreadQueue<u32>,
}

impl Semaphore {
    fn new(discipline: DisciplineKind, count: u32) -> Self {
        Self {
            queue: ThreadQueue::new(discipline, count),
        }
    }

    fn acquire(
        &self,
        kernel: &Kernel,
        thread: ThreadId,
        options: WaitOptions,
        deadline: Deadline,
    ) -> Status {
        self.queue
            .seize(kernel, thread, WaitClass::Object, options, 0, deadline, |count| {
                if *count > 0 {
                    *count -= 1;
                    Some(0)
                } else {
                    None
                }
            })
            .status
    }

    fn release(&self, kernel: &Kernel) -> Option<ThreadId> {
        self.queue.surrender(
            kernel,
            |count| *count += 1,
            |count, _| if *count > 0 { Some(0) } else { None },
            |count, _| *count -= 1,
        )
    }

    fn count(&self, _kernel: &Kernel) -> u32 {
        self.queue.with_state(|count| *count)
    }
}

/// An event set: waiters ask for bits, posters OR bits in.
struct EventSet {
    queue: ThreadQueue<u32>,
}

impl EventSet {
    fn new() -> Self {
        Self {
            queue: ThreadQueue::new(DisciplineKind::Fifo, 0),
        }
    }

    /// Waits for any of the requested bits; returns the matched bits.
    fn wait_any(
        &self,
        kernel: &Kernel,
        thread: ThreadId,
        requested: u32,
        deadline: Deadline,
    ) -> (Status, u32) {
        let outcome = self.queue.seize(
            kernel,
            thread,
            WaitClass::Event,
            WaitOptions::empty(),
            requested,
            deadline,
            |pending| {
                let matched = *pending & requested;
                if matched != 0 {
                    *pending &= !matched;
                    Some(matched)
                } else {
                    None
                }
            },
        );
        (outcome.status, outcome.value)
    }

    fn post(&self, kernel: &Kernel, bits: u32) -> Option<ThreadId> {
        self.queue.surrender(
            kernel,
            |pending| *pending |= bits,
            |pending, info| {
                let matched = *pending & info.requested;
                if matched != 0 { Some(matched) } else { None }
            },
            |pending, info| {
                *pending &= !(*pending & info.requested);
            },
        )
    }

    fn pending(&self) -> u32 {
        self.queue.with_state(|pending| *pending)
    }
}

fn leak_kernel() -> &'static Kernel {
    Box::leak(Box::new(Kernel::new()))
}

/// One bitmap-scheduled processor.
fn uniprocessor() -> &'static Kernel {
    let kernel = leak_kernel();
    kernel
        .install_scheduler(0, Algorithm::PriorityBitmap)
        .unwrap();
    kernel.online_processor(0, 0).unwrap();
    kernel
}

/// An EDF instance spanning the given processors.
fn edf_multiprocessor(cpus: usize) -> &'static Kernel {
    let kernel = leak_kernel();
    kernel.install_scheduler(0, Algorithm::EdfSmp).unwrap();
    for cpu in 0..cpus {
        kernel.online_processor(cpu, 0).unwrap();
    }
    kernel
}

fn spawn_started_thread(kernel: &Kernel, priority: Priority) -> ThreadId {
    let thread = kernel
        .create_thread(0, priority, Policy::None)
        .unwrap();
    kernel.start_thread(thread).unwrap();
    thread
}

/// Polls until `predicate` holds, panicking after a generous deadline so
/// a protocol bug fails the test instead of hanging it.
fn wait_until(what: &str, predicate: impl Fn() -> bool) {
    let start = Instant::now();
    while !predicate() {
        assert!(
            start.elapsed() < Duration::from_secs(10),
            "timed out waiting for: {what}"
        );
        std::thread::yield_now();
    }
}

// ----------------------------------------------------------------------
// Scenario A: priority wins a semaphore release.
// ----------------------------------------------------------------------

#[test]
fn higher_priority_waiter_gets_the_semaphore() {
    let kernel = uniprocessor();
    let urgent = spawn_started_thread(kernel, Priority::new(5));
    let relaxed = spawn_started_thread(kernel, Priority::new(10));

    let semaphore = Semaphore::new(DisciplineKind::Priority, 0);

    std::thread::scope(|scope| {
        let urgent_wait = scope.spawn(|| {
            semaphore.acquire(kernel, urgent, WaitOptions::empty(), Deadline::Never)
        });
        let relaxed_wait = scope.spawn(|| {
            semaphore.acquire(kernel, relaxed, WaitOptions::empty(), Deadline::Never)
        });

        wait_until("both threads queued", || semaphore.queue.waiter_count() == 2);

        let woken = semaphore.release(kernel);
        assert_eq!(woken, Some(urgent));
        assert_eq!(urgent_wait.join().unwrap(), Status::Successful);

        // The lower-priority thread is still blocked and the semaphore
        // is empty again.
        assert_eq!(semaphore.queue.waiter_count(), 1);
        assert_eq!(semaphore.count(kernel), 0);

        // Let the remaining waiter out before the queue goes away.
        assert_eq!(semaphore.queue.flush(kernel, Status::ObjectWasDeleted), 1);
        assert_eq!(relaxed_wait.join().unwrap(), Status::ObjectWasDeleted);
    });
}

// ----------------------------------------------------------------------
// Scenario B: a ten-tick timeout fires on the tenth tick.
// ----------------------------------------------------------------------

#[test]
fn event_wait_times_out_after_exactly_ten_ticks() {
    let kernel = uniprocessor();
    let waiter = spawn_started_thread(kernel, Priority::DEFAULT);
    let events = EventSet::new();

    std::thread::scope(|scope| {
        let wait = scope.spawn(|| {
            events.wait_any(kernel, waiter, 0b1010, Deadline::Ticks(10))
        });

        // The timeout is armed strictly before the blocked state is
        // committed, so waiting for the commit closes the window where
        // early ticks would not yet count against the entry.
        wait_until("waiter blocked", || {
            kernel.thread(waiter).wait_state() == wait_state::BLOCKED
        });

        // Nine ticks: still waiting.
        for _ in 0..9 {
            kernel.clock_tick(0);
        }
        assert!(!wait.is_finished());

        // The tenth tick delivers the timeout.
        kernel.clock_tick(0);
        let (status, value) = wait.join().unwrap();
        assert_eq!(status, Status::Timeout);
        assert_eq!(value, 0);

        // No event was ever posted or consumed.
        assert_eq!(events.pending(), 0);
    });
}

#[test]
fn posted_event_bits_wake_the_waiter_with_the_match() {
    let kernel = uniprocessor();
    let waiter = spawn_started_thread(kernel, Priority::DEFAULT);
    let events = EventSet::new();

    std::thread::scope(|scope| {
        let wait = scope.spawn(|| events.wait_any(kernel, waiter, 0b01, Deadline::Never));

        wait_until("waiter queued", || events.queue.waiter_count() == 1);

        assert_eq!(events.post(kernel, 0b11), Some(waiter));
        assert_eq!(wait.join().unwrap(), (Status::Successful, 0b01));

        // Only the matched bit was consumed on the waiter's behalf.
        assert_eq!(events.pending(), 0b10);
    });
}

// ----------------------------------------------------------------------
// Scenario C: EDF assigns the two earliest deadlines, then promotes the
// third when the first job completes.
// ----------------------------------------------------------------------

#[test]
fn edf_assigns_earliest_deadlines_and_promotes_on_completion() {
    let kernel = edf_multiprocessor(2);
    let first = spawn_started_thread(kernel, Priority::DEFAULT);
    let second = spawn_started_thread(kernel, Priority::DEFAULT);
    let third = spawn_started_thread(kernel, Priority::DEFAULT);

    kernel.release_job(first, 100);
    kernel.release_job(second, 200);
    kernel.release_job(third, 300);

    let heirs = || {
        let mut assigned = vec![
            kernel.percpu(0).heir().unwrap(),
            kernel.percpu(1).heir().unwrap(),
        ];
        assigned.sort_by_key(|thread| thread.index());
        assigned
    };

    let mut expected = vec![first, second];
    expected.sort_by_key(|thread| thread.index());
    assert_eq!(heirs(), expected);

    // The earliest job completes; its thread loses the deadline and the
    // third thread is assigned within one scheduling decision.
    kernel.cancel_job(first);

    let mut expected = vec![second, third];
    expected.sort_by_key(|thread| thread.index());
    assert_eq!(heirs(), expected);
}

// ----------------------------------------------------------------------
// Scenario D: a multicast returns only after every target ran the job.
// ----------------------------------------------------------------------

static MULTICAST_HITS: AtomicU32 = AtomicU32::new(0);

fn count_hit(_kernel: &Kernel, _arg: usize) {
    MULTICAST_HITS.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn multicast_rendezvous_counts_every_online_processor() {
    let kernel = edf_multiprocessor(4);
    let online: Vec<usize> = kernel.online_processors().iter().copied().collect();
    assert_eq!(online.len(), 4);

    let done = AtomicU32::new(0);
    std::thread::scope(|scope| {
        // Each non-initiating processor drains its job queue as its
        // tick handler would.
        for &cpu in &online[1..] {
            let done = &done;
            scope.spawn(move || {
                while done.load(Ordering::SeqCst) == 0 {
                    kernel.perform_jobs(cpu);
                    std::thread::yield_now();
                }
            });
        }

        let status = kernel.multicast_action(0, &online, count_hit, 0);
        assert_eq!(status, Status::Successful);
        assert_eq!(MULTICAST_HITS.load(Ordering::SeqCst), 4);
        done.store(1, Ordering::SeqCst);
    });
}

// ----------------------------------------------------------------------
// No lost wakeups under concurrency.
// ----------------------------------------------------------------------

#[test]
fn seize_and_surrender_never_lose_a_wakeup() {
    const ROUNDS: u32 = 500;

    let kernel = uniprocessor();
    let consumer = spawn_started_thread(kernel, Priority::DEFAULT);
    let semaphore = Semaphore::new(DisciplineKind::Fifo, 0);
    let stop_ticking = AtomicU32::new(0);

    std::thread::scope(|scope| {
        // A tick source so short timeouts can fire at any interleaving.
        scope.spawn(|| {
            while stop_ticking.load(Ordering::SeqCst) == 0 {
                kernel.clock_tick(0);
                std::thread::yield_now();
            }
        });

        let consumed = scope.spawn(|| {
            let mut successes = 0;
            for _ in 0..ROUNDS {
                match semaphore.acquire(
                    kernel,
                    consumer,
                    WaitOptions::empty(),
                    Deadline::Ticks(3),
                ) {
                    Status::Successful => successes += 1,
                    Status::Timeout => {}
                    other => panic!("unexpected status {other:?}"),
                }
            }
            successes
        });

        for _ in 0..ROUNDS {
            semaphore.release(kernel);
            std::thread::yield_now();
        }

        let successes = consumed.join().unwrap();
        stop_ticking.store(1, Ordering::SeqCst);

        // Releases are never lost and never double-delivered: whatever
        // the consumer did not take is still in the count.
        assert_eq!(semaphore.count(kernel) + successes, ROUNDS);
    });
}

// ----------------------------------------------------------------------
// Flush semantics.
// ----------------------------------------------------------------------

#[test]
fn flushing_an_empty_queue_twice_is_a_no_op() {
    let kernel = uniprocessor();
    let semaphore = Semaphore::new(DisciplineKind::Fifo, 0);

    assert_eq!(semaphore.queue.flush(kernel, Status::ObjectWasDeleted), 0);
    assert_eq!(semaphore.queue.flush(kernel, Status::ObjectWasDeleted), 0);
}

#[test]
fn flush_delivers_deleted_status_to_every_waiter() {
    let kernel = uniprocessor();
    let first = spawn_started_thread(kernel, Priority::new(7));
    let second = spawn_started_thread(kernel, Priority::new(9));
    let semaphore = Semaphore::new(DisciplineKind::Fifo, 0);

    std::thread::scope(|scope| {
        let semaphore = &semaphore;
        let waits = [first, second].map(|thread| {
            scope.spawn(move || {
                semaphore.acquire(kernel, thread, WaitOptions::empty(), Deadline::Never)
            })
        });

        wait_until("both threads queued", || semaphore.queue.waiter_count() == 2);

        assert_eq!(semaphore.queue.flush(kernel, Status::ObjectWasDeleted), 2);
        for wait in waits {
            assert_eq!(wait.join().unwrap(), Status::ObjectWasDeleted);
        }
        assert_eq!(semaphore.queue.flush(kernel, Status::ObjectWasDeleted), 0);
    });
}

// ----------------------------------------------------------------------
// Non-blocking seize and immediate satisfaction.
// ----------------------------------------------------------------------

#[test]
fn no_wait_reports_unsatisfied_without_blocking() {
    let kernel = uniprocessor();
    let thread = spawn_started_thread(kernel, Priority::DEFAULT);
    let semaphore = Semaphore::new(DisciplineKind::Fifo, 0);

    let status = semaphore.acquire(kernel, thread, WaitOptions::NO_WAIT, Deadline::Never);
    assert_eq!(status, Status::Unsatisfied);
    assert_eq!(semaphore.queue.waiter_count(), 0);
}

#[test]
fn satisfied_condition_never_blocks() {
    let kernel = uniprocessor();
    let thread = spawn_started_thread(kernel, Priority::DEFAULT);
    let semaphore = Semaphore::new(DisciplineKind::Fifo, 2);

    assert_eq!(
        semaphore.acquire(kernel, thread, WaitOptions::empty(), Deadline::Never),
        Status::Successful
    );
    assert_eq!(semaphore.count(kernel), 1);
}

// ----------------------------------------------------------------------
// Timeslice exhaustion yields to the equal-priority peer.
// ----------------------------------------------------------------------

#[test]
fn timeslice_exhaustion_rotates_equal_priority_threads() {
    let kernel = uniprocessor();
    let first = kernel
        .create_thread(0, Priority::new(50), Policy::ResetTimeslice)
        .unwrap();
    let second = kernel
        .create_thread(0, Priority::new(50), Policy::ResetTimeslice)
        .unwrap();
    kernel.start_thread(first).unwrap();
    kernel.start_thread(second).unwrap();

    // The first arrival is the heir; make it the executing thread.
    kernel.thread_dispatch(0);
    assert_eq!(kernel.percpu(0).executing(), Some(first));

    // A full timeslice later the peer has taken over.
    for _ in 0..config::DEFAULT_TIMESLICE {
        kernel.clock_tick(0);
    }
    assert_eq!(kernel.percpu(0).executing(), Some(second));
}
