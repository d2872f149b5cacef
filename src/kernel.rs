//! The kernel container: every arena, every entry point.
//!
//! [`Kernel::new`] is a `const fn`, so the embedder places the entire
//! core in a `static` and nothing is ever allocated afterwards. All
//! interior mutability is per-field — atomics for the hot flags,
//! short-held spinlocks for the structures — so every method takes
//! `&self` and may be called from any processor or interrupt context
//! that the method's documentation allows.

use crate::fatal;
use crate::percpu::PerCpu;
use crate::priority::Priority;
use crate::sched::{self, SchedulerOps};
use crate::status::Status;
use crate::thread::{ClaimedFrom, ThreadControl, ThreadId, ThreadState, budget};
use crate::time::{Deadline, Timestamp};
use crate::watchdog;
use core::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use crossbeam::utils::CachePadded;
use spin::Once;

/// The scheduling and synchronization core.
#[derive(Debug)]
pub struct Kernel {
    threads: [ThreadControl; config::MAX_THREADS],
    percpu: [CachePadded<PerCpu>; config::MAX_PROCESSORS],
    schedulers: [Once<sched::Instance>; config::MAX_SCHEDULERS],

    /// The last monotonic time fed in by the embedder, the time base of
    /// the timestamp watchdog headers.
    monotonic_now: AtomicU64,

    /// Offset from the monotonic clock to the real-time clock,
    /// adjusted by [`Kernel::set_realtime_clock`].
    realtime_offset: AtomicI64,
}

impl Kernel {
    /// Builds an empty core. Processors are offline, no scheduler is
    /// installed, every thread slot is free.
    #[must_use]
    #[allow(clippy::declare_interior_mutable_const)]
    pub const fn new() -> Self {
        const THREAD: ThreadControl = ThreadControl::new();
        const CPU: CachePadded<PerCpu> = CachePadded::new(PerCpu::new());
        const SLOT: Once<sched::Instance> = Once::new();
        Self {
            threads: [THREAD; config::MAX_THREADS],
            percpu: [CPU; config::MAX_PROCESSORS],
            schedulers: [SLOT; config::MAX_SCHEDULERS],
            monotonic_now: AtomicU64::new(0),
            realtime_offset: AtomicI64::new(0),
        }
    }

    /// The control block of a thread.
    ///
    /// # Panics
    /// Terminates the system if the identifier is out of range; callers
    /// inside the core only hold identifiers they were handed out.
    #[must_use]
    pub fn thread(&self, thread: ThreadId) -> &ThreadControl {
        match self.threads.get(thread.index()) {
            Some(control) => control,
            None => fatal::terminate(fatal::Source::Internal, thread.index() as u32),
        }
    }

    /// The control record of a processor.
    ///
    /// # Panics
    /// Terminates the system if the index is out of range.
    #[must_use]
    pub fn percpu(&self, cpu: usize) -> &PerCpu {
        match self.percpu.get(cpu) {
            Some(record) => record,
            None => fatal::terminate(fatal::Source::Internal, cpu as u32),
        }
    }

    /// The installed scheduler instance in a slot, if any.
    #[must_use]
    pub fn scheduler(&self, index: usize) -> Option<&sched::Instance> {
        self.schedulers.get(index).and_then(Once::get)
    }

    fn scheduler_ops_of(&self, thread: ThreadId) -> &dyn SchedulerOps {
        let index = self.thread(thread).scheduler.load(Ordering::Acquire) as usize;
        match self.scheduler(index) {
            Some(instance) => instance.ops(),
            None => fatal::terminate(fatal::Source::Internal, index as u32),
        }
    }

    /// The processors currently online.
    #[must_use]
    pub fn online_processors(&self) -> heapless::Vec<usize, { config::MAX_PROCESSORS }> {
        self.percpu
            .iter()
            .enumerate()
            .filter(|(_, record)| record.is_online())
            .map(|(cpu, _)| cpu)
            .collect()
    }

    // ------------------------------------------------------------------
    // Initialization
    // ------------------------------------------------------------------

    /// Installs a scheduler algorithm into a slot. Slots are
    /// write-once: a second installation is rejected.
    ///
    /// # Errors
    /// [`Status::InvalidNumber`] for an out-of-range slot,
    /// [`Status::IncorrectState`] if the slot is already occupied.
    pub fn install_scheduler(
        &self,
        index: usize,
        algorithm: sched::Algorithm,
    ) -> Result<(), Status> {
        let slot = self
            .schedulers
            .get(index)
            .ok_or(Status::InvalidNumber)?;
        if slot.get().is_some() {
            return Err(Status::IncorrectState);
        }
        slot.call_once(|| sched::Instance::new(algorithm));
        log::info!("scheduler slot {index} installed with {algorithm:?}");
        Ok(())
    }

    /// Brings a processor online under the given scheduler instance,
    /// creating its reserved idle thread. Returns the idle thread.
    ///
    /// # Errors
    /// [`Status::InvalidNumber`] for an out-of-range processor or an
    /// empty scheduler slot, [`Status::IncorrectState`] if the
    /// processor is already online, [`Status::NoMemory`] if no thread
    /// slot is free for the idle thread.
    pub fn online_processor(&self, cpu: usize, scheduler: usize) -> Result<ThreadId, Status> {
        if cpu >= config::MAX_PROCESSORS || self.scheduler(scheduler).is_none() {
            return Err(Status::InvalidNumber);
        }
        let record = self.percpu(cpu);
        if record.is_online() {
            return Err(Status::IncorrectState);
        }

        let idle = self.claim_thread_slot()?;
        {
            let control = self.thread(idle);
            *control.priority.lock() = crate::priority::Aggregation::new(Priority::IDLE);
            control
                .budget
                .lock()
                .configure(budget::Policy::None, config::DEFAULT_TIMESLICE);
            control.scheduler.store(scheduler as u8, Ordering::Release);
            control.cpu.store(cpu as u8, Ordering::Release);
            control.idle.store(true, Ordering::Release);
            control.clear_state(ThreadState::DORMANT);
        }

        record.idle.store(idle.index() as u16, Ordering::Release);
        record.scheduler.store(scheduler as u8, Ordering::Release);
        record.set_executing(idle);
        record.set_heir(idle);
        record.online.store(true, Ordering::Release);

        // The scheduler registers the idle thread itself; it needs the
        // per-processor record to be filled in first.
        match self.scheduler(scheduler) {
            Some(instance) => instance.ops().add_processor(self, cpu),
            None => fatal::terminate(fatal::Source::Internal, scheduler as u32),
        }

        log::info!("cpu {cpu} online under scheduler {scheduler}, idle thread {}", idle.index());
        Ok(idle)
    }

    /// Takes a processor offline, reclaiming its capacity from its
    /// scheduler and retiring its idle thread.
    ///
    /// # Errors
    /// [`Status::IncorrectState`] if the processor is not online.
    pub fn offline_processor(&self, cpu: usize) -> Result<(), Status> {
        let record = self.percpu(cpu);
        if !record.is_online() {
            return Err(Status::IncorrectState);
        }
        let scheduler = record.scheduler.load(Ordering::Acquire) as usize;
        match self.scheduler(scheduler) {
            Some(instance) => instance.ops().remove_processor(self, cpu),
            None => fatal::terminate(fatal::Source::Internal, scheduler as u32),
        }

        if let Some(idle) = record.idle_thread() {
            self.thread(idle).in_use.store(false, Ordering::Release);
        }
        record.online.store(false, Ordering::Release);
        log::info!("cpu {cpu} offline");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Thread lifecycle
    // ------------------------------------------------------------------

    fn claim_thread_slot(&self) -> Result<ThreadId, Status> {
        for (index, control) in self.threads.iter().enumerate() {
            if control
                .in_use
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                control.reinitialize();
                return Ok(ThreadId::new(index));
            }
        }
        Err(Status::NoMemory)
    }

    /// Creates a thread in the dormant state on the given scheduler.
    ///
    /// # Errors
    /// [`Status::InvalidNumber`] for an empty scheduler slot,
    /// [`Status::NoMemory`] when the thread table is full.
    pub fn create_thread(
        &self,
        scheduler: usize,
        priority: Priority,
        policy: budget::Policy,
    ) -> Result<ThreadId, Status> {
        if self.scheduler(scheduler).is_none() {
            return Err(Status::InvalidNumber);
        }
        let thread = self.claim_thread_slot()?;
        {
            let control = self.thread(thread);
            *control.priority.lock() = crate::priority::Aggregation::new(priority);
            control
                .budget
                .lock()
                .configure(policy, config::DEFAULT_TIMESLICE);
            control.scheduler.store(scheduler as u8, Ordering::Release);
            control.preemptible.store(true, Ordering::Release);
            control.idle.store(false, Ordering::Release);
        }
        self.scheduler_ops_of(thread)
            .node_initialize(self, thread, priority);
        log::info!(
            "thread {} created at priority {} on scheduler {scheduler}",
            thread.index(),
            priority.level()
        );
        Ok(thread)
    }

    /// Starts a dormant thread; it becomes ready and competes for a
    /// processor immediately.
    ///
    /// # Errors
    /// [`Status::IncorrectState`] if the thread was not dormant.
    pub fn start_thread(&self, thread: ThreadId) -> Result<(), Status> {
        let control = self.thread(thread);
        if !control.state().contains(ThreadState::DORMANT) {
            return Err(Status::IncorrectState);
        }
        if control.clear_state(ThreadState::DORMANT) {
            self.scheduler_ops_of(thread).unblock(self, thread);
        }
        Ok(())
    }

    /// Deletes a thread and frees its slot. A thread blocked on a
    /// queue cannot be deleted directly — deleting the object it waits
    /// on flushes it out first.
    ///
    /// # Errors
    /// [`Status::IncorrectState`] while the thread is blocked on a
    /// queue.
    pub fn delete_thread(&self, thread: ThreadId) -> Result<(), Status> {
        let control = self.thread(thread);
        if control.state().contains(ThreadState::WAITING) {
            return Err(Status::IncorrectState);
        }
        // Take it out of the ready structure (or its processor) first.
        self.scheduler_ops_of(thread).withdraw_node(self, thread);
        control.set_state(ThreadState::DORMANT);
        self.scheduler_ops_of(thread).node_destroy(self, thread);
        control.in_use.store(false, Ordering::Release);
        log::info!("thread {} deleted", thread.index());
        Ok(())
    }

    /// Suspends a thread until [`Kernel::resume_thread`].
    pub fn suspend_thread(&self, thread: ThreadId) {
        if self.thread(thread).set_state(ThreadState::SUSPENDED) {
            self.scheduler_ops_of(thread).block(self, thread);
        }
    }

    /// Resumes a suspended thread.
    pub fn resume_thread(&self, thread: ThreadId) {
        if self.thread(thread).clear_state(ThreadState::SUSPENDED) {
            self.scheduler_ops_of(thread).unblock(self, thread);
        }
    }

    /// Moves the thread behind its equal-key peers in its scheduler.
    pub fn yield_thread(&self, thread: ThreadId) {
        self.scheduler_ops_of(thread).yield_now(self, thread);
    }

    /// The thread's effective priority: base or best active boost.
    #[must_use]
    pub fn effective_priority(&self, thread: ThreadId) -> Priority {
        self.thread(thread).priority.lock().effective()
    }

    /// Changes the thread's base priority.
    pub fn set_priority(&self, thread: ThreadId, priority: Priority) {
        let effective = self.thread(thread).priority.lock().set_base(priority);
        self.scheduler_ops_of(thread)
            .update_priority(self, thread, effective);
    }

    /// Adds a priority boost (e.g. while the thread holds a contested
    /// resource).
    ///
    /// # Errors
    /// [`Status::TooMany`] if the boost set is full.
    pub fn boost_priority(&self, thread: ThreadId, boost: Priority) -> Result<(), Status> {
        let effective = self
            .thread(thread)
            .priority
            .lock()
            .add_boost(boost)
            .ok_or(Status::TooMany)?;
        self.scheduler_ops_of(thread)
            .update_priority(self, thread, effective);
        Ok(())
    }

    /// Removes a previously added boost.
    pub fn unboost_priority(&self, thread: ThreadId, boost: Priority) {
        let effective = self.thread(thread).priority.lock().remove_boost(boost);
        self.scheduler_ops_of(thread)
            .update_priority(self, thread, effective);
    }

    /// Reconfigures the thread's timeslice policy.
    pub fn set_budget(&self, thread: ThreadId, policy: budget::Policy, timeslice: u32) {
        self.thread(thread).budget.lock().configure(policy, timeslice);
    }

    /// Controls whether equal-priority timeslicing may preempt the
    /// thread. Urgency-based preemption is not affected.
    pub fn set_preemptible(&self, thread: ThreadId, preemptible: bool) {
        self.thread(thread)
            .preemptible
            .store(preemptible, Ordering::Release);
    }

    /// Establishes the deadline of the thread's current job.
    pub fn release_job(&self, thread: ThreadId, deadline: u64) {
        self.scheduler_ops_of(thread).release_job(self, thread, deadline);
    }

    /// Withdraws the thread's deadline.
    pub fn cancel_job(&self, thread: ThreadId) {
        self.scheduler_ops_of(thread).cancel_job(self, thread);
    }

    // ------------------------------------------------------------------
    // Scheduler plumbing shared with the thread queue
    // ------------------------------------------------------------------

    /// Installs a new heir on a processor, flagging a dispatch if it
    /// changed.
    pub(crate) fn update_heir(&self, cpu: usize, thread: ThreadId) {
        let record = self.percpu(cpu);
        if record.set_heir(thread) {
            record.dispatch_necessary.store(true, Ordering::Release);
        }
    }

    /// Marks the thread blocked-on-a-queue and removes it from its
    /// ready structure if this took it out of the ready state.
    pub(crate) fn block_thread(&self, thread: ThreadId) {
        if self.thread(thread).set_state(ThreadState::WAITING) {
            self.scheduler_ops_of(thread).block(self, thread);
        }
    }

    /// Clears the blocked-on-a-queue mark, reinserting the thread into
    /// its ready structure if it became ready.
    pub(crate) fn unblock_thread(&self, thread: ThreadId) {
        if self.thread(thread).clear_state(ThreadState::WAITING) {
            self.scheduler_ops_of(thread).unblock(self, thread);
        }
    }

    // ------------------------------------------------------------------
    // Watchdog service
    // ------------------------------------------------------------------

    /// Arms a timeout entry for a blocking thread, on the thread's
    /// processor. `Deadline::Never` arms nothing.
    pub(crate) fn arm_thread_timeout(
        &self,
        thread: ThreadId,
        deadline: Deadline,
    ) -> Option<watchdog::Ticket> {
        let cpu = self.thread(thread).assigned_cpu();
        let (clock, expires) = match deadline {
            Deadline::Never => return None,
            Deadline::Ticks(relative) => (
                watchdog::Clock::Ticks,
                self.percpu(cpu).now_ticks().saturating_add(relative),
            ),
            Deadline::Monotonic(at) => (watchdog::Clock::Monotonic, at.as_nanos()),
            Deadline::Realtime(at) => (watchdog::Clock::Realtime, at.as_nanos()),
        };
        Some(self.watchdog_insert(cpu, clock, expires, Self::thread_timeout, thread.index()))
    }

    /// Cancels the thread's armed timeout, if it is still pending.
    /// Returns the remaining time on its clock.
    pub(crate) fn cancel_thread_timeout(&self, thread: ThreadId) -> Option<u64> {
        let ticket = self.thread(thread).wait.lock().timeout.take()?;
        self.watchdog_cancel(ticket)
    }

    /// The watchdog routine ending a wait by timeout: the identical
    /// claim a producer performs, delivering [`Status::Timeout`]. The
    /// consumer unlinks itself from the waiter chain when it resumes.
    fn thread_timeout(kernel: &Kernel, arg: usize) {
        let thread = ThreadId::new(arg);
        if let Some(claimed) = kernel.thread(thread).claim(Status::Timeout)
            && claimed == ClaimedFrom::Blocked
        {
            kernel.unblock_thread(thread);
        }
    }

    /// Arms a watchdog entry on the given processor and clock.
    ///
    /// The fixed capacity of a header fits one entry per thread plus
    /// headroom for standalone timers; overflowing it means the system
    /// was configured wrong, which is not locally recoverable.
    pub fn watchdog_insert(
        &self,
        cpu: usize,
        clock: watchdog::Clock,
        expires: u64,
        routine: watchdog::Routine,
        arg: usize,
    ) -> watchdog::Ticket {
        let header = self.watchdog_header(cpu, clock);
        match header.lock().insert(expires, routine, arg) {
            Ok(seq) => watchdog::Ticket { cpu, clock, seq },
            Err(_) => fatal::terminate(fatal::Source::Watchdog, cpu as u32),
        }
    }

    /// Cancels a pending watchdog entry. Returns the time remaining on
    /// the entry's clock, or `None` if it already fired or was already
    /// canceled — firing is terminal.
    pub fn watchdog_cancel(&self, ticket: watchdog::Ticket) -> Option<u64> {
        let now = match ticket.clock {
            watchdog::Clock::Ticks => self.percpu(ticket.cpu).now_ticks(),
            watchdog::Clock::Monotonic => self.now_monotonic().as_nanos(),
            watchdog::Clock::Realtime => self.now_realtime().as_nanos(),
        };
        self.watchdog_header(ticket.cpu, ticket.clock)
            .lock()
            .cancel(ticket.seq, now)
    }

    fn watchdog_header(
        &self,
        cpu: usize,
        clock: watchdog::Clock,
    ) -> &spin::Mutex<watchdog::Header> {
        let record = self.percpu(cpu);
        match clock {
            watchdog::Clock::Ticks => &record.watchdog_ticks,
            watchdog::Clock::Monotonic => &record.watchdog_monotonic,
            watchdog::Clock::Realtime => &record.watchdog_realtime,
        }
    }

    /// Removes every due entry under the header lock, then fires the
    /// routines with the lock released, so routines may take queue
    /// locks or re-arm entries.
    fn fire_header(&self, cpu: usize, clock: watchdog::Clock, now: u64) -> usize {
        let mut fired = watchdog::Fired::new();
        self.watchdog_header(cpu, clock)
            .lock()
            .take_due(now, &mut fired);
        for entry in &fired {
            (entry.routine)(self, entry.arg);
        }
        fired.len()
    }

    // ------------------------------------------------------------------
    // Clock entry points
    // ------------------------------------------------------------------

    /// The per-processor tick: advances the tick counter, drains
    /// pending cross-processor jobs, fires due tick-based timeouts,
    /// consumes the executing thread's budget and applies any dispatch
    /// that became due. Called from the timer interrupt path.
    pub fn clock_tick(&self, cpu: usize) {
        let record = self.percpu(cpu);
        let now = record.tick_count.fetch_add(1, Ordering::AcqRel) + 1;

        self.perform_jobs(cpu);
        self.fire_header(cpu, watchdog::Clock::Ticks, now);
        self.budget_tick(cpu);
        self.thread_dispatch(cpu);
    }

    /// The timestamp tick: feeds the current monotonic time in and
    /// fires due timestamp-based timeouts on this processor, on both
    /// timestamp clocks.
    pub fn timestamp_tick(&self, cpu: usize, now: Timestamp) {
        self.monotonic_now
            .fetch_max(now.as_nanos(), Ordering::AcqRel);
        self.fire_header(cpu, watchdog::Clock::Monotonic, now.as_nanos());
        let realtime = now.offset_by(self.realtime_offset.load(Ordering::Acquire));
        self.fire_header(cpu, watchdog::Clock::Realtime, realtime.as_nanos());
    }

    /// Sets the real-time clock. Every pending real-time entry on
    /// every online processor is re-evaluated against the new epoch;
    /// entries now at or past their expiration fire immediately, in
    /// expiration order, so a clock jump can neither skip a timer that
    /// is logically due nor fire one twice.
    pub fn set_realtime_clock(&self, now: Timestamp) {
        let monotonic = self.monotonic_now.load(Ordering::Acquire);
        #[allow(clippy::cast_possible_wrap)]
        let offset = now.as_nanos().wrapping_sub(monotonic) as i64;
        self.realtime_offset.store(offset, Ordering::Release);

        let mut fired = 0;
        for cpu in self.online_processors() {
            fired += self.fire_header(cpu, watchdog::Clock::Realtime, now.as_nanos());
        }
        log::debug!(
            "realtime clock set to {} ns, {fired} pending entries fired",
            now.as_nanos()
        );
    }

    /// The current monotonic time, as last fed in by the embedder.
    #[must_use]
    pub fn now_monotonic(&self) -> Timestamp {
        Timestamp::from_nanos(self.monotonic_now.load(Ordering::Acquire))
    }

    /// The current real-time clock reading.
    #[must_use]
    pub fn now_realtime(&self) -> Timestamp {
        self.now_monotonic()
            .offset_by(self.realtime_offset.load(Ordering::Acquire))
    }

    /// Consumes one tick of the executing thread's budget, yielding it
    /// to its equal-priority peers on exhaustion. Idle threads,
    /// non-preemptible threads and threads that are not ready (already
    /// on their way out) are exempt.
    fn budget_tick(&self, cpu: usize) {
        let Some(executing) = self.percpu(cpu).executing() else {
            return;
        };
        let control = self.thread(executing);
        if control.is_idle()
            || !control.preemptible.load(Ordering::Acquire)
            || !control.is_ready()
        {
            return;
        }
        if control.budget.lock().consume() {
            log::trace!("thread {} exhausted its timeslice", executing.index());
            self.yield_thread(executing);
        }
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new()
    }
}
