#![no_std]

/// The maximum number of processors the core can manage. Every per-processor
/// structure (watchdog headers, job queues, scheduler assignment tables) is
/// sized with this constant, so lowering it directly reduces the static
/// memory footprint of the core. Processors beyond the number actually
/// brought online simply stay unused.
pub const MAX_PROCESSORS: usize = 8;

/// The maximum number of threads that can exist at the same time. The thread
/// control blocks and every scheduler's node table are allocated as fixed
/// arrays of this size, so the core never has to allocate memory when a
/// thread is created: creation only claims a free slot in the table.
///
/// The value includes the per-processor idle threads, which are created
/// automatically when a processor is brought online.
pub const MAX_THREADS: usize = 64;

/// The number of distinct thread priority levels. Priority 0 is the most
/// urgent and `PRIORITY_COUNT - 1` the least. The two-level ready bitmap
/// requires this to be exactly 256 (a 16-bit major word selecting one of
/// sixteen 16-bit minor words), which is also the conventional priority
/// range of the classic real-time API this core descends from.
pub const PRIORITY_COUNT: usize = 256;

/// The priority reserved for the per-processor idle threads. Idle threads
/// always exist, never block and must never win against any real thread,
/// so they live on the least urgent level.
pub const IDLE_PRIORITY: u8 = (PRIORITY_COUNT - 1) as u8;

/// The capacity of each watchdog pending header. A thread arms at most one
/// timeout entry at a time, but standalone timers (period objects, alarms)
/// share the same headers, so the capacity is given some headroom beyond
/// the thread count.
pub const WATCHDOG_SLOTS: usize = MAX_THREADS + 16;

/// The maximum number of scheduler instances that can be installed. Each
/// instance owns a disjoint subset of the processors. Most systems use one;
/// partitioned configurations use one per partition.
pub const MAX_SCHEDULERS: usize = 4;

/// The default CPU budget, in ticks, granted to a thread whose timeslice
/// policy replenishes on every context switch. Chosen to match the usual
/// 10 ms slice at a 2 ms tick; embedders with different tick lengths will
/// want to adjust this.
pub const DEFAULT_TIMESLICE: u32 = 5;

/// The maximum number of deferred post-switch actions a single thread can
/// have pending at once. Actions are one-shot and drained right after every
/// context switch onto the thread, so the list stays very short in
/// practice.
pub const MAX_POST_SWITCH_ACTIONS: usize = 4;

/// The maximum number of simultaneously active priority boosts per thread.
/// Each resource a thread holds can contribute at most one boost, and the
/// core is not in the business of tracking unbounded resource chains.
pub const MAX_PRIORITY_BOOSTS: usize = 8;
