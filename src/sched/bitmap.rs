//! The single-processor priority-bitmap scheduler.
//!
//! The ready set is a two-level bitmap — a 16-bit major word whose bits
//! flag non-zero 16-bit minor words — plus one FIFO chain per priority
//! level. A minor bit is set exactly when its chain is non-empty, and a
//! major bit exactly when its minor word is non-zero, so finding the
//! most urgent ready level is two trailing-zero scans: O(1) and
//! branch-predictable. Ties within a level are strict FIFO arrival
//! order. An empty ready set selects the processor's reserved idle
//! thread, which always exists and never blocks.

use crate::kernel::Kernel;
use crate::priority::Priority;
use crate::sched::SchedulerOps;
use crate::thread::ThreadId;
use heapless::Vec;
use spin::Mutex;

/// Number of minor words; also the width of each word in bits.
const WORDS: usize = 16;

/// Per-thread bookkeeping on this instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeState {
    /// No node on this instance.
    Detached,

    /// Node exists but the thread is not ready.
    Blocked,

    /// Linked into the chain of its priority level.
    Ready,
}

#[derive(Debug, Clone, Copy)]
struct Node {
    state: NodeState,
    priority: u8,
}

const FREE_NODE: Node = Node {
    state: NodeState::Detached,
    priority: 0,
};

type Chain = Vec<ThreadId, { config::MAX_THREADS }>;

#[derive(Debug)]
struct Inner {
    /// The processor this instance schedules, once donated.
    cpu: Option<usize>,

    /// Major word: bit `w` set iff `minor[w]` is non-zero.
    major: u16,

    /// Minor words: bit `b` of word `w` set iff chain `w * 16 + b` is
    /// non-empty.
    minor: [u16; WORDS],

    /// One FIFO chain per priority level.
    chains: [Chain; config::PRIORITY_COUNT],

    /// Per-thread node table.
    nodes: [Node; config::MAX_THREADS],
}

impl Inner {
    const fn new() -> Self {
        const EMPTY_CHAIN: Chain = Vec::new();
        Self {
            cpu: None,
            major: 0,
            minor: [0; WORDS],
            chains: [EMPTY_CHAIN; config::PRIORITY_COUNT],
            nodes: [FREE_NODE; config::MAX_THREADS],
        }
    }

    /// The most urgent non-empty priority level, by two bit scans.
    fn highest_ready(&self) -> Option<usize> {
        if self.major == 0 {
            return None;
        }
        let word = self.major.trailing_zeros() as usize;
        let bit = self.minor[word].trailing_zeros() as usize;
        Some(word * WORDS + bit)
    }

    fn set_bit(&mut self, level: usize) {
        self.minor[level / WORDS] |= 1 << (level % WORDS);
        self.major |= 1 << (level / WORDS);
    }

    fn clear_bit(&mut self, level: usize) {
        self.minor[level / WORDS] &= !(1 << (level % WORDS));
        if self.minor[level / WORDS] == 0 {
            self.major &= !(1 << (level / WORDS));
        }
    }

    /// Appends the thread to its level's chain, maintaining the bitmap
    /// invariant.
    fn ready_insert(&mut self, thread: ThreadId, level: usize) {
        if self.chains[level].push(thread).is_err() {
            crate::fatal::terminate(crate::fatal::Source::Scheduler, level as u32);
        }
        self.set_bit(level);
        self.nodes[thread.index()].state = NodeState::Ready;
    }

    /// Unlinks the thread from its level's chain.
    fn ready_remove(&mut self, thread: ThreadId, level: usize) {
        let chain = &mut self.chains[level];
        let Some(position) = chain.iter().position(|&t| t == thread) else {
            crate::fatal::terminate(crate::fatal::Source::Scheduler, level as u32);
        };
        chain.remove(position);
        if chain.is_empty() {
            self.clear_bit(level);
        }
    }

    /// Recomputes the processor's heir from the ready set.
    fn reschedule(&self, kernel: &Kernel) {
        let Some(cpu) = self.cpu else {
            return;
        };
        let heir = self
            .highest_ready()
            .and_then(|level| self.chains[level].first().copied())
            .or_else(|| kernel.percpu(cpu).idle_thread());
        if let Some(heir) = heir {
            kernel.update_heir(cpu, heir);
        }
    }
}

/// A priority-bitmap scheduler instance.
#[derive(Debug)]
pub struct BitmapScheduler {
    inner: Mutex<Inner>,
}

impl BitmapScheduler {
    #[must_use]
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::new()),
        }
    }
}

impl SchedulerOps for BitmapScheduler {
    fn node_initialize(&self, _kernel: &Kernel, thread: ThreadId, priority: Priority) {
        let mut inner = self.inner.lock();
        inner.nodes[thread.index()] = Node {
            state: NodeState::Blocked,
            priority: priority.level(),
        };
    }

    fn node_destroy(&self, _kernel: &Kernel, thread: ThreadId) {
        let mut inner = self.inner.lock();
        debug_assert_ne!(inner.nodes[thread.index()].state, NodeState::Ready);
        inner.nodes[thread.index()] = FREE_NODE;
    }

    fn block(&self, kernel: &Kernel, thread: ThreadId) {
        let mut inner = self.inner.lock();
        let node = inner.nodes[thread.index()];
        if node.state != NodeState::Ready {
            return;
        }
        inner.ready_remove(thread, node.priority as usize);
        inner.nodes[thread.index()].state = NodeState::Blocked;
        inner.reschedule(kernel);
    }

    fn unblock(&self, kernel: &Kernel, thread: ThreadId) {
        let mut inner = self.inner.lock();
        let node = inner.nodes[thread.index()];
        if node.state == NodeState::Ready {
            return;
        }
        let level = kernel.effective_priority(thread).level() as usize;
        inner.nodes[thread.index()].priority = level as u8;
        inner.ready_insert(thread, level);
        if let Some(cpu) = inner.cpu {
            kernel.thread(thread).cpu.store(
                cpu as u8,
                core::sync::atomic::Ordering::Release,
            );
        }
        inner.reschedule(kernel);
    }

    fn update_priority(&self, kernel: &Kernel, thread: ThreadId, priority: Priority) {
        let mut inner = self.inner.lock();
        let node = inner.nodes[thread.index()];
        if node.priority == priority.level() {
            return;
        }
        if node.state == NodeState::Ready {
            inner.ready_remove(thread, node.priority as usize);
            inner.nodes[thread.index()].priority = priority.level();
            inner.ready_insert(thread, priority.level() as usize);
            inner.reschedule(kernel);
        } else {
            inner.nodes[thread.index()].priority = priority.level();
        }
    }

    fn yield_now(&self, kernel: &Kernel, thread: ThreadId) {
        let mut inner = self.inner.lock();
        let node = inner.nodes[thread.index()];
        if node.state != NodeState::Ready {
            return;
        }
        let level = node.priority as usize;
        inner.ready_remove(thread, level);
        inner.ready_insert(thread, level);
        inner.reschedule(kernel);
    }

    fn ask_for_help(&self, _kernel: &Kernel, _thread: ThreadId) -> bool {
        // A single-processor instance has nobody to ask.
        false
    }

    fn reconsider_help_request(&self, _kernel: &Kernel, _thread: ThreadId) {}

    fn withdraw_node(&self, kernel: &Kernel, thread: ThreadId) {
        self.block(kernel, thread);
    }

    fn add_processor(&self, kernel: &Kernel, cpu: usize) {
        let mut inner = self.inner.lock();
        debug_assert!(inner.cpu.is_none());
        inner.cpu = Some(cpu);
        inner.reschedule(kernel);
    }

    fn remove_processor(&self, _kernel: &Kernel, cpu: usize) {
        let mut inner = self.inner.lock();
        debug_assert_eq!(inner.cpu, Some(cpu));
        inner.cpu = None;
    }

    fn release_job(&self, _kernel: &Kernel, thread: ThreadId, _deadline: u64) {
        log::debug!(
            "bitmap scheduler ignores job release for thread {}",
            thread.index()
        );
    }

    fn cancel_job(&self, _kernel: &Kernel, _thread: ThreadId) {}
}

#[cfg(test)]
mod tests {
    use super::{Inner, NodeState};
    use crate::thread::ThreadId;

    #[test]
    fn bitmap_invariant_tracks_chains() {
        let mut inner = Inner::new();
        assert_eq!(inner.highest_ready(), None);

        inner.ready_insert(ThreadId::new(1), 37);
        inner.ready_insert(ThreadId::new(2), 200);
        assert_eq!(inner.highest_ready(), Some(37));

        inner.ready_remove(ThreadId::new(1), 37);
        assert_eq!(inner.highest_ready(), Some(200));
        assert_eq!(inner.minor[37 / 16] & (1 << (37 % 16)), 0);

        inner.ready_remove(ThreadId::new(2), 200);
        assert_eq!(inner.highest_ready(), None);
        assert_eq!(inner.major, 0);
    }

    #[test]
    fn equal_priority_is_fifo() {
        let mut inner = Inner::new();
        inner.ready_insert(ThreadId::new(5), 10);
        inner.ready_insert(ThreadId::new(6), 10);
        inner.ready_insert(ThreadId::new(7), 10);

        assert_eq!(inner.chains[10].first(), Some(&ThreadId::new(5)));

        // A yield moves the head behind its peers.
        inner.ready_remove(ThreadId::new(5), 10);
        inner.ready_insert(ThreadId::new(5), 10);
        let order: std::vec::Vec<usize> = inner.chains[10].iter().map(|t| t.index()).collect();
        assert_eq!(order, [6, 7, 5]);
    }

    #[test]
    fn lower_level_always_wins() {
        let mut inner = Inner::new();
        for (thread, level) in [(1, 255), (2, 16), (3, 15), (4, 17)] {
            inner.ready_insert(ThreadId::new(thread), level);
        }
        assert_eq!(inner.highest_ready(), Some(15));
        inner.ready_remove(ThreadId::new(3), 15);
        assert_eq!(inner.highest_ready(), Some(16));
        assert_eq!(
            inner.nodes[ThreadId::new(1).index()].state,
            NodeState::Ready
        );
    }
}
