//! The global multiprocessor earliest-deadline-first scheduler.
//!
//! One ready structure is shared by every processor of the instance.
//! Nodes are ordered by `(deadline, priority, generation)`: an
//! established deadline always outranks the absence of one, earlier
//! deadlines outrank later ones, and ties fall back to priority and
//! then to arrival order via a generation counter. The instance keeps
//! two sets: the *scheduled* set, exactly one node per owned processor,
//! and the *ready* set holding every other ready node. Reconciliation
//! moves nodes between the two so that the scheduled set is always the
//! best `N` ready nodes — a processor whose assignment is overtaken
//! donates its processor to the better node and its old assignment
//! parks in the ready set.
//!
//! The per-processor idle threads participate as permanent nodes with
//! the worst possible key, so the scheduled set never runs dry and
//! "select idle" needs no special case.

use crate::kernel::Kernel;
use crate::priority::Priority;
use crate::sched::SchedulerOps;
use crate::thread::ThreadId;
use core::sync::atomic::Ordering;
use heapless::Vec;
use spin::Mutex;

/// Per-thread bookkeeping on this instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeState {
    Detached,
    Blocked,
    Ready,
    Scheduled,
}

#[derive(Debug, Clone, Copy)]
struct Node {
    state: NodeState,

    /// The absolute deadline of the thread's current job, if one has
    /// been released. Threads without a deadline order behind every
    /// deadline-bearing thread.
    deadline: Option<u64>,

    priority: u8,

    /// Arrival-order tie break. Fresh enqueues take increasing values,
    /// so equal `(deadline, priority)` keys schedule first-come,
    /// first-served; a yield takes a fresh value to step behind its
    /// peers, and a displaced node keeps its old one to step back in
    /// front of later arrivals.
    generation: i64,

    /// The processor this node is allocated to while `Scheduled`.
    cpu: usize,
}

const FREE_NODE: Node = Node {
    state: NodeState::Detached,
    deadline: None,
    priority: 0,
    generation: 0,
    cpu: 0,
};

/// The ordering key of a node. `deadline == None` maps to the maximum
/// value, which also means an idle thread (no deadline, idle priority)
/// can never outrank a real thread.
type Key = (u64, u8, i64);

fn key_of(nodes: &[Node; config::MAX_THREADS], thread: ThreadId) -> Key {
    let node = &nodes[thread.index()];
    (
        node.deadline.unwrap_or(u64::MAX),
        node.priority,
        node.generation,
    )
}

/// Inserts into a sorted set, keeping best-first order. Equal keys
/// cannot occur: the generation disambiguates.
fn insert_sorted<const N: usize>(
    set: &mut Vec<ThreadId, N>,
    nodes: &[Node; config::MAX_THREADS],
    thread: ThreadId,
) {
    let key = key_of(nodes, thread);
    let position = set
        .iter()
        .position(|&other| key < key_of(nodes, other))
        .unwrap_or(set.len());
    if set.insert(position, thread).is_err() {
        crate::fatal::terminate(crate::fatal::Source::Scheduler, thread.index() as u32);
    }
}

#[derive(Debug)]
struct Inner {
    /// Processors owned by this instance.
    cpus: Vec<usize, { config::MAX_PROCESSORS }>,

    /// Scheduled nodes, sorted best-first; exactly one per owned
    /// processor.
    scheduled: Vec<ThreadId, { config::MAX_PROCESSORS }>,

    /// Ready but unassigned nodes, sorted best-first.
    ready: Vec<ThreadId, { config::MAX_THREADS }>,

    nodes: [Node; config::MAX_THREADS],

    /// Source of fresh generation values.
    generation: i64,
}

impl Inner {
    const fn new() -> Self {
        Self {
            cpus: Vec::new(),
            scheduled: Vec::new(),
            ready: Vec::new(),
            nodes: [FREE_NODE; config::MAX_THREADS],
            generation: 0,
        }
    }

    fn key(&self, thread: ThreadId) -> Key {
        key_of(&self.nodes, thread)
    }

    fn fresh_generation(&mut self) -> i64 {
        let generation = self.generation;
        self.generation += 1;
        generation
    }

    /// Allocates a processor to a node and makes it the processor's
    /// heir.
    fn assign(&mut self, kernel: &Kernel, thread: ThreadId, cpu: usize) {
        {
            let node = &mut self.nodes[thread.index()];
            node.state = NodeState::Scheduled;
            node.cpu = cpu;
        }
        insert_sorted(&mut self.scheduled, &self.nodes, thread);
        kernel.thread(thread).cpu.store(cpu as u8, Ordering::Release);
        kernel.update_heir(cpu, thread);
    }

    /// The first owned processor with no scheduled node.
    fn free_cpu(&self) -> Option<usize> {
        self.cpus.iter().copied().find(|&cpu| {
            !self
                .scheduled
                .iter()
                .any(|&t| self.nodes[t.index()].cpu == cpu)
        })
    }

    /// Moves nodes between the ready and scheduled sets until the
    /// scheduled set is the best `cpus.len()` nodes. This is the only
    /// place assignments change, so it can never leave two processors
    /// with the same thread, nor an idle processor beside an unassigned
    /// ready thread.
    fn reconcile(&mut self, kernel: &Kernel) {
        // First fill processors that have nothing at all.
        while self.scheduled.len() < self.cpus.len() && !self.ready.is_empty() {
            let Some(cpu) = self.free_cpu() else {
                break;
            };
            let next = self.ready.remove(0);
            self.assign(kernel, next, cpu);
        }

        // Then let better ready nodes preempt worse scheduled ones.
        loop {
            let Some(&best_ready) = self.ready.first() else {
                return;
            };
            let Some(&worst_scheduled) = self.scheduled.last() else {
                return;
            };
            if self.key(best_ready) >= self.key(worst_scheduled) {
                return;
            }

            self.ready.remove(0);
            self.scheduled.pop();
            let cpu = self.nodes[worst_scheduled.index()].cpu;
            self.nodes[worst_scheduled.index()].state = NodeState::Ready;
            insert_sorted(&mut self.ready, &self.nodes, worst_scheduled);

            log::trace!(
                "edf: thread {} preempts thread {} on cpu {cpu}",
                best_ready.index(),
                worst_scheduled.index()
            );
            self.assign(kernel, best_ready, cpu);
        }
    }

    /// Takes a node out of whichever set holds it. Returns the freed
    /// processor if it was scheduled.
    fn extract(&mut self, thread: ThreadId) -> Option<usize> {
        match self.nodes[thread.index()].state {
            NodeState::Scheduled => {
                if let Some(position) = self.scheduled.iter().position(|&t| t == thread) {
                    self.scheduled.remove(position);
                }
                Some(self.nodes[thread.index()].cpu)
            }
            NodeState::Ready => {
                if let Some(position) = self.ready.iter().position(|&t| t == thread) {
                    self.ready.remove(position);
                }
                None
            }
            NodeState::Blocked | NodeState::Detached => None,
        }
    }

    /// Makes a node ready with a fresh generation and reconciles.
    fn enqueue(&mut self, kernel: &Kernel, thread: ThreadId) {
        self.nodes[thread.index()].generation = self.fresh_generation();
        self.nodes[thread.index()].state = NodeState::Ready;
        insert_sorted(&mut self.ready, &self.nodes, thread);
        self.reconcile(kernel);
    }

    /// Re-keys a node that may currently be ready or scheduled. The
    /// node re-enters through the ready set and reconciliation decides
    /// where it lands; its generation is preserved so a pure re-key
    /// does not lose its place among equals.
    fn requeue(&mut self, kernel: &Kernel, thread: ThreadId) {
        let state = self.nodes[thread.index()].state;
        if state != NodeState::Ready && state != NodeState::Scheduled {
            return;
        }
        self.extract(thread);
        self.nodes[thread.index()].state = NodeState::Ready;
        insert_sorted(&mut self.ready, &self.nodes, thread);
        self.reconcile(kernel);
    }
}

/// A scheduler instance implementing global EDF over a processor group.
#[derive(Debug)]
pub struct EdfSmpScheduler {
    inner: Mutex<Inner>,
}

impl EdfSmpScheduler {
    #[must_use]
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::new()),
        }
    }
}

impl SchedulerOps for EdfSmpScheduler {
    fn node_initialize(&self, _kernel: &Kernel, thread: ThreadId, priority: Priority) {
        let mut inner = self.inner.lock();
        inner.nodes[thread.index()] = Node {
            state: NodeState::Blocked,
            deadline: None,
            priority: priority.level(),
            generation: 0,
            cpu: 0,
        };
    }

    fn node_destroy(&self, _kernel: &Kernel, thread: ThreadId) {
        let mut inner = self.inner.lock();
        debug_assert!(matches!(
            inner.nodes[thread.index()].state,
            NodeState::Blocked | NodeState::Detached
        ));
        inner.nodes[thread.index()] = FREE_NODE;
    }

    fn block(&self, kernel: &Kernel, thread: ThreadId) {
        let mut inner = self.inner.lock();
        let freed = inner.extract(thread);
        inner.nodes[thread.index()].state = NodeState::Blocked;
        if freed.is_some() {
            inner.reconcile(kernel);
        }
    }

    fn unblock(&self, kernel: &Kernel, thread: ThreadId) {
        let mut inner = self.inner.lock();
        if inner.nodes[thread.index()].state != NodeState::Blocked {
            return;
        }
        inner.nodes[thread.index()].priority = kernel.effective_priority(thread).level();
        inner.enqueue(kernel, thread);
    }

    fn update_priority(&self, kernel: &Kernel, thread: ThreadId, priority: Priority) {
        let mut inner = self.inner.lock();
        inner.nodes[thread.index()].priority = priority.level();
        inner.requeue(kernel, thread);
    }

    fn yield_now(&self, kernel: &Kernel, thread: ThreadId) {
        let mut inner = self.inner.lock();
        let state = inner.nodes[thread.index()].state;
        if state != NodeState::Ready && state != NodeState::Scheduled {
            return;
        }
        inner.extract(thread);
        inner.enqueue(kernel, thread);
    }

    fn ask_for_help(&self, kernel: &Kernel, thread: ThreadId) -> bool {
        let mut inner = self.inner.lock();
        match inner.nodes[thread.index()].state {
            NodeState::Scheduled => true,
            NodeState::Ready => {
                // The ready set is authoritative, so helping is just a
                // reconciliation pass; it succeeds if the node came out
                // of it scheduled.
                inner.reconcile(kernel);
                inner.nodes[thread.index()].state == NodeState::Scheduled
            }
            NodeState::Blocked | NodeState::Detached => false,
        }
    }

    fn reconsider_help_request(&self, kernel: &Kernel, thread: ThreadId) {
        let mut inner = self.inner.lock();
        if inner.nodes[thread.index()].state == NodeState::Ready {
            inner.reconcile(kernel);
        }
    }

    fn withdraw_node(&self, kernel: &Kernel, thread: ThreadId) {
        let mut inner = self.inner.lock();
        let freed = inner.extract(thread);
        inner.nodes[thread.index()].state = NodeState::Blocked;
        if freed.is_some() {
            inner.reconcile(kernel);
        }
    }

    fn add_processor(&self, kernel: &Kernel, cpu: usize) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if inner.cpus.push(cpu).is_err() {
            crate::fatal::terminate(crate::fatal::Source::Scheduler, cpu as u32);
        }
        let Some(idle) = kernel.percpu(cpu).idle_thread() else {
            crate::fatal::terminate(crate::fatal::Source::Scheduler, cpu as u32);
        };
        inner.nodes[idle.index()] = Node {
            state: NodeState::Ready,
            deadline: None,
            priority: Priority::IDLE.level(),
            generation: i64::MAX - cpu as i64,
            cpu,
        };
        insert_sorted(&mut inner.ready, &inner.nodes, idle);
        inner.reconcile(kernel);
    }

    fn remove_processor(&self, kernel: &Kernel, cpu: usize) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let Some(position) = inner.cpus.iter().position(|&c| c == cpu) else {
            return;
        };
        inner.cpus.remove(position);

        // Whatever ran here loses its processor; the idle thread leaves
        // with it, a real thread goes back to the ready set and may
        // preempt elsewhere.
        let allocated = inner
            .scheduled
            .iter()
            .copied()
            .find(|&t| inner.nodes[t.index()].cpu == cpu);
        if let Some(thread) = allocated {
            inner.extract(thread);
            if kernel.thread(thread).is_idle() {
                inner.nodes[thread.index()].state = NodeState::Detached;
            } else {
                inner.nodes[thread.index()].state = NodeState::Ready;
                insert_sorted(&mut inner.ready, &inner.nodes, thread);
            }
        }

        // The departing processor's idle thread may still sit in the
        // ready set if a real thread was scheduled on the processor.
        if let Some(idle) = kernel.percpu(cpu).idle_thread()
            && inner.nodes[idle.index()].state == NodeState::Ready
        {
            inner.extract(idle);
            inner.nodes[idle.index()].state = NodeState::Detached;
        }

        inner.reconcile(kernel);
    }

    fn release_job(&self, kernel: &Kernel, thread: ThreadId, deadline: u64) {
        let mut inner = self.inner.lock();
        inner.nodes[thread.index()].deadline = Some(deadline);
        inner.requeue(kernel, thread);
    }

    fn cancel_job(&self, kernel: &Kernel, thread: ThreadId) {
        let mut inner = self.inner.lock();
        inner.nodes[thread.index()].deadline = None;
        inner.requeue(kernel, thread);
    }
}

#[cfg(test)]
mod tests {
    use super::{FREE_NODE, Inner, Node, NodeState, insert_sorted};
    use crate::thread::ThreadId;

    fn node(deadline: Option<u64>, priority: u8, generation: i64) -> Node {
        Node {
            state: NodeState::Ready,
            deadline,
            priority,
            generation,
            cpu: 0,
        }
    }

    #[test]
    fn deadline_order_beats_priority() {
        let mut nodes = [FREE_NODE; config::MAX_THREADS];
        nodes[1] = node(Some(200), 1, 0);
        nodes[2] = node(Some(100), 50, 1);
        nodes[3] = node(None, 0, 2);

        let mut set: heapless::Vec<ThreadId, { config::MAX_THREADS }> = heapless::Vec::new();
        for index in [1, 2, 3] {
            insert_sorted(&mut set, &nodes, ThreadId::new(index));
        }
        let order: std::vec::Vec<usize> = set.iter().map(|t| t.index()).collect();
        assert_eq!(order, [2, 1, 3]);
    }

    #[test]
    fn equal_deadlines_tie_break_by_priority_then_arrival() {
        let mut nodes = [FREE_NODE; config::MAX_THREADS];
        nodes[1] = node(Some(100), 10, 5);
        nodes[2] = node(Some(100), 5, 6);
        nodes[3] = node(Some(100), 10, 4);

        let mut set: heapless::Vec<ThreadId, { config::MAX_THREADS }> = heapless::Vec::new();
        for index in [1, 2, 3] {
            insert_sorted(&mut set, &nodes, ThreadId::new(index));
        }
        let order: std::vec::Vec<usize> = set.iter().map(|t| t.index()).collect();
        assert_eq!(order, [2, 3, 1]);
    }

    #[test]
    fn extract_reports_the_freed_processor() {
        let mut inner = Inner::new();
        inner.nodes[4] = Node {
            state: NodeState::Scheduled,
            deadline: Some(10),
            priority: 0,
            generation: 0,
            cpu: 2,
        };
        inner.scheduled.push(ThreadId::new(4)).unwrap();

        assert_eq!(inner.extract(ThreadId::new(4)), Some(2));
        assert!(inner.scheduled.is_empty());
        assert_eq!(inner.extract(ThreadId::new(4)), Some(2));
    }
}
