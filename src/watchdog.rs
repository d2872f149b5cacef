//! The per-processor timeout service.
//!
//! Every processor owns three independent pending headers: one driven by
//! the tick counter (relative delays, CPU-budget accounting) and one for
//! each timestamp clock (monotonic and real-time). An armed entry names an
//! absolute expiration on its header's clock and a routine to invoke when
//! that point is reached. Entries are strictly ordered within a header by
//! `(expiration, arming sequence)`, so two entries armed for the same
//! instant fire in arming order.
//!
//! Routines are invoked with the header lock *released*: the tick path
//! first removes every due entry under the lock, then fires them. A
//! routine may therefore take queue locks or re-arm entries, but it must
//! stay short and must never block — it runs on the timer interrupt path.

use crate::kernel::Kernel;
use crate::status::Status;
use heapless::Vec;

/// The routine invoked when an entry expires. The `usize` argument is
/// whatever the arming site stashed there, typically a thread identifier
/// or an index into an embedder-owned table.
pub type Routine = fn(&Kernel, usize);

/// Which of a processor's three pending headers an entry lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Clock {
    /// The tick-counter header. Expirations are absolute tick counts.
    Ticks,

    /// The monotonic timestamp header. Expirations are nanoseconds.
    Monotonic,

    /// The real-time timestamp header. Expirations are nanoseconds on a
    /// clock that can jump when the real-time clock is set.
    Realtime,
}

/// A handle to a pending entry, returned by insertion and consumed by
/// cancellation. Tickets are plain values; a stale ticket (the entry has
/// already fired or been canceled) is detected and reported, never
/// dereferenced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket {
    pub(crate) cpu: usize,
    pub(crate) clock: Clock,
    pub(crate) seq: u32,
}

/// One pending timeout.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Entry {
    pub expires: u64,
    pub seq: u32,
    pub routine: Routine,
    pub arg: usize,
}

/// The set of entries fired by one tick, collected under the header lock
/// and invoked after it is released.
pub(crate) type Fired = Vec<Entry, { config::WATCHDOG_SLOTS }>;

/// A sorted pending-entry header. The vector is kept ordered ascending by
/// `(expires, seq)`; the front entry is always the next to fire.
#[derive(Debug)]
pub struct Header {
    pending: Vec<Entry, { config::WATCHDOG_SLOTS }>,
    next_seq: u32,
}

impl Header {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            pending: Vec::new(),
            next_seq: 0,
        }
    }

    /// Inserts an entry expiring at the given absolute value.
    ///
    /// # Errors
    /// Returns [`Status::TooMany`] if the header is full. The caller
    /// guarantees the entry is not already pending — re-arming requires
    /// cancellation or firing first — so a duplicate sequence cannot
    /// occur.
    pub fn insert(&mut self, expires: u64, routine: Routine, arg: usize) -> Result<u32, Status> {
        let seq = self.next_seq;
        let entry = Entry {
            expires,
            seq,
            routine,
            arg,
        };

        // Entries with the same expiration keep arming order: the new
        // entry goes behind every entry that does not expire later.
        let position = self
            .pending
            .iter()
            .position(|pending| pending.expires > expires)
            .unwrap_or(self.pending.len());

        if self.pending.insert(position, entry).is_err() {
            return Err(Status::TooMany);
        }
        self.next_seq = self.next_seq.wrapping_add(1);
        Ok(seq)
    }

    /// Cancels the entry with the given sequence number, returning the
    /// time remaining until it would have fired (zero if it was already
    /// due). Returns `None` if no such entry is pending: it already
    /// fired, or was canceled before. Firing is terminal — a fired entry
    /// can only come back through a fresh insertion.
    pub fn cancel(&mut self, seq: u32, now: u64) -> Option<u64> {
        let position = self.pending.iter().position(|entry| entry.seq == seq)?;
        let entry = self.pending.remove(position);
        Some(entry.expires.saturating_sub(now))
    }

    /// Removes every entry with `expires <= now` into `fired`, preserving
    /// their firing order. The caller invokes the routines after
    /// releasing the header lock.
    pub(crate) fn take_due(&mut self, now: u64, fired: &mut Fired) {
        while let Some(front) = self.pending.first() {
            if front.expires > now {
                break;
            }
            let entry = self.pending.remove(0);
            // Capacity cannot overflow: `fired` is as large as the header.
            let _ = fired.push(entry);
        }
    }

    /// The expiration of the next entry to fire, if any. Embedders use
    /// this to program one-shot hardware timers.
    #[must_use]
    pub fn next_expiration(&self) -> Option<u64> {
        self.pending.first().map(|entry| entry.expires)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }
}

impl Default for Header {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::{Fired, Header, Routine};
    use crate::kernel::Kernel;

    fn nop(_: &Kernel, _: usize) {}
    const NOP: Routine = nop;

    #[test]
    fn fires_in_expiration_order() {
        let mut header = Header::new();
        header.insert(30, NOP, 3).unwrap();
        header.insert(10, NOP, 1).unwrap();
        header.insert(20, NOP, 2).unwrap();

        let mut fired = Fired::new();
        header.take_due(u64::MAX, &mut fired);
        let args: std::vec::Vec<usize> = fired.iter().map(|e| e.arg).collect();
        assert_eq!(args, [1, 2, 3]);
    }

    #[test]
    fn equal_expirations_fire_in_arming_order() {
        let mut header = Header::new();
        header.insert(5, NOP, 1).unwrap();
        header.insert(5, NOP, 2).unwrap();
        header.insert(5, NOP, 3).unwrap();

        let mut fired = Fired::new();
        header.take_due(5, &mut fired);
        let args: std::vec::Vec<usize> = fired.iter().map(|e| e.arg).collect();
        assert_eq!(args, [1, 2, 3]);
    }

    #[test]
    fn take_due_leaves_later_entries_pending() {
        let mut header = Header::new();
        header.insert(10, NOP, 1).unwrap();
        header.insert(20, NOP, 2).unwrap();

        let mut fired = Fired::new();
        header.take_due(15, &mut fired);
        assert_eq!(fired.len(), 1);
        assert_eq!(header.len(), 1);
        assert_eq!(header.next_expiration(), Some(20));
    }

    #[test]
    fn cancel_round_trip_preserves_the_rest() {
        let mut header = Header::new();
        header.insert(10, NOP, 1).unwrap();
        let seq = header.insert(20, NOP, 2).unwrap();
        header.insert(30, NOP, 3).unwrap();

        assert_eq!(header.cancel(seq, 5), Some(15));

        let mut fired = Fired::new();
        header.take_due(u64::MAX, &mut fired);
        let remaining: std::vec::Vec<(u64, usize)> =
            fired.iter().map(|e| (e.expires, e.arg)).collect();
        assert_eq!(remaining, [(10, 1), (30, 3)]);
    }

    #[test]
    fn cancel_after_firing_reports_nothing_pending() {
        let mut header = Header::new();
        let seq = header.insert(10, NOP, 1).unwrap();

        let mut fired = Fired::new();
        header.take_due(10, &mut fired);
        assert_eq!(header.cancel(seq, 10), None);
    }

    #[test]
    fn insertion_fails_cleanly_when_full() {
        let mut header = Header::new();
        for i in 0..config::WATCHDOG_SLOTS {
            header.insert(i as u64, NOP, i).unwrap();
        }
        assert!(header.insert(0, NOP, 99).is_err());
    }
}
