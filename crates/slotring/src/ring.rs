use crate::invariants::{
    debug_assert_bounded_occupancy, debug_assert_monotonic, debug_assert_published_occupied,
    debug_assert_tail_not_past_head, debug_assert_unpublished_reclaimed,
};
use crate::{Slot, SlotRange};
use crossbeam_utils::{Backoff, CachePadded};
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};

// =============================================================================
// MEMORY ORDERING & SYNCHRONIZATION STRATEGY
// =============================================================================
//
// Many producers, one reader. `head` (next write position) and `tail` (next
// read position) are unbounded u64 sequence numbers; the physical slot of a
// sequence is `sequence % capacity`. Occupancy is `head - tail`.
//
// ## Producer (add)
//
// 1. Load `tail` (Acquire), then `head` (Acquire). Loading tail first means a
//    stale tail can only overestimate occupancy, never underflow.
// 2. If `head - tail >= capacity`, fail and hand the item back.
// 3. Place the item with `swap_if_empty` on slot `head % capacity`. A filled
//    slot means another producer is mid-claim there: back off and retry.
// 4. Publish with CAS `head -> head + 1` (AcqRel). The Release half orders
//    the slot write before the new head.
// 5. If the CAS loses, the slot was filled for a sequence nobody will read
//    (the reader only visits `[tail, head)`), so take the item back and retry.
//
// ## Reader (consume / clear)
//
// 1. Load `tail` and `head` (Acquire). Slots in `[tail, head)` are occupied.
// 2. Hand the range to the callback, which empties every slot exactly once.
// 3. Store `tail + n` (Release): producers that observe the new tail also
//    observe the emptied slots.
//
// The ring never touches a slot again after the callback has emptied it. A
// producer holding a stale head may already have placed an unpublished item
// there (step 3 of `add`); only that producer may take it back.
//
// ## Single-Reader Discipline
//
// `consume`, `drain_into`, `clear` and `scrub_unpublished` must not run
// concurrently with one another. The ring does not enforce this; the owner
// serializes readers (the batch processor holds its scheduling lock).
//
// =============================================================================

/// Bounded multi-producer ring of atomically owned slots.
///
/// - `add` is safe from any number of threads and never blocks on I/O
/// - a single reader removes items in bulk with `consume`
/// - head/tail counters live on separate cache lines
pub struct RingBuffer<T> {
    /// Next write sequence (advanced by producers)
    head: CachePadded<AtomicU64>,
    /// Next read sequence (advanced by the reader)
    tail: CachePadded<AtomicU64>,
    /// Fixed-size slot array, allocated once at construction.
    slots: Box<[Slot<T>]>,
}

impl<T> RingBuffer<T> {
    /// Creates a ring with `capacity` empty slots.
    pub fn new(capacity: NonZeroUsize) -> Self {
        let slots = (0..capacity.get())
            .map(|_| Slot::new())
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            head: CachePadded::new(AtomicU64::new(0)),
            tail: CachePadded::new(AtomicU64::new(0)),
            slots,
        }
    }

    // ---------------------------------------------------------------------
    // STATUS
    // ---------------------------------------------------------------------

    /// Returns the fixed capacity.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    fn index(&self, sequence: u64) -> usize {
        (sequence % self.slots.len() as u64) as usize
    }

    /// Returns a momentary, possibly stale, count of queued items.
    ///
    /// Suitable for heuristics only.
    #[inline]
    pub fn len(&self) -> usize {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        head.saturating_sub(tail) as usize
    }

    /// Returns `true` if no items are queued. Same staleness caveat as `len`.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` if `add` would currently refuse an item.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity()
    }

    // ---------------------------------------------------------------------
    // PRODUCER API
    // ---------------------------------------------------------------------

    /// Enqueues `item`, or returns it untouched if the ring is full.
    ///
    /// Lock-free: a retry only happens when another producer made progress
    /// or is in the middle of its own claim.
    ///
    /// # Example
    /// ```
    /// use slotring::RingBuffer;
    /// use std::num::NonZeroUsize;
    ///
    /// let ring = RingBuffer::new(NonZeroUsize::new(1).unwrap());
    /// assert!(ring.add("first").is_ok());
    /// assert_eq!(ring.add("second"), Err("second"));
    /// ```
    pub fn add(&self, item: T) -> Result<(), T> {
        let capacity = self.capacity() as u64;
        let backoff = Backoff::new();

        if self.is_full() {
            return Err(item);
        }
        let mut item = Box::new(item);

        loop {
            let tail = self.tail.load(Ordering::Acquire);
            let head = self.head.load(Ordering::Acquire);

            if head.wrapping_sub(tail) >= capacity {
                return Err(*item);
            }

            let slot = &self.slots[self.index(head)];
            if let Err(rejected) = slot.swap_if_empty(item) {
                // Another producer holds this position but has not published.
                item = rejected;
                backoff.snooze();
                continue;
            }

            match self
                .head
                .compare_exchange(head, head + 1, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    // INV-OCC-01: Bounded Occupancy
                    debug_assert_bounded_occupancy!((head + 1).wrapping_sub(tail), capacity);
                    return Ok(());
                }
                Err(_) => {
                    // Lost the publish race. Sequence `head` was already
                    // published by someone else, so this slot now sits outside
                    // the readable window and only this thread can empty it.
                    let reclaimed = slot.take();
                    // INV-OWN-01: Unpublished Slots Belong To Their Producer
                    debug_assert_unpublished_reclaimed!(reclaimed.is_some(), head);
                    match reclaimed {
                        Some(reclaimed) => item = reclaimed,
                        // The item has left this thread; there is nothing
                        // to hand back or to retry with.
                        None => return Ok(()),
                    }
                    backoff.spin();
                }
            }
        }
    }

    // ---------------------------------------------------------------------
    // READER API
    // ---------------------------------------------------------------------

    /// Removes up to `max_count` items in one batch.
    ///
    /// `callback` runs exactly once with the claimed range, possibly empty.
    /// It must empty every slot in the range exactly once, with
    /// [`Slot::take`] for items it keeps and [`Slot::reset`] for items it
    /// discards, and must not touch a slot again after emptying it. The ring
    /// does not empty slots on its own: a slot left occupied blocks the
    /// producer that next wraps onto it.
    ///
    /// Returns the number of slots consumed. Single reader only.
    pub fn consume<F>(&self, max_count: usize, callback: F) -> usize
    where
        F: FnOnce(SlotRange<'_, T>),
    {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);

        let available = head.wrapping_sub(tail);
        let n = available.min(max_count as u64) as usize;

        let start = self.index(tail);
        let first_len = n.min(self.capacity() - start);
        let first = &self.slots[start..start + first_len];
        let second = &self.slots[..n - first_len];
        let range = SlotRange::new(first, second);

        callback(range);

        let new_tail = tail + n as u64;

        // INV-OCC-01 / INV-SEQ-01
        debug_assert_tail_not_past_head!(new_tail, head);
        debug_assert_monotonic!("tail", tail, new_tail);

        self.tail.store(new_tail, Ordering::Release);
        n
    }

    /// Moves up to `max_count` items into `out`, preserving ring order.
    ///
    /// Returns the number of slots consumed.
    pub fn drain_into(&self, max_count: usize, out: &mut Vec<T>) -> usize {
        self.consume(max_count, |range| {
            out.reserve(range.len());
            for (position, slot) in range.iter().enumerate() {
                let taken = slot.take();
                // INV-PUB-01: Published Slots Are Occupied
                debug_assert_published_occupied!(taken.is_some(), position);
                if let Some(item) = taken {
                    out.push(*item);
                }
            }
        })
    }

    /// Discards everything queued without handing it to anyone.
    ///
    /// Returns the number of slots discarded. Single reader only.
    pub fn clear(&self) -> usize {
        self.consume(usize::MAX, |range| {
            for slot in range.iter() {
                slot.reset();
            }
        })
    }

    /// Empties slots outside the readable window that a producer filled but
    /// never published.
    ///
    /// Such slots only exist when a producer stopped between placing its item
    /// and publishing it, which happens to threads that do not survive a
    /// `fork()`. Call this only when no producer can be inside [`add`], for
    /// example in a freshly forked child before any other thread starts.
    ///
    /// Returns the number of orphaned items dropped.
    ///
    /// [`add`]: RingBuffer::add
    pub fn scrub_unpublished(&self) -> usize {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        let window_end = tail + self.capacity() as u64;

        (head..window_end)
            .filter(|&sequence| self.slots[self.index(sequence)].take().is_some())
            .count()
    }
}

impl<T> fmt::Debug for RingBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity())
            .field("head", &self.head.load(Ordering::Relaxed))
            .field("tail", &self.tail.load(Ordering::Relaxed))
            .finish()
    }
}
