//! Slotring - Bounded Multi-Producer Ring of Owned Slots
//!
//! A fixed-capacity ring buffer where every cell is a [`Slot`] that owns at
//! most one boxed item. Any number of threads enqueue with [`RingBuffer::add`];
//! one reader at a time removes items in bulk with [`RingBuffer::consume`].
//!
//! # Key Features
//!
//! - Monotonic u64 head/tail counters (no ABA, no wrap in practice)
//! - Ownership transfer by atomic exchange, never by copy
//! - Backpressure by refusal: a full ring hands the item back
//! - Batch consumption with a single tail update per batch
//! - Cache-padded counters to avoid false sharing
//!
//! # Example
//!
//! ```
//! use slotring::RingBuffer;
//! use std::num::NonZeroUsize;
//!
//! let ring = RingBuffer::new(NonZeroUsize::new(4).unwrap());
//! ring.add(1u32).unwrap();
//! ring.add(2).unwrap();
//!
//! let mut batch = Vec::new();
//! ring.drain_into(16, &mut batch);
//! assert_eq!(batch, vec![1, 2]);
//! ```

mod invariants;
mod range;
mod ring;
mod slot;

pub use range::SlotRange;
pub use ring::RingBuffer;
pub use slot::Slot;
