//! Debug assertion macros for ring buffer invariants.
//!
//! Only active in debug builds (`#[cfg(debug_assertions)]`), so there is
//! zero overhead in release builds.

// =============================================================================
// INV-OCC-01: Bounded Occupancy
// =============================================================================

/// Assert that occupancy does not exceed capacity.
///
/// **Invariant**: `0 ≤ (head - tail) ≤ capacity`
///
/// Used in: `add()` after publishing a new head
macro_rules! debug_assert_bounded_occupancy {
    ($occupancy:expr, $capacity:expr) => {
        debug_assert!(
            $occupancy <= $capacity,
            "INV-OCC-01 violated: occupancy {} exceeds capacity {}",
            $occupancy,
            $capacity
        )
    };
}

/// Assert that the reader does not advance tail past head.
///
/// **Invariant**: `tail ≤ head` (after advance)
///
/// Used in: `consume()` and `clear()` before storing tail
macro_rules! debug_assert_tail_not_past_head {
    ($new_tail:expr, $head:expr) => {
        debug_assert!(
            $new_tail <= $head,
            "INV-OCC-01 violated: advancing tail {} beyond head {}",
            $new_tail,
            $head
        )
    };
}

// =============================================================================
// INV-SEQ-01: Monotonic Counters
// =============================================================================

/// Assert that a counter only increases.
///
/// Used in: `consume()` for tail
macro_rules! debug_assert_monotonic {
    ($name:literal, $old:expr, $new:expr) => {
        debug_assert!(
            $new >= $old,
            "INV-SEQ-01 violated: {} decreased from {} to {}",
            $name,
            $old,
            $new
        )
    };
}

// =============================================================================
// INV-PUB-01: Published Slots Are Occupied
// =============================================================================

/// Assert that a slot inside `[tail, head)` holds a value when the reader
/// takes it.
///
/// **Invariant**: producers fill a slot before publishing its sequence, so
/// the reader never finds a hole.
///
/// Used in: `drain_into()` while taking slots
macro_rules! debug_assert_published_occupied {
    ($taken:expr, $position:expr) => {
        debug_assert!(
            $taken,
            "INV-PUB-01 violated: published slot at offset {} was empty",
            $position
        )
    };
}

// =============================================================================
// INV-OWN-01: Unpublished Slots Belong To Their Producer
// =============================================================================

/// Assert that a producer which lost the publish race finds its own item
/// still in the slot.
///
/// **Invariant**: the reader empties each consumed slot once and never
/// revisits it, so nothing else can take an item placed outside
/// `[tail, head)`.
///
/// Used in: `add()` after a failed head CAS
macro_rules! debug_assert_unpublished_reclaimed {
    ($reclaimed:expr, $sequence:expr) => {
        debug_assert!(
            $reclaimed,
            "INV-OWN-01 violated: unpublished slot for sequence {} was emptied by another thread",
            $sequence
        )
    };
}

pub(crate) use debug_assert_bounded_occupancy;
pub(crate) use debug_assert_monotonic;
pub(crate) use debug_assert_published_occupied;
pub(crate) use debug_assert_tail_not_past_head;
pub(crate) use debug_assert_unpublished_reclaimed;
