//! Debug assertion macros for the ring protocol invariants.
//!
//! Active only in debug builds, so the release hot paths carry no checks.
//! The counters live in shared memory, so a violation here can also mean
//! another process scribbled on the region — either way it is worth a
//! loud stop during development.

/// Assert that the pending count never exceeds capacity.
///
/// **Invariant**: `0 ≤ (head - tail) ≤ capacity`
///
/// Used in: `push()` / `commit()` after computing the new head.
macro_rules! debug_assert_bounded_count {
    ($count:expr, $capacity:expr) => {
        debug_assert!(
            $count <= $capacity,
            "pending count {} exceeds capacity {}",
            $count,
            $capacity
        )
    };
}

/// Assert that a cursor only moves forward.
///
/// **Invariant**: `new ≥ old` for head and every tail
///
/// Used in: `push()`, `pop()`, `Consumer::release()`.
macro_rules! debug_assert_monotonic {
    ($name:literal, $old:expr, $new:expr) => {
        debug_assert!(
            $new >= $old,
            "{} decreased from {} to {}",
            $name,
            $old,
            $new
        )
    };
}

/// Assert that a reader never advances past the producer.
///
/// **Invariant**: `tail ≤ head` for the global tail and every group tail
///
/// Used in: `pop()` / `release()` before storing the new tail.
macro_rules! debug_assert_reader_behind_head {
    ($new_tail:expr, $head:expr) => {
        debug_assert!(
            $new_tail <= $head,
            "reader cursor {} advanced past head {}",
            $new_tail,
            $head
        )
    };
}

/// Assert that a published slot header fits its slot.
///
/// **Invariant**: `header.length ≤ slot_size - 8`
///
/// Used in: `pop()` / `peek()` after reading the header.
macro_rules! debug_assert_payload_fits {
    ($len:expr, $max:expr) => {
        debug_assert!(
            $len <= $max,
            "slot header claims {} payload bytes, slot holds {}",
            $len,
            $max
        )
    };
}

pub(crate) use debug_assert_bounded_count;
pub(crate) use debug_assert_monotonic;
pub(crate) use debug_assert_payload_fits;
pub(crate) use debug_assert_reader_behind_head;
