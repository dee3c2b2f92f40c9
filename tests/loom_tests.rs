//! Loom-based concurrency tests for the publication protocol.
//!
//! Run with: `cargo test --features loom --test loom_tests --release`
//!
//! Loom exhaustively explores thread interleavings, so these tests model
//! the protocol in isolation — the same ordering choices as the real
//! implementation, on a tiny ring — rather than mapping actual shared
//! memory inside the model.

#![cfg(feature = "loom")]

use loom::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use loom::sync::Arc;
use loom::thread;
use std::cell::UnsafeCell;

/// Two-slot model of the ring: payload cells published through a
/// Release store of head, consumed behind an Acquire load.
struct ModelRing {
    head: AtomicU64,
    tail: AtomicU64,
    slots: UnsafeCell<[u64; 2]>,
}

unsafe impl Send for ModelRing {}
unsafe impl Sync for ModelRing {}

impl ModelRing {
    fn new() -> Self {
        Self {
            head: AtomicU64::new(0),
            tail: AtomicU64::new(0),
            slots: UnsafeCell::new([0; 2]),
        }
    }

    fn push(&self, value: u64) -> bool {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        if head - tail >= 2 {
            return false;
        }

        // SAFETY: the slot at `head` is past every reader (full-check
        // above), and only the producer thread writes slots.
        unsafe {
            (*self.slots.get())[(head & 1) as usize] = value;
        }
        self.head.store(head + 1, Ordering::Release);
        true
    }

    fn pop(&self) -> Option<u64> {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        if tail == head {
            return None;
        }

        // SAFETY: head > tail through the Acquire load, so the slot's
        // payload write happens-before this read.
        let value = unsafe { (*self.slots.get())[(tail & 1) as usize] };
        self.tail.store(tail + 1, Ordering::Release);
        Some(value)
    }
}

/// The consumer must never observe a slot before its payload write: every
/// popped value is exactly the one pushed at that index.
#[test]
fn loom_publish_happens_before_consume() {
    loom::model(|| {
        let ring = Arc::new(ModelRing::new());

        let producer = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || {
                let mut sent = 0u64;
                while sent < 3 {
                    if ring.push(sent + 100) {
                        sent += 1;
                    } else {
                        thread::yield_now();
                    }
                }
            })
        };

        let mut expected = 0u64;
        while expected < 3 {
            if let Some(value) = ring.pop() {
                assert_eq!(value, expected + 100, "observed a torn or stale slot");
                expected += 1;
            } else {
                thread::yield_now();
            }
        }

        producer.join().unwrap();
    });
}

/// Group claim: two threads CAS the same free slots; every slot ends up
/// claimed by exactly one of them.
#[test]
fn loom_group_claim_is_exclusive() {
    loom::model(|| {
        let slots = Arc::new([AtomicU32::new(0), AtomicU32::new(0)]);

        let claim = |slots: &[AtomicU32; 2]| -> Option<usize> {
            for (i, slot) in slots.iter().enumerate() {
                if slot
                    .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return Some(i);
                }
            }
            None
        };

        let a = {
            let slots = Arc::clone(&slots);
            thread::spawn(move || claim(&slots))
        };
        let b = {
            let slots = Arc::clone(&slots);
            thread::spawn(move || claim(&slots))
        };

        let first = a.join().unwrap();
        let second = b.join().unwrap();

        // Both claims succeeded and landed on different slots.
        assert!(first.is_some() && second.is_some());
        assert_ne!(first, second);
    });
}
