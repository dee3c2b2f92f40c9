use std::mem::size_of;
use std::ptr;
use std::slice;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::debug;

use crate::config::{DEFAULT_CAPACITY, DEFAULT_SLOT_SIZE, MIN_SLOT_SIZE};
use crate::invariants::{
    debug_assert_bounded_count, debug_assert_monotonic, debug_assert_payload_fits,
    debug_assert_reader_behind_head,
};
use crate::layout::{
    region_size, ControlBlock, GroupSlot, GroupTableHeader, SlotHeader, MAX_GROUPS,
    SLOT_HEADER_SIZE, TABLE_MAGIC,
};
use crate::metrics::now_ns;
use crate::region::Region;
use crate::{QueueConfig, QueueError, Result};

// =============================================================================
// MEMORY ORDERING & SYNCHRONIZATION STRATEGY
// =============================================================================
//
// The ring lives in a shared-memory region mapped by multiple processes,
// so the protocol below is the only synchronization there is — no locks,
// no fences beyond the per-access orderings.
//
// ## Sequence Numbers
//
// `head` and every `tail` are unbounded u64 counters; the slot index is
// `counter & mask`. At 10^9 messages/second a u64 takes upwards of 500
// years to wrap, so `head - tail` is always a valid unsigned difference
// and `head == tail` unambiguously means empty while
// `head - tail == capacity` means full.
//
// ## Ordering Protocol
//
// **Producer (push / reserve+commit):**
// 1. Load own `head` with Relaxed (only the producer stores it)
// 2. Load the reclaim tail with Acquire (synchronizes with the reader's
//    Release, so a slot being reused is no longer read)
// 3. Write payload bytes and the slot header as plain stores
// 4. Store `head + 1` with Release (publishes every preceding write)
//
// **Consumer (pop / peek+release):**
// 1. Load own `tail` with Relaxed (only this reader's side stores it)
// 2. Load `head` with Acquire (synchronizes with the producer's Release,
//    so the slot's header and payload are fully visible)
// 3. Read the header and payload as plain loads
// 4. Store `tail + 1` with Release (publishes that the slot is reusable)
//
// ## Single-Writer Invariants
//
// - `head`: stored only by the producer process
// - control-block `tail`: stored only by the single direct consumer
// - each group `tail`: stored only by members of that group (racing
//   members lose duplicate reads, never corrupt the cursor)
// - slot bytes at index i: written only while i >= head, read only while
//   some reader's tail <= i < head — the ordering rules keep these sets
//   disjoint
// =============================================================================

/// Cached geometry, read once at open so the hot paths never touch the
/// control block's immutable line.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Geometry {
    pub capacity: u64,
    pub mask: u64,
    pub slot_size: u64,
}

impl Geometry {
    #[inline]
    pub(crate) fn max_payload(&self) -> usize {
        // The slot header stores the length as u16.
        ((self.slot_size as usize) - SLOT_HEADER_SIZE).min(u16::MAX as usize)
    }
}

/// The mapped region plus its typed views. Shared between a `Queue`
/// handle and any `Consumer` handles split off from it.
pub(crate) struct Shared {
    region: Region,
    pub(crate) geo: Geometry,
    has_table: bool,
}

impl Shared {
    #[inline]
    pub(crate) fn control(&self) -> &ControlBlock {
        self.region.control()
    }

    #[inline]
    pub(crate) fn has_table(&self) -> bool {
        self.has_table
    }

    /// Raw pointer to the slot for logical index `index`.
    ///
    /// # Safety
    ///
    /// The caller must hold the protocol right to touch this slot: the
    /// producer between its full-check and head release, or a reader
    /// between its head acquire and tail release.
    #[inline]
    pub(crate) unsafe fn slot_ptr(&self, index: u64) -> *mut u8 {
        let offset =
            size_of::<ControlBlock>() as u64 + (index & self.geo.mask) * self.geo.slot_size;
        self.region.as_ptr().add(offset as usize)
    }

    /// Reads the header of the slot at `index`.
    ///
    /// # Safety
    ///
    /// Same contract as [`Self::slot_ptr`]; additionally the slot must
    /// have been published (header initialised).
    #[inline]
    pub(crate) unsafe fn slot_header(&self, index: u64) -> SlotHeader {
        ptr::read(self.slot_ptr(index).cast::<SlotHeader>())
    }

    fn table_offset(&self) -> usize {
        size_of::<ControlBlock>() + (self.geo.capacity * self.geo.slot_size) as usize
    }

    /// Group table header, present only on fan-out regions.
    pub(crate) fn table_header(&self) -> Option<&GroupTableHeader> {
        if !self.has_table {
            return None;
        }
        // SAFETY: has_table is only set after the mapping was verified to
        // cover the table and the table magic matched; the offset is
        // 8-aligned because slot_size is normalised to a multiple of 8.
        Some(unsafe {
            &*self
                .region
                .as_ptr()
                .add(self.table_offset())
                .cast::<GroupTableHeader>()
        })
    }

    /// Group slot `index` of the table. Panics if the table is absent.
    pub(crate) fn group(&self, index: usize) -> &GroupSlot {
        assert!(self.has_table && index < MAX_GROUPS);
        let offset = self.table_offset() + size_of::<GroupTableHeader>();
        // SAFETY: bounds asserted above; mapping covers the whole table.
        unsafe {
            &*self
                .region
                .as_ptr()
                .add(offset + index * size_of::<GroupSlot>())
                .cast::<GroupSlot>()
        }
    }

    /// The tail the producer must respect before reusing a slot.
    ///
    /// With at least one active consumer group this is the minimum group
    /// tail; otherwise it falls back to the control-block tail. Acquire
    /// loads pair with the readers' Release stores.
    pub(crate) fn reclaim_tail(&self) -> u64 {
        let mut min: Option<u64> = None;
        if self.has_table {
            for i in 0..MAX_GROUPS {
                let group = self.group(i);
                if group.active.load(Ordering::Acquire) == 1 {
                    let tail = group.tail.load(Ordering::Acquire);
                    min = Some(min.map_or(tail, |m| m.min(tail)));
                }
            }
        }
        min.unwrap_or_else(|| self.control().tail.load(Ordering::Acquire))
    }
}

/// Pending zero-copy reservation, local to the producer handle.
#[derive(Debug, Clone, Copy)]
struct PendingReserve {
    pos: u64,
    len: usize,
}

/// Handle to a shared-memory message queue.
///
/// A `Queue` is process-local bookkeeping over a mapped region: cached
/// geometry, the single outstanding reservation, and backpressure
/// configuration. The region itself is the only cross-process state.
///
/// The protocol is single-producer: across all processes, at most one
/// handle may push/reserve at a time. Any number of processes may attach
/// for reading, either as the single direct consumer (pop/peek on the
/// control-block tail) or through consumer groups.
///
/// Dropping a `Queue` unmaps the region but never removes the name; use
/// [`Queue::unlink`] for that.
pub struct Queue {
    pub(crate) shared: Arc<Shared>,
    pub(crate) name: String,
    reservation: Option<PendingReserve>,
    pub(crate) backpressure: Option<crate::backpressure::Backpressure>,
}

impl Queue {
    // ---------------------------------------------------------------------
    // LIFECYCLE
    // ---------------------------------------------------------------------

    /// Creates the named region and becomes its producer.
    ///
    /// Geometry is normalised first: zero capacity/slot_size fall back to
    /// the defaults, capacity is rounded up to a power of two, slot_size
    /// is rounded up to a multiple of 8 and must be at least 16 bytes.
    ///
    /// If the name already exists the call degrades to [`Queue::attach`],
    /// ignoring `config` — the region's own geometry wins.
    pub fn create(name: &str, config: QueueConfig) -> Result<Queue> {
        let capacity = if config.capacity == 0 {
            DEFAULT_CAPACITY
        } else {
            config.capacity
        }
        .max(2)
        .next_power_of_two();

        let slot_size = if config.slot_size == 0 {
            DEFAULT_SLOT_SIZE
        } else {
            (config.slot_size + 7) & !7
        };
        if slot_size < MIN_SLOT_SIZE {
            return Err(QueueError::Invalid {
                reason: "slot_size must be at least 16 bytes",
            });
        }

        let total = region_size(capacity, slot_size, config.multi_consumer);
        let region = match Region::create(name, total) {
            Ok(region) => region,
            Err(QueueError::Exists) => {
                debug!("region {name} already exists, attaching instead");
                return Queue::attach(name);
            }
            Err(err) => return Err(err),
        };

        // SAFETY: the object was created exclusively and zero-filled; no
        // other process has a validated view until the magic is written.
        unsafe {
            (*region.as_ptr().cast::<ControlBlock>()).init(capacity, slot_size);
            if config.multi_consumer {
                let table_offset = size_of::<ControlBlock>() + (capacity * slot_size) as usize;
                (*region
                    .as_ptr()
                    .add(table_offset)
                    .cast::<GroupTableHeader>())
                .init();
            }
        }

        Ok(Queue {
            shared: Arc::new(Shared {
                region,
                geo: Geometry {
                    capacity,
                    mask: capacity - 1,
                    slot_size,
                },
                has_table: config.multi_consumer,
            }),
            name: name.to_owned(),
            reservation: None,
            backpressure: None,
        })
    }

    /// Attaches to an existing region and discovers its geometry.
    ///
    /// The control block is mapped and validated on its own first; only
    /// then is the full region mapped, so a foreign or torn region is
    /// rejected before its claimed geometry is trusted.
    pub fn attach(name: &str) -> Result<Queue> {
        let (capacity, slot_size) = {
            let ctrl_map = Region::open_control(name, false)?;
            let ctrl = ctrl_map.control();
            // On open a bad magic or version just means "not a queue we
            // can use" — the corrupted/version classifications belong to
            // the diagnostics path.
            ctrl.validate().map_err(|_| QueueError::Invalid {
                reason: "region is not a compatible queue layout",
            })?;
            (ctrl.capacity, ctrl.slot_size)
        };

        if !capacity.is_power_of_two() || capacity < 2 || slot_size < MIN_SLOT_SIZE {
            return Err(QueueError::Corrupted);
        }

        let region = Region::open(name, false)?;
        let base = region_size(capacity, slot_size, false);
        if region.len() < base {
            return Err(QueueError::Corrupted);
        }

        let shared = Shared {
            region,
            geo: Geometry {
                capacity,
                mask: capacity - 1,
                slot_size,
            },
            has_table: false,
        };

        // Fan-out regions carry the group table past the ring; detect it
        // from the mapping size and verify its magic.
        let has_table = shared.region.len() >= region_size(capacity, slot_size, true) && {
            let header = unsafe {
                // SAFETY: the mapping covers the table range (checked on
                // the line above) and the offset is 8-aligned.
                &*shared
                    .region
                    .as_ptr()
                    .add(shared.table_offset())
                    .cast::<GroupTableHeader>()
            };
            header.magic == TABLE_MAGIC
        };

        Ok(Queue {
            shared: Arc::new(Shared { has_table, ..shared }),
            name: name.to_owned(),
            reservation: None,
            backpressure: None,
        })
    }

    /// Removes the name from the shared-memory namespace.
    ///
    /// Processes that already mapped the region keep their access; the
    /// object is destroyed when the last mapping drops.
    pub fn unlink(name: &str) -> Result<()> {
        Region::unlink(name)
    }

    /// Region name this handle is attached to.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of slots.
    #[inline]
    pub fn capacity(&self) -> u64 {
        self.shared.geo.capacity
    }

    /// Bytes per slot, header included.
    #[inline]
    pub fn slot_size(&self) -> u64 {
        self.shared.geo.slot_size
    }

    /// Largest payload a single message can carry.
    #[inline]
    pub fn max_payload(&self) -> usize {
        self.shared.geo.max_payload()
    }

    /// Whether this region was created with a consumer group table.
    #[inline]
    pub fn is_multi_consumer(&self) -> bool {
        self.shared.has_table()
    }

    // ---------------------------------------------------------------------
    // PRODUCER API
    // ---------------------------------------------------------------------

    /// Copies `data` into the next slot and publishes it.
    ///
    /// Fails with `Full` when the slowest reader is a full ring behind,
    /// and with `TooBig` when the payload cannot fit a slot.
    pub fn push(&mut self, data: &[u8]) -> Result<()> {
        if self.reservation.is_some() {
            return Err(QueueError::Invalid {
                reason: "push while a reservation is outstanding",
            });
        }
        let head = self.claim_slot(data.len())?;

        // SAFETY: claim_slot verified index `head` is not readable by any
        // reader (head - reclaim_tail < capacity), and only this producer
        // writes slots. Plain stores, sequenced before the Release below.
        unsafe {
            let slot = self.shared.slot_ptr(head);
            ptr::copy_nonoverlapping(data.as_ptr(), slot.add(SLOT_HEADER_SIZE), data.len());
            ptr::write(
                slot.cast::<SlotHeader>(),
                SlotHeader {
                    length: data.len() as u16,
                    flags: 0,
                    sequence: head as u32,
                },
            );
        }

        self.publish(head);
        Ok(())
    }

    /// Reserves the next slot for zero-copy writing.
    ///
    /// Returns the slot's payload area; the caller writes into it and
    /// then calls [`Queue::commit`]. Only one reservation may be
    /// outstanding per handle; a second call is `Invalid`. A reservation
    /// that is never committed is simply never published.
    pub fn reserve(&mut self, len: usize) -> Result<&mut [u8]> {
        if self.reservation.is_some() {
            return Err(QueueError::Invalid {
                reason: "a reservation is already outstanding",
            });
        }
        let head = self.claim_slot(len)?;
        self.reservation = Some(PendingReserve { pos: head, len });

        // SAFETY: same slot-ownership argument as push(); the borrow is
        // tied to &mut self, so the slice dies before any other producer
        // operation on this handle.
        Ok(unsafe {
            slice::from_raw_parts_mut(self.shared.slot_ptr(head).add(SLOT_HEADER_SIZE), len)
        })
    }

    /// Publishes the outstanding reservation with its final length.
    ///
    /// `len` may be less than the reserved length (the producer learned
    /// the real size while writing), never more.
    pub fn commit(&mut self, len: usize) -> Result<()> {
        let Some(pending) = self.reservation else {
            return Err(QueueError::Invalid {
                reason: "commit without an outstanding reservation",
            });
        };
        if len > pending.len {
            return Err(QueueError::Invalid {
                reason: "commit length exceeds the reserved length",
            });
        }
        self.reservation = None;

        // SAFETY: the reservation still owns slot `pending.pos`; the
        // payload was written through the reserve() borrow, which ended
        // before this call.
        unsafe {
            ptr::write(
                self.shared.slot_ptr(pending.pos).cast::<SlotHeader>(),
                SlotHeader {
                    length: len as u16,
                    flags: 0,
                    sequence: pending.pos as u32,
                },
            );
        }

        self.publish(pending.pos);
        Ok(())
    }

    /// Full-check and slot claim shared by push and reserve.
    fn claim_slot(&self, len: usize) -> Result<u64> {
        let max = self.max_payload();
        if len > max {
            return Err(QueueError::TooBig {
                required: len,
                available: max,
            });
        }

        let ctrl = self.shared.control();
        let head = ctrl.head.load(Ordering::Relaxed);
        let tail = self.shared.reclaim_tail();
        if head.wrapping_sub(tail) >= self.shared.geo.capacity {
            return Err(QueueError::Full);
        }
        Ok(head)
    }

    /// Release-stores the new head and records producer activity.
    fn publish(&mut self, pos: u64) {
        let ctrl = self.shared.control();
        debug_assert_monotonic!("head", ctrl.head.load(Ordering::Relaxed), pos + 1);
        debug_assert_bounded_count!(
            (pos + 1).wrapping_sub(self.shared.reclaim_tail()),
            self.shared.geo.capacity
        );
        ctrl.head.store(pos + 1, Ordering::Release);
        ctrl.last_activity_ns.store(now_ns(), Ordering::Relaxed);
        self.watermark_tick();
    }

    // ---------------------------------------------------------------------
    // CONSUMER API (single direct consumer; groups live in consumer.rs)
    // ---------------------------------------------------------------------

    /// Copies the next message into `buf` and consumes it.
    ///
    /// Returns the message length. `TooBig` reports the required size
    /// without consuming the message, so the caller can grow and retry.
    pub fn pop(&mut self, buf: &mut [u8]) -> Result<usize> {
        let (tail, len) = self.next_readable()?;
        if len > buf.len() {
            return Err(QueueError::TooBig {
                required: len,
                available: buf.len(),
            });
        }

        // SAFETY: next_readable saw head > tail through an Acquire load,
        // so the slot at `tail` is fully published and the producer will
        // not reuse it until our Release store below.
        unsafe {
            ptr::copy_nonoverlapping(
                self.shared.slot_ptr(tail).add(SLOT_HEADER_SIZE),
                buf.as_mut_ptr(),
                len,
            );
        }

        self.advance_tail(tail);
        Ok(len)
    }

    /// Borrows the next message in place without consuming it.
    ///
    /// Repeated peeks return the same message until [`Queue::release`]
    /// advances past it; the borrow ends at the next `&mut self` call.
    pub fn peek(&mut self) -> Result<&[u8]> {
        let (tail, len) = self.next_readable()?;
        // SAFETY: as in pop(); the borrow is tied to &mut self, so it is
        // dead by the time release() lets the producer reuse the slot.
        Ok(unsafe { slice::from_raw_parts(self.shared.slot_ptr(tail).add(SLOT_HEADER_SIZE), len) })
    }

    /// Consumes the message last returned by [`Queue::peek`].
    pub fn release(&mut self) -> Result<()> {
        let ctrl = self.shared.control();
        let tail = ctrl.tail.load(Ordering::Relaxed);
        let head = ctrl.head.load(Ordering::Acquire);
        if tail == head {
            return Err(QueueError::Invalid {
                reason: "release without a pending message",
            });
        }
        self.advance_tail(tail);
        Ok(())
    }

    /// Loads the cursor pair and the pending message length.
    fn next_readable(&self) -> Result<(u64, usize)> {
        let ctrl = self.shared.control();
        let tail = ctrl.tail.load(Ordering::Relaxed);
        let head = ctrl.head.load(Ordering::Acquire);
        if tail == head {
            return Err(QueueError::Empty);
        }

        // SAFETY: head > tail via Acquire, so slot `tail` is published.
        let header = unsafe { self.shared.slot_header(tail) };
        let len = header.length as usize;
        debug_assert_payload_fits!(len, self.max_payload());
        Ok((tail, len))
    }

    fn advance_tail(&self, tail: u64) {
        let ctrl = self.shared.control();
        debug_assert_reader_behind_head!(tail + 1, ctrl.head.load(Ordering::Relaxed));
        ctrl.tail.store(tail + 1, Ordering::Release);
    }

    // ---------------------------------------------------------------------
    // QUERIES
    // ---------------------------------------------------------------------

    /// True when no message is pending for the direct consumer.
    pub fn empty(&self) -> bool {
        let ctrl = self.shared.control();
        ctrl.head.load(Ordering::Acquire) == ctrl.tail.load(Ordering::Acquire)
    }

    /// True when the producer cannot publish another message.
    pub fn full(&self) -> bool {
        let ctrl = self.shared.control();
        let head = ctrl.head.load(Ordering::Acquire);
        head.wrapping_sub(self.shared.reclaim_tail()) >= self.shared.geo.capacity
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ctrl = self.shared.control();
        f.debug_struct("Queue")
            .field("name", &self.name)
            .field("capacity", &self.shared.geo.capacity)
            .field("slot_size", &self.shared.geo.slot_size)
            .field("head", &ctrl.head.load(Ordering::Relaxed))
            .field("tail", &ctrl.tail.load(Ordering::Relaxed))
            .field("multi_consumer", &self.shared.has_table)
            .finish()
    }
}
