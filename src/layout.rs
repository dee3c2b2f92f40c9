//! On-region layout definitions.
//!
//! This module defines the `repr(C)` structures that live inside the mapped
//! shared-memory region. They are a fixed wire format: every field offset
//! below is load-bearing for any process that attaches to an existing
//! region, so sizes and offsets are asserted at compile time.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  Control block (256 bytes, four 64-byte cache lines)         │
//! │    line 0: magic, version, capacity, slot_size, buffer_offset│
//! │    line 1: head (producer-owned)                             │
//! │    line 2: tail (consumer-owned)                             │
//! │    line 3: last_activity_ns + reserved                       │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Ring buffer (capacity × slot_size bytes)                    │
//! │    slot: 8-byte header { length, flags, sequence } + payload │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Consumer group table (optional, fan-out regions only)       │
//! │    header (64 bytes) + 16 group slots (64 bytes each)        │
//! └──────────────────────────────────────────────────────────────┘
//! ```

use std::mem::{offset_of, size_of};
use std::sync::atomic::{AtomicU32, AtomicU64};

/// Magic word identifying a queue region ("NABD" tag + layout v1).
pub const RING_MAGIC: u64 = 0x4442414E00010000;

/// Layout version, major in the high 16 bits, minor in the low.
pub const LAYOUT_VERSION: u64 = 1 << 16; // v1.0

/// Magic word identifying the consumer group table ("NABDGRPS").
pub const TABLE_MAGIC: u64 = 0x53505247_4442414E;

/// Magic word identifying a consumer checkpoint file ("CKPTABD" tag).
pub const CHECKPOINT_MAGIC: u64 = 0x434B5054414244;

/// Bytes of slot space consumed by the slot header.
pub const SLOT_HEADER_SIZE: usize = 8;

/// Number of group slots in the consumer table.
pub const MAX_GROUPS: usize = 16;

/// Control block at the start of every region (256 bytes exactly).
///
/// Line 0 is immutable after initialisation. `head` and `tail` each own a
/// full cache line so the producer and consumer never contend on one.
#[repr(C, align(64))]
pub struct ControlBlock {
    // line 0 — written once at create, read-only afterwards
    pub magic: u64,
    pub version: u64,
    pub capacity: u64,
    pub slot_size: u64,
    pub buffer_offset: u64,
    _reserved0: [u64; 3],

    // line 1 — only the producer stores here
    pub head: AtomicU64,
    _pad_head: [u8; 56],

    // line 2 — only the (single) consumer stores here
    pub tail: AtomicU64,
    _pad_tail: [u8; 56],

    // line 3 — producer publish timestamp, rest reserved
    pub last_activity_ns: AtomicU64,
    _reserved1: [u8; 56],
}

const _: () = assert!(size_of::<ControlBlock>() == 256);
const _: () = assert!(offset_of!(ControlBlock, head) == 64);
const _: () = assert!(offset_of!(ControlBlock, tail) == 128);
const _: () = assert!(offset_of!(ControlBlock, last_activity_ns) == 192);

impl ControlBlock {
    /// Initialises a freshly created (zeroed) control block.
    ///
    /// Geometry fields are plain stores; the mapping is not yet visible to
    /// any other process because the caller still holds the exclusively
    /// created object.
    pub fn init(&mut self, capacity: u64, slot_size: u64) {
        self.magic = RING_MAGIC;
        self.version = LAYOUT_VERSION;
        self.capacity = capacity;
        self.slot_size = slot_size;
        self.buffer_offset = size_of::<ControlBlock>() as u64;
        *self.head.get_mut() = 0;
        *self.tail.get_mut() = 0;
        *self.last_activity_ns.get_mut() = 0;
    }

    /// Checks the identity of an attached region.
    pub fn validate(&self) -> Result<(), crate::QueueError> {
        if self.magic != RING_MAGIC {
            return Err(crate::QueueError::Corrupted);
        }
        if self.version != LAYOUT_VERSION {
            return Err(crate::QueueError::Version {
                found: self.version,
            });
        }
        Ok(())
    }
}

/// Per-message header at the front of every slot.
///
/// `sequence` records the producer index at publish time and exists for
/// diagnostics only; readers derive position from their own cursor.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SlotHeader {
    pub length: u16,
    pub flags: u16,
    pub sequence: u32,
}

const _: () = assert!(size_of::<SlotHeader>() == SLOT_HEADER_SIZE);

/// One consumer group: a shared read cursor plus claim state.
///
/// Padded to one cache line so claiming or advancing one group never
/// invalidates a neighbour's line. Padding is explicit rather than an
/// alignment attribute: the table sits at `buffer_offset + capacity ×
/// slot_size`, which is only guaranteed 8-aligned.
#[repr(C)]
pub struct GroupSlot {
    /// Read cursor, advanced only by members of this group.
    pub tail: AtomicU64,
    /// 0 = free, 1 = claimed. Claimed by CAS, never unclaimed in-region.
    pub active: AtomicU32,
    /// Caller-chosen identity, written once under the claim.
    pub group_id: AtomicU32,
    _pad: [u8; 48],
}

const _: () = assert!(size_of::<GroupSlot>() == 64);

/// Header of the consumer group table.
#[repr(C)]
pub struct GroupTableHeader {
    pub magic: u64,
    pub num_groups: u64,
    _pad: [u8; 48],
}

const _: () = assert!(size_of::<GroupTableHeader>() == 64);

impl GroupTableHeader {
    /// Initialises the table header on a freshly created region.
    pub fn init(&mut self) {
        self.magic = TABLE_MAGIC;
        self.num_groups = MAX_GROUPS as u64;
    }
}

/// Whole-table byte size: header plus the fixed slot array.
pub const fn table_size() -> usize {
    size_of::<GroupTableHeader>() + MAX_GROUPS * size_of::<GroupSlot>()
}

/// Region byte size for the given geometry.
pub const fn region_size(capacity: u64, slot_size: u64, multi_consumer: bool) -> usize {
    let base = size_of::<ControlBlock>() + (capacity * slot_size) as usize;
    if multi_consumer {
        base + table_size()
    } else {
        base
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_size() {
        assert_eq!(table_size(), 64 + 16 * 64);
    }

    #[test]
    fn test_region_size() {
        assert_eq!(region_size(4, 64, false), 256 + 4 * 64);
        assert_eq!(region_size(4, 64, true), 256 + 4 * 64 + table_size());
    }

    #[test]
    fn test_control_block_init_and_validate() {
        let mut ctrl: ControlBlock = unsafe { std::mem::zeroed() };
        ctrl.init(8, 64);
        assert!(ctrl.validate().is_ok());
        assert_eq!(ctrl.buffer_offset, 256);

        ctrl.version = 2 << 16;
        assert!(matches!(
            ctrl.validate(),
            Err(crate::QueueError::Version { found }) if found == 2 << 16
        ));

        ctrl.magic = 0;
        assert!(matches!(ctrl.validate(), Err(crate::QueueError::Corrupted)));
    }
}
