//! Consumer groups: independent fan-out cursors over one ring.
//!
//! Each group is a shared read cursor in the fixed 16-slot table past the
//! ring. Every group sees the full message stream from the moment it was
//! created; handles within one group race on the cursor and thereby share
//! the work. A group stays claimed for the lifetime of the region —
//! dropping a [`Consumer`] handle never deactivates it, because handles
//! in other processes may still be reading through it.

use std::ptr;
use std::slice;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::diag::Checkpoint;
use crate::invariants::{debug_assert_payload_fits, debug_assert_reader_behind_head};
use crate::layout::{MAX_GROUPS, SLOT_HEADER_SIZE};
use crate::ring::{Queue, Shared};
use crate::{QueueError, Result};

/// Handle bound to one consumer group.
///
/// Multiple handles may be bound to the same group (see
/// [`Queue::consumer_join`]); their pops race on the group cursor, which
/// gives work-sharing semantics within the group. Racing members can lose
/// duplicate reads of a single message, never corrupt the cursor —
/// callers that need strict one-delivery-per-pop must serialise
/// externally or use separate groups.
pub struct Consumer {
    shared: Arc<Shared>,
    slot: usize,
    group_id: u32,
}

/// Point-in-time view of one group's progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerStats {
    pub group_id: u32,
    pub active: bool,
    /// The group's read cursor.
    pub tail: u64,
    /// Messages published but not yet consumed by this group.
    pub lag: u64,
}

impl Queue {
    /// Claims a free group slot and binds a handle to it.
    ///
    /// The new group's cursor starts at the current head: it consumes
    /// only messages published after it joined. Passing `group_id == 0`
    /// derives an identity from the claimed slot.
    pub fn consumer_create(&self, group_id: u32) -> Result<Consumer> {
        let table = self.require_table()?;
        let num_groups = table.num_groups as usize;

        for slot in 0..num_groups.min(MAX_GROUPS) {
            let group = self.shared.group(slot);
            if group
                .active
                .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }

            let id = if group_id == 0 { slot as u32 + 1 } else { group_id };
            group.group_id.store(id, Ordering::Release);

            // New groups start at the publication frontier.
            let head = self.shared.control().head.load(Ordering::Acquire);
            group.tail.store(head, Ordering::Release);

            return Ok(Consumer {
                shared: Arc::clone(&self.shared),
                slot,
                group_id: id,
            });
        }

        Err(QueueError::NoMem { max: MAX_GROUPS })
    }

    /// Binds a new handle to an already-active group.
    pub fn consumer_join(&self, group_id: u32) -> Result<Consumer> {
        if group_id == 0 {
            return Err(QueueError::Invalid {
                reason: "group id 0 is reserved",
            });
        }
        let table = self.require_table()?;
        let num_groups = table.num_groups as usize;

        for slot in 0..num_groups.min(MAX_GROUPS) {
            let group = self.shared.group(slot);
            if group.active.load(Ordering::Acquire) == 1
                && group.group_id.load(Ordering::Acquire) == group_id
            {
                return Ok(Consumer {
                    shared: Arc::clone(&self.shared),
                    slot,
                    group_id,
                });
            }
        }

        Err(QueueError::NotFound)
    }

    /// Re-binds a consumer from a checkpoint: joins (or creates) the
    /// checkpointed group and rewinds its cursor.
    ///
    /// A checkpoint ahead of the current head is clamped to the head —
    /// never trusted forward, since the slots past head are uninitialised.
    pub fn consumer_resume(&self, ckpt: &Checkpoint) -> Result<Consumer> {
        let consumer = match self.consumer_join(ckpt.group_id) {
            Ok(consumer) => consumer,
            Err(QueueError::NotFound) => self.consumer_create(ckpt.group_id)?,
            Err(err) => return Err(err),
        };

        let head = self.shared.control().head.load(Ordering::Acquire);
        self.shared
            .group(consumer.slot)
            .tail
            .store(ckpt.tail.min(head), Ordering::Release);
        Ok(consumer)
    }

    /// Minimum cursor over all active groups; the boundary behind which
    /// the producer may reclaim slots. Falls back to the control-block
    /// tail when no group is active.
    pub fn min_tail(&self) -> u64 {
        self.shared.reclaim_tail()
    }

    fn require_table(&self) -> Result<&crate::layout::GroupTableHeader> {
        self.shared.table_header().ok_or(QueueError::Invalid {
            reason: "queue was not created with multi-consumer support",
        })
    }
}

impl Consumer {
    /// Identity of the group this handle reads through.
    #[inline]
    pub fn group_id(&self) -> u32 {
        self.group_id
    }

    /// Copies the group's next message into `buf` and consumes it.
    pub fn pop(&mut self, buf: &mut [u8]) -> Result<usize> {
        let (tail, len) = self.next_readable()?;
        if len > buf.len() {
            return Err(QueueError::TooBig {
                required: len,
                available: buf.len(),
            });
        }

        // SAFETY: next_readable saw head > tail through an Acquire load of
        // head, so the slot is fully published; the producer reclaims it
        // only after every group's Release-advanced cursor passes it.
        unsafe {
            ptr::copy_nonoverlapping(
                self.shared.slot_ptr(tail).add(SLOT_HEADER_SIZE),
                buf.as_mut_ptr(),
                len,
            );
        }

        self.advance(tail);
        Ok(len)
    }

    /// Borrows the group's next message without consuming it.
    pub fn peek(&mut self) -> Result<&[u8]> {
        let (tail, len) = self.next_readable()?;
        // SAFETY: as in pop(); the borrow ends before the next &mut call,
        // so release() cannot let the slot be reclaimed under it.
        Ok(unsafe { slice::from_raw_parts(self.shared.slot_ptr(tail).add(SLOT_HEADER_SIZE), len) })
    }

    /// Consumes the message last returned by [`Consumer::peek`].
    pub fn release(&mut self) -> Result<()> {
        let group = self.shared.group(self.slot);
        let tail = group.tail.load(Ordering::Relaxed);
        let head = self.shared.control().head.load(Ordering::Acquire);
        if tail >= head {
            return Err(QueueError::Invalid {
                reason: "release without a pending message",
            });
        }
        self.advance(tail);
        Ok(())
    }

    /// Progress snapshot for this group.
    pub fn stats(&self) -> ConsumerStats {
        let group = self.shared.group(self.slot);
        let tail = group.tail.load(Ordering::Acquire);
        let head = self.shared.control().head.load(Ordering::Acquire);
        ConsumerStats {
            group_id: self.group_id,
            active: group.active.load(Ordering::Acquire) == 1,
            tail,
            lag: head.saturating_sub(tail),
        }
    }

    fn next_readable(&self) -> Result<(u64, usize)> {
        let group = self.shared.group(self.slot);
        let tail = group.tail.load(Ordering::Relaxed);
        let head = self.shared.control().head.load(Ordering::Acquire);
        if tail >= head {
            return Err(QueueError::Empty);
        }

        // SAFETY: head > tail via Acquire, so slot `tail` is published.
        let header = unsafe { self.shared.slot_header(tail) };
        let len = header.length as usize;
        debug_assert_payload_fits!(len, self.shared.geo.max_payload());
        Ok((tail, len))
    }

    fn advance(&self, tail: u64) {
        let group = self.shared.group(self.slot);
        debug_assert_reader_behind_head!(
            tail + 1,
            self.shared.control().head.load(Ordering::Relaxed)
        );
        group.tail.store(tail + 1, Ordering::Release);
    }
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("Consumer")
            .field("group_id", &self.group_id)
            .field("tail", &stats.tail)
            .field("lag", &stats.lag)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::QueueConfig;

    fn scratch_name(tag: &str) -> String {
        format!("/shmring-consumer-{tag}-{}", std::process::id())
    }

    #[test]
    fn test_derived_group_ids_follow_slots() {
        let name = scratch_name("ids");
        let queue = Queue::create(&name, QueueConfig::new(8, 64, true)).unwrap();

        let first = queue.consumer_create(0).unwrap();
        let second = queue.consumer_create(0).unwrap();
        assert_eq!(first.group_id(), 1);
        assert_eq!(second.group_id(), 2);

        drop((first, second, queue));
        Queue::unlink(&name).unwrap();
    }

    #[test]
    fn test_stats_track_lag() {
        let name = scratch_name("lag");
        let mut queue = Queue::create(&name, QueueConfig::new(8, 64, true)).unwrap();
        let mut group = queue.consumer_create(5).unwrap();

        queue.push(b"a").unwrap();
        queue.push(b"b").unwrap();

        let stats = group.stats();
        assert_eq!(stats.group_id, 5);
        assert!(stats.active);
        assert_eq!(stats.lag, 2);

        let mut buf = [0u8; 64];
        group.pop(&mut buf).unwrap();
        assert_eq!(group.stats().lag, 1);

        drop((group, queue));
        Queue::unlink(&name).unwrap();
    }
}
