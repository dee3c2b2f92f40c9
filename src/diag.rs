//! Diagnostics, forced recovery, and consumer checkpoints.
//!
//! Everything here operates on a region from the outside: diagnose maps
//! only the control block, read-only, so it can be run against a live
//! queue without joining the protocol. Recovery is deliberately blunt —
//! the only repair is discarding pending messages by moving the tail up
//! to the head; payload contents are never inspected or salvaged.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;

use log::{debug, warn};

use crate::consumer::Consumer;
use crate::layout::{ControlBlock, CHECKPOINT_MAGIC, LAYOUT_VERSION, RING_MAGIC};
use crate::metrics::now_ns;
use crate::region::Region;
use crate::ring::Queue;
use crate::{QueueError, Result};

/// Health classification of an existing region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    /// Valid region with pending messages.
    Ok,
    /// Valid region, nothing pending.
    Empty,
    /// The backing object exists but creation never finished (object
    /// smaller than the control block, or magic still zero).
    Incomplete,
    /// Magic mismatch or impossible counters.
    Corrupted,
    /// Valid magic, incompatible layout version.
    VersionErr,
}

/// Result of a read-only inspection. All counter fields are a racy
/// snapshot — the queue may be live while we look.
#[derive(Debug, Clone, Copy)]
pub struct DiagReport {
    pub state: QueueState,
    pub magic_ok: bool,
    pub version_ok: bool,
    pub capacity: u64,
    pub slot_size: u64,
    pub head: u64,
    pub tail: u64,
    /// Published but unconsumed messages (`head - tail`, clamped at 0).
    pub pending: u64,
    /// Producer publish timestamp, 0 if nothing was ever published.
    pub last_activity_ns: u64,
}

/// Inspects the named region without attaching to the protocol.
///
/// Maps the 256-byte control block read-only and classifies what it
/// finds. Returns `NotFound` if the name does not exist.
pub fn diagnose(name: &str) -> Result<DiagReport> {
    let size = Region::stat_size(name)?;
    if size < std::mem::size_of::<ControlBlock>() {
        debug!("region {name} is {size} bytes, smaller than a control block");
        return Ok(DiagReport {
            state: QueueState::Incomplete,
            magic_ok: false,
            version_ok: false,
            capacity: 0,
            slot_size: 0,
            head: 0,
            tail: 0,
            pending: 0,
            last_activity_ns: 0,
        });
    }

    let map = Region::open_control(name, true)?;
    let ctrl = map.control();

    let magic_ok = ctrl.magic == RING_MAGIC;
    let version_ok = ctrl.version == LAYOUT_VERSION;
    let head = ctrl.head.load(Ordering::Acquire);
    let tail = ctrl.tail.load(Ordering::Acquire);
    let pending = head.saturating_sub(tail);

    let state = if !magic_ok {
        if ctrl.magic == 0 {
            QueueState::Incomplete
        } else {
            QueueState::Corrupted
        }
    } else if !version_ok {
        QueueState::VersionErr
    } else if pending > ctrl.capacity {
        QueueState::Corrupted
    } else if pending == 0 {
        QueueState::Empty
    } else {
        QueueState::Ok
    };

    Ok(DiagReport {
        state,
        magic_ok,
        version_ok,
        capacity: ctrl.capacity,
        slot_size: ctrl.slot_size,
        head,
        tail,
        pending,
        last_activity_ns: ctrl.last_activity_ns.load(Ordering::Relaxed),
    })
}

/// Repairs the named region as far as the protocol allows.
///
/// - `Incomplete`: unlinks the carcass so the next producer can recreate.
/// - Without `force`: `Ok`/`Empty` are a no-op, anything else refuses
///   with `Corrupted`.
/// - With `force` and a readable magic: discards every pending message
///   by setting `tail = head` (the head itself is never moved). With
///   `force` and no trustworthy magic the region is unlinked instead —
///   there is no head worth resetting to.
pub fn recover(name: &str, force: bool) -> Result<()> {
    let report = diagnose(name)?;

    if report.state == QueueState::Incomplete {
        warn!("region {name} never finished initialising, unlinking");
        return Region::unlink(name);
    }

    if !force {
        return match report.state {
            QueueState::Ok | QueueState::Empty => Ok(()),
            _ => Err(QueueError::Corrupted),
        };
    }

    if !report.magic_ok {
        warn!("region {name} has a foreign magic, unlinking");
        return Region::unlink(name);
    }

    let region = Region::open(name, false)?;
    let ctrl = region.control();
    let head = ctrl.head.load(Ordering::Acquire);
    let discarded = head.saturating_sub(ctrl.tail.load(Ordering::Acquire));
    ctrl.tail.store(head, Ordering::Release);
    if discarded > 0 {
        warn!("force-recovered region {name}: discarded {discarded} pending messages");
    }
    Ok(())
}

/// Serialised size of a checkpoint file.
const CHECKPOINT_SIZE: usize = 40;

/// A consumer group's position, persisted outside the region.
///
/// File format, little-endian: magic, timestamp_ns, group_id, 4 pad
/// bytes, tail, checksum. The checksum covers every non-pad field, so a
/// flipped bit anywhere meaningful fails the load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    pub timestamp_ns: u64,
    pub group_id: u32,
    pub tail: u64,
}

impl Checkpoint {
    /// Captures the current position of a consumer's group.
    pub fn capture(consumer: &Consumer) -> Checkpoint {
        let stats = consumer.stats();
        Checkpoint {
            timestamp_ns: now_ns(),
            group_id: stats.group_id,
            tail: stats.tail,
        }
    }

    /// Writes the checkpoint to `path` atomically (temp file + rename).
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut buf = [0u8; CHECKPOINT_SIZE];
        buf[0..8].copy_from_slice(&CHECKPOINT_MAGIC.to_le_bytes());
        buf[8..16].copy_from_slice(&self.timestamp_ns.to_le_bytes());
        buf[16..20].copy_from_slice(&self.group_id.to_le_bytes());
        // bytes 20..24 stay zero (padding)
        buf[24..32].copy_from_slice(&self.tail.to_le_bytes());
        buf[32..40].copy_from_slice(&self.checksum().to_le_bytes());

        let tmp = tmp_path(path);
        let result = (|| -> std::io::Result<()> {
            let mut file = File::create(&tmp)?;
            file.write_all(&buf)?;
            file.sync_all()?;
            fs::rename(&tmp, path)
        })();
        if result.is_err() {
            let _ = fs::remove_file(&tmp);
        }
        result.map_err(QueueError::from_os)?;

        debug!(
            "checkpointed group {} at tail {} to {}",
            self.group_id,
            self.tail,
            path.display()
        );
        Ok(())
    }

    /// Reads and validates a checkpoint from `path`.
    ///
    /// `NotFound` when the file is missing, `Corrupted` on wrong size,
    /// magic, or checksum.
    pub fn load(path: &Path) -> Result<Checkpoint> {
        let mut file = File::open(path).map_err(QueueError::from_os)?;
        let mut buf = [0u8; CHECKPOINT_SIZE];
        file.read_exact(&mut buf)
            .map_err(|_| QueueError::Corrupted)?;

        let magic = u64::from_le_bytes(buf[0..8].try_into().unwrap());
        if magic != CHECKPOINT_MAGIC {
            return Err(QueueError::Corrupted);
        }

        let ckpt = Checkpoint {
            timestamp_ns: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            group_id: u32::from_le_bytes(buf[16..20].try_into().unwrap()),
            tail: u64::from_le_bytes(buf[24..32].try_into().unwrap()),
        };
        let stored = u64::from_le_bytes(buf[32..40].try_into().unwrap());
        if stored != ckpt.checksum() {
            return Err(QueueError::Corrupted);
        }

        Ok(ckpt)
    }

    fn checksum(&self) -> u64 {
        (CHECKPOINT_MAGIC ^ self.timestamp_ns ^ u64::from(self.group_id) ^ self.tail)
            .rotate_left(13)
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

impl Queue {
    /// Timestamp of the producer's last publish, nanoseconds since the
    /// Unix epoch; 0 if nothing was ever published into this region.
    pub fn last_activity(&self) -> u64 {
        self.shared
            .control()
            .last_activity_ns
            .load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_file(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("shmring-ckpt-{tag}-{}", std::process::id()))
    }

    #[test]
    fn test_checkpoint_roundtrip() {
        let path = scratch_file("roundtrip");
        let ckpt = Checkpoint {
            timestamp_ns: 123_456_789,
            group_id: 7,
            tail: 40,
        };
        ckpt.save(&path).unwrap();
        let loaded = Checkpoint::load(&path).unwrap();
        assert_eq!(loaded, ckpt);
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_checkpoint_bit_flip_detected() {
        let path = scratch_file("bitflip");
        let ckpt = Checkpoint {
            timestamp_ns: 99,
            group_id: 3,
            tail: 1234,
        };
        ckpt.save(&path).unwrap();

        let clean = fs::read(&path).unwrap();
        assert_eq!(clean.len(), CHECKPOINT_SIZE);

        // Flip one bit in every non-pad byte; each flip must fail the load.
        for byte in (0..CHECKPOINT_SIZE).filter(|b| !(20..24).contains(b)) {
            let mut bad = clean.clone();
            bad[byte] ^= 0x10;
            fs::write(&path, &bad).unwrap();
            assert!(
                matches!(Checkpoint::load(&path), Err(QueueError::Corrupted)),
                "flip in byte {byte} went undetected"
            );
        }

        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_checkpoint_missing_file() {
        let path = scratch_file("missing");
        assert!(matches!(
            Checkpoint::load(&path),
            Err(QueueError::NotFound)
        ));
    }

    #[test]
    fn test_checkpoint_truncated_file() {
        let path = scratch_file("truncated");
        fs::write(&path, [0u8; 10]).unwrap();
        assert!(matches!(
            Checkpoint::load(&path),
            Err(QueueError::Corrupted)
        ));
        fs::remove_file(&path).unwrap();
    }
}
