use std::io;
use thiserror::Error;

/// Error type for all queue operations.
///
/// `Empty` and `Full` are ordinary operating states, not failures: callers
/// are expected to retry or back off. Everything else signals a caller bug,
/// a missing resource, or an integrity problem with the mapped region.
#[derive(Debug, Error)]
pub enum QueueError {
    /// No message is available for this reader right now.
    #[error("queue is empty")]
    Empty,

    /// No slot is available for the producer right now.
    #[error("queue is full")]
    Full,

    /// The consumer group table has no free slot.
    #[error("consumer group table is full (max {max} groups)")]
    NoMem {
        /// Number of group slots in the table.
        max: usize,
    },

    /// Bad argument or handle state (second reserve without commit,
    /// commit without reserve, release without peek, invalid watermark
    /// pair, consumer op on a queue without a group table, ...).
    #[error("invalid argument or handle state: {reason}")]
    Invalid {
        /// What was wrong, for the human reading the error.
        reason: &'static str,
    },

    /// The region name already exists in the shared-memory namespace.
    #[error("region already exists")]
    Exists,

    /// The region, group, or checkpoint file does not exist.
    #[error("not found")]
    NotFound,

    /// Payload larger than the slot can hold (producer side), or larger
    /// than the caller's receive buffer (consumer side). `required` is
    /// the size the caller needs to retry with.
    #[error("message of {required} bytes does not fit in {available}")]
    TooBig {
        /// Bytes needed to hold the message.
        required: usize,
        /// Bytes actually addressable.
        available: usize,
    },

    /// On-region or on-file integrity failure (bad magic, bad checksum,
    /// pending count past capacity).
    #[error("region or checkpoint is corrupted")]
    Corrupted,

    /// The region was created by an incompatible layout version.
    #[error("layout version mismatch (found {found:#x})")]
    Version {
        /// Version word read from the region.
        found: u64,
    },

    /// The host denied access to the backing object.
    #[error("permission denied")]
    Permission,

    /// Host syscall failure.
    #[error("system error: {0}")]
    Sys(#[from] io::Error),
}

impl QueueError {
    /// C-style error code for this error. 0 is reserved for success.
    pub fn code(&self) -> i32 {
        match self {
            QueueError::Empty => -1,
            QueueError::Full => -2,
            QueueError::NoMem { .. } => -3,
            QueueError::Invalid { .. } => -4,
            QueueError::Exists => -5,
            QueueError::NotFound => -6,
            QueueError::TooBig { .. } => -7,
            QueueError::Corrupted => -8,
            QueueError::Version { .. } => -9,
            QueueError::Permission => -10,
            QueueError::Sys(_) => -11,
        }
    }

    /// Maps an `io::Error` from a shm syscall onto the queue taxonomy.
    pub(crate) fn from_os(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => QueueError::NotFound,
            io::ErrorKind::AlreadyExists => QueueError::Exists,
            io::ErrorKind::PermissionDenied => QueueError::Permission,
            _ => QueueError::Sys(err),
        }
    }
}

/// Short description for a C-style error code, for callers that only
/// carry the integer across an FFI or process boundary.
pub fn strerror(code: i32) -> &'static str {
    match code {
        0 => "success",
        -1 => "queue is empty",
        -2 => "queue is full",
        -3 => "consumer group table is full",
        -4 => "invalid argument or handle state",
        -5 => "region already exists",
        -6 => "not found",
        -7 => "message too big",
        -8 => "region or checkpoint is corrupted",
        -9 => "layout version mismatch",
        -10 => "permission denied",
        -11 => "system error",
        _ => "unknown error code",
    }
}

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, QueueError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_mapping_is_stable() {
        assert_eq!(QueueError::Empty.code(), -1);
        assert_eq!(QueueError::Full.code(), -2);
        assert_eq!(QueueError::NoMem { max: 16 }.code(), -3);
        assert_eq!(QueueError::Invalid { reason: "x" }.code(), -4);
        assert_eq!(QueueError::Exists.code(), -5);
        assert_eq!(QueueError::NotFound.code(), -6);
        assert_eq!(
            QueueError::TooBig {
                required: 1,
                available: 0
            }
            .code(),
            -7
        );
        assert_eq!(QueueError::Corrupted.code(), -8);
        assert_eq!(QueueError::Version { found: 2 }.code(), -9);
        assert_eq!(QueueError::Permission.code(), -10);
        assert_eq!(
            QueueError::Sys(io::Error::new(io::ErrorKind::Other, "boom")).code(),
            -11
        );
    }

    #[test]
    fn test_strerror_roundtrip() {
        for code in -11..=0 {
            assert_ne!(strerror(code), "unknown error code");
        }
        assert_eq!(strerror(-99), "unknown error code");
    }
}
