/// Geometry requested at queue creation.
///
/// Attachers never supply a config: the region itself records its
/// geometry in the control block and the handle discovers it there.
#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    /// Number of slots. Rounded up to the next power of two at create.
    pub capacity: u64,
    /// Bytes per slot, including the 8-byte slot header.
    pub slot_size: u64,
    /// Reserve a consumer-group table past the ring for fan-out.
    pub multi_consumer: bool,
}

impl QueueConfig {
    /// Creates a configuration with explicit geometry.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0 or `slot_size` is below the 16-byte
    /// minimum (8-byte header plus at least 8 payload bytes).
    pub const fn new(capacity: u64, slot_size: u64, multi_consumer: bool) -> Self {
        assert!(capacity >= 2, "capacity must be at least 2 slots");
        assert!(
            slot_size >= MIN_SLOT_SIZE,
            "slot_size must be at least 16 bytes (header + payload)"
        );
        Self {
            capacity,
            slot_size,
            multi_consumer,
        }
    }

    /// Capacity after power-of-two normalisation.
    #[inline]
    pub const fn capacity(&self) -> u64 {
        self.capacity.next_power_of_two()
    }

    /// Index mask for slot addressing.
    #[inline]
    pub const fn mask(&self) -> u64 {
        self.capacity() - 1
    }

    /// Largest payload a single slot can carry.
    #[inline]
    pub const fn max_payload(&self) -> usize {
        (self.slot_size as usize) - crate::layout::SLOT_HEADER_SIZE
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            slot_size: DEFAULT_SLOT_SIZE,
            multi_consumer: false,
        }
    }
}

/// Default number of slots.
pub const DEFAULT_CAPACITY: u64 = 1024;

/// Default slot size in bytes (one page).
pub const DEFAULT_SLOT_SIZE: u64 = 4096;

/// Smallest slot that still carries a payload.
pub const MIN_SLOT_SIZE: u64 = 16;

/// Small-message configuration (many slots, 64-byte slots).
pub const SMALL_MESSAGE_CONFIG: QueueConfig = QueueConfig::new(4096, 64, false);

/// Fan-out configuration (page-sized slots, group table enabled).
pub const FANOUT_CONFIG: QueueConfig = QueueConfig::new(1024, 4096, true);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_rounds_to_power_of_two() {
        let config = QueueConfig::new(1000, 64, false);
        assert_eq!(config.capacity(), 1024);
        assert_eq!(config.mask(), 1023);

        let exact = QueueConfig::new(256, 64, false);
        assert_eq!(exact.capacity(), 256);
    }

    #[test]
    fn test_max_payload_excludes_header() {
        let config = QueueConfig::new(4, 64, false);
        assert_eq!(config.max_payload(), 56);
    }

    #[test]
    fn test_default_geometry() {
        let config = QueueConfig::default();
        assert_eq!(config.capacity(), 1024);
        assert_eq!(config.slot_size, 4096);
        assert!(!config.multi_consumer);
    }
}
