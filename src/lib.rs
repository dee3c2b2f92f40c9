//! shmring - Lock-Free Shared-Memory Message Queue
//!
//! A single-node, zero-copy inter-process queue backed by a POSIX
//! shared-memory region. One producer writes fixed-maximum-size messages
//! into a ring of slots; readers consume them either as a single direct
//! consumer or through independent consumer groups that each see the
//! full stream.
//!
//! # Key Features
//!
//! - 256-byte control block with head and tail on separate cache lines
//! - Acquire/release publication protocol, no locks and no fences
//! - Zero-copy reserve/commit (producer) and peek/release (consumer)
//! - Up to 16 consumer groups with independent cursors and min-tail
//!   reclamation
//! - Read-only diagnostics, forced recovery, and checkpoint/resume
//! - Watermark hooks and bounded-wait push wrappers
//!
//! # Example
//!
//! ```no_run
//! use shmring_rs::{Queue, QueueConfig};
//!
//! let mut producer = Queue::create("/orders", QueueConfig::new(1024, 256, false))?;
//! producer.push(b"hello")?;
//!
//! // Usually in another process:
//! let mut consumer = Queue::attach("/orders")?;
//! let mut buf = [0u8; 256];
//! let len = consumer.pop(&mut buf)?;
//! assert_eq!(&buf[..len], b"hello");
//!
//! Queue::unlink("/orders")?;
//! # Ok::<(), shmring_rs::QueueError>(())
//! ```
//!
//! The region layout is a fixed wire format (see [`layout`]); any process
//! that can map the name can attach, inspect, or recover it. POSIX shared
//! memory only — Linux and the BSDs/macOS.

mod backpressure;
mod config;
mod consumer;
mod diag;
mod error;
mod invariants;
pub mod layout;
mod metrics;
mod region;
mod ring;

pub use backpressure::WatermarkHook;
pub use config::{QueueConfig, DEFAULT_CAPACITY, DEFAULT_SLOT_SIZE, FANOUT_CONFIG, MIN_SLOT_SIZE, SMALL_MESSAGE_CONFIG};
pub use consumer::{Consumer, ConsumerStats};
pub use diag::{diagnose, recover, Checkpoint, DiagReport, QueueState};
pub use error::{strerror, QueueError, Result};
pub use metrics::{throughput, Metrics, QueueStats, Snapshot};
pub use ring::Queue;
