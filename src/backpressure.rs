//! Opt-in blocking wrappers around the non-blocking push, plus watermark
//! hooks. Nothing in the core protocol sleeps; these helpers loop on
//! `Full` with a bounded spin phase and an ascending sleep ladder.

use std::thread;
use std::time::{Duration, Instant};

use crossbeam_utils::Backoff;

use crate::ring::Queue;
use crate::{QueueError, Result};

/// Longest single sleep inside [`Queue::push_wait`].
const MAX_WAIT_SLEEP: Duration = Duration::from_millis(1);

/// First sleep inside [`Queue::push_wait`] once spinning is exhausted.
const INITIAL_WAIT_SLEEP: Duration = Duration::from_micros(10);

/// Longest delay [`Queue::push_backoff`] will double up to.
const MAX_BACKOFF_DELAY: Duration = Duration::from_millis(100);

/// Hook invoked with the fill percentage when a watermark is crossed.
pub type WatermarkHook = Box<dyn FnMut(u8) + Send>;

/// Watermark configuration, local to the producer handle.
pub struct Backpressure {
    high: u8,
    low: u8,
    on_high: Option<WatermarkHook>,
    on_low: Option<WatermarkHook>,
    /// Last observed side of the high watermark, for edge detection.
    above: bool,
}

impl Queue {
    /// Installs watermark thresholds and optional crossing hooks.
    ///
    /// `on_high` fires when the fill level rises to `high` percent or
    /// more; `on_low` fires when it later falls back to `low` or less.
    /// The pair must satisfy `low < high <= 100`.
    pub fn set_backpressure(
        &mut self,
        high: u8,
        low: u8,
        on_high: Option<WatermarkHook>,
        on_low: Option<WatermarkHook>,
    ) -> Result<()> {
        if low >= high || high > 100 {
            return Err(QueueError::Invalid {
                reason: "watermarks must satisfy low < high <= 100",
            });
        }
        self.backpressure = Some(Backpressure {
            high,
            low,
            on_high,
            on_low,
            above: false,
        });
        Ok(())
    }

    /// Edge-detects watermark crossings after a successful publish or a
    /// blocking-push round. No-op unless backpressure is configured.
    pub(crate) fn watermark_tick(&mut self) {
        if self.backpressure.is_none() {
            return;
        }
        let fill = self.fill_level();
        if let Some(bp) = self.backpressure.as_mut() {
            if !bp.above && fill >= bp.high {
                bp.above = true;
                if let Some(hook) = bp.on_high.as_mut() {
                    hook(fill);
                }
            } else if bp.above && fill <= bp.low {
                bp.above = false;
                if let Some(hook) = bp.on_low.as_mut() {
                    hook(fill);
                }
            }
        }
    }

    /// Pushes, waiting for space up to `timeout`.
    ///
    /// `Some(Duration::ZERO)` is a single non-blocking attempt; `None`
    /// waits forever. The wait spins briefly with CPU pauses, then sleeps
    /// with a doubling delay capped at 1 ms, and returns `Full` exactly
    /// when the deadline elapses. Errors other than `Full` surface
    /// immediately.
    pub fn push_wait(&mut self, data: &[u8], timeout: Option<Duration>) -> Result<()> {
        let deadline = match timeout {
            Some(t) if t.is_zero() => return self.push(data),
            Some(t) => Some(Instant::now() + t),
            None => None,
        };

        let backoff = Backoff::new();
        let mut sleep = INITIAL_WAIT_SLEEP;
        loop {
            match self.push(data) {
                Err(QueueError::Full) => {}
                other => return other,
            }

            let remaining = match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return Err(QueueError::Full);
                    }
                    Some(d - now)
                }
                None => None,
            };

            if backoff.is_completed() {
                let nap = remaining.map_or(sleep, |r| sleep.min(r));
                thread::sleep(nap);
                sleep = (sleep * 2).min(MAX_WAIT_SLEEP);
            } else {
                backoff.snooze();
            }
        }
    }

    /// Pushes, retrying on `Full` with exponentially growing sleeps.
    ///
    /// Sleeps `base_delay` after the first `Full`, doubling up to 100 ms
    /// per retry. Gives up with `Full` after `max_retries` retries;
    /// 0 retries forever.
    pub fn push_backoff(
        &mut self,
        data: &[u8],
        max_retries: u32,
        base_delay: Duration,
    ) -> Result<()> {
        let mut delay = base_delay.min(MAX_BACKOFF_DELAY);
        let mut retries = 0u32;
        loop {
            match self.push(data) {
                Err(QueueError::Full) => {}
                other => return other,
            }

            retries += 1;
            if max_retries != 0 && retries > max_retries {
                return Err(QueueError::Full);
            }
            thread::sleep(delay);
            delay = (delay * 2).min(MAX_BACKOFF_DELAY);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::QueueConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn scratch_name(tag: &str) -> String {
        format!("/shmring-bp-{tag}-{}", std::process::id())
    }

    #[test]
    fn test_watermark_pair_validated() {
        let name = scratch_name("validate");
        let mut queue = Queue::create(&name, QueueConfig::new(4, 64, false)).unwrap();

        assert!(matches!(
            queue.set_backpressure(50, 50, None, None),
            Err(QueueError::Invalid { .. })
        ));
        assert!(matches!(
            queue.set_backpressure(101, 10, None, None),
            Err(QueueError::Invalid { .. })
        ));
        assert!(queue.set_backpressure(75, 25, None, None).is_ok());

        drop(queue);
        Queue::unlink(&name).unwrap();
    }

    #[test]
    fn test_high_watermark_fires_once_per_crossing() {
        let name = scratch_name("hook");
        let mut queue = Queue::create(&name, QueueConfig::new(4, 64, false)).unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let hook_count = Arc::clone(&fired);
        queue
            .set_backpressure(
                75,
                25,
                Some(Box::new(move |_fill| {
                    hook_count.fetch_add(1, Ordering::SeqCst);
                })),
                None,
            )
            .unwrap();

        for _ in 0..4 {
            queue.push(b"m").unwrap();
        }
        // 4/4 slots crossed the 75% line exactly once.
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        drop(queue);
        Queue::unlink(&name).unwrap();
    }

    #[test]
    fn test_push_wait_zero_timeout_is_nonblocking() {
        let name = scratch_name("wait");
        let mut queue = Queue::create(&name, QueueConfig::new(2, 64, false)).unwrap();

        queue.push(b"a").unwrap();
        queue.push(b"b").unwrap();
        assert!(matches!(
            queue.push_wait(b"c", Some(Duration::ZERO)),
            Err(QueueError::Full)
        ));

        drop(queue);
        Queue::unlink(&name).unwrap();
    }

    #[test]
    fn test_push_wait_deadline_elapses() {
        let name = scratch_name("deadline");
        let mut queue = Queue::create(&name, QueueConfig::new(2, 64, false)).unwrap();

        queue.push(b"a").unwrap();
        queue.push(b"b").unwrap();

        let start = Instant::now();
        let result = queue.push_wait(b"c", Some(Duration::from_millis(20)));
        assert!(matches!(result, Err(QueueError::Full)));
        assert!(start.elapsed() >= Duration::from_millis(20));

        drop(queue);
        Queue::unlink(&name).unwrap();
    }

    #[test]
    fn test_push_backoff_gives_up() {
        let name = scratch_name("backoff");
        let mut queue = Queue::create(&name, QueueConfig::new(2, 64, false)).unwrap();

        queue.push(b"a").unwrap();
        queue.push(b"b").unwrap();
        assert!(matches!(
            queue.push_backoff(b"c", 2, Duration::from_micros(100)),
            Err(QueueError::Full)
        ));

        drop(queue);
        Queue::unlink(&name).unwrap();
    }
}
