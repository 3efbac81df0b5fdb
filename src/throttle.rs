//! Global token-bucket throughput throttle.
//!
//! Grounded on `nectar/downloaders/threaded.py`'s `_calculate_max_speed` and
//! its per-chunk sleep in `_fetch`, restructured as a single shared state
//! under one mutex (the original's throttle was per-downloader, not
//! per-domain — unlike the teacher's `RateLimiter`, which keys per domain via
//! `DashMap`; the domain-keyed structure doesn't apply here since this
//! throttle caps *aggregate* throughput across every worker).

use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{debug, instrument};

const WINDOW: Duration = Duration::from_secs(1);
const SLEEP_STEP: Duration = Duration::from_millis(500);

struct ThrottleState {
    bytes_this_second: u64,
    window_start: Instant,
}

/// Caps aggregate bytes/second across every worker sharing a downloader.
///
/// `None` ceiling (the common case, no `max_speed` configured) makes
/// [`Throttle::acquire`] a no-op.
pub struct Throttle {
    ceiling: Option<u64>,
    state: Mutex<ThrottleState>,
}

impl Throttle {
    /// Builds a throttle from the configured `max_speed` and the chunk size
    /// it will be fed. Ceiling is `max(max_speed - 2*buffer_size,
    /// 2*buffer_size)`: the subtraction compensates for measuring after the
    /// read completes, the floor avoids a ceiling of zero (or negative)
    /// wedging every worker permanently.
    #[must_use]
    pub fn new(max_speed: Option<u64>, buffer_size: usize) -> Self {
        let buffer_size = buffer_size as u64;
        let ceiling = max_speed.map(|speed| {
            let floor = 2 * buffer_size;
            speed.saturating_sub(floor).max(floor)
        });
        Self {
            ceiling,
            state: Mutex::new(ThrottleState {
                bytes_this_second: 0,
                window_start: Instant::now(),
            }),
        }
    }

    /// Registers `bytes` just read and sleeps if the current one-second
    /// window's ceiling has been exceeded. The sleep happens outside the
    /// lock so other workers can keep accounting while this one waits.
    #[instrument(skip(self))]
    pub async fn acquire(&self, bytes: u64) {
        let Some(ceiling) = self.ceiling else {
            return;
        };

        let over_ceiling = {
            let mut state = self.state.lock().await;
            let now = Instant::now();
            if now.duration_since(state.window_start) >= WINDOW {
                state.bytes_this_second = 0;
                state.window_start = now;
            }
            state.bytes_this_second += bytes;
            state.bytes_this_second >= ceiling
        };

        if over_ceiling {
            debug!(ceiling, "throttle ceiling reached, sleeping");
            tokio::time::sleep(SLEEP_STEP).await;
        }
    }
}
