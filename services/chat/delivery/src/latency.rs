//! Rolling round-trip latency window for the adaptive ack timeout.

use std::collections::VecDeque;
use std::time::Duration;

/// Samples retained in the rolling window
pub const WINDOW_SIZE: usize = 50;

/// Ack timeout floor
pub const ACK_TIMEOUT_MIN: Duration = Duration::from_secs(2);

/// Ack timeout ceiling
pub const ACK_TIMEOUT_MAX: Duration = Duration::from_secs(20);

/// Timeout used before any sample exists
const ACK_TIMEOUT_DEFAULT: Duration = Duration::from_secs(10);

/// Rolling window of send-to-ack round trips.
///
/// The ack deadline for a message is twice the window average, clamped to
/// [2s, 20s], so a fast link times out quickly while a slow one is given
/// room before a retry fires.
#[derive(Debug)]
pub struct LatencyWindow {
    samples: VecDeque<Duration>,
    sum: Duration,
}

impl LatencyWindow {
    /// Create an empty window
    pub fn new() -> Self {
        Self {
            samples: VecDeque::with_capacity(WINDOW_SIZE),
            sum: Duration::ZERO,
        }
    }

    /// Record one round trip, evicting the oldest sample at capacity
    pub fn record(&mut self, rtt: Duration) {
        if self.samples.len() == WINDOW_SIZE {
            if let Some(oldest) = self.samples.pop_front() {
                self.sum = self.sum.saturating_sub(oldest);
            }
        }
        self.samples.push_back(rtt);
        self.sum += rtt;
    }

    /// Average round trip over the window, if any samples exist
    pub fn average(&self) -> Option<Duration> {
        if self.samples.is_empty() {
            None
        } else {
            Some(self.sum / self.samples.len() as u32)
        }
    }

    /// The adaptive ack timeout for the next send
    pub fn ack_timeout(&self) -> Duration {
        match self.average() {
            Some(avg) => (avg * 2).clamp(ACK_TIMEOUT_MIN, ACK_TIMEOUT_MAX),
            None => ACK_TIMEOUT_DEFAULT,
        }
    }

    /// Number of samples currently held
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the window is empty
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

impl Default for LatencyWindow {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_before_samples() {
        let window = LatencyWindow::new();
        assert_eq!(window.ack_timeout(), ACK_TIMEOUT_DEFAULT);
    }

    #[test]
    fn test_fast_link_clamps_to_floor() {
        let mut window = LatencyWindow::new();
        for _ in 0..10 {
            window.record(Duration::from_millis(100));
        }
        // 2 * 100ms is far below the floor
        assert_eq!(window.ack_timeout(), ACK_TIMEOUT_MIN);
    }

    #[test]
    fn test_slow_link_clamps_to_ceiling() {
        let mut window = LatencyWindow::new();
        for _ in 0..10 {
            window.record(Duration::from_secs(30));
        }
        assert_eq!(window.ack_timeout(), ACK_TIMEOUT_MAX);
    }

    #[test]
    fn test_timeout_tracks_average() {
        let mut window = LatencyWindow::new();
        for _ in 0..10 {
            window.record(Duration::from_secs(3));
        }
        assert_eq!(window.ack_timeout(), Duration::from_secs(6));
    }

    #[test]
    fn test_window_evicts_oldest() {
        let mut window = LatencyWindow::new();
        for _ in 0..WINDOW_SIZE {
            window.record(Duration::from_secs(30));
        }
        // Push the slow samples out with fast ones
        for _ in 0..WINDOW_SIZE {
            window.record(Duration::from_millis(100));
        }
        assert_eq!(window.len(), WINDOW_SIZE);
        assert_eq!(window.ack_timeout(), ACK_TIMEOUT_MIN);
    }
}
