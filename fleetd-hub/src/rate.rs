use std::collections::VecDeque;

/// Sliding-window counter over message arrivals. Times are epoch
/// milliseconds; arrivals older than the horizon are trimmed on every
/// record and every read.
#[derive(Debug)]
pub struct RateWindow {
    window_ms: u64,
    arrivals: VecDeque<i64>,
}

impl RateWindow {
    pub fn new(window_ms: u64) -> Self {
        Self { window_ms, arrivals: VecDeque::new() }
    }

    pub fn window_ms(&self) -> u64 {
        self.window_ms
    }

    pub fn record(&mut self, now_ms: i64) {
        self.trim(now_ms);
        self.arrivals.push_back(now_ms);
    }

    /// Messages per second over the window; 0 when empty.
    pub fn rate(&mut self, now_ms: i64) -> f64 {
        self.trim(now_ms);
        if self.arrivals.is_empty() || self.window_ms == 0 {
            return 0.0;
        }
        self.arrivals.len() as f64 / (self.window_ms as f64 / 1000.0)
    }

    fn trim(&mut self, now_ms: i64) {
        let cutoff = now_ms - self.window_ms as i64;
        while self.arrivals.front().is_some_and(|t| *t < cutoff) {
            self.arrivals.pop_front();
        }
    }
}
