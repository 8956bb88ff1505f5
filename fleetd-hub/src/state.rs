use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::rate::RateWindow;

/// Process-wide operational state: ingest counters, broker connectivity,
/// the message-rate window, and the active RPC stream count. Cheap to
/// clone; all clones share the same inner state.
pub struct HubState {
    inner: Arc<Inner>,
}

struct Inner {
    total_messages: AtomicU64,
    invalid_messages: AtomicU64,
    broker_connected: AtomicBool,
    active_streams: AtomicU64,
    rate: Mutex<RateWindow>,
}

impl HubState {
    pub fn new(message_window_ms: u64) -> Self {
        Self {
            inner: Arc::new(Inner {
                total_messages: AtomicU64::new(0),
                invalid_messages: AtomicU64::new(0),
                broker_connected: AtomicBool::new(false),
                active_streams: AtomicU64::new(0),
                rate: Mutex::new(RateWindow::new(message_window_ms)),
            }),
        }
    }

    pub fn record_valid_message(&self, now_ms: i64) {
        self.inner.total_messages.fetch_add(1, Ordering::Relaxed);
        self.inner.rate.lock().unwrap_or_else(|e| e.into_inner()).record(now_ms);
    }

    pub fn record_invalid_message(&self) {
        self.inner.invalid_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total_messages(&self) -> u64 {
        self.inner.total_messages.load(Ordering::Relaxed)
    }

    pub fn invalid_messages(&self) -> u64 {
        self.inner.invalid_messages.load(Ordering::Relaxed)
    }

    pub fn message_rate_per_second(&self, now_ms: i64) -> f64 {
        self.inner.rate.lock().unwrap_or_else(|e| e.into_inner()).rate(now_ms)
    }

    pub fn window_seconds(&self) -> u64 {
        self.inner.rate.lock().unwrap_or_else(|e| e.into_inner()).window_ms() / 1000
    }

    pub fn set_broker_connected(&self, connected: bool) {
        self.inner.broker_connected.store(connected, Ordering::Relaxed);
    }

    pub fn broker_connected(&self) -> bool {
        self.inner.broker_connected.load(Ordering::Relaxed)
    }

    /// Increment the active-stream count; the returned guard decrements it
    /// exactly once when dropped.
    pub fn enter_stream(&self) -> StreamGuard {
        self.inner.active_streams.fetch_add(1, Ordering::Relaxed);
        StreamGuard { inner: self.inner.clone() }
    }

    pub fn active_streams(&self) -> u64 {
        self.inner.active_streams.load(Ordering::Relaxed)
    }
}

impl Clone for HubState {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

pub struct StreamGuard {
    inner: Arc<Inner>,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.inner.active_streams.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero() {
        let state = HubState::new(60_000);
        assert_eq!(state.total_messages(), 0);
        assert_eq!(state.invalid_messages(), 0);
        assert!(!state.broker_connected());
        assert_eq!(state.active_streams(), 0);
    }

    #[test]
    fn valid_and_invalid_counters_are_independent() {
        let state = HubState::new(60_000);
        state.record_valid_message(1_000);
        state.record_valid_message(2_000);
        state.record_invalid_message();
        assert_eq!(state.total_messages(), 2);
        assert_eq!(state.invalid_messages(), 1);
    }

    #[test]
    fn stream_guard_decrements_exactly_once() {
        let state = HubState::new(60_000);
        let guard = state.enter_stream();
        assert_eq!(state.active_streams(), 1);
        drop(guard);
        assert_eq!(state.active_streams(), 0);
    }
}
