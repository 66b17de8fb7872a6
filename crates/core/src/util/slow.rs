//! Slow-call aggregation for system executions.
//!
//! Keeps rolling averages of elapsed time and retry counts per system and
//! warns when a call exceeds the configured thresholds. State resets hourly
//! so the in-place averages do not drift.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::snowflake::now_ms;

pub const SLOW_TIME_THRESHOLD_SECS: f64 = 1.0;
pub const SLOW_RETRY_THRESHOLD: u32 = 5;

#[derive(Default, Clone, Copy)]
struct InplaceAverage {
    value: f64,
    size: u64,
}

impl InplaceAverage {
    fn add(&mut self, v: f64) {
        self.value = (self.value * self.size as f64 + v) / (self.size + 1) as f64;
        self.size += 1;
    }
}

#[derive(Default)]
struct SlowLogState {
    time_avg: HashMap<String, InplaceAverage>,
    retry_avg: HashMap<String, InplaceAverage>,
    last_clean_ms: i64,
}

pub struct SlowLog {
    state: Mutex<SlowLogState>,
    time_threshold: f64,
    retry_threshold: u32,
}

impl SlowLog {
    pub fn new() -> Self {
        SlowLog {
            state: Mutex::new(SlowLogState::default()),
            time_threshold: SLOW_TIME_THRESHOLD_SECS,
            retry_threshold: SLOW_RETRY_THRESHOLD,
        }
    }

    pub fn with_thresholds(time_threshold: f64, retry_threshold: u32) -> Self {
        SlowLog {
            state: Mutex::new(SlowLogState::default()),
            time_threshold,
            retry_threshold,
        }
    }

    pub fn record(&self, name: &str, elapsed_secs: f64, retries: u32) {
        let mut st = self.state.lock();
        let now = now_ms();
        if now - st.last_clean_ms > 3_600_000 {
            st.time_avg.clear();
            st.retry_avg.clear();
            st.last_clean_ms = now;
        }
        st.time_avg.entry(name.to_owned()).or_default().add(elapsed_secs);
        st.retry_avg
            .entry(name.to_owned())
            .or_default()
            .add(retries as f64);

        if elapsed_secs > self.time_threshold || retries > self.retry_threshold {
            let t_avg = st.time_avg[name].value;
            let r_avg = st.retry_avg[name].value;
            log::warn!(
                "[slowlog] {name}: {elapsed_secs:.3}s, {retries} retries \
                 (avg {t_avg:.3}s / {r_avg:.1} retries)"
            );
        }
    }

    pub fn average(&self, name: &str) -> Option<(f64, f64)> {
        let st = self.state.lock();
        Some((st.time_avg.get(name)?.value, st.retry_avg.get(name)?.value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn averages_accumulate() {
        let slow = SlowLog::new();
        slow.record("a", 1.0, 0);
        slow.record("a", 3.0, 2);
        let (t, r) = slow.average("a").unwrap();
        assert!((t - 2.0).abs() < 1e-9);
        assert!((r - 1.0).abs() < 1e-9);
    }
}
