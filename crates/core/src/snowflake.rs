//! Snowflake id generation.
//!
//! 64-bit ids packed as: sign bit (0) | 41-bit ms timestamp since a custom
//! epoch | 10-bit worker id | 12-bit sequence. The worker id comes from the
//! backend's [`WorkerKeeper`](crate::db::backend::WorkerKeeper) lease; the
//! keeper also persists the last-seen wall clock so a restart after an NTP
//! backwards jump cannot repeat timestamps.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::db::backend::WorkerKeeper;
use crate::error::DbError;

/// 2025-12-18 03:33:20 +0800.
pub const EPOCH_MS: i64 = 1_766_000_000_000;

pub const WORKER_ID_BITS: u32 = 10;
pub const SEQUENCE_BITS: u32 = 12;
pub const MAX_WORKER_ID: u32 = (1 << WORKER_ID_BITS) - 1;
const SEQUENCE_MASK: i64 = (1 << SEQUENCE_BITS) - 1;
const WORKER_ID_SHIFT: u32 = SEQUENCE_BITS;
const TIMESTAMP_SHIFT: u32 = SEQUENCE_BITS + WORKER_ID_BITS;

/// How often [`keep_alive_task`] renews the lease and persists the clock.
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(5);

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

struct GenState {
    last_timestamp: i64,
    sequence: i64,
}

/// Process-local generator; owned by one worker, accessed only on its loop.
pub struct SnowflakeId {
    worker_id: u32,
    state: Mutex<GenState>,
}

impl SnowflakeId {
    /// `initial_timestamp` should be the keeper's
    /// `max(now, persisted last timestamp)` so short clock regressions across
    /// restarts cannot produce duplicates.
    pub fn new(worker_id: u32, initial_timestamp: i64) -> Self {
        assert!(worker_id <= MAX_WORKER_ID);
        SnowflakeId {
            worker_id,
            state: Mutex::new(GenState {
                last_timestamp: initial_timestamp.max(now_ms()),
                sequence: 0,
            }),
        }
    }

    pub fn from_keeper(keeper: &dyn WorkerKeeper) -> Result<Self, DbError> {
        let worker_id = keeper.acquire()?;
        Ok(Self::new(worker_id, keeper.initial_timestamp()))
    }

    pub fn worker_id(&self) -> u32 {
        self.worker_id
    }

    pub fn last_timestamp(&self) -> i64 {
        self.state.lock().last_timestamp
    }

    pub async fn next_id(&self) -> i64 {
        loop {
            {
                let mut s = self.state.lock();
                let mut timestamp = now_ms();
                if timestamp < s.last_timestamp {
                    log::warn!(
                        "[snowflake] clock moved back {} ms, pinning to last timestamp",
                        s.last_timestamp - timestamp
                    );
                    // Keep issuing ids in the "past" until the clock catches up.
                    timestamp = s.last_timestamp;
                }
                if timestamp == s.last_timestamp {
                    let next_seq = (s.sequence + 1) & SEQUENCE_MASK;
                    if next_seq != 0 {
                        s.sequence = next_seq;
                        return self.pack(timestamp, next_seq);
                    }
                    // 4096 ids burned in this millisecond; wait out the tick.
                } else {
                    s.last_timestamp = timestamp;
                    s.sequence = 0;
                    return self.pack(timestamp, 0);
                }
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    fn pack(&self, timestamp: i64, sequence: i64) -> i64 {
        ((timestamp - EPOCH_MS) << TIMESTAMP_SHIFT)
            | ((self.worker_id as i64) << WORKER_ID_SHIFT)
            | sequence
    }
}

/// Renews the worker-id lease every 5 s and persists the generator's last
/// timestamp (the 10 s regression tolerance requires the interval ≤ 5 s).
///
/// Returns [`DbError::WorkerLeaseLost`] if a renewal fails; the process must
/// terminate and restart to reclaim an id.
pub async fn keep_alive_task(
    keeper: Box<dyn WorkerKeeper>,
    ids: std::sync::Arc<SnowflakeId>,
    cancel: tokio_util::sync::CancellationToken,
) -> Result<(), DbError> {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                keeper.release();
                return Ok(());
            }
            _ = tokio::time::sleep(KEEP_ALIVE_INTERVAL) => {
                if let Err(e) = keeper.keep_alive(ids.last_timestamp()).await {
                    log::error!("[snowflake] worker lease renewal failed: {e}");
                    return Err(DbError::WorkerLeaseLost);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ids_are_strictly_increasing() {
        let ids = SnowflakeId::new(1, 0);
        let mut last = 0;
        for _ in 0..5000 {
            let id = ids.next_id().await;
            assert!(id > last);
            last = id;
        }
    }

    #[tokio::test]
    async fn worker_id_is_embedded() {
        let ids = SnowflakeId::new(513, 0);
        let id = ids.next_id().await;
        assert_eq!((id >> WORKER_ID_SHIFT) & MAX_WORKER_ID as i64, 513);
    }

    #[tokio::test]
    async fn clock_regression_does_not_repeat() {
        // Pin the generator 10 s into the future: every call sees a
        // "regressed" wall clock and must keep increasing regardless.
        let ids = SnowflakeId::new(1, now_ms() + 10_000);
        let a = ids.next_id().await;
        let b = ids.next_id().await;
        assert!(b > a);
    }
}
