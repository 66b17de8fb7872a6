use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::db::backend::MqClient;
use crate::error::DbError;
use crate::snowflake::now_ms;

/// Messages older than this are dropped from the local queue; a client that
/// cannot keep up observes a warning instead of unbounded growth.
const BACKLOG_MS: i64 = 120_000;

/// Batches delivered to `get_updates` are spaced at this frequency, which
/// also coalesces repeated notifications of the same channel.
const UPDATE_FREQUENCY: f64 = 10.0;

struct PullQueue {
    entries: VecDeque<(i64, String)>,
    seen: HashSet<String>,
}

/// Notification consumer over the engine's broadcast stream. One per client
/// connection; `pull` runs on its own task, `get_updates` on another.
pub struct MemMqClient {
    rx: tokio::sync::Mutex<broadcast::Receiver<String>>,
    subscribed: Mutex<HashSet<String>>,
    queue: Mutex<PullQueue>,
}

impl MemMqClient {
    pub fn new(rx: broadcast::Receiver<String>) -> Self {
        MemMqClient {
            rx: tokio::sync::Mutex::new(rx),
            subscribed: Mutex::new(HashSet::new()),
            queue: Mutex::new(PullQueue {
                entries: VecDeque::new(),
                seen: HashSet::new(),
            }),
        }
    }

    fn interval() -> Duration {
        Duration::from_secs_f64(1.0 / UPDATE_FREQUENCY)
    }
}

#[async_trait]
impl MqClient for MemMqClient {
    async fn subscribe(&self, channel: &str) -> Result<(), DbError> {
        self.subscribed.lock().insert(channel.to_owned());
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), DbError> {
        self.subscribed.lock().remove(channel);
        Ok(())
    }

    async fn pull(&self) -> Result<(), DbError> {
        let msg = {
            let mut rx = self.rx.lock().await;
            match rx.recv().await {
                Ok(msg) => msg,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("[mq] consumer lagged, {n} notifications lost");
                    return Ok(());
                }
                Err(broadcast::error::RecvError::Closed) => {
                    // Engine gone; nothing more will arrive.
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    return Ok(());
                }
            }
        };
        if !self.subscribed.lock().contains(&msg) {
            return Ok(());
        }
        let now = now_ms();
        let mut q = self.queue.lock();
        let mut dropped = 0usize;
        while let Some((ts, _)) = q.entries.front() {
            if now - ts <= BACKLOG_MS {
                break;
            }
            let (_, chan) = q.entries.pop_front().unwrap_or_default();
            q.seen.remove(&chan);
            dropped += 1;
        }
        if dropped > 0 {
            log::warn!("[mq] backlog too old, dropped {dropped} notifications");
        }
        if !q.seen.contains(&msg) {
            q.seen.insert(msg.clone());
            q.entries.push_back((now, msg));
        }
        Ok(())
    }

    async fn get_message(&self) -> Result<HashSet<String>, DbError> {
        let interval = Self::interval();
        let interval_ms = interval.as_millis() as i64;
        loop {
            {
                let mut q = self.queue.lock();
                let cutoff = now_ms() - interval_ms;
                let mut batch = HashSet::new();
                while let Some((ts, _)) = q.entries.front() {
                    if *ts > cutoff {
                        break;
                    }
                    if let Some((_, chan)) = q.entries.pop_front() {
                        q.seen.remove(&chan);
                        batch.insert(chan);
                    }
                }
                if !batch.is_empty() {
                    return Ok(batch);
                }
            }
            tokio::time::sleep(interval).await;
        }
    }
}
