//! CacheResetLoop - キュー存在キャッシュの定期リセット
//!
//! リセット後の最初の ensure がメタデータを読み直し、23 時間より古ければ
//! `last_used` を書き直す。使われ続けているキューが GC されないのはこのため。

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::info;

use crate::queue::PendingQueueManager;

pub struct CacheResetLoop {
    manager: PendingQueueManager,
    interval: Duration,
}

impl CacheResetLoop {
    pub fn new(manager: PendingQueueManager, interval: Duration) -> Self {
        Self { manager, interval }
    }

    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => self.manager.reset_queue_cache(),
            }
        }
        info!("cache reset loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::Utc;

    use crate::domain::{ProvisionerId, WorkerType};
    use crate::impls::InMemoryQueueClient;
    use crate::ports::FixedClock;
    use crate::queue::QueueContext;

    #[tokio::test]
    async fn reset_makes_the_next_ensure_hit_the_primitive() {
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let client = InMemoryQueueClient::new(clock.clone());
        let ctx = QueueContext::new(Arc::new(client.clone()), clock);
        let manager = PendingQueueManager::new(ctx, "pq").unwrap();
        let p = ProvisionerId::new("p").unwrap();
        let w = WorkerType::new("w").unwrap();
        manager.ensure_pending_queue_family(&p, &w).await.unwrap();
        let before = client.op_counts().await.get_metadata;

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(CacheResetLoop::new(manager.clone(), Duration::from_millis(10)).run(rx));
        tokio::time::sleep(Duration::from_millis(40)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        manager.ensure_pending_queue_family(&p, &w).await.unwrap();
        assert_eq!(client.op_counts().await.get_metadata, before + 7);
    }
}
