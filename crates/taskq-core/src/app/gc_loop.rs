//! GcLoop - 使われなくなった pending キューの定期削除
//!
//! # フロー
//! 1. interval ごとに `delete_unused_worker_queues(now)` を呼ぶ
//! 2. 失敗はログに残して次の周期を待つ（ループは止めない）
//! 3. shutdown が来たら sweep の途中でも抜ける

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{error, info};

use crate::domain::QueueResult;
use crate::queue::PendingQueueManager;

pub struct GcLoop {
    manager: PendingQueueManager,
    interval: Duration,
}

impl GcLoop {
    pub fn new(manager: PendingQueueManager, interval: Duration) -> Self {
        Self { manager, interval }
    }

    /// 1 回分の sweep
    pub async fn run_once(&self) -> QueueResult<usize> {
        let now = self.manager.ctx.clock.now();
        self.manager.delete_unused_worker_queues(now).await
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
                    // sender が消えたら止める
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                _ = ticker.tick() => {}
            }

            tokio::select! {
                _ = shutdown_rx.changed() => break,
                result = self.run_once() => match result {
                    Ok(deleted) => info!(deleted, "gc loop pass finished"),
                    Err(err) => error!(error = %err, "gc loop pass failed"),
                },
            }
        }
        info!("gc loop stopped");
    }
}
