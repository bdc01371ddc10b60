//! QueueService - pending / expiration キューとバックグラウンドタスクの束
//!
//! - `spawn_background()` で GcLoop と CacheResetLoop を起動する
//! - `shutdown()` でループと進行中の ensure を止め、タスクの終了を待つ

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::QueueSettings;
use crate::queue::{ExpirationQueues, PendingQueueManager};

use super::{CacheResetLoop, GcLoop};

pub struct QueueService {
    pending: PendingQueueManager,
    expiration: ExpirationQueues,
    settings: QueueSettings,
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl QueueService {
    pub(crate) fn new(
        pending: PendingQueueManager,
        expiration: ExpirationQueues,
        settings: QueueSettings,
        shutdown_tx: watch::Sender<bool>,
    ) -> Self {
        Self {
            pending,
            expiration,
            settings,
            shutdown_tx,
            joins: Vec::new(),
        }
    }

    pub fn pending(&self) -> &PendingQueueManager {
        &self.pending
    }

    pub fn expiration(&self) -> &ExpirationQueues {
        &self.expiration
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    /// GC と キャッシュリセットのループを起動する（2 回呼んでも 1 組だけ）
    pub fn spawn_background(&mut self) {
        if !self.joins.is_empty() {
            return;
        }
        let gc = GcLoop::new(self.pending.clone(), self.settings.gc_interval);
        let reset = CacheResetLoop::new(self.pending.clone(), self.settings.cache_reset_interval);
        self.joins.push(tokio::spawn(gc.run(self.shutdown_tx.subscribe())));
        self.joins.push(tokio::spawn(reset.run(self.shutdown_tx.subscribe())));
        info!(
            gc_interval_secs = self.settings.gc_interval.as_secs(),
            cache_reset_interval_secs = self.settings.cache_reset_interval.as_secs(),
            "background loops started"
        );
    }

    /// 進行中の ensure は `Cancelled` で終わる
    pub fn request_shutdown(&self) {
        // receiver がいなくても構わない
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown(self) {
        self.request_shutdown();
        for join in self.joins {
            let _ = join.await;
        }
        info!("queue service stopped");
    }
}
