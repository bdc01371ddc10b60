//! Queue module: naming, codec, pending queues, expiration queues and GC.
//!
//! # 構成
//! - naming: (provisionerId, workerType, priority) からキュー名を決める
//! - codec: JSON + base64
//! - pending: 優先度ごとに shard された pending キュー（PendingQueueManager）
//! - expiration: claim / deadline / resolved の共有キュー（ExpirationQueues）
//! - gc: 使われなくなった pending キューの削除

mod cache;
pub mod codec;
mod expiration;
mod gc;
mod lease;
pub mod naming;
mod pending;

pub use expiration::{ExpirationQueueKind, ExpirationQueues};
pub use lease::{ExpirationMessage, PendingTaskHint};
pub use pending::{FamilyKey, PendingQueueManager, PendingQueuePoller, QueueFamily, QueueMetadata};

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use crate::domain::{QueueError, QueueResult};
use crate::impls::TracingErrorReporter;
use crate::ports::{Clock, ErrorReporter, IdGenerator, PrimitiveError, QueuePrimitiveClient, UlidGenerator};

/// primitive 呼び出しのデフォルトのタイムアウト
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// primitive 呼び出しを timeout 付きで実行し、QueueError に変換する
pub(crate) async fn call_primitive<T>(
    timeout: Duration,
    call: impl Future<Output = Result<T, PrimitiveError>>,
) -> QueueResult<T> {
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result.map_err(QueueError::from),
        Err(_elapsed) => Err(PrimitiveError::Timeout.into()),
    }
}

/// target までの残り秒数（切り上げ、最小 1）。すでに過ぎていれば None
pub(crate) fn remaining_secs(target: DateTime<Utc>, now: DateTime<Utc>) -> Option<u64> {
    let remaining_ms = (target - now).num_milliseconds();
    if remaining_ms <= 0 {
        return None;
    }
    let secs = (remaining_ms as u64).div_ceil(1000);
    Some(secs.max(1))
}

/// 可視化までの遅延（過去の時刻なら 1 秒）
pub(crate) fn delay_secs(target: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    remaining_secs(target, now).unwrap_or(1)
}

/// pending / expiration が共有する依存一式
#[derive(Clone)]
pub struct QueueContext {
    pub(crate) client: Arc<dyn QueuePrimitiveClient>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) ids: Arc<dyn IdGenerator>,
    pub(crate) reporter: Arc<dyn ErrorReporter>,
    pub(crate) request_timeout: Duration,
    shutdown: watch::Receiver<bool>,
}

impl QueueContext {
    /// ids は clock ベースの ULID、報告先は tracing、shutdown は発火しない
    pub fn new(client: Arc<dyn QueuePrimitiveClient>, clock: Arc<dyn Clock>) -> Self {
        let (_never, shutdown) = watch::channel(false);
        Self {
            client,
            ids: Arc::new(UlidGenerator::new(clock.clone())),
            clock,
            reporter: Arc::new(TracingErrorReporter),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            shutdown,
        }
    }

    pub fn with_ids(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub(crate) async fn call<T>(
        &self,
        call: impl Future<Output = Result<T, PrimitiveError>>,
    ) -> QueueResult<T> {
        call_primitive(self.request_timeout, call).await
    }

    /// shutdown が来たら `Cancelled` で打ち切る
    pub(crate) async fn cancellable<T>(&self, work: impl Future<Output = QueueResult<T>>) -> QueueResult<T> {
        let cancelled = || QueueError::cancelled("queue service is shutting down");
        if *self.shutdown.borrow() {
            return Err(cancelled());
        }
        let mut shutdown = self.shutdown.clone();
        let stopped = async move {
            // sender が drop されただけならキャンセル扱いにしない
            if shutdown.wait_for(|stop| *stop).await.is_err() {
                std::future::pending::<()>().await;
            }
        };
        tokio::select! {
            biased;
            _ = stopped => Err(cancelled()),
            result = work => result,
        }
    }
}
