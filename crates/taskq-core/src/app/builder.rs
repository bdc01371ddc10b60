//! AppBuilder - QueueService の構築とワイヤリング
//!
//! # 学習ポイント
//! - Builder パターンの実装
//! - 起動時検証（Fail-fast 設計）
//! - 依存の差し替え（テストでは InMemoryQueueClient + FixedClock）

use std::sync::Arc;

use tokio::sync::watch;

use crate::config::{QueueBackend, QueueSettings};
use crate::domain::QueueError;
use crate::impls::{HttpQueueClient, InMemoryQueueClient};
use crate::ports::{Clock, ErrorReporter, IdGenerator, PrimitiveError, QueuePrimitiveClient, SystemClock};
use crate::queue::{ExpirationQueues, PendingQueueManager, QueueContext};

use super::QueueService;

/// AppBuilder は QueueService を構築
///
/// # 使用例
/// ```ignore
/// let mut service = AppBuilder::new(config.queue_settings()?)
///     .with_clock(clock)
///     .build()?;
/// service.spawn_background();
/// ```
///
/// # Fail-fast 設計
/// - build() 時に設定を検証する（prefix、キュー名、GC prefix との衝突）
/// - client を渡さなければ設定の backend から作る
pub struct AppBuilder {
    settings: QueueSettings,
    client: Option<Arc<dyn QueuePrimitiveClient>>,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
    reporter: Option<Arc<dyn ErrorReporter>>,
}

/// BuildError は QueueService 構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("invalid queue settings: {0}")]
    InvalidSettings(#[source] QueueError),

    #[error("failed to create queue client: {0}")]
    Client(#[source] PrimitiveError),
}

impl AppBuilder {
    pub fn new(settings: QueueSettings) -> Self {
        Self {
            settings,
            client: None,
            clock: None,
            ids: None,
            reporter: None,
        }
    }

    pub fn with_client(mut self, client: Arc<dyn QueuePrimitiveClient>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn with_error_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn build(self) -> Result<QueueService, BuildError> {
        let settings = self.settings;
        settings.validate().map_err(BuildError::InvalidSettings)?;

        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let client: Arc<dyn QueuePrimitiveClient> = match self.client {
            Some(client) => client,
            None => match settings.backend {
                QueueBackend::Memory => Arc::new(InMemoryQueueClient::new(clock.clone())),
                QueueBackend::Http => Arc::new(
                    HttpQueueClient::new(
                        &settings.endpoint,
                        settings.access_token.clone(),
                        settings.request_timeout,
                    )
                    .map_err(BuildError::Client)?,
                ),
            },
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut ctx = QueueContext::new(client, clock)
            .with_request_timeout(settings.request_timeout)
            .with_shutdown(shutdown_rx);
        if let Some(ids) = self.ids {
            ctx = ctx.with_ids(ids);
        }
        if let Some(reporter) = self.reporter {
            ctx = ctx.with_reporter(reporter);
        }

        let pending =
            PendingQueueManager::new(ctx.clone(), settings.prefix.clone()).map_err(BuildError::InvalidSettings)?;
        let expiration = ExpirationQueues::new(
            ctx,
            settings.claim_queue.clone(),
            settings.deadline_queue.clone(),
            settings.resolved_queue.clone(),
        )
        .map_err(BuildError::InvalidSettings)?
        .with_deadline_delay(settings.deadline_delay);

        Ok(QueueService::new(pending, expiration, settings, shutdown_tx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use chrono::{TimeZone, Utc};

    use crate::domain::{ErrorKind, Priority, ProvisionerId, Resolution, TaskId, TaskRef, WorkerType};
    use crate::impls::CollectingErrorReporter;
    use crate::ports::FixedClock;

    fn clock() -> Arc<FixedClock> {
        Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap()))
    }

    #[test]
    fn test_build_rejects_invalid_settings() {
        let settings = QueueSettings {
            claim_queue: "pq-claim".to_string(),
            ..QueueSettings::default()
        };
        let result = AppBuilder::new(settings).build();
        assert!(matches!(
            result,
            Err(BuildError::InvalidSettings(err)) if err.kind() == ErrorKind::Validation
        ));
    }

    #[test]
    fn test_build_rejects_bad_endpoint() {
        let settings = QueueSettings {
            backend: QueueBackend::Http,
            endpoint: "not a url".to_string(),
            ..QueueSettings::default()
        };
        assert!(matches!(
            AppBuilder::new(settings).build(),
            Err(BuildError::Client(PrimitiveError::InvalidEndpoint(_)))
        ));
    }

    #[tokio::test]
    async fn test_built_service_wires_both_managers() {
        let clock = clock();
        let client = InMemoryQueueClient::new(clock.clone());
        let reporter = Arc::new(CollectingErrorReporter::new());
        let service = AppBuilder::new(QueueSettings::default())
            .with_client(Arc::new(client.clone()))
            .with_clock(clock.clone())
            .with_error_reporter(reporter.clone())
            .build()
            .unwrap();

        let p = ProvisionerId::new("p").unwrap();
        let w = WorkerType::new("w").unwrap();
        let task = TaskRef::new(
            TaskId::new("t1"),
            p.clone(),
            w.clone(),
            clock.now() + chrono::Duration::hours(1),
            Priority::Medium,
        );
        service.pending().put_pending_message(&task, 0).await.unwrap();
        service
            .expiration()
            .put_resolved_message(&task.task_id, "g", "s", Resolution::Completed)
            .await
            .unwrap();

        assert_eq!(service.pending().count_pending_messages(&p, &w).await.unwrap(), 1);
        assert_eq!(service.expiration().poll_resolved_queue().await.unwrap().len(), 1);
        assert!(client.queue_exists("tq-resolved").await);
        assert!(reporter.reported().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_stops_loops_and_cancels_ensures() {
        let clock = clock();
        let settings = QueueSettings {
            gc_interval: Duration::from_millis(5),
            cache_reset_interval: Duration::from_millis(5),
            ..QueueSettings::default()
        };
        let mut service = AppBuilder::new(settings).with_clock(clock).build().unwrap();
        service.spawn_background();
        service.spawn_background();

        let pending = service.pending().clone();
        service.request_shutdown();
        let err = pending
            .ensure_pending_queue_family(&ProvisionerId::new("p").unwrap(), &WorkerType::new("w").unwrap())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);

        tokio::time::timeout(Duration::from_secs(5), service.shutdown())
            .await
            .unwrap();
    }
}
