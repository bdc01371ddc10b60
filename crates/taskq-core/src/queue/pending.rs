//! Pending queue manager.
//!
//! (provisionerId, workerType) ごとに 7 本（優先度ごと）の pending キューを持つ。
//! キューの存在とメタデータの鮮度はプロセス内でキャッシュし、
//! CacheResetLoop が定期的に捨てることでメタデータの `last_used` を更新させる。
//!
//! # 保証
//! - 同じ key の ensure は同時に 1 つしか走らない（single flight）
//! - 失敗した ensure はキャッシュに残らない
//! - 期限切れのタスクは publish しない

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{join_all, try_join_all};
use tracing::{debug, info, warn};

use crate::domain::{
    ErrorKind, PendingMessage, Priority, ProvisionerId, QueueError, QueueResult, TaskRef, WorkerType,
};
use crate::ports::{GetOptions, MAX_MESSAGES_PER_GET, Metadata, PutOptions};

use super::cache::{CountCache, CountLookup, SingleFlightCache};
use super::lease::{MessageReceipt, PendingTaskHint};
use super::naming::{shard_name, validate_prefix};
use super::{QueueContext, codec, remaining_secs};

/// pending キューから受け取ったメッセージの lease
const POLL_LEASE: Duration = Duration::from_secs(5 * 60);

/// これより古い `last_used` は ensure 時に書き直す
fn metadata_refresh_age() -> chrono::Duration {
    chrono::Duration::hours(23)
}

/// count キャッシュの有効期間
fn count_cache_max_age() -> chrono::Duration {
    chrono::Duration::seconds(20)
}

const META_PROVISIONER_ID: &str = "provisioner_id";
const META_WORKER_TYPE: &str = "worker_type";
const META_LAST_USED: &str = "last_used";

/// キャッシュの key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FamilyKey {
    pub provisioner_id: ProvisionerId,
    pub worker_type: WorkerType,
}

impl FamilyKey {
    pub fn new(provisioner_id: &ProvisionerId, worker_type: &WorkerType) -> Self {
        Self {
            provisioner_id: provisioner_id.clone(),
            worker_type: worker_type.clone(),
        }
    }
}

/// 1 つの (provisionerId, workerType) に属する 7 本のキュー名
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueFamily {
    // Priority::ALL と同じ順（highest が先頭）
    names: Vec<String>,
}

impl QueueFamily {
    pub fn new(prefix: &str, provisioner_id: &ProvisionerId, worker_type: &WorkerType) -> Self {
        let names = Priority::ALL
            .iter()
            .map(|&priority| shard_name(prefix, provisioner_id, worker_type, priority))
            .collect();
        Self { names }
    }

    pub fn name(&self, priority: Priority) -> &str {
        &self.names[priority.index()]
    }

    /// highest から lowest の順
    pub fn iter(&self) -> impl Iterator<Item = (Priority, &str)> {
        Priority::ALL
            .iter()
            .copied()
            .zip(self.names.iter().map(String::as_str))
    }
}

/// pending キューに付けるメタデータ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMetadata {
    pub provisioner_id: String,
    pub worker_type: String,
    pub last_used: DateTime<Utc>,
}

impl QueueMetadata {
    pub fn to_metadata(&self) -> Metadata {
        Metadata::from([
            (META_PROVISIONER_ID.to_string(), self.provisioner_id.clone()),
            (META_WORKER_TYPE.to_string(), self.worker_type.clone()),
            (META_LAST_USED.to_string(), self.last_used.to_rfc3339()),
        ])
    }

    /// 必須フィールドが欠けている・壊れているときは None
    pub fn from_metadata(metadata: &Metadata) -> Option<Self> {
        let provisioner_id = metadata.get(META_PROVISIONER_ID)?;
        let worker_type = metadata.get(META_WORKER_TYPE)?;
        let last_used = DateTime::parse_from_rfc3339(metadata.get(META_LAST_USED)?).ok()?;
        Some(Self {
            provisioner_id: provisioner_id.clone(),
            worker_type: worker_type.clone(),
            last_used: last_used.with_timezone(&Utc),
        })
    }

    fn describes(&self, provisioner_id: &ProvisionerId, worker_type: &WorkerType) -> bool {
        self.provisioner_id == provisioner_id.as_str() && self.worker_type == worker_type.as_str()
    }
}

/// PendingQueueManager は pending キュー群の作成・publish・poll・count を担う
///
/// clone は安価（内部はすべて Arc）で、clone 同士はキャッシュを共有する。
#[derive(Clone)]
pub struct PendingQueueManager {
    pub(crate) ctx: QueueContext,
    pub(crate) prefix: String,
    families: Arc<SingleFlightCache<FamilyKey, Arc<QueueFamily>>>,
    counts: Arc<CountCache<FamilyKey>>,
}

impl PendingQueueManager {
    pub fn new(ctx: QueueContext, prefix: impl Into<String>) -> QueueResult<Self> {
        let prefix = prefix.into();
        validate_prefix(&prefix)?;
        Ok(Self {
            ctx,
            prefix,
            families: SingleFlightCache::new(),
            counts: Arc::new(CountCache::new(count_cache_max_age())),
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// 7 本のキューを（なければ）作り、名前を返す
    pub async fn ensure_pending_queue_family(
        &self,
        provisioner_id: &ProvisionerId,
        worker_type: &WorkerType,
    ) -> QueueResult<Arc<QueueFamily>> {
        let key = FamilyKey::new(provisioner_id, worker_type);
        let manager = self.clone();
        let flight_key = key.clone();
        self.families
            .get_or_start(key, move || async move {
                manager.ctx.cancellable(manager.create_family(flight_key)).await
            })
            .await
    }

    async fn create_family(&self, key: FamilyKey) -> QueueResult<Arc<QueueFamily>> {
        let family = QueueFamily::new(&self.prefix, &key.provisioner_id, &key.worker_type);
        try_join_all(
            family
                .iter()
                .map(|(_, name)| self.ensure_queue_and_metadata(name, &key.provisioner_id, &key.worker_type)),
        )
        .await
        .map_err(|err| {
            err.with_context("provisioner_id", key.provisioner_id.as_str())
                .with_context("worker_type", key.worker_type.as_str())
        })?;
        debug!(
            provisioner_id = %key.provisioner_id,
            worker_type = %key.worker_type,
            "pending queue family ready"
        );
        Ok(Arc::new(family))
    }

    /// キューがなければメタデータ付きで作り、あればメタデータを新しくする
    pub async fn ensure_queue_and_metadata(
        &self,
        queue: &str,
        provisioner_id: &ProvisionerId,
        worker_type: &WorkerType,
    ) -> QueueResult<()> {
        let now = self.ctx.clock.now();
        let desired = QueueMetadata {
            provisioner_id: provisioner_id.to_string(),
            worker_type: worker_type.to_string(),
            last_used: now,
        }
        .to_metadata();
        let client = &self.ctx.client;

        match self.ctx.call(client.get_metadata(queue)).await {
            Ok(props) => {
                let fresh = QueueMetadata::from_metadata(&props.metadata).is_some_and(|existing| {
                    existing.describes(provisioner_id, worker_type)
                        && now - existing.last_used < metadata_refresh_age()
                });
                if fresh {
                    return Ok(());
                }
                match self.ctx.call(client.set_metadata(queue, &desired)).await {
                    Ok(()) => {
                        debug!(queue, "refreshed queue metadata");
                        return Ok(());
                    }
                    // get と set の間に GC で消された
                    Err(err) if err.kind() == ErrorKind::QueueNotFound => {}
                    Err(err) => return Err(self.report(err, queue, "failed to set queue metadata")),
                }
            }
            Err(err) if err.kind() == ErrorKind::QueueNotFound => {}
            Err(err) => return Err(self.report(err, queue, "failed to read queue metadata")),
        }

        match self.ctx.call(client.create_queue(queue, Some(&desired))).await {
            Ok(()) => {
                debug!(queue, "created pending queue");
                Ok(())
            }
            // 同時に作った誰かがメタデータも入れている
            Err(err) if err.kind() == ErrorKind::QueueAlreadyExists => Ok(()),
            Err(err) => Err(self.report(err, queue, "failed to create queue")),
        }
    }

    fn report(&self, err: QueueError, queue: &str, note: &str) -> QueueError {
        let err = err.with_context("queue", queue).with_context("note", note);
        self.ctx.reporter.report(&err);
        err
    }

    /// タスクのヒントを優先度に対応するキューへ publish する
    ///
    /// deadline を過ぎていたら何もしない（エラーにはしない）。
    pub async fn put_pending_message(&self, task: &TaskRef, run_id: u32) -> QueueResult<()> {
        task.validate()?;
        let family = self
            .ensure_pending_queue_family(&task.provisioner_id, &task.worker_type)
            .await?;

        let now = self.ctx.clock.now();
        let Some(ttl_secs) = remaining_secs(task.deadline, now) else {
            info!(
                task_id = %task.task_id,
                run_id,
                deadline = %task.deadline,
                "deadline already passed, dropping pending message"
            );
            return Ok(());
        };

        let queue = family.name(task.priority);
        let text = codec::encode(&PendingMessage {
            task_id: task.task_id.clone(),
            run_id,
            hint_id: self.ctx.ids.generate_hint_id(),
        })?;
        let options = PutOptions {
            visibility_timeout: Duration::ZERO,
            ttl: Duration::from_secs(ttl_secs),
        };

        self.ctx
            .call(self.ctx.client.put_message(queue, &text, options))
            .await
            .map_err(|err| {
                let err = err
                    .with_context("queue", queue)
                    .with_context("task_id", task.task_id.as_str());
                if err.kind() == ErrorKind::QueueNotFound {
                    // 次の呼び出しで作り直させる
                    self.families
                        .evict(&FamilyKey::new(&task.provisioner_id, &task.worker_type));
                } else {
                    self.ctx.reporter.report(&err);
                }
                err
            })
    }

    /// highest から lowest の順に並んだ poller
    pub async fn pending_queues(
        &self,
        provisioner_id: &ProvisionerId,
        worker_type: &WorkerType,
    ) -> QueueResult<Vec<PendingQueuePoller>> {
        let family = self.ensure_pending_queue_family(provisioner_id, worker_type).await?;
        let key = FamilyKey::new(provisioner_id, worker_type);
        Ok(family
            .iter()
            .map(|(priority, queue)| PendingQueuePoller {
                manager: self.clone(),
                key: key.clone(),
                priority,
                queue: queue.to_string(),
            })
            .collect())
    }

    /// pending メッセージ数の概算
    ///
    /// キャッシュが 20 秒より古ければ、古い値を返しつつ裏で更新する。
    /// キャッシュがまだないときだけ最初の集計を待つ。
    pub async fn count_pending_messages(
        &self,
        provisioner_id: &ProvisionerId,
        worker_type: &WorkerType,
    ) -> QueueResult<u64> {
        let key = FamilyKey::new(provisioner_id, worker_type);
        match self.counts.lookup(&key, self.ctx.clock.now()) {
            CountLookup::Fresh(count) => Ok(count),
            CountLookup::Stale(count) => {
                let manager = self.clone();
                tokio::spawn(async move {
                    if let Err(err) = manager.refresh_count(key.clone()).await {
                        warn!(
                            provisioner_id = %key.provisioner_id,
                            worker_type = %key.worker_type,
                            error = %err,
                            "failed to refresh pending count"
                        );
                    }
                });
                Ok(count)
            }
            CountLookup::Missing => self.refresh_count(key).await,
        }
    }

    async fn refresh_count(&self, key: FamilyKey) -> QueueResult<u64> {
        let family = self
            .ensure_pending_queue_family(&key.provisioner_id, &key.worker_type)
            .await?;
        let client = &self.ctx.client;
        let results = join_all(
            family
                .iter()
                .map(|(_, queue)| self.ctx.call(client.get_metadata(queue))),
        )
        .await;

        let mut total = 0;
        for result in results {
            total += result?.approximate_message_count;
        }
        self.counts.store(key, total, self.ctx.clock.now());
        Ok(total)
    }

    /// キュー存在キャッシュを捨てる（次の ensure でメタデータが更新される）
    pub fn reset_queue_cache(&self) {
        self.families.clear();
        debug!("pending queue cache reset");
    }
}

/// 1 本の pending キューを poll する
#[derive(Clone)]
pub struct PendingQueuePoller {
    manager: PendingQueueManager,
    key: FamilyKey,
    priority: Priority,
    queue: String,
}

impl PendingQueuePoller {
    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn queue_name(&self) -> &str {
        &self.queue
    }

    /// 最大 min(count, 32) 件を 5 分の lease で受け取る
    ///
    /// キューが消えていたらキャッシュを捨ててキュー群を作り直し、空の結果を返す。
    pub async fn poll(&self, count: usize) -> QueueResult<Vec<PendingTaskHint>> {
        let max_count = count.min(MAX_MESSAGES_PER_GET);
        if max_count == 0 {
            return Ok(Vec::new());
        }
        let ctx = &self.manager.ctx;
        let options = GetOptions {
            visibility_timeout: POLL_LEASE,
            max_count,
        };
        let messages = match ctx.call(ctx.client.get_messages(&self.queue, options)).await {
            Ok(messages) => messages,
            Err(err) if err.kind() == ErrorKind::QueueNotFound => {
                debug!(queue = %self.queue, "pending queue disappeared, recreating");
                self.manager.families.evict(&self.key);
                self.manager
                    .ensure_pending_queue_family(&self.key.provisioner_id, &self.key.worker_type)
                    .await?;
                return Ok(Vec::new());
            }
            Err(err) => {
                let err = err.with_context("queue", self.queue.as_str());
                ctx.reporter.report(&err);
                return Err(err);
            }
        };

        let mut hints = Vec::with_capacity(messages.len());
        for raw in messages {
            let message: PendingMessage = match codec::decode(&raw.text) {
                Ok(message) => message,
                Err(err) => {
                    let err = err
                        .with_context("queue", self.queue.as_str())
                        .with_context("message_id", raw.message_id.as_str());
                    warn!(queue = %self.queue, message_id = %raw.message_id, "skipping undecodable pending message");
                    ctx.reporter.report(&err);
                    continue;
                }
            };
            let receipt = MessageReceipt::new(
                ctx.client.clone(),
                ctx.reporter.clone(),
                ctx.request_timeout,
                &self.queue,
                raw,
            );
            hints.push(PendingTaskHint::new(
                message.task_id,
                message.run_id,
                message.hint_id,
                self.priority,
                receipt,
            ));
        }
        Ok(hints)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TaskId;
    use crate::impls::{CollectingErrorReporter, InMemoryQueueClient, Operation};
    use crate::ports::{Clock, FixedClock, QueuePrimitiveClient};
    use chrono::TimeZone;
    use tokio::sync::watch;

    struct Fixture {
        clock: Arc<FixedClock>,
        client: InMemoryQueueClient,
        reporter: Arc<CollectingErrorReporter>,
        manager: PendingQueueManager,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()));
        let client = InMemoryQueueClient::new(clock.clone());
        let reporter = Arc::new(CollectingErrorReporter::new());
        let ctx = QueueContext::new(Arc::new(client.clone()), clock.clone()).with_reporter(reporter.clone());
        let manager = PendingQueueManager::new(ctx, "pq").unwrap();
        Fixture {
            clock,
            client,
            reporter,
            manager,
        }
    }

    fn ids() -> (ProvisionerId, WorkerType) {
        (
            ProvisionerId::new("aws-provisioner-v1").unwrap(),
            WorkerType::new("gecko-t-linux").unwrap(),
        )
    }

    fn task(f: &Fixture, id: &str, priority: Priority, secs: i64) -> TaskRef {
        let (p, w) = ids();
        TaskRef::new(
            TaskId::new(id),
            p,
            w,
            f.clock.now() + chrono::Duration::seconds(secs),
            priority,
        )
    }

    /// spawn された refresh が終わるまで待つ
    async fn wait_for_get_metadata(client: &InMemoryQueueClient, expected: usize) {
        for _ in 0..1000 {
            if client.op_counts().await.get_metadata >= expected {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("background refresh did not finish");
    }

    #[tokio::test]
    async fn concurrent_ensures_create_each_shard_once() {
        let f = fixture();
        let (p, w) = ids();

        let results = join_all((0..10).map(|_| f.manager.ensure_pending_queue_family(&p, &w))).await;
        let first = results[0].as_ref().unwrap().clone();
        for result in &results {
            assert_eq!(result.as_ref().unwrap(), &first);
        }

        let ops = f.client.op_counts().await;
        assert_eq!(ops.create_queue, 7);
        assert_eq!(f.client.queue_names().await.len(), 7);

        // キャッシュ済みなら I/O なし
        f.manager.ensure_pending_queue_family(&p, &w).await.unwrap();
        assert_eq!(f.client.op_counts().await, ops);
    }

    #[tokio::test]
    async fn family_names_follow_priority_order() {
        let f = fixture();
        let (p, w) = ids();
        let family = f.manager.ensure_pending_queue_family(&p, &w).await.unwrap();

        let priorities: Vec<_> = family.iter().map(|(priority, _)| priority).collect();
        assert_eq!(priorities, Priority::ALL.to_vec());
        for (priority, name) in family.iter() {
            assert_eq!(name, shard_name("pq", &p, &w, priority));
        }
        assert!(family.name(Priority::Highest).ends_with("-1"));
        assert!(family.name(Priority::Lowest).ends_with("-7"));
    }

    #[tokio::test]
    async fn failed_ensure_is_evicted_and_reported() {
        let f = fixture();
        let (p, w) = ids();
        let failing = shard_name("pq", &p, &w, Priority::Medium);
        f.client.fail_next(Operation::CreateQueue, Some(&failing), 1).await;

        let err = f.manager.ensure_pending_queue_family(&p, &w).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert_eq!(err.context_value("queue"), Some(failing.as_str()));
        assert_eq!(f.reporter.reported().len(), 1);
        assert_eq!(f.manager.families.len(), 0);

        // 失敗は残らないので、次の呼び出しはやり直して成功する
        f.manager.ensure_pending_queue_family(&p, &w).await.unwrap();
        assert!(f.client.queue_exists(&failing).await);
    }

    #[tokio::test]
    async fn already_exists_on_create_is_not_an_error() {
        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()));
        let client = Arc::new(ScriptedClient {
            inner: InMemoryQueueClient::new(clock.clone()),
            create_twice: true,
            metadata_delay: None,
        });
        let ctx = QueueContext::new(client.clone(), clock);
        let manager = PendingQueueManager::new(ctx, "pq").unwrap();
        let (p, w) = ids();

        manager.ensure_queue_and_metadata("pq-racy", &p, &w).await.unwrap();
        assert!(client.inner.queue_exists("pq-racy").await);
    }

    /// InMemoryQueueClient に癖を足す client
    /// - create_twice: create の直前に別プロセスが同じキューを作ったように振る舞う
    /// - metadata_delay: get_metadata が遅い
    struct ScriptedClient {
        inner: InMemoryQueueClient,
        create_twice: bool,
        metadata_delay: Option<Duration>,
    }

    #[async_trait::async_trait]
    impl QueuePrimitiveClient for ScriptedClient {
        async fn create_queue(
            &self,
            name: &str,
            metadata: Option<&Metadata>,
        ) -> Result<(), crate::ports::PrimitiveError> {
            if self.create_twice {
                self.inner.create_queue(name, metadata).await?;
            }
            self.inner.create_queue(name, metadata).await
        }
        async fn delete_queue(&self, name: &str) -> Result<(), crate::ports::PrimitiveError> {
            self.inner.delete_queue(name).await
        }
        async fn put_message(
            &self,
            name: &str,
            text: &str,
            options: PutOptions,
        ) -> Result<(), crate::ports::PrimitiveError> {
            self.inner.put_message(name, text, options).await
        }
        async fn get_messages(
            &self,
            name: &str,
            options: GetOptions,
        ) -> Result<Vec<crate::ports::RawMessage>, crate::ports::PrimitiveError> {
            self.inner.get_messages(name, options).await
        }
        async fn delete_message(
            &self,
            name: &str,
            message_id: &str,
            pop_receipt: &str,
        ) -> Result<(), crate::ports::PrimitiveError> {
            self.inner.delete_message(name, message_id, pop_receipt).await
        }
        async fn update_message(
            &self,
            name: &str,
            text: &str,
            message_id: &str,
            pop_receipt: &str,
            visibility_timeout: Duration,
        ) -> Result<String, crate::ports::PrimitiveError> {
            self.inner
                .update_message(name, text, message_id, pop_receipt, visibility_timeout)
                .await
        }
        async fn get_metadata(
            &self,
            name: &str,
        ) -> Result<crate::ports::QueueProperties, crate::ports::PrimitiveError> {
            if let Some(delay) = self.metadata_delay {
                tokio::time::sleep(delay).await;
            }
            self.inner.get_metadata(name).await
        }
        async fn set_metadata(
            &self,
            name: &str,
            metadata: &Metadata,
        ) -> Result<(), crate::ports::PrimitiveError> {
            self.inner.set_metadata(name, metadata).await
        }
        async fn list_queues(
            &self,
            request: crate::ports::ListQueuesRequest,
        ) -> Result<crate::ports::ListQueuesPage, crate::ports::PrimitiveError> {
            self.inner.list_queues(request).await
        }
    }

    #[tokio::test]
    async fn metadata_is_refreshed_only_when_stale_or_mismatched() {
        let f = fixture();
        let (p, w) = ids();
        let name = shard_name("pq", &p, &w, Priority::Low);

        f.manager.ensure_queue_and_metadata(&name, &p, &w).await.unwrap();
        let created = f.client.get_metadata(&name).await.unwrap();
        let meta = QueueMetadata::from_metadata(&created.metadata).unwrap();
        assert_eq!(meta.last_used, f.clock.now());
        assert_eq!(meta.provisioner_id, p.as_str());

        // 1 時間後: まだ新しいので書き込まない
        f.clock.advance(chrono::Duration::hours(1));
        f.manager.ensure_queue_and_metadata(&name, &p, &w).await.unwrap();
        assert_eq!(f.client.op_counts().await.set_metadata, 0);

        // 24 時間後: 古いので書き直す
        f.clock.advance(chrono::Duration::hours(23));
        f.manager.ensure_queue_and_metadata(&name, &p, &w).await.unwrap();
        assert_eq!(f.client.op_counts().await.set_metadata, 1);
        let refreshed = f.client.get_metadata(&name).await.unwrap();
        assert_eq!(
            QueueMetadata::from_metadata(&refreshed.metadata).unwrap().last_used,
            f.clock.now()
        );

        // identifier が違えば新しくても書き直す
        let other = WorkerType::new("other-worker").unwrap();
        f.manager.ensure_queue_and_metadata(&name, &p, &other).await.unwrap();
        assert_eq!(f.client.op_counts().await.set_metadata, 2);
    }

    #[tokio::test]
    async fn cache_reset_forces_a_metadata_touch() {
        let f = fixture();
        let (p, w) = ids();
        f.manager.ensure_pending_queue_family(&p, &w).await.unwrap();

        f.clock.advance(chrono::Duration::hours(25));
        f.manager.ensure_pending_queue_family(&p, &w).await.unwrap();
        assert_eq!(f.client.op_counts().await.set_metadata, 0);

        f.manager.reset_queue_cache();
        f.manager.ensure_pending_queue_family(&p, &w).await.unwrap();
        assert_eq!(f.client.op_counts().await.set_metadata, 7);
    }

    #[tokio::test]
    async fn publish_and_poll_round_trip() {
        let f = fixture();
        let (p, w) = ids();
        let t = task(&f, "task-a", Priority::VeryHigh, 90);

        f.manager.put_pending_message(&t, 2).await.unwrap();

        let pollers = f.manager.pending_queues(&p, &w).await.unwrap();
        let poller = &pollers[Priority::VeryHigh.index()];
        assert_eq!(poller.priority(), Priority::VeryHigh);

        let mut hints = poller.poll(10).await.unwrap();
        assert_eq!(hints.len(), 1);
        let hint = hints.remove(0);
        assert_eq!(hint.task_id, TaskId::new("task-a"));
        assert_eq!(hint.run_id, 2);
        assert_eq!(hint.priority, Priority::VeryHigh);

        // lease 中は見えない
        assert!(poller.poll(10).await.unwrap().is_empty());

        // release するとすぐに再配送される
        hint.release().await.unwrap();
        let mut again = poller.poll(10).await.unwrap();
        assert_eq!(again.len(), 1);

        // remove すると消える
        again.remove(0).remove().await.unwrap();
        f.clock.advance(chrono::Duration::minutes(6));
        assert!(poller.poll(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unreleased_hint_reappears_after_the_lease() {
        let f = fixture();
        let (p, w) = ids();
        f.manager
            .put_pending_message(&task(&f, "task-b", Priority::Lowest, 3600), 0)
            .await
            .unwrap();
        let pollers = f.manager.pending_queues(&p, &w).await.unwrap();
        let lowest = pollers.last().unwrap();

        let first = lowest.poll(1).await.unwrap();
        assert_eq!(first.len(), 1);
        drop(first);

        f.clock.advance(chrono::Duration::minutes(4));
        assert!(lowest.poll(1).await.unwrap().is_empty());
        f.clock.advance(chrono::Duration::minutes(2));
        assert_eq!(lowest.poll(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn past_deadline_is_dropped_silently() {
        let f = fixture();
        let t = task(&f, "late", Priority::High, -5);

        f.manager.put_pending_message(&t, 0).await.unwrap();
        assert_eq!(f.client.op_counts().await.put_message, 0);
        assert!(f.reporter.reported().is_empty());
    }

    #[tokio::test]
    async fn message_ttl_tracks_the_deadline() {
        let f = fixture();
        let (p, w) = ids();
        f.manager
            .put_pending_message(&task(&f, "short", Priority::Medium, 30), 0)
            .await
            .unwrap();

        f.clock.advance(chrono::Duration::seconds(31));
        let pollers = f.manager.pending_queues(&p, &w).await.unwrap();
        assert!(pollers[Priority::Medium.index()].poll(32).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn invalid_task_id_fails_validation() {
        let f = fixture();
        let t = task(&f, "has space", Priority::High, 60);
        let err = f.manager.put_pending_message(&t, 0).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(f.client.op_counts().await.create_queue, 0);
    }

    #[tokio::test]
    async fn pollers_are_ordered_highest_first() {
        let f = fixture();
        let (p, w) = ids();
        for (i, priority) in [Priority::Low, Priority::Highest, Priority::Medium].into_iter().enumerate() {
            f.manager
                .put_pending_message(&task(&f, &format!("t{i}"), priority, 600), 0)
                .await
                .unwrap();
        }

        let pollers = f.manager.pending_queues(&p, &w).await.unwrap();
        let order: Vec<_> = pollers.iter().map(PendingQueuePoller::priority).collect();
        assert_eq!(order, Priority::ALL.to_vec());

        let mut seen = Vec::new();
        for poller in &pollers {
            for hint in poller.poll(32).await.unwrap() {
                seen.push(hint.task_id.as_str().to_string());
            }
        }
        assert_eq!(seen, vec!["t1", "t2", "t0"]);
    }

    #[tokio::test]
    async fn poll_caps_the_batch_at_32() {
        let f = fixture();
        let (p, w) = ids();
        for i in 0..40 {
            f.manager
                .put_pending_message(&task(&f, &format!("t{i}"), Priority::High, 600), 0)
                .await
                .unwrap();
        }
        let pollers = f.manager.pending_queues(&p, &w).await.unwrap();
        let high = &pollers[Priority::High.index()];
        assert_eq!(high.poll(100).await.unwrap().len(), 32);
        assert_eq!(high.poll(100).await.unwrap().len(), 8);
        assert!(high.poll(0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn undecodable_messages_are_skipped_and_reported() {
        let f = fixture();
        let (p, w) = ids();
        f.manager
            .put_pending_message(&task(&f, "good", Priority::High, 600), 0)
            .await
            .unwrap();
        let queue = shard_name("pq", &p, &w, Priority::High);
        f.client
            .put_message(
                &queue,
                "%%% not base64 %%%",
                PutOptions {
                    visibility_timeout: Duration::ZERO,
                    ttl: Duration::from_secs(600),
                },
            )
            .await
            .unwrap();

        let pollers = f.manager.pending_queues(&p, &w).await.unwrap();
        let hints = pollers[Priority::High.index()].poll(32).await.unwrap();
        assert_eq!(hints.len(), 1);
        assert_eq!(hints[0].task_id, TaskId::new("good"));

        let reported = f.reporter.reported();
        assert_eq!(reported.len(), 1);
        assert_eq!(reported[0].kind(), ErrorKind::Codec);
    }

    #[tokio::test]
    async fn count_is_cached_for_twenty_seconds() {
        let f = fixture();
        let (p, w) = ids();
        for i in 0..3 {
            f.manager
                .put_pending_message(&task(&f, &format!("t{i}"), Priority::Medium, 3600), 0)
                .await
                .unwrap();
        }

        assert_eq!(f.manager.count_pending_messages(&p, &w).await.unwrap(), 3);
        let baseline = f.client.op_counts().await.get_metadata;

        f.manager
            .put_pending_message(&task(&f, "t3", Priority::Low, 3600), 0)
            .await
            .unwrap();

        // 20 秒以内は同じ値、I/O なし
        f.clock.advance(chrono::Duration::seconds(10));
        assert_eq!(f.manager.count_pending_messages(&p, &w).await.unwrap(), 3);
        assert_eq!(f.client.op_counts().await.get_metadata, baseline);

        // 21 秒後は古い値を返しつつ、1 回だけ refresh する
        f.clock.advance(chrono::Duration::seconds(11));
        assert_eq!(f.manager.count_pending_messages(&p, &w).await.unwrap(), 3);
        assert_eq!(f.manager.count_pending_messages(&p, &w).await.unwrap(), 3);
        wait_for_get_metadata(&f.client, baseline + 7).await;

        let mut refreshed = 0;
        for _ in 0..1000 {
            refreshed = f.manager.count_pending_messages(&p, &w).await.unwrap();
            if refreshed == 4 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(refreshed, 4);
        assert_eq!(f.client.op_counts().await.get_metadata, baseline + 7);
    }

    #[tokio::test]
    async fn shutdown_cancels_pending_ensures() {
        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()));
        let client = InMemoryQueueClient::new(clock.clone());
        let (tx, rx) = watch::channel(false);
        let ctx = QueueContext::new(Arc::new(client.clone()), clock).with_shutdown(rx);
        let manager = PendingQueueManager::new(ctx, "pq").unwrap();
        let (p, w) = ids();

        tx.send(true).unwrap();
        let err = manager.ensure_pending_queue_family(&p, &w).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert_eq!(manager.families.len(), 0);
    }

    #[tokio::test]
    async fn abandoned_ensure_is_evicted_and_not_resumed() {
        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()));
        let client = Arc::new(ScriptedClient {
            inner: InMemoryQueueClient::new(clock.clone()),
            create_twice: false,
            metadata_delay: Some(Duration::from_millis(50)),
        });
        let ctx = QueueContext::new(client.clone(), clock);
        let manager = PendingQueueManager::new(ctx, "pq").unwrap();
        let (p, w) = ids();

        let timed_out =
            tokio::time::timeout(Duration::from_millis(5), manager.ensure_pending_queue_family(&p, &w)).await;
        assert!(timed_out.is_err());
        assert_eq!(manager.families.len(), 0);

        // 置き去りにされた ensure が裏で続きを実行することもない
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(client.inner.queue_names().await.is_empty());

        manager.ensure_pending_queue_family(&p, &w).await.unwrap();
        assert_eq!(client.inner.op_counts().await.create_queue, 7);
        assert_eq!(manager.families.len(), 1);
    }

    #[tokio::test]
    async fn poll_recreates_queues_deleted_behind_the_cache() {
        let f = fixture();
        let (p, w) = ids();
        let pollers = f.manager.pending_queues(&p, &w).await.unwrap();

        f.clock.advance(chrono::Duration::days(11));
        assert_eq!(f.manager.delete_unused_worker_queues(f.clock.now()).await.unwrap(), 7);
        assert!(f.client.queue_names().await.is_empty());

        // 消えたキューは作り直され、その回の poll は空
        assert!(pollers[0].poll(4).await.unwrap().is_empty());
        assert_eq!(f.client.queue_names().await.len(), 7);
        assert!(f.reporter.reported().is_empty());

        f.manager
            .put_pending_message(&task(&f, "after-gc", Priority::Highest, 600), 0)
            .await
            .unwrap();
        let hints = pollers[0].poll(4).await.unwrap();
        assert_eq!(hints.len(), 1);
        assert_eq!(hints[0].task_id, TaskId::new("after-gc"));
    }

    #[tokio::test]
    async fn transient_put_and_poll_failures_are_reported() {
        let f = fixture();
        let (p, w) = ids();
        let pollers = f.manager.pending_queues(&p, &w).await.unwrap();

        f.client.fail_next(Operation::PutMessage, None, 1).await;
        let err = f
            .manager
            .put_pending_message(&task(&f, "t1", Priority::Low, 600), 0)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert_eq!(f.reporter.reported().len(), 1);
        // 一時的な失敗ではキャッシュを捨てない
        assert_eq!(f.manager.families.len(), 1);

        f.client.fail_next(Operation::GetMessages, None, 1).await;
        let err = pollers[0].poll(4).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert_eq!(err.context_value("queue"), Some(pollers[0].queue_name()));
        assert_eq!(f.reporter.reported().len(), 2);
    }

    #[test]
    fn metadata_with_missing_fields_is_rejected() {
        let mut metadata = QueueMetadata {
            provisioner_id: "p".into(),
            worker_type: "w".into(),
            last_used: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        }
        .to_metadata();
        assert!(QueueMetadata::from_metadata(&metadata).is_some());

        metadata.insert(META_LAST_USED.into(), "yesterday".into());
        assert!(QueueMetadata::from_metadata(&metadata).is_none());

        metadata.remove(META_LAST_USED);
        assert!(QueueMetadata::from_metadata(&metadata).is_none());
    }

    #[test]
    fn invalid_prefix_is_rejected() {
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let client = InMemoryQueueClient::new(clock.clone());
        let ctx = QueueContext::new(Arc::new(client), clock);
        let err = PendingQueueManager::new(ctx, "Too-Long").err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }
}
