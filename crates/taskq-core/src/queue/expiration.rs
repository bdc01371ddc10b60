//! Expiration queues (claim / deadline / resolved)
//!
//! 3 本ともプロセス全体で共有する 1 本ずつのキュー。初回使用時に作成し、
//! 以降はキャッシュする（作成に失敗したときだけ捨てる）。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::domain::{
    ClaimMessage, DeadlineMessage, ErrorKind, QueueResult, Resolution, ResolvedMessage, TaskId,
};
use crate::ports::{GetOptions, MAX_MESSAGES_PER_GET, PutOptions};

use super::cache::SingleFlightCache;
use super::lease::{ExpirationMessage, MessageReceipt};
use super::naming::validate_queue_name;
use super::{QueueContext, codec, delay_secs};

/// expiration キューのメッセージの TTL
const MESSAGE_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// poll したメッセージの lease
const POLL_LEASE: Duration = Duration::from_secs(10 * 60);

/// deadline メッセージに足す遅延のデフォルト
pub const DEFAULT_DEADLINE_DELAY: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExpirationQueueKind {
    Claim,
    Deadline,
    Resolved,
}

impl ExpirationQueueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExpirationQueueKind::Claim => "claim",
            ExpirationQueueKind::Deadline => "deadline",
            ExpirationQueueKind::Resolved => "resolved",
        }
    }
}

/// ExpirationQueues は claim / deadline / resolved キューへの publish と poll を担う
#[derive(Clone)]
pub struct ExpirationQueues {
    ctx: QueueContext,
    claim_queue: String,
    deadline_queue: String,
    resolved_queue: String,
    deadline_delay: Duration,
    ready: Arc<SingleFlightCache<ExpirationQueueKind, ()>>,
}

impl ExpirationQueues {
    pub fn new(
        ctx: QueueContext,
        claim_queue: impl Into<String>,
        deadline_queue: impl Into<String>,
        resolved_queue: impl Into<String>,
    ) -> QueueResult<Self> {
        let claim_queue = claim_queue.into();
        let deadline_queue = deadline_queue.into();
        let resolved_queue = resolved_queue.into();
        for name in [&claim_queue, &deadline_queue, &resolved_queue] {
            validate_queue_name(name)?;
        }
        Ok(Self {
            ctx,
            claim_queue,
            deadline_queue,
            resolved_queue,
            deadline_delay: DEFAULT_DEADLINE_DELAY,
            ready: SingleFlightCache::new(),
        })
    }

    pub fn with_deadline_delay(mut self, delay: Duration) -> Self {
        self.deadline_delay = delay;
        self
    }

    pub fn queue_name(&self, kind: ExpirationQueueKind) -> &str {
        match kind {
            ExpirationQueueKind::Claim => &self.claim_queue,
            ExpirationQueueKind::Deadline => &self.deadline_queue,
            ExpirationQueueKind::Resolved => &self.resolved_queue,
        }
    }

    async fn ensure_queue(&self, kind: ExpirationQueueKind) -> QueueResult<()> {
        let queues = self.clone();
        self.ready
            .get_or_start(kind, move || async move {
                queues.ctx.cancellable(queues.create_queue(kind)).await
            })
            .await
    }

    async fn create_queue(&self, kind: ExpirationQueueKind) -> QueueResult<()> {
        let name = self.queue_name(kind);
        match self.ctx.call(self.ctx.client.create_queue(name, None)).await {
            Ok(()) => {
                debug!(queue = name, kind = kind.as_str(), "created expiration queue");
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::QueueAlreadyExists => Ok(()),
            Err(err) => {
                let err = err
                    .with_context("queue", name)
                    .with_context("note", "failed to create expiration queue");
                self.ctx.reporter.report(&err);
                Err(err)
            }
        }
    }

    async fn put<T: Serialize>(
        &self,
        kind: ExpirationQueueKind,
        message: &T,
        visibility_secs: u64,
    ) -> QueueResult<()> {
        self.ensure_queue(kind).await?;
        let name = self.queue_name(kind);
        let text = codec::encode(message)?;
        let options = PutOptions {
            visibility_timeout: Duration::from_secs(visibility_secs),
            ttl: MESSAGE_TTL,
        };
        self.ctx
            .call(self.ctx.client.put_message(name, &text, options))
            .await
            .map_err(|err| {
                let err = err.with_context("queue", name);
                if err.kind() == ErrorKind::QueueNotFound {
                    self.ready.evict(&kind);
                } else {
                    self.ctx.reporter.report(&err);
                }
                err
            })
    }

    /// `taken_until` を過ぎたら見えるようになる claim 期限メッセージ
    pub async fn put_claim_message(
        &self,
        task_id: &TaskId,
        run_id: u32,
        taken_until: DateTime<Utc>,
    ) -> QueueResult<()> {
        let visibility = delay_secs(taken_until, self.ctx.clock.now());
        let message = ClaimMessage {
            task_id: task_id.clone(),
            run_id,
            taken_until,
        };
        self.put(ExpirationQueueKind::Claim, &message, visibility).await
    }

    /// すぐに見える resolved メッセージ
    pub async fn put_resolved_message(
        &self,
        task_id: &TaskId,
        task_group_id: &str,
        scheduler_id: &str,
        resolution: Resolution,
    ) -> QueueResult<()> {
        let message = ResolvedMessage {
            task_id: task_id.clone(),
            task_group_id: task_group_id.to_string(),
            scheduler_id: scheduler_id.to_string(),
            resolution,
        };
        self.put(ExpirationQueueKind::Resolved, &message, 0).await
    }

    /// deadline + 遅延 を過ぎたら見える deadline メッセージ
    pub async fn put_deadline_message(
        &self,
        task_id: &TaskId,
        task_group_id: &str,
        scheduler_id: &str,
        deadline: DateTime<Utc>,
    ) -> QueueResult<()> {
        // 1 秒未満の遅延は切り上げる
        let extra = u64::try_from(self.deadline_delay.as_millis().div_ceil(1000)).unwrap_or(u64::MAX);
        let visibility = delay_secs(deadline, self.ctx.clock.now()).saturating_add(extra);
        let message = DeadlineMessage {
            task_id: task_id.clone(),
            task_group_id: task_group_id.to_string(),
            scheduler_id: scheduler_id.to_string(),
            deadline,
        };
        self.put(ExpirationQueueKind::Deadline, &message, visibility).await
    }

    pub async fn poll_claim_queue(&self) -> QueueResult<Vec<ExpirationMessage<ClaimMessage>>> {
        self.poll(ExpirationQueueKind::Claim).await
    }

    pub async fn poll_deadline_queue(&self) -> QueueResult<Vec<ExpirationMessage<DeadlineMessage>>> {
        self.poll(ExpirationQueueKind::Deadline).await
    }

    pub async fn poll_resolved_queue(&self) -> QueueResult<Vec<ExpirationMessage<ResolvedMessage>>> {
        self.poll(ExpirationQueueKind::Resolved).await
    }

    async fn poll<T: DeserializeOwned>(
        &self,
        kind: ExpirationQueueKind,
    ) -> QueueResult<Vec<ExpirationMessage<T>>> {
        self.ensure_queue(kind).await?;
        let name = self.queue_name(kind);
        let options = GetOptions {
            visibility_timeout: POLL_LEASE,
            max_count: MAX_MESSAGES_PER_GET,
        };
        let messages = match self.ctx.call(self.ctx.client.get_messages(name, options)).await {
            Ok(messages) => messages,
            // 作成済みのつもりで消えていた。次の呼び出しで作り直す
            Err(err) if err.kind() == ErrorKind::QueueNotFound => {
                self.ready.evict(&kind);
                return Err(err.with_context("queue", name));
            }
            Err(err) => {
                let err = err.with_context("queue", name);
                self.ctx.reporter.report(&err);
                return Err(err);
            }
        };

        let mut out = Vec::with_capacity(messages.len());
        for raw in messages {
            match codec::decode::<T>(&raw.text) {
                Ok(payload) => {
                    let receipt = MessageReceipt::new(
                        self.ctx.client.clone(),
                        self.ctx.reporter.clone(),
                        self.ctx.request_timeout,
                        name,
                        raw,
                    );
                    out.push(ExpirationMessage::new(payload, receipt));
                }
                Err(err) => {
                    warn!(queue = name, message_id = %raw.message_id, "skipping undecodable message");
                    self.ctx.reporter.report(
                        &err.with_context("queue", name)
                            .with_context("message_id", raw.message_id.as_str()),
                    );
                }
            }
        }
        Ok(out)
    }
}
