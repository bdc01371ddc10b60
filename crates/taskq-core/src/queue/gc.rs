//! 使われなくなった pending キューの削除
//!
//! 削除対象は「メタデータが古い（10 日以上）か壊れている」かつ「空」のキューだけ。
//! 空チェックと削除の間にメッセージが入る可能性は残る（10 日の閾値があるので許容）。

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::domain::{ErrorKind, QueueResult};
use crate::ports::{ListQueuesRequest, QueueListing};

use super::PendingQueueManager;
use super::naming::shard_prefix;
use super::pending::QueueMetadata;

/// `last_used` がこれより古いキューは削除候補
fn unused_queue_max_age() -> chrono::Duration {
    chrono::Duration::days(10)
}

impl PendingQueueManager {
    /// prefix 配下のキューを全ページ走査し、削除した数を返す
    ///
    /// 一覧の取得に失敗したら中断する。個々のキューの失敗は報告して次へ進む。
    pub async fn delete_unused_worker_queues(&self, now: DateTime<Utc>) -> QueueResult<usize> {
        let prefix = shard_prefix(&self.prefix);
        let cutoff = now - unused_queue_max_age();
        let mut marker = None;
        let mut deleted = 0;

        loop {
            let request = ListQueuesRequest {
                prefix: prefix.clone(),
                marker: marker.take(),
                include_metadata: true,
            };
            let page = self
                .ctx
                .call(self.ctx.client.list_queues(request))
                .await
                .map_err(|err| err.with_context("note", "failed to list queues"))?;

            for queue in &page.queues {
                match self.delete_if_unused(queue, cutoff).await {
                    Ok(true) => deleted += 1,
                    Ok(false) => {}
                    Err(err) => {
                        let err = err
                            .with_context("queue", queue.name.as_str())
                            .with_context("note", "failed to garbage collect queue");
                        self.ctx.reporter.report(&err);
                    }
                }
            }

            match page.next_marker {
                Some(next) => marker = Some(next),
                None => break,
            }
        }

        info!(deleted, prefix = %prefix, "unused worker queue sweep finished");
        Ok(deleted)
    }

    async fn delete_if_unused(&self, queue: &QueueListing, cutoff: DateTime<Utc>) -> QueueResult<bool> {
        let is_stale = |metadata: Option<QueueMetadata>| metadata.is_none_or(|m| m.last_used < cutoff);

        // 一覧にメタデータが付いていればそれで一次判定する
        if let Some(listed) = &queue.metadata
            && !is_stale(QueueMetadata::from_metadata(listed))
        {
            return Ok(false);
        }

        // 最新のメタデータと件数で確認する
        let props = self.ctx.call(self.ctx.client.get_metadata(&queue.name)).await?;
        if !is_stale(QueueMetadata::from_metadata(&props.metadata)) {
            return Ok(false);
        }
        if props.approximate_message_count > 0 {
            debug!(
                queue = %queue.name,
                count = props.approximate_message_count,
                "stale queue still holds messages"
            );
            return Ok(false);
        }

        match self.ctx.call(self.ctx.client.delete_queue(&queue.name)).await {
            Ok(()) => {
                info!(queue = %queue.name, "deleted unused worker queue");
                Ok(true)
            }
            // 同時に走った別の sweep が先に消した
            Err(err) if err.kind() == ErrorKind::QueueNotFound => Ok(false),
            Err(err) => Err(err),
        }
    }
}
