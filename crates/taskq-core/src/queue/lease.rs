//! Polled message handles.
//!
//! `remove` / `release` は `self` を消費するので、1 つのメッセージに対して
//! どちらか 1 回しか呼べない。どちらも呼ばずに drop すると lease 切れで再配送される。

use std::sync::Arc;
use std::time::Duration;

use crate::domain::{HintId, Priority, QueueError, TaskId};
use crate::ports::{ErrorReporter, QueuePrimitiveClient, RawMessage};

use super::call_primitive;

/// 受け取ったメッセージを primitive 上で特定するための情報
pub(crate) struct MessageReceipt {
    client: Arc<dyn QueuePrimitiveClient>,
    reporter: Arc<dyn ErrorReporter>,
    request_timeout: Duration,
    queue: String,
    message_id: String,
    pop_receipt: String,
    text: String,
}

impl MessageReceipt {
    pub(crate) fn new(
        client: Arc<dyn QueuePrimitiveClient>,
        reporter: Arc<dyn ErrorReporter>,
        request_timeout: Duration,
        queue: &str,
        raw: RawMessage,
    ) -> Self {
        Self {
            client,
            reporter,
            request_timeout,
            queue: queue.to_string(),
            message_id: raw.message_id,
            pop_receipt: raw.pop_receipt,
            text: raw.text,
        }
    }

    pub(crate) async fn delete(self) -> Result<(), QueueError> {
        let result = call_primitive(
            self.request_timeout,
            self.client
                .delete_message(&self.queue, &self.message_id, &self.pop_receipt),
        )
        .await;
        self.finish(result, "delete_message")
    }

    /// すぐに再び見えるようにする
    pub(crate) async fn make_visible(self) -> Result<(), QueueError> {
        let result = call_primitive(
            self.request_timeout,
            self.client.update_message(
                &self.queue,
                &self.text,
                &self.message_id,
                &self.pop_receipt,
                Duration::ZERO,
            ),
        )
        .await
        .map(|_new_receipt| ());
        self.finish(result, "update_message")
    }

    fn finish(&self, result: Result<(), QueueError>, operation: &'static str) -> Result<(), QueueError> {
        result.map_err(|err| {
            let err = err
                .with_context("queue", self.queue.as_str())
                .with_context("message_id", self.message_id.as_str())
                .with_context("operation", operation);
            if err.kind() == crate::domain::ErrorKind::AssertionViolation {
                // lease 切れ後の使用か、receipt の使い回し
                tracing::error!(
                    queue = %self.queue,
                    message_id = %self.message_id,
                    operation,
                    "pop receipt no longer valid"
                );
                self.reporter.report(&err);
            }
            err
        })
    }
}

/// Pending キューから受け取ったヒント
///
/// claim に成功したら `remove`、失敗・中断したら `release` を呼ぶ。
pub struct PendingTaskHint {
    pub task_id: TaskId,
    pub run_id: u32,
    pub hint_id: HintId,
    pub priority: Priority,
    receipt: MessageReceipt,
}

impl PendingTaskHint {
    pub(crate) fn new(
        task_id: TaskId,
        run_id: u32,
        hint_id: HintId,
        priority: Priority,
        receipt: MessageReceipt,
    ) -> Self {
        Self {
            task_id,
            run_id,
            hint_id,
            priority,
            receipt,
        }
    }

    /// メッセージを完全に削除する（claim 成功後）
    pub async fn remove(self) -> Result<(), QueueError> {
        self.receipt.delete().await
    }

    /// メッセージをすぐに再配送可能にする（claim 失敗・中断時）
    pub async fn release(self) -> Result<(), QueueError> {
        self.receipt.make_visible().await
    }
}

impl std::fmt::Debug for PendingTaskHint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingTaskHint")
            .field("task_id", &self.task_id)
            .field("run_id", &self.run_id)
            .field("hint_id", &self.hint_id)
            .field("priority", &self.priority)
            .field("queue", &self.receipt.queue)
            .finish()
    }
}

/// claim / deadline / resolved キューから受け取ったメッセージ
///
/// 処理が終わったら lease（10 分）が切れる前に `remove` を呼ぶ。
pub struct ExpirationMessage<T> {
    pub payload: T,
    receipt: MessageReceipt,
}

impl<T> ExpirationMessage<T> {
    pub(crate) fn new(payload: T, receipt: MessageReceipt) -> Self {
        Self { payload, receipt }
    }

    pub async fn remove(self) -> Result<(), QueueError> {
        self.receipt.delete().await
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for ExpirationMessage<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpirationMessage")
            .field("payload", &self.payload)
            .field("queue", &self.receipt.queue)
            .finish()
    }
}
