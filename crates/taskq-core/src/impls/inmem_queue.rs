//! InMemoryQueueClient - 開発・テスト用のキュー primitive
//!
//! # 再現している挙動
//! - visibility timeout（lease）と TTL
//! - pop receipt は get/update のたびに更新される（古い receipt は PopReceiptMismatch）
//! - 概算メッセージ数は「期限切れでない全メッセージ」（不可視のものも含む）
//! - prefix でのキュー一覧（ページサイズ指定、marker による継続）
//!
//! 時刻は Clock から取るので、FixedClock を進めれば lease や TTL の経過を再現できる。

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::ports::{
    Clock, GetOptions, ListQueuesPage, ListQueuesRequest, MAX_MESSAGES_PER_GET, Metadata,
    PrimitiveError, PutOptions, QueueListing, QueuePrimitiveClient, QueueProperties, RawMessage,
};

const DEFAULT_PAGE_SIZE: usize = 5000;

/// primitive の操作種別（呼び出し回数の集計と障害注入に使う）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    CreateQueue,
    DeleteQueue,
    PutMessage,
    GetMessages,
    DeleteMessage,
    UpdateMessage,
    GetMetadata,
    SetMetadata,
    ListQueues,
}

/// 操作ごとの呼び出し回数
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpCounts {
    pub create_queue: usize,
    pub delete_queue: usize,
    pub put_message: usize,
    pub get_messages: usize,
    pub delete_message: usize,
    pub update_message: usize,
    pub get_metadata: usize,
    pub set_metadata: usize,
    pub list_queues: usize,
}

impl OpCounts {
    fn bump(&mut self, op: Operation) {
        let slot = match op {
            Operation::CreateQueue => &mut self.create_queue,
            Operation::DeleteQueue => &mut self.delete_queue,
            Operation::PutMessage => &mut self.put_message,
            Operation::GetMessages => &mut self.get_messages,
            Operation::DeleteMessage => &mut self.delete_message,
            Operation::UpdateMessage => &mut self.update_message,
            Operation::GetMetadata => &mut self.get_metadata,
            Operation::SetMetadata => &mut self.set_metadata,
            Operation::ListQueues => &mut self.list_queues,
        };
        *slot += 1;
    }
}

/// 注入する障害（queue が None なら全キューが対象）
#[derive(Debug, Clone)]
struct FailureRule {
    op: Operation,
    queue: Option<String>,
    remaining: usize,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    id: String,
    pop_receipt: String,
    text: String,
    visible_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
struct StoredQueue {
    metadata: Metadata,
    messages: Vec<StoredMessage>,
}

impl StoredQueue {
    fn purge_expired(&mut self, now: DateTime<Utc>) {
        self.messages.retain(|m| m.expires_at > now);
    }
}

#[derive(Debug, Default)]
struct InMemoryState {
    queues: BTreeMap<String, StoredQueue>,
    next_message_id: u64,
    next_receipt: u64,
    ops: OpCounts,
    failures: Vec<FailureRule>,
}

impl InMemoryState {
    /// 呼び出しを記録し、注入された障害があれば返す
    fn enter(&mut self, op: Operation, queue: &str) -> Result<(), PrimitiveError> {
        self.ops.bump(op);
        let hit = self.failures.iter_mut().find(|rule| {
            rule.op == op && rule.remaining > 0 && rule.queue.as_deref().is_none_or(|q| q == queue)
        });
        if let Some(rule) = hit {
            rule.remaining -= 1;
            return Err(PrimitiveError::Status {
                status: 503,
                code: Some("ServerBusy".to_string()),
                body: format!("injected failure for {op:?} on {queue}"),
            });
        }
        Ok(())
    }

    fn queue_mut(&mut self, name: &str) -> Result<&mut StoredQueue, PrimitiveError> {
        self.queues
            .get_mut(name)
            .ok_or_else(|| PrimitiveError::QueueNotFound {
                queue: name.to_string(),
            })
    }

    fn allocate_message_id(&mut self) -> String {
        self.next_message_id += 1;
        format!("msg-{}", self.next_message_id)
    }

    fn allocate_receipt(&mut self) -> String {
        self.next_receipt += 1;
        format!("receipt-{}", self.next_receipt)
    }
}

/// InMemoryQueueClient はプロセス内で完結するキュー primitive
///
/// # 使用例
/// ```ignore
/// let clock = Arc::new(FixedClock::new(Utc::now()));
/// let client = InMemoryQueueClient::new(clock.clone());
/// client.create_queue("q1", None).await?;
/// ```
#[derive(Clone)]
pub struct InMemoryQueueClient {
    state: Arc<Mutex<InMemoryState>>,
    clock: Arc<dyn Clock>,
    page_size: usize,
}

impl InMemoryQueueClient {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(InMemoryState::default())),
            clock,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// list_queues の 1 ページあたりの件数を変える（ページングのテスト用）
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub async fn op_counts(&self) -> OpCounts {
        self.state.lock().await.ops.clone()
    }

    /// 次の `times` 回の `op` を 503 で失敗させる
    pub async fn fail_next(&self, op: Operation, queue: Option<&str>, times: usize) {
        self.state.lock().await.failures.push(FailureRule {
            op,
            queue: queue.map(str::to_string),
            remaining: times,
        });
    }

    pub async fn queue_names(&self) -> Vec<String> {
        self.state.lock().await.queues.keys().cloned().collect()
    }

    pub async fn queue_exists(&self, name: &str) -> bool {
        self.state.lock().await.queues.contains_key(name)
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    // 範囲外になるのは数千年単位の値だけ
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(3650))
}

#[async_trait]
impl QueuePrimitiveClient for InMemoryQueueClient {
    async fn create_queue(&self, name: &str, metadata: Option<&Metadata>) -> Result<(), PrimitiveError> {
        let mut state = self.state.lock().await;
        state.enter(Operation::CreateQueue, name)?;
        if state.queues.contains_key(name) {
            return Err(PrimitiveError::QueueAlreadyExists {
                queue: name.to_string(),
            });
        }
        state.queues.insert(
            name.to_string(),
            StoredQueue {
                metadata: metadata.cloned().unwrap_or_default(),
                messages: Vec::new(),
            },
        );
        Ok(())
    }

    async fn delete_queue(&self, name: &str) -> Result<(), PrimitiveError> {
        let mut state = self.state.lock().await;
        state.enter(Operation::DeleteQueue, name)?;
        state
            .queues
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| PrimitiveError::QueueNotFound {
                queue: name.to_string(),
            })
    }

    async fn put_message(&self, name: &str, text: &str, options: PutOptions) -> Result<(), PrimitiveError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.enter(Operation::PutMessage, name)?;
        let id = state.allocate_message_id();
        let pop_receipt = state.allocate_receipt();
        let queue = state.queue_mut(name)?;
        queue.purge_expired(now);
        queue.messages.push(StoredMessage {
            id,
            pop_receipt,
            text: text.to_string(),
            visible_at: now + to_chrono(options.visibility_timeout),
            expires_at: now + to_chrono(options.ttl),
        });
        Ok(())
    }

    async fn get_messages(&self, name: &str, options: GetOptions) -> Result<Vec<RawMessage>, PrimitiveError> {
        let now = self.clock.now();
        let max_count = options.max_count.clamp(1, MAX_MESSAGES_PER_GET);
        let mut state = self.state.lock().await;
        state.enter(Operation::GetMessages, name)?;
        state.queue_mut(name)?.purge_expired(now);

        let mut fetched = Vec::new();
        let visible: Vec<usize> = state
            .queue_mut(name)?
            .messages
            .iter()
            .enumerate()
            .filter(|(_, m)| m.visible_at <= now)
            .map(|(i, _)| i)
            .take(max_count)
            .collect();
        for index in visible {
            let pop_receipt = state.allocate_receipt();
            let message = &mut state.queue_mut(name)?.messages[index];
            message.pop_receipt = pop_receipt;
            message.visible_at = now + to_chrono(options.visibility_timeout);
            fetched.push(RawMessage {
                message_id: message.id.clone(),
                pop_receipt: message.pop_receipt.clone(),
                text: message.text.clone(),
            });
        }
        Ok(fetched)
    }

    async fn delete_message(
        &self,
        name: &str,
        message_id: &str,
        pop_receipt: &str,
    ) -> Result<(), PrimitiveError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.enter(Operation::DeleteMessage, name)?;
        let queue = state.queue_mut(name)?;
        queue.purge_expired(now);
        let Some(index) = queue.messages.iter().position(|m| m.id == message_id) else {
            return Err(PrimitiveError::MessageNotFound {
                queue: name.to_string(),
                message_id: message_id.to_string(),
            });
        };
        if queue.messages[index].pop_receipt != pop_receipt {
            return Err(PrimitiveError::PopReceiptMismatch {
                queue: name.to_string(),
                message_id: message_id.to_string(),
            });
        }
        queue.messages.remove(index);
        Ok(())
    }

    async fn update_message(
        &self,
        name: &str,
        text: &str,
        message_id: &str,
        pop_receipt: &str,
        visibility_timeout: Duration,
    ) -> Result<String, PrimitiveError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.enter(Operation::UpdateMessage, name)?;
        let new_receipt = state.allocate_receipt();
        let queue = state.queue_mut(name)?;
        queue.purge_expired(now);
        let Some(message) = queue.messages.iter_mut().find(|m| m.id == message_id) else {
            return Err(PrimitiveError::MessageNotFound {
                queue: name.to_string(),
                message_id: message_id.to_string(),
            });
        };
        if message.pop_receipt != pop_receipt {
            return Err(PrimitiveError::PopReceiptMismatch {
                queue: name.to_string(),
                message_id: message_id.to_string(),
            });
        }
        message.text = text.to_string();
        message.visible_at = now + to_chrono(visibility_timeout);
        message.pop_receipt = new_receipt.clone();
        Ok(new_receipt)
    }

    async fn get_metadata(&self, name: &str) -> Result<QueueProperties, PrimitiveError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.enter(Operation::GetMetadata, name)?;
        let queue = state.queue_mut(name)?;
        queue.purge_expired(now);
        Ok(QueueProperties {
            metadata: queue.metadata.clone(),
            approximate_message_count: queue.messages.len() as u64,
        })
    }

    async fn set_metadata(&self, name: &str, metadata: &Metadata) -> Result<(), PrimitiveError> {
        let mut state = self.state.lock().await;
        state.enter(Operation::SetMetadata, name)?;
        state.queue_mut(name)?.metadata = metadata.clone();
        Ok(())
    }

    async fn list_queues(&self, request: ListQueuesRequest) -> Result<ListQueuesPage, PrimitiveError> {
        let mut state = self.state.lock().await;
        state.enter(Operation::ListQueues, &request.prefix)?;

        let lower = match &request.marker {
            Some(marker) => Bound::Excluded(marker.clone()),
            None => Bound::Unbounded,
        };
        let mut matching = state
            .queues
            .range((lower, Bound::Unbounded))
            .filter(|(name, _)| name.starts_with(&request.prefix))
            .map(|(name, queue)| QueueListing {
                name: name.clone(),
                metadata: request.include_metadata.then(|| queue.metadata.clone()),
            });

        let queues: Vec<QueueListing> = matching.by_ref().take(self.page_size).collect();
        let next_marker = match matching.next() {
            Some(_) => queues.last().map(|q| q.name.clone()),
            None => None,
        };
        Ok(ListQueuesPage { queues, next_marker })
    }
}
