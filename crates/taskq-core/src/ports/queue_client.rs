//! QueuePrimitiveClient port - 追記型クラウドキューの最小インターフェース
//!
//! このクレートはキュー primitive を「結果整合・at-least-once の配送路」として扱います。
//! 優先度も中身の参照も primitive には期待しません。
//!
//! # 実装
//! - **InMemoryQueueClient**: テスト・開発用（impls/inmem_queue.rs）
//! - **HttpQueueClient**: REST ゲートウェイ経由（impls/http_queue.rs）

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;

/// キューに付与する out-of-band のメタデータ
pub type Metadata = BTreeMap<String, String>;

/// 1 回の get で取れる最大件数
pub const MAX_MESSAGES_PER_GET: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum PrimitiveError {
    #[error("queue {queue} does not exist")]
    QueueNotFound { queue: String },

    #[error("queue {queue} already exists")]
    QueueAlreadyExists { queue: String },

    #[error("message {message_id} not found in queue {queue}")]
    MessageNotFound { queue: String, message_id: String },

    #[error("pop receipt mismatch for message {message_id} in queue {queue}")]
    PopReceiptMismatch { queue: String, message_id: String },

    #[error("queue service responded with status {status}: {body}")]
    Status {
        status: u16,
        code: Option<String>,
        body: String,
    },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timed out")]
    Timeout,

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// client を作る時点で endpoint が使えない（設定の誤り）
    #[error("invalid queue endpoint: {0}")]
    InvalidEndpoint(String),
}

impl PrimitiveError {
    /// 明示的な not-found と、汎用 404 から合成した not-found の両方を含む
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            PrimitiveError::QueueNotFound { .. } | PrimitiveError::Status { status: 404, .. }
        )
    }

    pub fn queue(&self) -> Option<&str> {
        match self {
            PrimitiveError::QueueNotFound { queue }
            | PrimitiveError::QueueAlreadyExists { queue }
            | PrimitiveError::MessageNotFound { queue, .. }
            | PrimitiveError::PopReceiptMismatch { queue, .. } => Some(queue),
            _ => None,
        }
    }
}

/// put_message のオプション
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PutOptions {
    /// 最初に見えるようになるまでの遅延
    pub visibility_timeout: Duration,
    /// primitive が破棄するまでの最大寿命
    pub ttl: Duration,
}

/// get_messages のオプション
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetOptions {
    /// lease の長さ（取得後、他の poller から見えない時間）
    pub visibility_timeout: Duration,
    pub max_count: usize,
}

/// get_messages で受け取ったメッセージ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub message_id: String,
    pub pop_receipt: String,
    /// base64 テキスト
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueProperties {
    pub metadata: Metadata,
    /// 概算（見えない message も含む）
    pub approximate_message_count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListQueuesRequest {
    pub prefix: String,
    pub marker: Option<String>,
    pub include_metadata: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueListing {
    pub name: String,
    pub metadata: Option<Metadata>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListQueuesPage {
    pub queues: Vec<QueueListing>,
    /// None なら最後のページ
    pub next_marker: Option<String>,
}

/// QueuePrimitiveClient はキュー primitive へのアクセス
///
/// # Thread Safety
/// - `Send + Sync` を要求（manager とバックグラウンドタスクで共有する）
#[async_trait]
pub trait QueuePrimitiveClient: Send + Sync {
    async fn create_queue(&self, name: &str, metadata: Option<&Metadata>) -> Result<(), PrimitiveError>;

    async fn delete_queue(&self, name: &str) -> Result<(), PrimitiveError>;

    async fn put_message(&self, name: &str, text: &str, options: PutOptions) -> Result<(), PrimitiveError>;

    async fn get_messages(&self, name: &str, options: GetOptions) -> Result<Vec<RawMessage>, PrimitiveError>;

    async fn delete_message(
        &self,
        name: &str,
        message_id: &str,
        pop_receipt: &str,
    ) -> Result<(), PrimitiveError>;

    /// 可視性を更新し、新しい pop receipt を返す
    async fn update_message(
        &self,
        name: &str,
        text: &str,
        message_id: &str,
        pop_receipt: &str,
        visibility_timeout: Duration,
    ) -> Result<String, PrimitiveError>;

    async fn get_metadata(&self, name: &str) -> Result<QueueProperties, PrimitiveError>;

    async fn set_metadata(&self, name: &str, metadata: &Metadata) -> Result<(), PrimitiveError>;

    async fn list_queues(&self, request: ListQueuesRequest) -> Result<ListQueuesPage, PrimitiveError>;
}
