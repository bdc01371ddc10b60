//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **InMemoryQueueClient**: 開発・テスト用のキュー primitive
//! - **HttpQueueClient**: REST ゲートウェイ経由のキュー primitive（本番用）
//! - **TracingErrorReporter / CollectingErrorReporter**: エラー報告先

pub mod error_reporter;
pub mod http_queue;
pub mod inmem_queue;

// 主要な型を再エクスポート
pub use self::error_reporter::{CollectingErrorReporter, TracingErrorReporter};
pub use self::http_queue::HttpQueueClient;
pub use self::inmem_queue::{InMemoryQueueClient, OpCounts, Operation};
