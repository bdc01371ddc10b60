//! Ports - 抽象化レイヤー
//!
//! このモジュールは Hexagonal Architecture の「ポート」を定義します。
//! 各 trait は外部システム（キュー primitive、時刻、エラー報告先）への
//! インターフェースを提供し、実装の詳細を隠蔽します。
//!
//! # 設計原則
//! - タスクの状態遷移が source of truth（正本）
//! - キューのメッセージはヒント・トリガーに過ぎない
//! - primitive は at-least-once、順序・優先度の保証なし

pub mod clock;
pub mod error_reporter;
pub mod id_generator;
pub mod queue_client;

// 主要な trait を再エクスポート
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::error_reporter::ErrorReporter;
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::queue_client::{
    GetOptions, ListQueuesPage, ListQueuesRequest, MAX_MESSAGES_PER_GET, Metadata, PrimitiveError,
    PutOptions, QueueListing, QueuePrimitiveClient, QueueProperties, RawMessage,
};
