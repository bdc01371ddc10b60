//! App - アプリケーション層
//!
//! queue モジュールの部品を組み合わせて、1 つのサービスとして動かします。
//!
//! # 主要コンポーネント
//! - **AppBuilder**: 設定と依存からの構築（起動時検証）
//! - **QueueService**: PendingQueueManager + ExpirationQueues + バックグラウンドタスク
//! - **GcLoop**: 使われなくなった pending キューの定期削除
//! - **CacheResetLoop**: キュー存在キャッシュの定期リセット

pub mod builder;
pub mod cache_reset_loop;
pub mod gc_loop;
pub mod service;

// 主要な型を再エクスポート
pub use self::builder::{AppBuilder, BuildError};
pub use self::cache_reset_loop::CacheResetLoop;
pub use self::gc_loop::GcLoop;
pub use self::service::QueueService;
