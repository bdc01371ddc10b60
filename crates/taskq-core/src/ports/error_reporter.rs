//! ErrorReporter port - エラーの out-of-band 報告
//!
//! 呼び出し側がエラーを握りつぶしても運用上の可視性を失わないように、
//! ensure/create の想定外エラーはここにも報告する。
//!
//! # 実装
//! - TracingErrorReporter: `tracing::error!` に構造化して出力（本番用）
//! - CollectingErrorReporter: メモリに貯める（テスト用）

use crate::domain::QueueError;

/// ErrorReporter はエラー報告先
///
/// 報告は同期・失敗しない。送信が必要な実装は内部でバッファする。
pub trait ErrorReporter: Send + Sync {
    fn report(&self, error: &QueueError);
}
