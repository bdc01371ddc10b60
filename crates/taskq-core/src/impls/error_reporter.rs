//! ErrorReporter の実装

use std::sync::Mutex;

use crate::domain::QueueError;
use crate::ports::ErrorReporter;

/// `tracing::error!` に構造化して出力する
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingErrorReporter;

impl ErrorReporter for TracingErrorReporter {
    fn report(&self, error: &QueueError) {
        let context = error
            .context()
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(" ");
        tracing::error!(
            kind = %error.kind(),
            queue = error.context_value("queue").unwrap_or_default(),
            note = error.context_value("note").unwrap_or_default(),
            context = %context,
            "{}",
            error.message()
        );
    }
}

/// 報告されたエラーをメモリに貯める（テスト用）
#[derive(Debug, Default)]
pub struct CollectingErrorReporter {
    reported: Mutex<Vec<QueueError>>,
}

impl CollectingErrorReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reported(&self) -> Vec<QueueError> {
        self.reported
            .lock()
            .map(|errors| errors.clone())
            .unwrap_or_default()
    }
}

impl ErrorReporter for CollectingErrorReporter {
    fn report(&self, error: &QueueError) {
        if let Ok(mut errors) = self.reported.lock() {
            errors.push(error.clone());
        }
    }
}
