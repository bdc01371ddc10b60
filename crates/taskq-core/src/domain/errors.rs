//! Errors - エラー型と分類
//!
//! QueueError は kind（運用分類）とメッセージに加えて、
//! エラー報告先（ErrorReporter）へ渡すためのコンテキスト（queue, note など）を持ちます。

use std::fmt;
use std::sync::Arc;

use crate::ports::PrimitiveError;

/// ErrorKind は QueueError の分類
///
/// # 分類
/// - InvalidIdentifier / Validation: 呼び出し側のバグ（I/O 前に失敗、リトライ無意味）
/// - QueueNotFound / QueueAlreadyExists: 内部で処理される（作成トリガー / 競合）
/// - Transient: primitive 側のエラー（呼び出し側がリトライを判断）
/// - AssertionViolation: 内部不変条件の破綻（pop receipt の不一致など）
/// - Codec: メッセージの encode/decode 失敗
/// - Cancelled: shutdown によるキャンセル
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidIdentifier,
    Validation,
    QueueNotFound,
    QueueAlreadyExists,
    Transient,
    AssertionViolation,
    Codec,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidIdentifier => "invalid_identifier",
            ErrorKind::Validation => "validation",
            ErrorKind::QueueNotFound => "queue_not_found",
            ErrorKind::QueueAlreadyExists => "queue_already_exists",
            ErrorKind::Transient => "transient",
            ErrorKind::AssertionViolation => "assertion_violation",
            ErrorKind::Codec => "codec",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// QueueError は queue レイヤーのエラー
///
/// `Clone` なのは、同じ in-flight の ensure を待っている全員に同じ失敗を返すため。
#[derive(Debug, Clone)]
pub struct QueueError {
    kind: ErrorKind,
    message: String,
    context: Vec<(&'static str, String)>,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl QueueError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            context: Vec::new(),
            source: None,
        }
    }

    pub fn invalid_identifier(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidIdentifier, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn codec(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Codec, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, message)
    }

    /// コンテキストを追加（同じ key は上書き）
    pub fn with_context(mut self, key: &'static str, value: impl Into<String>) -> Self {
        let value = value.into();
        match self.context.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.context.push((key, value)),
        }
        self
    }

    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn context(&self) -> &[(&'static str, String)] {
        &self.context
    }

    pub fn context_value(&self, key: &str) -> Option<&str> {
        self.context
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    /// 呼び出し側がリトライしてよいか
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind, ErrorKind::Transient | ErrorKind::Cancelled)
    }
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (kind: {})", self.message, self.kind)?;
        for (key, value) in &self.context {
            write!(f, " {key}={value}")?;
        }
        Ok(())
    }
}

impl std::error::Error for QueueError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

impl From<PrimitiveError> for QueueError {
    fn from(err: PrimitiveError) -> Self {
        let kind = match &err {
            e if e.is_not_found() => ErrorKind::QueueNotFound,
            PrimitiveError::QueueAlreadyExists { .. } => ErrorKind::QueueAlreadyExists,
            PrimitiveError::PopReceiptMismatch { .. } => ErrorKind::AssertionViolation,
            PrimitiveError::InvalidEndpoint(_) => ErrorKind::Validation,
            _ => ErrorKind::Transient,
        };
        let mut error = QueueError::new(kind, err.to_string());
        if let Some(queue) = err.queue() {
            error = error.with_context("queue", queue);
        }
        error.with_source(err)
    }
}

pub type QueueResult<T> = Result<T, QueueError>;
