//! taskq-core
//!
//! CI タスク配信のためのキュー層。
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, priority, task, messages, errors）
//! - **ports**: 抽象化レイヤー（QueuePrimitiveClient, Clock, IdGenerator, ErrorReporter）
//! - **impls**: ports の実装（InMemoryQueueClient, HttpQueueClient, error reporters）
//! - **queue**: shard の命名、codec、pending / expiration キュー、GC
//! - **app**: 構築（AppBuilder）とバックグラウンドループ
//! - **config**: 環境変数からの設定
//!
//! # 前提
//! - キューのメッセージはヒントであり、タスクの状態の正本ではない
//! - primitive は at-least-once。同じヒントが複数回届いてもよい

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;
pub mod queue;

pub use crate::app::{AppBuilder, QueueService};
pub use crate::config::{Config, QueueBackend, QueueSettings};
pub use crate::domain::{ErrorKind, QueueError, QueueResult};
