//! Messages - キューに流すメッセージ
//!
//! どのメッセージも「ヒント」であり、正本はタスクの状態遷移の側にある。
//! 重複・遅延・順序の入れ替わりは受け取る側で冪等に処理すること。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::errors::QueueError;
use super::ids::{HintId, TaskId};

/// 実行可能になった task run の通知
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingMessage {
    pub task_id: TaskId,
    pub run_id: u32,
    pub hint_id: HintId,
}

/// claim の期限切れ候補（takenUntil 以降に見える）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimMessage {
    pub task_id: TaskId,
    pub run_id: u32,
    pub taken_until: DateTime<Utc>,
}

/// deadline 超過の候補（deadline + 遅延 以降に見える）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadlineMessage {
    pub task_id: TaskId,
    pub task_group_id: String,
    pub scheduler_id: String,
    pub deadline: DateTime<Utc>,
}

/// タスクの解決通知（依存関係の解決に使う）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedMessage {
    pub task_id: TaskId,
    pub task_group_id: String,
    pub scheduler_id: String,
    pub resolution: Resolution,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    Completed,
    Failed,
    Exception,
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::Completed => "completed",
            Resolution::Failed => "failed",
            Resolution::Exception => "exception",
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Resolution {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(Resolution::Completed),
            "failed" => Ok(Resolution::Failed),
            "exception" => Ok(Resolution::Exception),
            other => Err(QueueError::validation(
                "resolution must be one of completed, failed or exception",
            )
            .with_context("resolution", other)),
        }
    }
}
