use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::QueueError;
use super::ids::{ProvisionerId, TaskId, WorkerType};
use super::priority::Priority;

/// Pending キューへのルーティングに必要なタスクの情報。
///
/// 永続化されたタスク本体は呼び出し側が持つ。ここでは読むだけ。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRef {
    pub task_id: TaskId,
    pub provisioner_id: ProvisionerId,
    pub worker_type: WorkerType,
    pub deadline: DateTime<Utc>,
    pub priority: Priority,
}

impl TaskRef {
    pub fn new(
        task_id: TaskId,
        provisioner_id: ProvisionerId,
        worker_type: WorkerType,
        deadline: DateTime<Utc>,
        priority: Priority,
    ) -> Self {
        Self {
            task_id,
            provisioner_id,
            worker_type,
            deadline,
            priority,
        }
    }

    /// identifier は型で保証済みなので、残りは task_id だけ
    pub fn validate(&self) -> Result<(), QueueError> {
        let task_id = self.task_id.as_str();
        if task_id.is_empty() || task_id.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(QueueError::validation("taskId must be a non-empty token")
                .with_context("task_id", task_id));
        }
        Ok(())
    }
}
