//! Priority - タスクの優先度
//!
//! 優先度ごとに 1 文字の shard tag を持ち、キュー名に埋め込まれます。
//! tag を変えると既存のキュー名が変わるので、順序と tag は固定です。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::errors::QueueError;

/// Priority は 7 段階の優先度
///
/// `Ord` は宣言順なので `Lowest < ... < Highest`。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Priority {
    Lowest,
    VeryLow,
    Low,
    Medium,
    High,
    VeryHigh,
    Highest,
}

impl Priority {
    /// 高い順（polling する順）
    pub const ALL: [Priority; 7] = [
        Priority::Highest,
        Priority::VeryHigh,
        Priority::High,
        Priority::Medium,
        Priority::Low,
        Priority::VeryLow,
        Priority::Lowest,
    ];

    /// キュー名に使う shard tag
    pub fn tag(&self) -> char {
        match self {
            Priority::Highest => '1',
            Priority::VeryHigh => '2',
            Priority::High => '3',
            Priority::Medium => '4',
            Priority::Low => '5',
            Priority::VeryLow => '6',
            Priority::Lowest => '7',
        }
    }

    /// `ALL` の中での位置（0 = highest）
    pub fn index(&self) -> usize {
        Priority::Highest as usize - *self as usize
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Highest => "highest",
            Priority::VeryHigh => "very-high",
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
            Priority::VeryLow => "very-low",
            Priority::Lowest => "lowest",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Priority::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| {
                QueueError::invalid_identifier("unknown priority").with_context("priority", s)
            })
    }
}
