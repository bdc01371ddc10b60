//! Domain identifiers (strongly-typed IDs).
//!
//! # 識別子の種類
//! - **ProvisionerId / WorkerType**: キュー名の材料になる識別子（`[A-Za-z0-9_-]{1,38}`）
//! - **TaskId**: 呼び出し側が持つ不透明な文字列
//! - **HintId**: pending メッセージを publish するたびに生成する ULID
//!
//! ProvisionerId と WorkerType は同じ文字種ルールを持ちますが、別の型にしています。
//! 引数の取り違え（provisioner と worker type の入れ替え）がコンパイルエラーになります。

use serde::{Deserialize, Serialize};
use std::fmt;
use ulid::Ulid;

use super::errors::QueueError;

/// 識別子の最大長
pub const MAX_IDENTIFIER_LEN: usize = 38;

/// `[A-Za-z0-9_-]{1,38}` を満たすか検証
pub fn validate_identifier(kind: &str, value: &str) -> Result<(), QueueError> {
    let valid_chars = value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if value.is_empty() || value.len() > MAX_IDENTIFIER_LEN || !valid_chars {
        return Err(
            QueueError::invalid_identifier(format!(
                "{kind} must match [A-Za-z0-9_-]{{1,{MAX_IDENTIFIER_LEN}}}"
            ))
            .with_context(kind_field(kind), value),
        );
    }
    Ok(())
}

fn kind_field(kind: &str) -> &'static str {
    match kind {
        "provisionerId" => "provisioner_id",
        "workerType" => "worker_type",
        _ => "identifier",
    }
}

macro_rules! identifier {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Result<Self, QueueError> {
                let value = value.into();
                validate_identifier($label, &value)?;
                Ok(Self(value))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $name {
            type Error = QueueError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

identifier!(
    /// Provisioner の識別子
    ProvisionerId,
    "provisionerId"
);

identifier!(
    /// Worker type の識別子
    WorkerType,
    "workerType"
);

/// Identifier of a task (opaque to this crate).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Pending メッセージごとの hint ID
///
/// 同じ task run が複数回 publish されても、受け取った側がどの publish かを区別できる。
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HintId(Ulid);

impl HintId {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    pub fn as_ulid(&self) -> Ulid {
        self.0
    }
}

impl From<Ulid> for HintId {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl fmt::Display for HintId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ErrorKind;
    use rstest::rstest;

    #[rstest]
    #[case("aws-provisioner-v1")]
    #[case("gecko_t_linux")]
    #[case("A")]
    #[case("abcdefghijabcdefghijabcdefghijabcdefgh")] // 38 文字
    fn valid_identifiers_are_accepted(#[case] value: &str) {
        assert!(ProvisionerId::new(value).is_ok());
        assert!(WorkerType::new(value).is_ok());
    }

    #[rstest]
    #[case("")]
    #[case("has space")]
    #[case("slash/inside")]
    #[case("dotted.name")]
    #[case("abcdefghijabcdefghijabcdefghijabcdefghi")] // 39 文字
    fn invalid_identifiers_are_rejected(#[case] value: &str) {
        let err = WorkerType::new(value).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidIdentifier);
        assert_eq!(err.context_value("worker_type"), Some(value));
    }

    #[test]
    fn deserialize_validates_identifiers() {
        let ok: ProvisionerId = serde_json::from_str("\"prov-1\"").unwrap();
        assert_eq!(ok.as_str(), "prov-1");

        let err = serde_json::from_str::<ProvisionerId>("\"prov 1\"");
        assert!(err.is_err());
    }

    #[test]
    fn hint_id_serializes_as_plain_string() {
        let ulid = Ulid::new();
        let hint = HintId::from_ulid(ulid);

        let serialized = serde_json::to_string(&hint).unwrap();
        assert_eq!(serialized, format!("\"{ulid}\""));

        let deserialized: HintId = serde_json::from_str(&serialized).unwrap();
        assert_eq!(deserialized, hint);
    }
}
