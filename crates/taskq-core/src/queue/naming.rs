//! Shard naming: (prefix, provisionerId, workerType, priority) -> キュー名
//!
//! identifier をそのまま埋め込むと primitive の文字種・長さ制限に引っかかるので、
//! SHA-256 を 15 byte に切り詰めて base32（24 文字、小文字）にしたものを使う。
//! 衝突は暗号学的ハッシュの衝突確率でのみ起こる前提で、明示的には扱わない。

use sha2::{Digest, Sha256};

use crate::domain::{Priority, ProvisionerId, QueueError, WorkerType};

/// 切り詰めた digest の長さ（15 byte = base32 でちょうど 24 文字）
const HASH_BYTES: usize = 15;

/// ハッシュ部分の文字数
pub const HASH_LEN: usize = HASH_BYTES * 8 / 5;

/// キュー名 prefix の最大長
pub const MAX_PREFIX_LEN: usize = 6;

const MIN_QUEUE_NAME_LEN: usize = 3;
const MAX_QUEUE_NAME_LEN: usize = 63;

const BASE32_ALPHABET: &[u8; 32] = b"abcdefghijklmnopqrstuvwxyz234567";

/// RFC 4648 base32（padding なし、小文字）
fn base32_lower(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len().div_ceil(5) * 8);
    let mut buffer: u32 = 0;
    let mut bits: u32 = 0;
    for &byte in bytes {
        buffer = (buffer << 8) | u32::from(byte);
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(char::from(BASE32_ALPHABET[((buffer >> bits) & 0x1f) as usize]));
        }
        buffer &= (1 << bits) - 1;
    }
    if bits > 0 {
        out.push(char::from(BASE32_ALPHABET[((buffer << (5 - bits)) & 0x1f) as usize]));
    }
    out
}

/// identifier のハッシュ（固定長 24 文字、`[a-z2-7]`）
pub fn hash_identifier(identifier: &str) -> String {
    let digest = Sha256::digest(identifier.as_bytes());
    base32_lower(&digest[..HASH_BYTES])
}

/// 1 つの shard（優先度）のキュー名
///
/// `{prefix}-{hash(provisionerId)}-{hash(workerType)}-{tag}`
pub fn shard_name(
    prefix: &str,
    provisioner_id: &ProvisionerId,
    worker_type: &WorkerType,
    priority: Priority,
) -> String {
    format!(
        "{prefix}-{}-{}-{}",
        hash_identifier(provisioner_id.as_str()),
        hash_identifier(worker_type.as_str()),
        priority.tag()
    )
}

/// GC が一覧するときの prefix
pub fn shard_prefix(prefix: &str) -> String {
    format!("{prefix}-")
}

/// prefix: 1〜6 文字、`[a-z0-9-]`、先頭は英数字
pub fn validate_prefix(prefix: &str) -> Result<(), QueueError> {
    let valid = !prefix.is_empty()
        && prefix.len() <= MAX_PREFIX_LEN
        && prefix.starts_with(|c: char| c.is_ascii_lowercase() || c.is_ascii_digit())
        && prefix
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if !valid {
        return Err(QueueError::validation(format!(
            "queue prefix must be 1-{MAX_PREFIX_LEN} chars of [a-z0-9-] starting with a letter or digit"
        ))
        .with_context("prefix", prefix));
    }
    Ok(())
}

/// primitive のキュー名ルール: 3〜63 文字、`[a-z0-9-]`、先頭は英数字、
/// 連続ハイフンと末尾ハイフンは不可
pub fn validate_queue_name(name: &str) -> Result<(), QueueError> {
    let valid = (MIN_QUEUE_NAME_LEN..=MAX_QUEUE_NAME_LEN).contains(&name.len())
        && name.starts_with(|c: char| c.is_ascii_lowercase() || c.is_ascii_digit())
        && !name.ends_with('-')
        && !name.contains("--")
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if !valid {
        return Err(QueueError::validation("invalid queue name").with_context("queue", name));
    }
    Ok(())
}
