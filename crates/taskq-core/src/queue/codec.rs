//! Message codec: JSON -> UTF-8 -> base64
//!
//! primitive はメッセージ本文の文字種を制限していることが多いので、常に base64 で渡す。

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::domain::QueueError;

pub fn encode<T: Serialize>(message: &T) -> Result<String, QueueError> {
    let json = serde_json::to_vec(message)
        .map_err(|e| QueueError::codec("failed to serialize message").with_source(e))?;
    Ok(BASE64.encode(json))
}

pub fn decode<T: DeserializeOwned>(text: &str) -> Result<T, QueueError> {
    let bytes = BASE64
        .decode(text.trim())
        .map_err(|e| QueueError::codec("message is not valid base64").with_source(e))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| QueueError::codec("message is not a valid JSON payload").with_source(e))
}
