//! HttpQueueClient - REST ゲートウェイ経由のキュー primitive
//!
//! JSON で primitive の操作をそのまま公開しているゲートウェイを想定しています。
//! エラーボディの `code` が QueueNotFound などの既知コードなら明示的な variant に、
//! それ以外はステータスごと `PrimitiveError::Status` に変換します。

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, Url};
use serde::{Deserialize, Serialize};

use crate::ports::{
    GetOptions, ListQueuesPage, ListQueuesRequest, MAX_MESSAGES_PER_GET, Metadata, PrimitiveError,
    PutOptions, QueueListing, QueuePrimitiveClient, QueueProperties, RawMessage,
};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateQueueBody<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: Option<&'a Metadata>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PutMessageBody<'a> {
    message_text: &'a str,
    visibility_timeout: u64,
    message_ttl: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UpdateMessageBody<'a> {
    message_text: &'a str,
}

#[derive(Debug, Serialize)]
struct MetadataBody<'a> {
    metadata: &'a Metadata,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageResponse {
    message_id: String,
    pop_receipt: String,
    message_text: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateMessageResponse {
    pop_receipt: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PropertiesResponse {
    #[serde(default)]
    metadata: Metadata,
    #[serde(default)]
    approximate_message_count: u64,
}

#[derive(Debug, Deserialize)]
struct ListedQueue {
    name: String,
    #[serde(default)]
    metadata: Option<Metadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListQueuesResponse {
    #[serde(default)]
    queues: Vec<ListedQueue>,
    #[serde(default)]
    next_marker: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<String>,
}

/// HttpQueueClient は REST ゲートウェイに対するクライアント
#[derive(Debug, Clone)]
pub struct HttpQueueClient {
    client: Client,
    base_url: Url,
    access_token: Option<String>,
}

impl HttpQueueClient {
    pub fn new(endpoint: &str, access_token: Option<String>, timeout: Duration) -> Result<Self, PrimitiveError> {
        let base_url =
            Url::parse(endpoint).map_err(|e| PrimitiveError::InvalidEndpoint(format!("{endpoint}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(PrimitiveError::InvalidEndpoint(format!(
                "{endpoint} cannot be used as a base url"
            )));
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PrimitiveError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url,
            access_token,
        })
    }

    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn request(&self, method: Method, segments: &[&str]) -> RequestBuilder {
        let builder = self.client.request(method, self.url(segments));
        match &self.access_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response, PrimitiveError> {
        builder.send().await.map_err(|e| {
            if e.is_timeout() {
                PrimitiveError::Timeout
            } else {
                PrimitiveError::Transport(e.to_string())
            }
        })
    }

    /// 成功ステータス以外をエラーに変換する
    async fn check(
        response: Response,
        queue: &str,
        message_id: Option<&str>,
    ) -> Result<Response, PrimitiveError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let code = serde_json::from_str::<ErrorBody>(&body)
            .unwrap_or_default()
            .code;
        let queue = queue.to_string();
        let message_id = message_id.unwrap_or_default().to_string();
        Err(match code.as_deref() {
            Some("QueueNotFound") => PrimitiveError::QueueNotFound { queue },
            Some("QueueAlreadyExists") => PrimitiveError::QueueAlreadyExists { queue },
            Some("MessageNotFound") => PrimitiveError::MessageNotFound { queue, message_id },
            Some("PopReceiptMismatch") => PrimitiveError::PopReceiptMismatch { queue, message_id },
            _ => PrimitiveError::Status {
                status: status.as_u16(),
                code,
                body,
            },
        })
    }

    async fn json<T: for<'de> Deserialize<'de>>(response: Response) -> Result<T, PrimitiveError> {
        response
            .json::<T>()
            .await
            .map_err(|e| PrimitiveError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl QueuePrimitiveClient for HttpQueueClient {
    async fn create_queue(&self, name: &str, metadata: Option<&Metadata>) -> Result<(), PrimitiveError> {
        let builder = self
            .request(Method::PUT, &["queues", name])
            .json(&CreateQueueBody { metadata });
        let response = self.send(builder).await?;
        if response.status() == StatusCode::CONFLICT {
            return Err(PrimitiveError::QueueAlreadyExists {
                queue: name.to_string(),
            });
        }
        Self::check(response, name, None).await?;
        Ok(())
    }

    async fn delete_queue(&self, name: &str) -> Result<(), PrimitiveError> {
        let response = self.send(self.request(Method::DELETE, &["queues", name])).await?;
        Self::check(response, name, None).await?;
        Ok(())
    }

    async fn put_message(&self, name: &str, text: &str, options: PutOptions) -> Result<(), PrimitiveError> {
        let builder = self
            .request(Method::POST, &["queues", name, "messages"])
            .json(&PutMessageBody {
                message_text: text,
                visibility_timeout: options.visibility_timeout.as_secs(),
                message_ttl: options.ttl.as_secs(),
            });
        let response = self.send(builder).await?;
        Self::check(response, name, None).await?;
        Ok(())
    }

    async fn get_messages(&self, name: &str, options: GetOptions) -> Result<Vec<RawMessage>, PrimitiveError> {
        let count = options.max_count.clamp(1, MAX_MESSAGES_PER_GET);
        let builder = self
            .request(Method::GET, &["queues", name, "messages"])
            .query(&[
                ("numOfMessages", count.to_string()),
                (
                    "visibilityTimeout",
                    options.visibility_timeout.as_secs().to_string(),
                ),
            ]);
        let response = Self::check(self.send(builder).await?, name, None).await?;
        let messages: Vec<MessageResponse> = Self::json(response).await?;
        Ok(messages
            .into_iter()
            .map(|m| RawMessage {
                message_id: m.message_id,
                pop_receipt: m.pop_receipt,
                text: m.message_text,
            })
            .collect())
    }

    async fn delete_message(
        &self,
        name: &str,
        message_id: &str,
        pop_receipt: &str,
    ) -> Result<(), PrimitiveError> {
        let builder = self
            .request(Method::DELETE, &["queues", name, "messages", message_id])
            .query(&[("popReceipt", pop_receipt)]);
        let response = self.send(builder).await?;
        Self::check(response, name, Some(message_id)).await?;
        Ok(())
    }

    async fn update_message(
        &self,
        name: &str,
        text: &str,
        message_id: &str,
        pop_receipt: &str,
        visibility_timeout: Duration,
    ) -> Result<String, PrimitiveError> {
        let builder = self
            .request(Method::PUT, &["queues", name, "messages", message_id])
            .query(&[
                ("popReceipt", pop_receipt.to_string()),
                ("visibilityTimeout", visibility_timeout.as_secs().to_string()),
            ])
            .json(&UpdateMessageBody { message_text: text });
        let response = Self::check(self.send(builder).await?, name, Some(message_id)).await?;
        let updated: UpdateMessageResponse = Self::json(response).await?;
        Ok(updated.pop_receipt)
    }

    async fn get_metadata(&self, name: &str) -> Result<QueueProperties, PrimitiveError> {
        let builder = self.request(Method::GET, &["queues", name, "metadata"]);
        let response = Self::check(self.send(builder).await?, name, None).await?;
        let properties: PropertiesResponse = Self::json(response).await?;
        Ok(QueueProperties {
            metadata: properties.metadata,
            approximate_message_count: properties.approximate_message_count,
        })
    }

    async fn set_metadata(&self, name: &str, metadata: &Metadata) -> Result<(), PrimitiveError> {
        let builder = self
            .request(Method::PUT, &["queues", name, "metadata"])
            .json(&MetadataBody { metadata });
        let response = self.send(builder).await?;
        Self::check(response, name, None).await?;
        Ok(())
    }

    async fn list_queues(&self, request: ListQueuesRequest) -> Result<ListQueuesPage, PrimitiveError> {
        let mut query = vec![("prefix", request.prefix.clone())];
        if let Some(marker) = &request.marker {
            query.push(("marker", marker.clone()));
        }
        if request.include_metadata {
            query.push(("include", "metadata".to_string()));
        }
        let builder = self.request(Method::GET, &["queues"]).query(&query);
        let response = Self::check(self.send(builder).await?, &request.prefix, None).await?;
        let listed: ListQueuesResponse = Self::json(response).await?;
        Ok(ListQueuesPage {
            queues: listed
                .queues
                .into_iter()
                .map(|q| QueueListing {
                    name: q.name,
                    metadata: q.metadata,
                })
                .collect(),
            next_marker: listed.next_marker.filter(|m| !m.is_empty()),
        })
    }
}
