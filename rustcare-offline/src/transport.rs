//! Network boundary
//!
//! One request per queued operation (method chosen by the operation kind)
//! and one read per cache miss. Every write carries the operation id as an
//! `Idempotency-Key`, so a retry after a lost response is not applied twice.
//!
//! Wire format:
//! - `create` -> `POST   {base}/{type}/{id}`
//! - `update` -> `PUT    {base}/{type}/{id}`
//! - `delete` -> `DELETE {base}/{type}/{id}`
//! - fetch    -> `GET    {base}/{type}/{id}`
//! - probe    -> `GET    {base}/health`
//!
//! 2xx and 409 bodies are `{"data": <value | null>}`; 409 reports the
//! server's current value without having applied the write. 204 and 404 mean
//! the server holds no value.

use crate::config::OfflineConfig;
use crate::error::{SyncError, SyncResult, TransportError};
use crate::model::{EntityKey, OperationKind, QueuedOperation};
use crate::network::LivenessProbe;
use async_trait::async_trait;
use reqwest::{Method, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// What the server holds for an entity after processing an operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerReply {
    /// `None` when the entity does not exist on the server
    pub current: Option<Value>,
}

impl ServerReply {
    pub fn holding(value: Value) -> Self {
        Self {
            current: if value.is_null() { None } else { Some(value) },
        }
    }

    pub fn absent() -> Self {
        Self { current: None }
    }
}

#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Send one queued operation
    async fn push(&self, operation: &QueuedOperation) -> Result<ServerReply, TransportError>;

    /// Read the server's current value of an entity
    async fn fetch(&self, key: &EntityKey) -> Result<Option<Value>, TransportError>;
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    data: Value,
}

/// HTTP transport against the RustCare entity API
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: Url,
    auth_token: Option<String>,
}

impl HttpTransport {
    pub fn new(config: &OfflineConfig) -> SyncResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| SyncError::Config(format!("Failed to create HTTP client: {}", e)))?;

        let base_url = Url::parse(&config.server_url)
            .map_err(|e| SyncError::Config(format!("Invalid server_url: {}", e)))?;

        if base_url.cannot_be_a_base() {
            return Err(SyncError::Config(format!(
                "server_url cannot be a base URL: {}",
                config.server_url
            )));
        }

        Ok(Self {
            client,
            base_url,
            auth_token: config.auth_token.clone(),
        })
    }

    fn url(&self, segments: &[&str]) -> Result<Url, TransportError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| TransportError::Malformed("server_url cannot be a base".to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> reqwest::RequestBuilder {
        let request = self.client.request(method, url);
        match &self.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn read_reply(response: reqwest::Response) -> Result<Option<Value>, TransportError> {
        let status = response.status();

        if status == StatusCode::NO_CONTENT || status == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        if status.is_success() || status == StatusCode::CONFLICT {
            let envelope: Envelope = response
                .json()
                .await
                .map_err(|e| TransportError::Malformed(e.to_string()))?;
            return Ok(ServerReply::holding(envelope.data).current);
        }

        let message = response.text().await.unwrap_or_default();
        Err(TransportError::Status {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl SyncTransport for HttpTransport {
    async fn push(&self, operation: &QueuedOperation) -> Result<ServerReply, TransportError> {
        let url = self.url(&[&operation.key.entity_type, &operation.key.entity_id])?;
        let method = match operation.kind {
            OperationKind::Create => Method::POST,
            OperationKind::Update => Method::PUT,
            OperationKind::Delete => Method::DELETE,
        };

        let mut request = self
            .request(method, url)
            .header(IDEMPOTENCY_HEADER, operation.id.to_string());
        if operation.kind != OperationKind::Delete {
            request = request.json(&operation.payload);
        }

        tracing::debug!(
            operation_id = %operation.id,
            entity_type = %operation.key.entity_type,
            entity_id = %operation.key.entity_id,
            operation = operation.kind.as_str(),
            attempt = operation.attempt_count + 1,
            "Pushing operation"
        );

        let response = request.send().await?;
        let current = Self::read_reply(response).await?;
        Ok(ServerReply { current })
    }

    async fn fetch(&self, key: &EntityKey) -> Result<Option<Value>, TransportError> {
        let url = self.url(&[&key.entity_type, &key.entity_id])?;
        let response = self.request(Method::GET, url).send().await?;
        Self::read_reply(response).await
    }
}

#[async_trait]
impl LivenessProbe for HttpTransport {
    async fn probe(&self) -> bool {
        let url = match self.url(&["health"]) {
            Ok(url) => url,
            Err(_) => return false,
        };

        match self.request(Method::GET, url).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::debug!(error = %e, "Liveness probe failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::HybridTimestamp;
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn transport_for(url: String) -> HttpTransport {
        let config = OfflineConfig {
            server_url: url,
            auth_token: Some("token-123".to_string()),
            request_timeout_secs: 5,
            ..OfflineConfig::default()
        };
        HttpTransport::new(&config).unwrap()
    }

    fn operation(kind: OperationKind, payload: Value) -> QueuedOperation {
        QueuedOperation {
            id: Uuid::new_v4(),
            seq: 1,
            key: EntityKey::new("queue", "q1"),
            kind,
            payload_hash: String::new(),
            payload,
            version: HybridTimestamp::zero(),
            enqueued_at: Utc::now(),
            attempt_count: 0,
            last_error: None,
        }
    }

    #[tokio::test]
    async fn test_update_sends_idempotency_key_and_payload() {
        let mut server = mockito::Server::new_async().await;
        let op = operation(OperationKind::Update, json!({"status": "called"}));

        let mock = server
            .mock("PUT", "/queue/q1")
            .match_header("idempotency-key", op.id.to_string().as_str())
            .match_header("authorization", "Bearer token-123")
            .match_body(mockito::Matcher::Json(json!({"status": "called"})))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"data": {"id": "srv-1", "status": "called"}}"#)
            .create_async()
            .await;

        let reply = transport_for(server.url()).push(&op).await.unwrap();

        mock.assert_async().await;
        assert_eq!(reply.current, Some(json!({"id": "srv-1", "status": "called"})));
    }

    #[tokio::test]
    async fn test_methods_follow_operation_kind() {
        let mut server = mockito::Server::new_async().await;
        let create = server
            .mock("POST", "/queue/q1")
            .with_status(201)
            .with_body(r#"{"data": {"status": "waiting"}}"#)
            .create_async()
            .await;
        let delete = server
            .mock("DELETE", "/queue/q1")
            .with_status(204)
            .create_async()
            .await;

        let transport = transport_for(server.url());
        let created = transport
            .push(&operation(OperationKind::Create, json!({"status": "waiting"})))
            .await
            .unwrap();
        let deleted = transport
            .push(&operation(OperationKind::Delete, Value::Null))
            .await
            .unwrap();

        create.assert_async().await;
        delete.assert_async().await;
        assert_eq!(created.current, Some(json!({"status": "waiting"})));
        assert_eq!(deleted.current, None);
    }

    #[tokio::test]
    async fn test_conflict_status_reports_current_value() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("PUT", "/queue/q1")
            .with_status(409)
            .with_body(r#"{"data": {"status": "completed"}}"#)
            .create_async()
            .await;

        let reply = transport_for(server.url())
            .push(&operation(OperationKind::Update, json!({"status": "called"})))
            .await
            .unwrap();

        assert_eq!(reply.current, Some(json!({"status": "completed"})));
    }

    #[tokio::test]
    async fn test_server_error_is_transport_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("PUT", "/queue/q1")
            .with_status(503)
            .with_body("maintenance")
            .create_async()
            .await;

        let result = transport_for(server.url())
            .push(&operation(OperationKind::Update, json!({})))
            .await;

        assert_eq!(
            result,
            Err(TransportError::Status {
                status: 503,
                message: "maintenance".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_malformed_body_is_transport_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("PUT", "/queue/q1")
            .with_status(200)
            .with_body("<html>proxy login</html>")
            .create_async()
            .await;

        let result = transport_for(server.url())
            .push(&operation(OperationKind::Update, json!({})))
            .await;

        assert!(matches!(result, Err(TransportError::Malformed(_))));
    }

    #[tokio::test]
    async fn test_fetch_missing_entity() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/queue/q1")
            .with_status(404)
            .create_async()
            .await;

        let value = transport_for(server.url())
            .fetch(&EntityKey::new("queue", "q1"))
            .await
            .unwrap();
        assert_eq!(value, None);
    }

    #[tokio::test]
    async fn test_probe() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/health")
            .with_status(200)
            .create_async()
            .await;

        assert!(transport_for(server.url()).probe().await);
        assert!(!transport_for("http://127.0.0.1:9".to_string()).probe().await);
    }

    #[tokio::test]
    async fn test_unreachable_server() {
        let result = transport_for("http://127.0.0.1:9".to_string())
            .fetch(&EntityKey::new("queue", "q1"))
            .await;

        assert!(matches!(
            result,
            Err(TransportError::Unreachable(_)) | Err(TransportError::Timeout)
        ));
    }

    #[test]
    fn test_invalid_server_url() {
        let config = OfflineConfig {
            server_url: "not a url".to_string(),
            ..OfflineConfig::default()
        };
        assert!(matches!(HttpTransport::new(&config), Err(SyncError::Config(_))));
    }
}
