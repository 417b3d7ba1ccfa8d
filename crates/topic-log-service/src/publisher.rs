use std::time::Duration;

use reqwest::{header, Client};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use topic_log_core::{history_title, ExportDocument, TopicLogError};

pub const COMPACT_FILE_NAME: &str = "topics.min.json";
pub const PRETTY_FILE_NAME: &str = "topics.json";

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),
    #[error("paste service returned {0}")]
    Status(reqwest::StatusCode),
    #[error("malformed paste response: {0}")]
    MalformedResponse(String),
    #[error(transparent)]
    Export(#[from] TopicLogError),
}

/// Export action attached to a history view; `url` stays empty when publishing failed.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotAction {
    pub url: Option<String>,
}

#[derive(Debug, Serialize)]
struct PasteRequest<'a> {
    name: String,
    files: [PasteFile<'a>; 2],
}

#[derive(Debug, Serialize)]
struct PasteFile<'a> {
    name: &'static str,
    content: PasteContent<'a>,
}

#[derive(Debug, Serialize)]
struct PasteContent<'a> {
    format: &'static str,
    value: &'a str,
    highlight_language: &'static str,
}

impl<'a> PasteFile<'a> {
    fn json(name: &'static str, value: &'a str) -> Self {
        Self { name, content: PasteContent { format: "text", value, highlight_language: "json" } }
    }
}

/// Pull `result.id` out of a paste creation response.
///
/// # Errors
/// Returns [`PublishError::MalformedResponse`] when the body is not JSON or has no string id.
pub fn parse_paste_id(body: &str) -> Result<String, PublishError> {
    let value: serde_json::Value = serde_json::from_str(body)
        .map_err(|err| PublishError::MalformedResponse(err.to_string()))?;
    value
        .get("result")
        .and_then(|result| result.get("id"))
        .and_then(serde_json::Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| PublishError::MalformedResponse("missing result.id".to_string()))
}

#[must_use]
pub fn viewer_url(host: &str, paste_id: &str) -> String {
    format!("https://{host}/p/anonymous/{paste_id}")
}

/// Uploads export documents to a paste host.
#[derive(Debug, Clone)]
pub struct PastePublisher {
    client: Client,
    api_base: String,
    viewer_host: String,
}

impl PastePublisher {
    /// # Errors
    /// Returns [`PublishError::Request`] when the HTTP client cannot be built.
    pub fn new(
        api_base: &str,
        viewer_host: &str,
        timeout: Duration,
    ) -> Result<Self, PublishError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            viewer_host: viewer_host.to_string(),
        })
    }

    /// Upload both serializations of `document` as one paste and return its viewer URL.
    ///
    /// # Errors
    /// Returns [`PublishError`] when serialization, the request, or response parsing fails.
    pub async fn publish(&self, document: &ExportDocument) -> Result<String, PublishError> {
        let compact = document.to_compact_json()?;
        let pretty = document.to_pretty_json()?;
        let request = PasteRequest {
            name: history_title(&document.channel_name),
            files: [
                PasteFile::json(COMPACT_FILE_NAME, &compact),
                PasteFile::json(PRETTY_FILE_NAME, &pretty),
            ],
        };

        let url = format!("{}/v1/pastes", self.api_base);
        let resp = self
            .client
            .post(&url)
            .header(header::ACCEPT, "application/json")
            .json(&request)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(PublishError::Status(status));
        }

        let body = resp.text().await?;
        let paste_id = parse_paste_id(&body)?;
        Ok(viewer_url(&self.viewer_host, &paste_id))
    }

    /// Publish and fold any failure into an empty action.
    pub async fn snapshot_action(&self, document: &ExportDocument) -> SnapshotAction {
        match self.publish(document).await {
            Ok(url) => {
                tracing::info!(
                    "published topic snapshot for channel {}: {}",
                    document.channel_id,
                    url
                );
                SnapshotAction { url: Some(url) }
            }
            Err(err) => {
                tracing::warn!(
                    "failed to publish topic snapshot for channel {}: {}",
                    document.channel_id,
                    err
                );
                SnapshotAction { url: None }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use anyhow::Result;
    use axum::http::StatusCode;
    use serde_json::json;
    use topic_log_core::{ChannelId, ExportEntry};

    use super::*;
    use crate::testing::spawn_paste_server;

    fn document() -> ExportDocument {
        ExportDocument {
            updated: "2024-01-02T03:04:05.006Z".to_string(),
            channel_id: ChannelId::new("100"),
            channel_name: "general".to_string(),
            guild_id: Some("900".to_string()),
            guild_name: Some("Rustaceans".to_string()),
            topics: vec![ExportEntry {
                text: "hello".to_string(),
                first_seen: "2024-01-02T03:04:05Z".to_string(),
                unset: None,
            }],
        }
    }

    fn publisher_for(addr: SocketAddr) -> Result<PastePublisher> {
        Ok(PastePublisher::new(&format!("http://{addr}/"), "paste.gg", Duration::from_secs(5))?)
    }

    // Test IDs: TPUB-001
    #[tokio::test]
    async fn publish_uploads_both_serializations_and_builds_viewer_url() -> Result<()> {
        let reply = json!({"status": "success", "result": {"id": "abc123"}});
        let (addr, captured) = spawn_paste_server(StatusCode::CREATED, reply).await?;
        let publisher = publisher_for(addr)?;
        let document = document();

        let url = publisher.publish(&document).await?;
        assert_eq!(url, "https://paste.gg/p/anonymous/abc123");

        let seen = captured.lock().map_err(|_| anyhow::anyhow!("capture lock poisoned"))?;
        assert_eq!(seen.len(), 1);
        let body = &seen[0];
        assert_eq!(body["name"], "Topic history for #general");
        assert_eq!(body["files"][0]["name"], COMPACT_FILE_NAME);
        assert_eq!(body["files"][0]["content"]["value"], document.to_compact_json()?);
        assert_eq!(body["files"][0]["content"]["format"], "text");
        assert_eq!(body["files"][0]["content"]["highlight_language"], "json");
        assert_eq!(body["files"][1]["name"], PRETTY_FILE_NAME);
        assert_eq!(body["files"][1]["content"]["value"], document.to_pretty_json()?);
        Ok(())
    }

    // Test IDs: TPUB-002
    #[tokio::test]
    async fn non_success_status_yields_empty_action() -> Result<()> {
        let reply = json!({"status": "error"});
        let (addr, _captured) =
            spawn_paste_server(StatusCode::INTERNAL_SERVER_ERROR, reply).await?;
        let publisher = publisher_for(addr)?;

        let err = match publisher.publish(&document()).await {
            Ok(url) => panic!("expected failure, got {url}"),
            Err(err) => err,
        };
        assert!(matches!(err, PublishError::Status(status) if status.as_u16() == 500));
        assert_eq!(publisher.snapshot_action(&document()).await, SnapshotAction { url: None });
        Ok(())
    }

    #[tokio::test]
    async fn response_without_id_is_malformed() -> Result<()> {
        let (addr, _captured) =
            spawn_paste_server(StatusCode::OK, json!({"status": "success", "result": {}})).await?;
        let publisher = publisher_for(addr)?;

        assert!(matches!(
            publisher.publish(&document()).await,
            Err(PublishError::MalformedResponse(_))
        ));
        Ok(())
    }

    // Test IDs: TPUB-003
    #[tokio::test]
    async fn unreachable_host_yields_empty_action() -> Result<()> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        drop(listener);

        let publisher = publisher_for(addr)?;
        assert!(matches!(publisher.publish(&document()).await, Err(PublishError::Request(_))));
        assert_eq!(publisher.snapshot_action(&document()).await.url, None);
        Ok(())
    }

    #[test]
    fn parse_paste_id_reads_result_id() -> Result<()> {
        assert_eq!(parse_paste_id(r#"{"result":{"id":"xyz"}}"#)?, "xyz");
        assert!(matches!(parse_paste_id("not json"), Err(PublishError::MalformedResponse(_))));
        assert!(matches!(
            parse_paste_id(r#"{"result":{"id":7}}"#),
            Err(PublishError::MalformedResponse(_))
        ));
        Ok(())
    }
}
