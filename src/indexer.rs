//! HTTP indexing hook
//!
//! Posts each fully displayed document as JSON to a configured endpoint.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use quill_canvas::{Error, IndexRequest, IndexingHook};
use tracing::debug;

pub struct HttpIndexingHook {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpIndexingHook {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build indexing HTTP client")?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl IndexingHook for HttpIndexingHook {
    async fn index(&self, request: IndexRequest) -> quill_canvas::Result<()> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Internal(format!("indexer request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Internal(format!("indexer returned {status}")));
        }
        debug!(element_id = %request.element_id, version = request.version, "document sent to indexer");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
    use tokio::sync::mpsc;
    use uuid::Uuid;

    async fn serve(status: StatusCode) -> (String, mpsc::UnboundedReceiver<IndexRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let app = Router::new()
            .route(
                "/index",
                post(
                    move |State(tx): State<mpsc::UnboundedSender<IndexRequest>>,
                          Json(request): Json<IndexRequest>| async move {
                        let _ = tx.send(request);
                        status
                    },
                ),
            )
            .with_state(tx);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}/index"), rx)
    }

    fn request() -> IndexRequest {
        IndexRequest {
            conversation_id: "conv".to_string(),
            element_id: Uuid::new_v4(),
            version: 3,
            title: "Notes".to_string(),
            content: "Intro paragraph.".to_string(),
        }
    }

    #[tokio::test]
    async fn test_posts_request_as_json() {
        let (endpoint, mut rx) = serve(StatusCode::OK).await;
        let hook = HttpIndexingHook::new(endpoint, Duration::from_secs(5)).unwrap();

        let sent = request();
        hook.index(sent.clone()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), sent);
    }

    #[tokio::test]
    async fn test_error_status_is_reported() {
        let (endpoint, _rx) = serve(StatusCode::SERVICE_UNAVAILABLE).await;
        let hook = HttpIndexingHook::new(endpoint, Duration::from_secs(5)).unwrap();

        let err = hook.index(request()).await.unwrap_err();
        assert!(err.to_string().contains("503"));
    }
}
