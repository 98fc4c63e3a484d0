//! Indexing worker
//!
//! Forwards fully displayed documents to an external indexer (vector store,
//! search). Indexing is fire-and-forget: failures are logged and never
//! touch canvas state.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::events::{CanvasNotification, NotificationBus};

/// One document to index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRequest {
    /// Owning conversation
    pub conversation_id: String,
    /// Element ID
    pub element_id: Uuid,
    /// Latest active version
    pub version: u32,
    /// Element title
    pub title: String,
    /// Full cumulative content
    pub content: String,
}

impl IndexRequest {
    /// Build a request from an `ElementReady` notification
    #[must_use]
    pub fn from_notification(notification: &CanvasNotification) -> Option<Self> {
        match notification {
            CanvasNotification::ElementReady {
                conversation_id,
                element_id,
                version,
                title,
                content,
            } => Some(Self {
                conversation_id: conversation_id.clone(),
                element_id: *element_id,
                version: *version,
                title: title.clone(),
                content: content.clone(),
            }),
            _ => None,
        }
    }
}

/// External indexer
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IndexingHook: Send + Sync {
    /// Index (or re-index) one document
    async fn index(&self, request: IndexRequest) -> Result<()>;
}

/// Spawn a task that indexes every `ElementReady` published on `bus`.
///
/// The task ends when the bus is dropped.
pub fn spawn_indexing_worker<H>(bus: &NotificationBus, hook: H) -> JoinHandle<()>
where
    H: IndexingHook + 'static,
{
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(notification) => {
                    let Some(request) = IndexRequest::from_notification(&notification) else {
                        continue;
                    };
                    let element_id = request.element_id;
                    let version = request.version;
                    match hook.index(request).await {
                        Ok(()) => debug!(element_id = %element_id, version, "element indexed"),
                        Err(e) => warn!(
                            element_id = %element_id,
                            version,
                            error = %e,
                            "indexing failed"
                        ),
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(lagged = n, "indexing worker lagged; some documents were not indexed");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        debug!("indexing worker stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn ready(content: &str) -> CanvasNotification {
        CanvasNotification::ElementReady {
            conversation_id: "conv".to_string(),
            element_id: Uuid::nil(),
            version: 2,
            title: "Doc".to_string(),
            content: content.to_string(),
        }
    }

    #[test]
    fn test_request_only_from_element_ready() {
        let request = IndexRequest::from_notification(&ready("body")).unwrap();
        assert_eq!(request.version, 2);
        assert_eq!(request.content, "body");

        let other = CanvasNotification::AllRevealsComplete {
            conversation_id: "conv".to_string(),
        };
        assert!(IndexRequest::from_notification(&other).is_none());
    }

    #[tokio::test]
    async fn test_worker_forwards_ready_documents() {
        let bus = NotificationBus::new(16);
        let mut hook = MockIndexingHook::new();
        hook.expect_index()
            .withf(|r| r.content == "full text" && r.title == "Doc")
            .times(1)
            .returning(|_| Ok(()));

        let worker = spawn_indexing_worker(&bus, hook);
        bus.publish(CanvasNotification::AllRevealsComplete {
            conversation_id: "conv".to_string(),
        });
        bus.publish(ready("full text"));
        drop(bus);

        worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_worker_survives_hook_failure() {
        let bus = NotificationBus::new(16);
        let mut hook = MockIndexingHook::new();
        hook.expect_index()
            .times(2)
            .returning(|_| Err(Error::Internal("indexer down".to_string())));

        let worker = spawn_indexing_worker(&bus, hook);
        bus.publish(ready("one"));
        bus.publish(ready("two"));
        drop(bus);

        worker.await.unwrap();
    }
}
