//! Snapshot Store
//!
//! Persistence seam for conversation snapshots, and its SQLite adapter.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tracing::debug;

use crate::document::ConversationSnapshot;
use crate::error::Result;

/// Where conversation snapshots are kept between runs
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CanvasPersistence: Send + Sync {
    /// Insert or replace the snapshot of its conversation
    async fn save(&self, snapshot: &ConversationSnapshot) -> Result<()>;

    /// Load a conversation's snapshot
    async fn load(&self, conversation_id: &str) -> Result<Option<ConversationSnapshot>>;

    /// Delete a conversation's snapshot; returns whether one existed
    async fn delete(&self, conversation_id: &str) -> Result<bool>;

    /// Stored snapshots, most recent first
    async fn list(&self) -> Result<Vec<SnapshotSummary>>;
}

/// Summary of a stored snapshot for listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotSummary {
    /// Conversation ID
    pub conversation_id: String,
    /// Number of elements in the snapshot
    pub element_count: usize,
    /// When the snapshot was saved
    pub saved_at: DateTime<Utc>,
}

/// SQLite-based snapshot store
#[derive(Debug, Clone)]
pub struct SqliteCanvasStore {
    pool: SqlitePool,
}

impl SqliteCanvasStore {
    /// Create a new store with the given database pool
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) the database at `url` and initialize it
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        let store = Self::new(pool);
        store.init().await?;
        Ok(store)
    }

    /// Initialize the database schema
    pub async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS canvas_snapshots (
                conversation_id TEXT PRIMARY KEY,
                snapshot_json TEXT NOT NULL,
                element_count INTEGER NOT NULL,
                saved_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_snapshots_saved_at ON canvas_snapshots(saved_at);
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[async_trait]
impl CanvasPersistence for SqliteCanvasStore {
    async fn save(&self, snapshot: &ConversationSnapshot) -> Result<()> {
        let snapshot_json = serde_json::to_string(snapshot)?;
        let element_count = i64::try_from(snapshot.elements.len()).unwrap_or(i64::MAX);

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO canvas_snapshots
            (conversation_id, snapshot_json, element_count, saved_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(&snapshot.conversation_id)
        .bind(&snapshot_json)
        .bind(element_count)
        .bind(snapshot.saved_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        debug!(
            conversation_id = %snapshot.conversation_id,
            element_count,
            "snapshot saved"
        );
        Ok(())
    }

    async fn load(&self, conversation_id: &str) -> Result<Option<ConversationSnapshot>> {
        let row = sqlx::query(
            r#"
            SELECT snapshot_json
            FROM canvas_snapshots
            WHERE conversation_id = ?
            "#,
        )
        .bind(conversation_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let snapshot_json: String = row.get("snapshot_json");
                Ok(Some(serde_json::from_str(&snapshot_json)?))
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, conversation_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM canvas_snapshots WHERE conversation_id = ?
            "#,
        )
        .bind(conversation_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list(&self) -> Result<Vec<SnapshotSummary>> {
        let rows = sqlx::query(
            r#"
            SELECT conversation_id, element_count, saved_at
            FROM canvas_snapshots
            ORDER BY saved_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let summaries = rows
            .iter()
            .map(|row| {
                let element_count: i64 = row.get("element_count");
                let saved_at: String = row.get("saved_at");
                SnapshotSummary {
                    conversation_id: row.get("conversation_id"),
                    element_count: usize::try_from(element_count).unwrap_or(0),
                    saved_at: parse_timestamp(&saved_at),
                }
            })
            .collect();

        Ok(summaries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{CanvasElement, ElementKind, VersionState};

    async fn setup_test_db() -> SqliteCanvasStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();

        let store = SqliteCanvasStore::new(pool);
        store.init().await.unwrap();
        store
    }

    fn snapshot(conversation_id: &str, titles: &[&str]) -> ConversationSnapshot {
        let mut snapshot = ConversationSnapshot::new(conversation_id);
        for title in titles {
            let element = CanvasElement::new(conversation_id, ElementKind::Document, *title);
            snapshot.elements.insert(element.id, element);
        }
        snapshot
    }

    #[tokio::test]
    async fn test_snapshot_save_and_load() {
        let store = setup_test_db().await;
        let original = snapshot("conv-1", &["Notes", "Plan"]);

        store.save(&original).await.unwrap();
        let loaded = store.load("conv-1").await.unwrap().unwrap();

        assert_eq!(loaded.conversation_id, "conv-1");
        assert_eq!(loaded.elements.len(), 2);
        for (id, element) in &original.elements {
            assert_eq!(loaded.elements[id].title, element.title);
        }
        assert!(store.load("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_replaces_previous_snapshot() {
        let store = setup_test_db().await;
        store.save(&snapshot("conv-1", &["A"])).await.unwrap();
        store.save(&snapshot("conv-1", &["A", "B", "C"])).await.unwrap();

        let summaries = store.list().await.unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].element_count, 3);
    }

    #[tokio::test]
    async fn test_snapshot_delete() {
        let store = setup_test_db().await;
        store.save(&snapshot("conv-1", &["A"])).await.unwrap();

        assert!(store.delete("conv-1").await.unwrap());
        assert!(!store.delete("conv-1").await.unwrap());
        assert!(store.load("conv-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_orders_by_saved_at() {
        let store = setup_test_db().await;
        let mut older = snapshot("old", &["A"]);
        older.saved_at = Utc::now() - chrono::Duration::hours(1);
        store.save(&older).await.unwrap();
        store.save(&snapshot("new", &["A", "B"])).await.unwrap();

        let ids: Vec<String> = store
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.conversation_id)
            .collect();
        assert_eq!(ids, vec!["new".to_string(), "old".to_string()]);
    }

    #[tokio::test]
    async fn test_version_states_survive_round_trip() {
        let store = setup_test_db().await;
        let mut snap = ConversationSnapshot::new("conv");
        let mut element = CanvasElement::new("conv", ElementKind::Document, "Doc");
        element.versions.push(crate::document::Version::new(
            1,
            "hello".to_string(),
            "test".to_string(),
        ));
        element.versions[0].state = VersionState::Frozen;
        element.versions[0].frozen_at = Some(3);
        snap.elements.insert(element.id, element.clone());

        store.save(&snap).await.unwrap();
        let loaded = store.load("conv").await.unwrap().unwrap();
        let version = &loaded.elements[&element.id].versions[0];
        assert_eq!(version.state, VersionState::Frozen);
        assert_eq!(version.frozen_at, Some(3));
    }
}
