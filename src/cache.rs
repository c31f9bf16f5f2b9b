use serde::{Deserialize, Serialize};
use sqlx::Row;

use crate::db::DbPool;
use crate::protocol::StreamEvent;
use crate::types::{QuotientError, Result};

/// One cached event in the shape the recover endpoint serves:
/// `{"event": "...", "data": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredEvent {
    pub event: String,
    pub data: serde_json::Value,
}

impl StoredEvent {
    pub fn decode(&self) -> Result<StreamEvent> {
        StreamEvent::from_parts(&self.event, &self.data)
    }
}

/// The recoverable record of one answer stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamSession {
    pub response_id: String,
    pub events: Vec<StoredEvent>,
    pub complete: bool,
}

impl StreamSession {
    /// Recovery is only worth replaying when at least one content chunk was
    /// recorded; session/meta alone would leave the UI empty.
    pub fn has_content(&self) -> bool {
        self.events.iter().any(|e| e.event == "chunk")
    }

    pub fn suggestions(&self) -> Option<Vec<String>> {
        self.events
            .iter()
            .find(|e| e.event == "suggestions")
            .and_then(|e| e.data.get("items"))
            .and_then(|items| serde_json::from_value(items.clone()).ok())
    }
}

/// Append/read contract over the per-response event log. Writes happen on the
/// generator task, which outlives the client connection, so a dropped client
/// never stops the record from filling in.
#[derive(Clone)]
pub struct ResponseCache {
    pool: DbPool,
}

impl ResponseCache {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, response_id: &str) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO stream_sessions (response_id) VALUES (?)")
            .bind(response_id)
            .execute(&self.pool)
            .await
            .map_err(QuotientError::Database)?;
        Ok(())
    }

    pub async fn append(&self, response_id: &str, event: &StreamEvent) -> Result<()> {
        let data = event.data().to_string();
        sqlx::query(
            "INSERT INTO stream_events (response_id, seq, event_type, data_json)
             VALUES (?1,
                     (SELECT COALESCE(MAX(seq), -1) + 1 FROM stream_events
                      WHERE response_id = ?1),
                     ?2, ?3)",
        )
        .bind(response_id)
        .bind(event.event_name())
        .bind(data)
        .execute(&self.pool)
        .await
        .map_err(QuotientError::Database)?;

        if matches!(event, StreamEvent::Done) {
            sqlx::query("UPDATE stream_sessions SET complete = 1 WHERE response_id = ?")
                .bind(response_id)
                .execute(&self.pool)
                .await
                .map_err(QuotientError::Database)?;
        }
        Ok(())
    }

    pub async fn read(&self, response_id: &str) -> Result<Option<StreamSession>> {
        let session_row =
            sqlx::query("SELECT complete FROM stream_sessions WHERE response_id = ?")
                .bind(response_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(QuotientError::Database)?;

        let complete: i64 = match session_row {
            Some(row) => row.get(0),
            None => return Ok(None),
        };

        let rows = sqlx::query(
            "SELECT event_type, data_json FROM stream_events
             WHERE response_id = ? ORDER BY seq",
        )
        .bind(response_id)
        .fetch_all(&self.pool)
        .await
        .map_err(QuotientError::Database)?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let event: String = row.get(0);
            let data_json: String = row.get(1);
            let data =
                serde_json::from_str(&data_json).map_err(QuotientError::Serialization)?;
            events.push(StoredEvent { event, data });
        }

        Ok(Some(StreamSession {
            response_id: response_id.to_string(),
            events,
            complete: complete != 0,
        }))
    }
}
