use sqlx::sqlite::SqlitePool;
use std::path::Path;

use crate::types::{QuotientError, Result};

pub type DbPool = SqlitePool;

pub async fn init_db<P: AsRef<Path>>(path: P, session_ttl_secs: i64) -> Result<DbPool> {
    let path_str = match path.as_ref().to_str() {
        Some(s) => s,
        None => {
            return Err(QuotientError::Internal(
                "Invalid database path: Path contains non-UTF8 characters".to_string(),
                tracing_error::SpanTrace::capture(),
            )
            .into())
        }
    };
    let url = format!("sqlite:{}?mode=rwc", path_str);

    let pool = SqlitePool::connect(&url)
        .await
        .map_err(QuotientError::Database)?;

    configure_db(&pool).await?;
    create_schema(&pool).await?;

    match cleanup_expired(&pool, session_ttl_secs).await {
        Ok(removed) if removed > 0 => {
            tracing::info!("Startup cleanup removed {} expired stream sessions", removed);
        }
        Ok(_) => {}
        Err(e) => tracing::warn!("Database cleanup failed: {}", e),
    }

    Ok(pool)
}

async fn configure_db(pool: &DbPool) -> Result<()> {
    let pragmas = [
        "PRAGMA journal_mode = WAL",
        "PRAGMA synchronous = NORMAL",
        "PRAGMA busy_timeout = 5000",
    ];

    for pragma in pragmas {
        if let Err(e) = sqlx::query(pragma).execute(pool).await {
            return Err(QuotientError::Database(e).into());
        }
    }
    Ok(())
}

async fn create_schema(pool: &DbPool) -> Result<()> {
    let statements = [
        "CREATE TABLE IF NOT EXISTS stream_sessions (
            response_id TEXT PRIMARY KEY,
            complete INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        )",
        "CREATE TABLE IF NOT EXISTS stream_events (
            response_id TEXT NOT NULL,
            seq INTEGER NOT NULL,
            event_type TEXT NOT NULL,
            data_json TEXT NOT NULL,
            PRIMARY KEY (response_id, seq)
        )",
        "CREATE INDEX IF NOT EXISTS idx_sessions_created_at
            ON stream_sessions (created_at)",
    ];

    for stmt in statements {
        sqlx::query(stmt)
            .execute(pool)
            .await
            .map_err(QuotientError::Database)?;
    }
    Ok(())
}

/// Deletes sessions past their TTL along with their events. The TTL is the
/// cache collaborator's contract; callers never see expired entries.
pub async fn cleanup_expired(
    pool: &DbPool,
    ttl_secs: i64,
) -> std::result::Result<u64, sqlx::Error> {
    let deleted_sessions = sqlx::query(
        "DELETE FROM stream_sessions WHERE created_at < strftime('%s', 'now') - ?",
    )
    .bind(ttl_secs)
    .execute(pool)
    .await?;

    sqlx::query(
        "DELETE FROM stream_events WHERE response_id NOT IN
            (SELECT response_id FROM stream_sessions)",
    )
    .execute(pool)
    .await?;

    Ok(deleted_sessions.rows_affected())
}
