//! Append-only stream entries: the durable message log's table. Entries are
//! never updated or deleted by the engine; the bigserial id is the stream
//! position.

use sqlx::{FromRow, PgPool};

#[derive(Debug, FromRow)]
pub struct StreamEntryRow {
    pub id: i64,
    pub data: String,
}

/// Append one entry and return its id.
pub async fn append_entry(pool: &PgPool, stream: &str, data: &str) -> Result<i64, sqlx::Error> {
    let id: i64 =
        sqlx::query_scalar("INSERT INTO stream_entries (stream, data) VALUES ($1, $2) RETURNING id")
            .bind(stream)
            .bind(data)
            .fetch_one(pool)
            .await?;
    Ok(id)
}

/// Entries past a cursor, oldest first.
pub async fn read_entries_after(
    pool: &PgPool,
    stream: &str,
    after: i64,
    limit: i64,
) -> Result<Vec<StreamEntryRow>, sqlx::Error> {
    let rows = sqlx::query_as::<_, StreamEntryRow>(
        "SELECT id, data FROM stream_entries \
         WHERE stream = $1 AND id > $2 ORDER BY id LIMIT $3",
    )
    .bind(stream)
    .bind(after)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Newest entry id, or 0 for an empty stream.
pub async fn last_entry_id(pool: &PgPool, stream: &str) -> Result<i64, sqlx::Error> {
    let id: i64 =
        sqlx::query_scalar("SELECT COALESCE(MAX(id), 0) FROM stream_entries WHERE stream = $1")
            .bind(stream)
            .fetch_one(pool)
            .await?;
    Ok(id)
}
