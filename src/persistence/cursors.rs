//! Named durable cursors: where each consumer resumes after a restart.

use sqlx::PgPool;

/// Last consumed entry id for a named cursor, 0 if never saved.
pub async fn get_cursor(pool: &PgPool, name: &str) -> Result<i64, sqlx::Error> {
    let value: Option<i64> = sqlx::query_scalar("SELECT last_entry FROM cursors WHERE name = $1")
        .bind(name)
        .fetch_optional(pool)
        .await?;
    Ok(value.unwrap_or(0))
}

/// Upsert a cursor position.
pub async fn save_cursor(pool: &PgPool, name: &str, last_entry: i64) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO cursors (name, last_entry) VALUES ($1, $2) \
         ON CONFLICT (name) DO UPDATE SET last_entry = $2",
    )
    .bind(name)
    .bind(last_entry)
    .execute(pool)
    .await?;
    Ok(())
}
