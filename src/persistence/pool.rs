//! Postgres connection pool. The schema is migrated during setup so the
//! engine never recovers against a stale database.

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

/// Connect with a bounded pool and bring the schema up to date. The pool is
/// shared by the store and the message log, so size it for both.
pub async fn create_pool_and_migrate(
    database_url: &str,
    max_connections: u32,
) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;
    sqlx::migrate!("./migrations").run(&pool).await?;
    Ok(pool)
}
