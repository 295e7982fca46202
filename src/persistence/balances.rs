//! Balance persistence: one fixed-point row per (user, symbol), upserted on
//! settlement and by the snapshot cycle.

use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use super::orders::BALANCE_DECIMALS;

#[derive(Debug, FromRow)]
pub struct BalanceRow {
    pub user_id: Uuid,
    pub symbol: String,
    pub balance: i64,
    pub decimals: i32,
}

/// Fetch one balance row, for lazily seeding a user the engine has not seen.
pub async fn get_balance(
    pool: &PgPool,
    user_id: Uuid,
    symbol: &str,
) -> Result<Option<BalanceRow>, sqlx::Error> {
    let row = sqlx::query_as::<_, BalanceRow>(
        "SELECT user_id, symbol, balance, decimals FROM assets \
         WHERE user_id = $1 AND symbol = $2",
    )
    .bind(user_id)
    .bind(symbol)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Upsert a balance (insert or overwrite on conflict).
pub async fn upsert_balance(
    pool: &PgPool,
    user_id: Uuid,
    symbol: &str,
    balance: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO assets (user_id, symbol, balance, decimals) \
         VALUES ($1, $2, $3, $4) \
         ON CONFLICT (user_id, symbol) DO UPDATE SET balance = $3",
    )
    .bind(user_id)
    .bind(symbol)
    .bind(balance)
    .bind(BALANCE_DECIMALS as i32)
    .execute(pool)
    .await?;
    Ok(())
}
