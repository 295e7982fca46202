//! Durable-store port for the engine: positions, balances, and the inbound
//! cursor. `PgStore` is the production implementation over `persistence`;
//! `MemoryStore` keeps encoded rows in maps for tests and single-process
//! wiring, going through the same fixed-point codec as Postgres rows.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::PgPool;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::persistence;
use crate::persistence::{OrderRow, BALANCE_DECIMALS, PRICE_DECIMALS};
use crate::stream::EntryId;
use crate::types::position::{CloseReason, Position};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    /// A value that does not fit the storage encoding (fixed-point overflow).
    #[error("value not representable in storage encoding: {0}")]
    Encoding(String),
}

#[async_trait]
pub trait EngineStore: Send + Sync {
    /// All open positions, decoded from their fixed-point rows. Rows that no
    /// longer validate are skipped by the implementation.
    async fn load_open_positions(&self) -> Result<Vec<Position>, StoreError>;

    /// Mirror an open position (create and snapshot paths).
    async fn upsert_open_position(
        &self,
        position: &Position,
        unrealized_pnl: Decimal,
    ) -> Result<(), StoreError>;

    /// Record a close with its settlement figures.
    async fn mark_position_closed(
        &self,
        id: Uuid,
        pnl: Decimal,
        closing_price: Decimal,
        reason: CloseReason,
        closed_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Durable balance for one (user, symbol), if any.
    async fn load_balance(&self, user_id: Uuid, symbol: &str) -> Result<Option<Decimal>, StoreError>;

    async fn upsert_balance(
        &self,
        user_id: Uuid,
        symbol: &str,
        balance: Decimal,
    ) -> Result<(), StoreError>;

    async fn load_cursor(&self, name: &str) -> Result<EntryId, StoreError>;

    async fn save_cursor(&self, name: &str, last_entry: EntryId) -> Result<(), StoreError>;
}

fn encode_price(value: Decimal, what: &str) -> Result<i64, StoreError> {
    persistence::to_fixed(value, PRICE_DECIMALS)
        .ok_or_else(|| StoreError::Encoding(format!("{what} {value}")))
}

fn encode_balance(value: Decimal, what: &str) -> Result<i64, StoreError> {
    persistence::to_fixed(value, BALANCE_DECIMALS)
        .ok_or_else(|| StoreError::Encoding(format!("{what} {value}")))
}

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EngineStore for PgStore {
    async fn load_open_positions(&self) -> Result<Vec<Position>, StoreError> {
        let rows = persistence::list_open_orders(&self.pool).await?;
        Ok(rows
            .iter()
            .filter_map(persistence::row_to_position)
            .collect())
    }

    async fn upsert_open_position(
        &self,
        position: &Position,
        unrealized_pnl: Decimal,
    ) -> Result<(), StoreError> {
        let row = persistence::position_to_row(position, unrealized_pnl)
            .ok_or_else(|| StoreError::Encoding(format!("position {}", position.id)))?;
        Ok(persistence::upsert_open_order(&self.pool, &row).await?)
    }

    async fn mark_position_closed(
        &self,
        id: Uuid,
        pnl: Decimal,
        closing_price: Decimal,
        reason: CloseReason,
        closed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let pnl = encode_price(pnl, "pnl")?;
        let closing_price = encode_price(closing_price, "closing price")?;
        Ok(persistence::mark_order_closed(&self.pool, id, pnl, closing_price, reason, closed_at)
            .await?)
    }

    async fn load_balance(
        &self,
        user_id: Uuid,
        symbol: &str,
    ) -> Result<Option<Decimal>, StoreError> {
        let row = persistence::get_balance(&self.pool, user_id, symbol).await?;
        Ok(row.and_then(|r| {
            u32::try_from(r.decimals)
                .ok()
                .map(|decimals| persistence::from_fixed(r.balance, decimals))
        }))
    }

    async fn upsert_balance(
        &self,
        user_id: Uuid,
        symbol: &str,
        balance: Decimal,
    ) -> Result<(), StoreError> {
        let balance = encode_balance(balance, "balance")?;
        Ok(persistence::upsert_balance(&self.pool, user_id, symbol, balance).await?)
    }

    async fn load_cursor(&self, name: &str) -> Result<EntryId, StoreError> {
        Ok(persistence::get_cursor(&self.pool, name).await?)
    }

    async fn save_cursor(&self, name: &str, last_entry: EntryId) -> Result<(), StoreError> {
        Ok(persistence::save_cursor(&self.pool, name, last_entry).await?)
    }
}

/// In-memory store holding the same encoded rows a database would, so
/// recovery tests exercise the fixed-point round trip.
#[derive(Default)]
pub struct MemoryStore {
    orders: Mutex<HashMap<Uuid, OrderRow>>,
    balances: Mutex<HashMap<(Uuid, String), i64>>,
    cursors: Mutex<HashMap<String, EntryId>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of one order row, for assertions.
    pub async fn order_row(&self, id: &Uuid) -> Option<OrderRow> {
        self.orders.lock().await.get(id).cloned()
    }

    /// Raw fixed-point balance, for assertions.
    pub async fn balance_raw(&self, user_id: &Uuid, symbol: &str) -> Option<i64> {
        self.balances
            .lock()
            .await
            .get(&(*user_id, symbol.to_string()))
            .copied()
    }
}

#[async_trait]
impl EngineStore for MemoryStore {
    async fn load_open_positions(&self) -> Result<Vec<Position>, StoreError> {
        let orders = self.orders.lock().await;
        Ok(orders
            .values()
            .filter(|row| row.status == "open")
            .filter_map(persistence::row_to_position)
            .collect())
    }

    async fn upsert_open_position(
        &self,
        position: &Position,
        unrealized_pnl: Decimal,
    ) -> Result<(), StoreError> {
        let row = persistence::position_to_row(position, unrealized_pnl)
            .ok_or_else(|| StoreError::Encoding(format!("position {}", position.id)))?;
        self.orders.lock().await.insert(position.id, row);
        Ok(())
    }

    async fn mark_position_closed(
        &self,
        id: Uuid,
        pnl: Decimal,
        closing_price: Decimal,
        reason: CloseReason,
        closed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let pnl = encode_price(pnl, "pnl")?;
        let closing_price = encode_price(closing_price, "closing price")?;
        if let Some(row) = self.orders.lock().await.get_mut(&id) {
            row.status = "closed".to_string();
            row.pnl = pnl;
            row.closing_price = closing_price;
            row.close_reason = Some(persistence::reason_to_str(reason).to_string());
            row.closed_at = Some(closed_at);
        }
        Ok(())
    }

    async fn load_balance(
        &self,
        user_id: Uuid,
        symbol: &str,
    ) -> Result<Option<Decimal>, StoreError> {
        let balances = self.balances.lock().await;
        Ok(balances
            .get(&(user_id, symbol.to_string()))
            .map(|raw| persistence::from_fixed(*raw, BALANCE_DECIMALS)))
    }

    async fn upsert_balance(
        &self,
        user_id: Uuid,
        symbol: &str,
        balance: Decimal,
    ) -> Result<(), StoreError> {
        let balance = encode_balance(balance, "balance")?;
        self.balances
            .lock()
            .await
            .insert((user_id, symbol.to_string()), balance);
        Ok(())
    }

    async fn load_cursor(&self, name: &str) -> Result<EntryId, StoreError> {
        Ok(self
            .cursors
            .lock()
            .await
            .get(name)
            .copied()
            .unwrap_or(0))
    }

    async fn save_cursor(&self, name: &str, last_entry: EntryId) -> Result<(), StoreError> {
        self.cursors
            .lock()
            .await
            .insert(name.to_string(), last_entry);
        Ok(())
    }
}
