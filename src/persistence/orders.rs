//! Order persistence: fixed-point rows, upsert while open, mark closed,
//! list open for recovery.
//!
//! Money columns are fixed-point integers: prices and pnl ×10_000, quantity
//! ×100, margin ×100. The `decimals`/`qty_decimals` columns record the scale
//! each row was written with, and decoding honors them.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sqlx::PgPool;
use uuid::Uuid;

use crate::evaluator::{initial_margin, MAX_INPUT_MAGNITUDE};
use crate::types::position::{CloseReason, Position, Side};

/// Scale for prices and pnl.
pub const PRICE_DECIMALS: u32 = 4;
/// Scale for quantities.
pub const QTY_DECIMALS: u32 = 2;
/// Scale for margin and balances.
pub const BALANCE_DECIMALS: u32 = 2;

/// Encode a decimal at the given scale, rounding to nearest. `None` on overflow.
pub fn to_fixed(value: Decimal, decimals: u32) -> Option<i64> {
    (value * Decimal::from(10i64.checked_pow(decimals)?))
        .round()
        .to_i64()
}

/// Decode a fixed-point integer written at the given scale.
pub fn from_fixed(raw: i64, decimals: u32) -> Decimal {
    Decimal::new(raw, decimals)
}

fn side_to_str(side: Side) -> &'static str {
    match side {
        Side::Long => "long",
        Side::Short => "short",
    }
}

fn str_to_side(s: &str) -> Option<Side> {
    match s {
        "long" => Some(Side::Long),
        "short" => Some(Side::Short),
        _ => None,
    }
}

pub fn reason_to_str(reason: CloseReason) -> &'static str {
    match reason {
        CloseReason::TakeProfit => "TakeProfit",
        CloseReason::StopLoss => "StopLoss",
        CloseReason::Liquidation => "Liquidation",
        CloseReason::Manual => "Manual",
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OrderRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub symbol: String,
    pub side: String,
    pub qty: i64,
    pub qty_decimals: i32,
    pub leverage: i32,
    pub opening_price: i64,
    pub closing_price: i64,
    pub decimals: i32,
    pub pnl: i64,
    pub take_profit: Option<i64>,
    pub stop_loss: Option<i64>,
    pub margin: i64,
    pub status: String,
    pub close_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

/// Encode an open position for its durable mirror. `None` when a field does
/// not fit the fixed-point range (the caller logs and skips).
pub fn position_to_row(position: &Position, unrealized_pnl: Decimal) -> Option<OrderRow> {
    Some(OrderRow {
        id: position.id,
        user_id: position.user_id,
        symbol: position.symbol.clone(),
        side: side_to_str(position.side).to_string(),
        qty: to_fixed(position.qty, QTY_DECIMALS)?,
        qty_decimals: QTY_DECIMALS as i32,
        leverage: position.leverage as i32,
        opening_price: to_fixed(position.opening_price, PRICE_DECIMALS)?,
        closing_price: 0,
        decimals: PRICE_DECIMALS as i32,
        pnl: to_fixed(unrealized_pnl, PRICE_DECIMALS)?,
        take_profit: match position.take_profit {
            Some(tp) => Some(to_fixed(tp, PRICE_DECIMALS)?),
            None => None,
        },
        stop_loss: match position.stop_loss {
            Some(sl) => Some(to_fixed(sl, PRICE_DECIMALS)?),
            None => None,
        },
        margin: to_fixed(initial_margin(position), BALANCE_DECIMALS)?,
        status: "open".to_string(),
        close_reason: None,
        created_at: position.created_at,
        closed_at: None,
    })
}

/// Decode a row back into an open position for recovery. Skips rows that no
/// longer validate (unknown side, non-positive or out-of-range qty and
/// price, leverage < 1).
pub fn row_to_position(row: &OrderRow) -> Option<Position> {
    let side = str_to_side(&row.side)?;
    let qty_decimals = u32::try_from(row.qty_decimals).ok()?;
    let price_decimals = u32::try_from(row.decimals).ok()?;
    let qty = from_fixed(row.qty, qty_decimals);
    if qty <= Decimal::ZERO || qty > MAX_INPUT_MAGNITUDE {
        return None;
    }
    let opening_price = from_fixed(row.opening_price, price_decimals);
    if opening_price <= Decimal::ZERO || opening_price > MAX_INPUT_MAGNITUDE {
        return None;
    }
    let leverage = u32::try_from(row.leverage).ok().filter(|l| *l >= 1)?;
    Some(Position {
        id: row.id,
        user_id: row.user_id,
        symbol: row.symbol.clone(),
        side,
        qty,
        leverage,
        opening_price,
        take_profit: row.take_profit.map(|tp| from_fixed(tp, price_decimals)),
        stop_loss: row.stop_loss.map(|sl| from_fixed(sl, price_decimals)),
        created_at: row.created_at,
    })
}

/// Upsert an open position's durable mirror (create and snapshot paths).
pub async fn upsert_open_order(pool: &PgPool, row: &OrderRow) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO orders (id, user_id, symbol, side, qty, qty_decimals, leverage, \
         opening_price, closing_price, decimals, pnl, take_profit, stop_loss, margin, \
         status, close_reason, created_at, closed_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18) \
         ON CONFLICT (id) DO UPDATE SET \
         side = $4, qty = $5, leverage = $7, opening_price = $8, pnl = $11, \
         take_profit = $12, stop_loss = $13, margin = $14, status = $15",
    )
    .bind(row.id)
    .bind(row.user_id)
    .bind(&row.symbol)
    .bind(&row.side)
    .bind(row.qty)
    .bind(row.qty_decimals)
    .bind(row.leverage)
    .bind(row.opening_price)
    .bind(row.closing_price)
    .bind(row.decimals)
    .bind(row.pnl)
    .bind(row.take_profit)
    .bind(row.stop_loss)
    .bind(row.margin)
    .bind(&row.status)
    .bind(&row.close_reason)
    .bind(row.created_at)
    .bind(row.closed_at)
    .execute(pool)
    .await?;
    Ok(())
}

/// Mark an order closed with its settlement figures.
pub async fn mark_order_closed(
    pool: &PgPool,
    id: Uuid,
    pnl: i64,
    closing_price: i64,
    reason: CloseReason,
    closed_at: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE orders SET status = 'closed', pnl = $1, closing_price = $2, \
         close_reason = $3, closed_at = $4 WHERE id = $5",
    )
    .bind(pnl)
    .bind(closing_price)
    .bind(reason_to_str(reason))
    .bind(closed_at)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

/// List open orders for recovery.
pub async fn list_open_orders(pool: &PgPool) -> Result<Vec<OrderRow>, sqlx::Error> {
    let rows = sqlx::query_as::<_, OrderRow>(
        "SELECT id, user_id, symbol, side, qty, qty_decimals, leverage, opening_price, \
         closing_price, decimals, pnl, take_profit, stop_loss, margin, status, close_reason, \
         created_at, closed_at \
         FROM orders WHERE status = 'open' ORDER BY created_at",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}
