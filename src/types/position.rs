use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The only currency margin is held in.
pub const SETTLEMENT_SYMBOL: &str = "USDC";

/// Position direction. Wire form is "buy"/"sell" (the opening order's side);
/// the database stores "long"/"short".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    #[serde(rename = "buy")]
    Long,
    #[serde(rename = "sell")]
    Short,
}

/// Why a position left the book. Carried verbatim on the reply stream and in
/// the orders table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseReason {
    TakeProfit,
    StopLoss,
    /// Margin call. Older producers spell this "margin" on the wire.
    #[serde(alias = "margin")]
    Liquidation,
    Manual,
}

/// An open leveraged position. Lives in the ledger while open; closing hands
/// it to durable storage and drops it from memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub user_id: Uuid,
    pub symbol: String,
    pub side: Side,
    /// Always > 0; direction is carried by `side`.
    pub qty: Decimal,
    /// >= 1. Divides the notional to get the reserved margin.
    pub leverage: u32,
    pub opening_price: Decimal,
    pub take_profit: Option<Decimal>,
    pub stop_loss: Option<Decimal>,
    pub created_at: DateTime<Utc>,
}
