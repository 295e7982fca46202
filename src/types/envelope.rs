//! Command and reply envelopes: the typed boundary of both durable streams.
//! Decoding happens exactly once, here; handlers never see raw JSON.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::types::position::{CloseReason, Side};

/// One inbound stream entry, dispatched by `kind`.
///
/// Payload fields are lenient (`Option`) on purpose: a missing required field
/// is a business rejection answered with a named reply status, not a decode
/// failure that would lose the correlation id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "kebab-case")]
pub enum Command {
    PriceUpdate(PriceUpdatePayload),
    CreateOrder(CreateOrderPayload),
    CloseOrder(CloseOrderPayload),
}

impl Command {
    fn known_kind(kind: &str) -> bool {
        matches!(kind, "price-update" | "create-order" | "close-order")
    }
}

/// A command plus the correlation id the front door attached, if any.
/// Price ticks arrive bare (no id); order commands arrive wrapped.
#[derive(Debug, Clone)]
pub struct CommandEnvelope {
    pub correlation_id: Option<Uuid>,
    pub command: Command,
}

/// Outcome of decoding one stream entry.
#[derive(Debug)]
pub enum Decoded {
    Command(CommandEnvelope),
    /// Unrecognized `kind`: a forward-compatible no-op, not an error.
    Unknown(String),
}

impl CommandEnvelope {
    pub fn new(correlation_id: Option<Uuid>, command: Command) -> Self {
        Self {
            correlation_id,
            command,
        }
    }

    /// Decode a stream entry. Accepts the wrapped form
    /// `{"id": ..., "request": {"kind", "payload"}}` published by the front
    /// door, and the bare `{"kind", "payload"}` form the price poller emits.
    pub fn decode(raw: &str) -> Result<Decoded, serde_json::Error> {
        let value: Value = serde_json::from_str(raw)?;
        let (correlation_id, body) = match value {
            Value::Object(mut map) if map.contains_key("request") => {
                let id = map
                    .get("id")
                    .and_then(Value::as_str)
                    .and_then(|s| Uuid::parse_str(s).ok());
                (id, map.remove("request").unwrap_or(Value::Null))
            }
            other => (None, other),
        };

        let kind = body
            .get("kind")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if !Command::known_kind(&kind) {
            return Ok(Decoded::Unknown(kind));
        }

        let command: Command = serde_json::from_value(body)?;
        Ok(Decoded::Command(CommandEnvelope {
            correlation_id,
            command,
        }))
    }

    /// Encode for publication to the inbound stream. Commands with a
    /// correlation id use the wrapped form the engine and bridge agree on.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        match self.correlation_id {
            Some(id) => serde_json::to_string(&serde_json::json!({
                "id": id,
                "request": &self.command,
            })),
            None => serde_json::to_string(&self.command),
        }
    }
}

/// Tick fields as the price producer sends them: symbol possibly suffixed
/// `_USDC`, bid/ask as numeric strings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PriceTick {
    #[serde(default)]
    pub s: Option<String>,
    #[serde(default)]
    pub b: Option<Decimal>,
    #[serde(default)]
    pub a: Option<Decimal>,
}

/// Some producers nest the tick under `data`, some inline it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceUpdatePayload {
    #[serde(default)]
    pub data: Option<PriceTick>,
    #[serde(flatten)]
    pub inline: PriceTick,
}

impl PriceUpdatePayload {
    pub fn tick(&self) -> &PriceTick {
        self.data.as_ref().unwrap_or(&self.inline)
    }
}

/// A point-in-time balance row the front door read from durable storage and
/// attached to the create command. Fixed-point with its own scale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceSnapshotEntry {
    pub symbol: String,
    pub balance: i64,
    #[serde(default = "default_balance_decimals")]
    pub decimals: u32,
}

fn default_balance_decimals() -> u32 {
    2
}

impl BalanceSnapshotEntry {
    pub fn amount(&self) -> Decimal {
        Decimal::new(self.balance, self.decimals)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderPayload {
    #[serde(default)]
    pub id: Option<Uuid>,
    #[serde(default)]
    pub user_id: Option<Uuid>,
    #[serde(default)]
    pub asset: Option<String>,
    #[serde(default)]
    pub side: Option<Side>,
    #[serde(default)]
    pub qty: Option<Decimal>,
    #[serde(default)]
    pub leverage: Option<u32>,
    #[serde(default)]
    pub take_profit: Option<Decimal>,
    #[serde(default)]
    pub stop_loss: Option<Decimal>,
    #[serde(default)]
    pub balance_snapshot: Vec<BalanceSnapshotEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseOrderPayload {
    #[serde(default)]
    pub order_id: Option<Uuid>,
    #[serde(default)]
    pub user_id: Option<Uuid>,
    #[serde(default)]
    pub close_reason: Option<CloseReason>,
    /// Trusted when supplied: the caller computed it from its own last quote.
    #[serde(default)]
    pub pnl: Option<Decimal>,
    /// Millisecond timestamp from the caller.
    #[serde(default)]
    pub closed_at: Option<i64>,
}

/// Terminal status of one command, published on the reply stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyStatus {
    Created,
    Closed,
    InvalidOrder,
    NoPrice,
    InsufficientBalance,
    OrderNotFound,
    InvalidCloseRequest,
}

/// One reply stream entry. Flat on the wire: `{id, status, reason?, pnl?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyEnvelope {
    pub id: Uuid,
    pub status: ReplyStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<CloseReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pnl: Option<Decimal>,
}

impl ReplyEnvelope {
    pub fn status_only(id: Uuid, status: ReplyStatus) -> Self {
        Self {
            id,
            status,
            reason: None,
            pnl: None,
        }
    }

    pub fn closed(id: Uuid, reason: CloseReason, pnl: Decimal) -> Self {
        Self {
            id,
            status: ReplyStatus::Closed,
            reason: Some(reason),
            pnl: Some(pnl),
        }
    }
}
