//! Liquidation evaluator: pure PnL and close-reason decisions.
//! No I/O and no ledger access, so every branch is testable with literals.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::types::position::{CloseReason, Position, Side};

/// A position is force-closed once remaining margin falls to 5% of the
/// initial margin or below, independent of leverage.
pub const MAINTENANCE_MARGIN_RATIO: Decimal = dec!(0.05);

/// Largest price, quantity, or pnl magnitude accepted from callers. The
/// product of two in-range values stays inside `Decimal`'s range, so the
/// margin and pnl arithmetic below cannot overflow on validated inputs.
pub const MAX_INPUT_MAGNITUDE: Decimal = dec!(1_000_000_000_000);

/// What one evaluation decided. `reason: None` means the position stays open.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evaluation {
    pub pnl: Decimal,
    pub reason: Option<CloseReason>,
}

/// Margin reserved when the position opened: notional / leverage.
pub fn initial_margin(position: &Position) -> Decimal {
    position.opening_price * position.qty / Decimal::from(position.leverage)
}

/// PnL of closing `position` at `execution_price`.
pub fn pnl(position: &Position, execution_price: Decimal) -> Decimal {
    match position.side {
        Side::Long => (execution_price - position.opening_price) * position.qty,
        Side::Short => (position.opening_price - execution_price) * position.qty,
    }
}

/// Decide whether `position` must close at `execution_price`.
///
/// Precedence is first-match-wins: take-profit, then stop-loss, then the
/// margin call. The order matters when a caller placed its take-profit past
/// the liquidation point; the tie resolves in the trader's favor.
pub fn evaluate(position: &Position, execution_price: Decimal) -> Evaluation {
    let pnl = pnl(position, execution_price);

    if let Some(tp) = position.take_profit {
        let hit = match position.side {
            Side::Long => execution_price >= tp,
            Side::Short => execution_price <= tp,
        };
        if hit {
            return Evaluation {
                pnl,
                reason: Some(CloseReason::TakeProfit),
            };
        }
    }

    if let Some(sl) = position.stop_loss {
        let hit = match position.side {
            Side::Long => execution_price <= sl,
            Side::Short => execution_price >= sl,
        };
        if hit {
            return Evaluation {
                pnl,
                reason: Some(CloseReason::StopLoss),
            };
        }
    }

    let margin = initial_margin(position);
    if margin + pnl <= margin * MAINTENANCE_MARGIN_RATIO {
        return Evaluation {
            pnl,
            reason: Some(CloseReason::Liquidation),
        };
    }

    Evaluation { pnl, reason: None }
}
