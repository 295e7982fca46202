//! Serial engine loop: the single writer over the ledger and price cache.
//! Consumes the inbound stream in order, applies each command, publishes
//! replies, and mirrors state to durable storage on a snapshot interval.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use rust_decimal::Decimal;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::evaluator;
use crate::ledger::Ledger;
use crate::price_cache::PriceCache;
use crate::store::{EngineStore, StoreError};
use crate::stream::{EntryId, MessageLog, ENGINE_STREAM, REPLY_STREAM};
use crate::types::envelope::{
    CloseOrderPayload, Command, CommandEnvelope, CreateOrderPayload, Decoded, PriceUpdatePayload,
    ReplyEnvelope, ReplyStatus,
};
use crate::types::position::{CloseReason, Position, SETTLEMENT_SYMBOL};

/// Durable cursor name for the inbound stream consumer.
const ENGINE_CURSOR: &str = "engine";

/// Symbol suffix some price producers attach; stripped before caching.
const QUOTE_SUFFIX: &str = "_USDC";

fn in_range(value: Decimal) -> bool {
    value.abs() <= evaluator::MAX_INPUT_MAGNITUDE
}

pub struct Engine {
    ledger: Ledger,
    prices: PriceCache,
    store: Arc<dyn EngineStore>,
    log: Arc<dyn MessageLog>,
    cursor: EntryId,
}

impl Engine {
    pub fn new(store: Arc<dyn EngineStore>, log: Arc<dyn MessageLog>) -> Self {
        Self {
            ledger: Ledger::new(),
            prices: PriceCache::new(),
            store,
            log,
            cursor: 0,
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn cursor(&self) -> EntryId {
        self.cursor
    }

    /// Rebuild in-memory state from the last snapshot. Balances stay empty;
    /// they reseed lazily per user. The price cache refills from the next
    /// ticks, so priced actions stay unavailable until then.
    pub async fn recover(&mut self) -> Result<(), StoreError> {
        for position in self.store.load_open_positions().await? {
            if let Err(err) = self.ledger.insert(position) {
                warn!("skipping position during recovery: {err}");
            }
        }
        self.cursor = self.store.load_cursor(ENGINE_CURSOR).await?;
        info!(
            "recovered {} open positions, resuming after entry {}",
            self.ledger.open_count(),
            self.cursor
        );
        Ok(())
    }

    /// Run until shutdown is signalled. Commands and snapshots interleave on
    /// one task, so a snapshot never observes a half-applied command.
    pub async fn run(
        mut self,
        snapshot_interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> Self {
        let mut ticker = tokio::time::interval(snapshot_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first interval tick completes immediately; consume it so the
        // initial snapshot does not race the first batch.
        ticker.tick().await;
        let log = self.log.clone();

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.snapshot().await;
                }
                batch = log.wait_for(ENGINE_STREAM, self.cursor) => {
                    match batch {
                        Ok(entries) => {
                            for entry in entries {
                                self.dispatch_raw(&entry.data).await;
                                self.cursor = entry.id;
                            }
                            if let Err(err) =
                                self.store.save_cursor(ENGINE_CURSOR, self.cursor).await
                            {
                                error!("failed to save cursor: {err}");
                            }
                        }
                        Err(err) => {
                            error!("engine stream read failed: {err}");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
            }
        }

        self.snapshot().await;
        self
    }

    /// Decode and apply one stream entry. Malformed and unknown entries are
    /// logged and skipped; redelivery would only fail the same way.
    pub async fn dispatch_raw(&mut self, raw: &str) {
        match CommandEnvelope::decode(raw) {
            Ok(Decoded::Command(envelope)) => self.dispatch(envelope).await,
            Ok(Decoded::Unknown(kind)) => {
                debug!("skipping entry with unknown kind {kind:?}");
            }
            Err(err) => {
                warn!("skipping malformed entry: {err}");
            }
        }
    }

    pub async fn dispatch(&mut self, envelope: CommandEnvelope) {
        match envelope.command.clone() {
            Command::PriceUpdate(payload) => self.handle_price_update(&payload).await,
            Command::CreateOrder(payload) => {
                self.handle_create_order(envelope.correlation_id, payload).await
            }
            Command::CloseOrder(payload) => {
                self.handle_close_order(envelope.correlation_id, payload).await
            }
        }
    }

    async fn handle_price_update(&mut self, payload: &PriceUpdatePayload) {
        let tick = payload.tick();
        let (Some(symbol), Some(bid), Some(ask)) = (tick.s.as_deref(), tick.b, tick.a) else {
            debug!("skipping incomplete price tick");
            return;
        };
        let symbol = symbol.strip_suffix(QUOTE_SUFFIX).unwrap_or(symbol);
        if self.prices.update(symbol, bid, ask) {
            self.sweep_symbol(symbol).await;
        }
    }

    /// Re-evaluate every open position on `symbol` against the fresh quote
    /// and close the ones the evaluator flags.
    async fn sweep_symbol(&mut self, symbol: &str) {
        let Some(quote) = self.prices.quote(symbol) else {
            return;
        };
        let quote = quote.clone();

        for id in self.ledger.ids_by_symbol(symbol) {
            let Some(position) = self.ledger.get(&id).cloned() else {
                continue;
            };
            let execution_price = quote.close_price(position.side);
            let evaluation = evaluator::evaluate(&position, execution_price);
            if let Some(reason) = evaluation.reason {
                let reply_id = position.id;
                self.close_position(
                    position,
                    execution_price,
                    evaluation.pnl,
                    reason,
                    true,
                    Utc::now(),
                    reply_id,
                )
                .await;
            }
        }
    }

    async fn handle_create_order(
        &mut self,
        correlation_id: Option<Uuid>,
        payload: CreateOrderPayload,
    ) {
        let Some(reply_id) = payload.id.or(correlation_id) else {
            warn!("dropping create-order with no id to reply to");
            return;
        };

        let (Some(id), Some(user_id), Some(symbol), Some(side), Some(qty)) = (
            payload.id,
            payload.user_id,
            payload.asset.clone(),
            payload.side,
            payload.qty,
        ) else {
            self.reply(ReplyEnvelope::status_only(reply_id, ReplyStatus::InvalidOrder))
                .await;
            return;
        };
        if qty <= Decimal::ZERO
            || !in_range(qty)
            || !payload.take_profit.map_or(true, in_range)
            || !payload.stop_loss.map_or(true, in_range)
        {
            self.reply(ReplyEnvelope::status_only(reply_id, ReplyStatus::InvalidOrder))
                .await;
            return;
        }

        // Redelivered create: the position is already open, so answer as the
        // first delivery did without touching the balance again.
        if self.ledger.contains(&id) {
            self.reply(ReplyEnvelope::status_only(reply_id, ReplyStatus::Created))
                .await;
            return;
        }

        let Some(quote) = self.prices.quote(&symbol) else {
            self.reply(ReplyEnvelope::status_only(reply_id, ReplyStatus::NoPrice))
                .await;
            return;
        };

        let leverage = payload.leverage.filter(|l| *l >= 1).unwrap_or(1);
        let position = Position {
            id,
            user_id,
            symbol: symbol.clone(),
            side,
            qty,
            leverage,
            opening_price: quote.open_price(side),
            take_profit: payload.take_profit,
            stop_loss: payload.stop_loss,
            created_at: Utc::now(),
        };
        let required_margin = evaluator::initial_margin(&position);

        if !self.ledger.is_seeded(&user_id, SETTLEMENT_SYMBOL) {
            if let Some(entry) = payload
                .balance_snapshot
                .iter()
                .find(|entry| entry.symbol == SETTLEMENT_SYMBOL)
            {
                self.ledger.seed(user_id, SETTLEMENT_SYMBOL, entry.amount());
            } else {
                self.seed_balance_from_store(user_id).await;
            }
        }

        if self.ledger.balance(&user_id, SETTLEMENT_SYMBOL) < required_margin {
            self.reply(ReplyEnvelope::status_only(
                reply_id,
                ReplyStatus::InsufficientBalance,
            ))
            .await;
            return;
        }

        self.ledger.debit(user_id, SETTLEMENT_SYMBOL, required_margin);
        if let Err(err) = self.ledger.insert(position.clone()) {
            // Unreachable after the contains check above, but never double
            // charge if it does happen.
            warn!("create-order raced itself: {err}");
            self.ledger.credit(user_id, SETTLEMENT_SYMBOL, required_margin);
            self.reply(ReplyEnvelope::status_only(reply_id, ReplyStatus::Created))
                .await;
            return;
        }

        if let Err(err) = self.store.upsert_open_position(&position, Decimal::ZERO).await {
            error!("failed to persist position {}: {err}", position.id);
        }
        self.flush_balance(user_id).await;

        self.reply(ReplyEnvelope::status_only(reply_id, ReplyStatus::Created))
            .await;
    }

    async fn handle_close_order(
        &mut self,
        correlation_id: Option<Uuid>,
        payload: CloseOrderPayload,
    ) {
        let Some(reply_id) = correlation_id.or(payload.order_id) else {
            warn!("dropping close-order with no id to reply to");
            return;
        };

        let (Some(order_id), Some(user_id)) = (payload.order_id, payload.user_id) else {
            self.reply(ReplyEnvelope::status_only(
                reply_id,
                ReplyStatus::InvalidCloseRequest,
            ))
            .await;
            return;
        };
        if !payload.pnl.map_or(true, in_range) {
            self.reply(ReplyEnvelope::status_only(
                reply_id,
                ReplyStatus::InvalidCloseRequest,
            ))
            .await;
            return;
        }

        let Some(position) = self.ledger.find(&order_id, &user_id).cloned() else {
            self.reply(ReplyEnvelope::status_only(
                reply_id,
                ReplyStatus::OrderNotFound,
            ))
            .await;
            return;
        };

        // The caller may have priced the close from its own latest quote;
        // trust that figure when present.
        let (pnl, closing_price) = match payload.pnl {
            Some(pnl) => (pnl, position.opening_price),
            None => match self.prices.quote(&position.symbol) {
                Some(quote) => {
                    let price = quote.close_price(position.side);
                    (evaluator::pnl(&position, price), price)
                }
                None => (Decimal::ZERO, position.opening_price),
            },
        };
        let reason = payload.close_reason.unwrap_or(CloseReason::Manual);
        let closed_at = payload
            .closed_at
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .unwrap_or_else(Utc::now);

        self.close_position(position, closing_price, pnl, reason, false, closed_at, reply_id)
            .await;
    }

    /// Settle and retire one position: credit the released margin plus PnL,
    /// drop it from the ledger, record the close, and reply. Evaluator-driven
    /// closes clamp the credit at zero; manual closes settle as computed.
    #[allow(clippy::too_many_arguments)]
    async fn close_position(
        &mut self,
        position: Position,
        closing_price: Decimal,
        pnl: Decimal,
        reason: CloseReason,
        clamp: bool,
        closed_at: DateTime<Utc>,
        reply_id: Uuid,
    ) {
        let user_id = position.user_id;
        if !self.ledger.is_seeded(&user_id, SETTLEMENT_SYMBOL) {
            self.seed_balance_from_store(user_id).await;
        }

        let mut credit = evaluator::initial_margin(&position) + pnl;
        if clamp {
            credit = credit.max(Decimal::ZERO);
        }
        self.ledger.credit(user_id, SETTLEMENT_SYMBOL, credit);
        self.ledger.remove(&position.id);

        if let Err(err) = self
            .store
            .mark_position_closed(position.id, pnl, closing_price, reason, closed_at)
            .await
        {
            error!("failed to record close of {}: {err}", position.id);
        }
        self.flush_balance(user_id).await;

        self.reply(ReplyEnvelope::closed(reply_id, reason, pnl)).await;
    }

    /// Lazy per-user seed: first touch after a restart pulls the durable
    /// balance into memory. Missing row means a zero balance.
    async fn seed_balance_from_store(&mut self, user_id: Uuid) {
        match self.store.load_balance(user_id, SETTLEMENT_SYMBOL).await {
            Ok(balance) => {
                self.ledger
                    .seed(user_id, SETTLEMENT_SYMBOL, balance.unwrap_or(Decimal::ZERO));
            }
            Err(err) => {
                error!("failed to load balance for {user_id}: {err}");
            }
        }
    }

    /// Write one user's in-memory balance through immediately. Settlement
    /// moves money; waiting for the next snapshot would widen the window a
    /// crash could lose it in.
    async fn flush_balance(&mut self, user_id: Uuid) {
        let balance = self.ledger.balance(&user_id, SETTLEMENT_SYMBOL);
        if let Err(err) = self
            .store
            .upsert_balance(user_id, SETTLEMENT_SYMBOL, balance)
            .await
        {
            error!("failed to persist balance for {user_id}: {err}");
        }
    }

    async fn reply(&self, envelope: ReplyEnvelope) {
        let data = match serde_json::to_string(&envelope) {
            Ok(data) => data,
            Err(err) => {
                error!("failed to encode reply for {}: {err}", envelope.id);
                return;
            }
        };
        if let Err(err) = self.log.append(REPLY_STREAM, &data).await {
            error!("failed to publish reply for {}: {err}", envelope.id);
        }
    }

    /// Mirror in-memory state to durable storage: sweep every symbol against
    /// its latest quote, upsert the surviving positions with their unrealized
    /// PnL, flush touched balances, and save the cursor.
    pub async fn snapshot(&mut self) {
        for symbol in self.ledger.symbols() {
            self.sweep_symbol(&symbol).await;
        }

        let open: Vec<Position> = self.ledger.positions().cloned().collect();
        for position in open {
            let unrealized = self
                .prices
                .quote(&position.symbol)
                .map(|quote| evaluator::pnl(&position, quote.close_price(position.side)))
                .unwrap_or(Decimal::ZERO);
            if let Err(err) = self.store.upsert_open_position(&position, unrealized).await {
                error!("snapshot failed to persist position {}: {err}", position.id);
            }
        }

        for (user_id, symbol, balance) in self.ledger.drain_dirty_balances() {
            if let Err(err) = self.store.upsert_balance(user_id, &symbol, balance).await {
                error!("snapshot failed to persist balance for {user_id}: {err}");
            }
        }

        if let Err(err) = self.store.save_cursor(ENGINE_CURSOR, self.cursor).await {
            error!("snapshot failed to save cursor: {err}");
        }
    }
}
