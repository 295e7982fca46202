use std::sync::Arc;
use std::time::Duration;

use rust_decimal_macros::dec;
use tokio::sync::watch;
use uuid::Uuid;

use perp_exchange::engine::engine::Engine;
use perp_exchange::store::MemoryStore;
use perp_exchange::stream::{MemoryLog, MessageLog, ENGINE_STREAM, REPLY_STREAM};
use perp_exchange::types::envelope::{ReplyEnvelope, ReplyStatus};
use perp_exchange::types::position::{CloseReason, SETTLEMENT_SYMBOL};

fn price_update(symbol: &str, bid: &str, ask: &str) -> String {
    format!(
        r#"{{"kind":"price-update","payload":{{"data":{{"s":"{symbol}","b":"{bid}","a":"{ask}"}}}}}}"#
    )
}

fn create_order(id: Uuid, user: Uuid, extra: &str) -> String {
    format!(
        r#"{{"id":"{id}","request":{{"kind":"create-order","payload":{{
            "id":"{id}","userId":"{user}","asset":"BTC","side":"buy","qty":"1","leverage":10,
            "balanceSnapshot":[{{"symbol":"USDC","balance":100000,"decimals":2}}]{extra}
        }}}}}}"#
    )
}

fn close_order(correlation: Uuid, order: Uuid, user: Uuid, extra: &str) -> String {
    format!(
        r#"{{"id":"{correlation}","request":{{"kind":"close-order","payload":{{
            "orderId":"{order}","userId":"{user}"{extra}
        }}}}}}"#
    )
}

async fn replies(log: &MemoryLog) -> Vec<ReplyEnvelope> {
    log.read_after(REPLY_STREAM, 0, 100)
        .await
        .unwrap()
        .into_iter()
        .map(|entry| serde_json::from_str(&entry.data).unwrap())
        .collect()
}

fn harness() -> (Engine, Arc<MemoryStore>, Arc<MemoryLog>) {
    let store = Arc::new(MemoryStore::new());
    let log = Arc::new(MemoryLog::new());
    let engine = Engine::new(store.clone(), log.clone());
    (engine, store, log)
}

#[tokio::test]
async fn create_order_debits_margin_and_replies_created() {
    let (mut engine, store, log) = harness();
    let order = Uuid::new_v4();
    let user = Uuid::new_v4();

    engine.dispatch_raw(&price_update("BTC_USDC", "99", "100")).await;
    engine.dispatch_raw(&create_order(order, user, "")).await;

    let replies = replies(&log).await;
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].id, order);
    assert_eq!(replies[0].status, ReplyStatus::Created);

    // Long fills at the ask: margin = 100 * 1 / 10 = 10 off a 1000 balance.
    assert_eq!(engine.ledger().open_count(), 1);
    assert_eq!(engine.ledger().balance(&user, SETTLEMENT_SYMBOL), dec!(990));

    let row = store.order_row(&order).await.unwrap();
    assert_eq!(row.status, "open");
    assert_eq!(row.opening_price, 1_000_000);
    assert_eq!(row.margin, 1_000);
    assert_eq!(store.balance_raw(&user, SETTLEMENT_SYMBOL).await, Some(99_000));
}

#[tokio::test]
async fn create_order_without_a_quote_is_rejected() {
    let (mut engine, _store, log) = harness();
    let order = Uuid::new_v4();

    engine.dispatch_raw(&create_order(order, Uuid::new_v4(), "")).await;

    let replies = replies(&log).await;
    assert_eq!(replies[0].status, ReplyStatus::NoPrice);
    assert_eq!(engine.ledger().open_count(), 0);
}

#[tokio::test]
async fn create_order_with_missing_or_zero_qty_is_invalid() {
    let (mut engine, _store, log) = harness();
    let user = Uuid::new_v4();
    engine.dispatch_raw(&price_update("BTC_USDC", "99", "100")).await;

    let no_qty = Uuid::new_v4();
    let raw = format!(
        r#"{{"id":"{no_qty}","request":{{"kind":"create-order","payload":{{
            "id":"{no_qty}","userId":"{user}","asset":"BTC","side":"buy"
        }}}}}}"#
    );
    engine.dispatch_raw(&raw).await;

    let zero_qty = Uuid::new_v4();
    let raw = format!(
        r#"{{"id":"{zero_qty}","request":{{"kind":"create-order","payload":{{
            "id":"{zero_qty}","userId":"{user}","asset":"BTC","side":"buy","qty":"0"
        }}}}}}"#
    );
    engine.dispatch_raw(&raw).await;

    let replies = replies(&log).await;
    assert_eq!(replies.len(), 2);
    assert!(replies
        .iter()
        .all(|r| r.status == ReplyStatus::InvalidOrder));
    assert_eq!(engine.ledger().open_count(), 0);
}

#[tokio::test]
async fn insufficient_balance_leaves_state_untouched() {
    let (mut engine, store, log) = harness();
    let order = Uuid::new_v4();
    let user = Uuid::new_v4();
    engine.dispatch_raw(&price_update("BTC_USDC", "99", "100")).await;

    // 5.00 in the snapshot against a required margin of 10.
    let raw = format!(
        r#"{{"id":"{order}","request":{{"kind":"create-order","payload":{{
            "id":"{order}","userId":"{user}","asset":"BTC","side":"buy","qty":"1","leverage":10,
            "balanceSnapshot":[{{"symbol":"USDC","balance":500,"decimals":2}}]
        }}}}}}"#
    );
    engine.dispatch_raw(&raw).await;

    let replies = replies(&log).await;
    assert_eq!(replies[0].status, ReplyStatus::InsufficientBalance);
    assert_eq!(engine.ledger().open_count(), 0);
    assert_eq!(engine.ledger().balance(&user, SETTLEMENT_SYMBOL), dec!(5));
    assert!(store.order_row(&order).await.is_none());
}

#[tokio::test]
async fn redelivered_create_debits_margin_exactly_once() {
    let (mut engine, _store, log) = harness();
    let order = Uuid::new_v4();
    let user = Uuid::new_v4();
    engine.dispatch_raw(&price_update("BTC_USDC", "99", "100")).await;

    let raw = create_order(order, user, "");
    engine.dispatch_raw(&raw).await;
    engine.dispatch_raw(&raw).await;

    let replies = replies(&log).await;
    assert_eq!(replies.len(), 2);
    assert!(replies.iter().all(|r| r.status == ReplyStatus::Created));
    assert_eq!(engine.ledger().open_count(), 1);
    assert_eq!(engine.ledger().balance(&user, SETTLEMENT_SYMBOL), dec!(990));
}

#[tokio::test]
async fn manual_close_settles_from_the_current_quote() {
    let (mut engine, store, log) = harness();
    let order = Uuid::new_v4();
    let user = Uuid::new_v4();
    let correlation = Uuid::new_v4();

    engine.dispatch_raw(&price_update("BTC_USDC", "99", "100")).await;
    engine.dispatch_raw(&create_order(order, user, "")).await;
    engine.dispatch_raw(&price_update("BTC_USDC", "105", "106")).await;
    engine.dispatch_raw(&close_order(correlation, order, user, "")).await;

    let replies = replies(&log).await;
    let closed = replies.last().unwrap();
    assert_eq!(closed.id, correlation);
    assert_eq!(closed.status, ReplyStatus::Closed);
    assert_eq!(closed.reason, Some(CloseReason::Manual));
    // Long closes into the bid: pnl = 105 - 100.
    assert_eq!(closed.pnl, Some(dec!(5)));

    assert_eq!(engine.ledger().open_count(), 0);
    // 990 + margin 10 + pnl 5, unclamped.
    assert_eq!(engine.ledger().balance(&user, SETTLEMENT_SYMBOL), dec!(1005));

    let row = store.order_row(&order).await.unwrap();
    assert_eq!(row.status, "closed");
    assert_eq!(row.closing_price, 1_050_000);
    assert_eq!(row.pnl, 50_000);
    assert_eq!(row.close_reason.as_deref(), Some("Manual"));
}

#[tokio::test]
async fn manual_close_trusts_a_caller_supplied_pnl() {
    let (mut engine, store, log) = harness();
    let order = Uuid::new_v4();
    let user = Uuid::new_v4();
    let correlation = Uuid::new_v4();

    engine.dispatch_raw(&price_update("BTC_USDC", "99", "100")).await;
    engine.dispatch_raw(&create_order(order, user, "")).await;
    engine
        .dispatch_raw(&close_order(correlation, order, user, r#","pnl":"7""#))
        .await;

    let replies = replies(&log).await;
    let closed = replies.last().unwrap();
    assert_eq!(closed.pnl, Some(dec!(7)));
    assert_eq!(engine.ledger().balance(&user, SETTLEMENT_SYMBOL), dec!(1007));

    // A trusted pnl has no execution price; the opening price stands in.
    let row = store.order_row(&order).await.unwrap();
    assert_eq!(row.closing_price, 1_000_000);
    assert_eq!(row.pnl, 70_000);
}

#[tokio::test]
async fn close_requests_are_validated_before_lookup() {
    let (mut engine, _store, log) = harness();
    let correlation = Uuid::new_v4();

    // Missing userId.
    let raw = format!(
        r#"{{"id":"{correlation}","request":{{"kind":"close-order","payload":{{"orderId":"{}"}}}}}}"#,
        Uuid::new_v4()
    );
    engine.dispatch_raw(&raw).await;

    // Well-formed but unknown position.
    engine
        .dispatch_raw(&close_order(correlation, Uuid::new_v4(), Uuid::new_v4(), ""))
        .await;

    let replies = replies(&log).await;
    assert_eq!(replies[0].status, ReplyStatus::InvalidCloseRequest);
    assert_eq!(replies[1].status, ReplyStatus::OrderNotFound);
}

#[tokio::test]
async fn a_price_tick_liquidates_and_clamps_the_credit_at_zero() {
    let (mut engine, store, log) = harness();
    let order = Uuid::new_v4();
    let user = Uuid::new_v4();

    engine.dispatch_raw(&price_update("BTC_USDC", "99", "100")).await;
    engine.dispatch_raw(&create_order(order, user, "")).await;
    // Bid 85: pnl = -15 wipes the 10 margin; the credit clamps to zero.
    engine.dispatch_raw(&price_update("BTC_USDC", "85", "86")).await;

    let replies = replies(&log).await;
    let closed = replies.last().unwrap();
    assert_eq!(closed.id, order);
    assert_eq!(closed.status, ReplyStatus::Closed);
    assert_eq!(closed.reason, Some(CloseReason::Liquidation));
    assert_eq!(closed.pnl, Some(dec!(-15)));

    assert_eq!(engine.ledger().open_count(), 0);
    assert_eq!(engine.ledger().balance(&user, SETTLEMENT_SYMBOL), dec!(990));

    let row = store.order_row(&order).await.unwrap();
    assert_eq!(row.status, "closed");
    assert_eq!(row.close_reason.as_deref(), Some("Liquidation"));
}

#[tokio::test]
async fn a_price_tick_closes_at_take_profit() {
    let (mut engine, _store, log) = harness();
    let order = Uuid::new_v4();
    let user = Uuid::new_v4();

    engine.dispatch_raw(&price_update("BTC_USDC", "99", "100")).await;
    engine
        .dispatch_raw(&create_order(order, user, r#","takeProfit":"110""#))
        .await;
    engine.dispatch_raw(&price_update("BTC_USDC", "110", "111")).await;

    let replies = replies(&log).await;
    let closed = replies.last().unwrap();
    assert_eq!(closed.reason, Some(CloseReason::TakeProfit));
    assert_eq!(closed.pnl, Some(dec!(10)));
    // 990 + margin 10 + pnl 10.
    assert_eq!(engine.ledger().balance(&user, SETTLEMENT_SYMBOL), dec!(1010));
}

#[tokio::test]
async fn recovery_round_trips_positions_through_fixed_point_rows() {
    let store = Arc::new(MemoryStore::new());
    let log = Arc::new(MemoryLog::new());
    let order = Uuid::new_v4();
    let user = Uuid::new_v4();

    let mut engine = Engine::new(store.clone(), log.clone());
    engine.dispatch_raw(&price_update("BTC_USDC", "99", "100")).await;
    engine.dispatch_raw(&create_order(order, user, "")).await;
    drop(engine);

    let mut recovered = Engine::new(store.clone(), log.clone());
    recovered.recover().await.unwrap();
    assert_eq!(recovered.ledger().open_count(), 1);

    let position = recovered.ledger().get(&order).unwrap();
    assert_eq!(position.user_id, user);
    assert_eq!(position.opening_price, dec!(100));
    assert_eq!(position.qty, dec!(1));
    assert_eq!(position.leverage, 10);

    // The recovered position still liquidates; its balance reseeds from the
    // store on first touch.
    recovered.dispatch_raw(&price_update("BTC_USDC", "85", "86")).await;
    assert_eq!(recovered.ledger().open_count(), 0);
    assert_eq!(
        recovered.ledger().balance(&user, SETTLEMENT_SYMBOL),
        dec!(990)
    );
    let row = store.order_row(&order).await.unwrap();
    assert_eq!(row.status, "closed");
}

#[tokio::test]
async fn snapshot_refreshes_unrealized_pnl_and_balances() {
    let (mut engine, store, _log) = harness();
    let order = Uuid::new_v4();
    let user = Uuid::new_v4();

    engine.dispatch_raw(&price_update("BTC_USDC", "99", "100")).await;
    engine.dispatch_raw(&create_order(order, user, "")).await;
    engine.dispatch_raw(&price_update("BTC_USDC", "105", "106")).await;

    engine.snapshot().await;

    let row = store.order_row(&order).await.unwrap();
    assert_eq!(row.status, "open");
    assert_eq!(row.pnl, 50_000);
    assert_eq!(store.balance_raw(&user, SETTLEMENT_SYMBOL).await, Some(99_000));
}

#[tokio::test]
async fn oversized_qty_is_rejected_and_the_engine_keeps_running() {
    let (mut engine, _store, log) = harness();
    let user = Uuid::new_v4();
    engine.dispatch_raw(&price_update("BTC_USDC", "99", "100")).await;

    // Within Decimal range, but its notional would overflow the margin math.
    let huge = Uuid::new_v4();
    let raw = format!(
        r#"{{"id":"{huge}","request":{{"kind":"create-order","payload":{{
            "id":"{huge}","userId":"{user}","asset":"BTC","side":"buy",
            "qty":"70000000000000000000000000000","leverage":10
        }}}}}}"#
    );
    engine.dispatch_raw(&raw).await;

    let follow_up = Uuid::new_v4();
    engine.dispatch_raw(&create_order(follow_up, user, "")).await;

    let replies = replies(&log).await;
    assert_eq!(replies[0].id, huge);
    assert_eq!(replies[0].status, ReplyStatus::InvalidOrder);
    assert_eq!(replies[1].status, ReplyStatus::Created);
    assert_eq!(engine.ledger().open_count(), 1);
}

#[tokio::test]
async fn oversized_caller_pnl_is_an_invalid_close_request() {
    let (mut engine, _store, log) = harness();
    let order = Uuid::new_v4();
    let user = Uuid::new_v4();
    let correlation = Uuid::new_v4();

    engine.dispatch_raw(&price_update("BTC_USDC", "99", "100")).await;
    engine.dispatch_raw(&create_order(order, user, "")).await;
    engine
        .dispatch_raw(&close_order(
            correlation,
            order,
            user,
            r#","pnl":"79000000000000000000000000000""#,
        ))
        .await;

    let replies = replies(&log).await;
    let rejected = replies.last().unwrap();
    assert_eq!(rejected.id, correlation);
    assert_eq!(rejected.status, ReplyStatus::InvalidCloseRequest);
    assert_eq!(engine.ledger().open_count(), 1);
    assert_eq!(engine.ledger().balance(&user, SETTLEMENT_SYMBOL), dec!(990));
}

#[tokio::test]
async fn out_of_range_price_ticks_are_ignored() {
    let (mut engine, _store, log) = harness();

    engine
        .dispatch_raw(&price_update("BTC_USDC", "10000000000000", "10000000000001"))
        .await;
    engine
        .dispatch_raw(&create_order(Uuid::new_v4(), Uuid::new_v4(), ""))
        .await;

    let replies = replies(&log).await;
    assert_eq!(replies[0].status, ReplyStatus::NoPrice);
}

#[tokio::test]
async fn create_order_without_a_payload_id_is_invalid() {
    let (mut engine, _store, log) = harness();
    let correlation = Uuid::new_v4();
    let user = Uuid::new_v4();
    engine.dispatch_raw(&price_update("BTC_USDC", "99", "100")).await;

    // Correlated, but the payload itself carries no order id.
    let raw = format!(
        r#"{{"id":"{correlation}","request":{{"kind":"create-order","payload":{{
            "userId":"{user}","asset":"BTC","side":"buy","qty":"1","leverage":10
        }}}}}}"#
    );
    engine.dispatch_raw(&raw).await;

    let replies = replies(&log).await;
    assert_eq!(replies[0].id, correlation);
    assert_eq!(replies[0].status, ReplyStatus::InvalidOrder);
    assert_eq!(engine.ledger().open_count(), 0);
}

#[tokio::test]
async fn snapshot_sweep_closes_a_position_the_ticks_missed() {
    let (mut engine, store, log) = harness();
    let order = Uuid::new_v4();
    let user = Uuid::new_v4();

    // An inverted take-profit already reached by the current bid; no tick
    // arrives after the create, so only the snapshot sweep can catch it.
    engine.dispatch_raw(&price_update("BTC_USDC", "99", "100")).await;
    engine
        .dispatch_raw(&create_order(order, user, r#","takeProfit":"95""#))
        .await;
    assert_eq!(engine.ledger().open_count(), 1);

    engine.snapshot().await;

    let replies = replies(&log).await;
    let closed = replies.last().unwrap();
    assert_eq!(closed.id, order);
    assert_eq!(closed.status, ReplyStatus::Closed);
    assert_eq!(closed.reason, Some(CloseReason::TakeProfit));
    assert_eq!(closed.pnl, Some(dec!(-1)));

    assert_eq!(engine.ledger().open_count(), 0);
    // 990 + clamped credit of margin 10 + pnl -1.
    assert_eq!(engine.ledger().balance(&user, SETTLEMENT_SYMBOL), dec!(999));

    let row = store.order_row(&order).await.unwrap();
    assert_eq!(row.status, "closed");
    assert_eq!(row.close_reason.as_deref(), Some("TakeProfit"));
    assert_eq!(store.balance_raw(&user, SETTLEMENT_SYMBOL).await, Some(99_900));
}

#[tokio::test]
async fn run_loop_consumes_the_stream_and_persists_its_cursor() {
    let store = Arc::new(MemoryStore::new());
    let log = Arc::new(MemoryLog::new());
    let order = Uuid::new_v4();
    let user = Uuid::new_v4();

    let engine = Engine::new(store.clone(), log.clone());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(engine.run(Duration::from_secs(60), shutdown_rx));

    log.append(ENGINE_STREAM, &price_update("BTC_USDC", "99", "100"))
        .await
        .unwrap();
    log.append(ENGINE_STREAM, &create_order(order, user, ""))
        .await
        .unwrap();
    // Malformed and unknown entries are skipped but still advance the cursor.
    log.append(ENGINE_STREAM, "not json").await.unwrap();
    log.append(ENGINE_STREAM, r#"{"kind":"cancel-all","payload":{}}"#)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    shutdown_tx.send(true).unwrap();
    let engine = handle.await.unwrap();

    assert_eq!(engine.cursor(), 4);
    assert_eq!(engine.ledger().open_count(), 1);
    assert!(store.order_row(&order).await.is_some());

    // A fresh engine resumes from the saved cursor.
    let mut next = Engine::new(store.clone(), log.clone());
    next.recover().await.unwrap();
    assert_eq!(next.cursor(), 4);
    assert_eq!(next.ledger().open_count(), 1);
}
