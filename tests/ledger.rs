use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use uuid::Uuid;

use perp_exchange::ledger::{Ledger, LedgerError};
use perp_exchange::types::position::{Position, Side, SETTLEMENT_SYMBOL};

fn position(symbol: &str) -> Position {
    Position {
        id: Uuid::new_v4(),
        user_id: Uuid::new_v4(),
        symbol: symbol.to_string(),
        side: Side::Long,
        qty: dec!(1),
        leverage: 5,
        opening_price: dec!(100),
        take_profit: None,
        stop_loss: None,
        created_at: Utc::now(),
    }
}

#[test]
fn insert_rejects_a_duplicate_id() {
    let mut ledger = Ledger::new();
    let p = position("BTC");
    let id = p.id;

    ledger.insert(p.clone()).unwrap();
    assert_eq!(
        ledger.insert(p),
        Err(LedgerError::DuplicatePosition(id))
    );
    assert_eq!(ledger.open_count(), 1);
}

#[test]
fn remove_returns_the_position_once() {
    let mut ledger = Ledger::new();
    let p = position("BTC");
    let id = p.id;
    ledger.insert(p).unwrap();

    assert!(ledger.remove(&id).is_some());
    assert!(ledger.remove(&id).is_none());
    assert!(!ledger.contains(&id));
}

#[test]
fn find_is_scoped_to_the_owning_user() {
    let mut ledger = Ledger::new();
    let p = position("BTC");
    let id = p.id;
    let owner = p.user_id;
    ledger.insert(p).unwrap();

    assert!(ledger.find(&id, &owner).is_some());
    assert!(ledger.find(&id, &Uuid::new_v4()).is_none());
}

#[test]
fn ids_by_symbol_filters_and_symbols_dedupe() {
    let mut ledger = Ledger::new();
    ledger.insert(position("BTC")).unwrap();
    ledger.insert(position("BTC")).unwrap();
    ledger.insert(position("ETH")).unwrap();

    assert_eq!(ledger.ids_by_symbol("BTC").len(), 2);
    assert_eq!(ledger.ids_by_symbol("SOL").len(), 0);
    assert_eq!(ledger.symbols(), vec!["BTC".to_string(), "ETH".to_string()]);
}

#[test]
fn seed_is_first_touch_only() {
    let mut ledger = Ledger::new();
    let user = Uuid::new_v4();

    assert!(!ledger.is_seeded(&user, SETTLEMENT_SYMBOL));
    ledger.seed(user, SETTLEMENT_SYMBOL, dec!(100));
    assert!(ledger.is_seeded(&user, SETTLEMENT_SYMBOL));

    // A later seed never overwrites the in-memory figure.
    ledger.seed(user, SETTLEMENT_SYMBOL, dec!(7));
    assert_eq!(ledger.balance(&user, SETTLEMENT_SYMBOL), dec!(100));
}

#[test]
fn debit_and_credit_move_the_running_balance() {
    let mut ledger = Ledger::new();
    let user = Uuid::new_v4();
    ledger.seed(user, SETTLEMENT_SYMBOL, dec!(100));

    ledger.debit(user, SETTLEMENT_SYMBOL, dec!(30));
    ledger.credit(user, SETTLEMENT_SYMBOL, dec!(12.5));
    assert_eq!(ledger.balance(&user, SETTLEMENT_SYMBOL), dec!(82.5));

    // Unknown users read as zero.
    assert_eq!(
        ledger.balance(&Uuid::new_v4(), SETTLEMENT_SYMBOL),
        Decimal::ZERO
    );
}

#[test]
fn drain_returns_only_touched_balances_and_resets() {
    let mut ledger = Ledger::new();
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();

    ledger.seed(alice, SETTLEMENT_SYMBOL, dec!(50));
    ledger.seed(bob, SETTLEMENT_SYMBOL, dec!(50));
    ledger.debit(alice, SETTLEMENT_SYMBOL, dec!(10));

    let drained = ledger.drain_dirty_balances();
    assert_eq!(drained.len(), 1);
    assert_eq!(drained[0].0, alice);
    assert_eq!(drained[0].2, dec!(40));

    // Nothing dirty until the next mutation.
    assert!(ledger.drain_dirty_balances().is_empty());
    ledger.credit(bob, SETTLEMENT_SYMBOL, dec!(5));
    assert_eq!(ledger.drain_dirty_balances().len(), 1);
}
