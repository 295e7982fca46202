//! Position ledger: the open positions and per-user free-margin balances the
//! engine is authoritative for. Mutated only from the engine loop, so no
//! interior locking; correctness comes from that single-writer discipline.

use std::collections::{BTreeSet, HashMap, HashSet};

use rust_decimal::Decimal;
use uuid::Uuid;

use crate::types::position::Position;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LedgerError {
    /// Duplicate-command idempotency guard: an open position already carries
    /// this id.
    #[error("position {0} is already open")]
    DuplicatePosition(Uuid),
}

#[derive(Debug, Default)]
pub struct Ledger {
    positions: HashMap<Uuid, Position>,
    balances: HashMap<(Uuid, String), Decimal>,
    /// Balances mutated since the last snapshot flush.
    dirty: HashSet<(Uuid, String)>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, position: Position) -> Result<(), LedgerError> {
        if self.positions.contains_key(&position.id) {
            return Err(LedgerError::DuplicatePosition(position.id));
        }
        self.positions.insert(position.id, position);
        Ok(())
    }

    pub fn remove(&mut self, id: &Uuid) -> Option<Position> {
        self.positions.remove(id)
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.positions.contains_key(id)
    }

    pub fn get(&self, id: &Uuid) -> Option<&Position> {
        self.positions.get(id)
    }

    /// Lookup scoped to the owning user, for manual closes.
    pub fn find(&self, id: &Uuid, user_id: &Uuid) -> Option<&Position> {
        self.positions
            .get(id)
            .filter(|p| p.user_id == *user_id)
    }

    pub fn ids_by_symbol(&self, symbol: &str) -> Vec<Uuid> {
        self.positions
            .values()
            .filter(|p| p.symbol == symbol)
            .map(|p| p.id)
            .collect()
    }

    pub fn positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.values()
    }

    pub fn open_count(&self) -> usize {
        self.positions.len()
    }

    /// Distinct symbols with at least one open position, in stable order.
    pub fn symbols(&self) -> Vec<String> {
        self.positions
            .values()
            .map(|p| p.symbol.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Whether this user's balance has been initialized in memory.
    pub fn is_seeded(&self, user_id: &Uuid, symbol: &str) -> bool {
        self.balances
            .contains_key(&(*user_id, symbol.to_string()))
    }

    /// First-touch initialization from a caller-supplied durable snapshot.
    /// A no-op if the balance is already in memory: the in-memory figure is
    /// the truth once seeded.
    pub fn seed(&mut self, user_id: Uuid, symbol: &str, balance: Decimal) {
        self.balances
            .entry((user_id, symbol.to_string()))
            .or_insert(balance);
    }

    pub fn balance(&self, user_id: &Uuid, symbol: &str) -> Decimal {
        self.balances
            .get(&(*user_id, symbol.to_string()))
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    pub fn debit(&mut self, user_id: Uuid, symbol: &str, amount: Decimal) {
        let key = (user_id, symbol.to_string());
        let entry = self.balances.entry(key.clone()).or_insert(Decimal::ZERO);
        *entry = entry.saturating_sub(amount);
        self.dirty.insert(key);
    }

    pub fn credit(&mut self, user_id: Uuid, symbol: &str, amount: Decimal) {
        let key = (user_id, symbol.to_string());
        let entry = self.balances.entry(key.clone()).or_insert(Decimal::ZERO);
        *entry = entry.saturating_add(amount);
        self.dirty.insert(key);
    }

    /// Balances touched since the last drain, with their current values.
    /// The snapshot cycle flushes exactly this set to durable storage.
    pub fn drain_dirty_balances(&mut self) -> Vec<(Uuid, String, Decimal)> {
        let mut drained: Vec<(Uuid, String, Decimal)> = self
            .dirty
            .drain()
            .map(|(user_id, symbol)| {
                let balance = self
                    .balances
                    .get(&(user_id, symbol.clone()))
                    .copied()
                    .unwrap_or(Decimal::ZERO);
                (user_id, symbol, balance)
            })
            .collect();
        drained.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));
        drained
    }
}
