//! Database layer: pool, migrations, and access for orders, balances,
//! stream entries, and cursors.

mod balances;
mod cursors;
mod orders;
mod pool;
mod stream_entries;

pub use balances::{get_balance, upsert_balance, BalanceRow};
pub use cursors::{get_cursor, save_cursor};
pub use orders::{
    from_fixed, list_open_orders, mark_order_closed, position_to_row, reason_to_str,
    row_to_position, to_fixed, upsert_open_order, OrderRow, BALANCE_DECIMALS, PRICE_DECIMALS,
    QTY_DECIMALS,
};
pub use pool::create_pool_and_migrate;
pub use sqlx::PgPool;
pub use stream_entries::{append_entry, last_entry_id, read_entries_after, StreamEntryRow};
