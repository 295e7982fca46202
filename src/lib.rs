pub mod bridge;
pub mod config;
pub mod engine {
    pub mod engine;
}
pub mod evaluator;
pub mod ledger;
pub mod persistence;
pub mod price_cache;
pub mod store;
pub mod stream;
pub mod types {
    pub mod envelope;
    pub mod position;
    pub mod quote;
}
