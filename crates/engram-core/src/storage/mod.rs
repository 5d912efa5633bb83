//! Storage layer
//!
//! SQLite-backed engram catalog with schema migrations.

pub mod migrations;
mod store;

pub use store::{
    bytes_to_f32s, f32s_to_bytes, AtRiskEngram, EngramStore, HelpfulnessRow, ListPage,
    ListQuery, SortKey, StoreStats,
};
