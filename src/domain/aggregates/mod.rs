//! Aggregates
//!
//! Cart and Order roots. All mutation goes through aggregate methods so the
//! cached totals and raised events stay consistent.

pub mod cart;
pub mod order;

pub use cart::Cart;
pub use order::Order;
