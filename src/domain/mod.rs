//! Marketplace records and the invariants they enforce on themselves.

pub mod credit;
pub mod document;
pub mod money;
pub mod payment;
pub mod ports;
pub mod transaction;
pub mod user;
