//! Core services: payload storage, metadata ledger, and the lifecycle rules
//! that keep the two consistent.

pub mod blob_store;
pub mod ledger;
pub mod lifecycle;
pub mod reclaimer;
