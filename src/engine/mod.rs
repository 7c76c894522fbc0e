//! Core engine — the per-account retry loop and the run aggregator
//! that drives accounts sequentially and decides what to notify.

pub mod account;
pub mod aggregator;
