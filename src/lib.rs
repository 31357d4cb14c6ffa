//! Automated trading engine for Bitget: a scalping strategy (bid-tracking
//! maker ladder with paired buy/sell legs) and a grid strategy (fixed price
//! ladder), sharing an order reconciler, risk controller, instrument-spec
//! cache and fire-and-forget persistence worker. The HTTP surface and
//! dashboard live outside this crate and consume the `manager` and
//! `autocalc` APIs.

pub mod autocalc;
pub mod config;
pub mod error;
pub mod events;
pub mod exchange;
pub mod grid;
pub mod instruments;
pub mod manager;
pub mod merge;
pub mod persistence;
pub mod risk;
pub mod scalping;
pub mod services;
pub mod signing;
pub mod tracker;
