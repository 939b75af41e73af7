pub mod alerts;
pub mod api;
pub mod bootstrap;
pub mod config;
pub mod error;
pub mod ledger;
pub mod payout;
pub mod provider;
pub mod records;
pub mod server;
pub mod settlement;
pub mod split;
pub mod webhook;

#[cfg(test)]
mod testing;
