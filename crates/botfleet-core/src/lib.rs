//! Core of the bot fleet: which bots run, how each bot answers, and how
//! failures stay contained to the bot that caused them.
//!
//! This crate is framework-agnostic. Telegram and the completion provider
//! live behind ports (traits) implemented in adapter crates.

pub mod completion;
pub mod config;
pub mod domain;
pub mod errors;
pub mod fleet;
pub mod lanes;
pub mod logging;
pub mod session;
pub mod store;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use errors::{Error, Result};
