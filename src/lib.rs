//! Credit-gated task orchestrator.
//!
//! Routes conversation messages to a credit-metered remote agent: each
//! message is either forwarded as a tool call, answered with an offer to buy
//! credits, turned into a plan purchase, or answered directly. Purchases and
//! redemptions are reconciled against mint/burn events on the settlement
//! chain.

pub mod agent;
pub mod chain;
pub mod cli;
pub mod config;
pub mod error;
pub mod ledger;
pub mod llm;
pub mod settings;
pub mod tools;

pub use config::Config;
pub use error::{Error, ErrorClass, Result};
