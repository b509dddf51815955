//! Vault rescue engine
//!
//! Watches an ERC-4626 vault for withdrawable capacity on behalf of an
//! ephemeral wallet and, the moment any appears, redeems the shares and
//! forwards the underlying asset to a destination address.

pub mod chain;
pub mod cli;
pub mod config;
pub mod error;
pub mod gate;
pub mod redact;
pub mod rescue;
pub mod session;

pub use config::Config;
pub use error::{Error, Result};
