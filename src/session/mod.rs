//! Armed rescue session
//!
//! A [`Session`] is either fully populated or absent. It is created by
//! [`keys::KeyLifecycle::arm`] and destroyed by its `wipe`.

pub mod keys;

use alloy_primitives::{Address, U256};
use uuid::Uuid;

use crate::chain::{LocalSigner, TxHash};

pub use keys::KeyLifecycle;

/// Hashes of the last redeem and transfer legs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionRecord {
    pub redeem: Option<TxHash>,
    pub transfer: Option<TxHash>,
}

impl TransactionRecord {
    /// Both legs landed
    pub fn is_complete(&self) -> bool {
        self.redeem.is_some() && self.transfer.is_some()
    }
}

/// Asset redeemed to the ephemeral wallet but not yet forwarded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrandedBalance {
    /// Unknown when resolving the vault's asset was the leg that failed
    pub asset: Option<Address>,
    pub amount: U256,
}

/// Everything needed to rescue from one ephemeral wallet
#[derive(Debug)]
pub struct Session {
    id: Uuid,
    signer: LocalSigner,
    destination: Address,
    vault: Address,
    endpoint: String,
    pub records: TransactionRecord,
    pub stranded: Option<StrandedBalance>,
}

impl Session {
    pub(crate) fn new(signer: LocalSigner, destination: Address, vault: Address, endpoint: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            signer,
            destination,
            vault,
            endpoint: endpoint.to_string(),
            records: TransactionRecord::default(),
            stranded: None,
        }
    }

    /// Identifier attached to log lines
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn signer(&self) -> &LocalSigner {
        &self.signer
    }

    /// Address derived from the ephemeral secret
    pub fn ephemeral(&self) -> Address {
        self.signer.address()
    }

    pub fn destination(&self) -> Address {
        self.destination
    }

    pub fn vault(&self) -> Address {
        self.vault
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}
