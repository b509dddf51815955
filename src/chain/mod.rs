//! Chain client capability
//!
//! The rescue engine talks to the chain only through [`ChainClient`]. The
//! JSON-RPC implementation lives in [`rpc`]; tests script a mock.
//!
//! # Architecture
//!
//! ```text
//! ChainClient ─┬─ abi       (calldata encoding, typed result guards)
//!              ├─ tx        (EIP-1559 encoding)
//!              ├─ signer    (ephemeral secp256k1 key)
//!              └─ explorer  (chain id → explorer links)
//! ```

pub mod abi;
pub mod explorer;
pub mod rpc;
pub mod signer;
pub mod tx;

#[cfg(test)]
pub mod mock;

use async_trait::async_trait;

pub use alloy_primitives::{Address, B256, U256};

use crate::error::Result;

pub use explorer::Explorer;
pub use rpc::HttpChainClient;
pub use signer::LocalSigner;

/// Transaction identifier returned by a submission
pub type TxHash = B256;

/// Read and write access to an EVM chain
///
/// Reads fail with [`crate::Error::Query`], submissions with
/// [`crate::Error::Execution`]. Submissions return once the transaction is
/// included with a successful status.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Chain id reported by the node
    async fn chain_id(&self) -> Result<u64>;

    /// `maxRedeem(holder)` on the vault
    async fn read_capacity(&self, vault: Address, holder: Address) -> Result<U256>;

    /// `asset()` on the vault
    async fn read_asset_address(&self, vault: Address) -> Result<Address>;

    /// `balanceOf(holder)` on an ERC-20 token
    async fn read_token_balance(&self, token: Address, holder: Address) -> Result<U256>;

    /// Native gas-token balance
    async fn read_native_balance(&self, address: Address) -> Result<U256>;

    /// `redeem(shares, receiver, owner)` signed by `signer`
    async fn submit_redeem(
        &self,
        vault: Address,
        shares: U256,
        receiver: Address,
        owner: Address,
        signer: &LocalSigner,
    ) -> Result<TxHash>;

    /// `transfer(to, amount)` on `token` signed by `signer`
    async fn submit_transfer(
        &self,
        token: Address,
        to: Address,
        amount: U256,
        signer: &LocalSigner,
    ) -> Result<TxHash>;
}
