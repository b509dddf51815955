//! Two-leg withdrawal
//!
//! Redeem shares into the ephemeral wallet, then forward the underlying
//! asset to the destination. The legs are separate transactions; a failure
//! after the redeem landed is reported with the redeem hash so the caller
//! can track the stranded balance.

use std::fmt;

use alloy_primitives::{Address, U256};
use tracing::{info, warn};

use crate::chain::{ChainClient, TxHash};
use crate::error::Error;
use crate::session::Session;

use super::state::GuardToken;

/// Both legs landed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub redeem_hash: TxHash,
    pub transfer_hash: TxHash,
    pub asset: Address,
    pub amount: U256,
}

/// Step of an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Leg {
    Redeem,
    ResolveAsset,
    Transfer,
}

impl fmt::Display for Leg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Leg::Redeem => f.write_str("redeem"),
            Leg::ResolveAsset => f.write_str("resolve asset"),
            Leg::Transfer => f.write_str("transfer"),
        }
    }
}

/// Execution failure with what had already landed
#[derive(Debug)]
pub struct LegFailure {
    pub leg: Leg,
    pub redeem_hash: Option<TxHash>,
    pub asset: Option<Address>,
    pub error: Error,
}

impl LegFailure {
    /// The redeem leg was broadcast, so the ephemeral wallet may hold the asset
    pub fn is_stranded(&self) -> bool {
        self.redeem_hash.is_some()
    }
}

impl fmt::Display for LegFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} leg failed: {}", self.leg, self.error.redacted())
    }
}

/// Runs executions against a chain client
///
/// Every entry point takes a [`GuardToken`], so an execution can only start
/// while the processing guard is held.
pub struct TransactionExecutor<'a> {
    client: &'a dyn ChainClient,
}

impl<'a> TransactionExecutor<'a> {
    pub fn new(client: &'a dyn ChainClient) -> Self {
        Self { client }
    }

    /// Redeem `amount` shares to the ephemeral wallet and forward them
    ///
    /// `asset_hint` is the gatekeeper's cached probe for the session's vault
    /// and endpoint; without it the vault is probed again.
    pub async fn execute(
        &self,
        _guard: &GuardToken,
        session: &Session,
        amount: U256,
        asset_hint: Option<Address>,
    ) -> std::result::Result<Receipt, LegFailure> {
        let ephemeral = session.ephemeral();

        let redeem_hash = self
            .client
            .submit_redeem(session.vault(), amount, ephemeral, ephemeral, session.signer())
            .await
            .map_err(|error| {
                let redeem_hash = error.unconfirmed_hash();
                if redeem_hash.is_some() {
                    warn!(
                        session = %session.id(),
                        "Redeem broadcast but unconfirmed, ephemeral wallet may hold the asset"
                    );
                }
                LegFailure {
                    leg: Leg::Redeem,
                    redeem_hash,
                    asset: None,
                    error,
                }
            })?;
        info!(session = %session.id(), amount = %amount, "Redeem leg landed");

        let asset = match asset_hint {
            Some(asset) => asset,
            None => self.resolve_asset(session, redeem_hash).await?,
        };

        let transfer_hash = self
            .client
            .submit_transfer(asset, session.destination(), amount, session.signer())
            .await
            .map_err(|error| {
                warn!(
                    session = %session.id(),
                    "Transfer leg failed after redeem, balance stranded in ephemeral wallet"
                );
                LegFailure {
                    leg: Leg::Transfer,
                    redeem_hash: Some(redeem_hash),
                    asset: Some(asset),
                    error,
                }
            })?;
        info!(session = %session.id(), amount = %amount, "Transfer leg landed");

        Ok(Receipt {
            redeem_hash,
            transfer_hash,
            asset,
            amount,
        })
    }

    /// Forward an asset balance already sitting in the ephemeral wallet
    pub async fn forward(
        &self,
        _guard: &GuardToken,
        session: &Session,
        asset: Address,
        amount: U256,
    ) -> std::result::Result<TxHash, LegFailure> {
        let hash = self
            .client
            .submit_transfer(asset, session.destination(), amount, session.signer())
            .await
            .map_err(|error| LegFailure {
                leg: Leg::Transfer,
                redeem_hash: None,
                asset: Some(asset),
                error,
            })?;
        info!(session = %session.id(), amount = %amount, "Stranded balance forwarded");
        Ok(hash)
    }

    async fn resolve_asset(
        &self,
        session: &Session,
        redeem_hash: TxHash,
    ) -> std::result::Result<Address, LegFailure> {
        let fail = |error| LegFailure {
            leg: Leg::ResolveAsset,
            redeem_hash: Some(redeem_hash),
            asset: None,
            error,
        };

        match self.client.read_asset_address(session.vault()).await {
            Ok(asset) if asset == Address::ZERO => Err(fail(Error::VaultValidation(
                "vault reported the zero address as its asset".to_string(),
            ))),
            Ok(asset) => Ok(asset),
            Err(error) => Err(fail(error)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::mock::MockChain;
    use crate::gate::SecretKey;
    use crate::rescue::state::ProcessingGuard;
    use crate::session::KeyLifecycle;
    use std::time::Duration;

    fn keys() -> KeyLifecycle {
        let mut keys = KeyLifecycle::new(Duration::from_secs(600));
        keys.arm(
            &SecretKey::parse(&"42".repeat(32)).unwrap(),
            Address::repeat_byte(0xd0),
            Address::repeat_byte(0xf0),
            "https://api.avax.network/ext/bc/C/rpc",
        )
        .unwrap();
        keys
    }

    #[tokio::test]
    async fn test_both_legs_succeed() {
        let chain = MockChain::new();
        let keys = keys();
        let session = keys.session().unwrap();
        let guard = ProcessingGuard::new();
        let token = guard.try_acquire().unwrap();

        let receipt = TransactionExecutor::new(&chain)
            .execute(&token, session, U256::from(1000u64), Some(MockChain::asset_address()))
            .await
            .unwrap();

        assert_eq!(receipt.amount, U256::from(1000u64));
        assert_ne!(receipt.redeem_hash, receipt.transfer_hash);
        assert_eq!(*chain.redeemed.lock().unwrap(), vec![U256::from(1000u64)]);
        let transfers = chain.transferred.lock().unwrap().clone();
        assert_eq!(
            transfers,
            vec![(MockChain::asset_address(), session.destination(), U256::from(1000u64))]
        );
        // cached asset means no re-probe
        assert_eq!(MockChain::calls(&chain.asset_calls), 0);
    }

    #[tokio::test]
    async fn test_missing_hint_reprobes() {
        let chain = MockChain::new();
        let keys = keys();
        let guard = ProcessingGuard::new();
        let token = guard.try_acquire().unwrap();

        TransactionExecutor::new(&chain)
            .execute(&token, keys.session().unwrap(), U256::from(5u64), None)
            .await
            .unwrap();
        assert_eq!(MockChain::calls(&chain.asset_calls), 1);
    }

    #[tokio::test]
    async fn test_transfer_failure_reports_stranded() {
        let chain = MockChain::new();
        chain.fail_next_transfer("execution reverted");
        let keys = keys();
        let guard = ProcessingGuard::new();
        let token = guard.try_acquire().unwrap();

        let failure = TransactionExecutor::new(&chain)
            .execute(&token, keys.session().unwrap(), U256::from(1000u64), Some(MockChain::asset_address()))
            .await
            .unwrap_err();

        assert_eq!(failure.leg, Leg::Transfer);
        assert!(failure.is_stranded());
        assert_eq!(failure.asset, Some(MockChain::asset_address()));
        assert!(matches!(failure.error, Error::Execution(_)));
    }

    #[tokio::test]
    async fn test_redeem_failure_is_not_stranded() {
        let chain = MockChain::new();
        chain.fail_next_redeem("insufficient funds for gas");
        let keys = keys();
        let guard = ProcessingGuard::new();
        let token = guard.try_acquire().unwrap();

        let failure = TransactionExecutor::new(&chain)
            .execute(&token, keys.session().unwrap(), U256::from(1000u64), None)
            .await
            .unwrap_err();

        assert_eq!(failure.leg, Leg::Redeem);
        assert!(!failure.is_stranded());
        assert_eq!(MockChain::calls(&chain.transfer_calls), 0);
    }

    #[tokio::test]
    async fn test_unconfirmed_redeem_is_stranded() {
        let chain = MockChain::new();
        chain.land_next_redeem_unconfirmed();
        let keys = keys();
        let guard = ProcessingGuard::new();
        let token = guard.try_acquire().unwrap();

        let failure = TransactionExecutor::new(&chain)
            .execute(&token, keys.session().unwrap(), U256::from(1000u64), Some(MockChain::asset_address()))
            .await
            .unwrap_err();

        assert_eq!(failure.leg, Leg::Redeem);
        assert!(failure.is_stranded());
        assert_eq!(failure.asset, None);
        assert!(matches!(failure.error, Error::Unconfirmed { .. }));
        assert_eq!(MockChain::calls(&chain.transfer_calls), 0);
    }

    #[tokio::test]
    async fn test_forward_moves_balance() {
        let chain = MockChain::new();
        chain.set_token_balance(700);
        let keys = keys();
        let guard = ProcessingGuard::new();
        let token = guard.try_acquire().unwrap();

        TransactionExecutor::new(&chain)
            .forward(&token, keys.session().unwrap(), MockChain::asset_address(), U256::from(700u64))
            .await
            .unwrap();
        assert_eq!(chain.transferred.lock().unwrap().len(), 1);
        assert_eq!(MockChain::calls(&chain.redeem_calls), 0);
    }
}
