//! Trust and validation gatekeeper
//!
//! Turns raw operator strings into validated values and keeps the trust
//! state that decides whether a session may be armed:
//! - `input`: address and secret validators
//! - `endpoint`: allow-list and typed override
//! - `vault`: `asset()` probe, cached per (vault, endpoint)

pub mod endpoint;
pub mod input;
pub mod vault;

use alloy_primitives::Address;
use tracing::{info, warn};

use crate::chain::ChainClient;
use crate::error::{Error, Result};

pub use endpoint::{ChainEndpoint, OVERRIDE_PHRASE};
pub use input::{parse_address, SecretKey};
pub use vault::{ProbeOutcome, VaultProbe};

/// Validation state for endpoint and vault
#[derive(Debug, Default)]
pub struct Gatekeeper {
    endpoint: Option<ChainEndpoint>,
    vault: Option<Address>,
    probe: Option<VaultProbe>,
}

impl Gatekeeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the node endpoint
    ///
    /// Setting a different URL drops any override and the cached vault probe.
    /// Setting the same URL again is a no-op.
    pub fn set_endpoint(&mut self, raw: &str) -> Result<&ChainEndpoint> {
        let parsed = ChainEndpoint::parse(raw)?;
        let unchanged = self
            .endpoint
            .as_ref()
            .map_or(false, |current| current.url() == parsed.url());

        if !unchanged {
            if parsed.override_pending() {
                warn!(
                    "Endpoint {} is not allow-listed; override required before arming",
                    crate::config::mask_url(parsed.url())
                );
            }
            self.endpoint = Some(parsed);
            self.probe = None;
        }

        self.endpoint
            .as_ref()
            .ok_or_else(|| Error::StateConflict("endpoint not set".to_string()))
    }

    /// Try to unlock the current endpoint with the typed phrase
    pub fn confirm_override(&mut self, phrase: &str) -> Result<bool> {
        let endpoint = self
            .endpoint
            .as_mut()
            .ok_or_else(|| Error::StateConflict("no endpoint to confirm".to_string()))?;
        let trusted = endpoint.confirm_override(phrase);
        if trusted && !endpoint.is_allow_listed() {
            info!("Operator confirmed untrusted endpoint override");
        }
        Ok(trusted)
    }

    /// Set the vault address; a different address drops the cached probe
    pub fn set_vault(&mut self, raw: &str) -> Result<Address> {
        let vault = parse_address(raw)?;
        if self.vault != Some(vault) {
            self.vault = Some(vault);
            self.probe = None;
        }
        Ok(vault)
    }

    pub fn endpoint(&self) -> Option<&ChainEndpoint> {
        self.endpoint.as_ref()
    }

    pub fn vault(&self) -> Option<Address> {
        self.vault
    }

    /// Endpoint set and trusted
    pub fn is_unlocked(&self) -> bool {
        self.endpoint.as_ref().map_or(false, ChainEndpoint::is_trusted)
    }

    /// Endpoint set but neither allow-listed nor confirmed
    pub fn override_pending(&self) -> bool {
        self.endpoint
            .as_ref()
            .map_or(false, ChainEndpoint::override_pending)
    }

    /// Fail unless the endpoint is set and trusted
    pub fn require_unlocked(&self) -> Result<&ChainEndpoint> {
        let endpoint = self
            .endpoint
            .as_ref()
            .ok_or_else(|| Error::InvalidFormat("no endpoint configured".to_string()))?;
        endpoint.require_trusted()?;
        Ok(endpoint)
    }

    /// Probe the vault's `asset()` and cache the outcome
    pub async fn probe_vault(&mut self, client: &dyn ChainClient) -> Result<Address> {
        let (address, endpoint) = self.current_pair()?;
        let probe = vault::probe(client, address, &endpoint).await;
        let outcome = probe.outcome().clone();
        self.probe = Some(probe);
        outcome.into_result()
    }

    /// Probe outcome for the current pair, if one was taken
    pub fn probe_outcome(&self) -> Option<&ProbeOutcome> {
        let (vault, endpoint) = self.current_pair().ok()?;
        self.probe
            .as_ref()
            .filter(|p| p.matches(vault, &endpoint))
            .map(VaultProbe::outcome)
    }

    /// Asset of a valid probe for the current pair
    pub fn cached_asset(&self) -> Option<Address> {
        self.probe_outcome().and_then(ProbeOutcome::asset)
    }

    /// Fail unless the current vault has been probed valid
    pub fn require_valid_vault(&self) -> Result<(Address, Address)> {
        let (vault, _) = self.current_pair()?;
        match self.probe_outcome() {
            Some(ProbeOutcome::Valid { asset }) => Ok((vault, *asset)),
            Some(ProbeOutcome::Invalid { reason }) => Err(Error::VaultValidation(reason.clone())),
            None => Err(Error::VaultValidation(
                "vault has not been validated".to_string(),
            )),
        }
    }

    fn current_pair(&self) -> Result<(Address, String)> {
        let vault = self
            .vault
            .ok_or_else(|| Error::InvalidFormat("no vault address configured".to_string()))?;
        let endpoint = self
            .endpoint
            .as_ref()
            .ok_or_else(|| Error::InvalidFormat("no endpoint configured".to_string()))?;
        Ok((vault, endpoint.url().to_string()))
    }
}
