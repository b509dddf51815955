//! Vault capability probe and its cache

use alloy_primitives::Address;
use tracing::{debug, warn};

use crate::chain::ChainClient;
use crate::error::{Error, Result};

/// Result of probing a vault's `asset()`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Valid { asset: Address },
    Invalid { reason: String },
}

impl ProbeOutcome {
    pub fn asset(&self) -> Option<Address> {
        match self {
            ProbeOutcome::Valid { asset } => Some(*asset),
            ProbeOutcome::Invalid { .. } => None,
        }
    }

    pub fn into_result(self) -> Result<Address> {
        match self {
            ProbeOutcome::Valid { asset } => Ok(asset),
            ProbeOutcome::Invalid { reason } => Err(Error::VaultValidation(reason)),
        }
    }
}

/// Probe outcome pinned to the (vault, endpoint) pair it was taken against
#[derive(Debug, Clone)]
pub struct VaultProbe {
    vault: Address,
    endpoint: String,
    outcome: ProbeOutcome,
}

impl VaultProbe {
    pub fn outcome(&self) -> &ProbeOutcome {
        &self.outcome
    }

    /// Whether this probe still describes `vault` on `endpoint`
    pub fn matches(&self, vault: Address, endpoint: &str) -> bool {
        self.vault == vault && self.endpoint == endpoint
    }
}

/// Read-only `asset()` probe
///
/// A well-formed non-zero address marks the vault valid. Any failure marks
/// it invalid with a scrubbed reason. Never submits anything.
pub async fn probe(client: &dyn ChainClient, vault: Address, endpoint: &str) -> VaultProbe {
    let outcome = match client.read_asset_address(vault).await {
        Ok(asset) if asset == Address::ZERO => ProbeOutcome::Invalid {
            reason: "vault reported the zero address as its asset".to_string(),
        },
        Ok(asset) => {
            debug!("Vault probe succeeded");
            ProbeOutcome::Valid { asset }
        }
        Err(e) => {
            let reason = format!("not an ERC-4626 vault: {}", e.redacted());
            warn!("Vault probe failed: {}", reason);
            ProbeOutcome::Invalid { reason }
        }
    };

    VaultProbe {
        vault,
        endpoint: endpoint.to_string(),
        outcome,
    }
}
