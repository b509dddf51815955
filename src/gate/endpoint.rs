//! Endpoint trust
//!
//! An endpoint is trusted when it is an exact member of [`TRUSTED_ENDPOINTS`],
//! or when the operator has typed [`OVERRIDE_PHRASE`] for it.

use url::Url;

use crate::error::{Error, Result};

/// Public endpoints accepted without an override
pub const TRUSTED_ENDPOINTS: &[&str] = &[
    "https://api.avax.network/ext/bc/C/rpc",
    "https://avalanche.public-rpc.com",
    "https://eth.llamarpc.com",
    "https://rpc.ankr.com/eth",
    "https://ethereum.publicnode.com",
    "https://arb1.arbitrum.io/rpc",
    "https://arbitrum.llamarpc.com",
    "https://polygon-rpc.com",
    "https://rpc-mainnet.matic.network",
];

/// Confirmation the operator types to accept a non-listed endpoint
pub const OVERRIDE_PHRASE: &str = "I UNDERSTAND THE RISK";

/// Preset for a supported network
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Network {
    pub name: &'static str,
    pub chain_id: u64,
    pub endpoint: &'static str,
    /// Default vault, when one is known for the network
    pub vault: Option<&'static str>,
}

pub const KNOWN_NETWORKS: &[Network] = &[
    Network {
        name: "Avalanche C-Chain (K3 USDT Earn Vault)",
        chain_id: 43114,
        endpoint: "https://api.avax.network/ext/bc/C/rpc",
        vault: Some("0xE1A62FDcC6666847d5EA752634E45e134B2F824B"),
    },
    Network {
        name: "Ethereum",
        chain_id: 1,
        endpoint: "https://eth.llamarpc.com",
        vault: None,
    },
    Network {
        name: "Arbitrum One",
        chain_id: 42161,
        endpoint: "https://arb1.arbitrum.io/rpc",
        vault: None,
    },
];

/// Network used when nothing is configured
pub fn default_network() -> DefaultNetwork {
    let preset = KNOWN_NETWORKS[0];
    DefaultNetwork {
        endpoint: preset.endpoint,
        vault: preset.vault.unwrap_or_default(),
    }
}

/// Endpoint and vault of the default preset
#[derive(Debug, Clone, Copy)]
pub struct DefaultNetwork {
    pub endpoint: &'static str,
    pub vault: &'static str,
}

/// Exact allow-list membership
pub fn is_allow_listed(url: &str) -> bool {
    TRUSTED_ENDPOINTS.contains(&url)
}

/// Node endpoint with its derived trust flag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainEndpoint {
    url: String,
    allow_listed: bool,
    override_confirmed: bool,
}

impl ChainEndpoint {
    /// Validate the URL shape and compute allow-list membership
    pub fn parse(raw: &str) -> Result<Self> {
        let url = raw.trim();
        let parsed = Url::parse(url)
            .map_err(|e| Error::InvalidFormat(format!("endpoint is not a valid URL: {}", e)))?;
        if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
            return Err(Error::InvalidFormat(
                "endpoint must be an http(s) URL with a host".to_string(),
            ));
        }

        Ok(Self {
            url: url.to_string(),
            allow_listed: is_allow_listed(url),
            override_confirmed: false,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_allow_listed(&self) -> bool {
        self.allow_listed
    }

    /// Value-moving operations require this
    pub fn is_trusted(&self) -> bool {
        self.allow_listed || self.override_confirmed
    }

    /// Not listed and not yet confirmed
    pub fn override_pending(&self) -> bool {
        !self.is_trusted()
    }

    /// Unlock with the exact confirmation phrase
    ///
    /// Returns whether the endpoint is trusted afterwards. Any other input,
    /// including partial or differently-cased text, leaves it locked.
    pub fn confirm_override(&mut self, phrase: &str) -> bool {
        if phrase == OVERRIDE_PHRASE {
            self.override_confirmed = true;
        }
        self.is_trusted()
    }

    /// Error to surface when a value-moving operation needs trust
    pub fn require_trusted(&self) -> Result<()> {
        if self.is_trusted() {
            Ok(())
        } else {
            Err(Error::UntrustedEndpoint(format!(
                "{} is not allow-listed; type \"{}\" to proceed",
                crate::config::mask_url(&self.url),
                OVERRIDE_PHRASE
            )))
        }
    }
}
