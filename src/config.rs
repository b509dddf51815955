//! Configuration loading and validation

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::gate::endpoint::default_network;
use crate::redact::mask_address;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub chain: ChainConfig,
    #[serde(default)]
    pub vault: VaultConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub polling: PollingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Retries for read calls on transport errors
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_receipt_timeout_ms")]
    pub receipt_timeout_ms: u64,
    #[serde(default = "default_receipt_poll_interval_ms")]
    pub receipt_poll_interval_ms: u64,
    #[serde(default = "default_priority_fee_wei")]
    pub priority_fee_wei: u64,
    /// Headroom added on top of `eth_estimateGas`
    #[serde(default = "default_gas_limit_buffer_pct")]
    pub gas_limit_buffer_pct: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VaultConfig {
    #[serde(default = "default_vault_address")]
    pub address: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Safe destination; prompted for when unset
    #[serde(default)]
    pub destination: Option<String>,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Delay between a successful rescue and the wipe
    #[serde(default = "default_success_grace_ms")]
    pub success_grace_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_base_interval_ms")]
    pub base_interval_ms: u64,
    /// Cadence after nonzero capacity has been seen
    #[serde(default = "default_accelerated_interval_ms")]
    pub accelerated_interval_ms: u64,
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
}

impl SessionConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn success_grace(&self) -> Duration {
        Duration::from_millis(self.success_grace_ms)
    }
}

impl PollingConfig {
    pub fn base_interval(&self) -> Duration {
        Duration::from_millis(self.base_interval_ms)
    }

    pub fn accelerated_interval(&self) -> Duration {
        Duration::from_millis(self.accelerated_interval_ms)
    }
}

// Default value functions
fn default_endpoint() -> String {
    default_network().endpoint.to_string()
}

fn default_vault_address() -> String {
    default_network().vault.to_string()
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_max_retries() -> u32 {
    2
}

fn default_receipt_timeout_ms() -> u64 {
    60_000
}

fn default_receipt_poll_interval_ms() -> u64 {
    1_000
}

fn default_priority_fee_wei() -> u64 {
    1_500_000_000
}

fn default_gas_limit_buffer_pct() -> u64 {
    20
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_success_grace_ms() -> u64 {
    3_000
}

fn default_base_interval_ms() -> u64 {
    2_000
}

fn default_accelerated_interval_ms() -> u64 {
    800
}

fn default_max_failures() -> u32 {
    5
}

impl Config {
    /// Load configuration from file and environment variables
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let settings = config::Config::builder()
            .set_default("chain.endpoint", default_endpoint())?
            .set_default("vault.address", default_vault_address())?
            .set_default("polling.max_failures", default_max_failures() as i64)?
            // Load from file if exists
            .add_source(config::File::from(path).required(false))
            // Override with environment variables (prefix RESCUE_)
            .add_source(
                config::Environment::with_prefix("RESCUE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let config: Config = settings
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.chain.timeout_ms == 0 {
            anyhow::bail!("chain.timeout_ms must be positive");
        }

        if self.chain.receipt_poll_interval_ms == 0 {
            anyhow::bail!("chain.receipt_poll_interval_ms must be positive");
        }

        if self.polling.base_interval_ms == 0 || self.polling.accelerated_interval_ms == 0 {
            anyhow::bail!("polling intervals must be positive");
        }

        if self.polling.accelerated_interval_ms > self.polling.base_interval_ms {
            anyhow::bail!(
                "accelerated_interval_ms ({}) cannot exceed base_interval_ms ({})",
                self.polling.accelerated_interval_ms,
                self.polling.base_interval_ms
            );
        }

        if self.polling.max_failures == 0 {
            anyhow::bail!("max_failures must be at least 1");
        }

        if self.session.idle_timeout_secs == 0 {
            anyhow::bail!("idle_timeout_secs must be positive");
        }

        url::Url::parse(&self.chain.endpoint)
            .with_context(|| format!("Invalid chain.endpoint: {}", mask_url(&self.chain.endpoint)))?;

        if self.chain.gas_limit_buffer_pct > 100 {
            tracing::warn!(
                "gas_limit_buffer_pct is {}% - transactions will reserve far more gas than estimated",
                self.chain.gas_limit_buffer_pct
            );
        }

        Ok(())
    }

    /// Get masked configuration for display (hide endpoint keys and addresses)
    pub fn masked_display(&self) -> String {
        format!(
            r#"Configuration:
  Chain:
    endpoint: {}
    timeout: {}ms
    max_retries: {}
    receipt_timeout: {}ms
    priority_fee: {} wei
    gas_limit_buffer: {}%
  Vault:
    address: {}
  Session:
    destination: {}
    idle_timeout: {}s
    success_grace: {}ms
  Polling:
    base_interval: {}ms
    accelerated_interval: {}ms
    max_failures: {}
"#,
            mask_url(&self.chain.endpoint),
            self.chain.timeout_ms,
            self.chain.max_retries,
            self.chain.receipt_timeout_ms,
            self.chain.priority_fee_wei,
            self.chain.gas_limit_buffer_pct,
            mask_address(&self.vault.address),
            match &self.session.destination {
                Some(destination) => mask_address(destination),
                None => "(prompted)".to_string(),
            },
            self.session.idle_timeout_secs,
            self.session.success_grace_ms,
            self.polling.base_interval_ms,
            self.polling.accelerated_interval_ms,
            self.polling.max_failures,
        )
    }
}

/// Mask URL for display (hide API keys in query params)
pub fn mask_url(url: &str) -> String {
    if let Some(idx) = url.find('?') {
        format!("{}?***", &url[..idx])
    } else {
        url.to_string()
    }
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            timeout_ms: default_timeout_ms(),
            max_retries: default_max_retries(),
            receipt_timeout_ms: default_receipt_timeout_ms(),
            receipt_poll_interval_ms: default_receipt_poll_interval_ms(),
            priority_fee_wei: default_priority_fee_wei(),
            gas_limit_buffer_pct: default_gas_limit_buffer_pct(),
        }
    }
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            address: default_vault_address(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            destination: None,
            idle_timeout_secs: default_idle_timeout_secs(),
            success_grace_ms: default_success_grace_ms(),
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            base_interval_ms: default_base_interval_ms(),
            accelerated_interval_ms: default_accelerated_interval_ms(),
            max_failures: default_max_failures(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chain: ChainConfig::default(),
            vault: VaultConfig::default(),
            session: SessionConfig::default(),
            polling: PollingConfig::default(),
        }
    }
}
