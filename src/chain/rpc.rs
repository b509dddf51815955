//! JSON-RPC chain client
//!
//! Speaks plain Ethereum JSON-RPC over HTTP. Transactions are built as
//! EIP-1559 envelopes, signed locally with the ephemeral key and submitted
//! with `eth_sendRawTransaction`; submission returns only after the receipt
//! shows success.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use alloy_primitives::{Address, Bytes, U256};
use async_trait::async_trait;
use backoff::{future::retry, ExponentialBackoff};
use reqwest::Client;
use serde_json::{json, Value};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::config::ChainConfig;
use crate::error::{Error, Result};

use super::abi;
use super::signer::LocalSigner;
use super::tx::{transaction_hash, Eip1559Tx};
use super::{ChainClient, TxHash};

/// Rough gas for redeem + transfer, used for the cost estimate shown before a run
pub const RESCUE_GAS_ESTIMATE: u64 = 200_000;

/// Endpoint health as reported by `health`
#[derive(Debug, Clone)]
pub struct EndpointHealth {
    pub chain_id: u64,
    pub block_number: u64,
}

/// HTTP JSON-RPC implementation of [`ChainClient`]
pub struct HttpChainClient {
    client: Client,
    endpoint: String,
    config: ChainConfig,
    chain_id: OnceCell<u64>,
    request_id: AtomicU64,
}

impl HttpChainClient {
    /// Create a client for `endpoint` with settings from the `chain` config section
    pub fn new(endpoint: &str, config: ChainConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            config,
            chain_id: OnceCell::new(),
            request_id: AtomicU64::new(1),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Chain id and latest block, for connectivity checks
    pub async fn health(&self) -> Result<EndpointHealth> {
        let chain_id = self.fetch_chain_id().await?;
        let block_number = self.block_number().await?;
        Ok(EndpointHealth {
            chain_id,
            block_number,
        })
    }

    pub async fn block_number(&self) -> Result<u64> {
        let raw = self.read("eth_blockNumber", json!([])).await?;
        parse_hex_u64(&raw, "eth_blockNumber")
    }

    pub async fn gas_price(&self) -> Result<U256> {
        let raw = self.read("eth_gasPrice", json!([])).await?;
        parse_hex_u256(&raw, "eth_gasPrice")
    }

    /// Current gas price times [`RESCUE_GAS_ESTIMATE`]
    pub async fn estimate_rescue_cost(&self) -> Result<U256> {
        Ok(self.gas_price().await? * U256::from(RESCUE_GAS_ESTIMATE))
    }

    async fn fetch_chain_id(&self) -> Result<u64> {
        self.chain_id
            .get_or_try_init(|| async {
                let raw = self.read("eth_chainId", json!([])).await?;
                parse_hex_u64(&raw, "eth_chainId")
            })
            .await
            .copied()
    }

    /// Single JSON-RPC round trip
    async fn rpc_call(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.request_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": id,
        });

        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::RpcTimeout(self.config.timeout_ms)
                } else {
                    Error::Rpc(format!("{} request failed: {}", method, e))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Rpc(format!("{} returned HTTP {}", method, status)));
        }

        let value: Value = response.json().await?;
        parse_response(method, value)
    }

    /// Read call returning a string result, retried on transport errors
    async fn read(&self, method: &str, params: Value) -> Result<String> {
        let backoff = ExponentialBackoff {
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_millis(1000),
            max_elapsed_time: Some(Duration::from_millis(self.config.timeout_ms)),
            ..Default::default()
        };

        let max_retries = self.config.max_retries;
        let attempts = AtomicU64::new(0);

        let value = retry(backoff, || async {
            let attempt = attempts.fetch_add(1, Ordering::Relaxed);
            match self.rpc_call(method, params.clone()).await {
                Ok(value) => Ok(value),
                Err(e) if e.is_retryable() && attempt < u64::from(max_retries) => {
                    debug!("Retryable RPC error on {}: {}", method, e.redacted());
                    Err(backoff::Error::transient(e))
                }
                Err(e) => Err(backoff::Error::permanent(e)),
            }
        })
        .await
        .map_err(into_query)?;

        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| Error::Query(format!("{} result is not a string", method)))
    }

    async fn eth_call(&self, to: Address, data: Vec<u8>, from: Option<Address>) -> Result<Vec<u8>> {
        let mut call = json!({
            "to": to.to_string(),
            "data": format!("0x{}", hex::encode(&data)),
        });
        if let Some(from) = from {
            call["from"] = Value::String(from.to_string());
        }
        let raw = self.read("eth_call", json!([call, "latest"])).await?;
        decode_hex_blob(&raw, "eth_call")
    }

    /// Build, sign, submit and await one contract call
    async fn send_call(&self, signer: &LocalSigner, to: Address, data: Vec<u8>) -> Result<TxHash> {
        let from = signer.address();
        let data_hex = format!("0x{}", hex::encode(&data));

        let chain_id = self.fetch_chain_id().await.map_err(into_execution)?;
        let nonce_raw = self
            .read("eth_getTransactionCount", json!([from.to_string(), "pending"]))
            .await
            .map_err(into_execution)?;
        let nonce = parse_hex_u64(&nonce_raw, "eth_getTransactionCount").map_err(into_execution)?;

        let estimate_raw = self
            .read(
                "eth_estimateGas",
                json!([{ "from": from.to_string(), "to": to.to_string(), "data": data_hex }]),
            )
            .await
            .map_err(into_execution)?;
        let estimate = parse_hex_u64(&estimate_raw, "eth_estimateGas").map_err(into_execution)?;
        let gas_limit = estimate.saturating_mul(100 + self.config.gas_limit_buffer_pct) / 100;

        let gas_price = self.gas_price().await.map_err(into_execution)?;
        let priority = U256::from(self.config.priority_fee_wei).min(gas_price);
        let max_fee = gas_price.saturating_mul(U256::from(2u64)).saturating_add(priority);

        let tx = Eip1559Tx {
            chain_id,
            nonce,
            max_priority_fee_per_gas: priority,
            max_fee_per_gas: max_fee,
            gas_limit,
            to,
            value: U256::ZERO,
            data: Bytes::from(data),
        };

        let signature = signer.sign_prehash(&tx.signing_hash())?;
        let raw = tx.encode_signed(&signature);
        let expected = transaction_hash(&raw);

        let sent = match self
            .rpc_call(
                "eth_sendRawTransaction",
                json!([format!("0x{}", hex::encode(&raw))]),
            )
            .await
        {
            Ok(sent) => sent,
            // the node may have accepted it before the connection failed
            Err(e) if e.is_retryable() => {
                return Err(Error::Unconfirmed {
                    hash: expected,
                    reason: e.redacted(),
                })
            }
            Err(e) => return Err(into_execution(e)),
        };
        let hash = match sent.as_str() {
            Some(reported) => parse_hash(reported).map_err(into_execution)?,
            None => expected,
        };
        if hash != expected {
            warn!("Node reported a different transaction hash than computed locally");
        }

        debug!(nonce, gas_limit, "Transaction submitted, awaiting receipt");
        self.await_receipt(hash).await?;
        Ok(hash)
    }

    /// Poll for the receipt until included or the receipt timeout passes
    async fn await_receipt(&self, hash: TxHash) -> Result<()> {
        let deadline =
            tokio::time::Instant::now() + Duration::from_millis(self.config.receipt_timeout_ms);
        let poll = Duration::from_millis(self.config.receipt_poll_interval_ms);

        loop {
            match self
                .rpc_call("eth_getTransactionReceipt", json!([hash.to_string()]))
                .await
            {
                Ok(Value::Null) => {}
                Ok(receipt) => {
                    let status = receipt.get("status").and_then(Value::as_str).unwrap_or("0x0");
                    return if parse_hex_u64(status, "receipt status").unwrap_or(0) == 1 {
                        Ok(())
                    } else {
                        Err(Error::Execution(format!("transaction {} reverted", hash)))
                    };
                }
                Err(e) if e.is_retryable() => {
                    debug!("Receipt poll failed, retrying: {}", e.redacted());
                }
                Err(e) => {
                    return Err(Error::Unconfirmed {
                        hash,
                        reason: e.redacted(),
                    })
                }
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Unconfirmed {
                    hash,
                    reason: format!("not included within {}ms", self.config.receipt_timeout_ms),
                });
            }
            tokio::time::sleep(poll).await;
        }
    }
}

#[async_trait]
impl ChainClient for HttpChainClient {
    async fn chain_id(&self) -> Result<u64> {
        self.fetch_chain_id().await
    }

    async fn read_capacity(&self, vault: Address, holder: Address) -> Result<U256> {
        let data = self.eth_call(vault, abi::encode_max_redeem(holder), None).await?;
        abi::decode_uint256(&data, abi::MAX_REDEEM)
    }

    async fn read_asset_address(&self, vault: Address) -> Result<Address> {
        let data = self.eth_call(vault, abi::encode_asset(), None).await?;
        abi::decode_address(&data, abi::ASSET)
    }

    async fn read_token_balance(&self, token: Address, holder: Address) -> Result<U256> {
        let data = self.eth_call(token, abi::encode_balance_of(holder), None).await?;
        abi::decode_uint256(&data, abi::BALANCE_OF)
    }

    async fn read_native_balance(&self, address: Address) -> Result<U256> {
        let raw = self
            .read("eth_getBalance", json!([address.to_string(), "latest"]))
            .await?;
        parse_hex_u256(&raw, "eth_getBalance")
    }

    async fn submit_redeem(
        &self,
        vault: Address,
        shares: U256,
        receiver: Address,
        owner: Address,
        signer: &LocalSigner,
    ) -> Result<TxHash> {
        let hash = self
            .send_call(signer, vault, abi::encode_redeem(shares, receiver, owner))
            .await?;
        info!(shares = %shares, "Redeem transaction confirmed");
        Ok(hash)
    }

    async fn submit_transfer(
        &self,
        token: Address,
        to: Address,
        amount: U256,
        signer: &LocalSigner,
    ) -> Result<TxHash> {
        let data = abi::encode_transfer(to, amount);

        // transfer() must report success when simulated from the signer
        let returned = self
            .eth_call(token, data.clone(), Some(signer.address()))
            .await
            .map_err(into_execution)?;
        if !abi::decode_bool(&returned, abi::TRANSFER)? {
            return Err(Error::Execution("token transfer returned false".to_string()));
        }

        let hash = self.send_call(signer, token, data).await?;
        info!(amount = %amount, "Transfer transaction confirmed");
        Ok(hash)
    }
}

/// Split a JSON-RPC response into its result or the node's error object
fn parse_response(method: &str, value: Value) -> Result<Value> {
    if let Some(error) = value.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        return Err(Error::RpcResponse(format!("{} error: {}", method, message)));
    }

    value
        .get("result")
        .cloned()
        .ok_or_else(|| Error::RpcResponse(format!("{} result was missing", method)))
}

/// Map transport/RPC failures on a read path to `Query`
fn into_query(e: Error) -> Error {
    match e {
        Error::Rpc(msg) | Error::RpcResponse(msg) => Error::Query(msg),
        Error::RpcTimeout(ms) => Error::Query(format!("RPC timeout after {}ms", ms)),
        other => other,
    }
}

/// Map any failure on a submission path to `Execution`
fn into_execution(e: Error) -> Error {
    match e {
        Error::Execution(_) | Error::Unconfirmed { .. } => e,
        Error::Rpc(msg) | Error::RpcResponse(msg) | Error::Query(msg) => Error::Execution(msg),
        Error::RpcTimeout(ms) => Error::Execution(format!("RPC timeout after {}ms", ms)),
        other => Error::Execution(other.to_string()),
    }
}

fn strip_hex_prefix<'a>(raw: &'a str, field: &str) -> Result<&'a str> {
    let value = raw.trim();
    value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .ok_or_else(|| Error::Query(format!("{} must be 0x-prefixed hex", field)))
}

pub(crate) fn parse_hex_u64(raw: &str, field: &str) -> Result<u64> {
    let digits = strip_hex_prefix(raw, field)?;
    u64::from_str_radix(digits, 16)
        .map_err(|e| Error::Query(format!("failed to parse {} as hex u64: {}", field, e)))
}

pub(crate) fn parse_hex_u256(raw: &str, field: &str) -> Result<U256> {
    let digits = strip_hex_prefix(raw, field)?;
    if digits.is_empty() {
        return Ok(U256::ZERO);
    }
    if digits.len() > 64 {
        return Err(Error::Query(format!("{} exceeds 32 bytes", field)));
    }
    U256::from_str_radix(digits, 16)
        .map_err(|e| Error::Query(format!("failed to parse {} as hex quantity: {}", field, e)))
}

fn decode_hex_blob(raw: &str, field: &str) -> Result<Vec<u8>> {
    let digits = strip_hex_prefix(raw, field)?;
    hex::decode(digits).map_err(|e| Error::Query(format!("{} is not valid hex: {}", field, e)))
}

fn parse_hash(raw: &str) -> Result<TxHash> {
    let bytes = decode_hex_blob(raw, "transaction hash")?;
    if bytes.len() != 32 {
        return Err(Error::Query("transaction hash must be 32 bytes".to_string()));
    }
    Ok(TxHash::from_slice(&bytes))
}
