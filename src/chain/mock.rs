//! Scripted in-memory chain for tests

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{Address, ChainClient, LocalSigner, TxHash, U256};
use crate::error::{Error, Result};

pub const MOCK_CHAIN_ID: u64 = 43114;

/// Chain double with scripted reads and failure injection
///
/// Capacity reads pop from a script and fall back to zero once it is
/// drained. A successful redeem credits the redeemed amount to the token
/// balance of the receiver; a successful transfer debits it.
pub struct MockChain {
    capacity_script: Mutex<VecDeque<std::result::Result<U256, String>>>,
    asset: Mutex<Option<Address>>,
    native_balance: Mutex<U256>,
    token_balance: Mutex<U256>,
    token_balance_error: Mutex<Option<String>>,
    redeem_failures: Mutex<VecDeque<String>>,
    unconfirmed_redeems: AtomicUsize,
    transfer_failures: Mutex<VecDeque<String>>,
    submit_delay: Mutex<Option<Duration>>,
    pub redeemed: Mutex<Vec<U256>>,
    pub transferred: Mutex<Vec<(Address, Address, U256)>>,
    pub capacity_calls: AtomicUsize,
    pub asset_calls: AtomicUsize,
    pub token_balance_calls: AtomicUsize,
    pub redeem_calls: AtomicUsize,
    pub transfer_calls: AtomicUsize,
    hashes: AtomicUsize,
}

impl MockChain {
    pub fn new() -> Self {
        Self {
            capacity_script: Mutex::new(VecDeque::new()),
            asset: Mutex::new(Some(Self::asset_address())),
            native_balance: Mutex::new(U256::from(10u64).pow(U256::from(18u64))),
            token_balance: Mutex::new(U256::ZERO),
            token_balance_error: Mutex::new(None),
            redeem_failures: Mutex::new(VecDeque::new()),
            unconfirmed_redeems: AtomicUsize::new(0),
            transfer_failures: Mutex::new(VecDeque::new()),
            submit_delay: Mutex::new(None),
            redeemed: Mutex::new(Vec::new()),
            transferred: Mutex::new(Vec::new()),
            capacity_calls: AtomicUsize::new(0),
            asset_calls: AtomicUsize::new(0),
            token_balance_calls: AtomicUsize::new(0),
            redeem_calls: AtomicUsize::new(0),
            transfer_calls: AtomicUsize::new(0),
            hashes: AtomicUsize::new(0),
        }
    }

    /// Underlying asset reported by `asset()` unless overridden
    pub fn asset_address() -> Address {
        Address::repeat_byte(0xa5)
    }

    pub fn push_capacity(&self, value: u64) -> &Self {
        self.capacity_script
            .lock()
            .unwrap()
            .push_back(Ok(U256::from(value)));
        self
    }

    pub fn push_capacity_error(&self, message: &str) -> &Self {
        self.capacity_script
            .lock()
            .unwrap()
            .push_back(Err(message.to_string()));
        self
    }

    pub fn set_asset(&self, asset: Option<Address>) {
        *self.asset.lock().unwrap() = asset;
    }

    pub fn set_native_balance(&self, wei: u64) {
        *self.native_balance.lock().unwrap() = U256::from(wei);
    }

    pub fn set_token_balance(&self, amount: u64) {
        *self.token_balance.lock().unwrap() = U256::from(amount);
    }

    pub fn fail_token_balance(&self, message: Option<&str>) {
        *self.token_balance_error.lock().unwrap() = message.map(str::to_string);
    }

    pub fn fail_next_redeem(&self, message: &str) {
        self.redeem_failures
            .lock()
            .unwrap()
            .push_back(message.to_string());
    }

    /// Next redeem lands on chain but its receipt never arrives
    pub fn land_next_redeem_unconfirmed(&self) {
        self.unconfirmed_redeems.fetch_add(1, Ordering::SeqCst);
    }

    pub fn fail_next_transfer(&self, message: &str) {
        self.transfer_failures
            .lock()
            .unwrap()
            .push_back(message.to_string());
    }

    /// Make submissions suspend for `delay` before settling
    pub fn delay_submissions(&self, delay: Duration) {
        *self.submit_delay.lock().unwrap() = Some(delay);
    }

    pub fn calls(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    fn next_hash(&self) -> TxHash {
        let n = self.hashes.fetch_add(1, Ordering::SeqCst) as u64 + 1;
        TxHash::left_padding_from(&n.to_be_bytes())
    }

    async fn settle(&self) {
        let delay = *self.submit_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

impl Default for MockChain {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChainClient for MockChain {
    async fn chain_id(&self) -> Result<u64> {
        Ok(MOCK_CHAIN_ID)
    }

    async fn read_capacity(&self, _vault: Address, _holder: Address) -> Result<U256> {
        self.capacity_calls.fetch_add(1, Ordering::SeqCst);
        let next = self.capacity_script.lock().unwrap().pop_front();
        match next {
            Some(Ok(value)) => Ok(value),
            Some(Err(message)) => Err(Error::Query(message)),
            None => Ok(U256::ZERO),
        }
    }

    async fn read_asset_address(&self, _vault: Address) -> Result<Address> {
        self.asset_calls.fetch_add(1, Ordering::SeqCst);
        let asset = *self.asset.lock().unwrap();
        asset.ok_or_else(|| Error::Query("execution reverted".to_string()))
    }

    async fn read_token_balance(&self, _token: Address, _holder: Address) -> Result<U256> {
        self.token_balance_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = self.token_balance_error.lock().unwrap().clone() {
            return Err(Error::Query(message));
        }
        Ok(*self.token_balance.lock().unwrap())
    }

    async fn read_native_balance(&self, _address: Address) -> Result<U256> {
        Ok(*self.native_balance.lock().unwrap())
    }

    async fn submit_redeem(
        &self,
        _vault: Address,
        shares: U256,
        _receiver: Address,
        _owner: Address,
        _signer: &LocalSigner,
    ) -> Result<TxHash> {
        self.redeem_calls.fetch_add(1, Ordering::SeqCst);
        self.settle().await;
        let failure = self.redeem_failures.lock().unwrap().pop_front();
        if let Some(message) = failure {
            return Err(Error::Execution(message));
        }
        self.redeemed.lock().unwrap().push(shares);
        *self.token_balance.lock().unwrap() += shares;
        let hash = self.next_hash();
        let unconfirmed = self
            .unconfirmed_redeems
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if unconfirmed {
            return Err(Error::Unconfirmed {
                hash,
                reason: "not included within 60000ms".to_string(),
            });
        }
        Ok(hash)
    }

    async fn submit_transfer(
        &self,
        token: Address,
        to: Address,
        amount: U256,
        _signer: &LocalSigner,
    ) -> Result<TxHash> {
        self.transfer_calls.fetch_add(1, Ordering::SeqCst);
        self.settle().await;
        let failure = self.transfer_failures.lock().unwrap().pop_front();
        if let Some(message) = failure {
            return Err(Error::Execution(message));
        }
        {
            let mut balance = self.token_balance.lock().unwrap();
            if *balance < amount {
                return Err(Error::Execution("transfer amount exceeds balance".to_string()));
            }
            *balance -= amount;
        }
        self.transferred.lock().unwrap().push((token, to, amount));
        Ok(self.next_hash())
    }
}
