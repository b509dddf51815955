//! Minimal ABI encoding for the vault and token calls we make
//!
//! Every decoder is a type guard: a return value that is not exactly the
//! expected ABI shape is rejected instead of being coerced.

use alloy_primitives::{keccak256, Address, U256};

use crate::error::{Error, Result};

/// ABI word size
pub const WORD: usize = 32;

pub const MAX_REDEEM: &str = "maxRedeem(address)";
pub const ASSET: &str = "asset()";
pub const REDEEM: &str = "redeem(uint256,address,address)";
pub const TRANSFER: &str = "transfer(address,uint256)";
pub const BALANCE_OF: &str = "balanceOf(address)";

/// First four bytes of keccak256 of the canonical signature
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    let mut out = [0u8; 4];
    out.copy_from_slice(&hash[..4]);
    out
}

fn address_word(address: Address) -> [u8; WORD] {
    let mut word = [0u8; WORD];
    word[12..].copy_from_slice(address.as_slice());
    word
}

fn uint_word(value: U256) -> [u8; WORD] {
    value.to_be_bytes::<WORD>()
}

fn call(signature: &str, words: &[[u8; WORD]]) -> Vec<u8> {
    let mut data = Vec::with_capacity(4 + words.len() * WORD);
    data.extend_from_slice(&selector(signature));
    for word in words {
        data.extend_from_slice(word);
    }
    data
}

pub fn encode_max_redeem(owner: Address) -> Vec<u8> {
    call(MAX_REDEEM, &[address_word(owner)])
}

pub fn encode_asset() -> Vec<u8> {
    call(ASSET, &[])
}

pub fn encode_redeem(shares: U256, receiver: Address, owner: Address) -> Vec<u8> {
    call(
        REDEEM,
        &[uint_word(shares), address_word(receiver), address_word(owner)],
    )
}

pub fn encode_transfer(to: Address, amount: U256) -> Vec<u8> {
    call(TRANSFER, &[address_word(to), uint_word(amount)])
}

pub fn encode_balance_of(holder: Address) -> Vec<u8> {
    call(BALANCE_OF, &[address_word(holder)])
}

/// Decode a single `uint256` return value
pub fn decode_uint256(data: &[u8], function: &str) -> Result<U256> {
    if data.len() != WORD {
        return Err(Error::Query(format!(
            "{} returned {} bytes, expected a single uint256 word",
            function,
            data.len()
        )));
    }
    Ok(U256::from_be_slice(data))
}

/// Decode a single `address` return value
///
/// The upper 12 bytes of the word must be zero padding.
pub fn decode_address(data: &[u8], function: &str) -> Result<Address> {
    if data.len() != WORD {
        return Err(Error::Query(format!(
            "{} returned {} bytes, expected a single address word",
            function,
            data.len()
        )));
    }
    if data[..12].iter().any(|b| *b != 0) {
        return Err(Error::Query(format!(
            "{} returned a word that is not a left-padded 20-byte address",
            function
        )));
    }
    Ok(Address::from_slice(&data[12..]))
}

/// Decode an optional `bool` return value
///
/// Tokens that return nothing from `transfer` are treated as successful;
/// anything else must be a canonical boolean word.
pub fn decode_bool(data: &[u8], function: &str) -> Result<bool> {
    if data.is_empty() {
        return Ok(true);
    }
    if data.len() != WORD || data[..WORD - 1].iter().any(|b| *b != 0) || data[WORD - 1] > 1 {
        return Err(Error::Execution(format!(
            "{} returned a value that is not a boolean",
            function
        )));
    }
    Ok(data[WORD - 1] == 1)
}
