//! Scrubbing of address-like and key-like hex from operator-visible text
//!
//! Chain nodes echo addresses, calldata and hashes back in their error
//! messages. Anything that reaches a log line or a notice goes through
//! [`scrub`] first.

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    /// 64 hex chars: private keys and transaction hashes
    static ref WORD_64: Regex = Regex::new(r"(0[xX])?[0-9a-fA-F]{64}").unwrap();
    /// 40 hex chars: addresses
    static ref WORD_40: Regex = Regex::new(r"(0[xX])?[0-9a-fA-F]{40}").unwrap();
}

/// Replacement for a scrubbed 64-hex sequence
pub const HIDDEN_WORD: &str = "[hidden]";

/// Replacement for a scrubbed 40-hex sequence
pub const HIDDEN_ADDRESS: &str = "0x...[address hidden]";

/// Remove 64-hex and 40-hex sequences, longest first
pub fn scrub(text: &str) -> String {
    let pass = WORD_64.replace_all(text, HIDDEN_WORD);
    WORD_40.replace_all(&pass, HIDDEN_ADDRESS).into_owned()
}

/// Mask an address for display, keeping prefix and suffix
pub fn mask_address(address: &str) -> String {
    if !address.is_ascii() {
        return "***".to_string();
    }
    if address.len() <= 12 {
        return address.to_string();
    }
    format!("{}...{}", &address[..6], &address[address.len() - 4..])
}
