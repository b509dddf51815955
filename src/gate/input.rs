//! Validators for raw operator input
//!
//! Each validator either produces a typed value or an `InvalidFormat`
//! error. Error text never echoes the rejected input.

use std::fmt;

use alloy_primitives::Address;
use lazy_static::lazy_static;
use regex::Regex;
use zeroize::Zeroizing;

use crate::error::{Error, Result};

lazy_static! {
    static ref ADDRESS_RE: Regex = Regex::new(r"^0x[0-9a-fA-F]{40}$").unwrap();
    static ref SECRET_RE: Regex = Regex::new(r"^(0[xX])?[0-9a-fA-F]{64}$").unwrap();
}

/// Parse an address: exactly `0x` followed by 40 hex characters
pub fn parse_address(raw: &str) -> Result<Address> {
    if !ADDRESS_RE.is_match(raw) {
        return Err(Error::InvalidFormat(
            "address must be 0x followed by 40 hex characters".to_string(),
        ));
    }
    raw.parse::<Address>()
        .map_err(|e| Error::InvalidFormat(format!("address could not be parsed: {}", e)))
}

/// Ephemeral secret in canonical `0x` + 64 lowercase hex form
///
/// The backing string is zeroized when dropped. `Debug` never prints it.
#[derive(Clone)]
pub struct SecretKey(Zeroizing<String>);

impl SecretKey {
    /// Validate and normalize a raw secret
    ///
    /// Surrounding whitespace is trimmed and the `0x` prefix is optional.
    /// Parsing an already canonical secret yields the same value.
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if !SECRET_RE.is_match(trimmed) {
            return Err(Error::InvalidFormat(
                "secret must be 64 hex characters, optionally prefixed with 0x".to_string(),
            ));
        }

        let digits = trimmed.get(trimmed.len() - 64..).unwrap_or_default();
        let mut canonical = Zeroizing::new(String::with_capacity(66));
        canonical.push_str("0x");
        canonical.extend(digits.chars().map(|c| c.to_ascii_lowercase()));
        Ok(Self(canonical))
    }

    /// Canonical form including the `0x` prefix
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The 64 hex digits without prefix
    pub fn hex_digits(&self) -> &str {
        &self.0[2..]
    }
}

impl PartialEq for SecretKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.as_str() == other.0.as_str()
    }
}

impl Eq for SecretKey {}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(***)")
    }
}
