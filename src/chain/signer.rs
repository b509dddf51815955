//! Ephemeral secp256k1 signer
//!
//! Holds the only parsed copy of the ephemeral secret. The underlying
//! `k256` key zeroizes itself on drop, and `Debug` shows the address only.

use std::fmt;

use alloy_primitives::{keccak256, Address, B256, U256};
use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use zeroize::Zeroizing;

use crate::error::{Error, Result};
use crate::gate::input::SecretKey;

/// Recoverable signature parts in the form EIP-1559 expects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoverableSignature {
    pub y_parity: u8,
    pub r: U256,
    pub s: U256,
}

/// Signer for the ephemeral wallet
pub struct LocalSigner {
    key: SigningKey,
    address: Address,
}

impl LocalSigner {
    /// Derive the signer from a validated secret
    ///
    /// Fails if the 32 bytes are not a valid non-zero scalar below the curve
    /// order. Never falls back to any default key.
    pub fn from_secret(secret: &SecretKey) -> Result<Self> {
        let mut bytes = Zeroizing::new([0u8; 32]);
        hex::decode_to_slice(secret.hex_digits(), bytes.as_mut_slice())
            .map_err(|e| Error::KeyDerivation(format!("secret is not valid hex: {}", e)))?;

        let key = SigningKey::from_slice(bytes.as_slice()).map_err(|_| {
            Error::KeyDerivation("secret is not a valid secp256k1 scalar".to_string())
        })?;
        let address = address_of(key.verifying_key())?;

        Ok(Self { key, address })
    }

    /// Derived wallet address
    pub fn address(&self) -> Address {
        self.address
    }

    /// Sign a 32-byte digest and work out the recovery parity
    pub fn sign_prehash(&self, digest: &B256) -> Result<RecoverableSignature> {
        let (signature, _) = self
            .key
            .sign_prehash_recoverable(digest.as_slice())
            .map_err(|e| Error::Execution(format!("signing failed: {}", e)))?;
        let signature = signature.normalize_s().unwrap_or(signature);
        let y_parity = self.recover_parity(digest, &signature)?;

        let bytes = signature.to_bytes();
        Ok(RecoverableSignature {
            y_parity,
            r: U256::from_be_slice(&bytes[..32]),
            s: U256::from_be_slice(&bytes[32..]),
        })
    }

    fn recover_parity(&self, digest: &B256, signature: &Signature) -> Result<u8> {
        for candidate in [0u8, 1u8] {
            let Some(recovery_id) = RecoveryId::from_byte(candidate) else {
                continue;
            };
            if let Ok(recovered) =
                VerifyingKey::recover_from_prehash(digest.as_slice(), signature, recovery_id)
            {
                if &recovered == self.key.verifying_key() {
                    return Ok(candidate);
                }
            }
        }
        Err(Error::Execution(
            "failed to recover signature parity".to_string(),
        ))
    }
}

impl fmt::Debug for LocalSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalSigner")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

/// Ethereum address of a public key: last 20 bytes of keccak256(X || Y)
pub fn address_of(key: &VerifyingKey) -> Result<Address> {
    let point = key.to_encoded_point(false);
    let bytes = point.as_bytes();
    if bytes.len() != 65 || bytes[0] != 0x04 {
        return Err(Error::KeyDerivation(
            "unexpected public key encoding".to_string(),
        ));
    }
    let digest = keccak256(&bytes[1..]);
    Ok(Address::from_slice(&digest[12..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn secret(raw: &str) -> SecretKey {
        SecretKey::parse(raw).unwrap()
    }

    #[test]
    fn test_known_address_derivation() {
        let signer = LocalSigner::from_secret(&secret(
            "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318",
        ))
        .unwrap();
        assert_eq!(
            signer.address(),
            Address::from_str("0x2c7536E3605D9C16a7a3D7b1898e529396a65c23").unwrap()
        );
    }

    #[test]
    fn test_scalar_one() {
        let one = format!("{:064x}", 1);
        let signer = LocalSigner::from_secret(&secret(&one)).unwrap();
        assert_eq!(
            signer.address(),
            Address::from_str("0x7E5F4552091A69125d5DfCb7b8C2659029395Bdf").unwrap()
        );
    }

    #[test]
    fn test_zero_secret_fails_derivation() {
        let zero = "0".repeat(64);
        let err = LocalSigner::from_secret(&secret(&zero)).unwrap_err();
        assert!(matches!(err, Error::KeyDerivation(_)));
    }

    #[test]
    fn test_secret_above_curve_order_fails() {
        let err = LocalSigner::from_secret(&secret(&"f".repeat(64))).unwrap_err();
        assert!(matches!(err, Error::KeyDerivation(_)));
    }

    #[test]
    fn test_signature_recovers_to_signer() {
        let signer = LocalSigner::from_secret(&secret(&"11".repeat(32))).unwrap();
        let digest = keccak256(b"rescue");
        let sig = signer.sign_prehash(&digest).unwrap();
        assert!(sig.y_parity <= 1);

        let mut compact = [0u8; 64];
        compact[..32].copy_from_slice(&sig.r.to_be_bytes::<32>());
        compact[32..].copy_from_slice(&sig.s.to_be_bytes::<32>());
        let signature = Signature::from_slice(&compact).unwrap();
        let recovered = VerifyingKey::recover_from_prehash(
            digest.as_slice(),
            &signature,
            RecoveryId::from_byte(sig.y_parity).unwrap(),
        )
        .unwrap();
        assert_eq!(address_of(&recovered).unwrap(), signer.address());
    }

    #[test]
    fn test_debug_hides_secret() {
        let raw = "22".repeat(32);
        let signer = LocalSigner::from_secret(&secret(&raw)).unwrap();
        let shown = format!("{:?}", signer);
        assert!(!shown.contains(&raw));
        assert!(shown.contains("address"));
    }
}
