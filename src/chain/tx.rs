//! EIP-1559 transaction encoding
//!
//! Typed transaction `0x02 || rlp([chain_id, nonce, max_priority_fee,
//! max_fee, gas_limit, to, value, data, access_list, y_parity, r, s])`.
//! The access list is always empty.

use alloy_primitives::{keccak256, Address, Bytes, B256, U256};
use alloy_rlp::{length_of_length, BufMut, Encodable, Header};

use super::signer::RecoverableSignature;

const EIP1559_TYPE: u8 = 0x02;

/// RLP length of an empty list
const EMPTY_LIST_LEN: usize = 1;

/// Unsigned EIP-1559 call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eip1559Tx {
    pub chain_id: u64,
    pub nonce: u64,
    pub max_priority_fee_per_gas: U256,
    pub max_fee_per_gas: U256,
    pub gas_limit: u64,
    pub to: Address,
    pub value: U256,
    pub data: Bytes,
}

impl Eip1559Tx {
    fn fields_length(&self) -> usize {
        self.chain_id.length()
            + self.nonce.length()
            + self.max_priority_fee_per_gas.length()
            + self.max_fee_per_gas.length()
            + self.gas_limit.length()
            + self.to.length()
            + self.value.length()
            + self.data.length()
            + EMPTY_LIST_LEN
    }

    fn encode_fields(&self, out: &mut dyn BufMut) {
        self.chain_id.encode(out);
        self.nonce.encode(out);
        self.max_priority_fee_per_gas.encode(out);
        self.max_fee_per_gas.encode(out);
        self.gas_limit.encode(out);
        self.to.encode(out);
        self.value.encode(out);
        self.data.encode(out);
        Header {
            list: true,
            payload_length: 0,
        }
        .encode(out);
    }

    /// Digest the signer commits to
    pub fn signing_hash(&self) -> B256 {
        keccak256(self.encode_unsigned())
    }

    /// Typed envelope without signature
    pub fn encode_unsigned(&self) -> Vec<u8> {
        let payload_length = self.fields_length();
        let mut out = Vec::with_capacity(1 + payload_length + length_of_length(payload_length));
        out.push(EIP1559_TYPE);
        Header {
            list: true,
            payload_length,
        }
        .encode(&mut out);
        self.encode_fields(&mut out);
        out
    }

    /// Typed envelope with signature, ready for `eth_sendRawTransaction`
    pub fn encode_signed(&self, signature: &RecoverableSignature) -> Vec<u8> {
        let payload_length = self.fields_length()
            + signature.y_parity.length()
            + signature.r.length()
            + signature.s.length();
        let mut out = Vec::with_capacity(1 + payload_length + length_of_length(payload_length));
        out.push(EIP1559_TYPE);
        Header {
            list: true,
            payload_length,
        }
        .encode(&mut out);
        self.encode_fields(&mut out);
        signature.y_parity.encode(&mut out);
        signature.r.encode(&mut out);
        signature.s.encode(&mut out);
        out
    }
}

/// Hash of a signed envelope, the identifier nodes report
pub fn transaction_hash(raw: &[u8]) -> B256 {
    keccak256(raw)
}
