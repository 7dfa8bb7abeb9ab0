//! Raw signed-transaction decoding.
//!
//! `eth_sendRawTransaction` interception needs the destination, call data,
//! value and gas fields out of the RLP blob, plus the sender recovered from
//! the transaction's own signature (native meta-transactions sign nothing
//! beyond it).

use alloy::consensus::transaction::SignerRecoverable;
use alloy::consensus::{Transaction, TxEnvelope};
use alloy::eips::eip2718::Decodable2718;
use alloy::primitives::U256;

use gaslane_types::{hex_to_bytes, ErrorCode, GaslaneError, Hex, Result};

/// Fields extracted from a raw signed transaction.
#[derive(Debug, Clone)]
pub struct DecodedTransaction {
    /// Destination address, lowercase 0x-hex. `None` for contract creation.
    pub to: Option<Hex>,
    pub data: Vec<u8>,
    pub value: U256,
    pub gas_price: u128,
    pub gas_limit: u64,
    /// Sender recovered from the transaction signature, lowercase 0x-hex.
    pub signer: Hex,
}

impl DecodedTransaction {
    pub fn value_hex(&self) -> Hex {
        format!("{:#x}", self.value)
    }
}

/// Decode a raw signed transaction (legacy or typed) and recover its sender.
pub fn decode_raw_transaction(raw: &str) -> Result<DecodedTransaction> {
    let bytes = hex_to_bytes(raw)?;
    let envelope = TxEnvelope::decode_2718(&mut bytes.as_slice()).map_err(|e| {
        GaslaneError::coded(
            ErrorCode::InvalidPayload,
            format!("failed to decode raw transaction: {}", e),
        )
    })?;

    let signer = envelope.recover_signer().map_err(|e| {
        GaslaneError::coded(
            ErrorCode::InvalidPayload,
            format!("could not recover sender from raw transaction: {}", e),
        )
    })?;

    Ok(DecodedTransaction {
        to: envelope.to().map(|a| format!("{:#x}", a)),
        data: envelope.input().to_vec(),
        value: envelope.value(),
        gas_price: envelope.gas_price().unwrap_or_default(),
        gas_limit: envelope.gas_limit(),
        signer: format!("{:#x}", signer),
    })
}
