//! ABI method decoding for registered contracts.
//!
//! A `MethodDecoder` is built from one contract's ABI and maps raw call data
//! to a method name plus typed parameters. The `DecoderRegistry` keys one
//! decoder per lowercase contract address; it is populated once during client
//! initialization from the relay's registered-contract list and never updated
//! incrementally.

use std::collections::HashMap;

use alloy::dyn_abi::{DynSolValue, JsonAbiExt};
use alloy::json_abi::{Function, JsonAbi};
use alloy::primitives::Selector;
use serde_json::{json, Value};

use gaslane_types::{bytes_to_hex, GaslaneError, Result};

pub mod rawtx;

pub use rawtx::{decode_raw_transaction, DecodedTransaction};

/// One decoded call parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedParam {
    pub name: String,
    /// Solidity type as declared in the ABI (e.g. "uint256", "address").
    pub kind: String,
    /// Coerced JSON value; see [`coerce_param_value`].
    pub value: Value,
}

/// Result of decoding a function call. Derived per call, never stored.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedMethod {
    pub name: String,
    pub params: Vec<DecodedParam>,
}

/// Decoder for a single contract, built from its ABI.
pub struct MethodDecoder {
    functions: HashMap<Selector, Function>,
}

impl MethodDecoder {
    /// Build a decoder from an ABI JSON string (the form the relay serves).
    pub fn from_abi_json(abi_json: &str) -> Result<Self> {
        let abi: JsonAbi = serde_json::from_str(abi_json)
            .map_err(|e| GaslaneError::Other(format!("failed to parse contract abi: {}", e)))?;
        Ok(Self::from_abi(abi))
    }

    pub fn from_abi(abi: JsonAbi) -> Self {
        let functions = abi
            .functions()
            .map(|f| (f.selector(), f.clone()))
            .collect();
        Self { functions }
    }

    /// Decode call data (including the 4-byte selector) into a method name
    /// and its typed parameters.
    pub fn decode_call(&self, data: &[u8]) -> Result<DecodedMethod> {
        if data.len() < 4 {
            return Err(GaslaneError::Other(
                "call data shorter than a function selector".into(),
            ));
        }
        let selector = Selector::from_slice(&data[..4]);
        let function = self.functions.get(&selector).ok_or_else(|| {
            GaslaneError::Other(format!(
                "no function with selector {} registered in contract abi",
                selector
            ))
        })?;

        let values = function
            .abi_decode_input(&data[4..])
            .map_err(|e| GaslaneError::Other(format!("failed to decode call data: {}", e)))?;

        let params = function
            .inputs
            .iter()
            .zip(values.iter())
            .map(|(input, value)| DecodedParam {
                name: input.name.clone(),
                kind: input.ty.clone(),
                value: coerce_param_value(value),
            })
            .collect();

        Ok(DecodedMethod { name: function.name.clone(), params })
    }
}

/// Coerce a decoded Solidity value for the relay request body.
///
/// Numeric types become JSON integers when they fit, decimal strings
/// otherwise; strings stay strings; everything else passes through in its
/// natural JSON form (addresses and bytes as 0x-hex, composites recursed).
pub fn coerce_param_value(value: &DynSolValue) -> Value {
    match value {
        DynSolValue::Uint(u, _) => match u64::try_from(*u) {
            Ok(n) => json!(n),
            Err(_) => json!(u.to_string()),
        },
        DynSolValue::Int(i, _) => match i64::try_from(*i) {
            Ok(n) => json!(n),
            Err(_) => json!(i.to_string()),
        },
        DynSolValue::String(s) => json!(s),
        DynSolValue::Bool(b) => json!(b),
        DynSolValue::Address(a) => json!(format!("{:#x}", a)),
        DynSolValue::Bytes(b) => json!(bytes_to_hex(b)),
        DynSolValue::FixedBytes(word, size) => json!(bytes_to_hex(&word[..*size])),
        DynSolValue::Array(items) | DynSolValue::FixedArray(items) | DynSolValue::Tuple(items) => {
            Value::Array(items.iter().map(coerce_param_value).collect())
        }
        other => json!(format!("{:?}", other)),
    }
}

/// Lowercase contract address → ABI decoder.
///
/// Populated once during initialization; replaced wholesale on re-fetch.
#[derive(Default)]
pub struct DecoderRegistry {
    decoders: HashMap<String, MethodDecoder>,
}

impl DecoderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, address: &str, decoder: MethodDecoder) {
        self.decoders.insert(address.to_lowercase(), decoder);
    }

    /// Register a contract from its ABI JSON string.
    pub fn insert_abi(&mut self, address: &str, abi_json: &str) -> Result<()> {
        let decoder = MethodDecoder::from_abi_json(abi_json)?;
        self.insert(address, decoder);
        Ok(())
    }

    pub fn get(&self, address: &str) -> Option<&MethodDecoder> {
        self.decoders.get(&address.to_lowercase())
    }

    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }

    pub fn len(&self) -> usize {
        self.decoders.len()
    }
}
