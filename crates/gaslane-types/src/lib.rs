//! Shared vocabulary for the Gaslane SDK: error taxonomy, JSON-RPC shapes,
//! the wallet provider boundary, and the per-instance event bus.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// 0x-prefixed hex string (e.g. "0x1234...").
pub type Hex = String;

/// JSON-RPC protocol version sent on every wallet round trip.
pub const JSON_RPC_VERSION: &str = "2.0";

/// Payload id used for SDK-internal wallet calls that have no caller id.
pub const DEFAULT_PAYLOAD_ID: &str = "99999999";

/// Relay application flags returned in response bodies.
pub mod relay_flags {
    pub const SUCCESS: i64 = 200;
    pub const ACTION_COMPLETE: i64 = 143;
    pub const USER_CONTRACT_NOT_FOUND: i64 = 148;
}

/// Fixed enumerated response codes surfaced to callers and event listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    Success,
    ErrorResponse,
    ApiNotFound,
    UserContractNotFound,
    UserNotLoggedIn,
    UserAccountNotFound,
    NetworkIdMismatch,
    NotInitialized,
    NetworkIdNotFound,
    SmartContractNotFound,
    DappNotFound,
    InvalidPayload,
    DecoderMismatch,
    UserContractCreationFailed,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Success => "GL200",
            ErrorCode::ErrorResponse => "GL500",
            ErrorCode::ApiNotFound => "GL501",
            ErrorCode::UserContractNotFound => "GL502",
            ErrorCode::UserNotLoggedIn => "GL503",
            ErrorCode::UserAccountNotFound => "GL504",
            ErrorCode::NetworkIdMismatch => "GL505",
            ErrorCode::NotInitialized => "GL506",
            ErrorCode::NetworkIdNotFound => "GL507",
            ErrorCode::SmartContractNotFound => "GL508",
            ErrorCode::DappNotFound => "GL509",
            ErrorCode::InvalidPayload => "GL510",
            ErrorCode::DecoderMismatch => "GL511",
            ErrorCode::UserContractCreationFailed => "GL512",
        }
    }
}

/// Gaslane SDK error types.
#[derive(Debug, Error)]
pub enum GaslaneError {
    /// A classified failure with a fixed code, surfaced to callers and
    /// (for resolution failures) broadcast on the event bus.
    #[error("{message}")]
    Response { code: ErrorCode, message: String },

    /// A relay application flag outside the recognized set; the original
    /// flag passes through as the error code.
    #[error("relay flag {flag}: {message}")]
    RelayFlag { flag: i64, message: String },

    /// JSON-RPC error object returned by the wrapped wallet provider.
    #[error("wallet rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// Transport failure talking to the relay; propagated unchanged.
    #[error(transparent)]
    Transport(#[from] reqwest::Error),

    #[error("invalid hex string: {0}")]
    InvalidHex(String),

    #[error("{0}")]
    Other(String),
}

impl GaslaneError {
    pub fn coded(code: ErrorCode, message: impl Into<String>) -> Self {
        GaslaneError::Response { code, message: message.into() }
    }

    /// The fixed code for classified errors, if any.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            GaslaneError::Response { code, .. } => Some(*code),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, GaslaneError>;

/// A JSON-RPC request as produced by dapp tooling and wallet providers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Vec<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: impl Into<Value>, method: &str, params: Vec<Value>) -> Self {
        Self {
            jsonrpc: JSON_RPC_VERSION.to_string(),
            id: id.into(),
            method: method.to_string(),
            params,
        }
    }

    /// Request with the SDK-internal payload id.
    pub fn internal(method: &str, params: Vec<Value>) -> Self {
        Self::new(DEFAULT_PAYLOAD_ID, method, params)
    }
}

/// JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
}

/// A JSON-RPC response, either `result` or `error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub id: Value,
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn result(id: Value, result: Value) -> Self {
        Self { id, jsonrpc: JSON_RPC_VERSION.to_string(), result: Some(result), error: None }
    }

    pub fn error(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            id,
            jsonrpc: JSON_RPC_VERSION.to_string(),
            result: None,
            error: Some(JsonRpcError { code, message: message.into() }),
        }
    }

    /// Unwrap `result`, converting a wallet error object into [`GaslaneError::Rpc`].
    pub fn into_result(self) -> Result<Value> {
        if let Some(err) = self.error {
            return Err(GaslaneError::Rpc { code: err.code, message: err.message });
        }
        self.result
            .ok_or_else(|| GaslaneError::Other("wallet response carried neither result nor error".into()))
    }
}

/// The wrapped wallet provider boundary.
///
/// Implementations forward JSON-RPC payloads to the user's wallet
/// (`eth_accounts`, `net_version`, `personal_sign`, `eth_call`, plus
/// pass-through for any other standard method).
#[async_trait]
pub trait WalletProvider: Send + Sync {
    async fn send(&self, payload: JsonRpcRequest) -> Result<JsonRpcResponse>;
}

/// Convenience calls over any [`WalletProvider`].
#[async_trait]
pub trait WalletProviderExt: WalletProvider {
    /// `eth_accounts`: the wallet's account list.
    async fn accounts(&self) -> Result<Vec<Hex>> {
        let response = self.send(JsonRpcRequest::internal("eth_accounts", vec![])).await?;
        let value = response.into_result()?;
        serde_json::from_value(value)
            .map_err(|e| GaslaneError::Other(format!("invalid eth_accounts response: {}", e)))
    }

    /// `net_version`: the wallet's live network identifier.
    async fn net_version(&self) -> Result<String> {
        let response = self.send(JsonRpcRequest::internal("net_version", vec![])).await?;
        match response.into_result()? {
            Value::String(s) => Ok(s),
            Value::Number(n) => Ok(n.to_string()),
            other => Err(GaslaneError::Other(format!("invalid net_version response: {}", other))),
        }
    }

    /// `personal_sign` over the UTF-8 message, hex-encoded on the wire.
    async fn personal_sign(&self, message: &str, signer: &str) -> Result<Hex> {
        let payload = JsonRpcRequest::internal(
            "personal_sign",
            vec![json!(utf8_to_hex(message)), json!(signer)],
        );
        let value = self.send(payload).await?.into_result()?;
        value
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| GaslaneError::Other("personal_sign returned a non-string result".into()))
    }

    /// `eth_getTransactionReceipt`: `None` while the transaction is unmined.
    async fn transaction_receipt(&self, tx_hash: &str) -> Result<Option<Value>> {
        let payload = JsonRpcRequest::internal("eth_getTransactionReceipt", vec![json!(tx_hash)]);
        match self.send(payload).await?.into_result()? {
            Value::Null => Ok(None),
            receipt => Ok(Some(receipt)),
        }
    }

    /// `eth_signTypedData_v4` over a serialized EIP-712 payload.
    async fn sign_typed_data(&self, signer: &str, typed_data: &Value) -> Result<Hex> {
        let payload = JsonRpcRequest::internal(
            "eth_signTypedData_v4",
            vec![json!(signer), json!(typed_data.to_string())],
        );
        let value = self.send(payload).await?.into_result()?;
        value
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| {
                GaslaneError::Other("eth_signTypedData_v4 returned a non-string result".into())
            })
    }
}

impl<T: WalletProvider + ?Sized> WalletProviderExt for T {}

/// Events broadcast by a client instance.
#[derive(Debug, Clone)]
pub enum SdkEvent {
    /// Initialization completed; registries are populated.
    Ready,
    /// A classified failure; carries the fixed `{code, message}` pair.
    Error { code: ErrorCode, message: String },
    /// Deferred login completed after contract-wallet deployment.
    LoginConfirmation { message: String, user_contract: Hex },
}

/// Event categories a handler can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Ready,
    Error,
    LoginConfirmation,
}

impl SdkEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            SdkEvent::Ready => EventKind::Ready,
            SdkEvent::Error { .. } => EventKind::Error,
            SdkEvent::LoginConfirmation { .. } => EventKind::LoginConfirmation,
        }
    }
}

/// Callback type for SDK events.
pub type EventHandler = Box<dyn Fn(&SdkEvent) + Send + Sync>;

/// Per-instance observer registry.
///
/// Each client owns its own bus, so multiple clients in one process never
/// observe each other's events.
#[derive(Default)]
pub struct EventBus {
    handlers: Mutex<Vec<(EventKind, Arc<EventHandler>)>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, kind: EventKind, handler: EventHandler) {
        let mut handlers = self.handlers.lock().unwrap();
        handlers.push((kind, Arc::new(handler)));
    }

    pub fn emit(&self, event: &SdkEvent) {
        // snapshot under the lock, invoke outside it: handlers may subscribe
        let matching: Vec<Arc<EventHandler>> = {
            let handlers = self.handlers.lock().unwrap();
            handlers
                .iter()
                .filter(|(kind, _)| *kind == event.kind())
                .map(|(_, handler)| Arc::clone(handler))
                .collect()
        };
        for handler in matching {
            (*handler)(event);
        }
    }

    /// Emit an error event for the given code/message pair.
    pub fn emit_error(&self, code: ErrorCode, message: impl Into<String>) {
        self.emit(&SdkEvent::Error { code, message: message.into() });
    }
}

/// Hex-encode a UTF-8 string with a 0x prefix (wire form for `personal_sign`).
pub fn utf8_to_hex(message: &str) -> Hex {
    format!("0x{}", hex::encode(message.as_bytes()))
}

/// Convert bytes to a 0x-prefixed hex string.
pub fn bytes_to_hex(bytes: &[u8]) -> Hex {
    format!("0x{}", hex::encode(bytes))
}

/// Parse a hex string (with or without 0x prefix) into bytes.
pub fn hex_to_bytes(hex_str: &str) -> Result<Vec<u8>> {
    let hex_str = hex_str.strip_prefix("0x").unwrap_or(hex_str);
    hex::decode(hex_str).map_err(|e| GaslaneError::InvalidHex(e.to_string()))
}
