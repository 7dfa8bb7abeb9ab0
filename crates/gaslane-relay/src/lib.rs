//! Relay dashboard HTTP boundary.
//!
//! Endpoints:
//! - GET  /api/v1/dapp?dappId=
//! - GET  /api/v1/smart-contract?dappId=
//! - GET  /api/v1/meta-api?dappId=
//! - GET  /api/v1/dapp-user/getNonce?signer=
//! - GET  /api/v1/dapp-user/getContractNonce?signer=
//! - GET  /api/v1/dapp-user/getUserContract?owner=&networkId=
//! - POST /api/v1/dapp-user/login
//! - POST /api/v1/meta-tx/sendSignedTx
//! - POST /api/v1/dapp-user/withdrawFunds
//!
//! All requests carry the `x-api-key` header. No retry is performed at this
//! layer; callers needing retry must resubmit.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use gaslane_types::{relay_flags, ErrorCode, GaslaneError, Hex, Result};

pub mod http_client;

pub use http_client::HttpRelayClient;

/// Relay submission path for ordinary user meta-transactions.
pub const SEND_SIGNED_TX_PATH: &str = "/api/v1/meta-tx/sendSignedTx";

/// The distinguished native-meta-transaction endpoint. An API registered
/// under this URL bypasses the login requirement and adds no signature
/// beyond the raw transaction's own.
pub const NATIVE_META_TX_PATH: &str = "/api/v1/meta-tx/native";

/// A registered relay API endpoint descriptor, keyed by decoded method name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaApi {
    pub method: String,
    pub url: String,
    pub id: String,
}

/// A contract registered on the relay dashboard, with its ABI JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmartContract {
    pub address: String,
    pub abi: String,
}

/// Dapp metadata from the relay dashboard.
#[derive(Debug, Clone)]
pub struct DappInfo {
    pub network_id: String,
}

/// Login request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub signature: Hex,
    pub signer: Hex,
    pub message: String,
    pub provider: u64,
}

/// Raw login response; the session layer interprets the flag.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub flag: Option<i64>,
    pub user_contract: Option<Hex>,
    pub transaction_hash: Option<Hex>,
    pub log: Option<String>,
}

/// Withdraw request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawRequest {
    pub signer: Hex,
    pub message: String,
    pub message_length: usize,
    pub signature: Hex,
    pub amount: String,
    pub receiver: Hex,
}

/// Withdraw response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawResponse {
    pub flag: Option<i64>,
    pub tx_hash: Option<Hex>,
    pub log: Option<String>,
}

/// Native meta-transaction body: the sender is recovered from the raw
/// transaction's own signature, so nothing else is signed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NativeMetaTx {
    pub user_address: Hex,
    pub api_id: String,
    pub params: Vec<Value>,
    pub gas_limit: String,
    pub gas_price: String,
}

/// User meta-transaction body: carries a fresh session-message signature
/// alongside the decoded parameters and gas fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserMetaTx {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_tx: Option<Hex>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Hex>,
    pub signature: Hex,
    pub message: String,
    pub message_length: usize,
    pub signer: Hex,
    pub api_id: String,
    pub dapp_id: String,
    pub params: Vec<Value>,
    pub value: String,
    pub gas_limit: String,
    pub gas_price: String,
}

/// Request body posted to the relay submission endpoint.
///
/// Constructed fresh per transaction; never persisted.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum RelayRequest {
    Native(NativeMetaTx),
    User(Box<UserMetaTx>),
}

/// Classify a relay application flag.
///
/// Flags other than the two success values are application errors: the
/// response log becomes the error message, "user contract not found" (148)
/// is remapped to the local code, and any other flag passes through with its
/// original value.
pub fn classify_relay_flag(flag: Option<i64>, log: Option<&str>) -> Result<()> {
    match flag {
        Some(f) if f != relay_flags::ACTION_COMPLETE && f != relay_flags::SUCCESS => {
            let message = log.unwrap_or("relay rejected the request").to_string();
            if f == relay_flags::USER_CONTRACT_NOT_FOUND {
                Err(GaslaneError::coded(ErrorCode::UserContractNotFound, message))
            } else {
                Err(GaslaneError::RelayFlag { flag: f, message })
            }
        }
        _ => Ok(()),
    }
}

/// The relay HTTP boundary as consumed by the session and provider layers.
///
/// Abstracted behind a trait so tests can substitute a mock relay.
#[async_trait]
pub trait RelayApi: Send + Sync {
    async fn get_dapp(&self, dapp_id: &str) -> Result<DappInfo>;
    async fn list_smart_contracts(&self, dapp_id: &str) -> Result<Vec<SmartContract>>;
    async fn list_meta_apis(&self, dapp_id: &str) -> Result<Vec<MetaApi>>;
    /// Login nonce; `None` when the relay has never seen the signer (404).
    async fn get_user_nonce(&self, signer: &str) -> Result<Option<u64>>;
    async fn get_contract_nonce(&self, signer: &str) -> Result<u64>;
    async fn get_user_contract(&self, owner: &str, network_id: &str) -> Result<Hex>;
    async fn login(&self, request: &LoginRequest) -> Result<LoginResponse>;
    /// Submit a meta-transaction; resolves to the transaction hash.
    async fn send_signed_tx(&self, api_url: &str, request: &RelayRequest) -> Result<Hex>;
    async fn withdraw_funds(&self, request: &WithdrawRequest) -> Result<WithdrawResponse>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_success_flags_are_not_errors() {
        assert!(classify_relay_flag(Some(relay_flags::SUCCESS), None).is_ok());
        assert!(classify_relay_flag(Some(relay_flags::ACTION_COMPLETE), None).is_ok());
        assert!(classify_relay_flag(None, Some("no flag at all")).is_ok());
    }

    #[test]
    fn test_user_contract_not_found_is_remapped() {
        let err = classify_relay_flag(Some(148), Some("no wallet deployed")).unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::UserContractNotFound));
        assert_eq!(err.to_string(), "no wallet deployed");
    }

    #[test]
    fn test_other_flags_pass_through_with_original_code() {
        let err = classify_relay_flag(Some(417), Some("gas estimation failed")).unwrap_err();
        match err {
            GaslaneError::RelayFlag { flag, message } => {
                assert_eq!(flag, 417);
                assert_eq!(message, "gas estimation failed");
            }
            other => panic!("expected relay flag error, got {:?}", other),
        }
    }

    #[test]
    fn test_login_response_deserializes_camel_case() {
        let body: LoginResponse = serde_json::from_value(json!({
            "flag": 143,
            "userContract": "0xabc",
            "log": "ok"
        }))
        .unwrap();
        assert_eq!(body.flag, Some(143));
        assert_eq!(body.user_contract.as_deref(), Some("0xabc"));
        assert_eq!(body.transaction_hash, None);
    }

    #[test]
    fn test_relay_request_wire_shape() {
        let native = RelayRequest::Native(NativeMetaTx {
            user_address: "0xaa".into(),
            api_id: "api-1".into(),
            params: vec![json!(7)],
            gas_limit: "100000".into(),
            gas_price: "1000000000".into(),
        });
        let wire = serde_json::to_value(&native).unwrap();
        assert_eq!(wire["userAddress"], json!("0xaa"));
        assert!(wire.get("signature").is_none());

        let user = RelayRequest::User(Box::new(UserMetaTx {
            raw_tx: None,
            data: None,
            signature: "0xsig".into(),
            message: "prefix ".into(),
            message_length: 8,
            signer: "0xaa".into(),
            api_id: "api-1".into(),
            dapp_id: "dapp-1".into(),
            params: vec![],
            value: "0x0".into(),
            gas_limit: "100000".into(),
            gas_price: "1000000000".into(),
        }));
        let wire = serde_json::to_value(&user).unwrap();
        assert_eq!(wire["messageLength"], json!(8));
        assert_eq!(wire["dappId"], json!("dapp-1"));
        // optional fields stay off the wire when unset
        assert!(wire.get("rawTx").is_none());
        assert!(wire.get("data").is_none());
    }
}
