//! reqwest-backed implementation of the relay boundary.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use gaslane_types::{relay_flags, ErrorCode, GaslaneError, Hex, Result};

use crate::{
    classify_relay_flag, DappInfo, LoginRequest, LoginResponse, MetaApi, RelayApi, RelayRequest,
    SmartContract, WithdrawRequest, WithdrawResponse,
};

const DEFAULT_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SmartContractsBody {
    flag: Option<i64>,
    smart_contracts: Option<Vec<SmartContract>>,
    log: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MetaApisBody {
    list_apis: Option<Vec<MetaApi>>,
    log: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NonceBody {
    flag: Option<i64>,
    nonce: Option<u64>,
    log: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserContractBody {
    flag: Option<i64>,
    user_contract: Option<Hex>,
    log: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendTxBody {
    flag: Option<i64>,
    tx_hash: Option<Hex>,
    log: Option<String>,
}

/// HTTP client for the relay dashboard API.
///
/// Every request carries the dapp API key in `x-api-key`. Transport failures
/// and non-2xx statuses surface as [`GaslaneError::Transport`].
pub struct HttpRelayClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpRelayClient {
    pub fn new(base_url: &str, api_key: &str) -> Self {
        Self::with_timeout(base_url, api_key, Duration::from_millis(DEFAULT_TIMEOUT_MS))
    }

    pub fn with_timeout(base_url: &str, api_key: &str, timeout: Duration) -> Self {
        let mut headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(api_key) {
            headers.insert("x-api-key", value);
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .unwrap_or_default();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl RelayApi for HttpRelayClient {
    async fn get_dapp(&self, dapp_id: &str) -> Result<DappInfo> {
        let url = self.url("/api/v1/dapp");
        let body: Value = self
            .client
            .get(&url)
            .query(&[("dappId", dapp_id)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let dapp = body.get("dapp").filter(|d| !d.is_null()).ok_or_else(|| {
            let message = body
                .get("log")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("no dapp registered with id {}", dapp_id));
            GaslaneError::coded(ErrorCode::DappNotFound, message)
        })?;

        // networkId arrives as a string or a number depending on dashboard
        // version; normalize to a decimal string either way
        let network_id = match dapp.get("networkId") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => {
                return Err(GaslaneError::coded(
                    ErrorCode::NetworkIdNotFound,
                    format!("dapp {} has no network id on the dashboard", dapp_id),
                ))
            }
        };
        Ok(DappInfo { network_id })
    }

    async fn list_smart_contracts(&self, dapp_id: &str) -> Result<Vec<SmartContract>> {
        let url = self.url("/api/v1/smart-contract");
        let body: SmartContractsBody = self
            .client
            .get(&url)
            .query(&[("dappId", dapp_id)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        classify_relay_flag(body.flag, body.log.as_deref())?;
        body.smart_contracts.ok_or_else(|| {
            GaslaneError::coded(
                ErrorCode::SmartContractNotFound,
                "error while fetching registered smart contracts",
            )
        })
    }

    async fn list_meta_apis(&self, dapp_id: &str) -> Result<Vec<MetaApi>> {
        let url = self.url("/api/v1/meta-api");
        let body: MetaApisBody = self
            .client
            .get(&url)
            .query(&[("dappId", dapp_id)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        body.list_apis.ok_or_else(|| {
            GaslaneError::coded(
                ErrorCode::ErrorResponse,
                body.log
                    .unwrap_or_else(|| "error while fetching registered apis".into()),
            )
        })
    }

    async fn get_user_nonce(&self, signer: &str) -> Result<Option<u64>> {
        let url = self.url("/api/v1/dapp-user/getNonce");
        let response = self
            .client
            .get(&url)
            .query(&[("signer", signer)])
            .send()
            .await?;

        // an unknown signer is not an error: callers start from nonce 0
        if response.status() == StatusCode::NOT_FOUND {
            debug!(signer, "signer unknown to relay, no login nonce");
            return Ok(None);
        }
        let body: NonceBody = response.error_for_status()?.json().await?;
        classify_relay_flag(body.flag, body.log.as_deref())?;
        Ok(body.nonce)
    }

    async fn get_contract_nonce(&self, signer: &str) -> Result<u64> {
        let url = self.url("/api/v1/dapp-user/getContractNonce");
        let body: NonceBody = self
            .client
            .get(&url)
            .query(&[("signer", signer)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        classify_relay_flag(body.flag, body.log.as_deref())?;
        body.nonce.ok_or_else(|| {
            GaslaneError::coded(
                ErrorCode::UserAccountNotFound,
                format!("no contract nonce for signer {}", signer),
            )
        })
    }

    async fn get_user_contract(&self, owner: &str, network_id: &str) -> Result<Hex> {
        let url = self.url("/api/v1/dapp-user/getUserContract");
        let body: UserContractBody = self
            .client
            .get(&url)
            .query(&[("owner", owner), ("networkId", network_id)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if body.flag != Some(relay_flags::SUCCESS) {
            return Err(GaslaneError::coded(
                ErrorCode::UserContractNotFound,
                body.log
                    .unwrap_or_else(|| format!("no user contract for owner {}", owner)),
            ));
        }
        body.user_contract.ok_or_else(|| {
            GaslaneError::coded(
                ErrorCode::UserContractNotFound,
                format!("no user contract for owner {}", owner),
            )
        })
    }

    async fn login(&self, request: &LoginRequest) -> Result<LoginResponse> {
        let url = self.url("/api/v1/dapp-user/login");
        let body: LoginResponse = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(body)
    }

    async fn send_signed_tx(&self, api_url: &str, request: &RelayRequest) -> Result<Hex> {
        let url = self.url(api_url);
        debug!(url = %url, "submitting meta-transaction");
        let body: SendTxBody = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        classify_relay_flag(body.flag, body.log.as_deref())?;
        body.tx_hash.ok_or_else(|| {
            GaslaneError::coded(
                ErrorCode::ErrorResponse,
                format!("relay api {} returned no transaction hash", api_url),
            )
        })
    }

    async fn withdraw_funds(&self, request: &WithdrawRequest) -> Result<WithdrawResponse> {
        let url = self.url("/api/v1/dapp-user/withdrawFunds");
        let body: WithdrawResponse = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        classify_relay_flag(body.flag, body.log.as_deref())?;
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_trailing_slash_is_trimmed() {
        let client = HttpRelayClient::new("https://relay.example.com/", "key");
        assert_eq!(
            client.url("/api/v1/dapp"),
            "https://relay.example.com/api/v1/dapp"
        );
    }

    #[test]
    fn test_nonce_body_tolerates_missing_fields() {
        let body: NonceBody = serde_json::from_str(r#"{"nonce": 12}"#).unwrap();
        assert_eq!(body.nonce, Some(12));
        assert_eq!(body.flag, None);

        let body: NonceBody = serde_json::from_str(r#"{"flag": 200, "log": "ok"}"#).unwrap();
        assert_eq!(body.nonce, None);
    }
}
