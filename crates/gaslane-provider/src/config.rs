//! Client construction options and fixed protocol constants.

use std::time::Duration;

use gaslane_types::{ErrorCode, GaslaneError, Result};

/// Relay dashboard the client talks to unless overridden.
pub const DEFAULT_BASE_URL: &str = "https://api.gaslane.dev";

/// Default wallet provider identifier reported on login.
pub const DEFAULT_PROVIDER_ID: u64 = 100;

/// Interval between contract-deployment receipt polls.
pub const RECEIPT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Prefix of the per-transaction message signed on the user path. The
/// signer's contract-wallet nonce is appended before signing.
pub const MESSAGE_TO_SIGN_PREFIX: &str =
    "Sign message to prove the ownership of your account with counter ";

/// Prefix of the login message. The signer's login nonce is appended.
pub const LOGIN_MESSAGE_PREFIX: &str = "Sign message to login with counter ";

/// Prefix of the withdraw authorization message.
pub const WITHDRAW_MESSAGE_PREFIX: &str = "Sign message to withdraw funds with counter ";

/// Options for building a [`MetaTxProvider`](crate::MetaTxProvider).
///
/// `dapp_id` and `api_key` come from the relay dashboard and are mandatory;
/// everything else has a sensible default.
#[derive(Debug, Clone)]
pub struct ProviderOptions {
    pub dapp_id: String,
    pub api_key: String,
    /// In strict mode a registered contract method without a relay API is a
    /// hard error; otherwise the call falls through to the wallet.
    pub strict_mode: bool,
    /// Wallet provider identifier reported to the relay on login.
    pub provider_id: u64,
    /// Rewrite `eth_call` to read state as the user's contract wallet.
    pub read_via_contract: bool,
    pub base_url: Option<String>,
    pub message_to_sign_prefix: Option<String>,
    pub login_message_prefix: Option<String>,
    pub withdraw_message_prefix: Option<String>,
}

impl ProviderOptions {
    pub fn new(dapp_id: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            dapp_id: dapp_id.into(),
            api_key: api_key.into(),
            strict_mode: false,
            provider_id: DEFAULT_PROVIDER_ID,
            read_via_contract: false,
            base_url: None,
            message_to_sign_prefix: None,
            login_message_prefix: None,
            withdraw_message_prefix: None,
        }
    }

    /// Reject unusable options before any network work starts.
    pub fn validate(&self) -> Result<()> {
        if self.dapp_id.is_empty() || self.api_key.is_empty() {
            return Err(GaslaneError::coded(
                ErrorCode::InvalidPayload,
                "options with a dapp id and an api key are required",
            ));
        }
        Ok(())
    }

    pub fn base_url(&self) -> &str {
        self.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL)
    }

    pub fn message_to_sign_prefix(&self) -> &str {
        self.message_to_sign_prefix
            .as_deref()
            .unwrap_or(MESSAGE_TO_SIGN_PREFIX)
    }

    pub fn login_message_prefix(&self) -> &str {
        self.login_message_prefix
            .as_deref()
            .unwrap_or(LOGIN_MESSAGE_PREFIX)
    }

    pub fn withdraw_message_prefix(&self) -> &str {
        self.withdraw_message_prefix
            .as_deref()
            .unwrap_or(WITHDRAW_MESSAGE_PREFIX)
    }
}
