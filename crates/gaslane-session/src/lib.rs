//! User session lifecycle: login, logout, persistence and restoration.
//!
//! A session binds a wallet signer to its deployed contract wallet. Logging
//! in signs a nonce-bearing message and posts it to the relay; when the relay
//! has to deploy a contract wallet first, a background task polls for the
//! deployment receipt and completes the login once it lands.

use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use gaslane_relay::{LoginRequest, RelayApi};
use gaslane_store::StorageAdapter;
use gaslane_types::{
    relay_flags, ErrorCode, EventBus, GaslaneError, Hex, Result, SdkEvent, WalletProviderExt,
    WalletProvider,
};

/// Storage key for the logged-in signer address.
pub const USER_ACCOUNT_KEY: &str = "GL_USER_ACCOUNT";
/// Storage key for the signer's contract wallet address.
pub const USER_CONTRACT_KEY: &str = "GL_USER_CONTRACT";

/// Session tunables, fixed at construction.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Wallet provider identifier reported to the relay on login.
    pub provider_id: u64,
    /// Prefix of the login message; the user's login nonce is appended.
    pub login_message_prefix: String,
    /// Interval between deployment-receipt polls.
    pub receipt_poll_interval: Duration,
}

#[derive(Debug, Clone, Default)]
struct SessionState {
    is_login: bool,
    signer: Option<Hex>,
    user_contract: Option<Hex>,
}

/// Outcome of a login call.
#[derive(Debug, Clone)]
pub struct LoginOutcome {
    pub code: ErrorCode,
    pub message: String,
    /// Present when the contract wallet already existed.
    pub user_contract: Option<Hex>,
    /// Present when a contract wallet deployment was started; the login
    /// completes in the background and fires a login-confirmation event.
    pub transaction_hash: Option<Hex>,
}

/// Owns the login state for one client instance.
///
/// Login calls are serialized through an async mutex: two concurrent logins
/// never interleave their sign/post steps. At most one receipt-poll task is
/// alive at a time; starting a new one aborts the previous.
pub struct SessionManager {
    relay: Arc<dyn RelayApi>,
    wallet: Arc<dyn WalletProvider>,
    store: Arc<dyn StorageAdapter>,
    events: Arc<EventBus>,
    config: SessionConfig,
    state: Arc<RwLock<SessionState>>,
    login_gate: AsyncMutex<()>,
    poll_task: Mutex<Option<JoinHandle<()>>>,
}

impl SessionManager {
    pub fn new(
        relay: Arc<dyn RelayApi>,
        wallet: Arc<dyn WalletProvider>,
        store: Arc<dyn StorageAdapter>,
        events: Arc<EventBus>,
        config: SessionConfig,
    ) -> Self {
        Self {
            relay,
            wallet,
            store,
            events,
            config,
            state: Arc::new(RwLock::new(SessionState::default())),
            login_gate: AsyncMutex::new(()),
            poll_task: Mutex::new(None),
        }
    }

    pub fn is_logged_in(&self) -> bool {
        self.state.read().unwrap().is_login
    }

    pub fn signer(&self) -> Option<Hex> {
        self.state.read().unwrap().signer.clone()
    }

    pub fn cached_user_contract(&self) -> Option<Hex> {
        self.state.read().unwrap().user_contract.clone()
    }

    /// The exact message `login` will ask the wallet to sign for `signer`:
    /// the configured prefix followed by the signer's current login nonce
    /// (0 for a signer the relay has never seen).
    pub async fn login_message(&self, signer: &str) -> Result<String> {
        let nonce = self.relay.get_user_nonce(signer).await?.unwrap_or(0);
        Ok(format!("{}{}", self.config.login_message_prefix, nonce))
    }

    /// Sign the login message with the wallet and establish a session.
    pub async fn login(&self, signer: &str) -> Result<LoginOutcome> {
        let _gate = self.login_gate.lock().await;
        let message = self.login_message(signer).await?;
        let signature = self.wallet.personal_sign(&message, signer).await?;
        self.complete_login(signer, &signature).await
    }

    /// Establish a session from a signature produced out of band (the caller
    /// already signed the current login message).
    pub async fn account_login(&self, signer: &str, signature: &str) -> Result<LoginOutcome> {
        let _gate = self.login_gate.lock().await;
        self.complete_login(signer, signature).await
    }

    async fn complete_login(&self, signer: &str, signature: &str) -> Result<LoginOutcome> {
        let signer = signer.to_lowercase();
        let request = LoginRequest {
            signature: signature.to_string(),
            signer: signer.clone(),
            // the relay reconstructs the nonce server-side from the prefix
            message: self.config.login_message_prefix.clone(),
            provider: self.config.provider_id,
        };
        let response = self.relay.login(&request).await?;

        if response.flag != Some(relay_flags::ACTION_COMPLETE) {
            let message = response
                .log
                .unwrap_or_else(|| "login rejected by relay".into());
            return Err(match response.flag {
                Some(flag) => GaslaneError::RelayFlag { flag, message },
                None => GaslaneError::coded(ErrorCode::ErrorResponse, message),
            });
        }

        if let Some(user_contract) = response.user_contract {
            self.persist(&signer, &user_contract).await?;
            debug!(signer = %signer, contract = %user_contract, "login complete");
            return Ok(LoginOutcome {
                code: ErrorCode::Success,
                message: "login successful".into(),
                user_contract: Some(user_contract),
                transaction_hash: None,
            });
        }

        if let Some(tx_hash) = response.transaction_hash {
            self.start_receipt_poll(&signer, &tx_hash);
            return Ok(LoginOutcome {
                code: ErrorCode::Success,
                message: "contract wallet deployment in progress".into(),
                user_contract: None,
                transaction_hash: Some(tx_hash),
            });
        }

        Err(GaslaneError::coded(
            ErrorCode::ErrorResponse,
            "login response carried neither a user contract nor a deployment hash",
        ))
    }

    /// Poll for the contract-deployment receipt in the background. When the
    /// deployment succeeds the session is persisted and a login-confirmation
    /// event fires; on a reverted deployment an error event fires instead.
    fn start_receipt_poll(&self, signer: &str, tx_hash: &str) {
        let wallet = Arc::clone(&self.wallet);
        let relay = Arc::clone(&self.relay);
        let store = Arc::clone(&self.store);
        let events = Arc::clone(&self.events);
        let state = Arc::clone(&self.state);
        let signer = signer.to_string();
        let tx_hash = tx_hash.to_string();
        let interval = self.config.receipt_poll_interval;

        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let receipt = match wallet.transaction_receipt(&tx_hash).await {
                    Ok(Some(receipt)) => receipt,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!(tx_hash = %tx_hash, error = %e, "receipt poll failed, retrying");
                        continue;
                    }
                };

                if receipt_succeeded(&receipt) {
                    let deferred = async {
                        let network_id = wallet.net_version().await?;
                        let user_contract = relay.get_user_contract(&signer, &network_id).await?;
                        persist_session(&store, &state, &signer, &user_contract).await?;
                        Ok::<Hex, GaslaneError>(user_contract)
                    };
                    match deferred.await {
                        Ok(user_contract) => {
                            events.emit(&SdkEvent::LoginConfirmation {
                                message: "login successful".into(),
                                user_contract,
                            });
                        }
                        Err(e) => {
                            events.emit_error(
                                e.code().unwrap_or(ErrorCode::UserContractNotFound),
                                e.to_string(),
                            );
                        }
                    }
                } else {
                    events.emit_error(
                        ErrorCode::UserContractCreationFailed,
                        format!("contract wallet deployment {} reverted", tx_hash),
                    );
                }
                break;
            }
        });

        let mut slot = self.poll_task.lock().unwrap();
        if let Some(stale) = slot.replace(handle) {
            stale.abort();
        }
    }

    async fn persist(&self, signer: &str, user_contract: &str) -> Result<()> {
        persist_session(&self.store, &self.state, signer, user_contract).await
    }

    /// Drop the session. Idempotent; also cancels any pending deployment poll.
    pub async fn logout(&self) -> Result<()> {
        if let Some(task) = self.poll_task.lock().unwrap().take() {
            task.abort();
        }
        self.store.remove(USER_ACCOUNT_KEY).await?;
        self.store.remove(USER_CONTRACT_KEY).await?;
        *self.state.write().unwrap() = SessionState::default();
        Ok(())
    }

    /// The contract wallet for `address`. Served from the session when the
    /// address matches the logged-in signer, fetched from the relay otherwise.
    pub async fn get_user_contract(&self, address: &str) -> Result<Hex> {
        let (is_login, signer, contract) = {
            let state = self.state.read().unwrap();
            (state.is_login, state.signer.clone(), state.user_contract.clone())
        };
        if !is_login {
            return Err(GaslaneError::coded(
                ErrorCode::UserNotLoggedIn,
                "user is not logged in",
            ));
        }
        if let (Some(signer), Some(contract)) = (signer, contract) {
            if signer.eq_ignore_ascii_case(address) {
                return Ok(contract);
            }
        }
        let network_id = self.wallet.net_version().await?;
        self.relay.get_user_contract(address, &network_id).await
    }

    /// Restore a persisted session, if any. Returns whether a session is now
    /// active. A stored session is only honored when the wallet still exposes
    /// the stored signer and the relay still maps it to the stored contract.
    pub async fn restore(&self) -> Result<bool> {
        let stored_signer = match self.store.get(USER_ACCOUNT_KEY).await? {
            Some(s) => s,
            None => return Ok(false),
        };
        let stored_contract = match self.store.get(USER_CONTRACT_KEY).await? {
            Some(c) => c,
            None => return Ok(false),
        };

        let accounts = self.wallet.accounts().await?;
        let live = match accounts.first() {
            Some(a) => a,
            None => return Ok(false),
        };
        if !live.eq_ignore_ascii_case(&stored_signer) {
            return Ok(false);
        }

        let network_id = self.wallet.net_version().await?;
        let fresh = match self.relay.get_user_contract(&stored_signer, &network_id).await {
            Ok(c) => c,
            // the relay forgot the wallet; treat as logged out, not fatal
            Err(e) if e.code() == Some(ErrorCode::UserContractNotFound) => return Ok(false),
            Err(e) => return Err(e),
        };
        if !fresh.eq_ignore_ascii_case(&stored_contract) {
            return Ok(false);
        }

        let mut state = self.state.write().unwrap();
        state.is_login = true;
        state.signer = Some(stored_signer);
        state.user_contract = Some(stored_contract);
        Ok(true)
    }
}

async fn persist_session(
    store: &Arc<dyn StorageAdapter>,
    state: &Arc<RwLock<SessionState>>,
    signer: &str,
    user_contract: &str,
) -> Result<()> {
    store.set(USER_ACCOUNT_KEY, signer).await?;
    store.set(USER_CONTRACT_KEY, user_contract).await?;
    let mut state = state.write().unwrap();
    state.is_login = true;
    state.signer = Some(signer.to_string());
    state.user_contract = Some(user_contract.to_string());
    Ok(())
}

/// Interpret a transaction receipt's status field.
fn receipt_succeeded(receipt: &serde_json::Value) -> bool {
    match receipt.get("status") {
        Some(serde_json::Value::Bool(b)) => *b,
        Some(serde_json::Value::String(s)) => s == "0x1" || s == "0x01" || s == "1",
        Some(serde_json::Value::Number(n)) => n.as_u64() == Some(1),
        _ => false,
    }
}
