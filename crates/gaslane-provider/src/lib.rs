//! Drop-in JSON-RPC provider that turns transaction submissions into
//! gasless meta-transactions.
//!
//! `eth_sendTransaction` and `eth_sendRawTransaction` against registered
//! contracts are decoded, wrapped in a relay request and submitted to the
//! relay, which pays the gas. Every other method passes through to the
//! underlying wallet untouched.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockWriteGuard};

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::sync::watch;
use tracing::debug;

use gaslane_decoder::{decode_raw_transaction, DecoderRegistry};
use gaslane_relay::{
    HttpRelayClient, MetaApi, NativeMetaTx, RelayApi, RelayRequest, UserMetaTx, WithdrawRequest,
    WithdrawResponse, NATIVE_META_TX_PATH,
};
use gaslane_session::{LoginOutcome, SessionConfig, SessionManager};
use gaslane_store::StorageAdapter;
use gaslane_types::{
    bytes_to_hex, hex_to_bytes, ErrorCode, EventBus, EventHandler, EventKind, GaslaneError, Hex,
    JsonRpcRequest, JsonRpcResponse, Result, WalletProvider, WalletProviderExt,
};

pub mod config;
pub mod init;
pub mod permit;

pub use config::ProviderOptions;
pub use init::InitState;
pub use permit::PermitClient;

/// The meta-transaction provider. Cheap to clone; clones share all state.
///
/// Construction kicks off initialization in the background; use
/// [`wait_until_ready`](Self::wait_until_ready) or subscribe to the ready
/// event before sending transactions.
#[derive(Clone)]
pub struct MetaTxProvider {
    wallet: Arc<dyn WalletProvider>,
    relay: Arc<dyn RelayApi>,
    session: Arc<SessionManager>,
    events: Arc<EventBus>,
    options: Arc<ProviderOptions>,
    decoders: Arc<RwLock<DecoderRegistry>>,
    apis: Arc<RwLock<HashMap<String, MetaApi>>>,
    network_id: Arc<RwLock<Option<String>>>,
    state_tx: Arc<watch::Sender<InitState>>,
    state_rx: watch::Receiver<InitState>,
}

impl MetaTxProvider {
    /// Build a provider against the hosted relay and start initializing.
    /// Must be called within a tokio runtime.
    pub fn new(
        wallet: Arc<dyn WalletProvider>,
        store: Arc<dyn StorageAdapter>,
        options: ProviderOptions,
    ) -> Result<Self> {
        options.validate()?;
        let relay: Arc<dyn RelayApi> =
            Arc::new(HttpRelayClient::new(options.base_url(), &options.api_key));
        let provider = Self::with_parts(wallet, relay, store, options)?;
        tokio::spawn(init::run(provider.clone()));
        Ok(provider)
    }

    /// Build a provider over an arbitrary relay implementation without
    /// starting initialization.
    pub fn with_parts(
        wallet: Arc<dyn WalletProvider>,
        relay: Arc<dyn RelayApi>,
        store: Arc<dyn StorageAdapter>,
        options: ProviderOptions,
    ) -> Result<Self> {
        options.validate()?;
        let events = Arc::new(EventBus::new());
        let session = Arc::new(SessionManager::new(
            Arc::clone(&relay),
            Arc::clone(&wallet),
            store,
            Arc::clone(&events),
            SessionConfig {
                provider_id: options.provider_id,
                login_message_prefix: options.login_message_prefix().to_string(),
                receipt_poll_interval: config::RECEIPT_POLL_INTERVAL,
            },
        ));
        let (state_tx, state_rx) = watch::channel(InitState::Uninitialized);
        Ok(Self {
            wallet,
            relay,
            session,
            events,
            options: Arc::new(options),
            decoders: Arc::new(RwLock::new(DecoderRegistry::new())),
            apis: Arc::new(RwLock::new(HashMap::new())),
            network_id: Arc::new(RwLock::new(None)),
            state_tx: Arc::new(state_tx),
            state_rx,
        })
    }

    // crate-internal accessors for the init sequence

    pub(crate) fn wallet(&self) -> &Arc<dyn WalletProvider> {
        &self.wallet
    }

    pub(crate) fn relay(&self) -> &Arc<dyn RelayApi> {
        &self.relay
    }

    pub(crate) fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    pub(crate) fn events(&self) -> &EventBus {
        &self.events
    }

    pub(crate) fn options(&self) -> &ProviderOptions {
        &self.options
    }

    pub(crate) fn decoders_mut(&self) -> RwLockWriteGuard<'_, DecoderRegistry> {
        self.decoders.write().unwrap()
    }

    pub(crate) fn apis_mut(&self) -> RwLockWriteGuard<'_, HashMap<String, MetaApi>> {
        self.apis.write().unwrap()
    }

    pub(crate) fn set_network_id(&self, network_id: &str) {
        *self.network_id.write().unwrap() = Some(network_id.to_string());
    }

    pub(crate) fn set_state(&self, state: InitState) {
        let _ = self.state_tx.send(state);
    }

    /// Current initialization state.
    pub fn init_state(&self) -> InitState {
        *self.state_rx.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.init_state() == InitState::Ready
    }

    /// The dapp's network id, known once initialization fetched it.
    pub fn network_id(&self) -> Option<String> {
        self.network_id.read().unwrap().clone()
    }

    /// Await the end of initialization. Resolves once the client is ready;
    /// errors if initialization failed or found no registered contracts.
    pub async fn wait_until_ready(&self) -> Result<()> {
        let mut rx = self.state_rx.clone();
        loop {
            let state = *rx.borrow_and_update();
            match state {
                InitState::Ready => return Ok(()),
                InitState::NoData => {
                    return Err(GaslaneError::coded(
                        ErrorCode::SmartContractNotFound,
                        "no smart contracts registered for this dapp",
                    ))
                }
                InitState::Failed => {
                    return Err(GaslaneError::coded(
                        ErrorCode::NotInitialized,
                        "client initialization failed",
                    ))
                }
                _ => {}
            }
            if rx.changed().await.is_err() {
                return Err(GaslaneError::coded(
                    ErrorCode::NotInitialized,
                    "client was dropped before initialization finished",
                ));
            }
        }
    }

    /// Subscribe to client events.
    pub fn on_event(&self, kind: EventKind, handler: EventHandler) {
        self.events.subscribe(kind, handler);
    }

    /// Emit the error event and return the same code/message as an error, so
    /// both callback-style and Result-style consumers observe the failure.
    fn fail(&self, code: ErrorCode, message: impl Into<String>) -> GaslaneError {
        let message = message.into();
        self.events.emit_error(code, message.clone());
        GaslaneError::coded(code, message)
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.init_state() != InitState::Ready {
            return Err(self.fail(
                ErrorCode::NotInitialized,
                "client is not initialized yet; await readiness first",
            ));
        }
        Ok(())
    }

    /// Look up the relay API for a decoded method. `Ok(None)` means the call
    /// should fall through to the wallet (permissive mode only).
    fn api_for_method(&self, method: &str) -> Result<Option<MetaApi>> {
        let api = self.apis.read().unwrap().get(method).cloned();
        match api {
            Some(api) => Ok(Some(api)),
            None if self.options.strict_mode => Err(self.fail(
                ErrorCode::ApiNotFound,
                format!("no meta api registered for method {}", method),
            )),
            None => {
                debug!(method, "no meta api registered, forwarding to wallet");
                Ok(None)
            }
        }
    }

    async fn dispatch(&self, api: &MetaApi, request: RelayRequest, id: Value) -> Result<JsonRpcResponse> {
        let tx_hash = self.relay.send_signed_tx(&api.url, &request).await?;
        Ok(JsonRpcResponse::result(id, json!(tx_hash)))
    }

    async fn handle_send_transaction(&self, payload: JsonRpcRequest) -> Result<JsonRpcResponse> {
        self.ensure_ready()?;
        let tx = payload
            .params
            .first()
            .and_then(Value::as_object)
            .cloned()
            .ok_or_else(|| {
                self.fail(
                    ErrorCode::InvalidPayload,
                    "eth_sendTransaction requires a transaction object",
                )
            })?;

        let to = field_str(&tx, "to").ok_or_else(|| {
            self.fail(ErrorCode::InvalidPayload, "transaction object is missing 'to'")
        })?;
        let from = field_str(&tx, "from")
            .ok_or_else(|| {
                self.fail(ErrorCode::InvalidPayload, "transaction object is missing 'from'")
            })?
            .to_lowercase();
        let data = hex_to_bytes(field_str(&tx, "data").as_deref().unwrap_or("0x"))
            .map_err(|e| self.fail(ErrorCode::InvalidPayload, e.to_string()))?;
        let value = field_str(&tx, "value").unwrap_or_else(|| "0x0".into());
        let gas_limit = field_str(&tx, "gas").unwrap_or_else(|| "0x0".into());
        let gas_price = field_str(&tx, "gasPrice").unwrap_or_else(|| "0x0".into());

        let decoded = self.decode_for_contract(&to, &data)?;
        let api = match self.api_for_method(&decoded.name)? {
            Some(api) => api,
            None => return self.wallet.send(payload).await,
        };
        let params: Vec<Value> = decoded.params.into_iter().map(|p| p.value).collect();

        if api.url == NATIVE_META_TX_PATH {
            let request = RelayRequest::Native(NativeMetaTx {
                user_address: from,
                api_id: api.id.clone(),
                params,
                gas_limit,
                gas_price,
            });
            return self.dispatch(&api, request, payload.id).await;
        }

        if !self.session.is_logged_in() {
            // surfaced to the caller only; login state is theirs to handle
            return Err(GaslaneError::coded(
                ErrorCode::UserNotLoggedIn,
                "user is not logged in; call login first",
            ));
        }
        let nonce = self
            .relay
            .get_contract_nonce(&from)
            .await
            .map_err(|e| self.fail(ErrorCode::UserAccountNotFound, e.to_string()))?;
        let signed_message = format!("{}{}", self.options.message_to_sign_prefix(), nonce);
        let signature = self.wallet.personal_sign(&signed_message, &from).await?;

        let request = RelayRequest::User(Box::new(UserMetaTx {
            raw_tx: None,
            data: Some(bytes_to_hex(&data)),
            signature,
            message_length: signed_message.len(),
            // the relay appends the nonce server-side before verifying
            message: self.options.message_to_sign_prefix().to_string(),
            signer: from,
            api_id: api.id.clone(),
            dapp_id: self.options.dapp_id.clone(),
            params,
            value,
            gas_limit,
            gas_price,
        }));
        self.dispatch(&api, request, payload.id).await
    }

    async fn handle_send_raw_transaction(&self, payload: JsonRpcRequest) -> Result<JsonRpcResponse> {
        self.ensure_ready()?;
        let (raw, forwarded_message, forwarded_signature) = match payload.params.first() {
            Some(Value::String(raw)) => (raw.clone(), None, None),
            Some(Value::Object(map)) => {
                let raw = field_str(map, "rawTransaction").ok_or_else(|| {
                    self.fail(
                        ErrorCode::InvalidPayload,
                        "structured raw transaction params need 'rawTransaction'",
                    )
                })?;
                (raw, field_str(map, "message"), field_str(map, "signature"))
            }
            _ => {
                return Err(self.fail(
                    ErrorCode::InvalidPayload,
                    "eth_sendRawTransaction requires a raw transaction",
                ))
            }
        };

        let tx = decode_raw_transaction(&raw)
            .map_err(|e| self.fail(ErrorCode::InvalidPayload, e.to_string()))?;
        let to = tx.to.clone().ok_or_else(|| {
            self.fail(
                ErrorCode::InvalidPayload,
                "contract creation cannot be relayed as a meta-transaction",
            )
        })?;

        let decoded = self.decode_for_contract(&to, &tx.data)?;
        let api = match self.api_for_method(&decoded.name)? {
            Some(api) => api,
            None => return self.wallet.send(payload).await,
        };
        let params: Vec<Value> = decoded.params.into_iter().map(|p| p.value).collect();

        if api.url == NATIVE_META_TX_PATH {
            let request = RelayRequest::Native(NativeMetaTx {
                user_address: tx.signer.clone(),
                api_id: api.id.clone(),
                params,
                gas_limit: tx.gas_limit.to_string(),
                gas_price: tx.gas_price.to_string(),
            });
            return self.dispatch(&api, request, payload.id).await;
        }

        if !self.session.is_logged_in() {
            return Err(GaslaneError::coded(
                ErrorCode::UserNotLoggedIn,
                "user is not logged in; call login first",
            ));
        }
        let (message, signature) = match (forwarded_message, forwarded_signature) {
            (Some(m), Some(s)) => (m, s),
            _ => {
                return Err(self.fail(
                    ErrorCode::InvalidPayload,
                    "relayed raw transactions need 'message' and 'signature' params",
                ))
            }
        };
        if self.relay.get_user_nonce(&tx.signer).await?.is_none() {
            return Err(self.fail(
                ErrorCode::UserAccountNotFound,
                format!("signer {} is not a registered user", tx.signer),
            ));
        }

        let request = RelayRequest::User(Box::new(UserMetaTx {
            raw_tx: Some(raw),
            data: Some(bytes_to_hex(&tx.data)),
            signature,
            message_length: message.len(),
            // as on the structured path, the wire carries the bare prefix
            message: self.options.message_to_sign_prefix().to_string(),
            signer: tx.signer.clone(),
            api_id: api.id.clone(),
            dapp_id: self.options.dapp_id.clone(),
            params,
            value: tx.value_hex(),
            gas_limit: tx.gas_limit.to_string(),
            gas_price: tx.gas_price.to_string(),
        }));
        self.dispatch(&api, request, payload.id).await
    }

    fn decode_for_contract(&self, to: &str, data: &[u8]) -> Result<gaslane_decoder::DecodedMethod> {
        let registry = self.decoders.read().unwrap();
        if registry.is_empty() {
            return Err(self.fail(
                ErrorCode::NotInitialized,
                "no contract decoders loaded; initialization has not completed",
            ));
        }
        let decoder = registry.get(to).ok_or_else(|| {
            self.fail(
                ErrorCode::DecoderMismatch,
                format!("contract {} is not registered for this dapp", to),
            )
        })?;
        decoder
            .decode_call(data)
            .map_err(|e| self.fail(ErrorCode::DecoderMismatch, e.to_string()))
    }

    /// Rewrite `eth_call` to read as the user's contract wallet. The caller's
    /// payload is copied, never mutated in place.
    async fn handle_eth_call(&self, payload: JsonRpcRequest) -> Result<JsonRpcResponse> {
        if !self.options.read_via_contract || !self.session.is_logged_in() {
            return self.wallet.send(payload).await;
        }
        let contract = match self.session.cached_user_contract() {
            Some(c) => c,
            None => return self.wallet.send(payload).await,
        };
        let mut rewritten = payload.clone();
        if let Some(call) = rewritten.params.get_mut(0).and_then(Value::as_object_mut) {
            call.insert("from".into(), json!(contract));
        }
        self.wallet.send(rewritten).await
    }

    // -- session surface --

    /// Sign the login message and establish a session with the relay.
    pub async fn login(&self, signer: &str) -> Result<LoginOutcome> {
        self.ensure_ready()?;
        self.session.login(signer).await
    }

    /// Establish a session from an externally produced login signature.
    pub async fn account_login(&self, signer: &str, signature: &str) -> Result<LoginOutcome> {
        self.ensure_ready()?;
        self.session.account_login(signer, signature).await
    }

    pub async fn logout(&self) -> Result<()> {
        self.session.logout().await
    }

    pub fn is_logged_in(&self) -> bool {
        self.session.is_logged_in()
    }

    /// The wallet's active account.
    pub async fn get_user_account(&self) -> Result<Hex> {
        let accounts = self.wallet.accounts().await?;
        accounts.into_iter().next().ok_or_else(|| {
            GaslaneError::coded(ErrorCode::UserAccountNotFound, "wallet exposes no accounts")
        })
    }

    /// The contract wallet owned by `address`.
    pub async fn get_user_contract(&self, address: &str) -> Result<Hex> {
        self.session.get_user_contract(address).await
    }

    /// The message `login` would currently ask `signer` to sign.
    pub async fn get_login_message_to_sign(&self, signer: &str) -> Result<String> {
        self.session.login_message(signer).await
    }

    /// The per-transaction message the user path would currently sign.
    pub async fn get_user_message_to_sign(&self, signer: &str) -> Result<String> {
        let nonce = self.relay.get_contract_nonce(signer).await?;
        Ok(format!("{}{}", self.options.message_to_sign_prefix(), nonce))
    }

    /// Withdraw funds from the user's contract wallet to `receiver`.
    /// `amount` is in wei, as a decimal string.
    pub async fn withdraw_funds(&self, receiver: &str, amount: &str) -> Result<WithdrawResponse> {
        self.ensure_ready()?;
        let signer = self.session.signer().ok_or_else(|| {
            GaslaneError::coded(ErrorCode::UserNotLoggedIn, "user is not logged in")
        })?;
        let nonce = self.relay.get_contract_nonce(&signer).await?;
        let message = format!("{}{}", self.options.withdraw_message_prefix(), nonce);
        let signature = self.wallet.personal_sign(&message, &signer).await?;
        let request = WithdrawRequest {
            signer,
            message_length: message.len(),
            message,
            signature,
            amount: amount.to_string(),
            receiver: receiver.to_string(),
        };
        self.relay.withdraw_funds(&request).await
    }

    /// Build a permit helper over the same wallet connection.
    pub fn permit_client(&self) -> PermitClient {
        PermitClient::new(Arc::clone(&self.wallet))
    }

    /// Fire-and-forget submission; identical routing to the `send` impl.
    pub async fn send_async(&self, payload: JsonRpcRequest) -> Result<JsonRpcResponse> {
        self.send_inner(payload).await
    }

    async fn send_inner(&self, payload: JsonRpcRequest) -> Result<JsonRpcResponse> {
        match payload.method.as_str() {
            "eth_sendTransaction" => self.handle_send_transaction(payload).await,
            "eth_sendRawTransaction" => self.handle_send_raw_transaction(payload).await,
            "eth_call" => self.handle_eth_call(payload).await,
            _ => self.wallet.send(payload).await,
        }
    }
}

#[async_trait]
impl WalletProvider for MetaTxProvider {
    async fn send(&self, payload: JsonRpcRequest) -> Result<JsonRpcResponse> {
        self.send_inner(payload).await
    }
}

fn field_str(map: &Map<String, Value>, key: &str) -> Option<String> {
    map.get(key).and_then(Value::as_str).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::consensus::{SignableTransaction, TxEnvelope, TxLegacy};
    use alloy::dyn_abi::{DynSolValue, JsonAbiExt};
    use alloy::eips::eip2718::Encodable2718;
    use alloy::json_abi::JsonAbi;
    use alloy::primitives::{Address, TxKind, U256};
    use alloy::signers::{local::PrivateKeySigner, SignerSync};
    use gaslane_relay::{DappInfo, LoginRequest, LoginResponse, SmartContract, SEND_SIGNED_TX_PATH};
    use gaslane_session::{USER_ACCOUNT_KEY, USER_CONTRACT_KEY};
    use gaslane_store::MemoryStore;
    use gaslane_types::{relay_flags, SdkEvent};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    const GREETER_ABI: &str = r#"[
        {
            "type": "function",
            "name": "setGreeting",
            "inputs": [{"name": "greeting", "type": "string"}],
            "outputs": [],
            "stateMutability": "nonpayable"
        }
    ]"#;

    const CONTRACT_ADDR: &str = "0x00000000000000000000000000000000000000cc";
    const SIGNER: &str = "0x00000000000000000000000000000000000000aa";
    const USER_CONTRACT: &str = "0x00000000000000000000000000000000000000dd";

    fn set_greeting_data(greeting: &str) -> Vec<u8> {
        let abi: JsonAbi = serde_json::from_str(GREETER_ABI).unwrap();
        let function = abi.functions().find(|f| f.name == "setGreeting").unwrap();
        function
            .abi_encode_input(&[DynSolValue::String(greeting.into())])
            .unwrap()
    }

    struct MockWallet {
        sent: Mutex<Vec<JsonRpcRequest>>,
    }

    impl MockWallet {
        fn new() -> Self {
            Self { sent: Mutex::new(Vec::new()) }
        }

        fn sent_methods(&self) -> Vec<String> {
            self.sent.lock().unwrap().iter().map(|p| p.method.clone()).collect()
        }

        fn last_sent(&self) -> Option<JsonRpcRequest> {
            self.sent.lock().unwrap().last().cloned()
        }
    }

    #[async_trait]
    impl WalletProvider for MockWallet {
        async fn send(&self, payload: JsonRpcRequest) -> Result<JsonRpcResponse> {
            let result = match payload.method.as_str() {
                "eth_accounts" => json!([SIGNER]),
                "net_version" => json!("42"),
                "personal_sign" => json!("0xwalletsig"),
                _ => json!("0xpassthrough"),
            };
            self.sent.lock().unwrap().push(payload.clone());
            Ok(JsonRpcResponse::result(payload.id, result))
        }
    }

    struct MockRelay {
        network_id: String,
        contracts: Vec<SmartContract>,
        apis: Vec<MetaApi>,
        contract_nonce: u64,
        user_nonce: Option<u64>,
        contract_lookup_fails: bool,
        submitted: Mutex<Vec<(String, Value)>>,
    }

    impl MockRelay {
        fn new() -> Self {
            Self {
                network_id: "42".into(),
                contracts: vec![SmartContract {
                    address: CONTRACT_ADDR.into(),
                    abi: GREETER_ABI.into(),
                }],
                apis: vec![],
                contract_nonce: 5,
                user_nonce: Some(1),
                contract_lookup_fails: false,
                submitted: Mutex::new(Vec::new()),
            }
        }

        fn with_api(mut self, url: &str) -> Self {
            self.apis.push(MetaApi {
                method: "setGreeting".into(),
                url: url.into(),
                id: "api-greet".into(),
            });
            self
        }

        fn submissions(&self) -> Vec<(String, Value)> {
            self.submitted.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RelayApi for MockRelay {
        async fn get_dapp(&self, _dapp_id: &str) -> Result<DappInfo> {
            Ok(DappInfo { network_id: self.network_id.clone() })
        }
        async fn list_smart_contracts(&self, _dapp_id: &str) -> Result<Vec<SmartContract>> {
            Ok(self.contracts.clone())
        }
        async fn list_meta_apis(&self, _dapp_id: &str) -> Result<Vec<MetaApi>> {
            Ok(self.apis.clone())
        }
        async fn get_user_nonce(&self, _signer: &str) -> Result<Option<u64>> {
            Ok(self.user_nonce)
        }
        async fn get_contract_nonce(&self, _signer: &str) -> Result<u64> {
            Ok(self.contract_nonce)
        }
        async fn get_user_contract(&self, _owner: &str, _network_id: &str) -> Result<Hex> {
            if self.contract_lookup_fails {
                return Err(GaslaneError::Other("relay connection reset".into()));
            }
            Ok(USER_CONTRACT.into())
        }
        async fn login(&self, _request: &LoginRequest) -> Result<LoginResponse> {
            Ok(LoginResponse {
                flag: Some(relay_flags::ACTION_COMPLETE),
                user_contract: Some(USER_CONTRACT.into()),
                ..Default::default()
            })
        }
        async fn send_signed_tx(&self, api_url: &str, request: &RelayRequest) -> Result<Hex> {
            self.submitted
                .lock()
                .unwrap()
                .push((api_url.to_string(), serde_json::to_value(request).unwrap()));
            Ok("0xrelayed".into())
        }
        async fn withdraw_funds(&self, _request: &WithdrawRequest) -> Result<WithdrawResponse> {
            Ok(WithdrawResponse {
                flag: Some(relay_flags::SUCCESS),
                tx_hash: Some("0xwithdrawn".into()),
                log: None,
            })
        }
    }

    async fn ready_provider(
        relay: MockRelay,
        options: ProviderOptions,
    ) -> (MetaTxProvider, Arc<MockWallet>, Arc<MockRelay>) {
        let wallet = Arc::new(MockWallet::new());
        let relay = Arc::new(relay);
        let provider = MetaTxProvider::with_parts(
            Arc::clone(&wallet) as Arc<dyn WalletProvider>,
            Arc::clone(&relay) as Arc<dyn RelayApi>,
            Arc::new(MemoryStore::new()),
            options,
        )
        .unwrap();
        init::run(provider.clone()).await;
        (provider, wallet, relay)
    }

    fn options() -> ProviderOptions {
        ProviderOptions::new("dapp-1", "key-1")
    }

    fn send_tx_payload(data: &[u8]) -> JsonRpcRequest {
        JsonRpcRequest::new(
            json!(1),
            "eth_sendTransaction",
            vec![json!({
                "from": SIGNER,
                "to": CONTRACT_ADDR,
                "data": bytes_to_hex(data),
                "gas": "0x5208",
                "gasPrice": "0x3b9aca00"
            })],
        )
    }

    fn signed_raw_greeting(key: &PrivateKeySigner, greeting: &str) -> String {
        let tx = TxLegacy {
            chain_id: Some(42),
            nonce: 0,
            gas_price: 1_000_000_000,
            gas_limit: 90_000,
            to: TxKind::Call(CONTRACT_ADDR.parse::<Address>().unwrap()),
            value: U256::ZERO,
            input: set_greeting_data(greeting).into(),
        };
        let signature = key.sign_hash_sync(&tx.signature_hash()).unwrap();
        let envelope: TxEnvelope = tx.into_signed(signature).into();
        bytes_to_hex(&envelope.encoded_2718())
    }

    #[tokio::test]
    async fn test_init_reaches_ready_and_fires_event() {
        let wallet = Arc::new(MockWallet::new());
        let relay = Arc::new(MockRelay::new().with_api(NATIVE_META_TX_PATH));
        let provider = MetaTxProvider::with_parts(
            Arc::clone(&wallet) as Arc<dyn WalletProvider>,
            relay,
            Arc::new(MemoryStore::new()),
            options(),
        )
        .unwrap();

        let ready = Arc::new(AtomicBool::new(false));
        let seen = Arc::clone(&ready);
        provider.on_event(
            EventKind::Ready,
            Box::new(move |_| seen.store(true, Ordering::SeqCst)),
        );

        init::run(provider.clone()).await;
        provider.wait_until_ready().await.unwrap();
        assert!(provider.is_ready());
        assert!(ready.load(Ordering::SeqCst));
        assert_eq!(provider.network_id().as_deref(), Some("42"));
    }

    #[tokio::test]
    async fn test_network_mismatch_fails_init() {
        let mut relay = MockRelay::new();
        relay.network_id = "1".into(); // wallet reports 42
        let (provider, _, _) = ready_provider(relay, options()).await;

        assert_eq!(provider.init_state(), InitState::Failed);
        let err = provider.wait_until_ready().await.unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::NotInitialized));
    }

    #[tokio::test]
    async fn test_unreachable_stored_session_still_reaches_ready() {
        // a persisted session whose revalidation fails must not brick the
        // client; it comes up ready with the user logged out
        let store = Arc::new(MemoryStore::new());
        store.set(USER_ACCOUNT_KEY, SIGNER).await.unwrap();
        store.set(USER_CONTRACT_KEY, USER_CONTRACT).await.unwrap();

        let mut relay = MockRelay::new().with_api(NATIVE_META_TX_PATH);
        relay.contract_lookup_fails = true;
        let provider = MetaTxProvider::with_parts(
            Arc::new(MockWallet::new()) as Arc<dyn WalletProvider>,
            Arc::new(relay),
            store,
            options(),
        )
        .unwrap();
        init::run(provider.clone()).await;

        provider.wait_until_ready().await.unwrap();
        assert!(provider.is_ready());
        assert!(!provider.is_logged_in());
    }

    #[tokio::test]
    async fn test_empty_contract_list_is_no_data() {
        let mut relay = MockRelay::new();
        relay.contracts.clear();
        let (provider, _, _) = ready_provider(relay, options()).await;
        assert_eq!(provider.init_state(), InitState::NoData);
    }

    #[tokio::test]
    async fn test_unrelated_methods_pass_through_unchanged() {
        let (provider, wallet, relay) =
            ready_provider(MockRelay::new().with_api(NATIVE_META_TX_PATH), options()).await;

        let payload = JsonRpcRequest::new(json!(7), "eth_blockNumber", vec![json!("latest")]);
        provider.send(payload.clone()).await.unwrap();

        let forwarded = wallet.last_sent().unwrap();
        assert_eq!(forwarded.method, "eth_blockNumber");
        assert_eq!(forwarded.params, payload.params);
        assert_eq!(forwarded.id, payload.id);
        assert!(relay.submissions().is_empty());
    }

    #[tokio::test]
    async fn test_native_path_rewrites_send_transaction() {
        let (provider, _, relay) =
            ready_provider(MockRelay::new().with_api(NATIVE_META_TX_PATH), options()).await;

        let response = provider
            .send(send_tx_payload(&set_greeting_data("hola")))
            .await
            .unwrap();
        assert_eq!(response.into_result().unwrap(), json!("0xrelayed"));

        let submissions = relay.submissions();
        assert_eq!(submissions.len(), 1);
        let (url, body) = &submissions[0];
        assert_eq!(url, NATIVE_META_TX_PATH);
        assert_eq!(body["apiId"], json!("api-greet"));
        assert_eq!(body["userAddress"], json!(SIGNER));
        assert_eq!(body["params"], json!(["hola"]));
        // native requests carry no extra signature
        assert!(body.get("signature").is_none());
    }

    #[tokio::test]
    async fn test_user_path_signs_nonce_message() {
        let (provider, wallet, relay) = ready_provider(
            MockRelay::new().with_api(SEND_SIGNED_TX_PATH),
            options(),
        )
        .await;
        provider.login(SIGNER).await.unwrap();

        provider
            .send(send_tx_payload(&set_greeting_data("hi")))
            .await
            .unwrap();

        // the wallet signed the counter message for nonce 5 (the login
        // message was signed separately, earlier)
        let signed_message = format!("{}5", config::MESSAGE_TO_SIGN_PREFIX);
        let signed = wallet
            .sent
            .lock()
            .unwrap()
            .iter()
            .any(|p| {
                p.method == "personal_sign"
                    && p.params[0] == json!(gaslane_types::utf8_to_hex(&signed_message))
            });
        assert!(signed);

        // the wire carries the bare prefix, with the length of the full
        // signed message
        let (_, body) = &relay.submissions()[0];
        assert_eq!(body["signature"], json!("0xwalletsig"));
        assert_eq!(body["message"], json!(config::MESSAGE_TO_SIGN_PREFIX));
        assert_eq!(body["messageLength"], json!(signed_message.len()));
        assert_eq!(body["dappId"], json!("dapp-1"));
        assert_eq!(body["signer"], json!(SIGNER));
    }

    #[tokio::test]
    async fn test_user_path_requires_login() {
        let (provider, _, relay) = ready_provider(
            MockRelay::new().with_api(SEND_SIGNED_TX_PATH),
            options(),
        )
        .await;

        let errored = Arc::new(AtomicBool::new(false));
        let seen = Arc::clone(&errored);
        provider.on_event(
            EventKind::Error,
            Box::new(move |_| seen.store(true, Ordering::SeqCst)),
        );

        let err = provider
            .send(send_tx_payload(&set_greeting_data("hi")))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::UserNotLoggedIn));
        assert!(relay.submissions().is_empty());
        // login state errors go to the caller only, not the event bus
        assert!(!errored.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_strict_mode_rejects_unregistered_method() {
        let mut opts = options();
        opts.strict_mode = true;
        // contract registered, but no api for setGreeting
        let (provider, wallet, relay) = ready_provider(MockRelay::new(), opts).await;

        let err = provider
            .send(send_tx_payload(&set_greeting_data("hi")))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::ApiNotFound));
        assert!(relay.submissions().is_empty());
        assert!(!wallet.sent_methods().contains(&"eth_sendTransaction".to_string()));
    }

    #[tokio::test]
    async fn test_permissive_mode_forwards_unregistered_method() {
        let (provider, wallet, relay) = ready_provider(MockRelay::new(), options()).await;

        provider
            .send(send_tx_payload(&set_greeting_data("hi")))
            .await
            .unwrap();
        assert!(wallet.sent_methods().contains(&"eth_sendTransaction".to_string()));
        assert!(relay.submissions().is_empty());
    }

    #[tokio::test]
    async fn test_unregistered_contract_is_decoder_mismatch() {
        let (provider, _, relay) =
            ready_provider(MockRelay::new().with_api(NATIVE_META_TX_PATH), options()).await;

        let mut payload = send_tx_payload(&set_greeting_data("hi"));
        payload.params[0]["to"] = json!("0x00000000000000000000000000000000000000ee");

        let errored = Arc::new(AtomicBool::new(false));
        let seen = Arc::clone(&errored);
        provider.on_event(
            EventKind::Error,
            Box::new(move |event| {
                if let SdkEvent::Error { code, .. } = event {
                    assert_eq!(*code, ErrorCode::DecoderMismatch);
                    seen.store(true, Ordering::SeqCst);
                }
            }),
        );

        let err = provider.send(payload).await.unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::DecoderMismatch));
        assert!(errored.load(Ordering::SeqCst));
        assert!(relay.submissions().is_empty());
    }

    #[tokio::test]
    async fn test_raw_and_structured_transactions_relay_identically() {
        let (provider, _, relay) =
            ready_provider(MockRelay::new().with_api(NATIVE_META_TX_PATH), options()).await;

        let key = PrivateKeySigner::random();
        let raw = signed_raw_greeting(&key, "gm");

        provider
            .send(JsonRpcRequest::new(json!(1), "eth_sendRawTransaction", vec![json!(raw)]))
            .await
            .unwrap();
        provider
            .send(send_tx_payload(&set_greeting_data("gm")))
            .await
            .unwrap();

        let submissions = relay.submissions();
        assert_eq!(submissions.len(), 2);
        let (raw_body, structured_body) = (&submissions[0].1, &submissions[1].1);
        assert_eq!(raw_body["apiId"], structured_body["apiId"]);
        assert_eq!(raw_body["params"], structured_body["params"]);
        // the native raw path uses the sender recovered from the signature
        assert_eq!(
            raw_body["userAddress"],
            json!(format!("{:#x}", key.address()))
        );
    }

    #[tokio::test]
    async fn test_forwarded_raw_transaction_needs_message_and_signature() {
        let (provider, _, _) = ready_provider(
            MockRelay::new().with_api(SEND_SIGNED_TX_PATH),
            options(),
        )
        .await;
        provider.login(SIGNER).await.unwrap();

        let key = PrivateKeySigner::random();
        let raw = signed_raw_greeting(&key, "gm");
        let err = provider
            .send(JsonRpcRequest::new(json!(1), "eth_sendRawTransaction", vec![json!(raw)]))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::InvalidPayload));
    }

    #[tokio::test]
    async fn test_structured_raw_transaction_relays_on_user_path() {
        let (provider, _, relay) = ready_provider(
            MockRelay::new().with_api(SEND_SIGNED_TX_PATH),
            options(),
        )
        .await;
        provider.login(SIGNER).await.unwrap();

        let key = PrivateKeySigner::random();
        let raw = signed_raw_greeting(&key, "gm");
        provider
            .send(JsonRpcRequest::new(
                json!(1),
                "eth_sendRawTransaction",
                vec![json!({
                    "rawTransaction": raw,
                    "message": "forwarded message",
                    "signature": "0xforwardedsig"
                })],
            ))
            .await
            .unwrap();

        let (url, body) = &relay.submissions()[0];
        assert_eq!(url, SEND_SIGNED_TX_PATH);
        assert_eq!(body["rawTx"], json!(raw));
        assert_eq!(body["signature"], json!("0xforwardedsig"));
        assert_eq!(body["signer"], json!(format!("{:#x}", key.address())));
        // the forwarded message sets the length; the wire message is the
        // bare prefix the relay completes with the nonce
        assert_eq!(body["message"], json!(config::MESSAGE_TO_SIGN_PREFIX));
        assert_eq!(body["messageLength"], json!("forwarded message".len()));
    }

    #[tokio::test]
    async fn test_garbage_raw_transaction_is_invalid_payload() {
        let (provider, _, _) =
            ready_provider(MockRelay::new().with_api(NATIVE_META_TX_PATH), options()).await;
        let err = provider
            .send(JsonRpcRequest::new(
                json!(1),
                "eth_sendRawTransaction",
                vec![json!("0xdeadbeef")],
            ))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::InvalidPayload));
    }

    #[tokio::test]
    async fn test_eth_call_reads_as_contract_wallet_when_enabled() {
        let mut opts = options();
        opts.read_via_contract = true;
        let (provider, wallet, _) = ready_provider(
            MockRelay::new().with_api(SEND_SIGNED_TX_PATH),
            opts,
        )
        .await;
        provider.login(SIGNER).await.unwrap();

        let payload = JsonRpcRequest::new(
            json!(3),
            "eth_call",
            vec![json!({"to": CONTRACT_ADDR, "data": "0x", "from": SIGNER}), json!("latest")],
        );
        provider.send(payload.clone()).await.unwrap();

        let forwarded = wallet.last_sent().unwrap();
        assert_eq!(forwarded.params[0]["from"], json!(USER_CONTRACT));
        // the caller's payload was not mutated
        assert_eq!(payload.params[0]["from"], json!(SIGNER));
    }

    #[tokio::test]
    async fn test_eth_call_untouched_when_logged_out() {
        let mut opts = options();
        opts.read_via_contract = true;
        let (provider, wallet, _) = ready_provider(MockRelay::new(), opts).await;

        let payload = JsonRpcRequest::new(
            json!(3),
            "eth_call",
            vec![json!({"to": CONTRACT_ADDR, "from": SIGNER}), json!("latest")],
        );
        provider.send(payload).await.unwrap();
        assert_eq!(wallet.last_sent().unwrap().params[0]["from"], json!(SIGNER));
    }

    #[tokio::test]
    async fn test_sending_before_ready_is_not_initialized() {
        let wallet = Arc::new(MockWallet::new());
        let provider = MetaTxProvider::with_parts(
            wallet as Arc<dyn WalletProvider>,
            Arc::new(MockRelay::new()),
            Arc::new(MemoryStore::new()),
            options(),
        )
        .unwrap();

        let err = provider
            .send(send_tx_payload(&set_greeting_data("hi")))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::NotInitialized));

        let err = provider.login(SIGNER).await.unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::NotInitialized));
    }

    #[tokio::test]
    async fn test_login_and_session_restore_roundtrip() {
        let store = Arc::new(MemoryStore::new());
        let wallet = Arc::new(MockWallet::new());
        let relay = Arc::new(MockRelay::new().with_api(NATIVE_META_TX_PATH));
        let provider = MetaTxProvider::with_parts(
            Arc::clone(&wallet) as Arc<dyn WalletProvider>,
            Arc::clone(&relay) as Arc<dyn RelayApi>,
            Arc::clone(&store) as Arc<dyn StorageAdapter>,
            options(),
        )
        .unwrap();
        init::run(provider.clone()).await;

        let outcome = provider.login(SIGNER).await.unwrap();
        assert_eq!(outcome.user_contract.as_deref(), Some(USER_CONTRACT));
        assert_eq!(store.get(USER_ACCOUNT_KEY).await.unwrap().as_deref(), Some(SIGNER));
        assert_eq!(store.get(USER_CONTRACT_KEY).await.unwrap().as_deref(), Some(USER_CONTRACT));

        // a second client over the same store restores the session during init
        let second = MetaTxProvider::with_parts(
            Arc::new(MockWallet::new()) as Arc<dyn WalletProvider>,
            relay,
            store,
            options(),
        )
        .unwrap();
        init::run(second.clone()).await;
        assert!(second.is_logged_in());
        assert_eq!(second.get_user_contract(SIGNER).await.unwrap(), USER_CONTRACT);
    }

    #[tokio::test]
    async fn test_withdraw_signs_and_submits() {
        let (provider, wallet, _) = ready_provider(
            MockRelay::new().with_api(SEND_SIGNED_TX_PATH),
            options(),
        )
        .await;
        provider.login(SIGNER).await.unwrap();

        let response = provider
            .withdraw_funds("0x00000000000000000000000000000000000000ee", "1000000")
            .await
            .unwrap();
        assert_eq!(response.tx_hash.as_deref(), Some("0xwithdrawn"));

        let expected = format!("{}5", config::WITHDRAW_MESSAGE_PREFIX);
        let sign_call = wallet
            .sent
            .lock()
            .unwrap()
            .iter()
            .find(|p| {
                p.method == "personal_sign"
                    && p.params[0] == json!(gaslane_types::utf8_to_hex(&expected))
            })
            .cloned();
        assert!(sign_call.is_some());
    }

    #[tokio::test]
    async fn test_message_to_sign_helpers() {
        let (provider, _, _) = ready_provider(MockRelay::new(), options()).await;
        assert_eq!(
            provider.get_user_message_to_sign(SIGNER).await.unwrap(),
            format!("{}5", config::MESSAGE_TO_SIGN_PREFIX)
        );
        assert_eq!(
            provider.get_login_message_to_sign(SIGNER).await.unwrap(),
            format!("{}1", config::LOGIN_MESSAGE_PREFIX)
        );
    }
}
