//! EIP-712 permit signatures for gasless token approvals.
//!
//! Covers the DAI-style permit (boolean `allowed`) and the EIP-2612 permit
//! (value-bounded). Both produce the signature a relayed `permit` call needs;
//! submitting that call is ordinary meta-transaction traffic.

use std::sync::Arc;

use serde_json::{json, Value};

use gaslane_types::{
    bytes_to_hex, hex_to_bytes, ErrorCode, GaslaneError, Hex, Result, WalletProvider,
    WalletProviderExt,
};

/// EIP-712 domain of the token contract being permitted.
#[derive(Debug, Clone)]
pub struct PermitDomain {
    pub name: String,
    pub version: String,
    pub chain_id: u64,
    pub verifying_contract: Hex,
}

/// An ECDSA signature split into the r/s/v form permit functions take.
#[derive(Debug, Clone, PartialEq)]
pub struct SplitSignature {
    pub r: Hex,
    pub s: Hex,
    pub v: u8,
}

/// Split a 65-byte hex signature into r, s and v (normalized to 27/28).
pub fn split_signature(signature: &str) -> Result<SplitSignature> {
    let bytes = hex_to_bytes(signature)?;
    if bytes.len() != 65 {
        return Err(GaslaneError::coded(
            ErrorCode::InvalidPayload,
            format!("expected a 65 byte signature, got {}", bytes.len()),
        ));
    }
    let mut v = bytes[64];
    if v < 27 {
        v += 27;
    }
    Ok(SplitSignature {
        r: bytes_to_hex(&bytes[..32]),
        s: bytes_to_hex(&bytes[32..64]),
        v,
    })
}

/// Signs permit payloads with the connected wallet.
pub struct PermitClient {
    wallet: Arc<dyn WalletProvider>,
}

impl PermitClient {
    pub fn new(wallet: Arc<dyn WalletProvider>) -> Self {
        Self { wallet }
    }

    /// Sign a DAI-style permit: `holder` allows (or revokes) `spender`
    /// entirely, valid until `expiry` (unix seconds, 0 for no expiry).
    pub async fn dai_permit_signature(
        &self,
        domain: &PermitDomain,
        holder: &str,
        spender: &str,
        nonce: u64,
        expiry: u64,
        allowed: bool,
    ) -> Result<SplitSignature> {
        let typed_data = json!({
            "types": {
                "EIP712Domain": eip712_domain_type(),
                "Permit": [
                    { "name": "holder", "type": "address" },
                    { "name": "spender", "type": "address" },
                    { "name": "nonce", "type": "uint256" },
                    { "name": "expiry", "type": "uint256" },
                    { "name": "allowed", "type": "bool" }
                ]
            },
            "domain": domain_value(domain),
            "primaryType": "Permit",
            "message": {
                "holder": holder,
                "spender": spender,
                "nonce": nonce,
                "expiry": expiry,
                "allowed": allowed
            }
        });
        let signature = self.wallet.sign_typed_data(holder, &typed_data).await?;
        split_signature(&signature)
    }

    /// Sign an EIP-2612 permit: `owner` allows `spender` up to `value` wei,
    /// valid until `deadline` (unix seconds).
    pub async fn eip2612_permit_signature(
        &self,
        domain: &PermitDomain,
        owner: &str,
        spender: &str,
        value: &str,
        nonce: u64,
        deadline: u64,
    ) -> Result<SplitSignature> {
        let typed_data = json!({
            "types": {
                "EIP712Domain": eip712_domain_type(),
                "Permit": [
                    { "name": "owner", "type": "address" },
                    { "name": "spender", "type": "address" },
                    { "name": "value", "type": "uint256" },
                    { "name": "nonce", "type": "uint256" },
                    { "name": "deadline", "type": "uint256" }
                ]
            },
            "domain": domain_value(domain),
            "primaryType": "Permit",
            "message": {
                "owner": owner,
                "spender": spender,
                "value": value,
                "nonce": nonce,
                "deadline": deadline
            }
        });
        let signature = self.wallet.sign_typed_data(owner, &typed_data).await?;
        split_signature(&signature)
    }
}

fn eip712_domain_type() -> Value {
    json!([
        { "name": "name", "type": "string" },
        { "name": "version", "type": "string" },
        { "name": "chainId", "type": "uint256" },
        { "name": "verifyingContract", "type": "address" }
    ])
}

fn domain_value(domain: &PermitDomain) -> Value {
    json!({
        "name": domain.name,
        "version": domain.version,
        "chainId": domain.chain_id,
        "verifyingContract": domain.verifying_contract
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use gaslane_types::{JsonRpcRequest, JsonRpcResponse};
    use std::sync::Mutex;

    struct SigningWallet {
        typed_data: Mutex<Option<Value>>,
    }

    #[async_trait]
    impl WalletProvider for SigningWallet {
        async fn send(&self, payload: JsonRpcRequest) -> Result<JsonRpcResponse> {
            assert_eq!(payload.method, "eth_signTypedData_v4");
            let parsed: Value =
                serde_json::from_str(payload.params[1].as_str().unwrap()).unwrap();
            *self.typed_data.lock().unwrap() = Some(parsed);
            // 65 bytes: r = 0x11.., s = 0x22.., v = 0
            let mut sig = vec![0x11u8; 32];
            sig.extend(vec![0x22u8; 32]);
            sig.push(0);
            Ok(JsonRpcResponse::result(payload.id, serde_json::json!(bytes_to_hex(&sig))))
        }
    }

    fn domain() -> PermitDomain {
        PermitDomain {
            name: "Dai Stablecoin".into(),
            version: "1".into(),
            chain_id: 42,
            verifying_contract: "0x00000000000000000000000000000000000000da".into(),
        }
    }

    #[test]
    fn test_split_signature_normalizes_v() {
        let mut sig = vec![0xaa; 64];
        sig.push(1);
        let split = split_signature(&bytes_to_hex(&sig)).unwrap();
        assert_eq!(split.v, 28);
        assert_eq!(split.r, bytes_to_hex(&[0xaa; 32]));

        let mut sig = vec![0xaa; 64];
        sig.push(27);
        assert_eq!(split_signature(&bytes_to_hex(&sig)).unwrap().v, 27);
    }

    #[test]
    fn test_split_signature_rejects_wrong_length() {
        let err = split_signature("0x1122").unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::InvalidPayload));
    }

    #[tokio::test]
    async fn test_dai_permit_builds_typed_data_and_splits() {
        let wallet = Arc::new(SigningWallet { typed_data: Mutex::new(None) });
        let client = PermitClient::new(Arc::clone(&wallet) as Arc<dyn WalletProvider>);

        let split = client
            .dai_permit_signature(&domain(), "0xholder", "0xspender", 3, 0, true)
            .await
            .unwrap();
        assert_eq!(split.v, 27);

        let typed = wallet.typed_data.lock().unwrap().clone().unwrap();
        assert_eq!(typed["primaryType"], "Permit");
        assert_eq!(typed["domain"]["chainId"], 42);
        assert_eq!(typed["message"]["holder"], "0xholder");
        assert_eq!(typed["message"]["allowed"], true);
        assert_eq!(typed["types"]["Permit"][4]["name"], "allowed");
    }

    #[tokio::test]
    async fn test_eip2612_permit_message_fields() {
        let wallet = Arc::new(SigningWallet { typed_data: Mutex::new(None) });
        let client = PermitClient::new(Arc::clone(&wallet) as Arc<dyn WalletProvider>);

        client
            .eip2612_permit_signature(&domain(), "0xowner", "0xspender", "1000", 9, 1_700_000_000)
            .await
            .unwrap();

        let typed = wallet.typed_data.lock().unwrap().clone().unwrap();
        assert_eq!(typed["message"]["value"], "1000");
        assert_eq!(typed["message"]["deadline"], 1_700_000_000);
        assert_eq!(typed["types"]["Permit"][0]["name"], "owner");
    }
}
