//! Initialization sequence: dapp metadata, registered contracts, session
//! restoration and registered APIs, in that order.
//!
//! The sequence runs as a background task; callers observe progress through
//! a watch channel and typically just await `wait_until_ready`.

use tracing::{debug, warn};

use gaslane_types::{ErrorCode, GaslaneError, Result, SdkEvent, WalletProviderExt};

use crate::MetaTxProvider;

/// Initialization progress. `Ready`, `NoData` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitState {
    Uninitialized,
    FetchingDapp,
    FetchingContracts,
    ValidatingSession,
    FetchingApis,
    /// Registries are populated; the client rewrites transactions.
    Ready,
    /// The dapp exists but has no registered contracts.
    NoData,
    Failed,
}

impl InitState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, InitState::Ready | InitState::NoData | InitState::Failed)
    }
}

pub(crate) async fn run(provider: MetaTxProvider) {
    if let Err(e) = run_sequence(&provider).await {
        let code = e.code().unwrap_or(ErrorCode::ErrorResponse);
        provider.events().emit_error(code, e.to_string());
        provider.set_state(InitState::Failed);
    }
}

async fn run_sequence(provider: &MetaTxProvider) -> Result<()> {
    let options = provider.options();

    provider.set_state(InitState::FetchingDapp);
    let dapp = provider.relay().get_dapp(&options.dapp_id).await?;
    let live_network = provider
        .wallet()
        .net_version()
        .await
        .map_err(|e| GaslaneError::coded(ErrorCode::NetworkIdNotFound, e.to_string()))?;
    if live_network != dapp.network_id {
        return Err(GaslaneError::coded(
            ErrorCode::NetworkIdMismatch,
            format!(
                "dapp is registered on network {} but the wallet is on network {}",
                dapp.network_id, live_network
            ),
        ));
    }
    provider.set_network_id(&dapp.network_id);

    provider.set_state(InitState::FetchingContracts);
    let contracts = provider.relay().list_smart_contracts(&options.dapp_id).await?;
    if contracts.is_empty() {
        provider.set_state(InitState::NoData);
        provider.events().emit_error(
            ErrorCode::SmartContractNotFound,
            "no smart contracts registered for this dapp",
        );
        return Ok(());
    }
    {
        let mut registry = provider.decoders_mut();
        for contract in &contracts {
            if let Err(e) = registry.insert_abi(&contract.address, &contract.abi) {
                warn!(address = %contract.address, error = %e, "skipping contract with unusable abi");
            }
        }
    }

    provider.set_state(InitState::ValidatingSession);
    match provider.session().restore().await {
        Ok(restored) => debug!(restored, "session restoration checked"),
        Err(e) => {
            // a stale or unreachable session leaves the user logged out;
            // the rest of the client still comes up
            warn!(error = %e, "session restoration failed, continuing logged out");
            provider
                .events()
                .emit_error(e.code().unwrap_or(ErrorCode::UserAccountNotFound), e.to_string());
        }
    }

    provider.set_state(InitState::FetchingApis);
    let apis = provider.relay().list_meta_apis(&options.dapp_id).await?;
    {
        let mut map = provider.apis_mut();
        for api in apis {
            map.insert(api.method.clone(), api);
        }
    }

    provider.set_state(InitState::Ready);
    provider.events().emit(&SdkEvent::Ready);
    Ok(())
}
