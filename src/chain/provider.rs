//! EVM ledger client: signs bridge sends and follows them to inclusion

use super::{Chain, ConfirmationWatcher, LedgerClient, Receipt, SubmissionHandle, SubmitRequest};
use crate::config::{ChainConfig, Settings};
use crate::error::{LedgerError, LedgerResult};
use crate::events::RelayLogParser;
use crate::tx::{classify_send_error, BridgeCall};

use async_trait::async_trait;
use ethers::middleware::SignerMiddleware;
use ethers::providers::{Http, Middleware, Provider};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, H256};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

/// Everything needed to send from one chain to another
struct Route {
    rpc_url: String,
    bridge: Address,
    wallet: LocalWallet,
    destination_selector: u64,
}

/// `LedgerClient` backed by JSON-RPC endpoints and a local signing key
pub struct EvmLedgerClient {
    chains: HashMap<Chain, ChainConfig>,
    private_key: Option<String>,
    gas_limit: u64,
    poll_interval: Duration,
    confirmation_blocks: u64,
    max_receipt_errors: u32,
    max_unknown_polls: u32,
}

impl EvmLedgerClient {
    pub fn new(settings: &Settings) -> Self {
        let chains = Chain::ALL
            .into_iter()
            .filter_map(|chain| settings.chain(chain).map(|c| (chain, c.clone())))
            .collect();

        Self {
            chains,
            private_key: settings.wallet.private_key().map(str::to_string),
            gas_limit: settings.transfer.gas_limit,
            poll_interval: settings.transfer.poll_interval(),
            confirmation_blocks: settings.transfer.confirmation_blocks,
            max_receipt_errors: settings.transfer.max_receipt_errors,
            max_unknown_polls: settings.transfer.max_unknown_polls,
        }
    }

    fn chain_config(&self, chain: Chain) -> LedgerResult<&ChainConfig> {
        self.chains
            .get(&chain)
            .ok_or_else(|| LedgerError::Configuration(format!("no [chains.{}] section", chain)))
    }

    fn rpc_url(&self, chain: Chain) -> LedgerResult<&str> {
        self.chain_config(chain)?
            .rpc_url()
            .ok_or_else(|| LedgerError::Configuration(format!("RPC URL for {} is not set", chain)))
    }

    fn resolve(&self, source: Chain, destination: Chain) -> LedgerResult<Route> {
        let source_config = self.chain_config(source)?;
        let rpc_url = self.rpc_url(source)?.to_string();

        let bridge = source_config.bridge_address().ok_or_else(|| {
            LedgerError::Configuration(format!("bridge address for {} is not set", source))
        })?;
        let bridge = Address::from_str(bridge).map_err(|e| {
            LedgerError::Configuration(format!("bridge address for {} is invalid: {}", source, e))
        })?;

        let key = self
            .private_key
            .as_deref()
            .ok_or_else(|| LedgerError::Configuration("signing key is not set".to_string()))?;
        let wallet = LocalWallet::from_str(key)
            .map_err(|e| LedgerError::Configuration(format!("signing key is invalid: {}", e)))?
            .with_chain_id(source_config.chain_id);

        let selector = self.chain_config(destination)?.relay_selector().ok_or_else(|| {
            LedgerError::Configuration(format!("relay selector for {} is not set", destination))
        })?;
        let destination_selector = selector.parse::<u64>().map_err(|e| {
            LedgerError::Configuration(format!(
                "relay selector for {} is invalid: {}",
                destination, e
            ))
        })?;

        Ok(Route {
            rpc_url,
            bridge,
            wallet,
            destination_selector,
        })
    }

    fn http_provider(&self, chain: Chain, rpc_url: &str) -> LedgerResult<Provider<Http>> {
        Provider::<Http>::try_from(rpc_url)
            .map(|provider| provider.interval(self.poll_interval))
            .map_err(|e| {
                LedgerError::Configuration(format!("RPC URL for {} is invalid: {}", chain, e))
            })
    }
}

#[async_trait]
impl LedgerClient for EvmLedgerClient {
    fn ensure_configured(&self, source: Chain, destination: Chain) -> LedgerResult<()> {
        self.resolve(source, destination).map(|_| ())
    }

    async fn submit(&self, request: &SubmitRequest) -> LedgerResult<SubmissionHandle> {
        let route = self.resolve(request.source_chain, request.destination_chain)?;
        let provider = self.http_provider(request.source_chain, &route.rpc_url)?;

        let sender = route.wallet.address();
        let tx = BridgeCall::send_nft(
            route.bridge,
            route.destination_selector,
            &request.receiver,
            &request.asset_id,
        )?
        .into_request(sender, self.gas_limit);

        debug!(
            "Sending asset {} from {} to {} via bridge {:?}",
            request.asset_id, request.source_chain, request.destination_chain, route.bridge
        );

        let client = SignerMiddleware::new(provider, route.wallet);
        let pending = client
            .send_transaction(tx, None)
            .await
            .map_err(|e| classify_send_error(&e.to_string()))?;
        let tx_hash: H256 = *pending;

        info!(
            "Submitted bridge send on {}: {:?} (sender {:?})",
            request.source_chain, tx_hash, sender
        );

        Ok(SubmissionHandle {
            source_chain: request.source_chain,
            tx_hash: format!("{:?}", tx_hash),
            sender: format!("{:?}", sender),
        })
    }

    async fn await_confirmation(&self, handle: &SubmissionHandle) -> LedgerResult<Receipt> {
        let provider = self.http_provider(handle.source_chain, self.rpc_url(handle.source_chain)?)?;
        let tx_hash = H256::from_str(&handle.tx_hash).map_err(|e| {
            LedgerError::ReceiptUnavailable {
                tx_hash: handle.tx_hash.clone(),
                message: format!("not a transaction hash: {}", e),
            }
        })?;

        let watcher = ConfirmationWatcher::new(
            handle.source_chain,
            provider,
            self.confirmation_blocks,
            self.poll_interval,
            self.max_receipt_errors,
            self.max_unknown_polls,
        );
        let receipt = watcher.wait(tx_hash).await?;

        Ok(Receipt {
            tx_hash: handle.tx_hash.clone(),
            block_number: receipt.block_number.map(|b| b.as_u64()),
            logs: receipt.logs,
        })
    }

    fn extract_relay_message_id(&self, receipt: &Receipt) -> Option<String> {
        RelayLogParser::message_id(&receipt.logs)
    }
}
