//! Transaction signing and submission with locally held keys
//!
//! This module provides:
//! - The `TransactionSigner` trait the executor submits through
//! - `InternalSigner`: nonce sequencing, gas price resolution, signing with
//!   key store keys, and receipt acquisition backed by a new-block index

mod blocks;
mod gas;
mod nonce;

pub use blocks::BlockIndex;
pub use gas::{auto_gas_limit, block_gas_cap, resolve_gas_price};
pub use nonce::NonceManager;

use crate::config::SignerConfig;
use crate::contracts::{Contract, ContractLoader, KeyStore};
use crate::error::{RuntimeError, RuntimeResult, TxContext};
use crate::metrics;
use crate::node::ChainNode;

use async_trait::async_trait;
use ethers::abi::Token;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{
    Address, Bytes, Signature, TransactionReceipt, TransactionRequest, H256, U256,
};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OnceCell, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Transaction fields forwarded to the node.
///
/// Nothing else survives option scrubbing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeOptions {
    pub from: Option<Address>,
    pub to: Option<Address>,
    pub gas_price: Option<U256>,
    pub gas: Option<U256>,
    pub value: Option<U256>,
    pub data: Option<Bytes>,
    pub nonce: Option<U256>,
}

/// Signs and submits transactions, resolving once they are mined
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TransactionSigner: Send + Sync {
    /// Call `function` on `contract`; `options.from` and `options.gas` are required
    async fn sign_and_execute_transaction(
        &self,
        contract: &Contract,
        function: &str,
        args: &[Token],
        options: &NodeOptions,
    ) -> RuntimeResult<TransactionReceipt>;

    /// Plain value transfer to `options.to`
    async fn sign_and_execute_send(&self, options: &NodeOptions)
        -> RuntimeResult<TransactionReceipt>;

    /// Deploy contract type `name` and return a handle at its new address
    async fn create_contract(
        &self,
        name: &str,
        args: &[Token],
        options: &NodeOptions,
    ) -> RuntimeResult<Contract>;

    async fn sign_message(&self, account: Address, message: &[u8]) -> RuntimeResult<Signature>;

    /// Uncompressed secp256k1 public key without the `0x04` tag, hex encoded
    async fn get_public_key(&self, account: Address) -> RuntimeResult<String>;
}

/// Signer using private keys from a `KeyStore`.
///
/// Owns the per-account nonce cache and the recent block index; a
/// background task feeds the index from the node's new-block subscription.
pub struct InternalSigner {
    node: RwLock<Arc<dyn ChainNode>>,
    key_store: Arc<dyn KeyStore>,
    contract_loader: Arc<dyn ContractLoader>,
    config: SignerConfig,
    chain_id: OnceCell<u64>,
    nonces: NonceManager,
    blocks: Arc<BlockIndex>,
    block_listener: Mutex<Option<JoinHandle<()>>>,
}

impl InternalSigner {
    /// Create the signer and start listening for new blocks
    pub fn new(
        node: Arc<dyn ChainNode>,
        key_store: Arc<dyn KeyStore>,
        contract_loader: Arc<dyn ContractLoader>,
        config: SignerConfig,
    ) -> Self {
        let blocks = Arc::new(BlockIndex::new(config.block_cache_size));
        let listener = spawn_block_listener(node.clone(), blocks.clone());

        Self {
            node: RwLock::new(node),
            key_store,
            contract_loader,
            config,
            chain_id: OnceCell::new(),
            nonces: NonceManager::new(),
            blocks,
            block_listener: Mutex::new(Some(listener)),
        }
    }

    /// Move to a new node connection.
    ///
    /// Pending receipt waiters keep their registrations and are served by
    /// the restarted block listener.
    pub async fn rebind(&self, node: Arc<dyn ChainNode>) {
        let listener = spawn_block_listener(node.clone(), self.blocks.clone());
        *self.node.write().await = node;
        let previous = self
            .block_listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(listener);
        if let Some(previous) = previous {
            previous.abort();
        }
        info!("Signer rebound to new node connection");
    }

    /// Stop the background block listener
    pub fn shutdown(&self) {
        if let Some(listener) = self
            .block_listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            listener.abort();
        }
    }

    async fn node(&self) -> Arc<dyn ChainNode> {
        self.node.read().await.clone()
    }

    pub fn blocks(&self) -> &BlockIndex {
        &self.blocks
    }

    pub async fn get_private_key(&self, account: Address) -> RuntimeResult<String> {
        self.key_store.private_key(account).await
    }

    /// Next nonce for `account`: `max(cached, node count)`
    pub async fn get_nonce(&self, account: Address) -> RuntimeResult<U256> {
        let node = self.node().await;
        let nonce = self.nonces.next_nonce(node.as_ref(), account).await?;
        debug!("Current nonce for {:?}: {}", account, nonce);
        Ok(nonce.into())
    }

    /// Configured gas price, else the node median (floored if the node reports 0)
    pub async fn get_gas_price(&self) -> RuntimeResult<U256> {
        let node = self.node().await;
        resolve_gas_price(
            node.as_ref(),
            self.config.gas_price.map(U256::from),
            U256::from(self.config.gas_price_floor),
        )
        .await
    }

    async fn chain_id(&self) -> RuntimeResult<u64> {
        let id = self
            .chain_id
            .get_or_try_init(|| async { self.node().await.chain_id().await })
            .await?;
        Ok(*id)
    }

    /// Wallet for `account`, verified against the account address
    async fn wallet(&self, account: Address) -> RuntimeResult<LocalWallet> {
        let key = self.get_private_key(account).await?;
        let wallet = LocalWallet::from_str(key.trim()).map_err(|e| RuntimeError::KeyStore {
            account,
            message: format!("invalid private key: {}", e),
        })?;
        if wallet.address() != account {
            return Err(RuntimeError::KeyStore {
                account,
                message: format!("private key belongs to {:?}", wallet.address()),
            });
        }
        Ok(wallet.with_chain_id(self.chain_id().await?))
    }

    async fn gas_price_for(&self, options: &NodeOptions) -> RuntimeResult<U256> {
        match options.gas_price {
            Some(price) => Ok(price),
            None => self.get_gas_price().await,
        }
    }

    async fn nonce_for(&self, account: Address, options: &NodeOptions) -> RuntimeResult<U256> {
        match options.nonce.and_then(nonce::explicit_nonce) {
            Some(nonce) => Ok(nonce.into()),
            None => self.get_nonce(account).await,
        }
    }

    /// Key, gas price and nonce resolved concurrently
    async fn prepare(
        &self,
        account: Address,
        options: &NodeOptions,
    ) -> RuntimeResult<(LocalWallet, U256, U256)> {
        tokio::try_join!(
            self.wallet(account),
            self.gas_price_for(options),
            self.nonce_for(account, options),
        )
    }

    /// Sign `request`, broadcast it and wait for a mined receipt
    async fn submit(
        &self,
        wallet: &LocalWallet,
        request: TransactionRequest,
    ) -> RuntimeResult<TransactionReceipt> {
        let tx: TypedTransaction = request.chain_id(wallet.chain_id()).into();
        let signature = wallet
            .sign_transaction(&tx)
            .await
            .map_err(|e| RuntimeError::KeyStore {
                account: wallet.address(),
                message: format!("signing failed: {}", e),
            })?;
        let raw = tx.rlp_signed(&signature);

        let hash = self.node().await.send_raw_transaction(raw).await?;
        metrics::record_tx_submitted();
        debug!("Submitted transaction {:?}", hash);

        self.wait_for_receipt(hash).await
    }

    /// Receipt of `hash` once it carries a block hash.
    ///
    /// Missing receipts are reloaded whenever the block index sees the
    /// transaction in a new block, or after the poll interval at the latest.
    /// Only the first round consults cached blocks; once the including block
    /// is known a lagging receipt is polled.
    pub async fn wait_for_receipt(&self, hash: H256) -> RuntimeResult<TransactionReceipt> {
        let poll_interval = Duration::from_millis(self.config.receipt_poll_interval_ms);
        let _pending = PendingReceipt {
            blocks: &self.blocks,
            hash,
        };

        let mut first_round = true;
        loop {
            let node = self.node().await;
            if let Some(receipt) = node.transaction_receipt(hash).await? {
                if receipt.block_hash.is_some() {
                    return Ok(receipt);
                }
            }

            let included = if first_round {
                self.blocks.watch(hash).await
            } else {
                self.blocks.watch_new_blocks(hash).await
            };
            first_round = false;
            tokio::select! {
                block = included => {
                    if let Ok(block) = block {
                        debug!(
                            "Transaction {:?} included in block {}, reloading receipt",
                            hash, block
                        );
                    }
                }
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
    }

    fn required(context: &TxContext, value: Option<U256>, field: &str) -> RuntimeResult<U256> {
        value.ok_or_else(|| RuntimeError::Validation {
            context: context.clone(),
            message: format!("option \"{}\" is required", field),
        })
    }

    fn sender(context: &TxContext, options: &NodeOptions) -> RuntimeResult<Address> {
        options.from.ok_or_else(|| RuntimeError::Validation {
            context: context.clone(),
            message: "option \"from\" is required".to_string(),
        })
    }
}

/// Removes the block index entry of a receipt wait however it ends
struct PendingReceipt<'a> {
    blocks: &'a BlockIndex,
    hash: H256,
}

impl Drop for PendingReceipt<'_> {
    fn drop(&mut self) {
        self.blocks.forget(self.hash);
    }
}

impl Drop for InternalSigner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[async_trait]
impl TransactionSigner for InternalSigner {
    async fn sign_and_execute_transaction(
        &self,
        contract: &Contract,
        function: &str,
        args: &[Token],
        options: &NodeOptions,
    ) -> RuntimeResult<TransactionReceipt> {
        debug!("Will sign tx for function \"{}\"", function);
        let context = TxContext::new(function)
            .contract(contract.address())
            .account(options.from);
        let from = Self::sender(&context, options)?;
        let gas = Self::required(&context, options.gas, "gas")?;
        let data = contract.encode_call(function, args)?;

        let (wallet, gas_price, nonce) = self.prepare(from, options).await?;
        debug!("Using gas price of {} wei", gas_price);

        let request = TransactionRequest::new()
            .from(from)
            .to(contract.address())
            .nonce(nonce)
            .gas(gas)
            .gas_price(gas_price)
            .value(options.value.unwrap_or_default())
            .data(data);
        self.submit(&wallet, request).await
    }

    async fn sign_and_execute_send(
        &self,
        options: &NodeOptions,
    ) -> RuntimeResult<TransactionReceipt> {
        debug!("Will sign tx for value transfer");
        let context = TxContext::new("send").account(options.from);
        let from = Self::sender(&context, options)?;
        let to = options.to.ok_or_else(|| RuntimeError::Validation {
            context: context.clone(),
            message: "option \"to\" is required".to_string(),
        })?;
        let gas = options
            .gas
            .unwrap_or_else(|| U256::from(self.config.default_send_gas));

        let (wallet, gas_price, nonce) = self.prepare(from, options).await?;

        let mut request = TransactionRequest::new()
            .from(from)
            .to(to)
            .nonce(nonce)
            .gas(gas)
            .gas_price(gas_price)
            .value(options.value.unwrap_or_default());
        if let Some(data) = &options.data {
            request = request.data(data.clone());
        }
        self.submit(&wallet, request).await
    }

    async fn create_contract(
        &self,
        name: &str,
        args: &[Token],
        options: &NodeOptions,
    ) -> RuntimeResult<Contract> {
        debug!("Will sign tx for contract creation of \"{}\"", name);
        let context = TxContext::new(format!("create:{}", name)).account(options.from);

        let compiled = self.contract_loader.compiled_contract(name).ok_or_else(|| {
            RuntimeError::ContractLoad(format!(
                "cannot find contract description for contract \"{}\"",
                name
            ))
        })?;
        if compiled.bytecode.is_empty() {
            return Err(RuntimeError::AbstractContract {
                name: name.to_string(),
            });
        }
        let data: Bytes = match &compiled.abi.constructor {
            Some(constructor) => constructor
                .encode_input(compiled.bytecode.to_vec(), args)
                .map_err(|e| RuntimeError::Abi(format!("constructor of {}: {}", name, e)))?
                .into(),
            None if args.is_empty() => compiled.bytecode.clone(),
            None => {
                return Err(RuntimeError::Abi(format!(
                    "{} has no constructor but {} arguments were given",
                    name,
                    args.len()
                )))
            }
        };

        let from = Self::sender(&context, options)?;
        let gas = Self::required(&context, options.gas, "gas")?;
        let (wallet, gas_price, nonce) = self.prepare(from, options).await?;

        let request = TransactionRequest::new()
            .from(from)
            .nonce(nonce)
            .gas(gas)
            .gas_price(gas_price)
            .value(options.value.unwrap_or_default())
            .data(data);
        let receipt = self.submit(&wallet, request).await.map_err(|e| {
            warn!("Could not sign contract creation of \"{}\": {}", name, e);
            e
        })?;

        let gas_used = receipt.gas_used.unwrap_or_default();
        if gas_used == gas {
            return Err(RuntimeError::Exhaustion {
                context,
                gas_given: gas,
                gas_used,
                transaction_hash: receipt.transaction_hash,
            });
        }
        let address = receipt
            .contract_address
            .ok_or_else(|| RuntimeError::Submission {
                context: context.clone(),
                message: "receipt carries no contract address".to_string(),
            })?;

        info!(
            "Contract creation of \"{}\" used {} gas, deployed at {:?}",
            name, gas_used, address
        );
        Ok(Contract::new(name, address, compiled.abi))
    }

    async fn sign_message(&self, account: Address, message: &[u8]) -> RuntimeResult<Signature> {
        let wallet = self.wallet(account).await?;
        wallet
            .sign_message(message)
            .await
            .map_err(|e| RuntimeError::KeyStore {
                account,
                message: format!("signing failed: {}", e),
            })
    }

    async fn get_public_key(&self, account: Address) -> RuntimeResult<String> {
        let wallet = self.wallet(account).await?;
        let point = wallet.signer().verifying_key().to_encoded_point(false);
        Ok(hex::encode(&point.as_bytes()[1..]))
    }
}

/// Feed the block index from the node's new-block subscription
fn spawn_block_listener(node: Arc<dyn ChainNode>, blocks: Arc<BlockIndex>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut subscription = match node.subscribe_blocks().await {
            Ok(subscription) => subscription,
            Err(e) => {
                warn!("Failed to subscribe to new blocks: {}", e);
                return;
            }
        };

        while let Some(number) = subscription.items.recv().await {
            match node.block_transactions(number).await {
                Ok(Some(transactions)) => {
                    blocks.record_block(number, transactions).await;
                }
                Ok(None) => debug!("Block {} not available yet", number),
                Err(e) => warn!("Failed to load block {}: {}", number, e),
            }
        }
        debug!("New block subscription ended");
    })
}
