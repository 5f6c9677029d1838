//! Node module - the remote chain node as seen by the runtime
//!
//! This module provides:
//! - The `ChainNode` trait covering every RPC and push subscription the
//!   signer, executor and event hub rely on
//! - Owned push subscriptions that can be torn down explicitly
//! - An ethers websocket implementation that announces reconnects

pub mod provider;

pub use provider::EthersNode;

use async_trait::async_trait;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, Filter, Log, TransactionReceipt, H256, U256};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};

/// Transport level failures
#[derive(Error, Debug, Clone)]
pub enum NodeError {
    #[error("RPC request failed: {0}")]
    Rpc(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Unexpected node response: {0}")]
    Decode(String),
}

/// Result type for node requests
pub type NodeResult<T> = Result<T, NodeError>;

/// RPC and push-subscription surface of a remote node.
///
/// The node is the only source of truth for nonces, balances and
/// finality; implementations hold no chain state of their own.
#[async_trait]
pub trait ChainNode: Send + Sync {
    async fn chain_id(&self) -> NodeResult<u64>;

    /// Number of transactions sent from `account`, including pending ones
    async fn transaction_count(&self, account: Address) -> NodeResult<U256>;

    /// Median gas price of recent blocks
    async fn gas_price(&self) -> NodeResult<U256>;

    /// Gas limit of the latest block
    async fn latest_gas_limit(&self) -> NodeResult<U256>;

    /// Transaction hashes included in block `number`, `None` if the block is unknown
    async fn block_transactions(&self, number: u64) -> NodeResult<Option<Vec<H256>>>;

    async fn estimate_gas(&self, tx: &TypedTransaction) -> NodeResult<U256>;

    async fn call(&self, tx: &TypedTransaction) -> NodeResult<Bytes>;

    async fn send_raw_transaction(&self, raw: Bytes) -> NodeResult<H256>;

    async fn transaction_receipt(&self, hash: H256) -> NodeResult<Option<TransactionReceipt>>;

    async fn logs(&self, filter: &Filter) -> NodeResult<Vec<Log>>;

    /// Push subscription yielding the number of every new block header
    async fn subscribe_blocks(&self) -> NodeResult<NodeSubscription<u64>>;

    /// Push subscription yielding logs matching `filter` from now on
    async fn subscribe_logs(&self, filter: Filter) -> NodeResult<NodeSubscription<Log>>;

    /// Announces the replacement connection after the transport reconnected
    fn reconnects(&self) -> broadcast::Receiver<Arc<dyn ChainNode>>;
}

pub(crate) type UnsubscribeReply = oneshot::Sender<NodeResult<()>>;

/// An owned push subscription against the node
pub struct NodeSubscription<T> {
    pub items: mpsc::UnboundedReceiver<T>,
    pub handle: SubscriptionHandle,
}

impl<T> NodeSubscription<T> {
    /// Create a subscription together with the producer side used by node
    /// implementations: the item sender and the cancellation receiver
    pub fn channel() -> (
        Self,
        mpsc::UnboundedSender<T>,
        oneshot::Receiver<UnsubscribeReply>,
    ) {
        let (items_tx, items) = mpsc::unbounded_channel();
        let (cancel, cancel_rx) = oneshot::channel();
        let subscription = Self {
            items,
            handle: SubscriptionHandle { cancel },
        };
        (subscription, items_tx, cancel_rx)
    }
}

/// Tears down the node-side subscription
pub struct SubscriptionHandle {
    cancel: oneshot::Sender<UnsubscribeReply>,
}

impl SubscriptionHandle {
    /// Release the node-side subscription and wait for the node's answer.
    ///
    /// A producer that is already gone (closed connection) has nothing
    /// left to release and counts as success.
    pub async fn unsubscribe(self) -> NodeResult<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.cancel.send(reply_tx).is_err() {
            return Ok(());
        }
        reply_rx.await.unwrap_or(Ok(()))
    }
}
