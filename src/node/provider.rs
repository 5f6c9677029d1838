//! Websocket node connection with push subscriptions and reconnect announcements

use super::{ChainNode, NodeError, NodeResult, NodeSubscription, UnsubscribeReply};

use async_trait::async_trait;
use ethers::prelude::*;
use ethers::providers::{Provider, SubscriptionStream, Ws};
use ethers::types::transaction::eip2718::TypedTransaction;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

/// Node reached over a single websocket connection.
///
/// The connection does not reconnect in place. When a push subscription
/// ends without being cancelled the connection is considered lost, a new
/// one is opened after `reconnect_delay` and announced through
/// [`ChainNode::reconnects`]; consumers move over to it explicitly.
pub struct EthersNode {
    provider: Arc<Provider<Ws>>,
    connection: Arc<ConnectionState>,
}

/// Per-connection loss flag plus the settings shared by all generations
struct ConnectionState {
    lost: AtomicBool,
    shared: Arc<ReconnectShared>,
}

struct ReconnectShared {
    ws_url: String,
    reconnect_delay: Duration,
    reconnect_tx: broadcast::Sender<Arc<dyn ChainNode>>,
}

impl EthersNode {
    /// Connect to the node's websocket endpoint
    pub async fn connect(ws_url: &str, reconnect_delay: Duration) -> NodeResult<Arc<Self>> {
        let provider = open(ws_url).await?;
        let (reconnect_tx, _) = broadcast::channel(16);
        let shared = Arc::new(ReconnectShared {
            ws_url: ws_url.to_string(),
            reconnect_delay,
            reconnect_tx,
        });

        info!("WebSocket connected to {}", ws_url);
        Ok(Arc::new(Self::with_provider(provider, shared)))
    }

    fn with_provider(provider: Provider<Ws>, shared: Arc<ReconnectShared>) -> Self {
        Self {
            provider: Arc::new(provider),
            connection: Arc::new(ConnectionState {
                lost: AtomicBool::new(false),
                shared,
            }),
        }
    }

    /// Underlying ethers provider
    pub fn provider(&self) -> &Provider<Ws> {
        &self.provider
    }
}

async fn open(ws_url: &str) -> NodeResult<Provider<Ws>> {
    // reconnects are handled by announcing a fresh connection, never inside the transport
    Provider::<Ws>::connect_with_reconnects(ws_url, 0)
        .await
        .map_err(|e| NodeError::Connection(format!("{}: {}", ws_url, e)))
}

fn rpc_err(e: impl Display) -> NodeError {
    NodeError::Rpc(e.to_string())
}

impl ConnectionState {
    /// Mark the connection as lost; only the first caller starts a reconnect
    fn lost(&self) {
        if self.lost.swap(true, Ordering::SeqCst) {
            return;
        }
        warn!(
            "Lost connection to {}, reconnecting in {:?}",
            self.shared.ws_url, self.shared.reconnect_delay
        );
        tokio::spawn(self.shared.clone().reconnect());
    }
}

impl ReconnectShared {
    async fn reconnect(self: Arc<Self>) {
        loop {
            tokio::time::sleep(self.reconnect_delay).await;

            match open(&self.ws_url).await {
                Ok(provider) => {
                    let node: Arc<dyn ChainNode> =
                        Arc::new(EthersNode::with_provider(provider, self.clone()));
                    info!("WebSocket reconnected to {}", self.ws_url);

                    if self.reconnect_tx.send(node).is_err() {
                        debug!("Reconnected without anyone listening for reconnects");
                    }
                    return;
                }
                Err(e) => warn!("Reconnect attempt failed: {}", e),
            }
        }
    }
}

/// Pump a subscription stream into an owned channel until it is cancelled,
/// the consumer goes away, or the stream ends with the connection
async fn forward<R, T>(
    stream: SubscriptionStream<'_, Ws, R>,
    items_tx: mpsc::UnboundedSender<T>,
    mut cancel_rx: oneshot::Receiver<UnsubscribeReply>,
    connection: Arc<ConnectionState>,
    map: impl Fn(R) -> Option<T>,
) where
    R: DeserializeOwned,
{
    let mut stream = Box::pin(stream);

    loop {
        tokio::select! {
            item = stream.next() => match item {
                Some(item) => {
                    if let Some(item) = map(item) {
                        if items_tx.send(item).is_err() {
                            break;
                        }
                    }
                }
                None => {
                    connection.lost();
                    return;
                }
            },
            reply = &mut cancel_rx => {
                let result = stream.unsubscribe().await.map(|_| ()).map_err(rpc_err);
                if let Ok(reply) = reply {
                    let _ = reply.send(result);
                }
                return;
            }
        }
    }

    if let Err(e) = stream.unsubscribe().await {
        debug!("Failed to release abandoned subscription: {}", e);
    }
}

#[async_trait]
impl ChainNode for EthersNode {
    async fn chain_id(&self) -> NodeResult<u64> {
        let id = self.provider.get_chainid().await.map_err(rpc_err)?;
        Ok(id.as_u64())
    }

    async fn transaction_count(&self, account: Address) -> NodeResult<U256> {
        self.provider
            .get_transaction_count(account, None)
            .await
            .map_err(rpc_err)
    }

    async fn gas_price(&self) -> NodeResult<U256> {
        self.provider.get_gas_price().await.map_err(rpc_err)
    }

    async fn latest_gas_limit(&self) -> NodeResult<U256> {
        let block = self
            .provider
            .get_block(BlockNumber::Latest)
            .await
            .map_err(rpc_err)?
            .ok_or_else(|| NodeError::Decode("No latest block".to_string()))?;
        Ok(block.gas_limit)
    }

    async fn block_transactions(&self, number: u64) -> NodeResult<Option<Vec<H256>>> {
        let block = self.provider.get_block(number).await.map_err(rpc_err)?;
        Ok(block.map(|b| b.transactions))
    }

    async fn estimate_gas(&self, tx: &TypedTransaction) -> NodeResult<U256> {
        self.provider.estimate_gas(tx, None).await.map_err(rpc_err)
    }

    async fn call(&self, tx: &TypedTransaction) -> NodeResult<Bytes> {
        self.provider.call(tx, None).await.map_err(rpc_err)
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> NodeResult<H256> {
        let pending = self
            .provider
            .send_raw_transaction(raw)
            .await
            .map_err(rpc_err)?;
        Ok(pending.tx_hash())
    }

    async fn transaction_receipt(&self, hash: H256) -> NodeResult<Option<TransactionReceipt>> {
        self.provider
            .get_transaction_receipt(hash)
            .await
            .map_err(rpc_err)
    }

    async fn logs(&self, filter: &Filter) -> NodeResult<Vec<Log>> {
        self.provider.get_logs(filter).await.map_err(rpc_err)
    }

    async fn subscribe_blocks(&self) -> NodeResult<NodeSubscription<u64>> {
        let (subscription, items_tx, cancel_rx) = NodeSubscription::channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let provider = self.provider.clone();
        let connection = self.connection.clone();

        tokio::spawn(async move {
            let stream = match provider.subscribe_blocks().await {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    stream
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(rpc_err(e)));
                    return;
                }
            };
            forward(stream, items_tx, cancel_rx, connection, |block: Block<H256>| {
                block.number.map(|n| n.as_u64())
            })
            .await;
        });

        ready_rx
            .await
            .map_err(|_| NodeError::Connection("block subscription task ended".to_string()))??;
        Ok(subscription)
    }

    async fn subscribe_logs(&self, filter: Filter) -> NodeResult<NodeSubscription<Log>> {
        let (subscription, items_tx, cancel_rx) = NodeSubscription::channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let provider = self.provider.clone();
        let connection = self.connection.clone();

        tokio::spawn(async move {
            let stream = match provider.subscribe_logs(&filter).await {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    stream
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(rpc_err(e)));
                    return;
                }
            };
            forward(stream, items_tx, cancel_rx, connection, Some).await;
        });

        ready_rx
            .await
            .map_err(|_| NodeError::Connection("log subscription task ended".to_string()))??;
        Ok(subscription)
    }

    fn reconnects(&self) -> broadcast::Receiver<Arc<dyn ChainNode>> {
        self.connection.shared.reconnect_tx.subscribe()
    }
}
