//! In-memory chain node for unit tests

use crate::node::{ChainNode, NodeError, NodeResult, NodeSubscription};

use async_trait::async_trait;
use ethers::abi::{Event, Token};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{
    Address, BlockNumber, Bytes, Filter, FilterBlockOption, Log, TransactionReceipt,
    ValueOrArray, H256, U256, U64,
};
use ethers::utils::rlp::Rlp;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};

pub const CHAIN_ID: u64 = 1337;

/// Private key of the funded test account
pub const TEST_KEY: &str = "4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";

pub fn test_account() -> Address {
    TEST_KEY
        .parse::<LocalWallet>()
        .unwrap()
        .address()
}

/// A transaction accepted by the fake node
#[derive(Debug, Clone)]
pub struct SentTx {
    pub hash: H256,
    pub from: Address,
    pub to: Option<Address>,
    pub nonce: U256,
    pub gas: U256,
    pub gas_price: U256,
    pub value: U256,
    pub data: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MiningMode {
    /// Every transaction is mined into its own block on arrival
    Instant,
    /// Transactions wait in the mempool until `mine()` is called
    Manual,
}

type LogsForTx = Box<dyn Fn(&SentTx) -> Vec<Log> + Send + Sync>;

struct LogListener {
    id: u64,
    generation: u64,
    filter: Filter,
    tx: mpsc::UnboundedSender<Log>,
}

struct BlockListener {
    generation: u64,
    tx: mpsc::UnboundedSender<u64>,
}

struct FakeState {
    generation: u64,
    block_number: u64,
    blocks: BTreeMap<u64, Vec<H256>>,
    mempool: Vec<SentTx>,
    sent: Vec<SentTx>,
    receipts: HashMap<H256, TransactionReceipt>,
    tx_counts: HashMap<Address, u64>,
    history: Vec<Log>,
    gas_price: U256,
    gas_limit: U256,
    gas_used: U256,
    estimate: U256,
    estimate_error: Option<String>,
    call_result: Bytes,
    unsubscribe_error: Option<String>,
    receipt_lag: usize,
    mining: MiningMode,
    logs_for_tx: Option<LogsForTx>,
    next_listener_id: u64,
    log_listeners: Vec<LogListener>,
    block_listeners: Vec<BlockListener>,
}

struct Shared {
    state: Mutex<FakeState>,
    rpc_calls: AtomicUsize,
    receipt_calls: AtomicUsize,
    reconnect_tx: broadcast::Sender<Arc<dyn ChainNode>>,
}

/// In-memory `ChainNode`.
///
/// Clones created by `reconnect` share chain state but own their
/// subscriptions, like a fresh websocket to the same node.
pub struct FakeNode {
    shared: Arc<Shared>,
    generation: u64,
}

impl FakeNode {
    pub fn new() -> Arc<Self> {
        let (reconnect_tx, _) = broadcast::channel(4);
        Arc::new(Self {
            shared: Arc::new(Shared {
                state: Mutex::new(FakeState {
                    generation: 0,
                    block_number: 0,
                    blocks: BTreeMap::new(),
                    mempool: Vec::new(),
                    sent: Vec::new(),
                    receipts: HashMap::new(),
                    tx_counts: HashMap::new(),
                    history: Vec::new(),
                    gas_price: U256::from(20_000_000_000u64),
                    gas_limit: U256::from(8_000_000),
                    gas_used: U256::from(21_000),
                    estimate: U256::from(21_000),
                    estimate_error: None,
                    call_result: Bytes::default(),
                    unsubscribe_error: None,
                    receipt_lag: 0,
                    mining: MiningMode::Instant,
                    logs_for_tx: None,
                    next_listener_id: 0,
                    log_listeners: Vec::new(),
                    block_listeners: Vec::new(),
                }),
                rpc_calls: AtomicUsize::new(0),
                receipt_calls: AtomicUsize::new(0),
                reconnect_tx,
            }),
            generation: 0,
        })
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.shared.state.lock().unwrap()
    }

    fn count_call(&self) {
        self.shared.rpc_calls.fetch_add(1, Ordering::SeqCst);
    }

    pub fn rpc_calls(&self) -> usize {
        self.shared.rpc_calls.load(Ordering::SeqCst)
    }

    pub fn set_gas_price(&self, price: U256) {
        self.state().gas_price = price;
    }

    pub fn set_gas_limit(&self, limit: U256) {
        self.state().gas_limit = limit;
    }

    /// Gas consumed by mined transactions, capped at their gas limit
    pub fn set_gas_used(&self, gas: U256) {
        self.state().gas_used = gas;
    }

    pub fn set_estimate(&self, gas: U256) {
        self.state().estimate = gas;
    }

    pub fn fail_estimate(&self, message: &str) {
        self.state().estimate_error = Some(message.to_string());
    }

    pub fn set_call_result(&self, data: Vec<u8>) {
        self.state().call_result = data.into();
    }

    pub fn fail_unsubscribe(&self, message: &str) {
        self.state().unsubscribe_error = Some(message.to_string());
    }

    pub fn set_mining(&self, mode: MiningMode) {
        self.state().mining = mode;
    }

    pub fn set_transaction_count(&self, account: Address, count: u64) {
        self.state().tx_counts.insert(account, count);
    }

    /// Logs emitted when a transaction is mined
    pub fn on_mined(&self, logs: impl Fn(&SentTx) -> Vec<Log> + Send + Sync + 'static) {
        self.state().logs_for_tx = Some(Box::new(logs));
    }

    pub fn sent(&self) -> Vec<SentTx> {
        self.state().sent.clone()
    }

    /// Answer the next `calls` receipt requests for mined transactions with `None`
    pub fn lag_receipts(&self, calls: usize) {
        self.state().receipt_lag = calls;
    }

    pub fn receipt_calls(&self) -> usize {
        self.shared.receipt_calls.load(Ordering::SeqCst)
    }

    /// Live log listeners of all connections
    pub fn active_log_listeners(&self) -> usize {
        self.state().log_listeners.len()
    }

    /// Mine all mempool transactions into one new block
    pub fn mine(&self) -> u64 {
        let mut state = self.state();
        let pending = std::mem::take(&mut state.mempool);
        mine_block(&mut state, pending)
    }

    /// Mine an empty block
    pub fn mine_empty(&self) -> u64 {
        let mut state = self.state();
        mine_block(&mut state, Vec::new())
    }

    /// Emit `event` from `address` in a new block
    pub fn emit_event(&self, address: Address, event: &Event, args: &[Token]) -> Log {
        let mut state = self.state();
        let number = mine_block(&mut state, Vec::new());
        let log = event_log(address, event, args, number, H256::from_low_u64_be(0xe000 + number));
        publish_log(&mut state, log.clone());
        log
    }

    /// Publish `log` to matching listeners without mining a block
    pub fn emit_raw_log(&self, log: Log) {
        let mut state = self.state();
        publish_log(&mut state, log);
    }

    /// Drop this connection's subscriptions and announce a fresh connection
    pub fn reconnect(&self) -> Arc<FakeNode> {
        let node = {
            let mut state = self.state();
            state.generation += 1;
            let generation = state.generation;
            state.log_listeners.retain(|l| l.generation == generation);
            state.block_listeners.retain(|l| l.generation == generation);
            Arc::new(FakeNode {
                shared: self.shared.clone(),
                generation,
            })
        };
        let _ = self.shared.reconnect_tx.send(node.clone());
        node
    }
}

/// Log of `event` with non-indexed `args` as data
pub fn event_log(address: Address, event: &Event, args: &[Token], block: u64, tx: H256) -> Log {
    Log {
        address,
        topics: vec![event.signature()],
        data: ethers::abi::encode(args).into(),
        block_hash: Some(block_hash(block)),
        block_number: Some(U64::from(block)),
        transaction_hash: Some(tx),
        transaction_index: Some(U64::zero()),
        log_index: Some(U256::zero()),
        ..Default::default()
    }
}

fn block_hash(number: u64) -> H256 {
    H256::from_low_u64_be(number + 1)
}

fn mine_block(state: &mut FakeState, transactions: Vec<SentTx>) -> u64 {
    state.block_number += 1;
    let number = state.block_number;

    let mut hashes = Vec::new();
    let mut logs = Vec::new();
    for tx in transactions {
        let gas_used = state.gas_used.min(tx.gas);
        let receipt = TransactionReceipt {
            transaction_hash: tx.hash,
            block_hash: Some(block_hash(number)),
            block_number: Some(U64::from(number)),
            from: tx.from,
            to: tx.to,
            gas_used: Some(gas_used),
            contract_address: match tx.to {
                None => Some(ethers::utils::get_contract_address(tx.from, tx.nonce)),
                Some(_) => None,
            },
            status: Some(U64::one()),
            ..Default::default()
        };
        if let Some(logs_for_tx) = &state.logs_for_tx {
            for mut log in logs_for_tx(&tx) {
                log.block_number = Some(U64::from(number));
                log.block_hash = Some(block_hash(number));
                log.transaction_hash = Some(tx.hash);
                logs.push(log);
            }
        }
        state.receipts.insert(tx.hash, receipt);
        hashes.push(tx.hash);
    }
    state.blocks.insert(number, hashes);

    let generation = state.generation;
    state
        .block_listeners
        .retain(|l| l.generation == generation && l.tx.send(number).is_ok());
    for log in logs {
        publish_log(state, log);
    }
    number
}

fn publish_log(state: &mut FakeState, log: Log) {
    state.history.push(log.clone());
    state
        .log_listeners
        .retain(|l| !matches(&l.filter, &log) || l.tx.send(log.clone()).is_ok());
}

fn matches(filter: &Filter, log: &Log) -> bool {
    let address = match &filter.address {
        Some(ValueOrArray::Value(address)) => *address == log.address,
        Some(ValueOrArray::Array(addresses)) => addresses.contains(&log.address),
        None => true,
    };
    let topic = match &filter.topics[0] {
        Some(ValueOrArray::Value(Some(topic))) => log.topics.first() == Some(topic),
        Some(ValueOrArray::Array(topics)) => topics
            .iter()
            .flatten()
            .any(|topic| log.topics.first() == Some(topic)),
        _ => true,
    };
    let from_block = match &filter.block_option {
        FilterBlockOption::Range {
            from_block: Some(BlockNumber::Number(from)),
            ..
        } => log.block_number.map_or(false, |n| n >= *from),
        _ => true,
    };
    address && topic && from_block
}

#[async_trait]
impl ChainNode for FakeNode {
    async fn chain_id(&self) -> NodeResult<u64> {
        self.count_call();
        Ok(CHAIN_ID)
    }

    async fn transaction_count(&self, account: Address) -> NodeResult<U256> {
        self.count_call();
        Ok(self.state().tx_counts.get(&account).copied().unwrap_or(0).into())
    }

    async fn gas_price(&self) -> NodeResult<U256> {
        self.count_call();
        Ok(self.state().gas_price)
    }

    async fn latest_gas_limit(&self) -> NodeResult<U256> {
        self.count_call();
        Ok(self.state().gas_limit)
    }

    async fn block_transactions(&self, number: u64) -> NodeResult<Option<Vec<H256>>> {
        self.count_call();
        Ok(self.state().blocks.get(&number).cloned())
    }

    async fn estimate_gas(&self, _tx: &TypedTransaction) -> NodeResult<U256> {
        self.count_call();
        let state = self.state();
        match &state.estimate_error {
            Some(message) => Err(NodeError::Rpc(message.clone())),
            None => Ok(state.estimate),
        }
    }

    async fn call(&self, _tx: &TypedTransaction) -> NodeResult<Bytes> {
        self.count_call();
        Ok(self.state().call_result.clone())
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> NodeResult<H256> {
        self.count_call();
        let (tx, signature) = TypedTransaction::decode_signed(&Rlp::new(raw.as_ref()))
            .map_err(|e| NodeError::Rpc(format!("invalid raw transaction: {}", e)))?;
        let from = match tx.from() {
            Some(from) => *from,
            None => signature
                .recover(tx.sighash())
                .map_err(|e| NodeError::Rpc(format!("invalid signature: {}", e)))?,
        };
        let sent = SentTx {
            hash: H256::from(ethers::utils::keccak256(raw.as_ref())),
            from,
            to: tx.to().and_then(|to| to.as_address().copied()),
            nonce: tx.nonce().copied().unwrap_or_default(),
            gas: tx.gas().copied().unwrap_or_default(),
            gas_price: tx.gas_price().unwrap_or_default(),
            value: tx.value().copied().unwrap_or_default(),
            data: tx.data().cloned().unwrap_or_default(),
        };

        let mut state = self.state();
        *state.tx_counts.entry(from).or_insert(0) += 1;
        state.sent.push(sent.clone());
        match state.mining {
            MiningMode::Instant => {
                mine_block(&mut state, vec![sent.clone()]);
            }
            MiningMode::Manual => state.mempool.push(sent.clone()),
        }
        Ok(sent.hash)
    }

    async fn transaction_receipt(&self, hash: H256) -> NodeResult<Option<TransactionReceipt>> {
        self.count_call();
        self.shared.receipt_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state();
        let receipt = state.receipts.get(&hash).cloned();
        if receipt.is_some() && state.receipt_lag > 0 {
            state.receipt_lag -= 1;
            return Ok(None);
        }
        Ok(receipt)
    }

    async fn logs(&self, filter: &Filter) -> NodeResult<Vec<Log>> {
        self.count_call();
        Ok(self
            .state()
            .history
            .iter()
            .filter(|log| matches(filter, log))
            .cloned()
            .collect())
    }

    async fn subscribe_blocks(&self) -> NodeResult<NodeSubscription<u64>> {
        self.count_call();
        let (subscription, tx, cancel_rx) = NodeSubscription::channel();
        self.state().block_listeners.push(BlockListener {
            generation: self.generation,
            tx,
        });
        tokio::spawn(async move {
            if let Ok(reply) = cancel_rx.await {
                let _ = reply.send(Ok(()));
            }
        });
        Ok(subscription)
    }

    async fn subscribe_logs(&self, filter: Filter) -> NodeResult<NodeSubscription<Log>> {
        self.count_call();
        let (subscription, tx, cancel_rx) = NodeSubscription::channel();
        let id = {
            let mut state = self.state();
            state.next_listener_id += 1;
            let id = state.next_listener_id;
            state.log_listeners.push(LogListener {
                id,
                generation: self.generation,
                filter,
                tx,
            });
            id
        };

        let shared = self.shared.clone();
        tokio::spawn(async move {
            let reply = cancel_rx.await;
            let result = {
                let mut state = shared.state.lock().unwrap();
                state.log_listeners.retain(|l| l.id != id);
                match &state.unsubscribe_error {
                    Some(message) => Err(NodeError::Rpc(message.clone())),
                    None => Ok(()),
                }
            };
            if let Ok(reply) = reply {
                let _ = reply.send(result);
            }
        });
        Ok(subscription)
    }

    fn reconnects(&self) -> broadcast::Receiver<Arc<dyn ChainNode>> {
        self.shared.reconnect_tx.subscribe()
    }
}
