//! Transaction lifecycle orchestration
//!
//! This module provides:
//! - Read-only contract calls with address and method validation
//! - Contract transactions: estimate, auto gas, sign and submit through a
//!   `TransactionSigner`, exhaustion check, optional event correlation
//! - Value transfers and contract creation with the same accounting
//!
//! Each call runs under one deadline. Expiry only stops local waiting;
//! a transaction already broadcast may still be mined.

mod options;

pub use options::{scrub_options, EventResultFn, EventTarget, NodeOptions, TxOptions, TxOutcome};

use crate::config::ExecutorConfig;
use crate::contracts::{Contract, ContractRef};
use crate::error::{RuntimeError, RuntimeResult, TxContext};
use crate::events::{ContractEvent, EventHub, FromBlock, SubscriptionId, Unsubscribe};
use crate::logging::{GasLog, GasLogRecord, GasLogStatus};
use crate::metrics;
use crate::node::ChainNode;
use crate::signer::{auto_gas_limit, TransactionSigner};

use ethers::abi::Token;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, TransactionReceipt, TransactionRequest, H256, U256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Event subscription owned by one in-flight transaction
struct EventWatch {
    hub: EventHub,
    id: SubscriptionId,
    events: mpsc::UnboundedReceiver<ContractEvent>,
    /// Events of other transactions, or of ours before its hash was known
    buffered: HashMap<H256, ContractEvent>,
}

impl EventWatch {
    /// The watched event emitted by transaction `hash`
    async fn matching(&mut self, hash: H256) -> Option<ContractEvent> {
        if let Some(event) = self.buffered.remove(&hash) {
            return Some(event);
        }
        while let Some(event) = self.events.recv().await {
            match event.transaction_hash {
                Some(tx) if tx == hash => return Some(event),
                Some(tx) => {
                    self.buffered.insert(tx, event);
                }
                None => {}
            }
        }
        None
    }

    async fn close(self) {
        if let Err(e) = self.hub.unsubscribe(Unsubscribe::Subscription(self.id)).await {
            error!("Error while unsubscribing from transaction event: {}", e);
        }
    }
}

/// Runs contract calls, transactions, sends and deployments
pub struct Executor {
    node: RwLock<Arc<dyn ChainNode>>,
    signer: Option<Arc<dyn TransactionSigner>>,
    event_hub: RwLock<Option<EventHub>>,
    config: ExecutorConfig,
    defaults: TxOptions,
    gas_log: GasLog,
}

impl Executor {
    /// Without a signer the executor serves read-only calls only
    pub fn new(
        node: Arc<dyn ChainNode>,
        signer: Option<Arc<dyn TransactionSigner>>,
        config: ExecutorConfig,
    ) -> Self {
        let defaults = TxOptions {
            gas: config.gas.map(U256::from),
            gas_price: config.gas_price.map(U256::from),
            timeout: Some(config.timeout_ms),
            ..Default::default()
        };
        let gas_log = GasLog::new(config.gas_log_capacity);

        Self {
            node: RwLock::new(node),
            signer,
            event_hub: RwLock::new(None),
            config,
            defaults,
            gas_log,
        }
    }

    /// Attach the hub used for transaction events
    pub async fn init(&self, event_hub: EventHub) {
        *self.event_hub.write().await = Some(event_hub);
    }

    pub async fn rebind(&self, node: Arc<dyn ChainNode>) {
        *self.node.write().await = node;
        debug!("Executor rebound to new node connection");
    }

    pub fn gas_log(&self) -> &GasLog {
        &self.gas_log
    }

    async fn node(&self) -> Arc<dyn ChainNode> {
        self.node.read().await.clone()
    }

    fn signer(&self) -> RuntimeResult<Arc<dyn TransactionSigner>> {
        self.signer
            .clone()
            .ok_or_else(|| RuntimeError::Configuration("signer is undefined".to_string()))
    }

    /// Contract must have a non-zero address and support `function`
    fn validate(
        contract: &Contract,
        function: &str,
        from: Option<Address>,
    ) -> RuntimeResult<TxContext> {
        let context = TxContext::new(function)
            .contract(contract.address())
            .account(from);
        if contract.address().is_zero() {
            return Err(RuntimeError::Validation {
                context,
                message: "invalid contract address".to_string(),
            });
        }
        if !contract.has_method(function) {
            return Err(RuntimeError::Validation {
                message: format!(
                    "contract does not support method \"{}\", supported methods are {}",
                    function,
                    contract.methods().join(",")
                ),
                context,
            });
        }
        Ok(context)
    }

    /// Read-only call of `function`, returning its decoded outputs
    pub async fn execute_contract_call(
        &self,
        contract: &Contract,
        function: &str,
        args: Vec<Token>,
        options: Option<TxOptions>,
    ) -> RuntimeResult<Vec<Token>> {
        debug!("Starting contract call \"{}\"", function);
        let options = options.unwrap_or_default();
        Self::validate(contract, function, options.from)?;
        let options = options.merged_over(&self.defaults);

        let data = contract.encode_call(function, &args)?;
        let tx: TypedTransaction = node_request(&scrub_options(&options))
            .to(contract.address())
            .data(data)
            .into();
        let output = self.node().await.call(&tx).await?;
        contract.decode_output(function, &output)
    }

    /// Submit a transaction calling `function` and wait until it is mined.
    ///
    /// With `options.event` set, resolves to the event the transaction
    /// emitted, or to the value `options.event_result` derives from it.
    pub async fn execute_contract_transaction(
        &self,
        contract: &Contract,
        function: &str,
        options: TxOptions,
        args: Vec<Token>,
    ) -> RuntimeResult<TxOutcome> {
        debug!("Starting contract transaction \"{}\"", function);
        let signer = self.signer()?;
        let context = Self::validate(contract, function, options.from)?;
        let auto_gas = options.auto_gas.or(self.config.auto_gas_default());
        let requested_gas = options.gas;
        let options = options.merged_over(&self.defaults);
        let deadline_ms = options.deadline_ms(self.config.timeout_ms);
        let started = Instant::now();

        let mut watch = match &options.event {
            Some(target) => Some(self.watch_event(target, contract).await?),
            None => None,
        };

        let log = GasLogRecord::new(
            Some(function),
            Some(contract.address()),
            options.from,
            &args,
            options.gas,
        );
        let pipeline = async {
            let node = self.node().await;
            let data = contract.encode_call(function, &args)?;
            let estimation: TypedTransaction = node_request(&scrub_options(&options))
                .to(contract.address())
                .data(data)
                .into();
            let estimate = node.estimate_gas(&estimation).await.map_err(|source| {
                self.gas_log.log(
                    log.clone()
                        .status(GasLogStatus::Error)
                        .message(format!("could not estimate; {}", source)),
                );
                RuntimeError::Estimation {
                    context: context.clone(),
                    source,
                }
            })?;
            if options.estimate {
                return Ok(TxOutcome::Estimated(estimate));
            }
            if !options.force && requested_gas == Some(estimate) {
                self.gas_log.log(
                    log.clone()
                        .status(GasLogStatus::Error)
                        .estimated(Some(estimate))
                        .message("out of gas estimated"),
                );
                return Err(RuntimeError::SpeculativeFailure {
                    context: context.clone(),
                    gas: estimate,
                });
            }

            let mut node_options = scrub_options(&options);
            if let Some(multiplier) = auto_gas {
                let gas = self.auto_gas(node.as_ref(), estimate, multiplier).await?;
                self.gas_log.log(
                    log.clone()
                        .status(GasLogStatus::AutoGasEstimation)
                        .estimated(Some(estimate))
                        .given(Some(gas))
                        .message(format!("estimated with {}", multiplier)),
                );
                node_options.gas = Some(gas);
            }
            let log = log.clone().given(node_options.gas).estimated(Some(estimate));

            let receipt = signer
                .sign_and_execute_transaction(contract, function, &args, &node_options)
                .await
                .map_err(|e| {
                    error!("{} failed: {}", context, e);
                    self.gas_log.log(
                        log.clone()
                            .status(GasLogStatus::Error)
                            .message("transaction submit error"),
                    );
                    e.into_submission(&context)
                })?;
            self.check_gas(&context, &receipt, node_options.gas, auto_gas, &log)?;

            let Some(watch) = watch.as_mut() else {
                return Ok(TxOutcome::Mined(receipt));
            };
            match watch.matching(receipt.transaction_hash).await {
                Some(event) => match &options.event_result {
                    Some(derive) => Ok(TxOutcome::EventResult(derive(&event))),
                    None => Ok(TxOutcome::Event(event)),
                },
                None => Err(RuntimeError::Submission {
                    context: context.clone(),
                    message: "event subscription closed before the event arrived".to_string(),
                }),
            }
        };

        let result = self.within(deadline_ms, &context, &log, pipeline).await;
        if let Some(watch) = watch {
            watch.close().await;
        }
        self.account(&result, started);
        result
    }

    /// Transfer value to `options.to`
    pub async fn execute_send(&self, options: TxOptions) -> RuntimeResult<TransactionReceipt> {
        debug!("Starting value transfer");
        let signer = self.signer()?;
        let context = TxContext::new("send").account(options.from);
        let auto_gas = options.auto_gas;
        let options = options.merged_over(&self.defaults);
        let deadline_ms = options.deadline_ms(self.config.timeout_ms);
        let started = Instant::now();

        let log = GasLogRecord::new(None, options.to, options.from, &[], options.gas);
        let pipeline = async {
            let mut node_options = scrub_options(&options);
            let mut log = log.clone();

            if auto_gas.is_some() || options.estimate {
                let node = self.node().await;
                let estimation: TypedTransaction = node_request(&node_options).into();
                let estimate = node.estimate_gas(&estimation).await.map_err(|source| {
                    RuntimeError::Estimation {
                        context: context.clone(),
                        source,
                    }
                })?;
                log = log.estimated(Some(estimate));
                if let Some(multiplier) = auto_gas {
                    let gas = self.auto_gas(node.as_ref(), estimate, multiplier).await?;
                    node_options.gas = Some(gas);
                    log = log.given(node_options.gas);
                }
            }

            let receipt = signer
                .sign_and_execute_send(&node_options)
                .await
                .map_err(|e| {
                    error!("{} failed: {}", context, e);
                    self.gas_log.log(
                        log.clone()
                            .status(GasLogStatus::Error)
                            .message("transaction submit error"),
                    );
                    e.into_submission(&context)
                })?;
            self.check_gas(&context, &receipt, node_options.gas, None, &log)?;
            Ok::<_, RuntimeError>(receipt)
        };

        let result = self.within(deadline_ms, &context, &log, pipeline).await;
        self.account(&result, started);
        result
    }

    /// Deploy contract type `name`
    pub async fn create_contract(
        &self,
        name: &str,
        args: Vec<Token>,
        options: TxOptions,
    ) -> RuntimeResult<Contract> {
        debug!("Starting contract creation of \"{}\"", name);
        let signer = self.signer()?;
        let options = options.merged_over(&self.defaults);
        let started = Instant::now();

        let result = signer
            .create_contract(name, &args, &scrub_options(&options))
            .await;
        self.account(&result, started);
        result
    }

    /// Subscribe to the transaction's event before anything is broadcast
    async fn watch_event(
        &self,
        target: &EventTarget,
        contract: &Contract,
    ) -> RuntimeResult<EventWatch> {
        let hub = self.event_hub.read().await.clone().ok_or_else(|| {
            RuntimeError::Configuration(
                "passed an event to a transaction but no event hub registered".to_string(),
            )
        })?;

        let address = match (&target.target_address, &target.target) {
            (Some(address), _) => *address,
            (None, ContractRef::Loaded(loaded)) => loaded.address(),
            (None, ContractRef::Named(_)) => contract.address(),
        };
        let (tx, events) = mpsc::unbounded_channel();
        let id = hub
            .subscribe(
                target.target.clone(),
                address,
                &target.event_name,
                crate::events::accept_all(),
                crate::events::event_handler(move |event| {
                    let tx = tx.clone();
                    async move {
                        // receiver gone once the transaction resolved
                        let _ = tx.send(event);
                        Ok(())
                    }
                }),
                FromBlock::Latest,
            )
            .await?;

        Ok(EventWatch {
            hub,
            id,
            events,
            buffered: HashMap::new(),
        })
    }

    async fn auto_gas(
        &self,
        node: &dyn ChainNode,
        estimate: U256,
        multiplier: f64,
    ) -> RuntimeResult<U256> {
        let block_limit = node.latest_gas_limit().await?;
        let gas = auto_gas_limit(estimate, multiplier, block_limit);
        debug!(
            "Auto gas {} for estimate {} (multiplier {}, block limit {})",
            gas, estimate, multiplier, block_limit
        );
        Ok(gas)
    }

    /// A receipt using all given gas counts as failed
    fn check_gas(
        &self,
        context: &TxContext,
        receipt: &TransactionReceipt,
        gas_given: Option<U256>,
        auto_gas: Option<f64>,
        log: &GasLogRecord,
    ) -> RuntimeResult<()> {
        let gas_used = receipt.gas_used.unwrap_or_default();
        let log = log
            .clone()
            .used(gas_used)
            .hash(Some(receipt.transaction_hash));
        let exhausted = gas_given == Some(gas_used);

        if let Some(multiplier) = auto_gas {
            let status = if exhausted {
                GasLogStatus::AutoGasError
            } else {
                GasLogStatus::AutoGasSuccess
            };
            self.gas_log.log(
                log.clone()
                    .status(status)
                    .message(format!("estimated with {}", multiplier)),
            );
        }

        if !exhausted {
            self.gas_log.log(log.status(GasLogStatus::Success));
            return Ok(());
        }
        error!("{} failed: all gas used up", context);
        self.gas_log.log(
            log.status(GasLogStatus::Error)
                .message("transaction failed"),
        );
        Err(RuntimeError::Exhaustion {
            context: context.clone(),
            gas_given: gas_given.unwrap_or(gas_used),
            gas_used,
            transaction_hash: receipt.transaction_hash,
        })
    }

    /// Run `pipeline` under a deadline of `deadline_ms`
    async fn within<T>(
        &self,
        deadline_ms: u64,
        context: &TxContext,
        log: &GasLogRecord,
        pipeline: impl std::future::Future<Output = RuntimeResult<T>>,
    ) -> RuntimeResult<T> {
        match tokio::time::timeout(Duration::from_millis(deadline_ms), pipeline).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Timeout after {}ms during {}", deadline_ms, context);
                self.gas_log.log(
                    log.clone()
                        .status(GasLogStatus::Error)
                        .message("timeout"),
                );
                Err(RuntimeError::Timeout {
                    context: context.clone(),
                    timeout_ms: deadline_ms,
                })
            }
        }
    }

    fn account<T>(&self, result: &RuntimeResult<T>, started: Instant) {
        match result {
            Ok(_) => {
                let elapsed = started.elapsed().as_secs_f64();
                metrics::record_tx_succeeded(elapsed);
                info!("Executor call finished after {:.3}s", elapsed);
            }
            Err(e) => metrics::record_tx_failed(e.kind()),
        }
    }
}

/// Transaction request carrying the scrubbed options
fn node_request(options: &NodeOptions) -> TransactionRequest {
    TransactionRequest {
        from: options.from,
        to: options.to.map(Into::into),
        gas: options.gas,
        gas_price: options.gas_price,
        value: options.value,
        data: options.data.clone(),
        nonce: options.nonce,
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EventHubConfig, SignerConfig};
    use crate::contracts::fixtures::TEST_CONTRACTS;
    use crate::contracts::{AccountStore, ContractLoader, StaticContractLoader, StaticNameResolver};
    use crate::signer::{InternalSigner, MockTransactionSigner};
    use crate::testing::{event_log, test_account, FakeNode, TEST_KEY};

    fn loader() -> Arc<StaticContractLoader> {
        Arc::new(StaticContractLoader::from_json(TEST_CONTRACTS).unwrap())
    }

    fn signer_on(node: &Arc<FakeNode>) -> Arc<dyn TransactionSigner> {
        let store = AccountStore::new(HashMap::from([(test_account(), TEST_KEY.to_string())]));
        Arc::new(InternalSigner::new(
            node.clone(),
            Arc::new(store),
            loader(),
            SignerConfig::default(),
        ))
    }

    fn executor_on(node: &Arc<FakeNode>, config: ExecutorConfig) -> Executor {
        Executor::new(node.clone(), Some(signer_on(node)), config)
    }

    async fn with_hub(node: &Arc<FakeNode>, executor: &Executor) -> EventHub {
        let hub = EventHub::new(
            node.clone(),
            loader(),
            Arc::new(StaticNameResolver::default()),
            EventHubConfig::default(),
        );
        executor.init(hub.clone()).await;
        hub
    }

    fn contract(name: &str, address: Address) -> Contract {
        loader().load_contract(name, address).unwrap()
    }

    const CONTRACT: Address = Address::repeat_byte(0x42);

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_sends_get_contiguous_nonces() {
        let node = FakeNode::new();
        let executor = Arc::new(executor_on(&node, ExecutorConfig::default()));

        let handles: Vec<_> = (0..50)
            .map(|_| {
                let executor = executor.clone();
                tokio::spawn(async move {
                    executor
                        .execute_send(
                            TxOptions::new()
                                .from(test_account())
                                .to(Address::repeat_byte(0x55))
                                .value(0u64)
                                .gas(21_001u64),
                        )
                        .await
                })
            })
            .collect();
        for handle in handles {
            let receipt = handle.await.unwrap().unwrap();
            assert!(receipt.gas_used.unwrap() < U256::from(21_001));
        }

        let mut nonces: Vec<u64> = node.sent().iter().map(|tx| tx.nonce.as_u64()).collect();
        nonces.sort_unstable();
        assert_eq!(nonces, (0..50).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_call_on_zero_address_rejected_before_rpc() {
        let node = FakeNode::new();
        let executor = executor_on(&node, ExecutorConfig::default());
        let calls_before = node.rpc_calls();

        let err = executor
            .execute_contract_call(&contract("Owned", Address::zero()), "owner", vec![], None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation");
        assert_eq!(node.rpc_calls(), calls_before);
    }

    #[tokio::test]
    async fn test_unknown_method_lists_supported_methods() {
        let node = FakeNode::new();
        let executor = executor_on(&node, ExecutorConfig::default());

        let err = executor
            .execute_contract_transaction(
                &contract("Owned", CONTRACT),
                "selfDestruct",
                TxOptions::new().from(test_account()),
                vec![],
            )
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("selfDestruct"));
        assert!(message.contains("owner,transferOwnership"));
    }

    #[tokio::test]
    async fn test_contract_call_decodes_output() {
        let node = FakeNode::new();
        let owner = Address::repeat_byte(0x0a);
        node.set_call_result(ethers::abi::encode(&[Token::Address(owner)]));
        let executor = Executor::new(node.clone(), None, ExecutorConfig::default());

        let output = executor
            .execute_contract_call(&contract("Owned", CONTRACT), "owner", vec![], None)
            .await
            .unwrap();
        assert_eq!(output, vec![Token::Address(owner)]);
    }

    #[tokio::test]
    async fn test_read_only_executor_rejects_transactions() {
        let node = FakeNode::new();
        let executor = Executor::new(node.clone(), None, ExecutorConfig::default());

        let err = executor
            .execute_send(TxOptions::new().from(test_account()).to(CONTRACT))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_transaction_applies_auto_gas() {
        let node = FakeNode::new();
        let executor = executor_on(&node, ExecutorConfig::default());

        let outcome = executor
            .execute_contract_transaction(
                &contract("Owned", CONTRACT),
                "transferOwnership",
                TxOptions::new().from(test_account()),
                vec![Token::Address(Address::repeat_byte(0x0b))],
            )
            .await
            .unwrap();
        assert!(matches!(outcome, TxOutcome::Mined(_)));
        assert_eq!(node.sent()[0].gas, U256::from(23_100));

        let statuses: Vec<_> = executor.gas_log().recent().iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![
                GasLogStatus::AutoGasEstimation,
                GasLogStatus::AutoGasSuccess,
                GasLogStatus::Success
            ]
        );
    }

    #[tokio::test]
    async fn test_exhausted_gas_is_failure() {
        let node = FakeNode::new();
        node.set_gas_used(U256::from(u64::MAX));
        let executor = executor_on(&node, ExecutorConfig::default());

        let err = executor
            .execute_contract_transaction(
                &contract("Owned", CONTRACT),
                "transferOwnership",
                TxOptions::new().from(test_account()),
                vec![Token::Address(Address::repeat_byte(0x0b))],
            )
            .await
            .unwrap_err();
        match err {
            RuntimeError::Exhaustion { gas_used, .. } => assert_eq!(gas_used, U256::from(23_100)),
            other => panic!("unexpected error {:?}", other),
        }
        let last = executor.gas_log().recent().pop().unwrap();
        assert_eq!(last.status, GasLogStatus::Error);
    }

    #[tokio::test]
    async fn test_gas_equal_to_estimate_is_speculative_failure() {
        let node = FakeNode::new();
        let executor = executor_on(&node, ExecutorConfig::default());
        let owned = contract("Owned", CONTRACT);
        let call = |options: TxOptions| {
            executor.execute_contract_transaction(
                &owned,
                "transferOwnership",
                options,
                vec![Token::Address(Address::repeat_byte(0x0b))],
            )
        };

        let err = call(TxOptions::new().from(test_account()).gas(21_000u64))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "speculative_failure");
        assert!(node.sent().is_empty());

        call(TxOptions::new().from(test_account()).gas(21_000u64).force())
            .await
            .unwrap();
        assert_eq!(node.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_estimate_only_submits_nothing() {
        let node = FakeNode::new();
        node.set_estimate(U256::from(45_000));
        let executor = executor_on(&node, ExecutorConfig::default());

        let outcome = executor
            .execute_contract_transaction(
                &contract("Owned", CONTRACT),
                "transferOwnership",
                TxOptions::new().from(test_account()).estimate(),
                vec![Token::Address(Address::repeat_byte(0x0b))],
            )
            .await
            .unwrap();
        assert_eq!(outcome, TxOutcome::Estimated(U256::from(45_000)));
        assert!(node.sent().is_empty());
    }

    #[tokio::test]
    async fn test_estimation_failure() {
        let node = FakeNode::new();
        node.fail_estimate("execution reverted");
        let executor = executor_on(&node, ExecutorConfig::default());

        let err = executor
            .execute_contract_transaction(
                &contract("Owned", CONTRACT),
                "transferOwnership",
                TxOptions::new().from(test_account()),
                vec![Token::Address(Address::repeat_byte(0x0b))],
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "estimation");
        assert!(err.to_string().contains("execution reverted"));
    }

    #[tokio::test]
    async fn test_transaction_resolves_with_its_event() {
        let node = FakeNode::new();
        let executor = executor_on(&node, ExecutorConfig::default());
        let hub = with_hub(&node, &executor).await;
        let target = contract("TestContractEvent", CONTRACT);
        let fired = target.event("EventFired").unwrap().clone();
        node.on_mined(move |_| vec![event_log(CONTRACT, &fired, &[Token::Bool(true)], 0, H256::zero())]);

        let outcome = executor
            .execute_contract_transaction(
                &target,
                "fireEvent",
                TxOptions::new()
                    .from(test_account())
                    .event(&target, "EventFired"),
                vec![],
            )
            .await
            .unwrap();
        let TxOutcome::Event(event) = outcome else {
            panic!("expected the matched event");
        };
        assert_eq!(event.transaction_hash, Some(node.sent()[0].hash));
        assert_eq!(hub.subscription_count(), 0);

        let outcome = executor
            .execute_contract_transaction(
                &target,
                "fireEvent",
                TxOptions::new()
                    .from(test_account())
                    .event("TestContractEvent", "EventFired")
                    .event_result(|event| event.arg("fired").cloned().unwrap_or(Token::Bool(false))),
                vec![],
            )
            .await
            .unwrap();
        assert_eq!(outcome, TxOutcome::EventResult(Token::Bool(true)));
        assert_eq!(hub.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_event_without_hub_is_configuration_error() {
        let node = FakeNode::new();
        let executor = executor_on(&node, ExecutorConfig::default());
        let target = contract("TestContractEvent", CONTRACT);

        let err = executor
            .execute_contract_transaction(
                &target,
                "fireEvent",
                TxOptions::new().from(test_account()).event(&target, "EventFired"),
                vec![],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Configuration(_)));
        assert!(node.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_timeout_removes_subscription() {
        let node = FakeNode::new();
        let executor = executor_on(&node, ExecutorConfig::default());
        let hub = with_hub(&node, &executor).await;
        let target = contract("TestContractEvent", CONTRACT);
        let started = Instant::now();

        let err = executor
            .execute_contract_transaction(
                &target,
                "fireEvent",
                TxOptions::new()
                    .from(test_account())
                    .event(&target, "EventFired")
                    .event_timeout(15_000),
                vec![],
            )
            .await
            .unwrap_err();

        assert!(matches!(err, RuntimeError::Timeout { timeout_ms: 15_000, .. }));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(15_000));
        assert!(elapsed < Duration::from_millis(16_000));
        assert_eq!(hub.subscription_count(), 0);
        assert_eq!(hub.listener_count(), 0);
        assert_eq!(node.active_log_listeners(), 0);
        // broadcast is not retracted
        assert_eq!(node.sent().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_cleanup_keeps_timeout_error() {
        let node = FakeNode::new();
        let executor = executor_on(&node, ExecutorConfig::default());
        let hub = with_hub(&node, &executor).await;
        let target = contract("TestContractEvent", CONTRACT);
        node.fail_unsubscribe("connection reset");

        let err = executor
            .execute_contract_transaction(
                &target,
                "fireEvent",
                TxOptions::new()
                    .from(test_account())
                    .event(&target, "EventFired")
                    .event_timeout(2_000),
                vec![],
            )
            .await
            .unwrap_err();

        assert!(matches!(err, RuntimeError::Timeout { timeout_ms: 2_000, .. }));
        assert_eq!(hub.subscription_count(), 0);
        let last = executor.gas_log().recent().pop().unwrap();
        assert_eq!(last.message.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn test_exhausted_send_is_failure() {
        let node = FakeNode::new();
        node.set_gas_used(U256::from(u64::MAX));
        let executor = executor_on(&node, ExecutorConfig::default());

        let err = executor
            .execute_send(
                TxOptions::new()
                    .from(test_account())
                    .to(Address::repeat_byte(0x55))
                    .value(7u64)
                    .gas(21_001u64),
            )
            .await
            .unwrap_err();
        match err {
            RuntimeError::Exhaustion {
                gas_given,
                gas_used,
                ..
            } => {
                assert_eq!(gas_given, U256::from(21_001));
                assert_eq!(gas_used, U256::from(21_001));
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(node.sent()[0].value, U256::from(7));
        let last = executor.gas_log().recent().pop().unwrap();
        assert_eq!(last.status, GasLogStatus::Error);
        assert_eq!(last.message.as_deref(), Some("transaction failed"));
    }

    #[tokio::test]
    async fn test_auto_gas_capped_below_block_gas_limit() {
        let node = FakeNode::new();
        node.set_estimate(U256::from(1_000_000));
        node.set_gas_limit(U256::from(1_024_000));
        let executor = executor_on(&node, ExecutorConfig::default());

        executor
            .execute_contract_transaction(
                &contract("Owned", CONTRACT),
                "transferOwnership",
                TxOptions::new().from(test_account()),
                vec![Token::Address(Address::repeat_byte(0x0b))],
            )
            .await
            .unwrap();
        assert_eq!(node.sent()[0].gas, U256::from(1_020_000));
    }

    #[tokio::test]
    async fn test_zero_default_multiplier_keeps_given_gas() {
        let node = FakeNode::new();
        let executor = executor_on(
            &node,
            ExecutorConfig {
                always_auto_gas_limit: Some(0.0),
                ..Default::default()
            },
        );
        let owned = contract("Owned", CONTRACT);
        let args = vec![Token::Address(Address::repeat_byte(0x0b))];

        executor
            .execute_contract_transaction(
                &owned,
                "transferOwnership",
                TxOptions::new().from(test_account()).gas(30_000u64),
                args.clone(),
            )
            .await
            .unwrap();
        let sent = &node.sent()[0];
        assert_eq!(sent.gas, U256::from(30_000));
        assert_eq!(sent.data, owned.encode_call("transferOwnership", &args).unwrap());

        let statuses: Vec<_> = executor.gas_log().recent().iter().map(|r| r.status).collect();
        assert_eq!(statuses, vec![GasLogStatus::Success]);
    }

    #[tokio::test]
    async fn test_scrubbed_options_reach_signer() {
        let node = FakeNode::new();
        let mut signer = MockTransactionSigner::new();
        signer
            .expect_sign_and_execute_transaction()
            .withf(|_, function, _, options| {
                function.to_string() == "transferOwnership"
                    && options.gas == Some(U256::from(23_100))
                    && options.gas_price == Some(U256::from(5))
            })
            .times(1)
            .returning(|_, _, _, _| {
                Ok(TransactionReceipt {
                    gas_used: Some(U256::from(21_000)),
                    ..Default::default()
                })
            });
        let executor = Executor::new(
            node.clone(),
            Some(Arc::new(signer)),
            ExecutorConfig {
                gas_price: Some(5),
                ..Default::default()
            },
        );

        executor
            .execute_contract_transaction(
                &contract("Owned", CONTRACT),
                "transferOwnership",
                TxOptions::new()
                    .from(test_account())
                    .timeout(1_000)
                    .event_timeout(500),
                vec![Token::Address(Address::repeat_byte(0x0b))],
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_create_contract_through_executor() {
        let node = FakeNode::new();
        let executor = executor_on(&node, ExecutorConfig::default());

        let created = executor
            .create_contract("Owned", vec![], TxOptions::new().from(test_account()).gas(1_000_000u64))
            .await
            .unwrap();
        assert_eq!(created.name(), "Owned");
        assert!(!created.address().is_zero());
    }
}
