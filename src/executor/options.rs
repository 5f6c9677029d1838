//! Per-call transaction options

use crate::contracts::ContractRef;
use crate::events::ContractEvent;
pub use crate::signer::NodeOptions;

use ethers::abi::Token;
use ethers::types::{Address, Bytes, TransactionReceipt, U256};
use std::fmt;
use std::sync::Arc;

/// Derives the resolved value of a transaction from its matched event
pub type EventResultFn = Arc<dyn Fn(&ContractEvent) -> Token + Send + Sync>;

/// Event a transaction waits for after being mined
#[derive(Debug, Clone)]
pub struct EventTarget {
    pub target: ContractRef,
    pub event_name: String,
    /// Emitting contract, when it differs from the called contract
    pub target_address: Option<Address>,
}

/// Options of one executor call.
///
/// Only the fields copied by `scrub_options` reach the node, everything
/// else steers the executor.
#[derive(Clone, Default)]
pub struct TxOptions {
    pub from: Option<Address>,
    pub to: Option<Address>,
    pub gas: Option<U256>,
    pub gas_price: Option<U256>,
    pub value: Option<U256>,
    pub nonce: Option<U256>,
    pub data: Option<Bytes>,
    pub event: Option<EventTarget>,
    /// Deadline in ms while waiting for `event`
    pub event_timeout: Option<u64>,
    /// Deadline in ms for the whole call
    pub timeout: Option<u64>,
    /// Only estimate gas, submit nothing
    pub estimate: bool,
    /// Submit even if the estimate equals the requested gas
    pub force: bool,
    /// Multiplier applied to the gas estimate
    pub auto_gas: Option<f64>,
    pub event_result: Option<EventResultFn>,
}

impl TxOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from(mut self, from: Address) -> Self {
        self.from = Some(from);
        self
    }

    pub fn to(mut self, to: Address) -> Self {
        self.to = Some(to);
        self
    }

    pub fn gas(mut self, gas: impl Into<U256>) -> Self {
        self.gas = Some(gas.into());
        self
    }

    pub fn gas_price(mut self, gas_price: impl Into<U256>) -> Self {
        self.gas_price = Some(gas_price.into());
        self
    }

    pub fn value(mut self, value: impl Into<U256>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn nonce(mut self, nonce: impl Into<U256>) -> Self {
        self.nonce = Some(nonce.into());
        self
    }

    pub fn data(mut self, data: impl Into<Bytes>) -> Self {
        self.data = Some(data.into());
        self
    }

    /// Wait for `event_name` emitted by `target` in the same transaction
    pub fn event(mut self, target: impl Into<ContractRef>, event_name: &str) -> Self {
        self.event = Some(EventTarget {
            target: target.into(),
            event_name: event_name.to_string(),
            target_address: None,
        });
        self
    }

    /// Like `event`, with the emitting contract at `address`
    pub fn event_at(
        mut self,
        target: impl Into<ContractRef>,
        address: Address,
        event_name: &str,
    ) -> Self {
        self.event = Some(EventTarget {
            target: target.into(),
            event_name: event_name.to_string(),
            target_address: Some(address),
        });
        self
    }

    pub fn event_timeout(mut self, ms: u64) -> Self {
        self.event_timeout = Some(ms);
        self
    }

    pub fn timeout(mut self, ms: u64) -> Self {
        self.timeout = Some(ms);
        self
    }

    pub fn estimate(mut self) -> Self {
        self.estimate = true;
        self
    }

    pub fn force(mut self) -> Self {
        self.force = true;
        self
    }

    pub fn auto_gas(mut self, multiplier: f64) -> Self {
        self.auto_gas = Some(multiplier);
        self
    }

    pub fn event_result(
        mut self,
        derive: impl Fn(&ContractEvent) -> Token + Send + Sync + 'static,
    ) -> Self {
        self.event_result = Some(Arc::new(derive));
        self
    }

    /// These options with unset fields taken from `defaults`
    pub fn merged_over(self, defaults: &TxOptions) -> TxOptions {
        TxOptions {
            from: self.from.or(defaults.from),
            to: self.to.or(defaults.to),
            gas: self.gas.or(defaults.gas),
            gas_price: self.gas_price.or(defaults.gas_price),
            value: self.value.or(defaults.value),
            nonce: self.nonce.or(defaults.nonce),
            data: self.data.or_else(|| defaults.data.clone()),
            event: self.event.or_else(|| defaults.event.clone()),
            event_timeout: self.event_timeout.or(defaults.event_timeout),
            timeout: self.timeout.or(defaults.timeout),
            estimate: self.estimate || defaults.estimate,
            force: self.force || defaults.force,
            auto_gas: self.auto_gas.or(defaults.auto_gas),
            event_result: self.event_result.or_else(|| defaults.event_result.clone()),
        }
    }

    /// Deadline of the call: the event timeout while watching an event
    pub(crate) fn deadline_ms(&self, fallback: u64) -> u64 {
        let event_timeout = self.event.as_ref().and(self.event_timeout);
        event_timeout.or(self.timeout).unwrap_or(fallback)
    }
}

impl fmt::Debug for TxOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxOptions")
            .field("from", &self.from)
            .field("to", &self.to)
            .field("gas", &self.gas)
            .field("gas_price", &self.gas_price)
            .field("value", &self.value)
            .field("nonce", &self.nonce)
            .field("event", &self.event)
            .field("event_timeout", &self.event_timeout)
            .field("timeout", &self.timeout)
            .field("estimate", &self.estimate)
            .field("force", &self.force)
            .field("auto_gas", &self.auto_gas)
            .field("event_result", &self.event_result.is_some())
            .finish()
    }
}

/// Node-facing subset of `options`
pub fn scrub_options(options: &TxOptions) -> NodeOptions {
    NodeOptions {
        from: options.from,
        to: options.to,
        gas_price: options.gas_price,
        gas: options.gas,
        value: options.value,
        data: options.data.clone(),
        nonce: options.nonce,
    }
}

/// Result of `Executor::execute_contract_transaction`
#[derive(Debug, Clone, PartialEq)]
pub enum TxOutcome {
    /// Mined, no event requested
    Mined(TransactionReceipt),
    /// The requested event emitted by the transaction
    Event(ContractEvent),
    /// Value derived from the event by `TxOptions::event_result`
    EventResult(Token),
    /// Gas estimate of an estimate-only call
    Estimated(U256),
}
