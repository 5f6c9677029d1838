//! Contract event types and parsing
//!
//! Logs delivered by the node are decoded against the subscribed event's
//! ABI entry before they reach subscribers.

mod hub;

pub use hub::{
    accept_all, event_filter, event_handler, EventFilter, EventHandler, EventHub, FromBlock,
    SubscriptionId, Unsubscribe,
};

use crate::error::{RuntimeError, RuntimeResult};

use ethers::abi::{Event, RawLog, Token};
use ethers::types::{Address, Log, H256, U256};

/// A decoded contract event
#[derive(Debug, Clone, PartialEq)]
pub struct ContractEvent {
    pub address: Address,
    pub event_name: String,
    /// Named parameters in ABI order
    pub args: Vec<(String, Token)>,
    pub block_number: Option<u64>,
    pub block_hash: Option<H256>,
    pub transaction_hash: Option<H256>,
    pub log_index: Option<U256>,
    pub raw: Log,
}

impl ContractEvent {
    /// Decode `log` as an occurrence of `event`
    pub fn decode(event: &Event, log: Log) -> RuntimeResult<Self> {
        let parsed = event
            .parse_log(RawLog {
                topics: log.topics.clone(),
                data: log.data.to_vec(),
            })
            .map_err(|e| RuntimeError::Abi(format!("decoding {} log: {}", event.name, e)))?;

        Ok(Self {
            address: log.address,
            event_name: event.name.clone(),
            args: parsed
                .params
                .into_iter()
                .map(|param| (param.name, param.value))
                .collect(),
            block_number: log.block_number.map(|n| n.as_u64()),
            block_hash: log.block_hash,
            transaction_hash: log.transaction_hash,
            log_index: log.log_index,
            raw: log,
        })
    }

    /// Argument by parameter name
    pub fn arg(&self, name: &str) -> Option<&Token> {
        self.args
            .iter()
            .find(|(param, _)| param == name)
            .map(|(_, value)| value)
    }

    /// Identity of the underlying log, stable across redelivery
    pub(crate) fn log_id(&self) -> (Option<H256>, Option<H256>, Option<U256>) {
        (self.block_hash, self.transaction_hash, self.log_index)
    }
}
