//! Error types for the DBCP runtime

use crate::node::NodeError;

use ethers::types::{Address, H256, U256};
use std::fmt;
use thiserror::Error;

/// Identifies the transaction an error belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxContext {
    /// Contract function, `"send"` for value transfers, `"create:<Name>"` for deployments
    pub function: String,
    pub contract: Option<Address>,
    pub account: Option<Address>,
}

impl TxContext {
    pub fn new(function: impl Into<String>) -> Self {
        Self {
            function: function.into(),
            ..Default::default()
        }
    }

    pub fn contract(mut self, contract: Address) -> Self {
        self.contract = Some(contract);
        self
    }

    pub fn account(mut self, account: Option<Address>) -> Self {
        self.account = account;
        self
    }
}

impl fmt::Display for TxContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{}\"", self.function)?;
        if let Some(contract) = self.contract {
            write!(f, " on {:?}", contract)?;
        }
        if let Some(account) = self.account {
            write!(f, " by {:?}", account)?;
        }
        Ok(())
    }
}

/// Main error type for the runtime
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Validation failed for {context}: {message}")]
    Validation { context: TxContext, message: String },

    #[error("Could not estimate gas usage for {context}: {source}")]
    Estimation {
        context: TxContext,
        #[source]
        source: NodeError,
    },

    #[error("Transaction {context} would most likely fail, estimate equals requested gas {gas}")]
    SpeculativeFailure { context: TxContext, gas: U256 },

    #[error("Submission of {context} failed: {message}")]
    Submission { context: TxContext, message: String },

    #[error("Timeout after {timeout_ms}ms during {context}")]
    Timeout { context: TxContext, timeout_ms: u64 },

    #[error("All gas used up by {context} ({gas_used} of {gas_given}, tx {transaction_hash:?})")]
    Exhaustion {
        context: TxContext,
        gas_given: U256,
        gas_used: U256,
        transaction_hash: H256,
    },

    #[error("Unsubscribing failed: {0}")]
    Unsubscribe(String),

    #[error("Cannot create abstract contract \"{name}\": no bytecode available")]
    AbstractContract { name: String },

    #[error("Node error: {0}")]
    Node(#[from] NodeError),

    #[error("Key store error for {account:?}: {message}")]
    KeyStore { account: Address, message: String },

    #[error("Contract loading error: {0}")]
    ContractLoad(String),

    #[error("ABI error: {0}")]
    Abi(String),
}

impl RuntimeError {
    /// Transaction context, if the error belongs to a transaction
    pub fn context(&self) -> Option<&TxContext> {
        match self {
            RuntimeError::Validation { context, .. }
            | RuntimeError::Estimation { context, .. }
            | RuntimeError::SpeculativeFailure { context, .. }
            | RuntimeError::Submission { context, .. }
            | RuntimeError::Timeout { context, .. }
            | RuntimeError::Exhaustion { context, .. } => Some(context),
            _ => None,
        }
    }

    /// Short label for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            RuntimeError::Configuration(_) => "configuration",
            RuntimeError::Validation { .. } => "validation",
            RuntimeError::Estimation { .. } => "estimation",
            RuntimeError::SpeculativeFailure { .. } => "speculative_failure",
            RuntimeError::Submission { .. } => "submission",
            RuntimeError::Timeout { .. } => "timeout",
            RuntimeError::Exhaustion { .. } => "exhaustion",
            RuntimeError::Unsubscribe(_) => "unsubscribe",
            RuntimeError::AbstractContract { .. } => "abstract_contract",
            RuntimeError::Node(_) => "node",
            RuntimeError::KeyStore { .. } => "key_store",
            RuntimeError::ContractLoad(_) => "contract_load",
            RuntimeError::Abi(_) => "abi",
        }
    }

    /// Attach transaction context to errors raised below the executor
    pub(crate) fn into_submission(self, context: &TxContext) -> Self {
        match self {
            err @ (RuntimeError::Exhaustion { .. }
            | RuntimeError::Submission { .. }
            | RuntimeError::AbstractContract { .. }
            | RuntimeError::Validation { .. }) => err,
            other => RuntimeError::Submission {
                context: context.clone(),
                message: other.to_string(),
            },
        }
    }
}

/// Result type for runtime operations
pub type RuntimeResult<T> = Result<T, RuntimeError>;
