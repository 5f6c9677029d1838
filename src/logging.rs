//! Logging setup and the gas audit log
//!
//! Every executor stage transition produces one `GasLogRecord`. Records are
//! emitted as JSON at target `gas_log` and kept in a bounded in-memory ring
//! so callers can inspect recent gas usage without a log pipeline.

use chrono::{DateTime, Utc};
use ethers::abi::Token;
use ethers::types::{Address, H256, U256};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tracing::info;

/// Default number of records kept by `GasLog`
pub const DEFAULT_GAS_LOG_CAPACITY: usize = 1000;

/// Initialize the global tracing subscriber.
///
/// `RUST_LOG` overrides the default filter; `DBCP_LOG_FORMAT=json` switches
/// to JSON lines.
pub fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,dbcp_runtime=debug,ethers_providers=warn"));

    let json = std::env::var("DBCP_LOG_FORMAT")
        .map(|format| format.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true).with_thread_ids(true))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GasLogStatus {
    #[serde(rename = "unknown")]
    Unknown,
    #[serde(rename = "success")]
    Success,
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "autoGas.estimation")]
    AutoGasEstimation,
    #[serde(rename = "autoGas.success")]
    AutoGasSuccess,
    #[serde(rename = "autoGas.error")]
    AutoGasError,
}

/// One gas audit entry
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GasLogRecord {
    /// Contract function, `None` for plain sends
    pub transaction: Option<String>,
    pub contract: Option<Address>,
    pub from: Option<Address>,
    pub arguments: Vec<String>,
    pub gas_estimated: Option<U256>,
    pub gas_given: Option<U256>,
    pub gas_used: U256,
    pub status: GasLogStatus,
    pub transaction_hash: Option<H256>,
    pub message: Option<String>,
    /// Set when the record is logged
    pub timestamp: DateTime<Utc>,
}

impl GasLogRecord {
    /// Base record of a transaction; stages fill in the rest
    pub fn new(
        transaction: Option<&str>,
        contract: Option<Address>,
        from: Option<Address>,
        arguments: &[Token],
        gas_given: Option<U256>,
    ) -> Self {
        Self {
            transaction: transaction.map(str::to_string),
            contract,
            from,
            arguments: arguments.iter().map(ToString::to_string).collect(),
            gas_estimated: None,
            gas_given,
            gas_used: U256::zero(),
            status: GasLogStatus::Unknown,
            transaction_hash: None,
            message: None,
            timestamp: Utc::now(),
        }
    }

    pub fn status(mut self, status: GasLogStatus) -> Self {
        self.status = status;
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn estimated(mut self, gas: Option<U256>) -> Self {
        self.gas_estimated = gas;
        self
    }

    pub fn given(mut self, gas: Option<U256>) -> Self {
        self.gas_given = gas;
        self
    }

    pub fn used(mut self, gas: U256) -> Self {
        self.gas_used = gas;
        self
    }

    pub fn hash(mut self, hash: Option<H256>) -> Self {
        self.transaction_hash = hash;
        self
    }
}

/// Bounded ring of recent gas records, shared by clones
#[derive(Debug, Clone)]
pub struct GasLog {
    records: Arc<Mutex<VecDeque<GasLogRecord>>>,
    capacity: usize,
}

impl Default for GasLog {
    fn default() -> Self {
        Self::new(DEFAULT_GAS_LOG_CAPACITY)
    }
}

impl GasLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(64)))),
            capacity,
        }
    }

    /// Emit `record` at target `gas_log` and keep it in the ring
    pub fn log(&self, mut record: GasLogRecord) {
        record.timestamp = Utc::now();
        match serde_json::to_string(&record) {
            Ok(json) => info!(target: "gas_log", "{}", json),
            Err(e) => tracing::warn!(target: "gas_log", "Unserializable gas record: {}", e),
        }

        if self.capacity == 0 {
            return;
        }
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// Records oldest first
    pub fn recent(&self) -> Vec<GasLogRecord> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.iter().cloned().collect()
    }
}
