//! Nonce management for concurrent transaction submission
//!
//! Handles:
//! - Per-account nonce cache for transactions not yet visible to the node
//! - Reconciliation against the node's transaction count
//!
//! Nonces are process-scoped. Independent processes or wallets sending
//! from the same account are not coordinated.

use crate::error::RuntimeResult;
use crate::node::{ChainNode, NodeError};

use dashmap::DashMap;
use ethers::types::{Address, U256};
use tracing::debug;

/// Hands out strictly increasing nonces per account
#[derive(Debug, Default)]
pub struct NonceManager {
    /// Next nonce to hand out per account
    next: DashMap<Address, u64>,
}

impl NonceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the node's transaction count for `account` and allocate from it
    pub async fn next_nonce(&self, node: &dyn ChainNode, account: Address) -> RuntimeResult<u64> {
        let count = node.transaction_count(account).await?;
        let count = u64::try_from(count)
            .map_err(|_| NodeError::Decode(format!("transaction count {} out of range", count)))?;
        Ok(self.allocate(account, count))
    }

    /// Allocate `max(cached, chain_count)` and cache its successor.
    ///
    /// The read-modify-write happens under the account's map entry, so
    /// concurrent callers never observe the same value.
    pub fn allocate(&self, account: Address, chain_count: u64) -> u64 {
        let mut next = self.next.entry(account).or_insert(0);
        let nonce = (*next).max(chain_count);
        *next = nonce + 1;
        debug!("Allocated nonce {} for {:?}", nonce, account);
        nonce
    }

    /// Next nonce this process would hand out, if the account was used before
    pub fn cached(&self, account: Address) -> Option<u64> {
        self.next.get(&account).map(|n| *n)
    }
}

/// Convert an explicitly requested nonce
pub(crate) fn explicit_nonce(nonce: U256) -> Option<u64> {
    u64::try_from(nonce).ok()
}
