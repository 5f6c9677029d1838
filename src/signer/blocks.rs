//! Recent block index for pending transaction reconciliation
//!
//! Fast chains may mine a transaction before its receipt becomes visible
//! through the RPC API. The index keeps the transaction hashes of recent
//! blocks and wakes receipt waiters once their transaction shows up in a
//! block, so the receipt is reloaded instead of polled blindly.

use crate::metrics;

use dashmap::DashMap;
use ethers::types::H256;
use std::collections::BTreeMap;
use tokio::sync::{oneshot, Mutex};
use tracing::debug;

pub struct BlockIndex {
    capacity: u64,
    /// block number -> included transaction hashes
    blocks: Mutex<BTreeMap<u64, Vec<H256>>>,
    /// transaction hash -> waiters notified with the including block
    pending: DashMap<H256, Vec<oneshot::Sender<u64>>>,
}

impl BlockIndex {
    /// Index caching the last `capacity` blocks
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity: capacity.max(1),
            blocks: Mutex::new(BTreeMap::new()),
            pending: DashMap::new(),
        }
    }

    /// Cache block `number` and wake waiters for the transactions it includes.
    ///
    /// Returns the number of woken transactions.
    pub async fn record_block(&self, number: u64, transactions: Vec<H256>) -> usize {
        let mut blocks = self.blocks.lock().await;

        let mut woken = 0;
        for hash in &transactions {
            if let Some((_, waiters)) = self.pending.remove(hash) {
                woken += 1;
                for waiter in waiters {
                    let _ = waiter.send(number);
                }
            }
        }
        // waiters abandoned without `forget`
        self.pending.retain(|_, waiters| {
            waiters.retain(|waiter| !waiter.is_closed());
            !waiters.is_empty()
        });

        blocks.insert(number, transactions);
        while let Some((&oldest, _)) = blocks.first_key_value() {
            if oldest + self.capacity > number {
                break;
            }
            blocks.remove(&oldest);
        }

        metrics::record_pending_receipts(self.pending.len());
        if woken > 0 {
            debug!("Block {} includes {} pending transactions", number, woken);
        }
        woken
    }

    /// Notification for the block including `hash`.
    ///
    /// Resolves immediately if a cached block already contains it.
    pub async fn watch(&self, hash: H256) -> oneshot::Receiver<u64> {
        self.register(hash, true).await
    }

    /// Notification for a block recorded after this call that includes `hash`
    pub async fn watch_new_blocks(&self, hash: H256) -> oneshot::Receiver<u64> {
        self.register(hash, false).await
    }

    async fn register(&self, hash: H256, check_cached: bool) -> oneshot::Receiver<u64> {
        let (tx, rx) = oneshot::channel();
        let blocks = self.blocks.lock().await;

        let included = if check_cached {
            blocks
                .iter()
                .rev()
                .find(|(_, hashes)| hashes.contains(&hash))
                .map(|(number, _)| *number)
        } else {
            None
        };

        match included {
            Some(number) => {
                let _ = tx.send(number);
            }
            None => {
                let mut waiters = self.pending.entry(hash).or_default();
                // waiters from earlier polling rounds are gone
                waiters.retain(|waiter| !waiter.is_closed());
                waiters.push(tx);
                drop(waiters);
                metrics::record_pending_receipts(self.pending.len());
            }
        }
        drop(blocks);
        rx
    }

    /// Drop all waiters for `hash`
    pub fn forget(&self, hash: H256) {
        if self.pending.remove(&hash).is_some() {
            metrics::record_pending_receipts(self.pending.len());
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub async fn cached_blocks(&self) -> usize {
        self.blocks.lock().await.len()
    }
}
