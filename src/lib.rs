//! DBCP runtime - transaction execution, signing and event subscriptions
//! for Ethereum-like chains.
//!
//! The `Executor` drives transactions through gas estimation, signing,
//! broadcast and confirmation, optionally correlated with a contract event
//! delivered by the `EventHub`. The `InternalSigner` owns nonce sequencing
//! and receipt recovery. `Runtime` wires all of them to one node
//! connection and keeps them on it across reconnects.

pub mod config;
pub mod contracts;
pub mod error;
pub mod events;
pub mod executor;
pub mod logging;
pub mod metrics;
pub mod node;
pub mod runtime;
pub mod signer;

#[cfg(test)]
mod testing;

pub use error::{RuntimeError, RuntimeResult, TxContext};
pub use events::{ContractEvent, EventHub, FromBlock, SubscriptionId, Unsubscribe};
pub use executor::{Executor, TxOptions, TxOutcome};
pub use runtime::Runtime;
pub use signer::{InternalSigner, TransactionSigner};
