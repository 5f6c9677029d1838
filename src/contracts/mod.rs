//! Contract handles and the collaborators the runtime consumes
//!
//! - `ContractLoader`: ABI/bytecode registry producing callable handles
//! - `NameResolver`: resolves well-known domains (the event hub) to addresses
//! - `KeyStore`: hands out private keys for local signing

mod accounts;
mod loader;
mod names;

pub use accounts::{AccountStore, KeyStore};
pub use loader::{CompiledContract, ContractLoader, StaticContractLoader};
pub use names::{NameResolver, StaticNameResolver};

#[cfg(test)]
pub use accounts::MockKeyStore;
#[cfg(test)]
pub use names::MockNameResolver;

use crate::error::{RuntimeError, RuntimeResult};

use ethers::abi::{Abi, Event, Function, Token};
use ethers::types::{Address, Bytes};
use std::sync::Arc;

/// ABI-bound handle of a deployed contract
#[derive(Debug, Clone)]
pub struct Contract {
    name: String,
    address: Address,
    abi: Arc<Abi>,
}

impl Contract {
    pub fn new(name: impl Into<String>, address: Address, abi: Arc<Abi>) -> Self {
        Self {
            name: name.into(),
            address,
            abi,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn abi(&self) -> &Arc<Abi> {
        &self.abi
    }

    pub fn has_method(&self, function: &str) -> bool {
        self.abi.functions.contains_key(function)
    }

    /// Names of all functions in the ABI
    pub fn methods(&self) -> Vec<&str> {
        self.abi.functions.keys().map(String::as_str).collect()
    }

    pub fn function(&self, function: &str) -> RuntimeResult<&Function> {
        self.abi
            .function(function)
            .map_err(|e| RuntimeError::Abi(format!("{}.{}: {}", self.name, function, e)))
    }

    pub fn event(&self, event: &str) -> RuntimeResult<&Event> {
        self.abi
            .event(event)
            .map_err(|e| RuntimeError::Abi(format!("{}.{}: {}", self.name, event, e)))
    }

    /// ABI-encode a call of `function` with `args`
    pub fn encode_call(&self, function: &str, args: &[Token]) -> RuntimeResult<Bytes> {
        self.function(function)?
            .encode_input(args)
            .map(Bytes::from)
            .map_err(|e| RuntimeError::Abi(format!("encoding {}.{}: {}", self.name, function, e)))
    }

    /// Decode the return data of a call to `function`
    pub fn decode_output(&self, function: &str, data: &[u8]) -> RuntimeResult<Vec<Token>> {
        self.function(function)?
            .decode_output(data)
            .map_err(|e| RuntimeError::Abi(format!("decoding {}.{}: {}", self.name, function, e)))
    }
}

/// Subscription or transaction target: a contract by name, or an already loaded handle
#[derive(Debug, Clone)]
pub enum ContractRef {
    Named(String),
    Loaded(Contract),
}

impl From<&str> for ContractRef {
    fn from(name: &str) -> Self {
        ContractRef::Named(name.to_string())
    }
}

impl From<String> for ContractRef {
    fn from(name: String) -> Self {
        ContractRef::Named(name)
    }
}

impl From<Contract> for ContractRef {
    fn from(contract: Contract) -> Self {
        ContractRef::Loaded(contract)
    }
}

impl From<&Contract> for ContractRef {
    fn from(contract: &Contract) -> Self {
        ContractRef::Loaded(contract.clone())
    }
}
