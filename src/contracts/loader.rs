//! Compiled contract registry

use super::Contract;
use crate::error::{RuntimeError, RuntimeResult};

use ethers::abi::Abi;
use ethers::types::{Address, Bytes};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// ABI and creation bytecode of a contract type
#[derive(Debug, Clone)]
pub struct CompiledContract {
    pub abi: Arc<Abi>,
    /// Empty for interfaces and abstract contracts
    pub bytecode: Bytes,
}

/// Source of contract descriptions and callable handles
pub trait ContractLoader: Send + Sync {
    fn compiled_contract(&self, name: &str) -> Option<CompiledContract>;

    /// Handle of contract type `name` deployed at `address`
    fn load_contract(&self, name: &str, address: Address) -> RuntimeResult<Contract> {
        let compiled = self.compiled_contract(name).ok_or_else(|| {
            RuntimeError::ContractLoad(format!(
                "description for contract type \"{}\" not found, supported interfaces are \"{}\"",
                name,
                self.contract_names().join(",")
            ))
        })?;
        Ok(Contract::new(name, address, compiled.abi))
    }

    fn contract_names(&self) -> Vec<String>;
}

/// Solc output entry: ABI as JSON string, bytecode as hex
#[derive(Debug, Deserialize)]
struct RawCompiledContract {
    interface: String,
    #[serde(default)]
    bytecode: String,
}

/// In-memory registry filled from compiled contract JSON
#[derive(Debug, Default, Clone)]
pub struct StaticContractLoader {
    contracts: BTreeMap<String, CompiledContract>,
}

impl StaticContractLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `{ "<Name>": { "interface": "<abi json>", "bytecode": "<hex>" } }`
    pub fn from_json(json: &str) -> RuntimeResult<Self> {
        let raw: BTreeMap<String, RawCompiledContract> = serde_json::from_str(json)
            .map_err(|e| RuntimeError::ContractLoad(format!("invalid contract file: {}", e)))?;

        let mut loader = Self::new();
        for (name, entry) in raw {
            let abi: Abi = serde_json::from_str(&entry.interface).map_err(|e| {
                RuntimeError::ContractLoad(format!("invalid ABI for \"{}\": {}", name, e))
            })?;
            let bytecode = hex::decode(entry.bytecode.trim_start_matches("0x")).map_err(|e| {
                RuntimeError::ContractLoad(format!("invalid bytecode for \"{}\": {}", name, e))
            })?;
            loader.insert(
                name,
                CompiledContract {
                    abi: Arc::new(abi),
                    bytecode: bytecode.into(),
                },
            );
        }
        Ok(loader)
    }

    pub fn from_file(path: impl AsRef<Path>) -> RuntimeResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            RuntimeError::ContractLoad(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json(&json)
    }

    pub fn insert(&mut self, name: impl Into<String>, contract: CompiledContract) {
        self.contracts.insert(name.into(), contract);
    }
}

impl ContractLoader for StaticContractLoader {
    fn compiled_contract(&self, name: &str) -> Option<CompiledContract> {
        self.contracts.get(name).cloned()
    }

    fn contract_names(&self) -> Vec<String> {
        self.contracts.keys().cloned().collect()
    }
}
