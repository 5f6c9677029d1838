use crate::error::RuntimeResult;

use async_trait::async_trait;
use ethers::types::Address;
use std::collections::HashMap;

/// Resolves hierarchical names to addresses
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NameResolver: Send + Sync {
    /// Address registered for `domain`, `None` when nothing is registered
    async fn get_address(&self, domain: &str) -> RuntimeResult<Option<Address>>;
}

/// Fixed domain table, e.g. from configuration
#[derive(Debug, Default, Clone)]
pub struct StaticNameResolver {
    entries: HashMap<String, Address>,
}

impl StaticNameResolver {
    pub fn new(entries: HashMap<String, Address>) -> Self {
        Self { entries }
    }
}

#[async_trait]
impl NameResolver for StaticNameResolver {
    async fn get_address(&self, domain: &str) -> RuntimeResult<Option<Address>> {
        Ok(self.entries.get(domain).copied())
    }
}
