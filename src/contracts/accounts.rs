use crate::error::{RuntimeError, RuntimeResult};

use async_trait::async_trait;
use ethers::types::Address;
use std::collections::HashMap;

/// Access to the private keys of local accounts
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Hex encoded private key of `account`, with or without `0x` prefix
    async fn private_key(&self, account: Address) -> RuntimeResult<String>;
}

/// Key store backed by an in-memory account map
#[derive(Default, Clone)]
pub struct AccountStore {
    accounts: HashMap<Address, String>,
}

impl AccountStore {
    pub fn new(accounts: HashMap<Address, String>) -> Self {
        Self { accounts }
    }

    pub fn accounts(&self) -> impl Iterator<Item = &Address> {
        self.accounts.keys()
    }
}

// keys never end up in logs
impl std::fmt::Debug for AccountStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountStore")
            .field("accounts", &self.accounts.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[async_trait]
impl KeyStore for AccountStore {
    async fn private_key(&self, account: Address) -> RuntimeResult<String> {
        self.accounts
            .get(&account)
            .cloned()
            .ok_or_else(|| RuntimeError::KeyStore {
                account,
                message: "no private key for account".to_string(),
            })
    }
}
