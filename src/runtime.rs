//! Runtime wiring
//!
//! Builds loader, account store, signer, executor and event hub from
//! `Settings` and keeps all of them on the current node connection.

use crate::config::Settings;
use crate::contracts::{
    AccountStore, ContractLoader, NameResolver, StaticContractLoader, StaticNameResolver,
};
use crate::events::{EventHub, Unsubscribe};
use crate::executor::Executor;
use crate::node::{ChainNode, EthersNode};
use crate::signer::{InternalSigner, TransactionSigner};

use anyhow::{Context, Result};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Fully wired runtime
pub struct Runtime {
    pub settings: Settings,
    pub contract_loader: Arc<dyn ContractLoader>,
    pub accounts: Arc<AccountStore>,
    pub signer: Arc<InternalSigner>,
    pub executor: Arc<Executor>,
    pub event_hub: EventHub,
    reconnect_watcher: JoinHandle<()>,
}

impl Runtime {
    /// Connect to `settings.node.ws_url` and build the runtime on it
    pub async fn connect(
        settings: Settings,
        name_resolver: Option<Arc<dyn NameResolver>>,
    ) -> Result<Self> {
        let node = EthersNode::connect(
            &settings.node.ws_url,
            Duration::from_millis(settings.node.reconnect_delay_ms),
        )
        .await
        .with_context(|| format!("Failed to connect to {}", settings.node.ws_url))?;
        Self::new(node, settings, name_resolver)
    }

    /// Build the runtime on `node`.
    ///
    /// Without `name_resolver` names resolve through the `[names]` table.
    pub fn new(
        node: Arc<dyn ChainNode>,
        settings: Settings,
        name_resolver: Option<Arc<dyn NameResolver>>,
    ) -> Result<Self> {
        let contract_loader: Arc<dyn ContractLoader> = match &settings.contracts.path {
            Some(path) => Arc::new(
                StaticContractLoader::from_file(path)
                    .with_context(|| format!("Failed to load contracts from {:?}", path))?,
            ),
            None => Arc::new(StaticContractLoader::new()),
        };
        let name_resolver = match name_resolver {
            Some(resolver) => resolver,
            None => Arc::new(StaticNameResolver::new(settings.name_map()?)),
        };
        let accounts = Arc::new(AccountStore::new(settings.account_map()?));

        let signer = Arc::new(InternalSigner::new(
            node.clone(),
            accounts.clone(),
            contract_loader.clone(),
            settings.signer.clone(),
        ));
        let executor = Arc::new(Executor::new(
            node.clone(),
            Some(signer.clone() as Arc<dyn TransactionSigner>),
            settings.executor.clone(),
        ));
        let event_hub = EventHub::new(
            node.clone(),
            contract_loader.clone(),
            name_resolver,
            settings.event_hub.clone(),
        );

        let reconnect_watcher = spawn_reconnect_watcher(
            node.reconnects(),
            Arc::downgrade(&signer),
            Arc::downgrade(&executor),
            event_hub.clone(),
        );

        info!(
            "Runtime ready with {} accounts and {} contract types",
            accounts.accounts().count(),
            contract_loader.contract_names().len()
        );
        Ok(Self {
            settings,
            contract_loader,
            accounts,
            signer,
            executor,
            event_hub,
            reconnect_watcher,
        })
    }

    /// Attach the event hub to the executor
    pub async fn init(&self) {
        self.executor.init(self.event_hub.clone()).await;
    }

    /// Remove every subscription and stop background tasks
    pub async fn shutdown(&self) {
        info!("Shutting down runtime");
        self.reconnect_watcher.abort();
        if let Err(e) = self.event_hub.unsubscribe(Unsubscribe::All).await {
            warn!("Failed to remove all subscriptions: {}", e);
        }
        self.signer.shutdown();
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.reconnect_watcher.abort();
    }
}

/// Move signer, executor and hub to every new connection
fn spawn_reconnect_watcher(
    mut reconnects: broadcast::Receiver<Arc<dyn ChainNode>>,
    signer: Weak<InternalSigner>,
    executor: Weak<Executor>,
    event_hub: EventHub,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let node = match reconnects.recv().await {
                Ok(node) => node,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Missed {} reconnect announcements", skipped);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            let (Some(signer), Some(executor)) = (signer.upgrade(), executor.upgrade()) else {
                break;
            };

            info!("Node reconnected, rebinding runtime");
            reconnects = node.reconnects();
            signer.rebind(node.clone()).await;
            executor.rebind(node.clone()).await;
            if let Err(e) = event_hub.resubscribe(node).await {
                error!("Resubscribe after reconnect failed: {}", e);
            }
        }
    })
}
