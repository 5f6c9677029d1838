//! Shared contract event subscriptions
//!
//! Handles:
//! - One node-side log listener per (contract, event) pair, shared by all
//!   subscriptions on that pair
//! - Parallel fan-out to subscriber filters and handlers
//! - Historical replay for subscriptions starting at an explicit block
//! - Rebuilding listeners after the transport reconnected
//!
//! Listener creation and teardown for a pair are serialized by that
//! pair's mutex; independent pairs never wait on each other.

use super::ContractEvent;
use crate::config::EventHubConfig;
use crate::contracts::{Contract, ContractLoader, ContractRef, NameResolver};
use crate::error::{RuntimeError, RuntimeResult};
use crate::metrics;
use crate::node::{ChainNode, SubscriptionHandle};

use dashmap::DashMap;
use ethers::abi::Event;
use ethers::types::{Address, Filter, Log, H256, U256};
use futures::future::BoxFuture;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub type SubscriptionId = Uuid;

/// Decides whether a subscription's handler runs for an event
pub type EventFilter =
    Arc<dyn Fn(ContractEvent) -> BoxFuture<'static, anyhow::Result<bool>> + Send + Sync>;

/// Receives events accepted by the subscription's filter
pub type EventHandler =
    Arc<dyn Fn(ContractEvent) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Wrap an async closure as an `EventFilter`
pub fn event_filter<F, Fut>(filter: F) -> EventFilter
where
    F: Fn(ContractEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<bool>> + Send + 'static,
{
    Arc::new(
        move |event: ContractEvent| -> BoxFuture<'static, anyhow::Result<bool>> {
            Box::pin(filter(event))
        },
    )
}

/// Wrap an async closure as an `EventHandler`
pub fn event_handler<F, Fut>(handler: F) -> EventHandler
where
    F: Fn(ContractEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(
        move |event: ContractEvent| -> BoxFuture<'static, anyhow::Result<()>> {
            Box::pin(handler(event))
        },
    )
}

/// Filter accepting every event
pub fn accept_all() -> EventFilter {
    event_filter(|_| async { Ok(true) })
}

/// First block a subscription receives events from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FromBlock {
    /// Only events arriving after the subscription was created
    #[default]
    Latest,
    /// Replay events from this block on, then continue live
    Number(u64),
}

/// What to remove
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unsubscribe {
    Subscription(SubscriptionId),
    /// Every subscription on one contract
    Contract(Address),
    /// Every subscription of the hub
    All,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ListenerKey {
    contract: Address,
    event_name: String,
}

type LogId = (Option<H256>, Option<H256>, Option<U256>);

/// Duplicate suppression while history is replayed into a subscription
enum Replay {
    /// Live events only
    Live,
    /// Replay running: every delivered log is recorded
    Running(HashSet<LogId>),
    /// Replay finished: logs it delivered are not delivered again
    Done(HashSet<LogId>),
}

struct Subscription {
    id: SubscriptionId,
    filter: EventFilter,
    handler: EventHandler,
    replay: std::sync::Mutex<Replay>,
}

impl Subscription {
    fn replay(&self) -> std::sync::MutexGuard<'_, Replay> {
        self.replay.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn start_replay(&self) {
        let mut replay = self.replay();
        let seen = match std::mem::replace(&mut *replay, Replay::Live) {
            Replay::Live => HashSet::new(),
            Replay::Running(seen) | Replay::Done(seen) => seen,
        };
        *replay = Replay::Running(seen);
    }

    fn finish_replay(&self) {
        let mut replay = self.replay();
        if let Replay::Running(seen) = std::mem::replace(&mut *replay, Replay::Live) {
            *replay = Replay::Done(seen);
        }
    }

    /// Whether `event` still has to be delivered to this subscription
    fn claim(&self, event: &ContractEvent) -> bool {
        let id = event.log_id();
        match &mut *self.replay() {
            Replay::Live => true,
            Replay::Running(seen) => seen.insert(id),
            Replay::Done(delivered) => !delivered.remove(&id),
        }
    }
}

struct Listener {
    handle: SubscriptionHandle,
    task: JoinHandle<()>,
}

struct HubInner {
    node: RwLock<Arc<dyn ChainNode>>,
    contract_loader: Arc<dyn ContractLoader>,
    name_resolver: Arc<dyn NameResolver>,
    config: EventHubConfig,
    /// pair -> subscriptions on it
    subscriptions: DashMap<ListenerKey, HashMap<SubscriptionId, Arc<Subscription>>>,
    /// subscription -> pair, for the lifetime of the subscription
    index: DashMap<SubscriptionId, ListenerKey>,
    listeners: DashMap<ListenerKey, Listener>,
    /// ABI entry used to decode the pair's logs
    events: DashMap<ListenerKey, Event>,
    locks: DashMap<ListenerKey, Arc<Mutex<()>>>,
    /// Highest block any delivered event came from
    high_water: AtomicU64,
}

impl HubInner {
    fn lock_for(&self, key: &ListenerKey) -> Arc<Mutex<()>> {
        self.locks.entry(key.clone()).or_default().clone()
    }

    /// Drop the bookkeeping of a pair nobody subscribes to.
    ///
    /// Last step under the pair lock; the lock entry goes only while no other
    /// caller holds a clone of it.
    fn prune_pair(&self, key: &ListenerKey) {
        if self.subscriptions.contains_key(key) || self.listeners.contains_key(key) {
            return;
        }
        self.events.remove(key);
        self.locks.remove_if(key, |_, lock| Arc::strong_count(lock) <= 2);
    }

    fn subscriptions_of(&self, key: &ListenerKey) -> Vec<Arc<Subscription>> {
        self.subscriptions
            .get(key)
            .map(|subscriptions| subscriptions.values().cloned().collect())
            .unwrap_or_default()
    }

    fn decode(&self, key: &ListenerKey, log: Log) -> Option<ContractEvent> {
        let event = self.events.get(key)?.clone();
        match ContractEvent::decode(&event, log) {
            Ok(decoded) => {
                if let Some(block) = decoded.block_number {
                    self.high_water.fetch_max(block, Ordering::SeqCst);
                }
                Some(decoded)
            }
            Err(e) => {
                warn!("Dropping undecodable {} log: {}", key.event_name, e);
                None
            }
        }
    }
}

/// Event subscription hub. Clones share all state.
#[derive(Clone)]
pub struct EventHub {
    inner: Arc<HubInner>,
}

impl EventHub {
    pub fn new(
        node: Arc<dyn ChainNode>,
        contract_loader: Arc<dyn ContractLoader>,
        name_resolver: Arc<dyn NameResolver>,
        config: EventHubConfig,
    ) -> Self {
        Self {
            inner: Arc::new(HubInner {
                node: RwLock::new(node),
                contract_loader,
                name_resolver,
                config,
                subscriptions: DashMap::new(),
                index: DashMap::new(),
                listeners: DashMap::new(),
                events: DashMap::new(),
                locks: DashMap::new(),
                high_water: AtomicU64::new(0),
            }),
        }
    }

    /// Subscribe `on_event` to `event_name` of a contract.
    ///
    /// `contract` is a loaded handle or a contract type name; the reserved
    /// system event contract name resolves its address through the name
    /// resolver and falls back to `address`.
    pub async fn subscribe(
        &self,
        contract: impl Into<ContractRef>,
        address: Address,
        event_name: &str,
        filter: EventFilter,
        on_event: EventHandler,
        from_block: FromBlock,
    ) -> RuntimeResult<SubscriptionId> {
        let id = Uuid::new_v4();
        self.subscribe_with_id(
            id,
            contract.into(),
            address,
            event_name,
            filter,
            on_event,
            from_block,
        )
        .await?;
        Ok(id)
    }

    /// Like `subscribe`, but `on_event` runs at most once and the
    /// subscription removes itself after the first accepted event
    pub async fn once(
        &self,
        contract: impl Into<ContractRef>,
        address: Address,
        event_name: &str,
        filter: EventFilter,
        on_event: EventHandler,
        from_block: FromBlock,
    ) -> RuntimeResult<SubscriptionId> {
        let id = Uuid::new_v4();
        let fired = Arc::new(AtomicBool::new(false));
        let hub = Arc::downgrade(&self.inner);

        let guarded = event_handler(move |event| {
            let fired = fired.clone();
            let on_event = on_event.clone();
            let hub = hub.clone();
            async move {
                if fired.swap(true, Ordering::SeqCst) {
                    return Ok(());
                }
                let result = on_event(event).await;
                if let Some(inner) = hub.upgrade() {
                    let hub = EventHub { inner };
                    if let Err(e) = hub.unsubscribe(Unsubscribe::Subscription(id)).await {
                        warn!("Failed to remove fired once-subscription {}: {}", id, e);
                    }
                }
                result
            }
        });

        self.subscribe_with_id(
            id,
            contract.into(),
            address,
            event_name,
            filter,
            guarded,
            from_block,
        )
        .await?;
        Ok(id)
    }

    #[allow(clippy::too_many_arguments)]
    async fn subscribe_with_id(
        &self,
        id: SubscriptionId,
        contract: ContractRef,
        address: Address,
        event_name: &str,
        filter: EventFilter,
        handler: EventHandler,
        from_block: FromBlock,
    ) -> RuntimeResult<()> {
        debug!("Subscribing to event \"{}\"", event_name);
        let contract = self.resolve(contract, address).await?;
        let event = contract.event(event_name)?.clone();
        let key = ListenerKey {
            contract: contract.address(),
            event_name: event_name.to_string(),
        };

        let replay = match from_block {
            FromBlock::Latest => Replay::Live,
            FromBlock::Number(_) => Replay::Running(HashSet::new()),
        };
        let subscription = Arc::new(Subscription {
            id,
            filter,
            handler,
            replay: std::sync::Mutex::new(replay),
        });

        {
            let lock = self.inner.lock_for(&key);
            let _guard = lock.lock().await;

            self.inner.events.entry(key.clone()).or_insert(event);
            self.inner
                .subscriptions
                .entry(key.clone())
                .or_default()
                .insert(id, subscription.clone());
            self.inner.index.insert(id, key.clone());

            if let Err(e) = self.ensure_listener(&key).await {
                self.inner.index.remove(&id);
                if let Some(mut subscriptions) = self.inner.subscriptions.get_mut(&key) {
                    subscriptions.remove(&id);
                }
                self.inner
                    .subscriptions
                    .remove_if(&key, |_, subscriptions| subscriptions.is_empty());
                self.inner.prune_pair(&key);
                return Err(e);
            }
        }

        if let FromBlock::Number(block) = from_block {
            if let Err(e) = self.replay_from(&key, &subscription, block).await {
                warn!("Replay for subscription {} failed: {}", id, e);
                self.unsubscribe(Unsubscribe::Subscription(id)).await.ok();
                return Err(e);
            }
        }

        info!(
            "Subscribed {} to {} on {:?}",
            id, key.event_name, key.contract
        );
        Ok(())
    }

    /// Contract handle the subscription targets
    async fn resolve(&self, contract: ContractRef, address: Address) -> RuntimeResult<Contract> {
        match contract {
            ContractRef::Named(name) if name == self.inner.config.contract_name => {
                let loader = &self.inner.contract_loader;
                if loader.compiled_contract(&name).is_none() {
                    return Err(RuntimeError::ContractLoad(format!(
                        "abi for contract type \"{}\" not found, supported interfaces are \"{}\"",
                        name,
                        loader.contract_names().join(",")
                    )));
                }
                let resolved = self
                    .inner
                    .name_resolver
                    .get_address(&self.inner.config.domain)
                    .await?;
                loader.load_contract(&name, resolved.unwrap_or(address))
            }
            ContractRef::Named(name) => self.inner.contract_loader.load_contract(&name, address),
            ContractRef::Loaded(contract) if address.is_zero() || address == contract.address() => {
                Ok(contract)
            }
            ContractRef::Loaded(contract) => Ok(Contract::new(
                contract.name(),
                address,
                contract.abi().clone(),
            )),
        }
    }

    /// Start the pair's node listener unless one is live. Pair lock must be held.
    async fn ensure_listener(&self, key: &ListenerKey) -> RuntimeResult<()> {
        if self.inner.listeners.contains_key(key) {
            return Ok(());
        }
        let topic = match self.inner.events.get(key) {
            Some(event) => event.signature(),
            None => return Ok(()),
        };

        let node = self.inner.node.read().await.clone();
        let filter = Filter::new().address(key.contract).topic0(topic);
        let subscription = node.subscribe_logs(filter).await?;

        let task = tokio::spawn(run_listener(
            Arc::downgrade(&self.inner),
            key.clone(),
            subscription.items,
        ));
        self.inner.listeners.insert(
            key.clone(),
            Listener {
                handle: subscription.handle,
                task,
            },
        );
        metrics::record_listener_started();
        debug!("Started listener for {} on {:?}", key.event_name, key.contract);
        Ok(())
    }

    /// Stop the pair's node listener if nobody subscribes to it. Pair lock must be held.
    async fn teardown_listener(&self, key: &ListenerKey) -> RuntimeResult<()> {
        let still_used = self
            .inner
            .subscriptions
            .get(key)
            .map_or(false, |subscriptions| !subscriptions.is_empty());
        if still_used {
            return Ok(());
        }

        if let Some((_, listener)) = self.inner.listeners.remove(key) {
            listener.task.abort();
            metrics::record_listener_stopped();
            listener.handle.unsubscribe().await.map_err(|e| {
                RuntimeError::Unsubscribe(format!(
                    "{} on {:?}: {}",
                    key.event_name, key.contract, e
                ))
            })?;
            debug!("Stopped listener for {} on {:?}", key.event_name, key.contract);
        }
        Ok(())
    }

    /// Deliver past events from `block` on to one subscription
    async fn replay_from(
        &self,
        key: &ListenerKey,
        subscription: &Arc<Subscription>,
        block: u64,
    ) -> RuntimeResult<()> {
        subscription.start_replay();
        let topic = match self.inner.events.get(key) {
            Some(event) => event.signature(),
            None => return Ok(()),
        };

        let node = self.inner.node.read().await.clone();
        let filter = Filter::new()
            .address(key.contract)
            .topic0(topic)
            .from_block(block);
        let logs = node.logs(&filter).await;
        let logs = match logs {
            Ok(logs) => logs,
            Err(e) => {
                subscription.finish_replay();
                return Err(e.into());
            }
        };

        debug!(
            "Replaying {} {} events from block {} to {}",
            logs.len(),
            key.event_name,
            block,
            subscription.id
        );
        for log in logs {
            if let Some(event) = self.inner.decode(key, log) {
                if subscription.claim(&event) {
                    dispatch(subscription.clone(), event);
                }
            }
        }
        subscription.finish_replay();
        Ok(())
    }

    /// Remove subscriptions; listeners without subscribers are torn down
    pub async fn unsubscribe(&self, target: Unsubscribe) -> RuntimeResult<()> {
        debug!("Unsubscribing from {:?}", target);
        let ids: Vec<SubscriptionId> = match &target {
            Unsubscribe::Subscription(id) => vec![*id],
            Unsubscribe::Contract(contract) => self
                .inner
                .index
                .iter()
                .filter(|entry| entry.value().contract == *contract)
                .map(|entry| *entry.key())
                .collect(),
            Unsubscribe::All => self.inner.index.iter().map(|entry| *entry.key()).collect(),
        };

        let mut first_error = None;
        for id in ids {
            if let Err(e) = self.unsubscribe_one(id).await {
                error!("Unsubscribing {} failed: {}", id, e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn unsubscribe_one(&self, id: SubscriptionId) -> RuntimeResult<()> {
        let key = match self.inner.index.get(&id) {
            Some(key) => key.clone(),
            None => {
                debug!("Subscription {} already removed", id);
                return Ok(());
            }
        };

        let lock = self.inner.lock_for(&key);
        let _guard = lock.lock().await;

        if self.inner.index.remove(&id).is_none() {
            return Ok(());
        }
        if let Some(mut subscriptions) = self.inner.subscriptions.get_mut(&key) {
            subscriptions.remove(&id);
        }
        self.inner
            .subscriptions
            .remove_if(&key, |_, subscriptions| subscriptions.is_empty());

        let result = self.teardown_listener(&key).await;
        self.inner.prune_pair(&key);
        result
    }

    /// Move all listeners to `node` after a reconnect.
    ///
    /// Old listener handles are dropped with their dead connection;
    /// subscriptions keep their ids and callbacks. With
    /// `resume_from_last_block` events after the highest seen block are
    /// replayed into every subscription.
    pub async fn resubscribe(&self, node: Arc<dyn ChainNode>) -> RuntimeResult<()> {
        *self.inner.node.write().await = node;
        metrics::record_resubscribe();

        let resume_from = match self.highest_seen_block() {
            block if self.inner.config.resume_from_last_block && block > 0 => Some(block + 1),
            _ => None,
        };

        let mut keys: Vec<ListenerKey> = self
            .inner
            .listeners
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for entry in self.inner.subscriptions.iter() {
            if !keys.contains(entry.key()) {
                keys.push(entry.key().clone());
            }
        }

        let mut first_error = None;
        for key in keys {
            let lock = self.inner.lock_for(&key);
            let guard = lock.lock().await;

            if let Some((_, listener)) = self.inner.listeners.remove(&key) {
                listener.task.abort();
                metrics::record_listener_stopped();
            }
            let subscriptions = self.inner.subscriptions_of(&key);
            if subscriptions.is_empty() {
                self.inner.prune_pair(&key);
                continue;
            }
            if let Err(e) = self.ensure_listener(&key).await {
                error!("Resubscribing {} on {:?} failed: {}", key.event_name, key.contract, e);
                first_error.get_or_insert(e);
                continue;
            }
            drop(guard);

            if let Some(block) = resume_from {
                for subscription in &subscriptions {
                    if let Err(e) = self.replay_from(&key, subscription, block).await {
                        warn!("Replay after reconnect failed for {}: {}", subscription.id, e);
                    }
                }
            }
        }

        info!(
            "Resubscribed {} listeners for {} subscriptions",
            self.listener_count(),
            self.subscription_count()
        );
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Resubscribe automatically whenever `node` announces a new connection
    pub fn bind_resubscribe(&self, node: &Arc<dyn ChainNode>) -> JoinHandle<()> {
        let hub = Arc::downgrade(&self.inner);
        let mut reconnects = node.reconnects();

        tokio::spawn(async move {
            loop {
                match reconnects.recv().await {
                    Ok(node) => {
                        let Some(inner) = hub.upgrade() else {
                            break;
                        };
                        reconnects = node.reconnects();
                        if let Err(e) = (EventHub { inner }).resubscribe(node).await {
                            error!("Resubscribe after reconnect failed: {}", e);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Missed {} reconnect announcements", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Live node-side listeners
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.len()
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.index.len()
    }

    /// Highest block number of any delivered event
    pub fn highest_seen_block(&self) -> u64 {
        self.inner.high_water.load(Ordering::SeqCst)
    }
}

/// Fan the pair's logs out to its current subscriptions
async fn run_listener(
    hub: Weak<HubInner>,
    key: ListenerKey,
    mut items: mpsc::UnboundedReceiver<Log>,
) {
    while let Some(log) = items.recv().await {
        let Some(inner) = hub.upgrade() else {
            return;
        };
        let Some(event) = inner.decode(&key, log) else {
            continue;
        };
        for subscription in inner.subscriptions_of(&key) {
            if subscription.claim(&event) {
                dispatch(subscription, event.clone());
            }
        }
    }
    debug!("Log stream for {} on {:?} ended", key.event_name, key.contract);
}

/// Run one subscription's filter and handler on its own task
fn dispatch(subscription: Arc<Subscription>, event: ContractEvent) {
    tokio::spawn(async move {
        let event_name = event.event_name.clone();
        match (subscription.filter)(event.clone()).await {
            Ok(true) => {
                metrics::record_event_dispatched(&event_name);
                if let Err(e) = (subscription.handler)(event).await {
                    error!(
                        "Error while handling {} event in subscription {}: {:#}",
                        event_name, subscription.id, e
                    );
                }
            }
            Ok(false) => {}
            Err(e) => error!(
                "Error while filtering {} event in subscription {}: {:#}",
                event_name, subscription.id, e
            ),
        }
    });
}
