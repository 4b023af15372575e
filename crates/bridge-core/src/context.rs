//! Hosting context for bridges
//!
//! [`BridgingCore`] owns everything the bridging subsystem shares: the
//! configuration, the technology and builtin feature registries, the
//! after-bridge datastore, the set of registered bridges, and the tasks of
//! departable imparted channels. It is cheap to clone.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::join_all;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::after_bridge::AfterBridgeStore;
use crate::bridge::{BaseBridge, Bridge, BridgeFlags, BridgeId, BridgeMethods, UnregisteredBridge};
use crate::bridge_channel::{BridgeChannel, BridgeChannelState};
use crate::channel::{ChannelHandle, ChannelId};
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::features::FeatureRegistry;
use crate::technology::{Capabilities, TechnologyRegistry};

/// Driver task of a channel imparted without `independent`
pub(crate) struct DepartableTask {
    pub(crate) bridge_channel: Arc<BridgeChannel>,
    pub(crate) handle: JoinHandle<BridgeChannelState>,
}

pub(crate) struct CoreInner {
    pub(crate) config: BridgeConfig,
    pub(crate) technologies: TechnologyRegistry,
    pub(crate) features: FeatureRegistry,
    pub(crate) after_bridge: AfterBridgeStore,
    bridges: DashMap<BridgeId, Arc<Bridge>>,
    /// Channels currently bound into some bridge
    bridged: DashMap<ChannelId, Arc<BridgeChannel>>,
    pub(crate) departable: DashMap<ChannelId, DepartableTask>,
    shutting_down: AtomicBool,
}

impl CoreInner {
    pub(crate) fn unregister(&self, id: &BridgeId) {
        if self.bridges.remove(id).is_some() {
            debug!("Bridge {} unregistered", id);
        }
    }

    /// Claim `channel` for a bridge. A channel can only be bound once.
    pub(crate) fn begin_bridging(&self, bridge_channel: &Arc<BridgeChannel>) -> Result<()> {
        match self.bridged.entry(bridge_channel.id().clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(BridgeError::AlreadyBridged(bridge_channel.id().clone()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(bridge_channel.clone());
                Ok(())
            }
        }
    }

    pub(crate) fn end_bridging(&self, channel: &ChannelId) {
        self.bridged.remove(channel);
    }
}

/// The bridging subsystem
#[derive(Clone)]
pub struct BridgingCore {
    inner: Arc<CoreInner>,
}

impl BridgingCore {
    /// Create a core with no technologies registered
    pub fn new(config: BridgeConfig) -> Result<Self> {
        Self::with_registry(config, TechnologyRegistry::new())
    }

    /// Create a core with the built-in relay technologies and the default
    /// builtin features
    pub fn with_default_technologies(config: BridgeConfig) -> Result<Self> {
        Self::with_registry(config, TechnologyRegistry::with_builtins())
    }

    fn with_registry(config: BridgeConfig, technologies: TechnologyRegistry) -> Result<Self> {
        config.validate()?;
        info!(
            "Starting bridging core with technologies [{}]",
            technologies.names().join(", ")
        );
        Ok(Self {
            inner: Arc::new(CoreInner {
                config,
                technologies,
                features: FeatureRegistry::with_defaults(),
                after_bridge: AfterBridgeStore::new(),
                bridges: DashMap::new(),
                bridged: DashMap::new(),
                departable: DashMap::new(),
                shutting_down: AtomicBool::new(false),
            }),
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    pub fn technologies(&self) -> &TechnologyRegistry {
        &self.inner.technologies
    }

    pub fn features(&self) -> &FeatureRegistry {
        &self.inner.features
    }

    pub fn after_bridge(&self) -> &AfterBridgeStore {
        &self.inner.after_bridge
    }

    /// First construction step: an empty bridge of the class `methods`
    pub fn allocate(&self, methods: Arc<dyn BridgeMethods>) -> Result<UnregisteredBridge> {
        if self.inner.shutting_down.load(Ordering::Acquire) {
            return Err(BridgeError::Allocation("bridging core is shutting down".to_string()));
        }
        Ok(UnregisteredBridge::new(methods, Arc::downgrade(&self.inner)))
    }

    /// Second step: pick a technology for `capabilities` and set defaults.
    /// An earlier failure passes through.
    pub fn base_init(
        &self,
        bridge: Result<UnregisteredBridge>,
        capabilities: Capabilities,
        flags: BridgeFlags,
    ) -> Result<UnregisteredBridge> {
        bridge?.init(capabilities, flags)
    }

    /// Final step: publish the bridge. An earlier failure passes through;
    /// a failure here reclaims the bridge.
    pub fn register(&self, bridge: Result<UnregisteredBridge>) -> Result<Arc<Bridge>> {
        let bridge = bridge?.into_bridge(&self.inner)?;
        if self.inner.shutting_down.load(Ordering::Acquire) {
            return Err(BridgeError::Allocation("bridging core is shutting down".to_string()));
        }
        self.inner.bridges.insert(bridge.id().clone(), bridge.clone());
        info!(
            "Registered bridge {} ({}, technology {})",
            bridge.id(),
            bridge.methods().name(),
            bridge.technology_name()
        );
        Ok(bridge)
    }

    /// Allocate, initialize and register a [`BaseBridge`]
    pub fn new_bridge(&self, capabilities: Capabilities, flags: BridgeFlags) -> Result<Arc<Bridge>> {
        self.register(self.base_init(self.allocate(Arc::new(BaseBridge)), capabilities, flags))
    }

    pub fn find_bridge(&self, id: &BridgeId) -> Option<Arc<Bridge>> {
        self.inner.bridges.get(id).map(|b| b.value().clone())
    }

    /// Every registered bridge, in no particular order
    pub fn bridges(&self) -> Vec<Arc<Bridge>> {
        self.inner.bridges.iter().map(|b| b.value().clone()).collect()
    }

    pub fn bridge_count(&self) -> usize {
        self.inner.bridges.len()
    }

    /// The bridge channel `channel` is bound to, if any
    pub fn find_bridge_channel(&self, channel: &ChannelId) -> Option<Arc<BridgeChannel>> {
        self.inner.bridged.get(channel).map(|bc| bc.value().clone())
    }

    pub fn is_departable(&self, channel: &ChannelId) -> bool {
        self.inner.departable.contains_key(channel)
    }

    /// Take back a channel imparted without `independent`. The channel
    /// leaves its bridge with `END`, is not hung up, and is returned once
    /// its driver has finished.
    pub async fn depart(&self, channel: &ChannelId) -> Result<Arc<dyn ChannelHandle>> {
        let (_, task) = self
            .inner
            .departable
            .remove(channel)
            .ok_or_else(|| BridgeError::NotDepartable(channel.clone()))?;

        let bridge_channel = task.bridge_channel;
        let marked = bridge_channel.with_bridge(|_, guard| {
            bridge_channel.mark_departing(guard);
        });
        if marked.is_none() {
            debug!("{} already left its bridge before depart", bridge_channel.name());
        }
        bridge_channel.change_state(BridgeChannelState::End);

        match task.handle.await {
            Ok(state) => debug!("Departed {} with state {:?}", bridge_channel.name(), state),
            Err(e) => warn!("Driver of {} ended abnormally: {}", bridge_channel.name(), e),
        }
        info!("Channel {} departed", bridge_channel.name());
        Ok(bridge_channel.channel().clone())
    }

    /// Dissolve every registered bridge. New bridges are refused afterwards.
    pub async fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::Release);
        let bridges = self.bridges();
        info!("Shutting down bridging core with {} bridges", bridges.len());
        for bridge in bridges {
            bridge.dissolve();
        }

        let departable: Vec<ChannelId> = self.inner.departable.iter().map(|t| t.key().clone()).collect();
        let tasks = departable
            .iter()
            .filter_map(|channel| self.inner.departable.remove(channel))
            .map(|(channel, task)| async move {
                if let Err(e) = task.handle.await {
                    warn!("Driver of {} ended abnormally: {}", channel, e);
                }
            });
        join_all(tasks).await;
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for BridgingCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgingCore")
            .field("bridges", &self.inner.bridges.len())
            .field("bridged_channels", &self.inner.bridged.len())
            .field("technologies", &self.inner.technologies.names())
            .finish()
    }
}
