//! Actions routed through bridge and bridge-channel queues
//!
//! [`ChannelAction`] is the ordinary kind that either queue may carry and
//! the only kind callers can queue. The bridge queue internally also holds
//! two deferred kinds that own resources; only the bridge's own
//! reconfiguration pass produces and consumes them.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::bridge::BridgeId;
use crate::technology::{BridgeTechnology, TechPvt};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelAction {
    /// Collect a DTMF feature sequence starting with `digit`
    Feature { digit: char },
    /// Run due interval hooks
    Interval,
    /// Send the digits to the channel
    DtmfStream(String),
    TalkingStart,
    TalkingStop,
    /// Play a file to the channel, optionally with hold music for the peers
    PlayFile {
        file: String,
        moh_class: Option<String>,
    },
    /// Run an application on the channel, optionally with hold music for the peers
    RunApp {
        app: String,
        args: Option<String>,
        moh_class: Option<String>,
    },
}

impl ChannelAction {
    pub fn kind(&self) -> &'static str {
        match self {
            ChannelAction::Feature { .. } => "feature",
            ChannelAction::Interval => "interval",
            ChannelAction::DtmfStream(_) => "dtmf-stream",
            ChannelAction::TalkingStart => "talking-start",
            ChannelAction::TalkingStop => "talking-stop",
            ChannelAction::PlayFile { .. } => "play-file",
            ChannelAction::RunApp { .. } => "run-app",
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) enum BridgeAction {
    /// Delivered to every member still in the bridge
    Channel(ChannelAction),
    /// Release a detached technology's private state
    DeferredTechDestroy(DeferredTechDestroy),
    /// Unregister the bridge and notify its methods that it is dissolving
    DeferredDissolving,
}

impl BridgeAction {
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            BridgeAction::Channel(action) => action.kind(),
            BridgeAction::DeferredTechDestroy(_) => "deferred-tech-destroy",
            BridgeAction::DeferredDissolving => "deferred-dissolving",
        }
    }
}

impl From<ChannelAction> for BridgeAction {
    fn from(action: ChannelAction) -> Self {
        BridgeAction::Channel(action)
    }
}

struct DetachedTechnology {
    bridge: BridgeId,
    technology: Arc<dyn BridgeTechnology>,
    pvt: TechPvt,
}

/// Ownership ticket for a detached technology. Clones share the ticket, and
/// whichever copy is released first performs the destroy.
#[derive(Clone)]
pub(crate) struct DeferredTechDestroy {
    slot: Arc<Mutex<Option<DetachedTechnology>>>,
}

impl DeferredTechDestroy {
    pub(crate) fn new(bridge: BridgeId, technology: Arc<dyn BridgeTechnology>, pvt: TechPvt) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Some(DetachedTechnology {
                bridge,
                technology,
                pvt,
            }))),
        }
    }

    /// Destroy the technology state. Returns false if it was already released.
    pub(crate) fn release(&self) -> bool {
        let Some(detached) = self.slot.lock().take() else {
            return false;
        };
        debug!(
            "Destroying detached technology {} of {}",
            detached.technology.name(),
            detached.bridge
        );
        detached.technology.destroy(&detached.bridge, detached.pvt);
        true
    }

    pub(crate) fn is_released(&self) -> bool {
        self.slot.lock().is_none()
    }
}

impl std::fmt::Debug for DeferredTechDestroy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredTechDestroy")
            .field("released", &self.is_released())
            .finish()
    }
}
