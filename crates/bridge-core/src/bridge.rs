//! Bridges
//!
//! A [`Bridge`] owns an ordered set of [`BridgeChannel`]s, the technology
//! moving media between them, a bridge-level action queue and the video
//! source mode. All of its mutable state lives in [`BridgeState`] behind one
//! lock; [`Bridge::lock`] hands out a [`BridgeGuard`] that releases it on
//! every exit path and, in debug builds, records where it was taken.
//!
//! # Lifecycle
//!
//! Construction is a chain of fallible steps, each passing an earlier
//! failure through untouched so callers need not branch between them:
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use rvoip_bridge_core::{BaseBridge, BridgeConfig, BridgeFlags, BridgingCore, Capabilities};
//!
//! # fn main() -> rvoip_bridge_core::Result<()> {
//! let core = BridgingCore::with_default_technologies(BridgeConfig::default())?;
//! let bridge = core.register(core.base_init(
//!     core.allocate(Arc::new(BaseBridge)),
//!     Capabilities::MULTI_MIX,
//!     BridgeFlags::DISSOLVE_HANGUP,
//! ))?;
//! # let _ = bridge;
//! # Ok(())
//! # }
//! ```
//!
//! Until [`BridgingCore::register`](crate::context::BridgingCore::register)
//! publishes it, the bridge is an [`UnregisteredBridge`] that nothing else
//! can join. [`Bridge::destroy`] dissolves and unregisters it; the methods'
//! destructor runs when the last reference goes away.

use std::collections::VecDeque;
use std::fmt;
use std::ops::{BitOr, Deref, DerefMut};
#[cfg(debug_assertions)]
use std::panic::Location;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::action::{BridgeAction, ChannelAction, DeferredTechDestroy};
use crate::bridge_channel::BridgeChannel;
use crate::channel::ChannelId;
use crate::context::CoreInner;
use crate::error::{BridgeError, Result};
use crate::features::BridgeFeatures;
use crate::frame::{ControlFrame, Frame};
use crate::technology::{BridgeTechnology, Capabilities, TechBridge, TechPvt};
use crate::video::{TalkerParams, VideoMode, VideoModeKind};

/// Unique identifier of a bridge
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BridgeId(pub String);

impl BridgeId {
    pub fn new() -> Self {
        Self(format!("bridge_{}", uuid::Uuid::new_v4()))
    }

    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for BridgeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BridgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Behavior flags of a bridge
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BridgeFlags(u32);

impl BridgeFlags {
    pub const NONE: BridgeFlags = BridgeFlags(0);
    /// Dissolve when any member hangs up
    pub const DISSOLVE_HANGUP: BridgeFlags = BridgeFlags(1 << 0);
    /// Dissolve when the last member leaves
    pub const DISSOLVE_EMPTY: BridgeFlags = BridgeFlags(1 << 1);
    /// Switch between two-party and multi-party technologies by member count
    pub const SMART: BridgeFlags = BridgeFlags(1 << 2);
    /// Other bridges may not merge into this one
    pub const MERGE_INHIBIT_TO: BridgeFlags = BridgeFlags(1 << 3);
    /// This bridge may not merge into another
    pub const MERGE_INHIBIT_FROM: BridgeFlags = BridgeFlags(1 << 4);
    /// Membership only changes through masquerades
    pub const MASQUERADE_ONLY: BridgeFlags = BridgeFlags(1 << 5);

    pub fn contains(&self, other: BridgeFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: BridgeFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: BridgeFlags) {
        self.0 &= !other.0;
    }
}

impl BitOr for BridgeFlags {
    type Output = BridgeFlags;

    fn bitor(self, rhs: BridgeFlags) -> BridgeFlags {
        BridgeFlags(self.0 | rhs.0)
    }
}

/// Per-class behavior of a bridge. Every hook except `destroy` and
/// `dissolving` runs with the bridge locked.
pub trait BridgeMethods: Send + Sync {
    fn name(&self) -> &str {
        "base"
    }

    /// The bridge is being reclaimed
    fn destroy(&self, bridge: &BridgeId) {
        let _ = bridge;
    }

    /// The bridge was dissolved and unregistered
    fn dissolving(&self, bridge: &BridgeId) {
        let _ = bridge;
    }

    /// Whether `channel` may enter, optionally replacing `swap`
    fn can_push(&self, bridge: &BridgeState, channel: &Arc<BridgeChannel>, swap: Option<&Arc<BridgeChannel>>) -> bool {
        let _ = (bridge, channel, swap);
        true
    }

    /// `channel` is entering. An error rejects it.
    fn push(&self, bridge: &mut BridgeState, channel: &Arc<BridgeChannel>, swap: Option<&Arc<BridgeChannel>>) -> Result<()> {
        let _ = (bridge, channel, swap);
        Ok(())
    }

    /// `channel` is leaving
    fn pull(&self, bridge: &mut BridgeState, channel: &Arc<BridgeChannel>) {
        let _ = (bridge, channel);
    }

    /// The channel handle behind `channel` was replaced
    fn notify_masquerade(&self, bridge: &mut BridgeState, channel: &Arc<BridgeChannel>) {
        let _ = (bridge, channel);
    }
}

/// Plain bridge with no class-specific behavior
#[derive(Debug, Default)]
pub struct BaseBridge;

impl BridgeMethods for BaseBridge {}

/// Mutable bridge state, reachable only through [`BridgeGuard`]
pub struct BridgeState {
    pub(crate) id: BridgeId,
    pub(crate) technology: Arc<dyn BridgeTechnology>,
    pub(crate) tech_pvt: TechPvt,
    pub(crate) channels: Vec<Arc<BridgeChannel>>,
    pub(crate) actions: VecDeque<BridgeAction>,
    pub(crate) video_mode: VideoMode,
    pub(crate) talker_params: TalkerParams,
    pub(crate) flags: BridgeFlags,
    pub(crate) allowed_capabilities: Capabilities,
    pub(crate) features: BridgeFeatures,
    pub(crate) num_active: usize,
    pub(crate) inhibit_merge: u32,
    pub(crate) internal_sample_rate: u32,
    pub(crate) mixing_interval: u32,
    pub(crate) reconfigured: bool,
    pub(crate) dissolved: bool,
    pub(crate) dissolving_queued: bool,
    pub(crate) dissolving_done: bool,
    #[cfg(debug_assertions)]
    pub(crate) lock_site: Option<&'static Location<'static>>,
}

impl BridgeState {
    pub fn id(&self) -> &BridgeId {
        &self.id
    }

    /// Members in join order
    pub fn channels(&self) -> &[Arc<BridgeChannel>] {
        &self.channels
    }

    pub fn find_channel(&self, channel: &ChannelId) -> Option<&Arc<BridgeChannel>> {
        self.channels.iter().find(|bc| bc.id() == channel)
    }

    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    /// Members that are not suspended
    pub fn num_active(&self) -> usize {
        self.num_active
    }

    pub fn merge_inhibit(&self) -> u32 {
        self.inhibit_merge
    }

    pub fn is_dissolved(&self) -> bool {
        self.dissolved
    }

    pub fn is_reconfigured(&self) -> bool {
        self.reconfigured
    }

    pub fn flags(&self) -> BridgeFlags {
        self.flags
    }

    pub fn technology(&self) -> &Arc<dyn BridgeTechnology> {
        &self.technology
    }

    pub fn video_mode(&self) -> &VideoMode {
        &self.video_mode
    }

    /// Bridge-wide features, used for members without their own
    pub fn features(&self) -> &BridgeFeatures {
        &self.features
    }

    pub fn internal_sample_rate(&self) -> u32 {
        self.internal_sample_rate
    }

    pub fn mixing_interval(&self) -> u32 {
        self.mixing_interval
    }

    pub fn pending_actions(&self) -> usize {
        self.actions.len()
    }

    /// Where the lock was last acquired
    #[cfg(debug_assertions)]
    pub fn lock_site(&self) -> Option<&'static Location<'static>> {
        self.lock_site
    }

    /// Run `f` with the attached technology and a view of this bridge
    pub(crate) fn with_tech<R>(&mut self, f: impl FnOnce(&dyn BridgeTechnology, &mut TechBridge<'_>) -> R) -> R {
        let technology = self.technology.clone();
        let mut view = TechBridge {
            id: &self.id,
            channels: &self.channels,
            pvt: &mut self.tech_pvt,
            video_mode: &self.video_mode,
            internal_sample_rate: self.internal_sample_rate,
            mixing_interval: self.mixing_interval,
        };
        f(technology.as_ref(), &mut view)
    }
}

/// Scoped bridge lock
pub struct BridgeGuard<'a> {
    guard: MutexGuard<'a, BridgeState>,
}

impl Deref for BridgeGuard<'_> {
    type Target = BridgeState;

    fn deref(&self) -> &BridgeState {
        &self.guard
    }
}

impl DerefMut for BridgeGuard<'_> {
    fn deref_mut(&mut self) -> &mut BridgeState {
        &mut self.guard
    }
}

/// A bridge that exists but is not yet visible to anything but its creator
pub struct UnregisteredBridge {
    id: BridgeId,
    methods: Arc<dyn BridgeMethods>,
    core: Weak<CoreInner>,
    state: Option<BridgeState>,
}

impl UnregisteredBridge {
    pub(crate) fn new(methods: Arc<dyn BridgeMethods>, core: Weak<CoreInner>) -> Self {
        Self {
            id: BridgeId::new(),
            methods,
            core,
            state: None,
        }
    }

    pub fn id(&self) -> &BridgeId {
        &self.id
    }

    pub fn is_initialized(&self) -> bool {
        self.state.is_some()
    }

    /// Select a technology and fill in the default state
    pub(crate) fn init(mut self, capabilities: Capabilities, flags: BridgeFlags) -> Result<Self> {
        let core = self
            .core
            .upgrade()
            .ok_or_else(|| BridgeError::Allocation("bridging core is gone".to_string()))?;

        let wanted = if flags.contains(BridgeFlags::SMART) {
            if capabilities.contains(Capabilities::ONE_TO_ONE_MIX) || capabilities.is_empty() {
                Capabilities::ONE_TO_ONE_MIX
            } else {
                Capabilities::MULTI_MIX
            }
        } else {
            capabilities
        };
        let technology = core.technologies.find_best(wanted)?;

        let mut state = BridgeState {
            id: self.id.clone(),
            technology,
            tech_pvt: None,
            channels: Vec::new(),
            actions: VecDeque::new(),
            video_mode: VideoMode::None,
            talker_params: TalkerParams::from_config(&core.config),
            flags,
            allowed_capabilities: capabilities,
            features: BridgeFeatures::new(),
            num_active: 0,
            inhibit_merge: 0,
            internal_sample_rate: core.config.default_internal_sample_rate,
            mixing_interval: core.config.default_mixing_interval_ms,
            reconfigured: false,
            dissolved: false,
            dissolving_queued: false,
            dissolving_done: false,
            #[cfg(debug_assertions)]
            lock_site: None,
        };

        state.with_tech(|tech, view| {
            tech.create(view)?;
            tech.start(view)
        })?;
        debug!(
            "Bridge {} initialized with technology {} ({})",
            self.id,
            state.technology.name(),
            capabilities
        );
        self.state = Some(state);
        Ok(self)
    }

    /// Turn into a shareable bridge. Called by the registry only.
    pub(crate) fn into_bridge(mut self, core: &Arc<CoreInner>) -> Result<Arc<Bridge>> {
        if !std::ptr::eq(self.core.as_ptr(), Arc::as_ptr(core)) {
            return Err(BridgeError::Allocation(format!(
                "bridge {} belongs to another core",
                self.id
            )));
        }
        let state = self.state.take().ok_or_else(|| {
            BridgeError::Allocation(format!("bridge {} registered before base_init", self.id))
        })?;
        Ok(Arc::new(Bridge {
            id: self.id.clone(),
            methods: self.methods.clone(),
            core: self.core.clone(),
            state: Mutex::new(state),
        }))
    }
}

impl Drop for UnregisteredBridge {
    fn drop(&mut self) {
        if let Some(mut state) = self.state.take() {
            debug!("Discarding unregistered bridge {}", self.id);
            state.with_tech(|tech, view| tech.stop(view));
            let technology = state.technology.clone();
            technology.destroy(&self.id, state.tech_pvt.take());
        }
    }
}

pub struct Bridge {
    id: BridgeId,
    methods: Arc<dyn BridgeMethods>,
    core: Weak<CoreInner>,
    state: Mutex<BridgeState>,
}

/// Point-in-time description of a bridge
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BridgeSnapshot {
    pub id: BridgeId,
    pub class: String,
    pub technology: String,
    pub num_channels: usize,
    pub num_active: usize,
    pub merge_inhibit: u32,
    pub dissolved: bool,
    pub video_mode: VideoModeKind,
    pub channels: Vec<String>,
}

impl BridgeSnapshot {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| format!("{{\"error\":\"{}\"}}", e))
    }
}

impl Bridge {
    pub fn id(&self) -> &BridgeId {
        &self.id
    }

    pub fn methods(&self) -> &Arc<dyn BridgeMethods> {
        &self.methods
    }

    pub(crate) fn core(&self) -> Option<Arc<CoreInner>> {
        self.core.upgrade()
    }

    /// Lock the bridge. Never call while holding a bridge channel's lock.
    #[track_caller]
    pub fn lock(&self) -> BridgeGuard<'_> {
        #[allow(unused_mut)]
        let mut guard = self.state.lock();
        #[cfg(debug_assertions)]
        {
            guard.lock_site = Some(Location::caller());
        }
        BridgeGuard { guard }
    }

    pub fn num_channels(&self) -> usize {
        self.lock().num_channels()
    }

    pub fn num_active(&self) -> usize {
        self.lock().num_active()
    }

    pub fn is_dissolved(&self) -> bool {
        self.lock().dissolved
    }

    pub fn technology_name(&self) -> String {
        self.lock().technology.name().to_string()
    }

    pub fn channel_ids(&self) -> Vec<ChannelId> {
        self.lock().channels.iter().map(|bc| bc.id().clone()).collect()
    }

    pub fn has_channel(&self, channel: &ChannelId) -> bool {
        self.lock().find_channel(channel).is_some()
    }

    pub fn snapshot(&self) -> BridgeSnapshot {
        let state = self.lock();
        BridgeSnapshot {
            id: self.id.clone(),
            class: self.methods.name().to_string(),
            technology: state.technology.name().to_string(),
            num_channels: state.channels.len(),
            num_active: state.num_active,
            merge_inhibit: state.inhibit_merge,
            dissolved: state.dissolved,
            video_mode: state.video_mode.kind(),
            channels: state.channels.iter().map(|bc| bc.name().to_string()).collect(),
        }
    }

    /// Every member points back at this bridge and the active count is
    /// bounded by the member count.
    pub fn check_consistency(self: &Arc<Self>) -> bool {
        let state = self.lock();
        state.num_active <= state.channels.len()
            && state.channels.iter().all(|bc| {
                bc.in_bridge() && bc.bridge().is_some_and(|b| Arc::ptr_eq(&b, self))
            })
    }

    /// Adjust the merge block counter by `delta`, clamping at zero
    pub fn merge_inhibit(&self, delta: i32) -> u32 {
        let mut state = self.lock();
        state.inhibit_merge = if delta >= 0 {
            state.inhibit_merge.saturating_add(delta as u32)
        } else {
            state.inhibit_merge.saturating_sub(delta.unsigned_abs())
        };
        trace!("Bridge {} merge inhibit now {}", self.id, state.inhibit_merge);
        state.inhibit_merge
    }

    pub fn flags(&self) -> BridgeFlags {
        self.lock().flags
    }

    pub fn set_flags(&self, flags: BridgeFlags) {
        self.lock().flags.insert(flags);
    }

    pub fn clear_flags(&self, flags: BridgeFlags) {
        self.lock().flags.remove(flags);
    }

    /// Edit the bridge-wide features
    pub fn with_features<R>(&self, f: impl FnOnce(&mut BridgeFeatures) -> R) -> R {
        f(&mut self.lock().features)
    }

    /// Sample rate hint for mixing technologies, 0 lets them decide
    pub fn set_internal_sample_rate(self: &Arc<Self>, sample_rate: u32) {
        {
            let mut state = self.lock();
            state.internal_sample_rate = sample_rate;
            state.reconfigured = true;
        }
        self.reconfigure();
    }

    /// Mixing interval hint in milliseconds, 0 lets the technology decide
    pub fn set_mixing_interval(self: &Arc<Self>, interval_ms: u32) {
        {
            let mut state = self.lock();
            state.mixing_interval = interval_ms;
            state.reconfigured = true;
        }
        self.reconfigure();
    }

    pub fn internal_sample_rate(&self) -> u32 {
        self.lock().internal_sample_rate
    }

    pub fn mixing_interval(&self) -> u32 {
        self.lock().mixing_interval
    }

    /// Put an action on the bridge queue. It runs on the next
    /// reconfiguration pass, performed by whichever caller gets there first.
    pub fn queue_action(&self, action: ChannelAction) {
        debug!("Queueing {} on bridge {}", action.kind(), self.id);
        self.lock().actions.push_back(BridgeAction::Channel(action));
    }

    /// Queue an action and run the reconfiguration pass before returning
    pub fn write_action(self: &Arc<Self>, action: ChannelAction) {
        self.queue_action(action);
        self.reconfigure();
    }

    /// Queue DTMF digits on every member except `from`
    pub fn dtmf_stream(&self, digits: &str, from: Option<&ChannelId>) {
        let state = self.lock();
        self.dtmf_stream_locked(&state, digits, from);
    }

    pub(crate) fn dtmf_stream_locked(&self, state: &BridgeState, digits: &str, from: Option<&ChannelId>) {
        if digits.is_empty() {
            return;
        }
        for bc in state.channels.iter().filter(|bc| Some(bc.id()) != from) {
            if let Err(e) = bc.queue_action(ChannelAction::DtmfStream(digits.to_string())) {
                trace!("Not streaming DTMF to {}: {}", bc.name(), e);
            }
        }
    }

    /// The channel handle behind `channel` was swapped out underneath the bridge
    pub fn notify_masquerade(self: &Arc<Self>, channel: &ChannelId) -> Result<()> {
        {
            let mut state = self.lock();
            let bc = state
                .find_channel(channel)
                .cloned()
                .ok_or_else(|| BridgeError::NotInBridge {
                    bridge: self.id.clone(),
                    channel: channel.clone(),
                })?;
            self.methods.notify_masquerade(&mut state, &bc);
            self.make_compatible_locked(&state, &bc)?;
            state.reconfigured = true;
            debug!("Masquerade of {} noted by bridge {}", bc.name(), self.id);
        }
        self.reconfigure();
        Ok(())
    }

    /// Dissolve the bridge: every participating member is forced out and
    /// the bridge is unregistered. New joins are rejected from now on.
    pub fn dissolve(self: &Arc<Self>) {
        {
            let mut state = self.lock();
            self.dissolve_locked(&mut state);
        }
        self.reconfigure();
    }

    /// Dissolve and drop this reference. The methods' destructor runs once
    /// the last member has left and every other reference is gone.
    pub fn destroy(self: Arc<Self>) {
        debug!("Destroying bridge {}", self.id);
        self.dissolve();
    }

    pub(crate) fn dissolve_locked(&self, state: &mut BridgeState) {
        if !state.dissolved {
            info!("Dissolving bridge {}", self.id);
        }
        state.dissolved = true;
        for bc in state.channels.iter() {
            bc.hangup_if_waiting();
        }
        if !state.dissolving_queued {
            state.dissolving_queued = true;
            state.actions.push_back(BridgeAction::DeferredDissolving);
        }
    }

    /// Dissolve if the bridge or the leaving member asks for it on hangup
    pub(crate) fn check_dissolve_locked(&self, state: &mut BridgeState, bc: &BridgeChannel) {
        let member_wants = bc
            .with_features(|f| f.is_usable() && f.dissolve_hangup)
            .unwrap_or(false);
        if state.flags.contains(BridgeFlags::DISSOLVE_HANGUP) || member_wants {
            debug!("{} hung up, dissolving bridge {}", bc.name(), self.id);
            self.dissolve_locked(state);
        }
    }

    /// The reconfiguration pass: resynchronize the technology after
    /// membership changes, then drain the bridge action queue. Deferred
    /// actions run after the lock is released.
    pub fn reconfigure(self: &Arc<Self>) {
        let deferred = {
            let mut state = self.lock();

            if state.flags.contains(BridgeFlags::SMART) && !state.dissolved {
                let count = state.channels.len();
                if let Err(e) = self.smart_switch(&mut state, count) {
                    debug!("Bridge {} keeps its technology: {}", self.id, e);
                }
            }

            if state.reconfigured {
                state.with_tech(|tech, view| tech.reconfigure(view));
                for bc in state.channels.iter() {
                    bc.update_membership(&state, |m| m.just_joined = false);
                }
                state.reconfigured = false;
            }

            let mut deferred = Vec::new();
            while let Some(action) = state.actions.pop_front() {
                match action {
                    BridgeAction::Channel(action) => {
                        for bc in state.channels.iter() {
                            if let Err(e) = bc.queue_action(action.clone()) {
                                trace!("Skipping {} for {}: {}", action.kind(), bc.name(), e);
                            }
                        }
                    }
                    other => deferred.push(other),
                }
            }
            deferred
        };

        for action in deferred {
            trace!("Running {} on bridge {}", action.kind(), self.id);
            match action {
                BridgeAction::DeferredTechDestroy(detached) => {
                    detached.release();
                }
                BridgeAction::DeferredDissolving => self.finish_dissolving(),
                BridgeAction::Channel(_) => {}
            }
        }
    }

    fn finish_dissolving(self: &Arc<Self>) {
        {
            let mut state = self.lock();
            if state.dissolving_done {
                return;
            }
            if !state.dissolved {
                warn!("Bridge {} is not dissolved, not unregistering it", self.id);
                return;
            }
            state.dissolving_done = true;
        }
        if let Some(core) = self.core() {
            core.unregister(&self.id);
        }
        self.methods.dissolving(&self.id);
        info!("Bridge {} dissolved", self.id);
    }

    /// Move the channel onto one of the technology's formats if it uses
    /// neither its read nor its write format.
    pub(crate) fn make_compatible_locked(&self, state: &BridgeState, bc: &BridgeChannel) -> Result<()> {
        let formats = state.technology.formats();
        let Some(best) = formats.best() else {
            return Ok(());
        };
        let channel = bc.channel();
        let read = channel.read_format();
        if !formats.contains(&read) {
            debug!("Bridge {} moving {} read format {} -> {}", self.id, bc.name(), read, best);
            channel.set_read_format(best)?;
        }
        let write = channel.write_format();
        if !formats.contains(&write) {
            debug!("Bridge {} moving {} write format {} -> {}", self.id, bc.name(), write, best);
            channel.set_write_format(best)?;
        }
        Ok(())
    }

    /// Hand a frame read from `from` to the technology
    pub(crate) fn technology_write(&self, state: &mut BridgeState, from: &Arc<BridgeChannel>, frame: &Frame) -> Result<()> {
        state.with_tech(|tech, view| tech.write(view, from, frame))
    }

    /// For smart bridges, move to the technology suited to `count` members.
    /// The old technology's private state is released by a deferred action.
    pub(crate) fn smart_switch(&self, state: &mut BridgeState, count: usize) -> Result<()> {
        if let Some(switch) = self.begin_smart_switch(state, count)? {
            self.commit_switch(state, switch);
        }
        Ok(())
    }

    /// Move the members onto the technology suited to `count`, keeping the
    /// old technology's state aside until the switch is committed or
    /// reverted. `None` when no switch is needed.
    pub(crate) fn begin_smart_switch(&self, state: &mut BridgeState, count: usize) -> Result<Option<TechSwitch>> {
        let wanted = if count > 2 {
            Capabilities::MULTI_MIX
        } else {
            Capabilities::ONE_TO_ONE_MIX
        };
        if state.technology.capabilities().contains(wanted) {
            return Ok(None);
        }
        let core = self
            .core()
            .ok_or_else(|| BridgeError::Allocation("bridging core is gone".to_string()))?;
        let new_tech = core.technologies.find_best(wanted)?;

        let old_tech = std::mem::replace(&mut state.technology, new_tech.clone());
        let mut old_pvt = state.tech_pvt.take();
        detach_technology(state, &old_tech, &mut old_pvt);

        let started = state.with_tech(|tech, view| {
            tech.create(view)?;
            tech.start(view)
        });
        if let Err(e) = started {
            warn!(
                "Bridge {} could not start {}: {}, staying on {}",
                self.id,
                new_tech.name(),
                e,
                old_tech.name()
            );
            new_tech.destroy(&state.id, state.tech_pvt.take());
            self.reattach_technology(state, old_tech, old_pvt);
            return Err(e);
        }

        let members = std::mem::take(&mut state.channels);
        self.rejoin_members(state, members);
        debug!(
            "Bridge {} moving technology {} -> {} for {} members",
            self.id,
            old_tech.name(),
            new_tech.name(),
            count
        );
        Ok(Some(TechSwitch { old_tech, old_pvt }))
    }

    /// Keep the new technology and hand the old one's state to the
    /// reconfiguration pass for release
    pub(crate) fn commit_switch(&self, state: &mut BridgeState, switch: TechSwitch) {
        info!(
            "Bridge {} switched technology {} -> {}",
            self.id,
            switch.old_tech.name(),
            state.technology.name()
        );
        state.actions.push_back(BridgeAction::DeferredTechDestroy(DeferredTechDestroy::new(
            state.id.clone(),
            switch.old_tech,
            switch.old_pvt,
        )));
        state.reconfigured = true;
    }

    /// Go back to the technology that was attached before `switch`
    pub(crate) fn revert_switch(&self, state: &mut BridgeState, switch: TechSwitch) {
        let new_tech = state.technology.clone();
        let mut new_pvt = state.tech_pvt.take();
        detach_technology(state, &new_tech, &mut new_pvt);
        new_tech.destroy(&state.id, new_pvt);
        debug!(
            "Bridge {} back on technology {} after a failed attach",
            self.id,
            switch.old_tech.name()
        );
        self.reattach_technology(state, switch.old_tech, switch.old_pvt);
    }

    /// Restart a previously stopped technology with its own state and
    /// rejoin every member
    fn reattach_technology(&self, state: &mut BridgeState, technology: Arc<dyn BridgeTechnology>, pvt: TechPvt) {
        state.technology = technology;
        state.tech_pvt = pvt;
        if let Err(e) = state.with_tech(|tech, view| tech.start(view)) {
            warn!("Bridge {} could not restart {}: {}", self.id, state.technology.name(), e);
        }
        let members = std::mem::take(&mut state.channels);
        self.rejoin_members(state, members);
    }

    /// Join `members` to the current technology in order
    fn rejoin_members(&self, state: &mut BridgeState, members: Vec<Arc<BridgeChannel>>) {
        for bc in members {
            let suspended = bc.is_suspended();
            let joined = state.with_tech(|tech, view| {
                let joined = tech.join(view, &bc);
                if joined.is_ok() && suspended {
                    tech.suspend(view, &bc);
                }
                joined
            });
            if let Err(e) = &joined {
                warn!("{} could not rejoin bridge {}: {}", bc.name(), self.id, e);
                bc.hangup_if_waiting();
            }
            bc.set_outside_technology(state, joined.is_err());
            state.channels.push(bc);
        }
    }

    pub fn video_mode(&self) -> VideoMode {
        self.lock().video_mode.clone()
    }

    /// Pin `channel`'s video as the only feed
    pub fn set_single_src_video_mode(&self, channel: &ChannelId) {
        let mut state = self.lock();
        let requests = state.video_mode.set_single_src(channel.clone());
        Self::request_video_updates(&state, &requests);
        debug!("Bridge {} video pinned to {}", self.id, channel);
    }

    /// Let the loudest talker's video be the feed
    pub fn set_talker_src_video_mode(&self) {
        self.lock().video_mode.set_talker_src();
        debug!("Bridge {} video follows the talker", self.id);
    }

    pub fn clear_video_mode(&self) {
        self.lock().video_mode.clear();
    }

    /// Feed a talking energy sample for `channel` into talker mode
    pub fn update_talker_src_video_mode(&self, channel: &ChannelId, energy: u32, keyframe: bool) {
        let mut state = self.lock();
        self.update_talker_src_locked(&mut state, channel, energy, keyframe);
    }

    pub(crate) fn update_talker_src_locked(&self, state: &mut BridgeState, channel: &ChannelId, energy: u32, keyframe: bool) {
        let supports_video = state
            .find_channel(channel)
            .is_some_and(|bc| bc.channel().supports_video());
        if !supports_video {
            return;
        }
        let params = state.talker_params;
        let before = state.video_mode.is_video_src(channel);
        let requests = state
            .video_mode
            .update_talker_energy(channel, energy, keyframe, &params);
        if before != 1 && state.video_mode.is_video_src(channel) == 1 {
            debug!("Bridge {} video source is now {}", self.id, channel);
        }
        Self::request_video_updates(state, &requests);
    }

    fn request_video_updates(state: &BridgeState, requests: &[ChannelId]) {
        for id in requests {
            if let Some(bc) = state.find_channel(id) {
                if let Err(e) = bc.queue_control(ControlFrame::VideoUpdate) {
                    trace!("No video update for {}: {}", bc.name(), e);
                }
            }
        }
    }

    pub fn is_video_src(&self, channel: &ChannelId) -> u8 {
        self.lock().video_mode.is_video_src(channel)
    }

    pub fn number_video_src(&self) -> usize {
        self.lock().video_mode.number_video_src()
    }

    pub fn remove_video_src(&self, channel: &ChannelId) {
        self.lock().video_mode.remove_video_src(channel);
    }
}

/// Old technology of a smart switch that is not yet committed
pub(crate) struct TechSwitch {
    old_tech: Arc<dyn BridgeTechnology>,
    old_pvt: TechPvt,
}

/// Take every member out of `technology` and stop it. Members the
/// technology never accepted are skipped.
fn detach_technology(state: &BridgeState, technology: &Arc<dyn BridgeTechnology>, pvt: &mut TechPvt) {
    let mut view = TechBridge {
        id: &state.id,
        channels: &state.channels,
        pvt,
        video_mode: &state.video_mode,
        internal_sample_rate: state.internal_sample_rate,
        mixing_interval: state.mixing_interval,
    };
    for bc in state.channels.iter().filter(|bc| !bc.is_outside_technology()) {
        technology.leave(&mut view, bc);
    }
    technology.stop(&mut view);
}

impl fmt::Debug for Bridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bridge")
            .field("id", &self.id)
            .field("class", &self.methods.name())
            .finish()
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for action in state.actions.drain(..) {
            if let BridgeAction::DeferredTechDestroy(detached) = action {
                detached.release();
            }
        }
        state.with_tech(|tech, view| tech.stop(view));
        let technology = state.technology.clone();
        technology.destroy(&self.id, state.tech_pvt.take());
        self.methods.destroy(&self.id);
        debug!("Bridge {} reclaimed", self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelHandle;
    use crate::config::BridgeConfig;
    use crate::context::BridgingCore;
    use crate::frame::Format;
    use crate::mock::{MockChannel, RecordingMethods, RecordingTechnology, TechCounters};

    fn recording_core() -> (BridgingCore, Arc<TechCounters>) {
        let core = BridgingCore::new(BridgeConfig::default()).unwrap();
        let tech = RecordingTechnology::new("recording", Capabilities::MULTI_MIX);
        let counters = tech.counters();
        core.technologies().register(Arc::new(tech)).unwrap();
        (core, counters)
    }

    fn recording_bridge(core: &BridgingCore, methods: &Arc<RecordingMethods>) -> Arc<Bridge> {
        core.register(core.base_init(
            core.allocate(methods.clone()),
            Capabilities::MULTI_MIX,
            BridgeFlags::NONE,
        ))
        .unwrap()
    }

    #[test]
    fn test_tech_destroy_ticket_queued_twice_destroys_once() {
        let (core, counters) = recording_core();
        let bridge = core.new_bridge(Capabilities::MULTI_MIX, BridgeFlags::NONE).unwrap();

        let detached = Arc::new(RecordingTechnology::new("detached", Capabilities::MULTI_MIX));
        let detached_counters = detached.counters();
        let pvt: TechPvt = Some(Box::new("detached".to_string()));
        let ticket = DeferredTechDestroy::new(bridge.id().clone(), detached, pvt);
        {
            let mut state = bridge.lock();
            state.actions.push_back(BridgeAction::DeferredTechDestroy(ticket.clone()));
            state.actions.push_back(BridgeAction::DeferredTechDestroy(ticket.clone()));
        }
        bridge.reconfigure();

        assert_eq!(TechCounters::get(&detached_counters.destroyed), 1);
        assert!(ticket.is_released());
        assert_eq!(bridge.lock().pending_actions(), 0);
        // the attached technology is untouched
        assert_eq!(TechCounters::get(&counters.destroyed), 0);
    }

    #[test]
    fn test_dissolving_runs_once_through_the_pass() {
        let (core, _) = recording_core();
        let methods = Arc::new(RecordingMethods::default());
        let bridge = recording_bridge(&core, &methods);
        {
            let mut state = bridge.lock();
            bridge.dissolve_locked(&mut state);
            bridge.dissolve_locked(&mut state);
            assert_eq!(state.pending_actions(), 1);
            state.actions.push_back(BridgeAction::DeferredDissolving);
        }
        bridge.reconfigure();
        bridge.dissolve();

        assert_eq!(methods.dissolving_calls(), 1);
        assert!(core.find_bridge(bridge.id()).is_none());
    }

    #[test]
    fn test_dissolving_ignored_on_live_bridge() {
        let (core, _) = recording_core();
        let methods = Arc::new(RecordingMethods::default());
        let bridge = recording_bridge(&core, &methods);

        bridge.lock().actions.push_back(BridgeAction::DeferredDissolving);
        bridge.reconfigure();
        assert_eq!(methods.dissolving_calls(), 0);
        assert!(core.find_bridge(bridge.id()).is_some());

        bridge.dissolve();
        assert_eq!(methods.dissolving_calls(), 1);
        assert!(core.find_bridge(bridge.id()).is_none());
    }

    #[tokio::test]
    async fn test_formats_moved_on_join_and_restored_on_leave() {
        let (core, _) = recording_core();
        let bridge = core.new_bridge(Capabilities::MULTI_MIX, BridgeFlags::NONE).unwrap();
        let alice = MockChannel::with_formats("alice", Format::ulaw(), Format::slin16());
        let bob = MockChannel::new("bob");

        bridge.impart(alice.clone(), None, None, None, false).unwrap();
        bridge.impart(bob.clone(), None, None, None, false).unwrap();
        assert_eq!(alice.read_format(), Format::slin());
        assert_eq!(alice.write_format(), Format::slin());
        assert_eq!(bob.read_format(), Format::slin());

        core.depart(alice.id()).await.unwrap();
        assert_eq!(alice.read_format(), Format::ulaw());
        assert_eq!(alice.write_format(), Format::slin16());

        core.depart(bob.id()).await.unwrap();
        assert_eq!(bob.read_format(), Format::slin());
    }

    #[tokio::test]
    async fn test_notify_masquerade() {
        let (core, _) = recording_core();
        let methods = Arc::new(RecordingMethods::default());
        let bridge = recording_bridge(&core, &methods);
        let alice = MockChannel::new("alice");
        bridge.impart(alice.clone(), None, None, None, false).unwrap();

        // the replacement handle arrives speaking another format
        alice.set_read_format(&Format::ulaw()).unwrap();
        bridge.notify_masquerade(alice.id()).unwrap();
        assert_eq!(methods.masquerade_calls(), 1);
        assert_eq!(alice.read_format(), Format::slin());

        let ghost = ChannelId::from_string("ghost");
        assert!(matches!(
            bridge.notify_masquerade(&ghost),
            Err(BridgeError::NotInBridge { .. })
        ));
        assert_eq!(methods.masquerade_calls(), 1);

        core.depart(alice.id()).await.unwrap();
    }

    #[test]
    fn test_mixing_hints_trigger_reconfiguration() {
        let (core, counters) = recording_core();
        let bridge = core.new_bridge(Capabilities::MULTI_MIX, BridgeFlags::NONE).unwrap();
        let before = TechCounters::get(&counters.reconfigured);

        bridge.set_internal_sample_rate(16000);
        assert_eq!(bridge.internal_sample_rate(), 16000);
        assert_eq!(TechCounters::get(&counters.reconfigured), before + 1);

        bridge.set_mixing_interval(40);
        assert_eq!(bridge.mixing_interval(), 40);
        assert_eq!(TechCounters::get(&counters.reconfigured), before + 2);
        assert!(!bridge.lock().is_reconfigured());

        bridge.set_internal_sample_rate(0);
        assert_eq!(bridge.lock().internal_sample_rate(), 0);
    }
}
