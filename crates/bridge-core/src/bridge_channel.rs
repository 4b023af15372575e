//! Binding of one channel handle into one bridge
//!
//! A [`BridgeChannel`] carries the per-participant state the engine needs:
//! the exit state machine, membership flags, the outbound queue drained by
//! the channel's driver, per-channel features and technology data, and the
//! back-reference to the owning bridge.
//!
//! # Locking
//!
//! The bridge lock is always taken before a bridge channel's own lock. The
//! membership flags and the back-reference may only change while the
//! owning bridge is locked; the crate enforces this by requiring a
//! `&BridgeState` witness for those writes. The back-reference can be
//! rewritten by a merge, so code holding only the channel must go through
//! [`BridgeChannel::with_bridge`], which re-validates it after locking.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Notify};
use tracing::{debug, trace, warn};

use crate::action::ChannelAction;
use crate::bridge::{Bridge, BridgeGuard, BridgeState};
use crate::channel::{ChannelHandle, ChannelId};
use crate::error::{BridgeError, Result};
use crate::features::{talking_action, BridgeFeatures};
use crate::frame::{ControlFrame, Format, Frame};
use crate::technology::{TechArgs, TechPvt};

/// Exit state of a bridge channel. Once it leaves `Wait` it never returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BridgeChannelState {
    /// Participating in the bridge
    Wait,
    /// Leaving gracefully; the bridge may dissolve
    End,
    /// Leaving and the channel should be hung up
    Hangup,
}

impl BridgeChannelState {
    fn can_become(self, next: BridgeChannelState) -> bool {
        match (self, next) {
            (_, BridgeChannelState::Wait) => false,
            (BridgeChannelState::Wait, _) => true,
            (BridgeChannelState::End, BridgeChannelState::Hangup) => true,
            _ => false,
        }
    }
}

/// What the channel's driver is doing, readable without any lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum ThreadActivity {
    /// Waiting for media or a wake
    Idle = 0,
    /// Handling a queued action
    Simple = 1,
    /// Handling a media frame
    Frame = 2,
}

impl ThreadActivity {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ThreadActivity::Simple,
            2 => ThreadActivity::Frame,
            _ => ThreadActivity::Idle,
        }
    }
}

/// Membership flags, written only under the owning bridge's lock
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Membership {
    pub in_bridge: bool,
    pub just_joined: bool,
    pub suspended: bool,
    pub depart_wait: bool,
}

/// Item waiting for the driver
#[derive(Debug)]
pub(crate) enum Queued {
    Frame(Frame),
    Action(ChannelAction),
}

struct Inner {
    state: BridgeChannelState,
    bridge: Option<Arc<Bridge>>,
    membership: Membership,
    /// Leaving through depart; skips the dissolve check
    departing: bool,
    /// A member the technology refused, moved in by a merge
    outside_technology: bool,
    queue: VecDeque<Queued>,
    features: Option<BridgeFeatures>,
    tech_args: TechArgs,
    saved_formats: Option<(Format, Format)>,
    tech_pvt: TechPvt,
}

pub struct BridgeChannel {
    channel: Arc<dyn ChannelHandle>,
    wake: Notify,
    activity: AtomicU8,
    /// Last talking energy seen on a voice frame
    talker_energy: AtomicU32,
    /// True while the driver may touch the channel's I/O
    io_busy: watch::Sender<bool>,
    queue_warn: usize,
    inner: Mutex<Inner>,
}

impl BridgeChannel {
    pub(crate) fn new(
        channel: Arc<dyn ChannelHandle>,
        features: Option<BridgeFeatures>,
        tech_args: Option<TechArgs>,
        queue_warn: usize,
    ) -> Arc<Self> {
        let saved_formats = Some((channel.read_format(), channel.write_format()));
        let (io_busy, _) = watch::channel(false);
        Arc::new(Self {
            channel,
            wake: Notify::new(),
            activity: AtomicU8::new(ThreadActivity::Idle as u8),
            talker_energy: AtomicU32::new(0),
            io_busy,
            queue_warn,
            inner: Mutex::new(Inner {
                state: BridgeChannelState::Wait,
                bridge: None,
                membership: Membership::default(),
                departing: false,
                outside_technology: false,
                queue: VecDeque::new(),
                features,
                tech_args: tech_args.unwrap_or_default(),
                saved_formats,
                tech_pvt: None,
            }),
        })
    }

    pub fn channel(&self) -> &Arc<dyn ChannelHandle> {
        &self.channel
    }

    pub fn id(&self) -> &ChannelId {
        self.channel.id()
    }

    pub fn name(&self) -> &str {
        self.channel.name()
    }

    pub fn state(&self) -> BridgeChannelState {
        self.inner.lock().state
    }

    /// Move to `END` or `HANGUP` and wake the driver. Returns false when the
    /// transition is not allowed (nothing ever returns to `WAIT`).
    pub fn change_state(&self, new_state: BridgeChannelState) -> bool {
        let changed = {
            let mut inner = self.inner.lock();
            self.change_state_nolock(&mut inner, new_state)
        };
        if changed {
            self.wake();
        }
        changed
    }

    /// Transition with the channel lock already held. The caller wakes.
    fn change_state_nolock(&self, inner: &mut MutexGuard<'_, Inner>, new_state: BridgeChannelState) -> bool {
        if !inner.state.can_become(new_state) {
            trace!(
                "Ignoring state change {:?} -> {:?} on {}",
                inner.state,
                new_state,
                self.name()
            );
            return false;
        }
        debug!("Bridge channel {} state {:?} -> {:?}", self.name(), inner.state, new_state);
        inner.state = new_state;
        true
    }

    /// Force a still-participating channel out with `HANGUP`. Channels
    /// already leaving keep their state.
    pub(crate) fn hangup_if_waiting(&self) -> bool {
        let changed = {
            let mut inner = self.inner.lock();
            inner.state == BridgeChannelState::Wait
                && self.change_state_nolock(&mut inner, BridgeChannelState::Hangup)
        };
        if changed {
            self.wake();
        }
        changed
    }

    /// Signal the driver to re-check state and queue
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    pub(crate) async fn wait_for_wake(&self) {
        self.wake.notified().await;
    }

    pub fn activity(&self) -> ThreadActivity {
        ThreadActivity::from_u8(self.activity.load(Ordering::Acquire))
    }

    pub(crate) fn set_activity(&self, activity: ThreadActivity) {
        self.activity.store(activity as u8, Ordering::Release);
    }

    pub fn talker_energy(&self) -> u32 {
        self.talker_energy.load(Ordering::Relaxed)
    }

    pub(crate) fn record_talker_energy(&self, energy: u32) {
        self.talker_energy.store(energy, Ordering::Relaxed);
    }

    pub fn membership(&self) -> Membership {
        self.inner.lock().membership
    }

    pub fn is_suspended(&self) -> bool {
        self.inner.lock().membership.suspended
    }

    pub fn in_bridge(&self) -> bool {
        self.inner.lock().membership.in_bridge
    }

    /// Change membership flags. The `&BridgeState` proves the owning bridge
    /// is locked, or that the channel is not yet visible in any bridge.
    pub(crate) fn update_membership<R>(&self, _held: &BridgeState, f: impl FnOnce(&mut Membership) -> R) -> R {
        f(&mut self.inner.lock().membership)
    }

    /// Snapshot of the back-reference. Not stable without a lock; use
    /// [`with_bridge`](Self::with_bridge) to act on it.
    pub fn bridge(&self) -> Option<Arc<Bridge>> {
        self.inner.lock().bridge.clone()
    }

    pub(crate) fn set_bridge(&self, _held: &BridgeState, bridge: Option<Arc<Bridge>>) {
        self.inner.lock().bridge = bridge;
    }

    /// Lock the bridge this channel currently belongs to and run `f` with it.
    ///
    /// The back-reference is read, the candidate bridge locked, and the
    /// back-reference read again; if a merge moved the channel meanwhile the
    /// lock is dropped and the sequence retried. Returns `None` when the
    /// channel is not in a bridge.
    #[track_caller]
    pub fn with_bridge<R>(&self, f: impl FnOnce(&Arc<Bridge>, &mut BridgeGuard<'_>) -> R) -> Option<R> {
        loop {
            let bridge = self.inner.lock().bridge.clone()?;
            let mut guard = bridge.lock();
            let still_ours = self
                .inner
                .lock()
                .bridge
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, &bridge));
            if still_ours {
                return Some(f(&bridge, &mut guard));
            }
            drop(guard);
            trace!("Bridge of {} changed while locking, retrying", self.name());
        }
    }

    /// The technology never accepted this member, so it is not told when
    /// the member leaves
    pub(crate) fn is_outside_technology(&self) -> bool {
        self.inner.lock().outside_technology
    }

    pub(crate) fn set_outside_technology(&self, _held: &BridgeState, outside: bool) {
        self.inner.lock().outside_technology = outside;
    }

    pub(crate) fn is_departing(&self) -> bool {
        self.inner.lock().departing
    }

    pub(crate) fn mark_departing(&self, held: &BridgeState) {
        self.update_membership(held, |m| m.depart_wait = true);
        self.inner.lock().departing = true;
    }

    pub fn tech_args(&self) -> TechArgs {
        self.inner.lock().tech_args
    }

    /// Technology data attached to this channel
    pub fn tech_pvt(&self) -> MappedMutexGuard<'_, TechPvt> {
        MutexGuard::map(self.inner.lock(), |inner| &mut inner.tech_pvt)
    }

    pub fn has_features(&self) -> bool {
        self.inner.lock().features.is_some()
    }

    /// Run `f` on the channel's own features, if it has any
    pub fn with_features<R>(&self, f: impl FnOnce(&mut BridgeFeatures) -> R) -> Option<R> {
        self.inner.lock().features.as_mut().map(f)
    }

    pub fn set_features(&self, features: Option<BridgeFeatures>) {
        self.inner.lock().features = features;
        self.wake();
    }

    pub(crate) fn take_saved_formats(&self) -> Option<(Format, Format)> {
        self.inner.lock().saved_formats.take()
    }

    pub fn queue_len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub(crate) fn pop_queued(&self) -> Option<Queued> {
        self.inner.lock().queue.pop_front()
    }

    fn enqueue(&self, item: Queued) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            if inner.state != BridgeChannelState::Wait {
                return Err(BridgeError::NotBridged(self.id().clone()));
            }
            inner.queue.push_back(item);
            if inner.queue.len() == self.queue_warn {
                warn!("Queue of {} reached {} items", self.name(), self.queue_warn);
            }
        }
        self.wake();
        Ok(())
    }

    /// Queue a frame to be written to this channel
    pub fn queue_frame(&self, frame: Frame) -> Result<()> {
        self.enqueue(Queued::Frame(frame))
    }

    /// Queue an action for this channel's driver
    pub fn queue_action(&self, action: ChannelAction) -> Result<()> {
        self.enqueue(Queued::Action(action))
    }

    pub fn queue_control(&self, control: ControlFrame) -> Result<()> {
        self.queue_frame(Frame::Control(control))
    }

    pub fn queue_playfile(&self, file: &str, moh_class: Option<&str>) -> Result<()> {
        self.queue_action(ChannelAction::PlayFile {
            file: file.to_string(),
            moh_class: moh_class.map(str::to_string),
        })
    }

    pub fn queue_app(&self, app: &str, args: Option<&str>, moh_class: Option<&str>) -> Result<()> {
        self.queue_action(ChannelAction::RunApp {
            app: app.to_string(),
            args: args.map(str::to_string),
            moh_class: moh_class.map(str::to_string),
        })
    }

    /// Tell the driver the channel started or stopped talking
    pub fn notify_talking(&self, started: bool) {
        if let Err(e) = self.queue_action(talking_action(started)) {
            trace!("Dropping talk notification for {}: {}", self.name(), e);
        }
    }

    /// Write a frame into the bridge as if this channel had produced it.
    /// Delivery to the peers goes through their queues.
    pub fn write_frame(self: &Arc<Self>, frame: Frame) -> Result<()> {
        self.with_bridge(|bridge, guard| bridge.technology_write(guard, self, &frame))
            .unwrap_or_else(|| Err(BridgeError::NotBridged(self.id().clone())))
    }

    pub fn write_control(self: &Arc<Self>, control: ControlFrame) -> Result<()> {
        self.write_frame(Frame::Control(control))
    }

    /// Queue `action` on every other member of this channel's bridge,
    /// ordered with respect to other bridge state changes.
    pub fn write_action(self: &Arc<Self>, action: ChannelAction) -> Result<()> {
        self.with_bridge(|_, guard| {
            for peer in guard.channels().iter().filter(|peer| !Arc::ptr_eq(peer, self)) {
                if let Err(e) = peer.queue_action(action.clone()) {
                    trace!("Skipping {} for {}: {}", action.kind(), peer.name(), e);
                }
            }
        })
        .ok_or_else(|| BridgeError::NotBridged(self.id().clone()))
    }

    pub fn write_playfile(self: &Arc<Self>, file: &str, moh_class: Option<&str>) -> Result<()> {
        self.write_action(ChannelAction::PlayFile {
            file: file.to_string(),
            moh_class: moh_class.map(str::to_string),
        })
    }

    pub fn write_app(self: &Arc<Self>, app: &str, args: Option<&str>, moh_class: Option<&str>) -> Result<()> {
        self.write_action(ChannelAction::RunApp {
            app: app.to_string(),
            args: args.map(str::to_string),
            moh_class: moh_class.map(str::to_string),
        })
    }

    /// Mark the driver as touching channel I/O. Fails if the channel is
    /// suspended or leaving, in which case I/O must not start.
    pub(crate) fn begin_io(&self) -> bool {
        self.io_busy.send_replace(true);
        let inner = self.inner.lock();
        if inner.membership.suspended || inner.state != BridgeChannelState::Wait {
            drop(inner);
            self.io_busy.send_replace(false);
            return false;
        }
        true
    }

    pub(crate) fn end_io(&self) {
        self.io_busy.send_replace(false);
    }

    /// Wait until the driver is not touching channel I/O
    pub(crate) async fn wait_io_idle(&self) {
        let mut rx = self.io_busy.subscribe();
        let _ = rx.wait_for(|busy| !*busy).await;
    }
}

impl fmt::Debug for BridgeChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("BridgeChannel")
            .field("channel", &self.name())
            .field("state", &inner.state)
            .field("membership", &inner.membership)
            .field("queued", &inner.queue.len())
            .field("bridge", &inner.bridge.as_ref().map(|b| b.id().clone()))
            .finish()
    }
}
