//! Membership protocols: join, impart, remove, suspend and unsuspend
//!
//! Attaching a channel is the same for [`Bridge::join`] and
//! [`Bridge::impart`]: the bridge is locked once, the optional swap target
//! is taken out of the technology, the class and the technology accept the
//! newcomer, and only then does it become visible as a member. Any failure
//! unwinds to the state before the call. The two entry points differ in who
//! drives the channel afterwards: `join` drives it on the calling task,
//! `impart` spawns a task.

use std::sync::Arc;

use tracing::{debug, info, warn, Instrument};

use crate::bridge::{Bridge, BridgeFlags, BridgeState};
use crate::bridge_channel::{BridgeChannel, BridgeChannelState};
use crate::channel::{ChannelHandle, ChannelId};
use crate::context::{CoreInner, DepartableTask};
use crate::driver;
use crate::error::{BridgeError, Result};
use crate::features::BridgeFeatures;
use crate::technology::TechArgs;

impl Bridge {
    /// Join `channel` and drive it on the calling task until it leaves.
    ///
    /// With `swap`, that member is replaced by `channel` in one step and
    /// leaves with `HANGUP`. Returns the state the channel left with; the
    /// caller decides what to do with a channel that left with `HANGUP`.
    /// On `END`, a stored after-bridge continuation is applied.
    pub async fn join(
        self: &Arc<Self>,
        channel: Arc<dyn ChannelHandle>,
        swap: Option<&ChannelId>,
        features: Option<BridgeFeatures>,
        tech_args: Option<TechArgs>,
    ) -> Result<BridgeChannelState> {
        let span = tracing::info_span!("bridge_join", bridge_id = %self.id(), channel = %channel.name());
        async move {
            let core = self.core_or_err()?;
            let bridge_channel = self.attach_new(&core, channel, swap, features, tech_args)?;
            let state = driver::run(bridge_channel.clone(), core.clone()).await;

            let channel = bridge_channel.channel();
            match state {
                BridgeChannelState::End => {
                    if let Some(goto) = core.after_bridge.take(channel.id()) {
                        debug!("Continuing {} at {}", channel.name(), goto);
                        if let Err(e) = channel.apply_after_bridge_goto(&goto).await {
                            warn!("After-bridge continuation for {} failed: {}", channel.name(), e);
                        }
                    }
                }
                _ => core.after_bridge.discard(channel.id()),
            }
            Ok(state)
        }
        .instrument(span)
        .await
    }

    /// Attach `channel` and return at once; a spawned task drives it.
    ///
    /// A channel imparted with `independent` set behaves as if joined and
    /// is hung up when it leaves, unless an after-bridge continuation takes
    /// it over. Otherwise the channel must later be reclaimed with
    /// [`BridgingCore::depart`](crate::context::BridgingCore::depart).
    pub fn impart(
        self: &Arc<Self>,
        channel: Arc<dyn ChannelHandle>,
        swap: Option<&ChannelId>,
        features: Option<BridgeFeatures>,
        tech_args: Option<TechArgs>,
        independent: bool,
    ) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| BridgeError::Task(format!("impart needs a tokio runtime: {}", e)))?;
        let core = self.core_or_err()?;
        if !independent {
            core.after_bridge.discard(channel.id());
        }
        let bridge_channel = self.attach_new(&core, channel, swap, features, tech_args)?;
        let span = tracing::info_span!(
            "bridge_impart",
            bridge_id = %self.id(),
            channel = %bridge_channel.name(),
            independent
        );

        if independent {
            let task_core = core.clone();
            let task_channel = bridge_channel.clone();
            runtime.spawn(
                async move {
                    let state = driver::run(task_channel.clone(), task_core.clone()).await;
                    let channel = task_channel.channel();
                    let goto = match state {
                        BridgeChannelState::End => task_core.after_bridge.take(channel.id()),
                        _ => {
                            task_core.after_bridge.discard(channel.id());
                            None
                        }
                    };
                    match goto {
                        Some(goto) => {
                            if let Err(e) = channel.apply_after_bridge_goto(&goto).await {
                                warn!("After-bridge continuation for {} failed: {}", channel.name(), e);
                                channel.hangup().await;
                            }
                        }
                        None => channel.hangup().await,
                    }
                    state
                }
                .instrument(span),
            );
        } else {
            let handle = runtime.spawn(driver::run(bridge_channel.clone(), core.clone()).instrument(span));
            core.departable.insert(
                bridge_channel.id().clone(),
                DepartableTask {
                    bridge_channel,
                    handle,
                },
            );
        }
        Ok(())
    }

    /// Make `channel` leave with `HANGUP`. Its driver hangs it up or hands
    /// that to the owner. Removing a channel that is already leaving does
    /// nothing.
    pub fn remove(&self, channel: &ChannelId) -> Result<()> {
        let state = self.lock();
        let bridge_channel = state.find_channel(channel).ok_or_else(|| BridgeError::NotInBridge {
            bridge: self.id().clone(),
            channel: channel.clone(),
        })?;
        if bridge_channel.hangup_if_waiting() {
            info!("Removing {} from bridge {}", bridge_channel.name(), self.id());
        } else {
            debug!("{} is already leaving bridge {}", bridge_channel.name(), self.id());
        }
        Ok(())
    }

    /// Take temporary control of a member. Returns once its driver has
    /// stopped touching the channel's I/O.
    pub async fn suspend(&self, channel: &ChannelId) -> Result<()> {
        let bridge_channel = {
            let mut state = self.lock();
            let bridge_channel = state
                .find_channel(channel)
                .cloned()
                .ok_or_else(|| BridgeError::NotInBridge {
                    bridge: self.id().clone(),
                    channel: channel.clone(),
                })?;
            let newly = bridge_channel.update_membership(&state, |m| !std::mem::replace(&mut m.suspended, true));
            if newly {
                state.num_active = state.num_active.saturating_sub(1);
                state.with_tech(|tech, view| tech.suspend(view, &bridge_channel));
                debug!("Suspended {} in bridge {}", bridge_channel.name(), self.id());
            }
            bridge_channel
        };
        bridge_channel.wake();
        bridge_channel.wait_io_idle().await;
        Ok(())
    }

    /// Hand a suspended member back to its driver
    pub fn unsuspend(&self, channel: &ChannelId) -> Result<()> {
        let bridge_channel = {
            let mut state = self.lock();
            let bridge_channel = state
                .find_channel(channel)
                .cloned()
                .ok_or_else(|| BridgeError::NotInBridge {
                    bridge: self.id().clone(),
                    channel: channel.clone(),
                })?;
            let was = bridge_channel.update_membership(&state, |m| std::mem::replace(&mut m.suspended, false));
            if was {
                state.num_active += 1;
                state.with_tech(|tech, view| tech.unsuspend(view, &bridge_channel));
                debug!("Unsuspended {} in bridge {}", bridge_channel.name(), self.id());
            }
            bridge_channel
        };
        bridge_channel.wake();
        Ok(())
    }

    fn core_or_err(&self) -> Result<Arc<CoreInner>> {
        self.core()
            .ok_or_else(|| BridgeError::Allocation("bridging core is gone".to_string()))
    }

    /// Bind `channel` and attach it, undoing the binding on failure
    fn attach_new(
        self: &Arc<Self>,
        core: &Arc<CoreInner>,
        channel: Arc<dyn ChannelHandle>,
        swap: Option<&ChannelId>,
        features: Option<BridgeFeatures>,
        tech_args: Option<TechArgs>,
    ) -> Result<Arc<BridgeChannel>> {
        let bridge_channel = BridgeChannel::new(channel, features, tech_args, core.config.channel_queue_capacity);
        core.begin_bridging(&bridge_channel)?;

        if let Err(e) = self.attach(&bridge_channel, swap) {
            core.end_bridging(bridge_channel.id());
            restore_formats(&bridge_channel);
            warn!("Channel {} not attached to bridge {}: {}", bridge_channel.name(), self.id(), e);
            return Err(e);
        }
        self.reconfigure();
        info!(
            "Channel {} joined bridge {} ({} members)",
            bridge_channel.name(),
            self.id(),
            self.num_channels()
        );
        Ok(bridge_channel)
    }

    /// Attach under one bridge lock acquisition
    fn attach(self: &Arc<Self>, bridge_channel: &Arc<BridgeChannel>, swap: Option<&ChannelId>) -> Result<()> {
        let mut state = self.lock();
        if state.is_dissolved() {
            return Err(BridgeError::Dissolved { bridge: self.id().clone() });
        }

        let swapped = match swap {
            Some(id) => Some(state.find_channel(id).cloned().ok_or_else(|| BridgeError::NotInBridge {
                bridge: self.id().clone(),
                channel: id.clone(),
            })?),
            None => None,
        };

        if !self.methods().can_push(&state, bridge_channel, swapped.as_ref()) {
            return Err(BridgeError::PushRejected {
                bridge: self.id().clone(),
                channel: bridge_channel.id().clone(),
                reason: format!("refused by {} bridge", self.methods().name()),
            });
        }

        // Committed only once the newcomer is in; any failure below goes
        // back to the old technology.
        let switch = if state.flags().contains(BridgeFlags::SMART) {
            let count = state.num_channels() + 1 - usize::from(swapped.is_some());
            self.begin_smart_switch(&mut state, count)?
        } else {
            None
        };

        if let Err(e) = self.methods().push(&mut state, bridge_channel, swapped.as_ref()) {
            if let Some(switch) = switch {
                self.revert_switch(&mut state, switch);
            }
            return Err(e);
        }

        // The swapped channel leaves the technology first so a two-party
        // technology has room for its replacement.
        let taken_out = swapped.as_ref().and_then(|old| {
            let index = state.channels.iter().position(|c| Arc::ptr_eq(c, old))?;
            if !old.is_outside_technology() {
                state.with_tech(|tech, view| tech.leave(view, old));
            }
            Some((index, state.channels.remove(index)))
        });

        let joined = self
            .make_compatible_locked(&state, bridge_channel)
            .and_then(|()| state.with_tech(|tech, view| tech.join(view, bridge_channel)));

        if let Err(e) = joined {
            if let Some((index, old)) = taken_out {
                let rejoined = state.with_tech(|tech, view| tech.join(view, &old));
                if let Err(rejoin) = &rejoined {
                    warn!("{} could not rejoin bridge {}: {}", old.name(), self.id(), rejoin);
                }
                old.set_outside_technology(&state, rejoined.is_err());
                state.channels.insert(index, old);
            }
            self.methods().pull(&mut state, bridge_channel);
            if let Some(switch) = switch {
                self.revert_switch(&mut state, switch);
            }
            return Err(if e.is_rejection() {
                e
            } else {
                BridgeError::PushRejected {
                    bridge: self.id().clone(),
                    channel: bridge_channel.id().clone(),
                    reason: e.to_string(),
                }
            });
        }

        bridge_channel.set_bridge(&state, Some(self.clone()));
        bridge_channel.update_membership(&state, |m| {
            m.in_bridge = true;
            m.just_joined = true;
        });
        state.channels.push(bridge_channel.clone());
        state.num_active += 1;
        state.reconfigured = true;
        if let Some(switch) = switch {
            self.commit_switch(&mut state, switch);
        }

        if let Some((_, old)) = taken_out {
            self.methods().pull(&mut state, &old);
            self.detach_member(&mut state, &old);
            old.hangup_if_waiting();
            info!("Channel {} swapped out of bridge {}", old.name(), self.id());
        }
        Ok(())
    }

    /// Take `bridge_channel` out of the bridge: class and technology are
    /// told first, then it stops being a member. Returns false if it was
    /// not a member, so a second pull is a no-op.
    pub(crate) fn pull_locked(&self, state: &mut BridgeState, bridge_channel: &Arc<BridgeChannel>) -> bool {
        let Some(index) = state.channels.iter().position(|c| Arc::ptr_eq(c, bridge_channel)) else {
            return false;
        };
        self.methods().pull(state, bridge_channel);
        if !bridge_channel.is_outside_technology() {
            state.with_tech(|tech, view| tech.leave(view, bridge_channel));
        }
        state.channels.remove(index);
        self.detach_member(state, bridge_channel);
        info!(
            "Channel {} left bridge {} ({} members)",
            bridge_channel.name(),
            self.id(),
            state.channels.len()
        );

        if state.channels.is_empty() && state.flags.contains(BridgeFlags::DISSOLVE_EMPTY) {
            self.dissolve_locked(state);
        }
        true
    }

    /// Bookkeeping for a channel already out of the member list
    fn detach_member(&self, state: &mut BridgeState, bridge_channel: &Arc<BridgeChannel>) {
        let was_suspended = bridge_channel.update_membership(state, |m| {
            let was = m.suspended;
            *m = Default::default();
            was
        });
        if !was_suspended {
            state.num_active = state.num_active.saturating_sub(1);
        }
        bridge_channel.set_bridge(state, None);
        bridge_channel.set_outside_technology(state, false);
        state.video_mode.remove_video_src(bridge_channel.id());
        state.reconfigured = true;
    }
}

/// Put back the formats the channel had before it was attached
pub(crate) fn restore_formats(bridge_channel: &BridgeChannel) {
    let Some((read, write)) = bridge_channel.take_saved_formats() else {
        return;
    };
    let channel = bridge_channel.channel();
    if channel.read_format() != read {
        if let Err(e) = channel.set_read_format(&read) {
            warn!("Could not restore read format {} on {}: {}", read, channel.name(), e);
        }
    }
    if channel.write_format() != write {
        if let Err(e) = channel.set_write_format(&write) {
            warn!("Could not restore write format {} on {}: {}", write, channel.name(), e);
        }
    }
}
