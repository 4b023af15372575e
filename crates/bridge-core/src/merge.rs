//! Moving every member of one bridge into another
//!
//! Both bridges are locked for the whole move, always in id order, so a
//! merge racing the reverse merge serializes instead of deadlocking.

use std::sync::Arc;

use tracing::{info, warn};

use crate::bridge::{Bridge, BridgeFlags, BridgeGuard};
use crate::error::{BridgeError, Result};
use crate::technology::Capabilities;

impl Bridge {
    /// Move every member of `src` into this bridge, in their join order.
    ///
    /// Fails without changing either bridge if they are the same, either is
    /// dissolved or has merging inhibited, or this bridge cannot hold the
    /// combined membership. Afterwards `src` is empty but still registered;
    /// destroying it is up to the caller.
    pub fn merge(self: &Arc<Self>, src: &Arc<Bridge>) -> Result<()> {
        if Arc::ptr_eq(self, src) {
            return Err(BridgeError::MergeSameBridge(self.id().clone()));
        }

        let moved = {
            let (mut dst_state, mut src_state) = lock_pair(self, src);
            self.check_merge(&dst_state, src, &src_state)?;

            if dst_state.flags().contains(BridgeFlags::SMART) {
                let total = dst_state.num_channels() + src_state.num_channels();
                self.smart_switch(&mut dst_state, total)?;
            }

            let mut moved = 0;
            while let Some(bridge_channel) = src_state.channels().first().cloned() {
                if !bridge_channel.is_outside_technology() {
                    src_state.with_tech(|tech, view| tech.leave(view, &bridge_channel));
                }
                src.methods().pull(&mut src_state, &bridge_channel);
                src_state.channels.remove(0);
                src_state.video_mode.remove_video_src(bridge_channel.id());
                let suspended = bridge_channel.is_suspended();
                if !suspended {
                    src_state.num_active = src_state.num_active.saturating_sub(1);
                }

                bridge_channel.set_bridge(&dst_state, Some(self.clone()));
                let accepted = self
                    .make_compatible_locked(&dst_state, &bridge_channel)
                    .and_then(|()| self.methods().push(&mut dst_state, &bridge_channel, None))
                    .and_then(|()| {
                        dst_state.with_tech(|tech, view| {
                            tech.join(view, &bridge_channel)?;
                            if suspended {
                                tech.suspend(view, &bridge_channel);
                            }
                            Ok(())
                        })
                    });
                bridge_channel.set_outside_technology(&dst_state, accepted.is_err());
                if let Err(e) = accepted {
                    // Still moved so it is never stranded; it leaves at once.
                    warn!(
                        "{} not accepted by bridge {} during merge: {}",
                        bridge_channel.name(),
                        self.id(),
                        e
                    );
                    bridge_channel.hangup_if_waiting();
                }

                dst_state.channels.push(bridge_channel.clone());
                if !suspended {
                    dst_state.num_active += 1;
                }
                bridge_channel.update_membership(&dst_state, |m| m.just_joined = true);
                bridge_channel.wake();
                moved += 1;
            }

            dst_state.reconfigured = true;
            src_state.reconfigured = true;
            moved
        };

        info!("Merged {} channels from bridge {} into {}", moved, src.id(), self.id());
        self.reconfigure();
        src.reconfigure();
        Ok(())
    }

    fn check_merge(&self, dst_state: &BridgeGuard<'_>, src: &Bridge, src_state: &BridgeGuard<'_>) -> Result<()> {
        for (bridge, state) in [(self, dst_state), (src, src_state)] {
            if state.is_dissolved() {
                return Err(BridgeError::Dissolved { bridge: bridge.id().clone() });
            }
            if state.merge_inhibit() > 0 {
                return Err(BridgeError::MergeInhibited { bridge: bridge.id().clone() });
            }
        }

        let unsupported = |reason: &str| BridgeError::MergeUnsupported {
            dst: self.id().clone(),
            src: src.id().clone(),
            reason: reason.to_string(),
        };
        if dst_state.flags().contains(BridgeFlags::MERGE_INHIBIT_TO) {
            return Err(unsupported("destination does not accept merges"));
        }
        if src_state.flags().contains(BridgeFlags::MERGE_INHIBIT_FROM) {
            return Err(unsupported("source does not allow merging away"));
        }

        let total = dst_state.num_channels() + src_state.num_channels();
        let can_grow = dst_state.flags().contains(BridgeFlags::SMART)
            || dst_state.technology().capabilities().contains(Capabilities::MULTI_MIX);
        if total > 2 && !can_grow {
            return Err(unsupported("destination technology is limited to two parties"));
        }
        Ok(())
    }
}

/// Lock two bridges in id order. Returns (first's guard, second's guard).
fn lock_pair<'a>(first: &'a Bridge, second: &'a Bridge) -> (BridgeGuard<'a>, BridgeGuard<'a>) {
    if first.id() <= second.id() {
        let a = first.lock();
        let b = second.lock();
        (a, b)
    } else {
        let b = second.lock();
        let a = first.lock();
        (a, b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use crate::context::BridgingCore;

    #[test]
    fn test_merge_into_itself() {
        let core = BridgingCore::with_default_technologies(BridgeConfig::default()).unwrap();
        let bridge = core.new_bridge(Capabilities::MULTI_MIX, BridgeFlags::NONE).unwrap();
        assert!(matches!(bridge.merge(&bridge), Err(BridgeError::MergeSameBridge(_))));
    }

    #[test]
    fn test_merge_flags_block() {
        let core = BridgingCore::with_default_technologies(BridgeConfig::default()).unwrap();
        let dst = core
            .new_bridge(Capabilities::MULTI_MIX, BridgeFlags::MERGE_INHIBIT_TO)
            .unwrap();
        let src = core.new_bridge(Capabilities::MULTI_MIX, BridgeFlags::NONE).unwrap();
        assert!(matches!(dst.merge(&src), Err(BridgeError::MergeUnsupported { .. })));
        assert!(src.merge(&dst).is_ok());
    }
}
