//! Two-party relay
//!
//! Frames read from one channel are queued unchanged on the other. A third
//! channel is refused; smart bridges switch to a multi-party technology
//! before that happens.

use std::sync::Arc;

use tracing::debug;

use super::{relay_to_peers, BridgeTechnology, Capabilities, TechBridge, TechPreference};
use crate::bridge_channel::BridgeChannel;
use crate::error::{BridgeError, Result};
use crate::frame::{Format, FormatSet, Frame};

#[derive(Debug, Default)]
pub struct SimpleRelay;

impl SimpleRelay {
    pub fn new() -> Self {
        Self
    }
}

impl BridgeTechnology for SimpleRelay {
    fn name(&self) -> &str {
        "simple_bridge"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::ONE_TO_ONE_MIX
    }

    fn preference(&self) -> TechPreference {
        TechPreference::Medium
    }

    fn formats(&self) -> FormatSet {
        FormatSet::new([Format::slin(), Format::slin16(), Format::ulaw()])
    }

    fn join(&self, bridge: &mut TechBridge<'_>, channel: &Arc<BridgeChannel>) -> Result<()> {
        if bridge.channels.len() >= 2 {
            return Err(BridgeError::PushRejected {
                bridge: bridge.id.clone(),
                channel: channel.id().clone(),
                reason: "two-party relay is full".to_string(),
            });
        }
        debug!("{} joined two-party relay on {}", channel.name(), bridge.id);
        Ok(())
    }

    fn write(&self, bridge: &mut TechBridge<'_>, from: &Arc<BridgeChannel>, frame: &Frame) -> Result<()> {
        relay_to_peers(bridge, from, frame);
        Ok(())
    }
}
