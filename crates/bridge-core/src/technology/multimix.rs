//! Multi-party relay
//!
//! Every frame is fanned out to all other members. Voice frames carrying an
//! energy estimate drive talk detection for channels that asked for it
//! through their [`TechArgs`](super::TechArgs).

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, trace};

use super::{relay_to_peers, BridgeTechnology, Capabilities, TechBridge, TechPreference};
use crate::bridge_channel::BridgeChannel;
use crate::channel::ChannelId;
use crate::error::Result;
use crate::frame::{Format, FormatSet, Frame};

/// Talking state per member
#[derive(Debug, Default)]
struct MixState {
    talking: HashMap<ChannelId, bool>,
}

#[derive(Debug, Default)]
pub struct MultimixRelay;

impl MultimixRelay {
    pub fn new() -> Self {
        Self
    }

    fn detect_talking(&self, bridge: &mut TechBridge<'_>, from: &Arc<BridgeChannel>, energy: u32) {
        let args = from.tech_args();
        if args.talking_threshold == 0 {
            return;
        }
        let Some(state) = bridge.pvt_mut::<MixState>() else {
            return;
        };
        let talking = energy >= args.talking_threshold;
        let was_talking = state.talking.insert(from.id().clone(), talking).unwrap_or(false);
        if talking != was_talking {
            trace!("{} talking={} (energy {})", from.name(), talking, energy);
            from.notify_talking(talking);
        }
    }
}

impl BridgeTechnology for MultimixRelay {
    fn name(&self) -> &str {
        "multimix_relay"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::MULTI_MIX
    }

    fn preference(&self) -> TechPreference {
        TechPreference::Medium
    }

    fn formats(&self) -> FormatSet {
        FormatSet::new([Format::slin16(), Format::slin(), Format::ulaw()])
    }

    fn create(&self, bridge: &mut TechBridge<'_>) -> Result<()> {
        *bridge.pvt = Some(Box::new(MixState::default()));
        Ok(())
    }

    fn leave(&self, bridge: &mut TechBridge<'_>, channel: &Arc<BridgeChannel>) {
        if let Some(state) = bridge.pvt_mut::<MixState>() {
            state.talking.remove(channel.id());
        }
    }

    fn reconfigure(&self, bridge: &mut TechBridge<'_>) {
        debug!(
            "Multimix relay on {} resynchronized: {} members, rate {} interval {}",
            bridge.id,
            bridge.channels.len(),
            bridge.internal_sample_rate,
            bridge.mixing_interval
        );
    }

    fn write(&self, bridge: &mut TechBridge<'_>, from: &Arc<BridgeChannel>, frame: &Frame) -> Result<()> {
        if let Frame::Voice {
            energy: Some(energy),
            ..
        } = frame
        {
            self.detect_talking(bridge, from, *energy);
        }
        relay_to_peers(bridge, from, frame);
        Ok(())
    }
}
