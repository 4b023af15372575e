//! Pluggable bridge technologies
//!
//! A technology moves media between the channels of one bridge. The core
//! picks one per bridge through the [`TechnologyRegistry`], calls its hooks
//! with the bridge locked, and hands it a [`TechBridge`] view of the
//! membership plus its own private state.
//!
//! Hooks are synchronous. A technology delivers media to a peer by queueing
//! the frame on that peer's [`BridgeChannel`]; the peer's driver performs the
//! actual write.

pub mod multimix;
pub mod simple;

use std::any::Any;
use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::bridge::BridgeId;
use crate::bridge_channel::BridgeChannel;
use crate::error::{BridgeError, Result};
use crate::frame::{Frame, FormatSet};
use crate::video::VideoMode;

pub use multimix::MultimixRelay;
pub use simple::SimpleRelay;

/// Technology-private state, owned by the bridge while attached
pub type TechPvt = Option<Box<dyn Any + Send>>;

/// Set of bridge capabilities
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Capabilities(u32);

impl Capabilities {
    pub const NONE: Capabilities = Capabilities(0);
    /// Can hold channels without exchanging media
    pub const HOLDING: Capabilities = Capabilities(1 << 0);
    /// Works before the channels are answered
    pub const EARLY: Capabilities = Capabilities(1 << 1);
    /// Media flows directly between the endpoints
    pub const NATIVE: Capabilities = Capabilities(1 << 2);
    /// Relays between exactly two channels
    pub const ONE_TO_ONE_MIX: Capabilities = Capabilities(1 << 3);
    /// Distributes media among any number of channels
    pub const MULTI_MIX: Capabilities = Capabilities(1 << 4);

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// True when every capability in `other` is present in `self`
    pub fn contains(&self, other: Capabilities) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(&self, other: Capabilities) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for Capabilities {
    type Output = Capabilities;

    fn bitor(self, rhs: Capabilities) -> Capabilities {
        Capabilities(self.0 | rhs.0)
    }
}

impl BitOrAssign for Capabilities {
    fn bitor_assign(&mut self, rhs: Capabilities) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Capabilities {
    type Output = Capabilities;

    fn bitand(self, rhs: Capabilities) -> Capabilities {
        Capabilities(self.0 & rhs.0)
    }
}

impl fmt::Display for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(Capabilities, &str); 5] = [
            (Capabilities::HOLDING, "holding"),
            (Capabilities::EARLY, "early"),
            (Capabilities::NATIVE, "native"),
            (Capabilities::ONE_TO_ONE_MIX, "1to1mix"),
            (Capabilities::MULTI_MIX, "multimix"),
        ];
        let names: Vec<&str> = NAMES
            .iter()
            .filter(|(cap, _)| self.contains(*cap))
            .map(|(_, name)| *name)
            .collect();
        if names.is_empty() {
            write!(f, "none")
        } else {
            write!(f, "{}", names.join("|"))
        }
    }
}

/// Selection preference; `High` wins over `Medium` over `Low`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TechPreference {
    High,
    Medium,
    Low,
}

/// Per-channel optimization parameters a technology may honor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TechArgs {
    /// Energy above which the channel is considered talking, 0 disables detection
    pub talking_threshold: u32,
    /// Energy below which voice is considered silence
    pub silence_threshold: u32,
    /// Do not relay voice frames classified as silence
    pub drop_silence: bool,
}

/// View of a locked bridge handed to technology hooks
pub struct TechBridge<'a> {
    pub id: &'a BridgeId,
    /// Current members in join order. A joining channel is not yet listed;
    /// a leaving channel still is.
    pub channels: &'a [Arc<BridgeChannel>],
    pub pvt: &'a mut TechPvt,
    pub video_mode: &'a VideoMode,
    /// 0 lets the technology decide
    pub internal_sample_rate: u32,
    /// 0 lets the technology decide
    pub mixing_interval: u32,
}

impl TechBridge<'_> {
    /// Typed access to the private state installed by `create`
    pub fn pvt_mut<T: Any + Send>(&mut self) -> Option<&mut T> {
        self.pvt.as_mut().and_then(|pvt| pvt.downcast_mut::<T>())
    }

    pub fn peers<'b>(&'b self, of: &'b Arc<BridgeChannel>) -> impl Iterator<Item = &'b Arc<BridgeChannel>> + 'b {
        self.channels.iter().filter(move |bc| !Arc::ptr_eq(bc, of))
    }
}

pub trait BridgeTechnology: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    fn preference(&self) -> TechPreference {
        TechPreference::Medium
    }

    /// Formats this technology accepts, best first
    fn formats(&self) -> FormatSet;

    /// Build private state for a newly attached bridge
    fn create(&self, bridge: &mut TechBridge<'_>) -> Result<()> {
        let _ = bridge;
        Ok(())
    }

    fn start(&self, bridge: &mut TechBridge<'_>) -> Result<()> {
        let _ = bridge;
        Ok(())
    }

    fn stop(&self, bridge: &mut TechBridge<'_>) {
        let _ = bridge;
    }

    /// Release private state once the technology is detached
    fn destroy(&self, bridge: &BridgeId, pvt: TechPvt) {
        let _ = (bridge, pvt);
    }

    /// Accept a channel into the mix. An error rejects the channel.
    fn join(&self, bridge: &mut TechBridge<'_>, channel: &Arc<BridgeChannel>) -> Result<()> {
        let _ = (bridge, channel);
        Ok(())
    }

    fn leave(&self, bridge: &mut TechBridge<'_>, channel: &Arc<BridgeChannel>) {
        let _ = (bridge, channel);
    }

    fn suspend(&self, bridge: &mut TechBridge<'_>, channel: &Arc<BridgeChannel>) {
        let _ = (bridge, channel);
    }

    fn unsuspend(&self, bridge: &mut TechBridge<'_>, channel: &Arc<BridgeChannel>) {
        let _ = (bridge, channel);
    }

    /// Membership or mixing parameters changed
    fn reconfigure(&self, bridge: &mut TechBridge<'_>) {
        let _ = bridge;
    }

    /// Distribute a frame read from `from`
    fn write(&self, bridge: &mut TechBridge<'_>, from: &Arc<BridgeChannel>, frame: &Frame) -> Result<()>;
}

impl fmt::Debug for dyn BridgeTechnology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeTechnology")
            .field("name", &self.name())
            .field("capabilities", &self.capabilities())
            .finish()
    }
}

struct Registration {
    technology: Arc<dyn BridgeTechnology>,
    suspended: bool,
}

/// Registered technologies, in registration order
#[derive(Default)]
pub struct TechnologyRegistry {
    entries: RwLock<Vec<Registration>>,
}

impl TechnologyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in relay technologies
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        let builtins: [Arc<dyn BridgeTechnology>; 2] =
            [Arc::new(SimpleRelay::new()), Arc::new(MultimixRelay::new())];
        for technology in builtins {
            if let Err(e) = registry.register(technology) {
                warn!("Failed to register built-in technology: {}", e);
            }
        }
        registry
    }

    pub fn register(&self, technology: Arc<dyn BridgeTechnology>) -> Result<()> {
        let name = technology.name().to_string();
        if name.is_empty() {
            return Err(BridgeError::TechnologyRegistration(
                "technology has no name".to_string(),
            ));
        }
        if technology.capabilities().is_empty() {
            return Err(BridgeError::TechnologyRegistration(format!(
                "technology {} advertises no capabilities",
                name
            )));
        }
        if technology.formats().is_empty() {
            return Err(BridgeError::TechnologyRegistration(format!(
                "technology {} accepts no formats",
                name
            )));
        }

        let mut entries = self.entries.write();
        if entries.iter().any(|r| r.technology.name().eq_ignore_ascii_case(&name)) {
            return Err(BridgeError::TechnologyRegistration(format!(
                "technology {} is already registered",
                name
            )));
        }
        entries.push(Registration {
            technology,
            suspended: false,
        });
        info!("Registered bridge technology {}", name);
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> Result<()> {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|r| !r.technology.name().eq_ignore_ascii_case(name));
        if entries.len() == before {
            return Err(BridgeError::TechnologyNotFound(name.to_string()));
        }
        info!("Unregistered bridge technology {}", name);
        Ok(())
    }

    /// Exclude a technology from selection without unregistering it
    pub fn suspend(&self, name: &str) -> Result<()> {
        self.set_suspended(name, true)
    }

    pub fn unsuspend(&self, name: &str) -> Result<()> {
        self.set_suspended(name, false)
    }

    fn set_suspended(&self, name: &str, suspended: bool) -> Result<()> {
        let mut entries = self.entries.write();
        let entry = entries
            .iter_mut()
            .find(|r| r.technology.name().eq_ignore_ascii_case(name))
            .ok_or_else(|| BridgeError::TechnologyNotFound(name.to_string()))?;
        entry.suspended = suspended;
        debug!("Technology {} suspended={}", name, suspended);
        Ok(())
    }

    /// Best unsuspended technology providing every requested capability.
    /// Ties on preference go to the most recently registered.
    pub fn find_best(&self, capabilities: Capabilities) -> Result<Arc<dyn BridgeTechnology>> {
        let entries = self.entries.read();
        let mut best: Option<&Arc<dyn BridgeTechnology>> = None;
        for entry in entries.iter() {
            if entry.suspended {
                debug!("Skipping suspended technology {}", entry.technology.name());
                continue;
            }
            if !entry.technology.capabilities().contains(capabilities) {
                continue;
            }
            match best {
                Some(current) if entry.technology.preference() > current.preference() => {}
                _ => best = Some(&entry.technology),
            }
        }

        best.cloned().ok_or(BridgeError::NoTechnology { capabilities })
    }

    /// True when some technology could serve `capabilities`
    pub fn check(&self, capabilities: Capabilities) -> bool {
        self.find_best(capabilities).is_ok()
    }

    pub fn names(&self) -> Vec<String> {
        self.entries
            .read()
            .iter()
            .map(|r| r.technology.name().to_string())
            .collect()
    }
}

/// Shared relay used by the built-in technologies: queue `frame` on every
/// peer that is still bridged and not suspended.
pub(crate) fn relay_to_peers(bridge: &TechBridge<'_>, from: &Arc<BridgeChannel>, frame: &Frame) {
    if let Frame::Video { .. } = frame {
        if bridge.video_mode.is_video_src(from.id()) == 0 {
            return;
        }
    }

    if let Frame::Voice {
        energy: Some(energy),
        ..
    } = frame
    {
        let args = from.tech_args();
        if args.drop_silence && *energy < args.silence_threshold {
            return;
        }
    }

    for peer in bridge.peers(from) {
        if peer.is_suspended() {
            continue;
        }
        if let Err(e) = peer.queue_frame(frame.clone()) {
            debug!("Not relaying {} frame to {}: {}", frame.kind(), peer.name(), e);
        }
    }
}
