//! # RVoIP Bridge Core
//!
//! Bridging engine for joining independently driven call legs into shared
//! real-time sessions.
//!
//! A [`Bridge`] holds an ordered set of channels and a pluggable
//! [`BridgeTechnology`] that moves media between them. Every bridged channel
//! is driven by its own tokio task; the engine coordinates those tasks
//! around the shared bridge state so that channels can be joined, imparted,
//! departed, removed, suspended, swapped and merged between bridges while
//! media keeps flowing.
//!
//! ## Features
//!
//! - **Join / Impart**: drive a channel on the calling task, or on a spawned one
//! - **Depart / Remove**: take a channel back alive, or make it leave with hangup
//! - **Suspend**: borrow a member's I/O without detaching it
//! - **Merge**: move every member of one bridge into another, deadlock free
//! - **Smart bridging**: switch between two-party and multi-party technologies
//! - **Features**: DTMF hooks, interval hooks, talk detection, call limits
//! - **Video source selection**: pinned source or loudest-talker with hysteresis
//!
//! ## Architecture
//!
//! - `context`: the [`BridgingCore`] context owning registries and configuration
//! - `bridge` / `bridge_channel`: shared state and its locking discipline
//! - `engine` / `merge`: membership protocols
//! - `technology`: the technology trait, registry and built-in relays
//! - `features`, `video`, `action`: hooks, video policy and queued work
//! - `channel` / `frame`: the interface to call legs and their media
//! - `mock`: in-memory doubles for tests
//!
//! ## Example
//!
//! ```rust,no_run
//! use rvoip_bridge_core::mock::MockChannel;
//! use rvoip_bridge_core::{BridgeConfig, BridgeFlags, BridgingCore, Capabilities};
//!
//! # async fn example() -> rvoip_bridge_core::Result<()> {
//! let core = BridgingCore::with_default_technologies(BridgeConfig::default())?;
//! let bridge = core.new_bridge(Capabilities::MULTI_MIX, BridgeFlags::DISSOLVE_HANGUP)?;
//!
//! let alice = MockChannel::new("alice");
//! bridge.impart(alice.clone(), None, None, None, false)?;
//! let bob = MockChannel::new("bob");
//! let state = bridge.join(bob, None, None, None).await?;
//! # let _ = state;
//! # Ok(())
//! # }
//! ```

pub mod action;
pub mod after_bridge;
pub mod bridge;
pub mod bridge_channel;
pub mod channel;
pub mod config;
pub mod context;
mod driver;
pub mod engine;
pub mod error;
pub mod features;
pub mod frame;
pub mod logging;
pub mod merge;
pub mod mock;
pub mod technology;
pub mod video;

// Re-export key types
pub use action::ChannelAction;
pub use after_bridge::{AfterBridgeGoto, AfterBridgeStore};
pub use bridge::{BaseBridge, Bridge, BridgeFlags, BridgeId, BridgeMethods, BridgeSnapshot, BridgeState, UnregisteredBridge};
pub use bridge_channel::{BridgeChannel, BridgeChannelState, Membership, ThreadActivity};
pub use channel::{ChannelHandle, ChannelId};
pub use config::BridgeConfig;
pub use context::BridgingCore;
pub use error::{BridgeError, Result};
pub use features::{hook_fn, BridgeFeatures, BridgeLimits, BuiltinFeature, FeatureRegistry, HookCallback, HookId, HookOutcome};
pub use frame::{ControlFrame, Format, FormatSet, Frame};
pub use logging::{setup_logging, LoggingConfig};
pub use technology::{BridgeTechnology, Capabilities, TechArgs, TechPreference, TechnologyRegistry};
pub use video::{VideoMode, VideoModeKind};
