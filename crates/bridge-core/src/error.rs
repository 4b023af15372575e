//! Error types for the bridge core
//!
//! Every engine operation reports failure through [`BridgeError`]; nothing in
//! this crate is fatal to the process. The caller decides whether a rejected
//! channel should be hung up.

use thiserror::Error;

use crate::bridge::BridgeId;
use crate::channel::ChannelId;
use crate::technology::Capabilities;

#[derive(Error, Debug)]
pub enum BridgeError {
    /// Bridge construction failed, e.g. the hosting core is shutting down.
    #[error("Bridge allocation failed: {0}")]
    Allocation(String),

    /// No registered, unsuspended technology satisfies the requested capabilities.
    #[error("No bridge technology provides capabilities {capabilities}")]
    NoTechnology { capabilities: Capabilities },

    /// The bridge or its technology declined the channel.
    #[error("Bridge {bridge} rejected channel {channel}: {reason}")]
    PushRejected {
        bridge: BridgeId,
        channel: ChannelId,
        reason: String,
    },

    #[error("Channel {channel} is not a member of bridge {bridge}")]
    NotInBridge { bridge: BridgeId, channel: ChannelId },

    #[error("Channel {0} is not bridged")]
    NotBridged(ChannelId),

    #[error("Channel {0} was not imparted as departable")]
    NotDepartable(ChannelId),

    #[error("Channel {0} is already in a bridge")]
    AlreadyBridged(ChannelId),

    #[error("Bridge {bridge} has merging inhibited")]
    MergeInhibited { bridge: BridgeId },

    #[error("Cannot merge bridge {src} into {dst}: {reason}")]
    MergeUnsupported {
        dst: BridgeId,
        src: BridgeId,
        reason: String,
    },

    #[error("Cannot merge bridge {0} into itself")]
    MergeSameBridge(BridgeId),

    /// The bridge has been dissolved and accepts no further channels.
    #[error("Bridge {bridge} is dissolved")]
    Dissolved { bridge: BridgeId },

    #[error("Technology registration failed: {0}")]
    TechnologyRegistration(String),

    #[error("Technology not found: {0}")]
    TechnologyNotFound(String),

    #[error("Feature not found: {0}")]
    FeatureNotFound(String),

    #[error("Invalid feature hook: {0}")]
    InvalidHook(String),

    #[error("Operation not supported: {0}")]
    Unsupported(String),

    /// Error surfaced by the channel handle implementation.
    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Bridge task failed: {0}")]
    Task(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BridgeError>;

impl BridgeError {
    /// True for errors that indicate the channel was left untouched and can
    /// be retried against another bridge.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            BridgeError::PushRejected { .. }
                | BridgeError::Dissolved { .. }
                | BridgeError::NoTechnology { .. }
                | BridgeError::AlreadyBridged(_)
        )
    }
}
