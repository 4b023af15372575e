//! Channel handle abstraction
//!
//! A channel handle is one call leg: device I/O, codec negotiation and
//! signaling all live behind this trait. The bridge core only reads and
//! writes frames through it and adjusts its read/write formats.
//!
//! Implementations must make [`ChannelHandle::read_frame`] cancel safe: the
//! bridge driver races it against its wake signal and drops the future when
//! the wake wins.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::after_bridge::AfterBridgeGoto;
use crate::error::{BridgeError, Result};
use crate::frame::{Format, Frame};

/// Unique identifier of a channel handle
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelId(pub String);

impl ChannelId {
    pub fn new() -> Self {
        Self(format!("chan_{}", uuid::Uuid::new_v4()))
    }

    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ChannelId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[async_trait]
pub trait ChannelHandle: Send + Sync {
    fn id(&self) -> &ChannelId;

    /// Human readable name used in logs
    fn name(&self) -> &str;

    fn read_format(&self) -> Format;

    fn write_format(&self) -> Format;

    fn set_read_format(&self, format: &Format) -> Result<()>;

    fn set_write_format(&self, format: &Format) -> Result<()>;

    fn supports_video(&self) -> bool {
        false
    }

    /// Next inbound frame. `None` means the far end hung up.
    async fn read_frame(&self) -> Option<Frame>;

    async fn write_frame(&self, frame: Frame) -> Result<()>;

    /// Terminate the call leg
    async fn hangup(&self);

    fn is_hung_up(&self) -> bool;

    /// Play a sound file to this channel, returning when playback ends
    async fn play_file(&self, file: &str) -> Result<()> {
        Err(BridgeError::Unsupported(format!(
            "{} cannot play {}",
            self.name(),
            file
        )))
    }

    /// Run a dialplan application on this channel
    async fn run_app(&self, app: &str, args: Option<&str>) -> Result<()> {
        let _ = args;
        Err(BridgeError::Unsupported(format!(
            "{} cannot run application {}",
            self.name(),
            app
        )))
    }

    /// Resume execution at the given continuation after leaving a bridge
    async fn apply_after_bridge_goto(&self, goto: &AfterBridgeGoto) -> Result<()> {
        Err(BridgeError::Unsupported(format!(
            "{} has no execution engine for {}",
            self.name(),
            goto
        )))
    }
}

impl fmt::Debug for dyn ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("id", self.id())
            .field("name", &self.name())
            .finish()
    }
}
