//! Continuations applied to a channel once it leaves a bridge
//!
//! The core only records where a channel should resume; the channel handle
//! owns the execution engine that acts on it.

use std::fmt;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::channel::ChannelId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AfterBridgeGoto {
    /// Run the `h` extension of the current context
    HangupExtension,
    /// Continue at an exact location
    Specific {
        context: String,
        exten: String,
        priority: u32,
    },
    /// Continue after the current location, or at a parsed goto target
    GoOn {
        context: String,
        exten: String,
        priority: u32,
        parseable: Option<String>,
    },
}

impl fmt::Display for AfterBridgeGoto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AfterBridgeGoto::HangupExtension => write!(f, "h"),
            AfterBridgeGoto::Specific {
                context,
                exten,
                priority,
            } => write!(f, "{},{},{}", context, exten, priority),
            AfterBridgeGoto::GoOn {
                parseable: Some(target),
                ..
            } => write!(f, "{}", target),
            AfterBridgeGoto::GoOn {
                context,
                exten,
                priority,
                parseable: None,
            } => write!(f, "{},{},{}", context, exten, priority + 1),
        }
    }
}

/// Per-channel continuation records, consumed on departure
#[derive(Debug, Default)]
pub struct AfterBridgeStore {
    entries: DashMap<ChannelId, AfterBridgeGoto>,
}

impl AfterBridgeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_h(&self, channel: &ChannelId) {
        self.set(channel, AfterBridgeGoto::HangupExtension);
    }

    pub fn set_goto(&self, channel: &ChannelId, context: &str, exten: &str, priority: u32) {
        self.set(
            channel,
            AfterBridgeGoto::Specific {
                context: context.to_string(),
                exten: exten.to_string(),
                priority,
            },
        );
    }

    pub fn set_go_on(
        &self,
        channel: &ChannelId,
        context: &str,
        exten: &str,
        priority: u32,
        parseable: Option<&str>,
    ) {
        self.set(
            channel,
            AfterBridgeGoto::GoOn {
                context: context.to_string(),
                exten: exten.to_string(),
                priority,
                parseable: parseable.map(str::to_string),
            },
        );
    }

    /// Replace any continuation already stored for the channel
    pub fn set(&self, channel: &ChannelId, goto: AfterBridgeGoto) {
        debug!("After-bridge goto for {} set to {}", channel, goto);
        self.entries.insert(channel.clone(), goto);
    }

    /// Read without consuming
    pub fn read(&self, channel: &ChannelId) -> Option<AfterBridgeGoto> {
        self.entries.get(channel).map(|entry| entry.value().clone())
    }

    /// Remove and return the continuation
    pub fn take(&self, channel: &ChannelId) -> Option<AfterBridgeGoto> {
        self.entries.remove(channel).map(|(_, goto)| goto)
    }

    pub fn discard(&self, channel: &ChannelId) {
        if self.entries.remove(channel).is_some() {
            debug!("Discarded after-bridge goto for {}", channel);
        }
    }
}
