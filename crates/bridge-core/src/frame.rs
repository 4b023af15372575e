//! Media and control frames exchanged between channel handles and the bridge

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Media format identifier, e.g. `"slin16"` or `"ulaw"`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Format(String);

impl Format {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }

    pub fn slin() -> Self {
        Self::new("slin")
    }

    pub fn slin16() -> Self {
        Self::new("slin16")
    }

    pub fn ulaw() -> Self {
        Self::new("ulaw")
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Ordered list of formats; the first entry is the preferred one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormatSet(Vec<Format>);

impl FormatSet {
    pub fn new(formats: impl IntoIterator<Item = Format>) -> Self {
        Self(formats.into_iter().collect())
    }

    pub fn contains(&self, format: &Format) -> bool {
        self.0.iter().any(|f| f == format)
    }

    /// Preferred format of the set
    pub fn best(&self) -> Option<&Format> {
        self.0.first()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Format> {
        self.0.iter()
    }
}

/// Control indications carried through the bridge
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlFrame {
    Hangup,
    /// Request a full video picture (keyframe) from the receiver
    VideoUpdate,
    Hold { music_class: Option<String> },
    Unhold,
    /// The media source feeding this channel changed
    SourceChange,
    Ringing,
    Answer,
    Other(u32),
}

impl ControlFrame {
    /// Controls a bridge swallows instead of relaying to peers
    pub fn is_bridge_local(&self) -> bool {
        matches!(
            self,
            ControlFrame::Hangup | ControlFrame::Ringing | ControlFrame::Answer
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Voice {
        format: Format,
        samples: Bytes,
        /// Talking energy estimate, when the channel provides one
        energy: Option<u32>,
    },
    Video {
        keyframe: bool,
        payload: Bytes,
    },
    DtmfBegin(char),
    DtmfEnd {
        digit: char,
        duration_ms: u32,
    },
    Control(ControlFrame),
    Text(String),
    Null,
}

impl Frame {
    pub fn voice(format: Format, samples: impl Into<Bytes>) -> Self {
        Frame::Voice {
            format,
            samples: samples.into(),
            energy: None,
        }
    }

    pub fn is_voice(&self) -> bool {
        matches!(self, Frame::Voice { .. })
    }

    pub fn is_video(&self) -> bool {
        matches!(self, Frame::Video { .. })
    }

    pub fn is_dtmf(&self) -> bool {
        matches!(self, Frame::DtmfBegin(_) | Frame::DtmfEnd { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Voice { .. } => "voice",
            Frame::Video { .. } => "video",
            Frame::DtmfBegin(_) => "dtmf-begin",
            Frame::DtmfEnd { .. } => "dtmf-end",
            Frame::Control(_) => "control",
            Frame::Text(_) => "text",
            Frame::Null => "null",
        }
    }
}
