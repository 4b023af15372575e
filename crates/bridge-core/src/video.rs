//! Video source selection
//!
//! A bridge distributes at most one video feed at a time. In single source
//! mode the feed is pinned explicitly; in talker mode the loudest channel
//! wins, with a hysteresis margin so two similar talkers don't make the
//! picture flap.
//!
//! The selector is pure state: every mutation returns the channels that
//! should be asked for a fresh keyframe, and the bridge delivers those
//! requests as [`ControlFrame::VideoUpdate`](crate::frame::ControlFrame).

use serde::Serialize;

use crate::channel::ChannelId;
use crate::config::BridgeConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum VideoModeKind {
    None,
    SingleSrc,
    TalkerSrc,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TalkerSrc {
    pub current: Option<ChannelId>,
    /// Running talking energy of the current source
    pub average_energy: u32,
    pub previous: Option<ChannelId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum VideoMode {
    #[default]
    None,
    SingleSrc(Option<ChannelId>),
    TalkerSrc(TalkerSrc),
}

/// Tuning for talker mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TalkerParams {
    pub hysteresis_margin: u32,
    pub smoothing: u32,
}

impl TalkerParams {
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            hysteresis_margin: config.talker_hysteresis_margin,
            smoothing: config.talker_energy_smoothing.max(1),
        }
    }
}

impl Default for TalkerParams {
    fn default() -> Self {
        Self::from_config(&BridgeConfig::default())
    }
}

impl VideoMode {
    pub fn kind(&self) -> VideoModeKind {
        match self {
            VideoMode::None => VideoModeKind::None,
            VideoMode::SingleSrc(_) => VideoModeKind::SingleSrc,
            VideoMode::TalkerSrc(_) => VideoModeKind::TalkerSrc,
        }
    }

    /// Pin `source` as the only feed. Returns the channel to ask for a keyframe.
    pub fn set_single_src(&mut self, source: ChannelId) -> Vec<ChannelId> {
        *self = VideoMode::SingleSrc(Some(source.clone()));
        vec![source]
    }

    pub fn set_talker_src(&mut self) {
        *self = VideoMode::TalkerSrc(TalkerSrc::default());
    }

    pub fn clear(&mut self) {
        *self = VideoMode::None;
    }

    /// Feed one talking energy sample for `channel`.
    pub fn update_talker_energy(
        &mut self,
        channel: &ChannelId,
        energy: u32,
        keyframe: bool,
        params: &TalkerParams,
    ) -> Vec<ChannelId> {
        let VideoMode::TalkerSrc(talker) = self else {
            return Vec::new();
        };

        if talker.current.as_ref() == Some(channel) {
            let smoothing = params.smoothing.max(1) as u64;
            let average = (talker.average_energy as u64 * (smoothing - 1) + energy as u64) / smoothing;
            talker.average_energy = average as u32;
            return Vec::new();
        }

        let louder = talker.current.is_some()
            && energy > talker.average_energy.saturating_add(params.hysteresis_margin);

        if louder && keyframe {
            let mut requests = Vec::with_capacity(2);
            if let Some(old) = talker.current.take() {
                requests.push(old.clone());
                talker.previous = Some(old);
            }
            talker.current = Some(channel.clone());
            talker.average_energy = energy;
            requests.push(channel.clone());
            requests
        } else if louder {
            // Ask the candidate for a keyframe so it can take over on the next sample
            vec![channel.clone()]
        } else if talker.current.is_none() && keyframe {
            talker.current = Some(channel.clone());
            talker.average_energy = energy;
            vec![channel.clone()]
        } else if talker.previous.is_none() && keyframe {
            talker.previous = Some(channel.clone());
            vec![channel.clone()]
        } else {
            Vec::new()
        }
    }

    /// Rank of `channel` as a video source: 1 for the current feed, 2 for
    /// the retained previous talker, 0 when it is not a source.
    pub fn is_video_src(&self, channel: &ChannelId) -> u8 {
        match self {
            VideoMode::None => 0,
            VideoMode::SingleSrc(source) => u8::from(source.as_ref() == Some(channel)),
            VideoMode::TalkerSrc(talker) => {
                if talker.current.as_ref() == Some(channel) {
                    1
                } else if talker.previous.as_ref() == Some(channel) {
                    2
                } else {
                    0
                }
            }
        }
    }

    pub fn number_video_src(&self) -> usize {
        match self {
            VideoMode::None => 0,
            VideoMode::SingleSrc(source) => usize::from(source.is_some()),
            VideoMode::TalkerSrc(talker) => {
                usize::from(talker.current.is_some()) + usize::from(talker.previous.is_some())
            }
        }
    }

    /// Forget `channel` as a source, typically because it left the bridge
    pub fn remove_video_src(&mut self, channel: &ChannelId) {
        match self {
            VideoMode::None => {}
            VideoMode::SingleSrc(source) => {
                if source.as_ref() == Some(channel) {
                    *source = None;
                }
            }
            VideoMode::TalkerSrc(talker) => {
                if talker.current.as_ref() == Some(channel) {
                    talker.current = None;
                    talker.average_energy = 0;
                }
                if talker.previous.as_ref() == Some(channel) {
                    talker.previous = None;
                }
            }
        }
    }
}
