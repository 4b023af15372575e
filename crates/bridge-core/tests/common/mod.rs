//! Shared helpers for the bridge integration tests

#![allow(dead_code)]

use std::time::Duration;

use rvoip_bridge_core::{BridgeConfig, BridgingCore, Format, Frame};
use tokio::time::sleep;

pub fn core() -> BridgingCore {
    BridgingCore::with_default_technologies(BridgeConfig::default()).expect("default config is valid")
}

/// Poll `check` until it holds, failing the test after a few seconds
pub async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

/// A voice frame carrying a talking energy estimate
pub fn voice(energy: u32) -> Frame {
    Frame::Voice {
        format: Format::slin(),
        samples: vec![0u8; 160].into(),
        energy: Some(energy),
    }
}

pub fn video(keyframe: bool) -> Frame {
    Frame::Video {
        keyframe,
        payload: vec![1u8; 32].into(),
    }
}

pub fn count_voice(frames: &[Frame]) -> usize {
    frames.iter().filter(|f| f.is_voice()).count()
}
