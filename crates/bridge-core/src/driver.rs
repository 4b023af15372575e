//! The per-channel driver task
//!
//! Each bridged channel is driven by exactly one task: the joining task for
//! [`Bridge::join`](crate::bridge::Bridge::join), a spawned one for impart.
//! The driver waits on three sources at once (its wake, inbound media and
//! the next interval hook) and handles one event per turn. It touches the
//! channel's I/O only between `begin_io` and `end_io`, which is what lets
//! suspend hand the channel to another task.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, info_span, trace, Instrument};

use crate::action::ChannelAction;
use crate::bridge_channel::{BridgeChannel, BridgeChannelState, Queued, ThreadActivity};
use crate::context::CoreInner;
use crate::engine::restore_formats;
use crate::features::{DtmfMatch, HookOutcome};
use crate::frame::{ControlFrame, Frame};

/// Length reported for digits the bridge streams itself
const STREAMED_DIGIT_MS: u32 = 100;

/// Drive `bridge_channel` until it leaves its bridge and return the state
/// it left with.
pub(crate) async fn run(bridge_channel: Arc<BridgeChannel>, core: Arc<CoreInner>) -> BridgeChannelState {
    let span = info_span!("bridge_channel", channel = %bridge_channel.name());
    async move {
        debug!("Driver started for {}", bridge_channel.name());
        while bridge_channel.state() == BridgeChannelState::Wait {
            if bridge_channel.is_suspended() {
                bridge_channel.wait_for_wake().await;
                continue;
            }
            if !bridge_channel.begin_io() {
                continue;
            }
            turn(&bridge_channel, &core).await;
            bridge_channel.end_io();
        }
        finish(&bridge_channel, &core)
    }
    .instrument(span)
    .await
}

/// Handle one queued item or one wait result
async fn turn(bridge_channel: &Arc<BridgeChannel>, core: &Arc<CoreInner>) {
    if let Some(item) = bridge_channel.pop_queued() {
        match item {
            Queued::Frame(frame) => {
                bridge_channel.set_activity(ThreadActivity::Frame);
                trace!("Writing queued {} to {}", frame.kind(), bridge_channel.name());
                if let Err(e) = bridge_channel.channel().write_frame(frame).await {
                    debug!("Write to {} failed: {}", bridge_channel.name(), e);
                }
            }
            Queued::Action(action) => {
                bridge_channel.set_activity(ThreadActivity::Simple);
                handle_action(bridge_channel, core, action).await;
            }
        }
        bridge_channel.set_activity(ThreadActivity::Idle);
        return;
    }

    let trip = bridge_channel.with_features(|f| f.next_interval_trip()).flatten();
    tokio::select! {
        biased;
        _ = bridge_channel.wait_for_wake() => {}
        _ = sleep_until(trip.unwrap_or_else(Instant::now)), if trip.is_some() => {
            bridge_channel.set_activity(ThreadActivity::Simple);
            run_interval_hooks(bridge_channel).await;
            bridge_channel.set_activity(ThreadActivity::Idle);
        }
        frame = bridge_channel.channel().read_frame() => {
            bridge_channel.set_activity(ThreadActivity::Frame);
            handle_frame(bridge_channel, frame);
            bridge_channel.set_activity(ThreadActivity::Idle);
        }
    }
}

/// Pass a frame read from the channel into the bridge
fn handle_frame(bridge_channel: &Arc<BridgeChannel>, frame: Option<Frame>) {
    let Some(frame) = frame else {
        debug!("{} stopped delivering media", bridge_channel.name());
        bridge_channel.change_state(BridgeChannelState::End);
        return;
    };

    match &frame {
        Frame::Control(ControlFrame::Hangup) => {
            debug!("{} hung up", bridge_channel.name());
            bridge_channel.change_state(BridgeChannelState::End);
            return;
        }
        Frame::Control(control) if control.is_bridge_local() => {
            trace!("Dropping {:?} from {}", control, bridge_channel.name());
            return;
        }
        Frame::DtmfBegin(digit) if starts_feature(bridge_channel, *digit) => {
            if let Err(e) = bridge_channel.queue_action(ChannelAction::Feature { digit: *digit }) {
                trace!("Feature collection not queued on {}: {}", bridge_channel.name(), e);
            }
            return;
        }
        _ => {}
    }

    let (passthrough, mute) = bridge_channel
        .with_features(|f| (f.dtmf_passthrough, f.mute))
        .unwrap_or((true, false));
    if (frame.is_dtmf() && !passthrough) || (frame.is_voice() && mute) {
        return;
    }
    if let Frame::Voice { energy: Some(energy), .. } = &frame {
        bridge_channel.record_talker_energy(*energy);
    }

    bridge_channel.with_bridge(|bridge, guard| {
        if let Frame::Video { keyframe, .. } = &frame {
            bridge.update_talker_src_locked(guard, bridge_channel.id(), bridge_channel.talker_energy(), *keyframe);
        }
        if let Err(e) = bridge.technology_write(guard, bridge_channel, &frame) {
            debug!("Bridge {} dropped {} from {}: {}", bridge.id(), frame.kind(), bridge_channel.name(), e);
        }
    });
}

async fn handle_action(bridge_channel: &Arc<BridgeChannel>, core: &Arc<CoreInner>, action: ChannelAction) {
    trace!("Running {} on {}", action.kind(), bridge_channel.name());
    let channel = bridge_channel.channel();
    match action {
        ChannelAction::Feature { digit } => collect_feature(bridge_channel, core, digit).await,
        ChannelAction::Interval => run_interval_hooks(bridge_channel).await,
        ChannelAction::DtmfStream(digits) => {
            for digit in digits.chars() {
                let frames = [
                    Frame::DtmfBegin(digit),
                    Frame::DtmfEnd {
                        digit,
                        duration_ms: STREAMED_DIGIT_MS,
                    },
                ];
                for frame in frames {
                    if let Err(e) = channel.write_frame(frame).await {
                        debug!("DTMF {} to {} failed: {}", digit, bridge_channel.name(), e);
                    }
                }
            }
        }
        ChannelAction::TalkingStart | ChannelAction::TalkingStop => {
            let talking = matches!(action, ChannelAction::TalkingStart);
            let callback = bridge_channel
                .with_features(|f| f.talker_callback())
                .flatten()
                .or_else(|| {
                    bridge_channel
                        .with_bridge(|_, guard| guard.features().talker_callback())
                        .flatten()
                });
            if let Some(callback) = callback {
                callback(bridge_channel, talking);
            }
        }
        ChannelAction::PlayFile { file, moh_class } => {
            with_hold_music(bridge_channel, moh_class, async {
                if let Err(e) = channel.play_file(&file).await {
                    error!("Playing {} to {} failed: {}", file, bridge_channel.name(), e);
                }
            })
            .await
        }
        ChannelAction::RunApp { app, args, moh_class } => {
            with_hold_music(bridge_channel, moh_class, async {
                if let Err(e) = channel.run_app(&app, args.as_deref()).await {
                    error!("Running {} on {} failed: {}", app, bridge_channel.name(), e);
                }
            })
            .await
        }
    }
}

/// Run `work` while the other members hear hold music of `moh_class`
async fn with_hold_music(
    bridge_channel: &Arc<BridgeChannel>,
    moh_class: Option<String>,
    work: impl std::future::Future<Output = ()>,
) {
    let held = match moh_class {
        Some(class) => {
            let music_class = (!class.is_empty()).then_some(class);
            bridge_channel.write_control(ControlFrame::Hold { music_class }).is_ok()
        }
        None => false,
    };
    work.await;
    if held {
        if let Err(e) = bridge_channel.write_control(ControlFrame::Unhold) {
            debug!("Unhold from {} not delivered: {}", bridge_channel.name(), e);
        }
    }
}

/// Match collected digits against the channel's hooks, then the bridge's
fn feature_match(bridge_channel: &Arc<BridgeChannel>, digits: &str) -> DtmfMatch {
    let own = bridge_channel
        .with_features(|f| f.is_usable().then(|| f.match_dtmf(digits)))
        .flatten();
    if let Some(found @ DtmfMatch::Exact { .. }) = own {
        return found;
    }
    let shared = bridge_channel
        .with_bridge(|_, guard| guard.features().match_dtmf(digits))
        .unwrap_or(DtmfMatch::NoMatch);
    match (own, shared) {
        (_, found @ DtmfMatch::Exact { .. }) => found,
        (Some(DtmfMatch::Prefix), _) | (_, DtmfMatch::Prefix) => DtmfMatch::Prefix,
        _ => DtmfMatch::NoMatch,
    }
}

fn starts_feature(bridge_channel: &Arc<BridgeChannel>, digit: char) -> bool {
    bridge_channel
        .with_features(|f| f.is_usable() && f.starts_hook(digit))
        .unwrap_or(false)
        || bridge_channel
            .with_bridge(|_, guard| guard.features().starts_hook(digit))
            .unwrap_or(false)
}

/// Collect a feature sequence starting with `first` and run its hook.
/// Digits that match nothing are streamed to the other members.
async fn collect_feature(bridge_channel: &Arc<BridgeChannel>, core: &Arc<CoreInner>, first: char) {
    let timeout = core.config.feature_digit_timeout();
    let max_digits = core.config.max_feature_digits;
    let mut digits = String::from(first);

    loop {
        match feature_match(bridge_channel, &digits) {
            DtmfMatch::Exact { id, callback } => {
                info!("Feature {} activated on {}", digits, bridge_channel.name());
                let outcome = callback.call(bridge_channel).await;
                if outcome == HookOutcome::Remove {
                    bridge_channel.with_features(|f| f.remove_hook(id));
                    bridge_channel.with_bridge(|_, guard| guard.features.remove_hook(id));
                }
                return;
            }
            DtmfMatch::NoMatch => break,
            DtmfMatch::Prefix => {}
        }
        if digits.chars().count() >= max_digits {
            break;
        }
        match next_digit(bridge_channel, timeout).await {
            Some(digit) => digits.push(digit),
            None => break,
        }
    }

    debug!("No feature for {} on {}, passing digits on", digits, bridge_channel.name());
    bridge_channel.with_bridge(|bridge, guard| bridge.dtmf_stream_locked(guard, &digits, Some(bridge_channel.id())));
}

/// Wait up to `timeout` for the next digit. Other media is dropped.
async fn next_digit(bridge_channel: &Arc<BridgeChannel>, timeout: Duration) -> Option<char> {
    let deadline = Instant::now() + timeout;
    loop {
        if bridge_channel.state() != BridgeChannelState::Wait || bridge_channel.is_suspended() {
            return None;
        }
        tokio::select! {
            biased;
            _ = bridge_channel.wait_for_wake() => {}
            _ = sleep_until(deadline) => return None,
            frame = bridge_channel.channel().read_frame() => match frame {
                Some(Frame::DtmfBegin(digit)) => return Some(digit),
                Some(Frame::DtmfEnd { .. }) => {}
                Some(Frame::Control(ControlFrame::Hangup)) | None => {
                    bridge_channel.change_state(BridgeChannelState::End);
                    return None;
                }
                Some(other) => trace!("Dropping {} while collecting digits", other.kind()),
            },
        }
    }
}

/// Run every interval hook that is due, earliest first
async fn run_interval_hooks(bridge_channel: &Arc<BridgeChannel>) {
    loop {
        let now = Instant::now();
        let Some(hook) = bridge_channel.with_features(|f| f.pop_due_interval(now)).flatten() else {
            return;
        };
        let outcome = hook.callback().call(bridge_channel).await;
        bridge_channel.with_features(|f| f.reschedule_interval(hook, outcome, now));
        if bridge_channel.state() != BridgeChannelState::Wait {
            return;
        }
    }
}

/// Leave the bridge after the wait loop ended
fn finish(bridge_channel: &Arc<BridgeChannel>, core: &Arc<CoreInner>) -> BridgeChannelState {
    let state = bridge_channel.state();
    let left = bridge_channel.with_bridge(|bridge, guard| {
        if state == BridgeChannelState::End && !bridge_channel.is_departing() {
            bridge.check_dissolve_locked(guard, bridge_channel);
        }
        bridge.pull_locked(guard, bridge_channel);
        bridge.clone()
    });
    if let Some(bridge) = left {
        bridge.reconfigure();
    }
    restore_formats(bridge_channel);
    core.end_bridging(bridge_channel.id());
    bridge_channel.set_activity(ThreadActivity::Idle);
    debug!("Driver for {} finished with {:?}", bridge_channel.name(), state);
    state
}
