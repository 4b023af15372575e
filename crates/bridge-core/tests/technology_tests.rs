//! Technology switching, suspension, video source selection and snapshots

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{core, count_voice, video, voice, wait_until};
use pretty_assertions::assert_eq;
use rvoip_bridge_core::mock::{MockChannel, RecordingTechnology, TechCounters};
use rvoip_bridge_core::{
    BridgeConfig, BridgeError, BridgeFlags, BridgingCore, Capabilities, ChannelHandle, ControlFrame, Frame, VideoModeKind,
};

fn smart_core() -> anyhow::Result<(BridgingCore, Arc<TechCounters>, Arc<TechCounters>)> {
    let core = BridgingCore::new(BridgeConfig::default())?;
    let two = Arc::new(RecordingTechnology::new("two", Capabilities::ONE_TO_ONE_MIX));
    let many = Arc::new(RecordingTechnology::new("many", Capabilities::MULTI_MIX));
    let (two_counters, many_counters) = (two.counters(), many.counters());
    core.technologies().register(two)?;
    core.technologies().register(many)?;
    Ok((core, two_counters, many_counters))
}

#[tokio::test]
async fn test_smart_bridge_follows_member_count() -> anyhow::Result<()> {
    let (core, two, many) = smart_core()?;
    let bridge = core.new_bridge(Capabilities::ONE_TO_ONE_MIX, BridgeFlags::SMART)?;
    assert_eq!(bridge.technology_name(), "two");

    let alice = MockChannel::new("alice");
    let bob = MockChannel::new("bob");
    let carol = MockChannel::new("carol");
    bridge.impart(alice.clone(), None, None, None, false)?;
    bridge.impart(bob.clone(), None, None, None, false)?;
    assert_eq!(bridge.technology_name(), "two");
    assert_eq!(TechCounters::get(&many.created), 0);

    bridge.impart(carol.clone(), None, None, None, false)?;
    assert_eq!(bridge.technology_name(), "many");
    // the old private state is released exactly once, after the switch
    assert_eq!(TechCounters::get(&two.destroyed), 1);
    assert_eq!(TechCounters::get(&two.left), 2);
    assert_eq!(TechCounters::get(&many.joined), 3);

    carol.inject(voice(300));
    assert!(
        alice
            .wait_for_written_within(Duration::from_secs(2), |frames| count_voice(frames) == 1)
            .await
    );

    core.depart(carol.id()).await?;
    assert_eq!(bridge.technology_name(), "two");
    assert_eq!(TechCounters::get(&many.destroyed), 1);
    assert_eq!(TechCounters::get(&two.created), 2);

    core.depart(alice.id()).await?;
    core.depart(bob.id()).await?;
    bridge.clone().destroy();
    drop(bridge);
    assert_eq!(TechCounters::get(&two.destroyed), 2);
    assert_eq!(TechCounters::get(&many.destroyed), 1);
    Ok(())
}

#[tokio::test]
async fn test_rejected_join_keeps_previous_technology() -> anyhow::Result<()> {
    let core = BridgingCore::new(BridgeConfig::default())?;
    let two = Arc::new(RecordingTechnology::new("two", Capabilities::ONE_TO_ONE_MIX));
    let many = Arc::new(RecordingTechnology::new("many", Capabilities::MULTI_MIX).with_capacity(2));
    let (two_counters, many_counters) = (two.counters(), many.counters());
    core.technologies().register(two)?;
    core.technologies().register(many)?;

    let bridge = core.new_bridge(Capabilities::ONE_TO_ONE_MIX, BridgeFlags::SMART)?;
    let alice = MockChannel::new("alice");
    let bob = MockChannel::new("bob");
    bridge.impart(alice.clone(), None, None, None, false)?;
    bridge.impart(bob.clone(), None, None, None, false)?;

    let carol = MockChannel::new("carol");
    let result = bridge.impart(carol.clone(), None, None, None, false);
    assert!(matches!(result, Err(BridgeError::PushRejected { .. })));

    assert_eq!(bridge.technology_name(), "two");
    assert_eq!(bridge.lock().pending_actions(), 0);
    assert_eq!(bridge.channel_ids(), vec![alice.id().clone(), bob.id().clone()]);
    assert!(core.find_bridge_channel(carol.id()).is_none());
    // the attempted technology was set up and torn down again
    assert_eq!(TechCounters::get(&many_counters.created), 1);
    assert_eq!(TechCounters::get(&many_counters.destroyed), 1);
    assert_eq!(TechCounters::get(&two_counters.destroyed), 0);

    alice.inject(voice(300));
    assert!(
        bob.wait_for_written_within(Duration::from_secs(2), |frames| count_voice(frames) == 1)
            .await
    );

    core.depart(alice.id()).await?;
    core.depart(bob.id()).await?;
    Ok(())
}

#[tokio::test]
async fn test_suspended_member_hears_nothing() -> anyhow::Result<()> {
    let core = core();
    let bridge = core.new_bridge(Capabilities::MULTI_MIX, BridgeFlags::NONE)?;
    let alice = MockChannel::new("alice");
    let bob = MockChannel::new("bob");
    bridge.impart(alice.clone(), None, None, None, false)?;
    bridge.impart(bob.clone(), None, None, None, false)?;

    bridge.suspend(bob.id()).await?;
    assert_eq!(bridge.num_active(), 1);
    assert_eq!(bridge.num_channels(), 2);

    alice.inject(voice(300));
    alice.inject(Frame::Text("marker".to_string()));
    // give the relay time to (not) deliver
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(bob.written().is_empty());

    bridge.unsuspend(bob.id())?;
    assert_eq!(bridge.num_active(), 2);
    alice.inject(voice(300));
    assert!(
        bob.wait_for_written_within(Duration::from_secs(2), |frames| count_voice(frames) == 1)
            .await
    );

    core.depart(alice.id()).await?;
    core.depart(bob.id()).await?;
    Ok(())
}

#[tokio::test]
async fn test_video_follows_the_loudest_talker() -> anyhow::Result<()> {
    let core = core();
    let bridge = core.new_bridge(Capabilities::MULTI_MIX, BridgeFlags::NONE)?;
    bridge.set_talker_src_video_mode();

    let alice = MockChannel::with_video("alice");
    let bob = MockChannel::with_video("bob");
    bridge.impart(alice.clone(), None, None, None, false)?;
    bridge.impart(bob.clone(), None, None, None, false)?;

    alice.inject(voice(1000));
    alice.inject(video(true));
    wait_until("alice to become the source", || bridge.is_video_src(alice.id()) == 1).await;

    // not louder by the margin, so bob is only kept as the previous talker
    bob.inject(voice(1100));
    bob.inject(video(true));
    wait_until("bob to be retained", || bridge.is_video_src(bob.id()) == 2).await;
    assert_eq!(bridge.is_video_src(alice.id()), 1);
    assert_eq!(bridge.number_video_src(), 2);

    alice.clear_written();
    bob.inject(voice(5000));
    bob.inject(video(true));
    wait_until("bob to take over", || bridge.is_video_src(bob.id()) == 1).await;
    assert_eq!(bridge.is_video_src(alice.id()), 2);
    assert!(
        alice
            .wait_for_written_within(Duration::from_secs(2), |frames| {
                frames.contains(&Frame::Control(ControlFrame::VideoUpdate))
            })
            .await
    );

    core.depart(bob.id()).await?;
    assert_eq!(bridge.is_video_src(bob.id()), 0);
    core.depart(alice.id()).await?;
    Ok(())
}

#[tokio::test]
async fn test_single_source_video_is_the_only_feed() -> anyhow::Result<()> {
    let core = core();
    let bridge = core.new_bridge(Capabilities::MULTI_MIX, BridgeFlags::NONE)?;
    let alice = MockChannel::with_video("alice");
    let bob = MockChannel::with_video("bob");
    bridge.impart(alice.clone(), None, None, None, false)?;
    bridge.impart(bob.clone(), None, None, None, false)?;

    bridge.set_single_src_video_mode(alice.id());
    assert_eq!(bridge.is_video_src(alice.id()), 1);
    assert_eq!(bridge.is_video_src(bob.id()), 0);

    bob.inject(video(true));
    alice.inject(video(false));
    assert!(
        bob.wait_for_written_within(Duration::from_secs(2), |frames| frames.iter().any(Frame::is_video))
            .await
    );
    assert!(!alice.written().iter().any(Frame::is_video));

    core.depart(alice.id()).await?;
    core.depart(bob.id()).await?;
    Ok(())
}

#[tokio::test]
async fn test_snapshot_describes_bridge() -> anyhow::Result<()> {
    let core = core();
    let bridge = core.new_bridge(Capabilities::MULTI_MIX, BridgeFlags::NONE)?;
    let alice = MockChannel::new("alice");
    bridge.impart(alice.clone(), None, None, None, false)?;
    bridge.merge_inhibit(2);
    bridge.set_talker_src_video_mode();

    let snapshot = bridge.snapshot();
    assert_eq!(&snapshot.id, bridge.id());
    assert_eq!(snapshot.class, "base");
    assert_eq!(snapshot.technology, "multimix_relay");
    assert_eq!(snapshot.num_channels, 1);
    assert_eq!(snapshot.num_active, 1);
    assert_eq!(snapshot.merge_inhibit, 2);
    assert!(!snapshot.dissolved);
    assert_eq!(snapshot.video_mode, VideoModeKind::TalkerSrc);
    assert_eq!(snapshot.channels, vec!["alice".to_string()]);

    let json: serde_json::Value = serde_json::from_str(&snapshot.to_json())?;
    assert_eq!(json["technology"], "multimix_relay");
    assert_eq!(json["num_channels"], 1);

    core.depart(alice.id()).await?;
    Ok(())
}
