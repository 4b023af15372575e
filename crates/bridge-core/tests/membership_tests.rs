//! Join, impart, depart, remove and swap through the public API

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{core, count_voice, voice, wait_until};
use pretty_assertions::assert_eq;
use rvoip_bridge_core::mock::{MockChannel, RecordingMethods, RecordingTechnology, TechCounters};
use rvoip_bridge_core::{
    AfterBridgeGoto, BridgeChannelState, BridgeConfig, BridgeError, BridgeFlags, BridgingCore, Capabilities,
    ChannelHandle,
};

#[tokio::test]
async fn test_join_returns_after_remove() -> anyhow::Result<()> {
    let core = core();
    let bridge = core.new_bridge(Capabilities::MULTI_MIX, BridgeFlags::NONE)?;
    let alice = MockChannel::new("alice");

    let joiner = {
        let bridge = bridge.clone();
        let alice = alice.clone();
        tokio::spawn(async move { bridge.join(alice, None, None, None).await })
    };
    wait_until("alice to join", || bridge.num_channels() == 1).await;
    assert!(core.find_bridge_channel(alice.id()).is_some());

    bridge.remove(alice.id())?;
    // removing again is a no-op
    let _ = bridge.remove(alice.id());

    let state = joiner.await??;
    assert_eq!(state, BridgeChannelState::Hangup);
    assert_eq!(bridge.num_channels(), 0);
    assert_eq!(bridge.num_active(), 0);
    assert!(!alice.is_hung_up(), "join leaves hangup to the caller");
    assert!(core.find_bridge_channel(alice.id()).is_none());
    Ok(())
}

#[tokio::test]
async fn test_media_relayed_between_members() -> anyhow::Result<()> {
    let core = core();
    let bridge = core.new_bridge(Capabilities::MULTI_MIX, BridgeFlags::NONE)?;
    let alice = MockChannel::new("alice");
    let bob = MockChannel::new("bob");
    bridge.impart(alice.clone(), None, None, None, false)?;
    bridge.impart(bob.clone(), None, None, None, false)?;

    assert!(alice.inject(voice(300)));
    assert!(
        bob.wait_for_written_within(Duration::from_secs(2), |frames| count_voice(frames) == 1)
            .await
    );
    assert_eq!(count_voice(&alice.written()), 0, "no echo back to the speaker");

    core.depart(alice.id()).await?;
    core.depart(bob.id()).await?;
    assert!(!alice.is_hung_up());
    assert!(!bob.is_hung_up());
    Ok(())
}

#[tokio::test]
async fn test_depart_hands_channel_back() -> anyhow::Result<()> {
    let core = core();
    let bridge = core.new_bridge(Capabilities::MULTI_MIX, BridgeFlags::DISSOLVE_HANGUP)?;
    let alice = MockChannel::new("alice");
    let bob = MockChannel::new("bob");
    bridge.impart(alice.clone(), None, None, None, false)?;
    bridge.impart(bob.clone(), None, None, None, false)?;
    assert!(core.is_departable(alice.id()));

    let handle = core.depart(alice.id()).await?;
    assert_eq!(handle.id(), alice.id());
    assert!(!alice.is_hung_up());
    assert!(!core.is_departable(alice.id()));

    // departing is not a hangup, so the bridge stays up
    assert!(!bridge.is_dissolved());
    assert_eq!(bridge.channel_ids(), vec![bob.id().clone()]);

    assert!(matches!(
        core.depart(alice.id()).await,
        Err(BridgeError::NotDepartable(_))
    ));
    core.depart(bob.id()).await?;
    Ok(())
}

#[tokio::test]
async fn test_swap_replaces_member_in_one_step() -> anyhow::Result<()> {
    let core = core();
    let bridge = core.new_bridge(Capabilities::ONE_TO_ONE_MIX, BridgeFlags::NONE)?;
    assert_eq!(bridge.technology_name(), "simple_bridge");

    let alice = MockChannel::new("alice");
    let bob = MockChannel::new("bob");
    let carol = MockChannel::new("carol");
    bridge.impart(alice.clone(), None, None, None, false)?;
    bridge.impart(bob.clone(), None, None, None, false)?;

    // the two-party relay is full, but a swap makes room
    bridge.impart(carol.clone(), Some(bob.id()), None, None, false)?;
    assert_eq!(bridge.channel_ids(), vec![alice.id().clone(), carol.id().clone()]);
    assert!(bridge.check_consistency());

    core.depart(bob.id()).await?;
    assert_eq!(bridge.num_channels(), 2);

    carol.inject(voice(100));
    assert!(
        alice
            .wait_for_written_within(Duration::from_secs(2), |frames| count_voice(frames) == 1)
            .await
    );
    assert_eq!(count_voice(&bob.written()), 0);

    core.depart(alice.id()).await?;
    core.depart(carol.id()).await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_swap_is_never_seen_half_done() -> anyhow::Result<()> {
    let core = core();
    let bridge = core.new_bridge(Capabilities::MULTI_MIX, BridgeFlags::NONE)?;
    let bob = MockChannel::new("bob");
    let first = MockChannel::new("seat-0");
    bridge.impart(bob.clone(), None, None, None, false)?;
    bridge.impart(first.clone(), None, None, None, false)?;

    let done = Arc::new(AtomicBool::new(false));
    let looks = Arc::new(AtomicUsize::new(0));
    let torn = Arc::new(AtomicUsize::new(0));
    let watcher = {
        let (bridge, done, looks, torn) = (bridge.clone(), done.clone(), looks.clone(), torn.clone());
        let bob_id = bob.id().clone();
        tokio::spawn(async move {
            while !done.load(Ordering::Acquire) {
                {
                    let state = bridge.lock();
                    // bob plus exactly one occupant of the swapped seat
                    let seats = state.channels().iter().filter(|bc| bc.id() != &bob_id).count();
                    if seats != 1 || state.find_channel(&bob_id).is_none() {
                        torn.fetch_add(1, Ordering::SeqCst);
                    }
                }
                looks.fetch_add(1, Ordering::SeqCst);
                tokio::task::yield_now().await;
            }
        })
    };
    wait_until("the watcher to start", || looks.load(Ordering::SeqCst) > 0).await;

    let mut seated = first;
    let mut replaced = Vec::new();
    for round in 1..=30 {
        let next = MockChannel::new(&format!("seat-{}", round));
        bridge.impart(next.clone(), Some(seated.id()), None, None, false)?;
        replaced.push(std::mem::replace(&mut seated, next));
        tokio::task::yield_now().await;
    }
    done.store(true, Ordering::Release);
    watcher.await?;

    assert_eq!(torn.load(Ordering::SeqCst), 0);
    assert_eq!(bridge.channel_ids(), vec![bob.id().clone(), seated.id().clone()]);
    assert!(bridge.check_consistency());

    for channel in &replaced {
        tokio::time::timeout(Duration::from_secs(5), core.depart(channel.id())).await??;
    }
    core.depart(seated.id()).await?;
    core.depart(bob.id()).await?;
    Ok(())
}

#[tokio::test]
async fn test_push_rejection_unwinds() -> anyhow::Result<()> {
    let core = BridgingCore::new(BridgeConfig::default())?;
    let tiny = Arc::new(RecordingTechnology::new("tiny", Capabilities::MULTI_MIX).with_capacity(1));
    let counters = tiny.counters();
    core.technologies().register(tiny)?;

    let bridge = core.new_bridge(Capabilities::MULTI_MIX, BridgeFlags::NONE)?;
    let alice = MockChannel::new("alice");
    let bob = MockChannel::new("bob");
    bridge.impart(alice.clone(), None, None, None, false)?;

    let rejected = bridge.impart(bob.clone(), None, None, None, false);
    assert!(matches!(rejected, Err(BridgeError::PushRejected { .. })));
    assert_eq!(bridge.num_channels(), 1);
    assert_eq!(TechCounters::get(&counters.joined), 1);
    assert!(!bob.is_hung_up());
    assert!(core.find_bridge_channel(bob.id()).is_none());
    assert!(!core.is_departable(bob.id()));

    core.depart(alice.id()).await?;
    Ok(())
}

#[tokio::test]
async fn test_bridge_class_can_refuse() -> anyhow::Result<()> {
    let core = core();
    let methods = Arc::new(RecordingMethods::default());
    methods.refuse_pushes(true);
    let bridge = core.register(core.base_init(
        core.allocate(methods.clone()),
        Capabilities::MULTI_MIX,
        BridgeFlags::NONE,
    ))?;

    let alice = MockChannel::new("alice");
    let result = bridge.impart(alice.clone(), None, None, None, true);
    assert!(matches!(result, Err(BridgeError::PushRejected { .. })));
    assert_eq!(methods.push_calls(), 0);

    methods.refuse_pushes(false);
    bridge.impart(alice.clone(), None, None, None, false)?;
    assert_eq!(methods.push_calls(), 1);
    core.depart(alice.id()).await?;
    assert_eq!(methods.pull_calls(), 1);
    Ok(())
}

#[tokio::test]
async fn test_hangup_dissolves_bridge() -> anyhow::Result<()> {
    let core = core();
    let methods = Arc::new(RecordingMethods::default());
    let bridge = core.register(core.base_init(
        core.allocate(methods.clone()),
        Capabilities::MULTI_MIX,
        BridgeFlags::DISSOLVE_HANGUP,
    ))?;
    let id = bridge.id().clone();

    let alice = MockChannel::new("alice");
    let bob = MockChannel::new("bob");
    bridge.impart(alice.clone(), None, None, None, true)?;
    bridge.impart(bob.clone(), None, None, None, true)?;

    alice.far_end_hangup();
    wait_until("both legs to be hung up", || alice.is_hung_up() && bob.is_hung_up()).await;
    wait_until("the bridge to empty", || bridge.num_channels() == 0).await;

    assert!(bridge.is_dissolved());
    assert!(core.find_bridge(&id).is_none());
    assert_eq!(methods.dissolving_calls(), 1);

    let carol = MockChannel::new("carol");
    assert!(matches!(
        bridge.impart(carol.clone(), None, None, None, true),
        Err(BridgeError::Dissolved { .. })
    ));
    assert!(!carol.is_hung_up());

    drop(bridge);
    assert_eq!(methods.destroy_calls(), 1);
    Ok(())
}

#[tokio::test]
async fn test_dissolve_on_empty() -> anyhow::Result<()> {
    let core = core();
    let bridge = core.new_bridge(Capabilities::MULTI_MIX, BridgeFlags::DISSOLVE_EMPTY)?;
    let alice = MockChannel::new("alice");
    bridge.impart(alice.clone(), None, None, None, false)?;
    assert!(!bridge.is_dissolved());

    core.depart(alice.id()).await?;
    assert!(bridge.is_dissolved());
    assert!(core.find_bridge(bridge.id()).is_none());
    Ok(())
}

#[tokio::test]
async fn test_join_applies_continuation_on_end() -> anyhow::Result<()> {
    let core = core();
    let bridge = core.new_bridge(Capabilities::MULTI_MIX, BridgeFlags::NONE)?;
    let alice = MockChannel::new("alice");
    core.after_bridge().set_goto(alice.id(), "default", "100", 1);

    let joiner = {
        let bridge = bridge.clone();
        let alice = alice.clone();
        tokio::spawn(async move { bridge.join(alice, None, None, None).await })
    };
    wait_until("alice to join", || bridge.num_channels() == 1).await;
    alice.far_end_hangup();

    assert_eq!(joiner.await??, BridgeChannelState::End);
    assert_eq!(
        alice.gotos(),
        vec![AfterBridgeGoto::Specific {
            context: "default".to_string(),
            exten: "100".to_string(),
            priority: 1,
        }]
    );
    assert!(core.after_bridge().read(alice.id()).is_none());
    Ok(())
}

#[tokio::test]
async fn test_removed_join_discards_continuation() -> anyhow::Result<()> {
    let core = core();
    let bridge = core.new_bridge(Capabilities::MULTI_MIX, BridgeFlags::NONE)?;
    let alice = MockChannel::new("alice");
    core.after_bridge().set_h(alice.id());

    let joiner = {
        let bridge = bridge.clone();
        let alice = alice.clone();
        tokio::spawn(async move { bridge.join(alice, None, None, None).await })
    };
    wait_until("alice to join", || bridge.num_channels() == 1).await;
    bridge.remove(alice.id())?;

    assert_eq!(joiner.await??, BridgeChannelState::Hangup);
    assert!(alice.gotos().is_empty());
    assert!(core.after_bridge().read(alice.id()).is_none());
    Ok(())
}

#[tokio::test]
async fn test_independent_impart_hangs_up_when_continuation_fails() -> anyhow::Result<()> {
    let core = core();
    let bridge = core.new_bridge(Capabilities::MULTI_MIX, BridgeFlags::NONE)?;
    let alice = MockChannel::new("alice");
    alice.fail_after_bridge_goto();
    core.after_bridge().set_h(alice.id());

    bridge.impart(alice.clone(), None, None, None, true)?;
    alice.inject(rvoip_bridge_core::Frame::Control(rvoip_bridge_core::ControlFrame::Hangup));
    wait_until("alice to be hung up", || alice.is_hung_up()).await;
    assert!(alice.gotos().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_departable_impart_discards_continuation() -> anyhow::Result<()> {
    let core = core();
    let bridge = core.new_bridge(Capabilities::MULTI_MIX, BridgeFlags::NONE)?;
    let alice = MockChannel::new("alice");
    core.after_bridge().set_h(alice.id());

    bridge.impart(alice.clone(), None, None, None, false)?;
    assert!(core.after_bridge().read(alice.id()).is_none());
    core.depart(alice.id()).await?;
    assert!(alice.gotos().is_empty());
    Ok(())
}
