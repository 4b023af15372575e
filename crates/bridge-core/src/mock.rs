//! In-memory doubles for exercising bridges without real devices
//!
//! [`MockChannel`] is a channel handle whose inbound media is injected by
//! the test and whose outbound media is recorded. [`RecordingTechnology`]
//! and [`RecordingMethods`] count the callbacks a bridge makes.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tracing::trace;

use crate::after_bridge::AfterBridgeGoto;
use crate::bridge::{BridgeId, BridgeMethods, BridgeState};
use crate::bridge_channel::BridgeChannel;
use crate::channel::{ChannelHandle, ChannelId};
use crate::error::{BridgeError, Result};
use crate::frame::{Format, FormatSet, Frame};
use crate::technology::{relay_to_peers, BridgeTechnology, Capabilities, TechBridge, TechPreference};

/// Channel handle backed by in-memory queues
pub struct MockChannel {
    id: ChannelId,
    name: String,
    read_format: Mutex<Format>,
    write_format: Mutex<Format>,
    video: bool,
    inbound_tx: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Frame>>,
    written: Mutex<Vec<Frame>>,
    written_notify: Notify,
    hung_up: AtomicBool,
    played: Mutex<Vec<String>>,
    apps: Mutex<Vec<(String, Option<String>)>>,
    gotos: Mutex<Vec<AfterBridgeGoto>>,
    fail_goto: AtomicBool,
}

impl MockChannel {
    pub fn new(name: &str) -> Arc<Self> {
        Self::build(name, Format::slin(), Format::slin(), false)
    }

    pub fn with_formats(name: &str, read: Format, write: Format) -> Arc<Self> {
        Self::build(name, read, write, false)
    }

    /// A channel that reports video support
    pub fn with_video(name: &str) -> Arc<Self> {
        Self::build(name, Format::slin(), Format::slin(), true)
    }

    fn build(name: &str, read: Format, write: Format, video: bool) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            id: ChannelId::from_string(format!("mock-{}-{}", name, uuid::Uuid::new_v4())),
            name: name.to_string(),
            read_format: Mutex::new(read),
            write_format: Mutex::new(write),
            video,
            inbound_tx: Mutex::new(Some(tx)),
            inbound_rx: tokio::sync::Mutex::new(rx),
            written: Mutex::new(Vec::new()),
            written_notify: Notify::new(),
            hung_up: AtomicBool::new(false),
            played: Mutex::new(Vec::new()),
            apps: Mutex::new(Vec::new()),
            gotos: Mutex::new(Vec::new()),
            fail_goto: AtomicBool::new(false),
        })
    }

    /// Deliver `frame` as if it arrived from the far end. Returns false
    /// once the far end is gone.
    pub fn inject(&self, frame: Frame) -> bool {
        self.inbound_tx
            .lock()
            .as_ref()
            .is_some_and(|tx| tx.send(frame).is_ok())
    }

    /// The far end goes away; reads return `None` once drained
    pub fn far_end_hangup(&self) {
        self.inbound_tx.lock().take();
    }

    /// Everything written to this channel so far
    pub fn written(&self) -> Vec<Frame> {
        self.written.lock().clone()
    }

    pub fn clear_written(&self) {
        self.written.lock().clear();
    }

    /// Wait until the written frames satisfy `predicate`
    pub async fn wait_for_written(&self, predicate: impl Fn(&[Frame]) -> bool) {
        loop {
            let notified = self.written_notify.notified();
            if predicate(&self.written.lock()) {
                return;
            }
            notified.await;
        }
    }

    /// Like [`wait_for_written`](Self::wait_for_written), giving up after `limit`
    pub async fn wait_for_written_within(&self, limit: Duration, predicate: impl Fn(&[Frame]) -> bool) -> bool {
        tokio::time::timeout(limit, self.wait_for_written(predicate)).await.is_ok()
    }

    pub fn played(&self) -> Vec<String> {
        self.played.lock().clone()
    }

    pub fn apps(&self) -> Vec<(String, Option<String>)> {
        self.apps.lock().clone()
    }

    /// Continuations applied to this channel
    pub fn gotos(&self) -> Vec<AfterBridgeGoto> {
        self.gotos.lock().clone()
    }

    /// Make applying a continuation fail from now on
    pub fn fail_after_bridge_goto(&self) {
        self.fail_goto.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl ChannelHandle for MockChannel {
    fn id(&self) -> &ChannelId {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn read_format(&self) -> Format {
        self.read_format.lock().clone()
    }

    fn write_format(&self) -> Format {
        self.write_format.lock().clone()
    }

    fn set_read_format(&self, format: &Format) -> Result<()> {
        *self.read_format.lock() = format.clone();
        Ok(())
    }

    fn set_write_format(&self, format: &Format) -> Result<()> {
        *self.write_format.lock() = format.clone();
        Ok(())
    }

    fn supports_video(&self) -> bool {
        self.video
    }

    async fn read_frame(&self) -> Option<Frame> {
        self.inbound_rx.lock().await.recv().await
    }

    async fn write_frame(&self, frame: Frame) -> Result<()> {
        if self.is_hung_up() {
            return Err(BridgeError::Channel(format!("{} is hung up", self.name)));
        }
        trace!("{} <- {}", self.name, frame.kind());
        self.written.lock().push(frame);
        self.written_notify.notify_waiters();
        Ok(())
    }

    async fn hangup(&self) {
        self.hung_up.store(true, Ordering::SeqCst);
        self.far_end_hangup();
    }

    fn is_hung_up(&self) -> bool {
        self.hung_up.load(Ordering::SeqCst)
    }

    async fn play_file(&self, file: &str) -> Result<()> {
        self.played.lock().push(file.to_string());
        Ok(())
    }

    async fn run_app(&self, app: &str, args: Option<&str>) -> Result<()> {
        self.apps.lock().push((app.to_string(), args.map(str::to_string)));
        Ok(())
    }

    async fn apply_after_bridge_goto(&self, goto: &AfterBridgeGoto) -> Result<()> {
        if self.fail_goto.load(Ordering::SeqCst) {
            return Err(BridgeError::Channel(format!("{} cannot continue at {}", self.name, goto)));
        }
        self.gotos.lock().push(goto.clone());
        Ok(())
    }
}

/// Callback counts of a [`RecordingTechnology`]
#[derive(Debug, Default)]
pub struct TechCounters {
    pub created: AtomicUsize,
    pub started: AtomicUsize,
    pub stopped: AtomicUsize,
    pub destroyed: AtomicUsize,
    pub joined: AtomicUsize,
    pub left: AtomicUsize,
    pub suspended: AtomicUsize,
    pub unsuspended: AtomicUsize,
    pub reconfigured: AtomicUsize,
    pub written: AtomicUsize,
}

impl TechCounters {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

/// Relay technology that counts its callbacks
pub struct RecordingTechnology {
    name: String,
    capabilities: Capabilities,
    preference: TechPreference,
    capacity: Option<usize>,
    counters: Arc<TechCounters>,
}

impl RecordingTechnology {
    pub fn new(name: &str, capabilities: Capabilities) -> Self {
        Self {
            name: name.to_string(),
            capabilities,
            preference: TechPreference::Medium,
            capacity: None,
            counters: Arc::new(TechCounters::default()),
        }
    }

    /// Refuse channels beyond `capacity`
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    pub fn with_preference(mut self, preference: TechPreference) -> Self {
        self.preference = preference;
        self
    }

    pub fn counters(&self) -> Arc<TechCounters> {
        self.counters.clone()
    }
}

impl BridgeTechnology for RecordingTechnology {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn preference(&self) -> TechPreference {
        self.preference
    }

    fn formats(&self) -> FormatSet {
        FormatSet::new([Format::slin()])
    }

    fn create(&self, bridge: &mut TechBridge<'_>) -> Result<()> {
        self.counters.created.fetch_add(1, Ordering::SeqCst);
        *bridge.pvt = Some(Box::new(self.name.clone()));
        Ok(())
    }

    fn start(&self, _bridge: &mut TechBridge<'_>) -> Result<()> {
        self.counters.started.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self, _bridge: &mut TechBridge<'_>) {
        self.counters.stopped.fetch_add(1, Ordering::SeqCst);
    }

    fn destroy(&self, _bridge: &BridgeId, pvt: crate::technology::TechPvt) {
        if pvt.is_some() {
            self.counters.destroyed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn join(&self, bridge: &mut TechBridge<'_>, channel: &Arc<BridgeChannel>) -> Result<()> {
        if self.capacity.is_some_and(|cap| bridge.channels.len() >= cap) {
            return Err(BridgeError::PushRejected {
                bridge: bridge.id.clone(),
                channel: channel.id().clone(),
                reason: format!("{} is full", self.name),
            });
        }
        self.counters.joined.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn leave(&self, _bridge: &mut TechBridge<'_>, _channel: &Arc<BridgeChannel>) {
        self.counters.left.fetch_add(1, Ordering::SeqCst);
    }

    fn suspend(&self, _bridge: &mut TechBridge<'_>, _channel: &Arc<BridgeChannel>) {
        self.counters.suspended.fetch_add(1, Ordering::SeqCst);
    }

    fn unsuspend(&self, _bridge: &mut TechBridge<'_>, _channel: &Arc<BridgeChannel>) {
        self.counters.unsuspended.fetch_add(1, Ordering::SeqCst);
    }

    fn reconfigure(&self, _bridge: &mut TechBridge<'_>) {
        self.counters.reconfigured.fetch_add(1, Ordering::SeqCst);
    }

    fn write(&self, bridge: &mut TechBridge<'_>, from: &Arc<BridgeChannel>, frame: &Frame) -> Result<()> {
        self.counters.written.fetch_add(1, Ordering::SeqCst);
        relay_to_peers(bridge, from, frame);
        Ok(())
    }
}

/// Bridge class that counts its callbacks and can refuse newcomers
#[derive(Debug, Default)]
pub struct RecordingMethods {
    dissolving: AtomicUsize,
    destroyed: AtomicUsize,
    pushed: AtomicUsize,
    pulled: AtomicUsize,
    masquerades: AtomicUsize,
    refuse: AtomicBool,
}

impl RecordingMethods {
    pub fn refuse_pushes(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn dissolving_calls(&self) -> usize {
        self.dissolving.load(Ordering::SeqCst)
    }

    pub fn destroy_calls(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn push_calls(&self) -> usize {
        self.pushed.load(Ordering::SeqCst)
    }

    pub fn pull_calls(&self) -> usize {
        self.pulled.load(Ordering::SeqCst)
    }

    pub fn masquerade_calls(&self) -> usize {
        self.masquerades.load(Ordering::SeqCst)
    }
}

impl BridgeMethods for RecordingMethods {
    fn name(&self) -> &str {
        "recording"
    }

    fn destroy(&self, _bridge: &BridgeId) {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
    }

    fn dissolving(&self, _bridge: &BridgeId) {
        self.dissolving.fetch_add(1, Ordering::SeqCst);
    }

    fn can_push(&self, _bridge: &BridgeState, _channel: &Arc<BridgeChannel>, _swap: Option<&Arc<BridgeChannel>>) -> bool {
        !self.refuse.load(Ordering::SeqCst)
    }

    fn push(&self, _bridge: &mut BridgeState, _channel: &Arc<BridgeChannel>, _swap: Option<&Arc<BridgeChannel>>) -> Result<()> {
        self.pushed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn pull(&self, _bridge: &mut BridgeState, _channel: &Arc<BridgeChannel>) {
        self.pulled.fetch_add(1, Ordering::SeqCst);
    }

    fn notify_masquerade(&self, _bridge: &mut BridgeState, _channel: &Arc<BridgeChannel>) {
        self.masquerades.fetch_add(1, Ordering::SeqCst);
    }
}
