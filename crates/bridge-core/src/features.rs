//! Feature hooks carried by bridges and bridge channels
//!
//! The bridge core does not detect features itself beyond matching DTMF
//! digits against registered sequences; it only stores the hooks and runs
//! them on the channel's driver at the defined trigger points:
//!
//! - DTMF hooks fire when the collected digits equal a registered sequence.
//! - Interval hooks fire on a timer, ordered by trip time then registration.
//! - The talker callback fires on talking start and stop notifications.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::bridge_channel::{BridgeChannel, BridgeChannelState};
use crate::action::ChannelAction;
use crate::error::{BridgeError, Result};

/// What a hook wants after it ran
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookOutcome {
    Keep,
    Remove,
    /// Keep an interval hook but change its period
    Reschedule(Duration),
}

#[async_trait]
pub trait HookCallback: Send + Sync {
    async fn call(&self, channel: &Arc<BridgeChannel>) -> HookOutcome;
}

struct FnHook<F>(F);

#[async_trait]
impl<F> HookCallback for FnHook<F>
where
    F: Fn(&Arc<BridgeChannel>) -> HookOutcome + Send + Sync + 'static,
{
    async fn call(&self, channel: &Arc<BridgeChannel>) -> HookOutcome {
        (self.0)(channel)
    }
}

/// Wrap a synchronous closure as a hook callback
pub fn hook_fn<F>(f: F) -> Arc<dyn HookCallback>
where
    F: Fn(&Arc<BridgeChannel>) -> HookOutcome + Send + Sync + 'static,
{
    Arc::new(FnHook(f))
}

/// Called with `true` when the channel starts talking and `false` when it stops
pub type TalkerCallback = Arc<dyn Fn(&Arc<BridgeChannel>, bool) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HookId(u64);

static NEXT_HOOK_ID: AtomicU64 = AtomicU64::new(1);

impl HookId {
    fn next() -> Self {
        HookId(NEXT_HOOK_ID.fetch_add(1, AtomicOrdering::Relaxed))
    }
}

#[derive(Clone)]
struct DtmfHook {
    id: HookId,
    dtmf: String,
    callback: Arc<dyn HookCallback>,
}

/// Interval hook waiting in the schedule
#[derive(Clone)]
pub(crate) struct ScheduledHook {
    id: HookId,
    interval: Duration,
    trip: Instant,
    seqno: u64,
    callback: Arc<dyn HookCallback>,
}

impl ScheduledHook {
    pub(crate) fn callback(&self) -> Arc<dyn HookCallback> {
        self.callback.clone()
    }
}

impl PartialEq for ScheduledHook {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ScheduledHook {}

impl PartialOrd for ScheduledHook {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledHook {
    fn cmp(&self, other: &Self) -> Ordering {
        self.trip
            .cmp(&other.trip)
            .then_with(|| self.seqno.cmp(&other.seqno))
    }
}

/// Result of matching collected digits against the DTMF hooks
pub enum DtmfMatch {
    Exact {
        id: HookId,
        callback: Arc<dyn HookCallback>,
    },
    /// Some hook starts with the digits; keep collecting
    Prefix,
    NoMatch,
}

/// Hooks and flags for a bridge or a single bridge channel
#[derive(Clone)]
pub struct BridgeFeatures {
    dtmf_hooks: Vec<DtmfHook>,
    interval_hooks: BinaryHeap<Reverse<ScheduledHook>>,
    interval_seqno: u64,
    talker_cb: Option<TalkerCallback>,
    /// Dissolve the bridge when this channel hangs up
    pub dissolve_hangup: bool,
    /// Relay DTMF that did not trigger a hook
    pub dtmf_passthrough: bool,
    /// Drop inbound voice instead of relaying it
    pub mute: bool,
    usable: bool,
}

impl Default for BridgeFeatures {
    fn default() -> Self {
        Self {
            dtmf_hooks: Vec::new(),
            interval_hooks: BinaryHeap::new(),
            interval_seqno: 0,
            talker_cb: None,
            dissolve_hangup: false,
            dtmf_passthrough: true,
            mute: false,
            usable: false,
        }
    }
}

impl fmt::Debug for BridgeFeatures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeFeatures")
            .field("dtmf_hooks", &self.dtmf_hooks.iter().map(|h| h.dtmf.as_str()).collect::<Vec<_>>())
            .field("interval_hooks", &self.interval_hooks.len())
            .field("talker_cb", &self.talker_cb.is_some())
            .field("dissolve_hangup", &self.dissolve_hangup)
            .field("dtmf_passthrough", &self.dtmf_passthrough)
            .field("mute", &self.mute)
            .finish()
    }
}

fn valid_dtmf(dtmf: &str) -> bool {
    !dtmf.is_empty()
        && dtmf
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '*' | '#' | 'A'..='D'))
}

impl BridgeFeatures {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once any hook or flag has been set
    pub fn is_usable(&self) -> bool {
        self.usable
    }

    pub fn set_dissolve_hangup(&mut self, enabled: bool) {
        self.dissolve_hangup = enabled;
        self.usable = true;
    }

    pub fn set_mute(&mut self, mute: bool) {
        self.mute = mute;
        self.usable = true;
    }

    pub fn set_dtmf_passthrough(&mut self, passthrough: bool) {
        self.dtmf_passthrough = passthrough;
        self.usable = true;
    }

    /// Fire `callback` when `dtmf` is entered
    pub fn dtmf_hook(&mut self, dtmf: &str, callback: Arc<dyn HookCallback>) -> Result<HookId> {
        if !valid_dtmf(dtmf) {
            return Err(BridgeError::InvalidHook(format!("invalid DTMF sequence '{}'", dtmf)));
        }
        let id = HookId::next();
        self.dtmf_hooks.push(DtmfHook {
            id,
            dtmf: dtmf.to_string(),
            callback,
        });
        self.usable = true;
        Ok(id)
    }

    /// Fire `callback` every `interval`, first after one full interval
    pub fn interval_hook(&mut self, interval: Duration, callback: Arc<dyn HookCallback>) -> Result<HookId> {
        self.interval_hook_after(interval, interval, callback)
    }

    /// Fire `callback` after `first`, then every `interval`
    pub fn interval_hook_after(
        &mut self,
        first: Duration,
        interval: Duration,
        callback: Arc<dyn HookCallback>,
    ) -> Result<HookId> {
        if interval.is_zero() && first.is_zero() {
            return Err(BridgeError::InvalidHook("interval must be non-zero".to_string()));
        }
        let id = HookId::next();
        self.schedule(ScheduledHook {
            id,
            interval,
            trip: Instant::now() + first,
            seqno: 0,
            callback,
        });
        self.usable = true;
        Ok(id)
    }

    pub fn talk_detector(&mut self, callback: TalkerCallback) {
        self.talker_cb = Some(callback);
        self.usable = true;
    }

    pub(crate) fn talker_callback(&self) -> Option<TalkerCallback> {
        self.talker_cb.clone()
    }

    /// Remove a DTMF or interval hook
    pub fn remove_hook(&mut self, id: HookId) -> bool {
        let before = self.dtmf_hooks.len() + self.interval_hooks.len();
        self.dtmf_hooks.retain(|h| h.id != id);
        self.interval_hooks.retain(|Reverse(h)| h.id != id);
        before != self.dtmf_hooks.len() + self.interval_hooks.len()
    }

    /// Change the period of an interval hook. The hook keeps its next trip;
    /// the new period applies from the run after it. Zero drops the hook
    /// once it has run.
    pub fn update_interval(&mut self, id: HookId, interval: Duration) -> bool {
        let mut hooks = std::mem::take(&mut self.interval_hooks).into_vec();
        let found = match hooks.iter_mut().find(|hook| hook.0.id == id) {
            Some(hook) => {
                hook.0.interval = interval;
                true
            }
            None => false,
        };
        self.interval_hooks = hooks.into();
        found
    }

    pub fn has_dtmf_hooks(&self) -> bool {
        !self.dtmf_hooks.is_empty()
    }

    pub fn interval_hook_count(&self) -> usize {
        self.interval_hooks.len()
    }

    /// True when some DTMF hook begins with `digit`
    pub fn starts_hook(&self, digit: char) -> bool {
        self.dtmf_hooks.iter().any(|h| h.dtmf.starts_with(digit))
    }

    pub fn match_dtmf(&self, digits: &str) -> DtmfMatch {
        if let Some(hook) = self.dtmf_hooks.iter().find(|h| h.dtmf == digits) {
            return DtmfMatch::Exact {
                id: hook.id,
                callback: hook.callback.clone(),
            };
        }
        if self.dtmf_hooks.iter().any(|h| h.dtmf.starts_with(digits)) {
            DtmfMatch::Prefix
        } else {
            DtmfMatch::NoMatch
        }
    }

    fn schedule(&mut self, mut hook: ScheduledHook) {
        self.interval_seqno += 1;
        hook.seqno = self.interval_seqno;
        self.interval_hooks.push(Reverse(hook));
    }

    pub(crate) fn next_interval_trip(&self) -> Option<Instant> {
        self.interval_hooks.peek().map(|Reverse(h)| h.trip)
    }

    /// Take the earliest hook if it is due at `now`
    pub(crate) fn pop_due_interval(&mut self, now: Instant) -> Option<ScheduledHook> {
        match self.interval_hooks.peek() {
            Some(Reverse(hook)) if hook.trip <= now => self.interval_hooks.pop().map(|Reverse(h)| h),
            _ => None,
        }
    }

    /// Put a hook back after it ran at `ran_at`, unless it asked to go away
    pub(crate) fn reschedule_interval(&mut self, mut hook: ScheduledHook, outcome: HookOutcome, ran_at: Instant) {
        match outcome {
            HookOutcome::Remove => {
                debug!("Interval hook {:?} removed itself", hook.id);
                return;
            }
            HookOutcome::Reschedule(interval) => hook.interval = interval,
            HookOutcome::Keep => {}
        }
        if hook.interval.is_zero() {
            return;
        }
        hook.trip = ran_at + hook.interval;
        self.schedule(hook);
    }

    /// Install call duration limits as interval hooks
    pub fn set_limits(&mut self, limits: &BridgeLimits) -> Result<()> {
        if limits.duration.is_zero() {
            return Err(BridgeError::InvalidHook("limit duration must be non-zero".to_string()));
        }

        let timeout_sound = limits.timeout_sound.clone();
        self.interval_hook_after(
            limits.duration,
            Duration::ZERO,
            Arc::new(LimitExpired { timeout_sound }),
        )?;

        if let Some(warning) = limits.warning.filter(|w| !w.is_zero() && *w < limits.duration) {
            self.interval_hook_after(
                limits.duration - warning,
                limits.frequency.unwrap_or(Duration::ZERO),
                Arc::new(LimitWarning {
                    sound: limits.warning_sound.clone(),
                }),
            )?;
        }
        Ok(())
    }
}

/// Call duration limits
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeLimits {
    /// Total time the channel may stay bridged
    pub duration: Duration,
    /// How long before the end to start warning
    pub warning: Option<Duration>,
    /// Repeat the warning this often
    pub frequency: Option<Duration>,
    pub warning_sound: Option<String>,
    pub timeout_sound: Option<String>,
}

struct LimitExpired {
    timeout_sound: Option<String>,
}

#[async_trait]
impl HookCallback for LimitExpired {
    async fn call(&self, channel: &Arc<BridgeChannel>) -> HookOutcome {
        info!("Call limit reached for {}", channel.name());
        if let Some(sound) = &self.timeout_sound {
            if let Err(e) = channel.channel().play_file(sound).await {
                debug!("Timeout sound failed on {}: {}", channel.name(), e);
            }
        }
        channel.change_state(BridgeChannelState::End);
        HookOutcome::Remove
    }
}

struct LimitWarning {
    sound: Option<String>,
}

#[async_trait]
impl HookCallback for LimitWarning {
    async fn call(&self, channel: &Arc<BridgeChannel>) -> HookOutcome {
        match &self.sound {
            Some(sound) => {
                if let Err(e) = channel.channel().play_file(sound).await {
                    debug!("Limit warning failed on {}: {}", channel.name(), e);
                }
            }
            None => debug!("Call limit warning for {}", channel.name()),
        }
        HookOutcome::Keep
    }
}

/// Features the core knows how to enable by name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BuiltinFeature {
    BlindTransfer,
    AttendedTransfer,
    Hangup,
    ParkCall,
    Automon,
}

struct BuiltinEntry {
    callback: Arc<dyn HookCallback>,
    dtmf: String,
}

/// Registry of builtin feature implementations
#[derive(Default)]
pub struct FeatureRegistry {
    builtins: DashMap<BuiltinFeature, BuiltinEntry>,
}

impl FeatureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the `Hangup` feature bound to `*0`
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry.builtins.insert(
            BuiltinFeature::Hangup,
            BuiltinEntry {
                callback: hook_fn(|channel| {
                    channel.change_state(BridgeChannelState::End);
                    HookOutcome::Keep
                }),
                dtmf: "*0".to_string(),
            },
        );
        registry
    }

    /// Provide the implementation of a builtin, replacing any previous one
    pub fn register_builtin(
        &self,
        feature: BuiltinFeature,
        callback: Arc<dyn HookCallback>,
        default_dtmf: &str,
    ) -> Result<()> {
        if !default_dtmf.is_empty() && !valid_dtmf(default_dtmf) {
            return Err(BridgeError::InvalidHook(format!(
                "invalid DTMF sequence '{}' for {:?}",
                default_dtmf, feature
            )));
        }
        self.builtins.insert(
            feature,
            BuiltinEntry {
                callback,
                dtmf: default_dtmf.to_string(),
            },
        );
        debug!("Registered builtin feature {:?}", feature);
        Ok(())
    }

    pub fn unregister_builtin(&self, feature: BuiltinFeature) -> Result<()> {
        self.builtins
            .remove(&feature)
            .map(|_| ())
            .ok_or_else(|| BridgeError::FeatureNotFound(format!("{:?}", feature)))
    }

    /// Attach a builtin to `features`, using `dtmf` or the registered default
    pub fn enable(
        &self,
        features: &mut BridgeFeatures,
        feature: BuiltinFeature,
        dtmf: Option<&str>,
    ) -> Result<HookId> {
        let entry = self
            .builtins
            .get(&feature)
            .ok_or_else(|| BridgeError::FeatureNotFound(format!("{:?}", feature)))?;
        let dtmf = dtmf.unwrap_or(entry.dtmf.as_str());
        if dtmf.is_empty() {
            return Err(BridgeError::InvalidHook(format!("no DTMF sequence for {:?}", feature)));
        }
        features.dtmf_hook(dtmf, entry.callback.clone())
    }
}

/// Payload a talker notification turns into
pub(crate) fn talking_action(started: bool) -> ChannelAction {
    if started {
        ChannelAction::TalkingStart
    } else {
        ChannelAction::TalkingStop
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Arc<dyn HookCallback> {
        hook_fn(|_| HookOutcome::Keep)
    }

    #[test]
    fn test_dtmf_matching() {
        let mut features = BridgeFeatures::new();
        assert!(!features.is_usable());
        features.dtmf_hook("*2", noop()).unwrap();
        features.dtmf_hook("#", noop()).unwrap();
        assert!(features.is_usable());

        assert!(features.starts_hook('*'));
        assert!(!features.starts_hook('1'));
        assert!(matches!(features.match_dtmf("*"), DtmfMatch::Prefix));
        assert!(matches!(features.match_dtmf("*2"), DtmfMatch::Exact { .. }));
        assert!(matches!(features.match_dtmf("*3"), DtmfMatch::NoMatch));
        assert!(matches!(features.match_dtmf("#"), DtmfMatch::Exact { .. }));
    }

    #[test]
    fn test_invalid_hooks_rejected() {
        let mut features = BridgeFeatures::new();
        assert!(features.dtmf_hook("", noop()).is_err());
        assert!(features.dtmf_hook("12x", noop()).is_err());
        assert!(features.interval_hook(Duration::ZERO, noop()).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_order_and_reschedule() {
        let mut features = BridgeFeatures::new();
        let slow = features.interval_hook(Duration::from_secs(2), noop()).unwrap();
        let fast = features.interval_hook(Duration::from_secs(1), noop()).unwrap();
        let tie = features.interval_hook(Duration::from_secs(1), noop()).unwrap();

        let start = Instant::now();
        assert_eq!(features.next_interval_trip(), Some(start + Duration::from_secs(1)));
        assert!(features.pop_due_interval(start).is_none());

        tokio::time::advance(Duration::from_secs(1)).await;
        let now = Instant::now();
        let first = features.pop_due_interval(now).unwrap();
        let second = features.pop_due_interval(now).unwrap();
        assert_eq!(first.id, fast);
        assert_eq!(second.id, tie);
        assert!(features.pop_due_interval(now).is_none());

        features.reschedule_interval(first, HookOutcome::Keep, now);
        features.reschedule_interval(second, HookOutcome::Remove, now);
        assert_eq!(features.interval_hook_count(), 2);

        tokio::time::advance(Duration::from_secs(1)).await;
        let now = Instant::now();
        // Both trip at t=2; the slow hook was scheduled first
        assert_eq!(features.pop_due_interval(now).unwrap().id, slow);
        assert_eq!(features.pop_due_interval(now).unwrap().id, fast);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_interval_applies_after_next_run() {
        let mut features = BridgeFeatures::new();
        let hook = features.interval_hook(Duration::from_secs(1), noop()).unwrap();
        assert!(features.update_interval(hook, Duration::from_secs(5)));
        assert!(!features.update_interval(HookId::next(), Duration::from_secs(5)));

        let start = Instant::now();
        // the pending trip is unchanged
        assert_eq!(features.next_interval_trip(), Some(start + Duration::from_secs(1)));

        tokio::time::advance(Duration::from_secs(1)).await;
        let now = Instant::now();
        let due = features.pop_due_interval(now).unwrap();
        features.reschedule_interval(due, HookOutcome::Keep, now);
        assert_eq!(features.next_interval_trip(), Some(now + Duration::from_secs(5)));

        let due = features.pop_due_interval(now + Duration::from_secs(5)).unwrap();
        features.reschedule_interval(due, HookOutcome::Reschedule(Duration::from_secs(2)), now);
        assert_eq!(features.next_interval_trip(), Some(now + Duration::from_secs(2)));
    }

    #[test]
    fn test_remove_hook() {
        let mut features = BridgeFeatures::new();
        let dtmf = features.dtmf_hook("1", noop()).unwrap();
        let interval = features.interval_hook(Duration::from_secs(5), noop()).unwrap();
        assert!(features.remove_hook(dtmf));
        assert!(features.remove_hook(interval));
        assert!(!features.remove_hook(interval));
        assert!(!features.has_dtmf_hooks());
    }

    #[test]
    fn test_builtin_registry() {
        let registry = FeatureRegistry::with_defaults();
        let mut features = BridgeFeatures::new();

        registry.enable(&mut features, BuiltinFeature::Hangup, None).unwrap();
        assert!(matches!(features.match_dtmf("*0"), DtmfMatch::Exact { .. }));

        assert!(matches!(
            registry.enable(&mut features, BuiltinFeature::ParkCall, None),
            Err(BridgeError::FeatureNotFound(_))
        ));

        registry.register_builtin(BuiltinFeature::ParkCall, noop(), "").unwrap();
        assert!(matches!(
            registry.enable(&mut features, BuiltinFeature::ParkCall, None),
            Err(BridgeError::InvalidHook(_))
        ));
        registry.enable(&mut features, BuiltinFeature::ParkCall, Some("#72")).unwrap();
        assert!(matches!(features.match_dtmf("#72"), DtmfMatch::Exact { .. }));

        registry.unregister_builtin(BuiltinFeature::ParkCall).unwrap();
        assert!(registry.unregister_builtin(BuiltinFeature::ParkCall).is_err());
    }

    #[test]
    fn test_limits_install_hooks() {
        let mut features = BridgeFeatures::new();
        let limits = BridgeLimits {
            duration: Duration::from_secs(60),
            warning: Some(Duration::from_secs(10)),
            frequency: Some(Duration::from_secs(5)),
            ..Default::default()
        };
        features.set_limits(&limits).unwrap();
        assert_eq!(features.interval_hook_count(), 2);

        assert!(features.set_limits(&BridgeLimits::default()).is_err());
    }
}
