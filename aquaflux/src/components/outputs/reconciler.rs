use crate::{components::outputs::state::ChannelStates, error::OutputError};
use chrono::Utc;
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Consecutive failures after which the medium delay applies.
pub const MEDIUM_BACKOFF_AFTER: u32 = 5;
/// Consecutive failures after which the long delay applies.
pub const LONG_BACKOFF_AFTER: u32 = 20;

/// Delay before the next reconnect attempt, escalating with the number
/// of consecutive connection failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub short: Duration,
    pub medium: Duration,
    pub long: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            short: Duration::from_secs(5),
            medium: Duration::from_secs(60),
            long: Duration::from_secs(300),
        }
    }
}

impl BackoffPolicy {
    pub fn delay(&self, failures: u32) -> Option<Duration> {
        match failures {
            0 => None,
            n if n < MEDIUM_BACKOFF_AFTER => Some(self.short),
            n if n < LONG_BACKOFF_AFTER => Some(self.medium),
            _ => Some(self.long),
        }
    }
}

/// Connection status of a network device, readable from any thread.
#[derive(Debug, Default)]
pub struct LinkStatus {
    connected: AtomicBool,
    ever_connected: AtomicBool,
    failures: AtomicU32,
}

impl LinkStatus {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn ever_connected(&self) -> bool {
        self.ever_connected.load(Ordering::Acquire)
    }

    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::Acquire)
    }
}

/// Keeps the cached channel state in line with the device and decides
/// when a lost device is tried again. Owned by the bridge thread.
pub struct StateReconciler {
    output_id: Uuid,
    policy: BackoffPolicy,
    states: Arc<ChannelStates>,
    status: Arc<LinkStatus>,
    retry_at: Option<Instant>,
}

impl StateReconciler {
    pub fn new(
        output_id: Uuid,
        policy: BackoffPolicy,
        states: Arc<ChannelStates>,
        status: Arc<LinkStatus>,
    ) -> Self {
        Self {
            output_id,
            policy,
            states,
            status,
            retry_at: None,
        }
    }

    pub fn status(&self) -> &Arc<LinkStatus> {
        &self.status
    }

    /// When the next reconnect attempt is due, `None` while connected.
    pub fn retry_at(&self) -> Option<Instant> {
        self.retry_at
    }

    pub fn in_backoff(&self, now: Instant) -> bool {
        self.retry_at.is_some_and(|retry_at| now < retry_at)
    }

    /// Count a connection failure and schedule the next attempt. Cached
    /// channel state is left at its last known value.
    pub fn record_failure(&mut self, err: &OutputError) -> Duration {
        let failures = self.status.failures.fetch_add(1, Ordering::AcqRel) + 1;
        self.status.connected.store(false, Ordering::Release);
        let delay = self.policy.delay(failures).unwrap_or(self.policy.short);
        self.retry_at = Some(Instant::now() + delay);
        if failures == MEDIUM_BACKOFF_AFTER || failures == LONG_BACKOFF_AFTER {
            error!(
                output = %self.output_id,
                failures,
                "{err}, retrying every {delay:?} from now on"
            );
        } else {
            warn!(output = %self.output_id, failures, "{err}, retrying in {delay:?}");
        }
        delay
    }

    pub fn record_success(&mut self) {
        let failures = self.status.failures.swap(0, Ordering::AcqRel);
        if failures > 0 {
            info!(output = %self.output_id, failures, "reconnected");
        }
        self.retry_at = None;
        self.status.connected.store(true, Ordering::Release);
        self.status.ever_connected.store(true, Ordering::Release);
    }

    /// Overwrite the cache with the device's own view of its outlets.
    pub fn apply(&self, reported: &[bool]) {
        let changed = self.states.apply_reported(reported, Utc::now());
        if changed.is_empty() {
            debug!(output = %self.output_id, ?reported, "state confirmed");
        } else {
            debug!(output = %self.output_id, ?changed, "state changed outside the daemon");
        }
    }
}
