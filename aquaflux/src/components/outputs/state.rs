use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Last value written to (or read back from) a channel.
#[derive(Serialize, Clone, Copy, Debug, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ChannelValue {
    Switch(bool),
    /// Duty cycle in percent.
    Duty(f64),
}

impl ChannelValue {
    pub fn is_on(&self) -> bool {
        match self {
            ChannelValue::Switch(on) => *on,
            ChannelValue::Duty(duty) => *duty > 0.0,
        }
    }
}

/// Runtime state of one channel. Never persisted, created when the
/// output is built and dropped with it.
#[derive(Clone, Debug, Default)]
pub struct ChannelState {
    /// `None` until the channel has been resolved by a write or a poll.
    pub value: Option<ChannelValue>,
    pub dispensing: bool,
    /// Bumped by every new instruction, a task only commits its result
    /// while its generation is still current.
    pub generation: u64,
    /// Set while the channel is on without a duration, so the on time can
    /// be recorded when it is switched off.
    pub on_since: Option<DateTime<Utc>>,
    pub last_status_check: Option<DateTime<Utc>>,
}

/// Per channel state, one mutex per channel so that channels never
/// contend with each other.
#[derive(Debug)]
pub struct ChannelStates {
    channels: Vec<Mutex<ChannelState>>,
}

impl ChannelStates {
    pub fn new(count: u8) -> Self {
        Self {
            channels: (0..count).map(|_| Mutex::default()).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    fn lock(&self, channel: u8) -> Option<MutexGuard<'_, ChannelState>> {
        self.channels
            .get(usize::from(channel))
            .map(|state| state.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Run `f` with the channel's state locked.
    pub fn with<R>(&self, channel: u8, f: impl FnOnce(&mut ChannelState) -> R) -> Option<R> {
        self.lock(channel).map(|mut state| f(&mut state))
    }

    pub fn snapshot(&self, channel: u8) -> Option<ChannelState> {
        self.lock(channel).map(|state| state.clone())
    }

    pub fn value(&self, channel: u8) -> Option<ChannelValue> {
        self.lock(channel).and_then(|state| state.value)
    }

    pub fn set_value(&self, channel: u8, value: ChannelValue) {
        self.with(channel, |state| state.value = Some(value));
    }

    /// Start a new instruction on the channel and return its generation.
    pub fn begin(&self, channel: u8) -> u64 {
        self.with(channel, |state| {
            state.generation = state.generation.wrapping_add(1);
            state.dispensing = false;
            state.generation
        })
        .unwrap_or_default()
    }

    pub fn is_current(&self, channel: u8, generation: u64) -> bool {
        self.with(channel, |state| state.generation == generation)
            .unwrap_or(false)
    }

    /// Commit a task's final value, only if no newer instruction has
    /// started since. Returns whether the value was committed.
    pub fn finish(&self, channel: u8, generation: u64, value: ChannelValue) -> bool {
        self.with(channel, |state| {
            if state.generation != generation {
                return false;
            }
            state.value = Some(value);
            state.dispensing = false;
            true
        })
        .unwrap_or(false)
    }

    /// Overwrite the cached values with what the device reports.
    /// Returns the channels whose value changed.
    pub fn apply_reported(&self, reported: &[bool], at: DateTime<Utc>) -> Vec<u8> {
        let mut changed = Vec::new();
        for (index, on) in reported.iter().enumerate() {
            let Ok(channel) = u8::try_from(index) else {
                break;
            };
            self.with(channel, |state| {
                if state.value != Some(ChannelValue::Switch(*on)) {
                    changed.push(channel);
                }
                state.value = Some(ChannelValue::Switch(*on));
                state.last_status_check = Some(at);
            });
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, thread};

    #[test]
    fn test_unresolved_until_written() {
        let states = ChannelStates::new(2);
        assert_eq!(states.value(0), None);
        states.set_value(0, ChannelValue::Switch(true));
        assert_eq!(states.value(0), Some(ChannelValue::Switch(true)));
        assert_eq!(states.value(7), None);
    }

    #[test]
    fn test_stale_generation_does_not_commit() {
        let states = ChannelStates::new(1);
        let old = states.begin(0);
        let new = states.begin(0);
        assert!(!states.finish(0, old, ChannelValue::Switch(true)));
        assert!(states.finish(0, new, ChannelValue::Switch(false)));
        assert_eq!(states.value(0), Some(ChannelValue::Switch(false)));
    }

    #[test]
    fn test_reported_values_overwrite_cache() {
        let states = ChannelStates::new(3);
        states.set_value(1, ChannelValue::Switch(true));
        let changed = states.apply_reported(&[false, true, true], Utc::now());
        assert_eq!(changed, vec![0, 2]);
        assert!(states.snapshot(2).unwrap().last_status_check.is_some());
    }

    #[test]
    fn test_concurrent_writers_never_tear_state() {
        let states = Arc::new(ChannelStates::new(4));
        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let states = states.clone();
                thread::spawn(move || {
                    for i in 0..500u32 {
                        let channel = ((worker + i) % 4) as u8;
                        let generation = states.begin(channel);
                        states.with(channel, |state| state.dispensing = true);
                        states.finish(channel, generation, ChannelValue::Switch(i % 2 == 0));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        for channel in 0..4 {
            let state = states.snapshot(channel).unwrap();
            // 8 workers each touched every channel 125 times.
            assert_eq!(state.generation, 1000);
            assert!(state.value.is_some());
        }
    }
}
