//! Turns a switch instruction into either an immediate hardware
//! transaction or a background dispense task.
//!
//! Only the most recent instruction on a channel is authoritative. A new
//! instruction cancels the running task through its token; the task
//! notices within one poll tick and exits without a final write or a
//! measurement record. The cancelled task's last write and the new
//! instruction's first write can still interleave, last instruction wins
//! eventually.

use crate::{
    components::outputs::{
        channel::{ActuationKind, ChannelConfig, Direction, OutputType, SwitchState},
        config::OutputConfig,
        contract::Actuator,
        dispense::{self, DispensePlan},
        registry::OutputFamily,
        state::{ChannelStates, ChannelValue},
    },
    error::{OutputError, Result},
    messages::measurement::{Measurement, MeasurementSink},
};
use chrono::{DateTime, Utc};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How often a running task checks its cancellation token.
pub const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Sleep for `duration` in short ticks. Returns false if cancelled first.
fn wait(token: &CancellationToken, duration: Duration) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if token.is_cancelled() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep(CANCEL_POLL_INTERVAL.min(deadline - now));
    }
}

/// Everything a task needs, shared between the dispatcher and its tasks.
struct Shared<A> {
    output_id: Uuid,
    label: String,
    family: OutputFamily,
    channels: Vec<ChannelConfig>,
    actuator: Arc<A>,
    states: Arc<ChannelStates>,
    sink: Arc<dyn MeasurementSink>,
}

impl<A: Actuator> Shared<A> {
    fn record(&self, channel: u8, measurements: Vec<Measurement>) {
        self.sink.record(self.output_id, channel, measurements);
    }

    /// Write an on/off state and commit it to the cache on success.
    fn write_switch(
        &self,
        channel: u8,
        generation: u64,
        on: bool,
        direction: Direction,
    ) -> Result<()> {
        self.actuator.switch(channel, on, direction)?;
        let now = Utc::now();
        let on_since = self
            .states
            .with(channel, |state| {
                if state.generation != generation {
                    return None;
                }
                state.value = Some(ChannelValue::Switch(on));
                state.dispensing = false;
                if on {
                    state.on_since.get_or_insert(now);
                    None
                } else {
                    state.on_since.take()
                }
            })
            .flatten();
        if let Some(start) = on_since {
            let seconds = (now - start).num_milliseconds() as f64 / 1000.0;
            self.record(channel, vec![Measurement::duration_time(seconds).at(start)]);
        }
        Ok(())
    }

    fn write_duty(&self, channel: u8, generation: u64, percent: f64) -> Result<()> {
        self.actuator.duty(channel, percent)?;
        if self.states.finish(channel, generation, ChannelValue::Duty(percent)) {
            self.record(
                channel,
                vec![Measurement::duty_cycle(percent).at(Utc::now())],
            );
        }
        Ok(())
    }

    /// Body of a volume dispense. The pump is already on when this runs.
    fn run_plan(
        &self,
        channel: u8,
        generation: u64,
        token: &CancellationToken,
        plan: DispensePlan,
        amount: f64,
        start: DateTime<Utc>,
    ) {
        let started = Instant::now();
        let total = plan.total_duration();
        let mut seconds_on = 0.0;

        let result = match plan.cycle {
            None => {
                if !wait(token, total) {
                    return;
                }
                seconds_on = total.as_secs_f64();
                self.actuator.switch(channel, false, plan.direction)
            }
            Some(cycle) => loop {
                let on = Duration::from_secs_f64(cycle.on_seconds)
                    .min(total.saturating_sub(started.elapsed()));
                if !wait(token, on) {
                    return;
                }
                seconds_on += on.as_secs_f64();
                if let Err(err) = self.actuator.switch(channel, false, plan.direction) {
                    break Err(err);
                }
                let remaining = total.saturating_sub(started.elapsed());
                if remaining.is_zero() {
                    break Ok(());
                }
                let off = Duration::from_secs_f64(cycle.off_seconds).min(remaining);
                if !wait(token, off) {
                    return;
                }
                if started.elapsed() >= total {
                    break Ok(());
                }
                if let Err(err) = self.actuator.switch(channel, true, plan.direction) {
                    break Err(err);
                }
            },
        };

        match result {
            Ok(()) => {
                if self
                    .states
                    .finish(channel, generation, ChannelValue::Switch(false))
                {
                    debug!(output = %self.output_id, channel, seconds_on, "dispense complete");
                    self.record(
                        channel,
                        vec![
                            Measurement::duration_time(seconds_on).at(start),
                            Measurement::volume(amount).at(start),
                            Measurement::total_duration(started.elapsed().as_secs_f64()).at(start),
                        ],
                    );
                }
            }
            Err(err) => {
                error!(output = %self.output_id, channel, "dispense aborted: {err}");
                if let Err(err) = self.actuator.switch(channel, false, plan.direction) {
                    error!(output = %self.output_id, channel, "could not stop pump: {err}");
                }
                self.states.with(channel, |state| {
                    if state.generation == generation {
                        state.dispensing = false;
                    }
                });
            }
        }
    }

    /// Body of a timed on. The channel is already on when this runs.
    fn run_timed(
        &self,
        channel: u8,
        generation: u64,
        token: &CancellationToken,
        seconds: f64,
        start: DateTime<Utc>,
    ) {
        if !wait(token, Duration::from_secs_f64(seconds)) {
            return;
        }
        match self.actuator.switch(channel, false, Direction::Forward) {
            Ok(()) => {
                if self
                    .states
                    .finish(channel, generation, ChannelValue::Switch(false))
                {
                    self.record(channel, vec![Measurement::duration_time(seconds).at(start)]);
                }
            }
            Err(err) => error!(output = %self.output_id, channel, "timed on could not switch off: {err}"),
        }
    }
}

/// A switch instruction that passed validation.
enum Instruction {
    Off,
    /// On until switched off.
    On,
    Duty(f64),
    /// On for a number of seconds.
    Timed(f64),
    Dispense { plan: DispensePlan, volume: f64 },
}

struct DispenseTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Per output dispatcher. At most one task runs per channel.
pub struct ActuationDispatcher<A> {
    shared: Arc<Shared<A>>,
    tasks: Mutex<HashMap<u8, DispenseTask>>,
    /// Cancelled tasks that may still be winding down.
    retired: Mutex<Vec<JoinHandle<()>>>,
}

impl<A: Actuator> ActuationDispatcher<A> {
    pub fn new(
        config: &OutputConfig,
        actuator: Arc<A>,
        states: Arc<ChannelStates>,
        sink: Arc<dyn MeasurementSink>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                output_id: config.id,
                label: config.label(),
                family: config.family,
                channels: config.resolved_channels(),
                actuator,
                states,
                sink,
            }),
            tasks: Mutex::new(HashMap::new()),
            retired: Mutex::new(Vec::new()),
        }
    }

    fn channel(&self, channel: u8) -> Result<&ChannelConfig> {
        self.shared
            .channels
            .get(usize::from(channel))
            .ok_or_else(|| {
                OutputError::Config(format!(
                    "channel {channel} out of range, {} has {} channels",
                    self.shared.label,
                    self.shared.channels.len()
                ))
            })
    }

    /// Check an instruction against the channel and build what it needs,
    /// without touching the channel or its running task.
    fn validate(
        &self,
        config: &ChannelConfig,
        state: SwitchState,
        kind: Option<ActuationKind>,
        amount: Option<f64>,
    ) -> Result<Instruction> {
        let family = self.shared.family;
        let kind = kind.unwrap_or_else(|| family.default_kind());
        if !family.declares(kind.required_type()) {
            return Err(OutputError::Unsupported {
                family: family.to_string(),
                output_type: kind.required_type().to_string(),
            });
        }
        if let Some(amount) = amount {
            if !amount.is_finite() {
                return Err(OutputError::Config(format!("amount must be a number, got {amount}")));
            }
        }
        match (state, kind) {
            (SwitchState::Off, _) => Ok(Instruction::Off),
            (SwitchState::On, ActuationKind::Pwm) => {
                let duty = amount.unwrap_or(100.0);
                if !(0.0..=100.0).contains(&duty) {
                    return Err(OutputError::Config(format!(
                        "duty cycle must be within [0, 100], got {duty}"
                    )));
                }
                Ok(Instruction::Duty(duty))
            }
            (SwitchState::On, ActuationKind::Vol) => {
                let volume = amount.ok_or_else(|| {
                    OutputError::Config(String::from("a volume is needed to dispense"))
                })?;
                let plan = dispense::plan(volume, config)?;
                Ok(Instruction::Dispense { plan, volume })
            }
            (SwitchState::On, ActuationKind::Value) => Err(OutputError::Unsupported {
                family: family.to_string(),
                output_type: OutputType::Value.to_string(),
            }),
            (SwitchState::On, ActuationKind::Sec) => match amount {
                Some(seconds) if seconds > 0.0 => Ok(Instruction::Timed(seconds)),
                Some(seconds) => Err(OutputError::Config(format!(
                    "duration must be greater than 0, got {seconds}"
                ))),
                None => Ok(Instruction::On),
            },
        }
    }

    /// Handle one switch instruction. A rejected instruction leaves the
    /// channel and any running task alone.
    ///
    /// * `channel`: channel index, already range checked by the caller.
    /// * `state`: on or off.
    /// * `kind`: what `amount` means, the family default when `None`.
    /// * `amount`: seconds, duty cycle or volume.
    pub fn switch(
        &self,
        channel: u8,
        state: SwitchState,
        kind: Option<ActuationKind>,
        amount: Option<f64>,
    ) -> Result<String> {
        let config = self.channel(channel)?.clone();
        let instruction = self.validate(&config, state, kind, amount)?;

        if self.supersede(channel) {
            info!(
                output = %self.shared.output_id,
                channel,
                "{} is busy, cancelling its previous instruction",
                config.label(channel)
            );
        }
        let generation = self.shared.states.begin(channel);

        match instruction {
            Instruction::Off => self.switch_off(channel, generation, &config),
            Instruction::On => self.switch_on(channel, generation, &config),
            Instruction::Duty(duty) => {
                self.shared.write_duty(channel, generation, duty)?;
                Ok(format!("CH{channel} duty cycle set to {duty:.1} %"))
            }
            Instruction::Timed(seconds) => {
                self.start_timed(channel, generation, seconds)?;
                Ok(format!("CH{channel} on for {seconds:.1} seconds"))
            }
            Instruction::Dispense { plan, volume } => {
                debug!(output = %self.shared.output_id, channel, ?plan, "dispense plan");
                self.start_dispense(channel, generation, plan, volume)?;
                Ok(plan.describe())
            }
        }
    }

    fn switch_on(&self, channel: u8, generation: u64, config: &ChannelConfig) -> Result<String> {
        if self.skip_redundant(channel, config, true) {
            return Ok(format!("CH{channel} already on"));
        }
        self.shared
            .write_switch(channel, generation, true, Direction::Forward)?;
        Ok(format!("CH{channel} on"))
    }

    fn switch_off(&self, channel: u8, generation: u64, config: &ChannelConfig) -> Result<String> {
        if self.shared.family.is_pwm() {
            self.shared.write_duty(channel, generation, 0.0)?;
            return Ok(format!("CH{channel} off"));
        }
        if self.skip_redundant(channel, config, false) {
            return Ok(format!("CH{channel} already off"));
        }
        self.shared
            .write_switch(channel, generation, false, Direction::Forward)?;
        Ok(format!("CH{channel} off"))
    }

    /// Network devices skip a command whose state is already cached,
    /// unless the channel forces commands.
    fn skip_redundant(&self, channel: u8, config: &ChannelConfig, on: bool) -> bool {
        !config.command_force
            && self.shared.actuator.skips_redundant()
            && self.shared.states.value(channel) == Some(ChannelValue::Switch(on))
    }

    fn start_timed(&self, channel: u8, generation: u64, seconds: f64) -> Result<()> {
        let start = Utc::now();
        self.shared
            .actuator
            .switch(channel, true, Direction::Forward)?;
        self.mark_dispensing(channel, generation);
        self.spawn(channel, move |shared, token| {
            shared.run_timed(channel, generation, token, seconds, start)
        })
    }

    fn start_dispense(
        &self,
        channel: u8,
        generation: u64,
        plan: DispensePlan,
        amount: f64,
    ) -> Result<()> {
        let start = Utc::now();
        match plan.cycle {
            None => self
                .shared
                .actuator
                .switch_full_speed(channel, plan.direction)?,
            Some(_) => self.shared.actuator.switch(channel, true, plan.direction)?,
        }
        self.mark_dispensing(channel, generation);
        self.spawn(channel, move |shared, token| {
            shared.run_plan(channel, generation, token, plan, amount, start)
        })
    }

    fn mark_dispensing(&self, channel: u8, generation: u64) {
        self.shared.states.with(channel, |state| {
            if state.generation == generation {
                state.value = Some(ChannelValue::Switch(true));
                state.dispensing = true;
                state.on_since = None;
            }
        });
    }

    fn spawn<F>(&self, channel: u8, body: F) -> Result<()>
    where
        F: FnOnce(&Shared<A>, &CancellationToken) + Send + 'static,
    {
        let token = CancellationToken::new();
        let shared = self.shared.clone();
        let task_token = token.clone();
        let handle = thread::Builder::new()
            .name(format!("dispense-ch{channel}"))
            .spawn(move || body(&shared, &task_token))?;
        let replaced = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(channel, DispenseTask { token, handle });
        // A concurrent instruction on the same channel got here first.
        if let Some(task) = replaced {
            task.token.cancel();
            self.retire(task.handle);
        }
        Ok(())
    }

    fn retire(&self, handle: JoinHandle<()>) {
        let mut retired = self.retired.lock().unwrap_or_else(PoisonError::into_inner);
        retired.retain(|handle| !handle.is_finished());
        retired.push(handle);
    }

    /// Cancel the task on `channel`, if any. Returns whether a task was
    /// still running.
    fn supersede(&self, channel: u8) -> bool {
        let Some(task) = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&channel)
        else {
            return false;
        };
        task.token.cancel();
        let running = !task.handle.is_finished();
        self.retire(task.handle);
        running
    }

    /// Whether a dispense or timed on is running on `channel`.
    pub fn is_dispensing(&self, channel: u8) -> bool {
        self.shared
            .states
            .with(channel, |state| state.dispensing)
            .unwrap_or(false)
    }

    /// Cancel every task, wait for them to exit and switch off the
    /// channels they were driving.
    pub fn stop_all(&self) {
        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        let mut handles = std::mem::take(
            &mut *self.retired.lock().unwrap_or_else(PoisonError::into_inner),
        );
        let mut interrupted = Vec::new();
        for (channel, task) in tasks {
            task.token.cancel();
            if !task.handle.is_finished() {
                interrupted.push(channel);
            }
            handles.push(task.handle);
        }
        for handle in handles {
            if handle.join().is_err() {
                warn!(output = %self.shared.output_id, "a dispense task panicked");
            }
        }
        for channel in interrupted {
            let generation = self.shared.states.begin(channel);
            if let Err(err) = self
                .shared
                .write_switch(channel, generation, false, Direction::Forward)
            {
                error!(output = %self.shared.output_id, channel, "could not stop pump: {err}");
            }
        }
    }

    /// Write an on/off state outside of a switch instruction, used by
    /// the startup and shutdown policies.
    pub fn force_switch(&self, channel: u8, on: bool) -> Result<()> {
        let generation = self.shared.states.begin(channel);
        self.shared
            .write_switch(channel, generation, on, Direction::Forward)
    }

    /// Write a duty cycle outside of a switch instruction.
    pub fn force_duty(&self, channel: u8, percent: f64) -> Result<()> {
        let generation = self.shared.states.begin(channel);
        self.shared.write_duty(channel, generation, percent)
    }

    #[cfg(test)]
    fn take_retired(&self) -> Vec<JoinHandle<()>> {
        std::mem::take(&mut *self.retired.lock().unwrap_or_else(PoisonError::into_inner))
    }
}
