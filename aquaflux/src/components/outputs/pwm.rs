use crate::{
    components::outputs::{channel::Direction, config::OutputConfig, contract::Actuator},
    devices::hardware::{
        i2c::{bus_error, BusFactory, I2c},
        lock::ResourceLock,
    },
    error::{OutputError, Result},
};
use std::{
    ops::RangeInclusive,
    sync::{Mutex, PoisonError},
    thread,
    time::Duration,
};
use tracing::debug;

const MODE1: u8 = 0x00;
const MODE2: u8 = 0x01;
const LED0_ON_L: u8 = 0x06;
const PRESCALE: u8 = 0xfe;

const MODE1_SLEEP: u8 = 0x10;
const MODE1_AUTO_INCREMENT: u8 = 0x20;
const MODE1_RESTART: u8 = 0x80;
const MODE2_TOTEM_POLE: u8 = 0x04;
/// Bit 4 of the ON_H / OFF_H registers forces the output fully on / off.
const FULL: u8 = 0x10;

const OSCILLATOR_HZ: f64 = 25_000_000.0;
/// Frequencies reachable with prescale values 3 to 255.
pub const PWM_HERTZ_RANGE: RangeInclusive<u16> = 24..=1526;

/// Prescale register value for a PWM frequency.
pub fn prescale(hertz: u16) -> u8 {
    let value = (OSCILLATOR_HZ / (4096.0 * f64::from(hertz))).round() - 1.0;
    value.clamp(3.0, 255.0) as u8
}

/// The four LEDn registers for a duty cycle in percent.
fn led_registers(percent: f64) -> [u8; 4] {
    if percent >= 100.0 {
        [0x00, FULL, 0x00, 0x00]
    } else if percent <= 0.0 {
        [0x00, 0x00, 0x00, FULL]
    } else {
        let off = ((percent / 100.0 * 4096.0).round() as u16).clamp(1, 4095);
        let [low, high] = off.to_le_bytes();
        [0x00, 0x00, low, high]
    }
}

/// PCA9685 16 channel 12 bit PWM driver.
pub struct Pca9685<B> {
    address: u8,
    hertz: u16,
    inverted: Vec<bool>,
    lock: ResourceLock,
    factory: BusFactory<B>,
    bus: Mutex<Option<B>>,
}

impl<B: I2c + Send + 'static> Pca9685<B> {
    pub fn new(config: &OutputConfig, lock: ResourceLock, factory: BusFactory<B>) -> Result<Self> {
        if !PWM_HERTZ_RANGE.contains(&config.pwm_hertz) {
            return Err(OutputError::Config(format!(
                "pwm_hertz must be within {PWM_HERTZ_RANGE:?}, got {}",
                config.pwm_hertz
            )));
        }
        Ok(Self {
            address: config.interface.i2c_address()?,
            hertz: config.pwm_hertz,
            inverted: config
                .resolved_channels()
                .iter()
                .map(|channel| channel.pwm_invert_signal)
                .collect(),
            lock,
            factory,
            bus: Mutex::new(None),
        })
    }
}

impl<B: I2c + Send + 'static> Actuator for Pca9685<B> {
    fn open(&self) -> Result<()> {
        let mut bus = (self.factory)()?;
        let _guard = self.lock.hold()?;
        let setup_error = |err: B::Error| OutputError::Setup(format!("PCA9685: {err:?}"));
        // The prescaler can only be written while the oscillator sleeps.
        bus.write(self.address, &[MODE1, MODE1_SLEEP | MODE1_AUTO_INCREMENT])
            .map_err(setup_error)?;
        bus.write(self.address, &[PRESCALE, prescale(self.hertz)])
            .map_err(setup_error)?;
        bus.write(self.address, &[MODE1, MODE1_AUTO_INCREMENT])
            .map_err(setup_error)?;
        thread::sleep(Duration::from_millis(1));
        bus.write(self.address, &[MODE1, MODE1_AUTO_INCREMENT | MODE1_RESTART])
            .map_err(setup_error)?;
        bus.write(self.address, &[MODE2, MODE2_TOTEM_POLE])
            .map_err(setup_error)?;
        debug!(address = self.address, hertz = self.hertz, "PCA9685 configured");
        *self.bus.lock().unwrap_or_else(PoisonError::into_inner) = Some(bus);
        Ok(())
    }

    fn switch(&self, channel: u8, on: bool, _direction: Direction) -> Result<()> {
        self.duty(channel, if on { 100.0 } else { 0.0 })
    }

    fn duty(&self, channel: u8, percent: f64) -> Result<()> {
        let inverted = self
            .inverted
            .get(usize::from(channel))
            .copied()
            .ok_or_else(|| OutputError::command(channel, "no such channel"))?;
        let percent = if inverted { 100.0 - percent } else { percent };
        let [on_low, on_high, off_low, off_high] = led_registers(percent);
        let _guard = self.lock.hold()?;
        let mut bus = self.bus.lock().unwrap_or_else(PoisonError::into_inner);
        let bus = bus.as_mut().ok_or(OutputError::NotSetup)?;
        bus.write(
            self.address,
            &[LED0_ON_L + 4 * channel, on_low, on_high, off_low, off_high],
        )
        .map_err(|err| bus_error(channel, err))
    }

    fn close(&self) {
        self.bus.lock().unwrap_or_else(PoisonError::into_inner).take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        components::outputs::{
            channel::{ActuationKind, ChannelConfig, SwitchState},
            config::Interface,
            contract::{Output, OutputModule},
            registry::OutputFamily,
            state::{ChannelStates, ChannelValue},
        },
        devices::hardware::{i2c::mock::MockBus, lock::HardwareLock},
        messages::measurement::{MeasurementSink, MemorySink, DUTY_CYCLE},
    };
    use rstest::rstest;
    use std::sync::Arc;

    #[rstest]
    #[case(50, 121)]
    #[case(1000, 5)]
    #[case(24, 253)]
    #[case(1526, 3)]
    fn test_prescale(#[case] hertz: u16, #[case] expected: u8) {
        assert_eq!(prescale(hertz), expected);
    }

    #[rstest]
    #[case(0.0, [0x00, 0x00, 0x00, 0x10])]
    #[case(100.0, [0x00, 0x10, 0x00, 0x00])]
    #[case(50.0, [0x00, 0x00, 0x00, 0x08])]
    #[case(0.001, [0x00, 0x00, 0x01, 0x00])]
    fn test_led_registers(#[case] percent: f64, #[case] expected: [u8; 4]) {
        assert_eq!(led_registers(percent), expected);
    }

    struct Rig {
        output: Output<Pca9685<MockBus>>,
        bus: MockBus,
        sink: Arc<MemorySink>,
        _dir: tempfile::TempDir,
    }

    fn rig() -> Rig {
        let config = OutputConfig::new(
            OutputFamily::Pca9685,
            Interface::I2c {
                bus: 1,
                address: 0x40,
            },
            4,
        )
        .with_channel(
            3,
            ChannelConfig {
                pwm_invert_signal: true,
                ..Default::default()
            },
        );
        let dir = tempfile::tempdir().unwrap();
        let lock = ResourceLock::new(
            &HardwareLock::new(dir.path()),
            &config.interface.resource(),
            Duration::from_secs(1),
        );
        let bus = MockBus::new();
        let driver = Pca9685::new(&config, lock, bus.factory()).unwrap();
        let sink = Arc::new(MemorySink::new());
        let output = Output::new(
            &config,
            driver,
            Arc::new(ChannelStates::new(4)),
            sink.clone(),
        );
        Rig {
            output,
            bus,
            sink,
            _dir: dir,
        }
    }

    #[test]
    fn test_open_sets_frequency() {
        let rig = rig();
        rig.output.initialize().unwrap();
        let writes = rig.bus.writes();
        assert_eq!(writes[1].bytes, vec![PRESCALE, 5]);
        assert_eq!(writes[4].bytes, vec![MODE2, MODE2_TOTEM_POLE]);
        // Then one full off write per channel.
        assert_eq!(writes.len(), 5 + 4);
        assert_eq!(rig.output.channel_value(0), Some(ChannelValue::Duty(0.0)));
    }

    #[test]
    fn test_duty_cycle_write_and_record() {
        let rig = rig();
        rig.output.initialize().unwrap();
        rig.bus.clear();
        let message =
            rig.output
                .output_switch(SwitchState::On, Some(ActuationKind::Pwm), Some(50.0), Some(2));
        assert!(message.contains("50.0 %"), "{message}");
        assert_eq!(
            rig.bus.writes()[0].bytes,
            vec![0x0e, 0x00, 0x00, 0x00, 0x08]
        );
        assert_eq!(rig.output.channel_value(2), Some(ChannelValue::Duty(50.0)));
        assert_eq!(rig.sink.last_value(rig.output.id(), 2, DUTY_CYCLE), Some(50.0));

        rig.output.output_switch(SwitchState::Off, None, None, Some(2));
        assert_eq!(rig.bus.writes()[1].bytes, vec![0x0e, 0x00, 0x00, 0x00, 0x10]);
        assert_eq!(rig.output.is_on(2), Some(false));
    }

    #[test]
    fn test_inverted_channel() {
        let rig = rig();
        rig.output.initialize().unwrap();
        rig.bus.clear();
        rig.output
            .output_switch(SwitchState::On, Some(ActuationKind::Pwm), Some(25.0), Some(3));
        assert_eq!(
            rig.bus.writes()[0].bytes,
            vec![0x12, 0x00, 0x00, 0x00, 0x0c]
        );
        // The cache keeps the requested duty cycle, not the inverted one.
        assert_eq!(rig.output.channel_value(3), Some(ChannelValue::Duty(25.0)));
    }

    #[rstest]
    #[case(Some(ActuationKind::Pwm), Some(120.0))]
    #[case(Some(ActuationKind::Sec), Some(5.0))]
    #[case(Some(ActuationKind::Vol), Some(5.0))]
    fn test_rejected_requests_do_not_write(
        #[case] kind: Option<ActuationKind>,
        #[case] amount: Option<f64>,
    ) {
        let rig = rig();
        rig.output.initialize().unwrap();
        rig.bus.clear();
        assert!(rig.output.switch(SwitchState::On, kind, amount, Some(0)).is_err());
        assert!(rig.bus.writes().is_empty());
    }

    #[test]
    fn test_invalid_frequency_rejected() {
        let mut config = OutputConfig::new(
            OutputFamily::Pca9685,
            Interface::I2c {
                bus: 1,
                address: 0x40,
            },
            1,
        );
        config.pwm_hertz = 5;
        let lock = ResourceLock::new(
            &HardwareLock::default(),
            &config.interface.resource(),
            Duration::from_secs(1),
        );
        assert!(Pca9685::new(&config, lock, MockBus::new().factory()).is_err());
    }
}
