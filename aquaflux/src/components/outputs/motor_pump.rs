use crate::{
    components::outputs::{channel::Direction, config::OutputConfig, contract::Actuator},
    devices::hardware::{
        i2c::{bus_error, BusFactory, I2c},
        lock::ResourceLock,
    },
    error::{OutputError, Result},
};
use std::sync::{Mutex, PoisonError};
use tracing::debug;

const MOTOR_SPEED_SET: u8 = 0x82;
const DIRECTION_SET: u8 = 0xaa;

/// Two direction bits per motor, motor A in bits 0-1.
const FORWARD: u8 = 0b10;
const REVERSE: u8 = 0b01;

/// Map a percentage onto the driver's 0-255 speed range.
pub fn speed_byte(percent: f64) -> u8 {
    (percent.clamp(0.0, 100.0) / 100.0 * 255.0).round() as u8
}

fn direction_bits(direction: Direction) -> u8 {
    match direction {
        Direction::Forward => FORWARD,
        Direction::Reverse => REVERSE,
    }
}

struct Driver<B> {
    bus: B,
    speeds: [u8; 2],
    directions: u8,
}

/// Grove I2C motor driver (v1.3) with a peristaltic pump on each motor
/// output. Both speeds are written together, so the driver mirrors them.
pub struct MotorPump<B> {
    address: u8,
    motor_speeds: Vec<f64>,
    lock: ResourceLock,
    factory: BusFactory<B>,
    driver: Mutex<Option<Driver<B>>>,
}

impl<B: I2c + Send + 'static> MotorPump<B> {
    pub fn new(config: &OutputConfig, lock: ResourceLock, factory: BusFactory<B>) -> Result<Self> {
        Ok(Self {
            address: config.interface.i2c_address()?,
            motor_speeds: config
                .resolved_channels()
                .iter()
                .map(|channel| channel.motor_speed)
                .collect(),
            lock,
            factory,
            driver: Mutex::new(None),
        })
    }

    fn motor_speed(&self, channel: u8) -> Result<f64> {
        self.motor_speeds
            .get(usize::from(channel))
            .copied()
            .ok_or_else(|| OutputError::command(channel, "no such channel"))
    }

    /// Write one motor's speed byte, a zero speed stops it. The direction
    /// is only written when a motor starts.
    fn drive(&self, channel: u8, speed: u8, direction: Direction) -> Result<()> {
        let _guard = self.lock.hold()?;
        let mut driver = self.driver.lock().unwrap_or_else(PoisonError::into_inner);
        let driver = driver.as_mut().ok_or(OutputError::NotSetup)?;
        let shift = 2 * channel;

        if speed > 0 {
            let directions =
                driver.directions & !(0b11 << shift) | direction_bits(direction) << shift;
            if directions != driver.directions {
                driver
                    .bus
                    .write(self.address, &[DIRECTION_SET, directions, 0x00])
                    .map_err(|err| bus_error(channel, err))?;
                driver.directions = directions;
            }
        }

        let mut speeds = driver.speeds;
        speeds[usize::from(channel)] = speed;
        driver
            .bus
            .write(self.address, &[MOTOR_SPEED_SET, speeds[0], speeds[1]])
            .map_err(|err| bus_error(channel, err))?;
        debug!(address = self.address, ?speeds, ?direction, "motor speeds written");
        driver.speeds = speeds;
        Ok(())
    }
}

impl<B: I2c + Send + 'static> Actuator for MotorPump<B> {
    fn open(&self) -> Result<()> {
        let bus = (self.factory)()?;
        *self.driver.lock().unwrap_or_else(PoisonError::into_inner) = Some(Driver {
            bus,
            speeds: [0, 0],
            directions: FORWARD << 2 | FORWARD,
        });
        Ok(())
    }

    fn switch(&self, channel: u8, on: bool, direction: Direction) -> Result<()> {
        let speed = if on {
            speed_byte(self.motor_speed(channel)?)
        } else {
            0
        };
        self.drive(channel, speed, direction)
    }

    fn switch_full_speed(&self, channel: u8, direction: Direction) -> Result<()> {
        self.motor_speed(channel)?;
        self.drive(channel, u8::MAX, direction)
    }

    fn close(&self) {
        self.driver.lock().unwrap_or_else(PoisonError::into_inner).take();
    }
}
