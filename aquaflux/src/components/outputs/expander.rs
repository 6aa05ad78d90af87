use crate::{
    components::outputs::{channel::Direction, config::OutputConfig, contract::Actuator, registry::OutputFamily},
    devices::hardware::{
        i2c::{bus_error, BusFactory, I2c},
        lock::ResourceLock,
    },
    error::{OutputError, Result},
};
use std::sync::{Mutex, PoisonError};
use tracing::debug;

struct Port<B> {
    bus: B,
    /// Last value written to the port. Another process writing the same
    /// device makes this stale until the next [`Actuator::resync`].
    mirror: u16,
}

/// PCF8574 (8 bit) or PCF8575 (16 bit) quasi bidirectional port expander.
/// The chip has no registers: every write sets the whole port, so each
/// channel change is a read-modify-write of the in-memory mirror.
pub struct PortExpander<B> {
    address: u8,
    width: u8,
    /// Logic level that means "on", per channel.
    on_levels: Vec<bool>,
    lock: ResourceLock,
    factory: BusFactory<B>,
    port: Mutex<Option<Port<B>>>,
}

impl<B: I2c + Send + 'static> PortExpander<B> {
    pub fn new(config: &OutputConfig, lock: ResourceLock, factory: BusFactory<B>) -> Result<Self> {
        let width = match config.family {
            OutputFamily::Pcf8574 => 8,
            OutputFamily::Pcf8575 => 16,
            family => {
                return Err(OutputError::Config(format!(
                    "{family} is not a port expander"
                )))
            }
        };
        Ok(Self {
            address: config.interface.i2c_address()?,
            width,
            on_levels: config
                .resolved_channels()
                .iter()
                .map(|channel| channel.on_state)
                .collect(),
            lock,
            factory,
            port: Mutex::new(None),
        })
    }

    /// Current mirror of the port, `None` before `open`.
    pub fn mirror(&self) -> Option<u16> {
        self.port
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|port| port.mirror)
    }

    fn encode(&self, value: u16) -> Vec<u8> {
        let [low, high] = value.to_le_bytes();
        if self.width == 8 {
            vec![low]
        } else {
            vec![low, high]
        }
    }

    fn level(&self, channel: u8, on: bool) -> Result<bool> {
        self.on_levels
            .get(usize::from(channel))
            .map(|on_level| on == *on_level)
            .ok_or_else(|| OutputError::command(channel, "no such channel"))
    }
}

impl<B: I2c + Send + 'static> Actuator for PortExpander<B> {
    fn open(&self) -> Result<()> {
        let bus = (self.factory)()?;
        // Power on state of the chip is every pin high.
        let mirror = if self.width == 8 { 0x00ff } else { 0xffff };
        *self.port.lock().unwrap_or_else(PoisonError::into_inner) = Some(Port { bus, mirror });
        Ok(())
    }

    fn switch(&self, channel: u8, on: bool, _direction: Direction) -> Result<()> {
        let high = self.level(channel, on)?;
        let _guard = self.lock.hold()?;
        let mut port = self.port.lock().unwrap_or_else(PoisonError::into_inner);
        let port = port.as_mut().ok_or(OutputError::NotSetup)?;
        let bit = 1u16 << channel;
        let next = if high {
            port.mirror | bit
        } else {
            port.mirror & !bit
        };
        port.bus
            .write(self.address, &self.encode(next))
            .map_err(|err| bus_error(channel, err))?;
        debug!(address = self.address, port = next, "port written");
        port.mirror = next;
        Ok(())
    }

    fn resync(&self) -> Result<Option<Vec<bool>>> {
        let _guard = self.lock.hold()?;
        let mut port = self.port.lock().unwrap_or_else(PoisonError::into_inner);
        let port = port.as_mut().ok_or(OutputError::NotSetup)?;
        let mut buffer = vec![0u8; usize::from(self.width / 8)];
        port.bus
            .read(self.address, &mut buffer)
            .map_err(|err| bus_error(0, err))?;
        let low = buffer.first().copied().unwrap_or_default();
        let high = buffer.get(1).copied().unwrap_or_default();
        port.mirror = u16::from_le_bytes([low, high]);
        Ok(Some(
            self.on_levels
                .iter()
                .enumerate()
                .map(|(channel, on_level)| ((port.mirror >> channel) & 1 == 1) == *on_level)
                .collect(),
        ))
    }

    fn close(&self) {
        self.port.lock().unwrap_or_else(PoisonError::into_inner).take();
    }
}
