use crate::error::{OutputError, Result};
pub use embedded_hal::i2c::I2c;
use linux_embedded_hal::I2cdev;

/// Opens the bus handle when an output is initialised. Drivers keep the
/// factory rather than the handle so that a failed open leaves them
/// constructed but not set up.
pub type BusFactory<B> = Box<dyn Fn() -> Result<B> + Send + Sync>;

/// Open `/dev/i2c-{bus}` on Linux.
///
/// * `bus`: bus number as listed by `i2cdetect -l`.
pub fn open_linux_bus(bus: u8) -> Result<I2cdev> {
    let path = format!("/dev/i2c-{bus}");
    I2cdev::new(&path).map_err(|err| OutputError::Setup(format!("could not open {path}: {err}")))
}

/// Factory for [`open_linux_bus`].
pub fn linux_bus_factory(bus: u8) -> BusFactory<I2cdev> {
    Box::new(move || open_linux_bus(bus))
}

/// Map a bus error onto the channel whose transaction failed.
pub fn bus_error<E: embedded_hal::i2c::Error>(channel: u8, err: E) -> OutputError {
    OutputError::command(channel, format!("I2C error: {:?}", err.kind()))
}

/// In memory bus used by the driver tests. Every write is recorded so the
/// tests can assert on the exact transactions sent to the device.
#[cfg(test)]
pub(crate) mod mock {
    use embedded_hal::i2c::{ErrorKind, ErrorType, I2c, NoAcknowledgeSource, Operation};
    use std::{
        collections::VecDeque,
        sync::{Arc, Mutex},
    };

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct BusWrite {
        pub address: u8,
        pub bytes: Vec<u8>,
    }

    #[derive(Default)]
    struct MockState {
        writes: Vec<BusWrite>,
        reads: VecDeque<u8>,
        failing: bool,
    }

    #[derive(Clone, Default)]
    pub struct MockBus {
        state: Arc<Mutex<MockState>>,
    }

    impl MockBus {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn writes(&self) -> Vec<BusWrite> {
            self.state.lock().unwrap().writes.clone()
        }

        pub fn clear(&self) {
            self.state.lock().unwrap().writes.clear();
        }

        pub fn queue_read(&self, bytes: &[u8]) {
            self.state.lock().unwrap().reads.extend(bytes.iter().copied());
        }

        pub fn set_failing(&self, failing: bool) {
            self.state.lock().unwrap().failing = failing;
        }

        /// Factory handing out clones of this bus.
        pub fn factory(&self) -> super::BusFactory<MockBus> {
            let bus = self.clone();
            Box::new(move || Ok(bus.clone()))
        }
    }

    impl ErrorType for MockBus {
        type Error = ErrorKind;
    }

    impl I2c for MockBus {
        fn transaction(
            &mut self,
            address: u8,
            operations: &mut [Operation<'_>],
        ) -> Result<(), Self::Error> {
            let mut state = self.state.lock().unwrap();
            if state.failing {
                return Err(ErrorKind::NoAcknowledge(NoAcknowledgeSource::Address));
            }
            for operation in operations {
                match operation {
                    Operation::Write(bytes) => state.writes.push(BusWrite {
                        address,
                        bytes: bytes.to_vec(),
                    }),
                    Operation::Read(buffer) => {
                        for byte in buffer.iter_mut() {
                            *byte = state.reads.pop_front().unwrap_or(0);
                        }
                    }
                }
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bus_error_names_channel() {
        let err = bus_error(
            3,
            embedded_hal::i2c::ErrorKind::NoAcknowledge(
                embedded_hal::i2c::NoAcknowledgeSource::Data,
            ),
        );
        assert!(err.to_string().starts_with("CH3 command failed"));
    }

    #[test]
    fn test_missing_bus_is_setup_error() {
        let result = open_linux_bus(250);
        assert!(matches!(result, Err(OutputError::Setup(_))));
    }

    #[test]
    #[cfg_attr(not(feature = "hardware_test"), ignore)]
    fn test_open_real_bus() {
        open_linux_bus(1).unwrap();
    }
}
