/// Outputs turn switch instructions into actions on relays, PWM
/// drivers, pumps and smart plugs. Every family is driven through the
/// same [`contract::OutputModule`](outputs::contract::OutputModule).
pub mod outputs {
    /// Channel options and the enums of a switch request.
    pub mod channel;
    /// Output config files.
    pub mod config;
    /// Cached runtime state of each channel.
    pub mod state;
    /// Turns a volume into an on/off schedule.
    pub mod dispense;
    /// Switch logic and cancellable dispense tasks.
    pub mod dispatcher;
    /// The output contract and the generic output built on it.
    pub mod contract;
    /// Family ids and construction from config.
    pub mod registry;
    /// PCF8574 / PCF8575 relay boards.
    pub mod expander;
    /// PCA9685 PWM driver.
    pub mod pwm;
    /// Grove I2C motor driver with peristaltic pumps.
    pub mod motor_pump;
    /// Kasa smart plugs and power strips.
    pub mod smart_plug;
    /// Thread and runtime owning a network device.
    pub mod bridge;
    /// Reconnect backoff and state reconciliation for network devices.
    pub mod reconciler;
}

/// Components that expose outputs to other processes.
pub mod control {
    /// The output daemon: loads outputs and serves control messages.
    pub mod output_service;
}

/// Helpful prelude when working with components.
pub mod prelude {
    pub use crate::components::control::output_service::*;
    pub use crate::components::outputs::channel::{ActuationKind, SwitchState};
    pub use crate::components::outputs::config::OutputConfig;
    pub use crate::components::outputs::contract::OutputModule;
    pub use crate::components::outputs::dispense::*;
    pub use crate::components::outputs::registry::{build_output, OutputFamily};
}
