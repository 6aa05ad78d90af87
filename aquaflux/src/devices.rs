/// Devices are the atomic units that can be combined together
/// into outputs. Their core responsibilities do not change
/// based on which output family is driving them.
pub mod hardware {
    /// I2C bus handles and bus error mapping.
    pub mod i2c;
    /// TP-Link Kasa smart home protocol.
    pub mod kasa;
    /// Lock over one physical bus address or network host.
    pub mod lock;
    /// Async interface of network attached actuators.
    pub mod network;
}
