use crate::error::Result;
use std::future::Future;

/// Async only interface of a network attached actuator. Implementations
/// are owned by exactly one bridge thread and never leave it, the rest of
/// the daemon talks to them through the synchronous bridge facade.
pub trait NetworkActuator: Send + 'static {
    /// Open the connection and return a short description of the device.
    fn connect(&mut self) -> impl Future<Output = Result<String>> + Send;

    /// Switch one outlet.
    fn set_state(&mut self, channel: u8, on: bool) -> impl Future<Output = Result<()>> + Send;

    /// Read the true state of every outlet, in channel order.
    fn query_states(&mut self) -> impl Future<Output = Result<Vec<bool>>> + Send;
}
