//! The lifecycle every device family implements.

use crate::capability::{Capability, ConfigError, ConfigValue, InfoField, InfoValue};
use crate::device::{DeviceIndex, DeviceStatus};
use crate::scheduler::Readiness;
use crate::session::{BusError, Feed};
use crate::transport::TransportError;

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("Invalid argument: {0}")]
    Argument(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Short transfer: {actual} of {expected} bytes")]
    ShortTransfer { expected: usize, actual: usize },

    #[error("Timed out: {0}")]
    ProtocolTimeout(String),

    #[error("Configuration rejected: {0}")]
    ConfigRejected(#[from] ConfigError),

    #[error("Failed to allocate {0} bytes for the sample buffer")]
    Allocation(usize),

    #[error("Device {0} not found")]
    DeviceNotFound(DeviceIndex),

    #[error("Device {index} is {status:?}: {reason}")]
    InvalidState {
        index: DeviceIndex,
        status: DeviceStatus,
        reason: &'static str,
    },

    #[error("Device {0} has no open transport")]
    NotOpen(DeviceIndex),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Session bus error: {0}")]
    Bus(#[from] BusError),
}

impl DriverError {
    /// Check if this error is a trigger/data timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, DriverError::ProtocolTimeout(_))
    }

    /// Check if this error came from moving bytes over the transport
    pub fn is_io_error(&self) -> bool {
        matches!(
            self,
            DriverError::Io(_) | DriverError::ShortTransfer { .. } | DriverError::Transport(_)
        )
    }
}

/// A device family.
///
/// Instances are addressed by [`DeviceIndex`] into the driver's own registry.
/// Acquisition output goes through the [`Feed`] handed to `start_acquisition`,
/// `stop_acquisition` and `receive`; `receive` is invoked by the session's
/// scheduler for every step the driver registered.
pub trait Driver {
    fn name(&self) -> &'static str;

    fn long_name(&self) -> &'static str;

    fn api_version(&self) -> u32 {
        1
    }

    /// Discover devices. `port` pins discovery to one port (or, for virtual
    /// drivers, one source). Returns the number of instances found.
    fn init(&mut self, port: Option<&str>) -> Result<usize, DriverError>;

    fn cleanup(&mut self);

    fn open(&mut self, index: DeviceIndex) -> Result<(), DriverError>;

    fn close(&mut self, index: DeviceIndex) -> Result<(), DriverError>;

    fn get_info(&self, index: DeviceIndex, field: InfoField) -> Option<InfoValue>;

    /// `DeviceStatus::NotFound` for unknown indices.
    fn get_status(&self, index: DeviceIndex) -> DeviceStatus;

    fn get_capabilities(&self) -> &'static [Capability];

    fn set_configuration(
        &mut self,
        index: DeviceIndex,
        value: ConfigValue,
    ) -> Result<(), DriverError>;

    fn start_acquisition(&mut self, index: DeviceIndex, feed: &mut Feed<'_>)
        -> Result<(), DriverError>;

    fn stop_acquisition(&mut self, index: DeviceIndex, feed: &mut Feed<'_>)
        -> Result<(), DriverError>;

    /// Whether a transport-backed step has data waiting.
    fn poll_readable(&mut self, _index: DeviceIndex) -> bool {
        false
    }

    /// One scheduler step.
    fn receive(
        &mut self,
        index: DeviceIndex,
        readiness: Readiness,
        feed: &mut Feed<'_>,
    ) -> Result<(), DriverError>;
}

/// Reject values for capabilities the driver does not advertise.
pub fn check_capability(
    capabilities: &[Capability],
    value: &ConfigValue,
) -> Result<(), DriverError> {
    let capability = value.capability();
    if capabilities.contains(&capability) {
        Ok(())
    } else {
        log::error!("Unknown capability {}", capability);
        Err(ConfigError::Unsupported(capability).into())
    }
}

/// Configuration and acquisition require an open device.
pub fn require_active(
    index: DeviceIndex,
    status: DeviceStatus,
    reason: &'static str,
) -> Result<(), DriverError> {
    match status {
        DeviceStatus::Active => Ok(()),
        DeviceStatus::NotFound => Err(DriverError::DeviceNotFound(index)),
        status => Err(DriverError::InvalidState {
            index,
            status,
            reason,
        }),
    }
}
