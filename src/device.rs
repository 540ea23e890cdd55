use std::fmt;

use crate::transport::Transport;

/// Handle to a device instance within one driver's registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceIndex(pub usize);

impl fmt::Display for DeviceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    Uninitialized,
    Inactive,
    Active,
    /// Sentinel for lookups of an unknown index.
    NotFound,
}

/// One physical or virtual device, with driver-private state `T`.
pub struct DeviceInstance<T> {
    pub index: DeviceIndex,
    pub status: DeviceStatus,
    pub vendor: String,
    pub model: String,
    pub version: String,
    /// Port the transport was (or will be) opened on.
    pub port: Option<String>,
    pub transport: Option<Box<dyn Transport>>,
    pub state: T,
}

impl<T: fmt::Debug> fmt::Debug for DeviceInstance<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceInstance")
            .field("index", &self.index)
            .field("status", &self.status)
            .field("vendor", &self.vendor)
            .field("model", &self.model)
            .field("version", &self.version)
            .field("port", &self.port)
            .field("transport", &self.transport.is_some())
            .field("state", &self.state)
            .finish()
    }
}

impl<T> DeviceInstance<T> {
    pub fn transport_mut(&mut self) -> Option<&mut (dyn Transport + 'static)> {
        self.transport.as_deref_mut()
    }

    /// Close and drop the transport, if any. Errors are logged, not returned.
    pub fn close_transport(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            if let Err(e) = transport.close() {
                log::warn!("Device {}: close failed: {}", self.index, e);
            }
        }
    }
}

/// Device instances owned by one driver, addressed by [`DeviceIndex`].
#[derive(Debug)]
pub struct DeviceRegistry<T> {
    devices: Vec<DeviceInstance<T>>,
}

impl<T> Default for DeviceRegistry<T> {
    fn default() -> Self {
        Self {
            devices: Vec::new(),
        }
    }
}

impl<T> DeviceRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new instance; the index is its position.
    pub fn add(
        &mut self,
        status: DeviceStatus,
        vendor: &str,
        model: &str,
        version: &str,
        state: T,
    ) -> DeviceIndex {
        let index = DeviceIndex(self.devices.len());
        self.devices.push(DeviceInstance {
            index,
            status,
            vendor: vendor.to_string(),
            model: model.to_string(),
            version: version.to_string(),
            port: None,
            transport: None,
            state,
        });
        index
    }

    pub fn get(&self, index: DeviceIndex) -> Option<&DeviceInstance<T>> {
        self.devices.get(index.0)
    }

    pub fn get_mut(&mut self, index: DeviceIndex) -> Option<&mut DeviceInstance<T>> {
        self.devices.get_mut(index.0)
    }

    pub fn status(&self, index: DeviceIndex) -> DeviceStatus {
        self.get(index)
            .map_or(DeviceStatus::NotFound, |device| device.status)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeviceInstance<T>> {
        self.devices.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut DeviceInstance<T>> {
        self.devices.iter_mut()
    }

    /// Close every transport and drop all instances.
    pub fn clear(&mut self) {
        for device in &mut self.devices {
            device.close_transport();
        }
        self.devices.clear();
    }
}
