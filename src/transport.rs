//! Byte-oriented device transport.
//!
//! Drivers only ever talk to a [`Transport`]: write a command, read whatever
//! has arrived, purge, reset, close. [`SerialTransport`] backs it with a
//! `serialport` handle (FTDI virtual COM ports included); tests use
//! [`crate::mock_transport`].

use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

use serialport::{ClearBuffer, FlowControl, SerialPort, SerialPortType};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Serial port error: {0}")]
    SerialPort(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Port {0} not found")]
    PortNotFound(String),

    #[error("Transport is closed")]
    Closed,
}

pub trait Transport {
    /// Write as much of `data` as the device accepts; returns the count.
    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError>;

    /// Read what is available into `buf`. `Ok(0)` means nothing arrived
    /// within the port timeout.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;

    fn bytes_available(&mut self) -> Result<usize, TransportError>;

    /// Drop pending data in both directions.
    fn purge(&mut self) -> Result<(), TransportError>;

    /// Reset the USB side of the link.
    fn reset(&mut self) -> Result<(), TransportError>;

    fn close(&mut self) -> Result<(), TransportError>;

    /// Put the port back the way it was found. Only meaningful for ports
    /// that were probed and rejected.
    fn restore_settings(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// What is known about a port before it is opened.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortDescriptor {
    pub port: String,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
}

impl PortDescriptor {
    pub fn new(port: &str) -> Self {
        Self {
            port: port.to_string(),
            ..Self::default()
        }
    }

    pub fn usb(port: &str, vid: u16, pid: u16, product: &str) -> Self {
        Self {
            port: port.to_string(),
            vid: Some(vid),
            pid: Some(pid),
            product: Some(product.to_string()),
            ..Self::default()
        }
    }

    pub fn matches_usb(&self, vid: u16, pid: u16) -> bool {
        self.vid == Some(vid) && self.pid == Some(pid)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortSettings {
    pub baud_rate: u32,
    pub hardware_flow_control: bool,
    pub timeout: Duration,
}

impl PortSettings {
    pub fn new(baud_rate: u32) -> Self {
        Self {
            baud_rate,
            hardware_flow_control: false,
            timeout: Duration::from_millis(10),
        }
    }

    pub fn with_hardware_flow_control(mut self) -> Self {
        self.hardware_flow_control = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Enumerates and opens transports.
pub trait TransportOpener {
    fn list_ports(&self) -> Result<Vec<PortDescriptor>, TransportError>;

    fn open(&self, port: &str, settings: &PortSettings)
        -> Result<Box<dyn Transport>, TransportError>;
}

#[derive(Debug)]
pub struct SerialTransport {
    serial: Option<Box<dyn SerialPort>>,
}

impl SerialTransport {
    pub fn open(port: &str, settings: &PortSettings) -> Result<Self, TransportError> {
        let flow_control = if settings.hardware_flow_control {
            FlowControl::Hardware
        } else {
            FlowControl::None
        };
        let serial = serialport::new(port, settings.baud_rate)
            .flow_control(flow_control)
            .timeout(settings.timeout)
            .open()?;
        log::debug!("Opened {} at {} baud", port, settings.baud_rate);
        Ok(Self {
            serial: Some(serial),
        })
    }

    fn serial(&mut self) -> Result<&mut Box<dyn SerialPort>, TransportError> {
        self.serial.as_mut().ok_or(TransportError::Closed)
    }
}

impl Transport for SerialTransport {
    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        let serial = self.serial()?;
        match serial.write(data) {
            Ok(n) => {
                serial.flush()?;
                Ok(n)
            }
            Err(e) if e.kind() == ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        match self.serial()?.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn bytes_available(&mut self) -> Result<usize, TransportError> {
        Ok(self.serial()?.bytes_to_read()? as usize)
    }

    fn purge(&mut self) -> Result<(), TransportError> {
        self.serial()?.clear(ClearBuffer::All)?;
        Ok(())
    }

    fn reset(&mut self) -> Result<(), TransportError> {
        // A virtual COM port has no USB reset; dropping DTR and the buffers
        // is the closest equivalent.
        let serial = self.serial()?;
        serial.write_data_terminal_ready(false)?;
        serial.clear(ClearBuffer::All)?;
        serial.write_data_terminal_ready(true)?;
        Ok(())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        if let Some(serial) = self.serial.take() {
            log::debug!("Closing {}", serial.name().unwrap_or_default());
        }
        Ok(())
    }
}

/// Opens real serial ports.
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialOpener;

impl TransportOpener for SerialOpener {
    fn list_ports(&self) -> Result<Vec<PortDescriptor>, TransportError> {
        let ports = serialport::available_ports()?
            .into_iter()
            .map(|info| match info.port_type {
                SerialPortType::UsbPort(usb) => PortDescriptor {
                    port: info.port_name,
                    vid: Some(usb.vid),
                    pid: Some(usb.pid),
                    manufacturer: usb.manufacturer,
                    product: usb.product,
                    serial_number: usb.serial_number,
                },
                _ => PortDescriptor::new(&info.port_name),
            })
            .collect();
        Ok(ports)
    }

    fn open(
        &self,
        port: &str,
        settings: &PortSettings,
    ) -> Result<Box<dyn Transport>, TransportError> {
        Ok(Box::new(SerialTransport::open(port, settings)?))
    }
}
