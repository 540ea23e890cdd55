//! ChronoVu LA8: 8 channels, up to 100 MHz, 8 MiB of on-board SDRAM.
//!
//! The LA8 captures into its SDRAM once triggered and is then read out in
//! 2048 blocks of 4096 bytes through its FTDI FT245 interface. The readout is
//! interleaved (see [`crate::codec::demangled_index`]), so all blocks are
//! collected and de-mangled before any sample is sent on the session bus.

use std::thread;
use std::time::{Duration, Instant};

use crate::capability::{Capability, ConfigError, ConfigValue, InfoField, InfoValue};
use crate::codec::{
    capture_duration, demangle_block, divcount_to_samplerate, la8_samplerates,
    samplerate_to_divcount, LA8_BLOCK_SIZE, LA8_NUM_BLOCKS, LA8_SDRAM_SIZE,
};
use crate::device::{DeviceIndex, DeviceInstance, DeviceRegistry, DeviceStatus};
use crate::driver::{check_capability, require_active, Driver, DriverError};
use crate::packet::{period_ps, Header, Packet};
use crate::probe::{TriggerSpec, TriggerStage};
use crate::scheduler::{Readiness, Source, SourceToken};
use crate::session::Feed;
use crate::transport::{PortSettings, Transport, TransportError, TransportOpener};
use crate::trigger::{packetize, TriggerMatcher};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum La8Phase {
    Idle,
    Configuring,
    Armed,
    /// Waiting for block `n`.
    Reading(usize),
    Draining,
    Done,
}

impl La8Phase {
    fn is_streaming(self) -> bool {
        matches!(self, La8Phase::Reading(_) | La8Phase::Draining)
    }
}

#[derive(Debug)]
pub struct La8State {
    cur_samplerate: u64,
    period_ps: u64,
    divcount: u8,
    limit_msec: u64,
    limit_samples: u64,
    trigger: TriggerStage,
    trigger_timeout: Duration,
    phase: La8Phase,
    deadline: Option<Instant>,
    mangled_buf: Vec<u8>,
    final_buf: Vec<u8>,
    matcher: TriggerMatcher,
    step: Option<SourceToken>,
}

impl Default for La8State {
    fn default() -> Self {
        Self {
            cur_samplerate: ChronoVuLa8::DEFAULT_SAMPLERATE,
            period_ps: period_ps(ChronoVuLa8::DEFAULT_SAMPLERATE),
            divcount: 0,
            limit_msec: 0,
            limit_samples: 0,
            trigger: TriggerStage::default(),
            trigger_timeout: ChronoVuLa8::TRIGGER_TIMEOUT,
            phase: La8Phase::Idle,
            deadline: None,
            mangled_buf: vec![0; LA8_BLOCK_SIZE],
            final_buf: Vec::new(),
            matcher: TriggerMatcher::disabled(),
            step: None,
        }
    }
}

impl La8State {
    /// The 4-byte acquisition command: divcount, 0xff, pattern, mask.
    fn start_command(&self) -> [u8; 4] {
        [
            self.divcount,
            0xff,
            self.trigger.pattern as u8,
            self.trigger.mask as u8,
        ]
    }
}

type La8Device = DeviceInstance<La8State>;

pub struct ChronoVuLa8 {
    opener: Box<dyn TransportOpener>,
    devices: DeviceRegistry<La8State>,
}

impl ChronoVuLa8 {
    pub const USB_VENDOR_ID: u16 = 0x0403;
    pub const USB_PRODUCT_ID: u16 = 0x6001;
    pub const USB_DESCRIPTION: &'static str = "ChronoVu LA8";
    pub const VENDOR: &'static str = "ChronoVu";
    pub const MODEL: &'static str = "LA8";
    pub const VERSION: &'static str = "";

    pub const NUM_PROBES: u32 = 8;
    pub const TRIGGER_TYPES: &'static str = "01";
    pub const MIN_NUM_SAMPLES: u64 = 1;

    pub const DEFAULT_SAMPLERATE: u64 = 100_000_000;
    pub const TRIGGER_TIMEOUT: Duration = Duration::from_secs(10);
    pub const SERIAL_BAUD_RATE: u32 = 115_200;
    pub const READ_TIMEOUT: Duration = Duration::from_millis(100);

    /// Settle time after opening and after the sequencer reset.
    const SETTLE_TIME: Duration = Duration::from_millis(100);
    /// Upper bound on draining stale data during a reset.
    const PURGE_TIMEOUT: Duration = Duration::from_secs(20);
    const SEQUENCER_RESET: [u8; 8] = [0x01; 8];

    const CAPABILITIES: &'static [Capability] = &[
        Capability::LogicAnalyzer,
        Capability::Samplerate,
        Capability::LimitMsec,
        Capability::LimitSamples,
        Capability::ProbeConfig,
    ];

    pub fn new(opener: Box<dyn TransportOpener>) -> Self {
        Self {
            opener,
            devices: DeviceRegistry::new(),
        }
    }

    fn port_settings() -> PortSettings {
        PortSettings::new(Self::SERIAL_BAUD_RATE)
            .with_hardware_flow_control()
            .with_timeout(Self::READ_TIMEOUT)
    }

    fn device_mut(&mut self, index: DeviceIndex) -> Result<&mut La8Device, DriverError> {
        self.devices
            .get_mut(index)
            .ok_or(DriverError::DeviceNotFound(index))
    }

    /// How long to wait for the trigger once the capture window has passed.
    pub fn set_trigger_timeout(
        &mut self,
        index: DeviceIndex,
        timeout: Duration,
    ) -> Result<(), DriverError> {
        self.device_mut(index)?.state.trigger_timeout = timeout;
        Ok(())
    }

    pub fn phase(&self, index: DeviceIndex) -> Option<La8Phase> {
        self.devices.get(index).map(|device| device.state.phase)
    }

    /// Configured `(limit_msec, limit_samples)`. The hardware always fills
    /// its whole SDRAM; the limits are kept for front ends.
    pub fn limits(&self, index: DeviceIndex) -> Option<(u64, u64)> {
        self.devices
            .get(index)
            .map(|device| (device.state.limit_msec, device.state.limit_samples))
    }
}

/// Write `data` completely or reset the device.
fn la8_write(device: &mut La8Device, data: &[u8]) -> Result<(), DriverError> {
    let transport = device
        .transport
        .as_deref_mut()
        .ok_or(DriverError::NotOpen(device.index))?;
    let result = match transport.write(data) {
        Ok(written) if written == data.len() => return Ok(()),
        Ok(written) => {
            log::warn!("Bytes to write: {}, bytes written: {}", data.len(), written);
            Err(DriverError::ShortTransfer {
                expected: data.len(),
                actual: written,
            })
        }
        Err(e) => {
            log::warn!("Write failed: {}", e);
            Err(e.into())
        }
    };
    close_reset_sequencer(device);
    result
}

/// Read until `buf` is full or the device goes quiet.
fn read_available(transport: &mut dyn Transport, buf: &mut [u8]) -> Result<usize, TransportError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = transport.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Read and de-mangle block `block` into the capture buffer.
fn read_block(device: &mut La8Device, block: usize) -> Result<(), DriverError> {
    let transport = device
        .transport
        .as_deref_mut()
        .ok_or(DriverError::NotOpen(device.index))?;
    let state = &mut device.state;

    log::trace!("Reading block {}", block);
    let mut bytes_read = read_available(transport, &mut state.mangled_buf)?;

    // The FTDI chip needs a while before the first block shows up.
    if bytes_read == 0 && block == 0 {
        while bytes_read == 0 && state.deadline.is_some_and(|d| Instant::now() < d) {
            bytes_read = read_available(transport, &mut state.mangled_buf)?;
        }
    }

    if bytes_read != LA8_BLOCK_SIZE {
        log::warn!("Trigger timed out ({} bytes in block {})", bytes_read, block);
        return Err(DriverError::ProtocolTimeout(format!(
            "block {} returned {} of {} bytes",
            block, bytes_read, LA8_BLOCK_SIZE
        )));
    }

    log::trace!("De-mangling samples of block {}", block);
    demangle_block(&state.mangled_buf, block, state.divcount, &mut state.final_buf);
    Ok(())
}

/// Reset the sequencer logic and release the port. Errors are logged only.
fn close_reset_sequencer(device: &mut La8Device) {
    if let Some(mut transport) = device.transport.take() {
        log::debug!("Resetting sequencer logic");
        if let Err(e) = transport.write(&ChronoVuLa8::SEQUENCER_RESET) {
            log::warn!("Sequencer reset write failed: {}", e);
        }
        thread::sleep(ChronoVuLa8::SETTLE_TIME);

        log::debug!("Purging buffers, resetting and closing device");
        if let Err(e) = transport.purge() {
            log::warn!("Purge failed: {}", e);
        }
        if let Err(e) = transport.reset() {
            log::warn!("USB reset failed: {}", e);
        }
        if let Err(e) = transport.close() {
            log::warn!("Close failed: {}", e);
        }
    }
    device.status = DeviceStatus::Inactive;
}

/// Drain pending reads, then reset the sequencer and close.
fn la8_reset(device: &mut La8Device) {
    log::debug!("Resetting the device");
    if let Some(transport) = device.transport.as_deref_mut() {
        let done = Instant::now() + ChronoVuLa8::PURGE_TIMEOUT;
        let mut buf = [0u8; LA8_BLOCK_SIZE];
        while Instant::now() < done {
            match transport.read(&mut buf) {
                Ok(n) if n > 0 => continue,
                _ => break,
            }
        }
    }
    close_reset_sequencer(device);
    log::debug!("Device reset finished");
}

/// Send all de-mangled blocks, trigger-split, then End.
fn send_capture(device: &mut La8Device, feed: &mut Feed<'_>) -> Result<(), DriverError> {
    log::debug!("Sampling finished, sending data to session bus");
    let state = &mut device.state;
    for block in 0..LA8_NUM_BLOCKS {
        let start = block * LA8_BLOCK_SIZE;
        let packets = packetize(
            &state.final_buf[start..start + LA8_BLOCK_SIZE],
            1,
            start as u64,
            state.period_ps,
            &mut state.matcher,
        );
        for packet in packets {
            feed.send(packet)?;
        }
    }
    feed.send(Packet::End)?;
    Ok(())
}

impl Driver for ChronoVuLa8 {
    fn name(&self) -> &'static str {
        "chronovu-la8"
    }

    fn long_name(&self) -> &'static str {
        "ChronoVu LA8"
    }

    fn init(&mut self, port: Option<&str>) -> Result<usize, DriverError> {
        let candidates: Vec<String> = match port {
            Some(port) => vec![port.to_string()],
            None => self
                .opener
                .list_ports()?
                .into_iter()
                .filter(|d| d.matches_usb(Self::USB_VENDOR_ID, Self::USB_PRODUCT_ID))
                .filter(|d| {
                    d.product
                        .as_deref()
                        .map_or(true, |product| product == Self::USB_DESCRIPTION)
                })
                .map(|d| d.port)
                .collect(),
        };

        let mut found = 0;
        for candidate in candidates {
            // Open it once to make sure it is there; it is reopened on demand.
            match self.opener.open(&candidate, &Self::port_settings()) {
                Ok(mut transport) => {
                    if let Err(e) = transport.close() {
                        log::warn!("Close failed: {}", e);
                    }
                }
                Err(e) => {
                    log::debug!("No LA8 on {}: {}", candidate, e);
                    continue;
                }
            }
            log::debug!("Found device on {}", candidate);
            let index = self.devices.add(
                DeviceStatus::Inactive,
                Self::VENDOR,
                Self::MODEL,
                Self::VERSION,
                La8State::default(),
            );
            if let Some(device) = self.devices.get_mut(index) {
                device.port = Some(candidate);
            }
            found += 1;
        }
        Ok(found)
    }

    fn cleanup(&mut self) {
        for device in self.devices.iter_mut() {
            if device.status == DeviceStatus::Active {
                close_reset_sequencer(device);
            }
        }
        self.devices.clear();
    }

    fn open(&mut self, index: DeviceIndex) -> Result<(), DriverError> {
        let settings = Self::port_settings();
        let device = self
            .devices
            .get_mut(index)
            .ok_or(DriverError::DeviceNotFound(index))?;
        if device.status == DeviceStatus::Active {
            return Ok(());
        }
        let port = device
            .port
            .clone()
            .ok_or_else(|| DriverError::Argument(format!("device {} has no port", index)))?;

        log::debug!("Opening device on {}", port);
        device.transport = Some(self.opener.open(&port, &settings)?);

        let purged = device.transport.as_deref_mut().map(|t| t.purge());
        if let Some(Err(e)) = purged {
            log::error!("Purging buffers failed: {}", e);
            close_reset_sequencer(device);
            return Err(e.into());
        }
        log::debug!("Buffers purged, flow control enabled");

        thread::sleep(Self::SETTLE_TIME);
        device.status = DeviceStatus::Active;
        Ok(())
    }

    fn close(&mut self, index: DeviceIndex) -> Result<(), DriverError> {
        let device = self.device_mut(index)?;
        log::debug!("Closing device");
        if device.status == DeviceStatus::Active {
            close_reset_sequencer(device);
        }
        device.status = DeviceStatus::Inactive;
        device.state.final_buf = Vec::new();
        Ok(())
    }

    fn get_info(&self, index: DeviceIndex, field: InfoField) -> Option<InfoValue> {
        let device = self.devices.get(index)?;
        let info = match field {
            InfoField::Vendor => InfoValue::Text(device.vendor.clone()),
            InfoField::Model => InfoValue::Text(device.model.clone()),
            InfoField::Version => InfoValue::Text(device.version.clone()),
            InfoField::NumProbes => InfoValue::Count(Self::NUM_PROBES),
            InfoField::Samplerates => InfoValue::Samplerates(la8_samplerates()),
            InfoField::TriggerTypes => InfoValue::TriggerTypes(Self::TRIGGER_TYPES),
            InfoField::CurrentSamplerate => InfoValue::Samplerate(device.state.cur_samplerate),
        };
        Some(info)
    }

    fn get_status(&self, index: DeviceIndex) -> DeviceStatus {
        self.devices.status(index)
    }

    fn get_capabilities(&self) -> &'static [Capability] {
        Self::CAPABILITIES
    }

    fn set_configuration(
        &mut self,
        index: DeviceIndex,
        value: ConfigValue,
    ) -> Result<(), DriverError> {
        check_capability(Self::CAPABILITIES, &value)?;
        let device = self.device_mut(index)?;
        require_active(index, device.status, "device must be open to configure")?;
        if device.state.phase.is_streaming() {
            return Err(DriverError::InvalidState {
                index,
                status: device.status,
                reason: "acquisition in progress",
            });
        }
        let state = &mut device.state;

        match value {
            ConfigValue::Samplerate(samplerate) => {
                let divcount = samplerate_to_divcount(samplerate).inspect_err(|_| {
                    log::warn!("Invalid samplerate ({} Hz)", samplerate);
                })?;
                state.divcount = divcount;
                state.cur_samplerate = divcount_to_samplerate(divcount);
                state.period_ps = period_ps(state.cur_samplerate);
                log::debug!("Samplerate set to {} Hz", state.cur_samplerate);
            }
            ConfigValue::ProbeConfig(probes) => {
                state.trigger = TriggerSpec::compile_folded(&probes, Self::NUM_PROBES)?;
                log::debug!(
                    "trigger_mask = 0x{:02x}, trigger_pattern = 0x{:02x}",
                    state.trigger.mask,
                    state.trigger.pattern
                );
            }
            ConfigValue::LimitMsec(0) => {
                return Err(ConfigError::LimitTooSmall {
                    capability: Capability::LimitMsec,
                    value: 0,
                    min: 1,
                }
                .into());
            }
            ConfigValue::LimitMsec(msec) => {
                state.limit_msec = msec;
                log::debug!("LIMIT_MSEC = {}", msec);
            }
            ConfigValue::LimitSamples(samples) if samples < Self::MIN_NUM_SAMPLES => {
                return Err(ConfigError::LimitTooSmall {
                    capability: Capability::LimitSamples,
                    value: samples,
                    min: Self::MIN_NUM_SAMPLES,
                }
                .into());
            }
            ConfigValue::LimitSamples(samples) => {
                state.limit_samples = samples;
                log::debug!("LIMIT_SAMPLES = {}", samples);
            }
            other => return Err(ConfigError::Unsupported(other.capability()).into()),
        }
        Ok(())
    }

    #[tracing::instrument(skip(self, feed))]
    fn start_acquisition(
        &mut self,
        index: DeviceIndex,
        feed: &mut Feed<'_>,
    ) -> Result<(), DriverError> {
        let device = self.device_mut(index)?;
        require_active(index, device.status, "device must be open to start")?;
        if device.state.phase.is_streaming() {
            return Err(DriverError::InvalidState {
                index,
                status: device.status,
                reason: "acquisition already running",
            });
        }

        device.state.phase = La8Phase::Configuring;
        let mut final_buf = Vec::new();
        if final_buf.try_reserve_exact(LA8_SDRAM_SIZE).is_err() {
            log::error!("Failed to allocate {} byte sample buffer", LA8_SDRAM_SIZE);
            device.state.phase = La8Phase::Idle;
            return Err(DriverError::Allocation(LA8_SDRAM_SIZE));
        }
        final_buf.resize(LA8_SDRAM_SIZE, 0);
        device.state.final_buf = final_buf;

        device.state.phase = La8Phase::Armed;
        let command = device.state.start_command();
        if let Err(e) = la8_write(device, &command) {
            log::error!("Acquisition failed to start");
            device.state.phase = La8Phase::Idle;
            return Err(e);
        }
        log::debug!("Acquisition started successfully");

        let header = Header::logic(device.state.cur_samplerate, Self::NUM_PROBES);
        if let Err(e) = feed.send(Packet::Header(header)) {
            log::error!("Announcing the capture failed: {}", e);
            la8_reset(device);
            device.state.phase = La8Phase::Idle;
            device.state.final_buf = Vec::new();
            return Err(e.into());
        }

        let state = &mut device.state;
        state.deadline =
            Some(Instant::now() + capture_duration(state.divcount) + state.trigger_timeout);
        state.matcher = TriggerMatcher::new(&[state.trigger]);
        state.phase = La8Phase::Reading(0);
        state.step = Some(feed.register(Source::AlwaysReady, None));
        Ok(())
    }

    #[tracing::instrument(skip(self, feed))]
    fn stop_acquisition(
        &mut self,
        index: DeviceIndex,
        feed: &mut Feed<'_>,
    ) -> Result<(), DriverError> {
        let device = self.device_mut(index)?;
        log::debug!("Stopping acquisition");
        if let Some(token) = device.state.step.take() {
            feed.deregister(token);
        }
        if device.state.phase.is_streaming() {
            device.state.phase = La8Phase::Idle;
        }
        if feed.is_open() {
            feed.send(Packet::End)?;
        }
        Ok(())
    }

    fn receive(
        &mut self,
        index: DeviceIndex,
        _readiness: Readiness,
        feed: &mut Feed<'_>,
    ) -> Result<(), DriverError> {
        let device = self.device_mut(index)?;
        let La8Phase::Reading(block) = device.state.phase else {
            return Ok(());
        };

        if let Err(e) = read_block(device, block) {
            log::error!("Reading block {} failed: {}", block, e);
            la8_reset(device);
            device.state.phase = La8Phase::Idle;
            if let Some(token) = device.state.step.take() {
                feed.deregister(token);
            }
            if feed.is_open() {
                feed.send(Packet::End)?;
            }
            return Err(e);
        }

        if block + 1 < LA8_NUM_BLOCKS {
            device.state.phase = La8Phase::Reading(block + 1);
            return Ok(());
        }

        device.state.phase = La8Phase::Draining;
        if let Some(token) = device.state.step.take() {
            feed.deregister(token);
        }
        let sent = send_capture(device, feed);
        device.state.final_buf = Vec::new();
        device.state.phase = match sent {
            Ok(()) => La8Phase::Done,
            Err(_) => La8Phase::Idle,
        };
        sent
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::codec::mangle_capture;
    use crate::mock_transport::{self, MockOpener, MockPort};
    use crate::probe::Probe;
    use crate::scheduler::{Scheduler, StepKey};
    use crate::session::{Session, SessionBus};
    use crate::transport::PortDescriptor;

    const DEV: DeviceIndex = DeviceIndex(0);

    fn opened_la8() -> (ChronoVuLa8, MockPort) {
        let (_, port) = mock_transport::new();
        let opener = MockOpener::new().with_port(
            PortDescriptor::usb(
                "/dev/ttyUSB0",
                ChronoVuLa8::USB_VENDOR_ID,
                ChronoVuLa8::USB_PRODUCT_ID,
                ChronoVuLa8::USB_DESCRIPTION,
            ),
            &port,
        );
        let mut la8 = ChronoVuLa8::new(Box::new(opener));
        assert_eq!(la8.init(None).unwrap(), 1);
        la8.open(DEV).unwrap();
        (la8, port)
    }

    type Recorded = Rc<RefCell<Vec<Packet>>>;

    fn session_with(la8: ChronoVuLa8) -> (Session, Recorded) {
        let recorded: Recorded = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&recorded);
        let mut session = Session::new(move |_: StepKey, packet: &Packet| {
            sink.borrow_mut().push(packet.clone())
        });
        session.add_driver(Box::new(la8));
        (session, recorded)
    }

    fn logic_bytes(packets: &[Packet]) -> Vec<u8> {
        packets
            .iter()
            .filter_map(|p| match p {
                Packet::Logic(logic) => Some(logic.data.as_slice()),
                _ => None,
            })
            .flatten()
            .copied()
            .collect()
    }

    #[test]
    fn test_discovery_and_open() {
        let (la8, port) = opened_la8();
        assert_eq!(la8.get_status(DEV), DeviceStatus::Active);
        assert_eq!(la8.get_status(DeviceIndex(3)), DeviceStatus::NotFound);
        assert_eq!(port.open_count(), 2);
        assert_eq!(port.purge_count(), 1);
        assert!(port.settings().unwrap().hardware_flow_control);
        assert_eq!(
            la8.get_info(DEV, InfoField::Vendor),
            Some(InfoValue::Text("ChronoVu".into()))
        );
        assert_eq!(la8.get_info(DEV, InfoField::NumProbes), Some(InfoValue::Count(8)));
    }

    #[test]
    fn test_discovery_ignores_other_devices() {
        let (_, port) = mock_transport::new();
        let opener = MockOpener::new()
            .with_port(PortDescriptor::usb("/dev/ttyUSB0", 0x0403, 0x6010, "Other"), &port);
        let mut la8 = ChronoVuLa8::new(Box::new(opener));
        assert_eq!(la8.init(None).unwrap(), 0);

        let opener = MockOpener::new().with_port(PortDescriptor::new("/dev/ttyS3"), &port);
        let mut la8 = ChronoVuLa8::new(Box::new(opener));
        assert_eq!(la8.init(Some("/dev/ttyS3")).unwrap(), 1);
    }

    #[test]
    fn test_configuration_requires_open_device() {
        let (_, port) = mock_transport::new();
        let opener = MockOpener::new().with_port(PortDescriptor::new("/dev/ttyS0"), &port);
        let mut la8 = ChronoVuLa8::new(Box::new(opener));
        la8.init(Some("/dev/ttyS0")).unwrap();
        assert!(matches!(
            la8.set_configuration(DEV, ConfigValue::Samplerate(1_000_000)),
            Err(DriverError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_configuration_validation() {
        let (mut la8, _port) = opened_la8();
        la8.set_configuration(DEV, ConfigValue::Samplerate(1_000_000))
            .unwrap();
        assert_eq!(
            la8.get_info(DEV, InfoField::CurrentSamplerate),
            Some(InfoValue::Samplerate(1_000_000))
        );
        assert!(la8
            .set_configuration(DEV, ConfigValue::Samplerate(1_000_001))
            .is_err());
        assert!(matches!(
            la8.set_configuration(DEV, ConfigValue::CaptureRatio("50".into())),
            Err(DriverError::ConfigRejected(ConfigError::Unsupported(_)))
        ));
        assert!(matches!(
            la8.set_configuration(DEV, ConfigValue::LimitMsec(0)),
            Err(DriverError::ConfigRejected(ConfigError::LimitTooSmall { .. }))
        ));
        la8.set_configuration(DEV, ConfigValue::LimitSamples(1000))
            .unwrap();
        assert_eq!(la8.limits(DEV), Some((0, 1000)));
        assert!(matches!(
            la8.set_configuration(
                DEV,
                ConfigValue::ProbeConfig(vec![Probe::with_trigger(1, "1x")])
            ),
            Err(DriverError::ConfigRejected(ConfigError::InvalidTrigger { .. }))
        ));
        assert!(matches!(
            la8.set_configuration(DEV, ConfigValue::ProbeConfig(vec![Probe::new(9)])),
            Err(DriverError::ConfigRejected(ConfigError::ProbeOutOfRange { .. }))
        ));
    }

    #[test]
    fn test_full_capture_without_trigger() {
        let (mut la8, port) = opened_la8();
        la8.set_configuration(DEV, ConfigValue::Samplerate(1_000_000))
            .unwrap();

        let canonical: Vec<u8> = (0..LA8_SDRAM_SIZE).map(|i| (i % 251) as u8).collect();
        port.reply_to_write(&[99, 0xff, 0x00, 0x00], &mangle_capture(&canonical, 99));

        let (mut session, recorded) = session_with(la8);
        let id = crate::scheduler::DriverId(0);
        session.start(id, DEV).unwrap();
        session.run().unwrap();

        let packets = recorded.borrow();
        match &packets[0] {
            Packet::Header(header) => {
                assert_eq!(header.samplerate, 1_000_000);
                assert_eq!(header.logic_probe_count, 8);
            }
            other => panic!("expected header, got {:?}", other),
        }
        assert_eq!(packets.len(), 1 + LA8_NUM_BLOCKS + 1);
        assert!(packets[packets.len() - 1].is_end());
        assert!(!packets.iter().any(|p| matches!(p, Packet::Trigger { .. })));

        let data = logic_bytes(&packets);
        assert_eq!(data.len(), 8_388_608);
        assert!(data == canonical);

        match &packets[2] {
            Packet::Logic(logic) => {
                assert_eq!(logic.time_offset_ps, 4096 * 1_000_000);
                assert_eq!(logic.duration_ps, 4096 * 1_000_000);
            }
            other => panic!("expected logic, got {:?}", other),
        }
    }

    #[test]
    fn test_full_capture_with_trigger() {
        let (mut la8, port) = opened_la8();
        let probes = (1..=8).map(|i| Probe::with_trigger(i, "0")).collect();
        la8.set_configuration(DEV, ConfigValue::ProbeConfig(probes))
            .unwrap();

        let mut canonical = vec![0x55u8; LA8_SDRAM_SIZE];
        canonical[5000] = 0;
        canonical[9000] = 0;
        port.reply_to_write(&[0, 0xff, 0x00, 0xff], &mangle_capture(&canonical, 0));

        let (mut session, recorded) = session_with(la8);
        session.start(crate::scheduler::DriverId(0), DEV).unwrap();
        session.run().unwrap();

        let packets = recorded.borrow();
        let triggers: Vec<_> = packets
            .iter()
            .filter_map(|p| match p {
                Packet::Trigger { time_offset_ps } => Some(*time_offset_ps),
                _ => None,
            })
            .collect();
        assert_eq!(triggers, vec![5000 * 10_000]);
        assert_eq!(packets.len(), 1 + LA8_NUM_BLOCKS + 2 + 1 + 1);
        assert!(logic_bytes(&packets) == canonical);
    }

    #[test]
    fn test_trigger_timeout_resets_device() {
        let (mut la8, port) = opened_la8();
        la8.set_trigger_timeout(DEV, Duration::ZERO).unwrap();

        let (mut session, recorded) = session_with(la8);
        let id = crate::scheduler::DriverId(0);
        session.start(id, DEV).unwrap();
        let err = session.run().unwrap_err();
        assert!(err.is_timeout());

        let packets = recorded.borrow();
        assert_eq!(packets.len(), 2);
        assert!(packets[1].is_end());
        assert_eq!(port.written()[4..], [0x01; 8]);
        assert_eq!(port.reset_count(), 1);
        assert!(port.is_closed());
        assert_eq!(
            session.driver_mut(id).map(|d| d.get_status(DEV)),
            Some(DeviceStatus::Inactive)
        );
    }

    #[test]
    fn test_short_command_write_fails_start() {
        let (la8, port) = opened_la8();
        port.set_write_limit(Some(2));

        let (mut session, recorded) = session_with(la8);
        let err = session
            .start(crate::scheduler::DriverId(0), DEV)
            .unwrap_err();
        assert!(matches!(
            err,
            DriverError::ShortTransfer {
                expected: 4,
                actual: 2
            }
        ));
        assert!(err.is_io_error());
        assert!(recorded.borrow().is_empty());
        assert!(session.scheduler().is_empty());
        assert!(port.is_closed());
    }

    #[test]
    fn test_multi_character_trigger_folds_into_one_stage() {
        let (mut la8, port) = opened_la8();
        la8.set_configuration(
            DEV,
            ConfigValue::ProbeConfig(vec![
                Probe::with_trigger(1, "01"),
                Probe::with_trigger(3, "00"),
            ]),
        )
        .unwrap();
        port.clear_writes();

        let (mut session, _recorded) = session_with(la8);
        let id = crate::scheduler::DriverId(0);
        session.start(id, DEV).unwrap();
        assert_eq!(port.writes(), vec![vec![0, 0xff, 0b001, 0b101]]);
        session.stop(id, DEV).unwrap();
    }

    #[test]
    fn test_failed_delivery_leaves_device_restartable() {
        let (mut la8, port) = opened_la8();
        let command = [0, 0xff, 0x00, 0x00];
        port.reply_to_write(&command, &vec![0u8; LA8_SDRAM_SIZE]);

        let mut bus = SessionBus::new(|_: StepKey, _: &Packet| {});
        let mut scheduler = Scheduler::new();
        let key = StepKey::new(crate::scheduler::DriverId(0), DEV);
        la8.start_acquisition(DEV, &mut Feed::new(key, &mut bus, &mut scheduler))
            .unwrap();
        // The consumer side closes the stream while blocks are still coming.
        bus.ensure_end(key);

        let mut result = Ok(());
        while matches!(la8.phase(DEV), Some(La8Phase::Reading(_))) {
            let mut feed = Feed::new(key, &mut bus, &mut scheduler);
            result = la8.receive(DEV, Readiness::Ready, &mut feed);
        }
        assert!(matches!(result, Err(DriverError::Bus(_))));
        assert_eq!(la8.phase(DEV), Some(La8Phase::Idle));
        assert!(scheduler.is_empty());

        port.clear_writes();
        la8.start_acquisition(DEV, &mut Feed::new(key, &mut bus, &mut scheduler))
            .unwrap();
        assert_eq!(port.writes(), vec![command.to_vec()]);
        assert_eq!(la8.phase(DEV), Some(La8Phase::Reading(0)));
    }

    #[test]
    fn test_stop_sends_end_and_deregisters() {
        let (la8, port) = opened_la8();
        port.push_rx(&[0u8; 16]);
        let (mut session, recorded) = session_with(la8);
        let id = crate::scheduler::DriverId(0);
        session.start(id, DEV).unwrap();
        assert!(!session.scheduler().is_empty());
        session.stop(id, DEV).unwrap();
        assert!(session.scheduler().is_empty());
        let packets = recorded.borrow();
        assert_eq!(packets.len(), 2);
        assert!(packets[1].is_end());
    }
}
