//! Openbench Logic Sniffer and other SUMP-compatible analyzers.
//!
//! 32 channels over a 115200 baud serial link. Commands are a single opcode
//! byte, optionally followed by a 4-byte little-endian argument. After the
//! run command the device streams 4-byte samples (optionally run-length
//! encoded) and falls silent when done.

use std::thread;
use std::time::Duration;

use crate::capability::{
    parse_capture_ratio, Capability, ConfigError, ConfigValue, InfoField, InfoValue,
    SamplerateTable,
};
use crate::codec::{RleDecoder, SampleByteOrder};
use crate::device::{DeviceIndex, DeviceInstance, DeviceRegistry, DeviceStatus};
use crate::driver::{check_capability, require_active, Driver, DriverError};
use crate::packet::{period_ps, Header, Packet};
use crate::probe::{TriggerSpec, TriggerStage};
use crate::scheduler::{Readiness, Source, SourceToken};
use crate::session::Feed;
use crate::transport::{PortSettings, Transport, TransportOpener};
use crate::trigger::{packetize, TriggerMatcher};

pub const CMD_RESET: u8 = 0x00;
pub const CMD_RUN: u8 = 0x01;
pub const CMD_ID: u8 = 0x02;
pub const CMD_SET_DIVIDER: u8 = 0x80;
pub const CMD_CAPTURE_SIZE: u8 = 0x81;
pub const CMD_SET_FLAGS: u8 = 0x82;
pub const CMD_SET_TRIGGER_MASK_0: u8 = 0xc0;
pub const CMD_SET_TRIGGER_VALUE_0: u8 = 0xc1;
pub const CMD_SET_TRIGGER_CONFIG_0: u8 = 0xc2;

pub const FLAG_DEMUX: u32 = 0x01;
pub const FLAG_FILTER: u32 = 0x02;
pub const FLAG_CLOCK_EXTERNAL: u32 = 0x40;
pub const FLAG_CLOCK_INVERTED: u32 = 0x80;
pub const FLAG_RLE: u32 = 0x100;

/// Trigger config: stage armed, start capturing when it fires.
const TRIGGER_CONFIG_START: u32 = 0x0800_0000;

/// Longest run expanded into a single Logic packet.
const MAX_RUN_SAMPLES: u64 = 4096;

/// Bytes needed by every command on the wire; short commands are padded by
/// the device's command parser, so the reset sequence is just five zeros.
type LongCommand = [u8; 5];

pub fn long_command(opcode: u8, data: u32) -> LongCommand {
    let [b0, b1, b2, b3] = data.to_le_bytes();
    [opcode, b0, b1, b2, b3]
}

/// Capture-size argument: read count in the high half, delay count in the low.
pub fn capture_size(limit_samples: u64, capture_ratio: u32) -> u32 {
    let read_count = ((limit_samples / 4) & 0xffff) as u32;
    let delay_count = if capture_ratio > 0 {
        let pre_trigger = limit_samples.saturating_mul(u64::from(capture_ratio)) / 100;
        (((limit_samples - pre_trigger) / 4) & 0xffff) as u32
    } else {
        0
    };
    (read_count << 16) | delay_count
}

/// Divider and demux setting for `samplerate`. Rates above the base clock
/// use demux mode, which samples on both edges.
pub fn divider_for(samplerate: u64) -> Result<(u32, bool), ConfigError> {
    if samplerate == 0 {
        return Err(ConfigError::InvalidSamplerate(samplerate));
    }
    let (divider, demux) = if samplerate > LogicSniffer::CLOCK_RATE {
        (LogicSniffer::CLOCK_RATE * 2 / samplerate - 1, true)
    } else {
        (LogicSniffer::CLOCK_RATE / samplerate - 1, false)
    };
    if divider > 0x00ff_ffff {
        log::warn!("Samplerate {} Hz needs divider {} (24 bits max)", samplerate, divider);
        return Err(ConfigError::InvalidSamplerate(samplerate));
    }
    Ok((divider as u32, demux))
}

/// The rate the device actually samples at for a divider setting.
pub fn samplerate_for(divider: u32, demux: bool) -> u64 {
    let clock = if demux {
        LogicSniffer::CLOCK_RATE * 2
    } else {
        LogicSniffer::CLOCK_RATE
    };
    clock / (u64::from(divider) + 1)
}

/// Run-time options not covered by capabilities.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SnifferOptions {
    pub rle: bool,
    pub external_clock: bool,
    pub inverted_clock: bool,
    pub filter: bool,
    /// Byte order of samples on the wire.
    pub byte_order: SampleByteOrder,
}

impl SnifferOptions {
    fn flags(&self) -> u32 {
        let mut flags = 0;
        if self.filter {
            flags |= FLAG_FILTER;
        }
        if self.external_clock {
            flags |= FLAG_CLOCK_EXTERNAL;
        }
        if self.inverted_clock {
            flags |= FLAG_CLOCK_INVERTED;
        }
        if self.rle {
            flags |= FLAG_RLE;
        }
        flags
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnifferPhase {
    Idle,
    Configuring,
    /// Run sent, waiting for the first byte.
    Running,
    Streaming,
    Done,
}

#[derive(Debug)]
pub struct SnifferState {
    cur_samplerate: u64,
    period_ps: u64,
    divider: u32,
    demux: bool,
    limit_samples: u64,
    capture_ratio: u32,
    trigger: TriggerSpec,
    options: SnifferOptions,
    phase: SnifferPhase,
    step: Option<SourceToken>,
    sample: [u8; 4],
    num_bytes: usize,
    samples_sent: u64,
    decoder: RleDecoder,
    matcher: TriggerMatcher,
}

impl Default for SnifferState {
    fn default() -> Self {
        let (divider, demux) =
            divider_for(LogicSniffer::DEFAULT_SAMPLERATE).unwrap_or((99, false));
        let samplerate = samplerate_for(divider, demux);
        Self {
            cur_samplerate: samplerate,
            period_ps: period_ps(samplerate),
            divider,
            demux,
            limit_samples: 0,
            capture_ratio: 0,
            trigger: TriggerSpec::default(),
            options: SnifferOptions::default(),
            phase: SnifferPhase::Idle,
            step: None,
            sample: [0; 4],
            num_bytes: 0,
            samples_sent: 0,
            decoder: RleDecoder::new(false, SampleByteOrder::Little),
            matcher: TriggerMatcher::disabled(),
        }
    }
}

impl SnifferState {
    fn flag_register(&self) -> u32 {
        let demux = if self.demux { FLAG_DEMUX } else { 0 };
        self.options.flags() | demux
    }

    /// Everything sent before the run command, in order.
    fn configure_commands(&self) -> Vec<LongCommand> {
        let mut commands = vec![
            long_command(CMD_RESET, 0),
            long_command(CMD_SET_FLAGS, self.flag_register()),
            long_command(
                CMD_CAPTURE_SIZE,
                capture_size(self.limit_samples, self.capture_ratio),
            ),
        ];

        let stages = self.trigger.stages();
        let stages: &[TriggerStage] = if stages.is_empty() {
            &[TriggerStage { mask: 0, pattern: 0 }]
        } else {
            stages
        };
        let last = stages.len() - 1;
        for (n, stage) in stages.iter().enumerate() {
            let offset = 4 * n as u8;
            let mut config = (n as u32) << 16;
            if n == last {
                config |= TRIGGER_CONFIG_START;
            }
            commands.push(long_command(CMD_SET_TRIGGER_MASK_0 + offset, stage.mask));
            commands.push(long_command(CMD_SET_TRIGGER_VALUE_0 + offset, stage.pattern));
            commands.push(long_command(CMD_SET_TRIGGER_CONFIG_0 + offset, config));
        }

        commands.push(long_command(CMD_SET_DIVIDER, self.divider));
        commands
    }

    fn limit_reached(&self) -> bool {
        self.limit_samples > 0 && self.samples_sent >= self.limit_samples
    }

    /// Turn raw stream bytes into packets. Returns true once the sample
    /// limit is reached; remaining bytes are ignored.
    fn process_bytes(&mut self, bytes: &[u8], feed: &mut Feed<'_>) -> Result<bool, DriverError> {
        for &byte in bytes {
            self.sample[self.num_bytes] = byte;
            self.num_bytes += 1;
            if self.num_bytes < 4 {
                continue;
            }
            self.num_bytes = 0;

            let output = self.decoder.push(self.sample);
            log::trace!("Got sample {:?}", output);
            let mut count = output.sample_count();
            if self.limit_samples > 0 {
                count = count.min(self.limit_samples - self.samples_sent);
            }
            let value = output.value().to_le_bytes();
            while count > 0 {
                let run = count.min(MAX_RUN_SAMPLES);
                let data = value.repeat(run as usize);
                for packet in packetize(
                    &data,
                    4,
                    self.samples_sent,
                    self.period_ps,
                    &mut self.matcher,
                ) {
                    feed.send(packet)?;
                }
                self.samples_sent += run;
                count -= run;
            }
            if self.limit_reached() {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

type SnifferDevice = DeviceInstance<SnifferState>;

pub struct LogicSniffer {
    opener: Box<dyn TransportOpener>,
    devices: DeviceRegistry<SnifferState>,
}

impl LogicSniffer {
    pub const NUM_PROBES: u32 = 32;
    pub const NUM_TRIGGER_STAGES: usize = 4;
    pub const TRIGGER_TYPES: &'static str = "01";
    pub const CLOCK_RATE: u64 = 100_000_000;
    pub const MAX_SAMPLERATE: u64 = 200_000_000;
    pub const DEFAULT_SAMPLERATE: u64 = 1_000_000;
    pub const SERIAL_BAUD_RATE: u32 = 115_200;
    pub const READ_TIMEOUT: Duration = Duration::from_millis(10);
    /// Silence after which a streaming capture is considered complete.
    pub const IDLE_TIMEOUT: Duration = Duration::from_millis(30);
    /// Time for the identify reply to cross the link.
    const DISCOVERY_WINDOW: Duration = Duration::from_millis(2);
    const READ_CHUNK: usize = 4096;

    const CAPABILITIES: &'static [Capability] = &[
        Capability::LogicAnalyzer,
        Capability::Samplerate,
        Capability::CaptureRatio,
        Capability::LimitSamples,
        Capability::ProbeConfig,
    ];

    pub fn new(opener: Box<dyn TransportOpener>) -> Self {
        Self {
            opener,
            devices: DeviceRegistry::new(),
        }
    }

    pub fn samplerates() -> SamplerateTable {
        SamplerateTable::Range {
            low: 1,
            high: Self::MAX_SAMPLERATE,
            step: 1,
        }
    }

    fn port_settings() -> PortSettings {
        PortSettings::new(Self::SERIAL_BAUD_RATE).with_timeout(Self::READ_TIMEOUT)
    }

    fn device_mut(&mut self, index: DeviceIndex) -> Result<&mut SnifferDevice, DriverError> {
        self.devices
            .get_mut(index)
            .ok_or(DriverError::DeviceNotFound(index))
    }

    pub fn set_options(
        &mut self,
        index: DeviceIndex,
        options: SnifferOptions,
    ) -> Result<(), DriverError> {
        let device = self.device_mut(index)?;
        if matches!(
            device.state.phase,
            SnifferPhase::Running | SnifferPhase::Streaming
        ) {
            return Err(DriverError::InvalidState {
                index,
                status: device.status,
                reason: "acquisition in progress",
            });
        }
        device.state.options = options;
        Ok(())
    }

    pub fn phase(&self, index: DeviceIndex) -> Option<SnifferPhase> {
        self.devices.get(index).map(|device| device.state.phase)
    }

    pub fn capture_ratio(&self, index: DeviceIndex) -> Option<u32> {
        self.devices.get(index).map(|device| device.state.capture_ratio)
    }

    /// Probe one port: reset five times, identify, expect a 4-byte answer.
    fn identify(&self, port: &str) -> Option<(&'static str, &'static str, &'static str)> {
        let mut transport = match self.opener.open(port, &Self::port_settings()) {
            Ok(transport) => transport,
            Err(e) => {
                log::debug!("Could not open {}: {}", port, e);
                return None;
            }
        };

        let probe = [CMD_RESET, CMD_RESET, CMD_RESET, CMD_RESET, CMD_RESET, CMD_ID];
        let identity = match transport.write(&probe) {
            Ok(n) if n == probe.len() => {
                log::debug!("Probed device {}", port);
                thread::sleep(Self::DISCOVERY_WINDOW);
                let mut reply = [0u8; 4];
                let mut filled = 0;
                while filled < reply.len() {
                    match transport.read(&mut reply[filled..]) {
                        Ok(n) if n > 0 => filled += n,
                        _ => break,
                    }
                }
                match &reply[..filled] {
                    b"1SLO" => Some(("Openbench", "Logic Sniffer", "v1.0")),
                    b"1ALS" => Some(("Sump", "Logic Analyzer", "v1.0")),
                    _ => None,
                }
            }
            _ => None,
        };

        if identity.is_none() {
            // We've written all over the port; put it back.
            if let Err(e) = transport.restore_settings() {
                log::warn!("Restoring settings of {} failed: {}", port, e);
            }
        }
        if let Err(e) = transport.close() {
            log::warn!("Close of {} failed: {}", port, e);
        }
        identity
    }
}

fn send_command(transport: &mut dyn Transport, command: &[u8]) -> Result<(), DriverError> {
    log::debug!("Sending cmd {:02x?}", command);
    let written = transport.write(command)?;
    if written != command.len() {
        log::error!("Short write: {} of {} bytes", written, command.len());
        return Err(DriverError::ShortTransfer {
            expected: command.len(),
            actual: written,
        });
    }
    Ok(())
}

/// Purge, then send the reset opcode five times. Errors are logged only.
fn reset_device(transport: &mut dyn Transport) {
    log::debug!("Resetting device");
    if let Err(e) = transport.purge() {
        log::warn!("Purge failed: {}", e);
    }
    let reset = [CMD_RESET; 5];
    match transport.write(&reset) {
        Ok(n) if n == reset.len() => {}
        Ok(n) => log::warn!("Reset sequence cut short: {} of {} bytes", n, reset.len()),
        Err(e) => log::warn!("Reset write failed: {}", e),
    }
}

/// Tear down a failed acquisition and hand back `error`. The device is
/// reset and left open in `Idle`; the stream gets its End.
fn abort(device: &mut SnifferDevice, feed: &mut Feed<'_>, error: DriverError) -> DriverError {
    log::error!("Acquisition on device {} failed: {}", device.index, error);
    if let Some(token) = device.state.step.take() {
        feed.deregister(token);
    }
    if let Some(transport) = device.transport.as_deref_mut() {
        reset_device(transport);
    }
    device.state.phase = SnifferPhase::Idle;
    if feed.is_open() {
        if let Err(e) = feed.send(Packet::End) {
            log::warn!("Closing stream failed: {}", e);
        }
    }
    error
}

/// The device went quiet or the limit was hit: flush and close the stream.
fn finish(device: &mut SnifferDevice, feed: &mut Feed<'_>) -> Result<(), DriverError> {
    log::debug!(
        "Acquisition finished after {} samples",
        device.state.samples_sent
    );
    if let Some(token) = device.state.step.take() {
        feed.deregister(token);
    }
    if let Some(transport) = device.transport.as_deref_mut() {
        if let Err(e) = transport.purge() {
            log::warn!("Flushing after acquisition failed: {}", e);
        }
    }
    device.state.phase = SnifferPhase::Done;
    feed.send(Packet::End)?;
    Ok(())
}

impl Driver for LogicSniffer {
    fn name(&self) -> &'static str {
        "sump"
    }

    fn long_name(&self) -> &'static str {
        "Openbench Logic Sniffer"
    }

    fn init(&mut self, port: Option<&str>) -> Result<usize, DriverError> {
        let ports: Vec<String> = match port {
            Some(port) => vec![port.to_string()],
            None => self
                .opener
                .list_ports()?
                .into_iter()
                .map(|d| d.port)
                .collect(),
        };

        let mut found = 0;
        for port in ports {
            let Some((vendor, model, version)) = self.identify(&port) else {
                continue;
            };
            log::debug!("Found {} {} on {}", vendor, model, port);
            let index = self.devices.add(
                DeviceStatus::Inactive,
                vendor,
                model,
                version,
                SnifferState::default(),
            );
            if let Some(device) = self.devices.get_mut(index) {
                device.port = Some(port);
            }
            found += 1;
        }
        Ok(found)
    }

    fn cleanup(&mut self) {
        self.devices.clear();
    }

    fn open(&mut self, index: DeviceIndex) -> Result<(), DriverError> {
        let settings = Self::port_settings();
        let device = self
            .devices
            .get_mut(index)
            .ok_or(DriverError::DeviceNotFound(index))?;
        if device.transport.is_some() {
            return Ok(());
        }
        let port = device
            .port
            .clone()
            .ok_or_else(|| DriverError::Argument(format!("device {} has no port", index)))?;
        device.transport = Some(self.opener.open(&port, &settings)?);
        device.status = DeviceStatus::Active;
        log::debug!("Opened {}", port);
        Ok(())
    }

    fn close(&mut self, index: DeviceIndex) -> Result<(), DriverError> {
        let device = self.device_mut(index)?;
        if matches!(
            device.state.phase,
            SnifferPhase::Configuring | SnifferPhase::Running | SnifferPhase::Streaming
        ) {
            if let Some(transport) = device.transport.as_deref_mut() {
                reset_device(transport);
            }
        }
        device.state.phase = SnifferPhase::Idle;
        if device.transport.is_some() {
            device.close_transport();
            device.status = DeviceStatus::Inactive;
        }
        Ok(())
    }

    fn get_info(&self, index: DeviceIndex, field: InfoField) -> Option<InfoValue> {
        let device = self.devices.get(index)?;
        let info = match field {
            InfoField::Vendor => InfoValue::Text(device.vendor.clone()),
            InfoField::Model => InfoValue::Text(device.model.clone()),
            InfoField::Version => InfoValue::Text(device.version.clone()),
            InfoField::NumProbes => InfoValue::Count(Self::NUM_PROBES),
            InfoField::Samplerates => InfoValue::Samplerates(Self::samplerates()),
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
        let state = &mut device.state;

        match value {
            ConfigValue::Samplerate(samplerate) => {
                Self::samplerates().validate(samplerate)?;
                let (divider, demux) = divider_for(samplerate)?;
                state.cur_samplerate = samplerate_for(divider, demux);
                state.period_ps = period_ps(state.cur_samplerate);
                state.divider = divider;
                state.demux = demux;
                log::debug!(
                    "Setting samplerate to {} Hz ({} Hz requested, divider {}, demux {})",
                    state.cur_samplerate,
                    samplerate,
                    divider,
                    if demux { "on" } else { "off" }
                );
            }
            ConfigValue::ProbeConfig(probes) => {
                state.trigger =
                    TriggerSpec::compile(&probes, Self::NUM_PROBES, Self::NUM_TRIGGER_STAGES)?;
            }
            ConfigValue::LimitSamples(0) => {
                return Err(ConfigError::LimitTooSmall {
                    capability: Capability::LimitSamples,
                    value: 0,
                    min: 1,
                }
                .into());
            }
            ConfigValue::LimitSamples(samples) => {
                state.limit_samples = samples;
            }
            ConfigValue::CaptureRatio(ratio) => match parse_capture_ratio(&ratio) {
                Ok(ratio) => state.capture_ratio = ratio,
                Err(e) => {
                    state.capture_ratio = 0;
                    return Err(e.into());
                }
            },
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
        if matches!(
            device.state.phase,
            SnifferPhase::Running | SnifferPhase::Streaming
        ) {
            return Err(DriverError::InvalidState {
                index,
                status: device.status,
                reason: "acquisition already running",
            });
        }
        let transport = device
            .transport
            .as_deref_mut()
            .ok_or(DriverError::NotOpen(index))?;
        let state = &mut device.state;

        state.phase = SnifferPhase::Configuring;
        let sent = state
            .configure_commands()
            .iter()
            .try_for_each(|command| send_command(transport, command))
            .and_then(|()| send_command(transport, &[CMD_RUN]));
        if let Err(e) = sent {
            log::error!("Configuring device {} failed: {}", index, e);
            reset_device(transport);
            state.phase = SnifferPhase::Idle;
            return Err(e);
        }

        state.sample = [0; 4];
        state.num_bytes = 0;
        state.samples_sent = 0;
        state.decoder = RleDecoder::new(state.options.rle, state.options.byte_order);
        state.matcher = TriggerMatcher::new(state.trigger.stages());
        state.phase = SnifferPhase::Running;
        state.step = Some(feed.register(Source::Transport, None));

        let header = Header::logic(state.cur_samplerate, Self::NUM_PROBES);
        if let Err(e) = feed.send(Packet::Header(header)) {
            return Err(abort(device, feed, e.into()));
        }
        Ok(())
    }

    #[tracing::instrument(skip(self, feed))]
    fn stop_acquisition(
        &mut self,
        index: DeviceIndex,
        feed: &mut Feed<'_>,
    ) -> Result<(), DriverError> {
        let device = self.device_mut(index)?;
        if let Some(token) = device.state.step.take() {
            feed.deregister(token);
        }
        if matches!(
            device.state.phase,
            SnifferPhase::Running | SnifferPhase::Streaming
        ) {
            device.state.phase = SnifferPhase::Idle;
        }
        if feed.is_open() {
            feed.send(Packet::End)?;
        }
        Ok(())
    }

    fn poll_readable(&mut self, index: DeviceIndex) -> bool {
        let Some(transport) = self
            .devices
            .get_mut(index)
            .and_then(|device| device.transport.as_deref_mut())
        else {
            return false;
        };
        match transport.bytes_available() {
            Ok(n) => n > 0,
            Err(e) => {
                log::warn!("Polling device {} failed: {}", index, e);
                false
            }
        }
    }

    fn receive(
        &mut self,
        index: DeviceIndex,
        readiness: Readiness,
        feed: &mut Feed<'_>,
    ) -> Result<(), DriverError> {
        let device = self.device_mut(index)?;

        if device.state.phase == SnifferPhase::Running {
            // The device started sending and will not pause until done, so
            // from now on silence means the capture is complete.
            if let Some(token) = device.state.step.take() {
                feed.deregister(token);
            }
            device.state.step = Some(feed.register(Source::Transport, Some(Self::IDLE_TIMEOUT)));
            device.state.phase = SnifferPhase::Streaming;
        }
        if device.state.phase != SnifferPhase::Streaming {
            return Ok(());
        }

        if readiness != Readiness::Readable {
            return finish(device, feed);
        }

        let mut buf = [0u8; Self::READ_CHUNK];
        let read = match device.transport.as_deref_mut() {
            Some(transport) => transport.read(&mut buf).map_err(DriverError::from),
            None => Err(DriverError::NotOpen(index)),
        };
        let n = match read {
            Ok(n) => n,
            Err(e) => return Err(abort(device, feed, e)),
        };
        match device.state.process_bytes(&buf[..n], feed) {
            Ok(true) => finish(device, feed),
            Ok(false) => Ok(()),
            Err(e) => Err(abort(device, feed, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::mock_transport::{self, MockOpener, MockPort};
    use crate::probe::Probe;
    use crate::scheduler::{DriverId, StepKey};
    use crate::session::Session;
    use crate::transport::PortDescriptor;

    const DEV: DeviceIndex = DeviceIndex(0);
    const PROBE: [u8; 6] = [0, 0, 0, 0, 0, CMD_ID];

    fn opened_sniffer() -> (LogicSniffer, MockPort) {
        let (_, port) = mock_transport::new();
        port.reply_to_write(&PROBE, b"1SLO");
        let opener = MockOpener::new().with_port(PortDescriptor::new("/dev/ttyACM0"), &port);
        let mut ols = LogicSniffer::new(Box::new(opener));
        assert_eq!(ols.init(None).unwrap(), 1);
        ols.open(DEV).unwrap();
        port.clear_writes();
        (ols, port)
    }

    fn session_with(ols: LogicSniffer) -> (Session, Rc<RefCell<Vec<Packet>>>) {
        let recorded = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&recorded);
        let mut session = Session::new(move |_: StepKey, packet: &Packet| {
            sink.borrow_mut().push(packet.clone())
        });
        session.add_driver(Box::new(ols));
        (session, recorded)
    }

    fn samples(values: &[u32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn logic_samples(packets: &[Packet]) -> Vec<u32> {
        packets
            .iter()
            .filter_map(|p| match p {
                Packet::Logic(logic) => Some(logic.data.chunks(4)),
                _ => None,
            })
            .flatten()
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    #[test]
    fn test_capture_size_payload() {
        assert_eq!(capture_size(400, 50), (100 << 16) | 50);
        assert_eq!(capture_size(400, 0), 100 << 16);
        assert_eq!(capture_size(400, 100), 100 << 16);
    }

    #[test]
    fn test_divider() {
        assert_eq!(divider_for(200_000_000), Ok((0, true)));
        assert_eq!(divider_for(100_000_000), Ok((0, false)));
        assert_eq!(divider_for(1_000_000), Ok((99, false)));
        assert!(divider_for(1).is_err());
        assert!(divider_for(0).is_err());
    }

    #[test]
    fn test_long_command_little_endian() {
        assert_eq!(
            long_command(CMD_CAPTURE_SIZE, 0x0064_0032),
            [0x81, 0x32, 0x00, 0x64, 0x00]
        );
    }

    #[test]
    fn test_discovery() {
        let (_, sniffer) = mock_transport::new();
        sniffer.reply_to_write(&PROBE, b"1ALS");
        let (_, silent) = mock_transport::new();
        let opener = MockOpener::new()
            .with_port(PortDescriptor::new("/dev/ttyS0"), &silent)
            .with_port(PortDescriptor::new("/dev/ttyACM0"), &sniffer);
        let mut ols = LogicSniffer::new(Box::new(opener));
        assert_eq!(ols.init(None).unwrap(), 1);

        assert_eq!(silent.written(), PROBE.to_vec());
        assert_eq!(silent.restore_count(), 1);
        assert!(silent.is_closed());
        assert_eq!(sniffer.restore_count(), 0);
        assert!(sniffer.is_closed());
        assert_eq!(
            ols.get_info(DEV, InfoField::Vendor),
            Some(InfoValue::Text("Sump".into()))
        );
        assert_eq!(ols.get_status(DEV), DeviceStatus::Inactive);
        assert_eq!(ols.get_status(DeviceIndex(1)), DeviceStatus::NotFound);
    }

    #[test]
    fn test_capture_ratio_out_of_range_resets_to_zero() {
        let (mut ols, _port) = opened_sniffer();
        ols.set_configuration(DEV, ConfigValue::CaptureRatio("50".into()))
            .unwrap();
        assert_eq!(ols.capture_ratio(DEV), Some(50));
        let err = ols
            .set_configuration(DEV, ConfigValue::CaptureRatio("150".into()))
            .unwrap_err();
        assert!(matches!(
            err,
            DriverError::ConfigRejected(ConfigError::CaptureRatioOutOfRange(150))
        ));
        assert_eq!(ols.capture_ratio(DEV), Some(0));
    }

    #[test]
    fn test_samplerate_validation() {
        let (mut ols, _port) = opened_sniffer();
        assert!(ols
            .set_configuration(DEV, ConfigValue::Samplerate(200_000_001))
            .is_err());
        ols.set_configuration(DEV, ConfigValue::Samplerate(200_000_000))
            .unwrap();
        assert_eq!(
            ols.get_info(DEV, InfoField::CurrentSamplerate),
            Some(InfoValue::Samplerate(200_000_000))
        );
        assert!(matches!(
            ols.set_configuration(DEV, ConfigValue::LimitMsec(10)),
            Err(DriverError::ConfigRejected(ConfigError::Unsupported(
                Capability::LimitMsec
            )))
        ));
    }

    #[test]
    fn test_samplerate_follows_divider() {
        assert_eq!(samplerate_for(32, false), 3_030_303);
        assert_eq!(samplerate_for(0, true), 200_000_000);

        let (mut ols, _port) = opened_sniffer();
        ols.set_configuration(DEV, ConfigValue::Samplerate(3_000_000))
            .unwrap();
        assert_eq!(
            ols.get_info(DEV, InfoField::CurrentSamplerate),
            Some(InfoValue::Samplerate(3_030_303))
        );
    }

    #[test]
    fn test_configure_sequence() {
        let (mut ols, port) = opened_sniffer();
        ols.set_configuration(DEV, ConfigValue::Samplerate(200_000_000))
            .unwrap();
        ols.set_configuration(DEV, ConfigValue::LimitSamples(400))
            .unwrap();
        ols.set_configuration(DEV, ConfigValue::CaptureRatio("50".into()))
            .unwrap();
        ols.set_configuration(
            DEV,
            ConfigValue::ProbeConfig(vec![
                Probe::with_trigger(1, "10"),
                Probe::with_trigger(32, "1"),
            ]),
        )
        .unwrap();
        ols.set_options(
            DEV,
            SnifferOptions {
                rle: true,
                ..SnifferOptions::default()
            },
        )
        .unwrap();

        let (mut session, recorded) = session_with(ols);
        session.start(DriverId(0), DEV).unwrap();

        let expected: Vec<Vec<u8>> = vec![
            vec![0x00, 0, 0, 0, 0],
            long_command(CMD_SET_FLAGS, FLAG_RLE | FLAG_DEMUX).to_vec(),
            long_command(CMD_CAPTURE_SIZE, (100 << 16) | 50).to_vec(),
            long_command(0xc0, 0x8000_0001).to_vec(),
            long_command(0xc1, 0x8000_0001).to_vec(),
            long_command(0xc2, 0).to_vec(),
            long_command(0xc4, 0x0000_0001).to_vec(),
            long_command(0xc5, 0).to_vec(),
            long_command(0xc6, (1 << 16) | TRIGGER_CONFIG_START).to_vec(),
            long_command(CMD_SET_DIVIDER, 0).to_vec(),
            vec![CMD_RUN],
        ];
        assert_eq!(port.writes(), expected);
        assert_eq!(recorded.borrow().len(), 1);
        assert_eq!(session.scheduler().len(), 1);
    }

    #[test]
    fn test_no_trigger_still_arms_stage_zero() {
        let (ols, port) = opened_sniffer();
        let (mut session, _recorded) = session_with(ols);
        session.start(DriverId(0), DEV).unwrap();
        let writes = port.writes();
        assert_eq!(writes[3], long_command(0xc0, 0).to_vec());
        assert_eq!(writes[5], long_command(0xc2, TRIGGER_CONFIG_START).to_vec());
        assert_eq!(writes[6], long_command(CMD_SET_DIVIDER, 99).to_vec());
    }

    #[test]
    fn test_rle_stream_until_idle() {
        let (mut ols, port) = opened_sniffer();
        ols.set_options(
            DEV,
            SnifferOptions {
                rle: true,
                ..SnifferOptions::default()
            },
        )
        .unwrap();
        port.reply_to_write(&[CMD_RUN], &samples(&[0xaa, 0x8000_0005, 0x01]));

        let (mut session, recorded) = session_with(ols);
        session.start(DriverId(0), DEV).unwrap();
        session.run().unwrap();

        let packets = recorded.borrow();
        assert_eq!(logic_samples(&packets), vec![0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0x01]);
        assert!(packets.last().is_some_and(Packet::is_end));
        assert_eq!(packets.len(), 1 + 3 + 1);
        assert_eq!(port.purge_count(), 1);
        assert!(!port.is_closed());
    }

    #[test]
    fn test_sample_limit_ends_stream() {
        let (mut ols, port) = opened_sniffer();
        ols.set_configuration(DEV, ConfigValue::LimitSamples(3))
            .unwrap();
        port.reply_to_write(&[CMD_RUN], &samples(&[1, 2, 3, 4, 5]));

        let (mut session, recorded) = session_with(ols);
        session.start(DriverId(0), DEV).unwrap();
        session.run().unwrap();

        let packets = recorded.borrow();
        assert_eq!(logic_samples(&packets), vec![1, 2, 3]);
        assert!(packets.last().is_some_and(Packet::is_end));
    }

    #[test]
    fn test_software_trigger_marks_sample() {
        let (mut ols, port) = opened_sniffer();
        ols.set_configuration(
            DEV,
            ConfigValue::ProbeConfig(vec![Probe::with_trigger(2, "1")]),
        )
        .unwrap();
        port.reply_to_write(&[CMD_RUN], &samples(&[0, 1, 2, 3, 2]));

        let (mut session, recorded) = session_with(ols);
        session.start(DriverId(0), DEV).unwrap();
        session.run().unwrap();

        let packets = recorded.borrow();
        let triggers: Vec<_> = packets
            .iter()
            .filter_map(|p| match p {
                Packet::Trigger { time_offset_ps } => Some(*time_offset_ps),
                _ => None,
            })
            .collect();
        assert_eq!(triggers, vec![2 * period_ps(LogicSniffer::DEFAULT_SAMPLERATE)]);
    }

    #[test]
    fn test_short_write_aborts_start() {
        let (ols, port) = opened_sniffer();
        port.set_write_limit(Some(3));
        let (mut session, recorded) = session_with(ols);
        let err = session.start(DriverId(0), DEV).unwrap_err();
        assert!(matches!(
            err,
            DriverError::ShortTransfer {
                expected: 5,
                actual: 3
            }
        ));
        // The cut-off reset command, then the (equally cut-off) reset sequence.
        assert_eq!(port.writes(), vec![vec![0, 0, 0], vec![0, 0, 0]]);
        assert_eq!(port.purge_count(), 1);
        assert!(recorded.borrow().is_empty());
        assert!(session.scheduler().is_empty());

        port.set_write_limit(None);
        port.clear_writes();
        session.start(DriverId(0), DEV).unwrap();
        assert_eq!(port.writes().last(), Some(&vec![CMD_RUN]));
    }

    #[test]
    fn test_read_failure_resets_device() {
        let (ols, port) = opened_sniffer();
        let (mut session, recorded) = session_with(ols);
        let id = DriverId(0);
        session.start(id, DEV).unwrap();
        port.clear_writes();

        port.push_rx(&samples(&[1]));
        port.fail_reads(true);
        let err = session.run().unwrap_err();
        assert!(err.is_io_error());

        assert_eq!(port.purge_count(), 1);
        assert_eq!(port.writes(), vec![vec![CMD_RESET; 5]]);
        assert!(recorded.borrow().last().is_some_and(Packet::is_end));
        assert!(session.scheduler().is_empty());
        assert!(!port.is_closed());

        port.fail_reads(false);
        port.clear_writes();
        session.start(id, DEV).unwrap();
        assert_eq!(port.writes().last(), Some(&vec![CMD_RUN]));
    }

    #[test]
    fn test_long_run_is_split_into_bounded_packets() {
        let (mut ols, port) = opened_sniffer();
        ols.set_options(
            DEV,
            SnifferOptions {
                rle: true,
                ..SnifferOptions::default()
            },
        )
        .unwrap();
        port.reply_to_write(&[CMD_RUN], &samples(&[0x55, 0x8000_2001]));

        let (mut session, recorded) = session_with(ols);
        session.start(DriverId(0), DEV).unwrap();
        session.run().unwrap();

        let packets = recorded.borrow();
        let sizes: Vec<usize> = packets
            .iter()
            .filter_map(|p| match p {
                Packet::Logic(logic) => Some(logic.data.len()),
                _ => None,
            })
            .collect();
        assert_eq!(sizes, vec![4, 4096 * 4, 4096 * 4, 4]);

        let values = logic_samples(&packets);
        assert_eq!(values.len(), 1 + 0x2001);
        assert!(values.iter().all(|&v| v == 0x55));
        match &packets[3] {
            Packet::Logic(logic) => {
                assert_eq!(logic.time_offset_ps, 4097 * period_ps(1_000_000));
            }
            other => panic!("expected logic, got {:?}", other),
        }
    }

    #[test]
    fn test_start_requires_open_device() {
        let (_, port) = mock_transport::new();
        port.reply_to_write(&PROBE, b"1SLO");
        let opener = MockOpener::new().with_port(PortDescriptor::new("/dev/ttyACM0"), &port);
        let mut ols = LogicSniffer::new(Box::new(opener));
        ols.init(Some("/dev/ttyACM0")).unwrap();

        let (mut session, _recorded) = session_with(ols);
        assert!(matches!(
            session.start(DriverId(0), DEV),
            Err(DriverError::InvalidState { .. })
        ));
    }
}
