//! Replays captures saved in a session archive as if a device produced them.
//!
//! Every instance names one entry of the archive given to `init`. All running
//! instances are fed by a single always-ready step that copies
//! [`CHUNK_SIZE`] bytes per instance per poll.

use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, Cursor, Read};
use std::path::Path;

use crate::capability::{Capability, ConfigError, ConfigValue, InfoField, InfoValue};
use crate::device::{DeviceIndex, DeviceRegistry, DeviceStatus};
use crate::driver::{check_capability, require_active, Driver, DriverError};
use crate::packet::{period_ps, Header, Logic, Packet};
use crate::scheduler::{Readiness, Source, SourceToken};
use crate::session::Feed;
use crate::transport::TransportError;

/// Size of the Logic payloads sent per instance and step.
pub const CHUNK_SIZE: usize = 4096;

/// Where capture entries come from.
pub trait CaptureArchive {
    fn open_entry(&self, archive: &str, entry: &str) -> Result<Box<dyn Read>, TransportError>;
}

/// An unpacked session: the archive is a directory, entries are its files.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectoryArchive;

impl CaptureArchive for DirectoryArchive {
    fn open_entry(&self, archive: &str, entry: &str) -> Result<Box<dyn Read>, TransportError> {
        let path = Path::new(archive).join(entry);
        log::debug!("Opening capture {}", path.display());
        let file = File::open(&path)?;
        Ok(Box::new(BufReader::new(file)))
    }
}

/// Archives held in memory, keyed by archive and entry name.
#[derive(Debug, Default, Clone)]
pub struct MemoryArchive {
    entries: HashMap<(String, String), Vec<u8>>,
}

impl MemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entry(mut self, archive: &str, entry: &str, data: impl Into<Vec<u8>>) -> Self {
        self.entries
            .insert((archive.to_string(), entry.to_string()), data.into());
        self
    }
}

impl CaptureArchive for MemoryArchive {
    fn open_entry(&self, archive: &str, entry: &str) -> Result<Box<dyn Read>, TransportError> {
        let data = self
            .entries
            .get(&(archive.to_string(), entry.to_string()))
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no entry {} in {}", entry, archive),
                )
            })?;
        Ok(Box::new(Cursor::new(data.clone())))
    }
}

/// Read until `buf` is full or the entry is exhausted.
fn fill_chunk(reader: &mut dyn Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

struct OpenEntry {
    name: String,
    reader: Box<dyn Read>,
}

impl fmt::Debug for OpenEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenEntry").field("name", &self.name).finish()
    }
}

#[derive(Debug)]
pub struct ReplayState {
    capture_file: Option<String>,
    samplerate: u64,
    unit_size: u8,
    num_probes: Option<u32>,
    entry: Option<OpenEntry>,
    samples_sent: u64,
}

impl Default for ReplayState {
    fn default() -> Self {
        Self {
            capture_file: None,
            samplerate: 0,
            unit_size: 1,
            num_probes: None,
            entry: None,
            samples_sent: 0,
        }
    }
}

impl ReplayState {
    /// Probe count from the probe list, or every bit of a sample.
    fn num_probes(&self) -> u32 {
        self.num_probes
            .unwrap_or(u32::from(self.unit_size) * 8)
    }
}

pub struct SessionReplay {
    archive: Box<dyn CaptureArchive>,
    session_file: Option<String>,
    devices: DeviceRegistry<ReplayState>,
    pump: Option<SourceToken>,
}

impl SessionReplay {
    pub const VENDOR: &'static str = "Virtual";
    pub const MODEL: &'static str = "Session replay";
    pub const MAX_UNIT_SIZE: u64 = 4;

    const CAPABILITIES: &'static [Capability] = &[
        Capability::CaptureFile,
        Capability::CaptureUnitsize,
        Capability::Samplerate,
        Capability::ProbeConfig,
    ];

    pub fn new(archive: Box<dyn CaptureArchive>) -> Self {
        Self {
            archive,
            session_file: None,
            devices: DeviceRegistry::new(),
            pump: None,
        }
    }

    fn any_running(&self) -> bool {
        self.devices
            .iter()
            .any(|device| device.state.entry.is_some())
    }
}

impl Driver for SessionReplay {
    fn name(&self) -> &'static str {
        "session"
    }

    fn long_name(&self) -> &'static str {
        "Session-emulating driver"
    }

    /// Remembers the archive; instances are created by `open`.
    fn init(&mut self, port: Option<&str>) -> Result<usize, DriverError> {
        self.cleanup();
        self.session_file = port.map(str::to_string);
        Ok(0)
    }

    fn cleanup(&mut self) {
        self.devices.clear();
        self.pump = None;
        self.session_file = None;
    }

    /// Opening the next unused index creates a new instance.
    fn open(&mut self, index: DeviceIndex) -> Result<(), DriverError> {
        if index.0 == self.devices.len() {
            self.devices.add(
                DeviceStatus::Active,
                Self::VENDOR,
                Self::MODEL,
                "",
                ReplayState::default(),
            );
            log::debug!("Created replay instance {}", index);
            return Ok(());
        }
        let device = self
            .devices
            .get_mut(index)
            .ok_or(DriverError::DeviceNotFound(index))?;
        device.status = DeviceStatus::Active;
        Ok(())
    }

    fn close(&mut self, index: DeviceIndex) -> Result<(), DriverError> {
        let device = self
            .devices
            .get_mut(index)
            .ok_or(DriverError::DeviceNotFound(index))?;
        device.state.entry = None;
        device.status = DeviceStatus::Inactive;
        Ok(())
    }

    fn get_info(&self, index: DeviceIndex, field: InfoField) -> Option<InfoValue> {
        let device = self.devices.get(index)?;
        match field {
            InfoField::Vendor => Some(InfoValue::Text(device.vendor.clone())),
            InfoField::Model => Some(InfoValue::Text(device.model.clone())),
            InfoField::NumProbes => Some(InfoValue::Count(device.state.num_probes())),
            InfoField::CurrentSamplerate => Some(InfoValue::Samplerate(device.state.samplerate)),
            _ => None,
        }
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
        let device = self
            .devices
            .get_mut(index)
            .ok_or(DriverError::DeviceNotFound(index))?;
        require_active(index, device.status, "device must be open to configure")?;
        let state = &mut device.state;

        match value {
            ConfigValue::Samplerate(0) => {
                return Err(ConfigError::InvalidSamplerate(0).into());
            }
            ConfigValue::Samplerate(samplerate) => state.samplerate = samplerate,
            ConfigValue::CaptureFile(name) if name.is_empty() => {
                return Err(ConfigError::InvalidValue {
                    capability: Capability::CaptureFile,
                    reason: "empty entry name".into(),
                }
                .into());
            }
            ConfigValue::CaptureFile(name) => state.capture_file = Some(name),
            ConfigValue::CaptureUnitsize(size) if size == 0 || size > Self::MAX_UNIT_SIZE => {
                return Err(ConfigError::InvalidValue {
                    capability: Capability::CaptureUnitsize,
                    reason: format!("unit size must be 1..={}", Self::MAX_UNIT_SIZE),
                }
                .into());
            }
            ConfigValue::CaptureUnitsize(size) => state.unit_size = size as u8,
            ConfigValue::ProbeConfig(probes) => {
                state.num_probes = Some(probes.len() as u32);
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
        let session_file = self
            .session_file
            .clone()
            .ok_or_else(|| DriverError::Argument("no session file given".into()))?;
        let device = self
            .devices
            .get_mut(index)
            .ok_or(DriverError::DeviceNotFound(index))?;
        require_active(index, device.status, "device must be open to start")?;
        let state = &mut device.state;
        if state.entry.is_some() {
            return Err(DriverError::InvalidState {
                index,
                status: device.status,
                reason: "acquisition already running",
            });
        }
        let name = state
            .capture_file
            .clone()
            .ok_or_else(|| DriverError::Argument(format!("device {} has no capture file", index)))?;

        log::debug!("Opening archive {} file {}", session_file, name);
        let reader = self.archive.open_entry(&session_file, &name)?;
        state.entry = Some(OpenEntry { name, reader });
        state.samples_sent = 0;

        feed.send(Packet::Header(Header::logic(
            state.samplerate,
            state.num_probes(),
        )))?;

        if !self.pump.is_some_and(|token| feed.is_registered(token)) {
            self.pump = Some(feed.register(Source::AlwaysReady, None));
        }
        Ok(())
    }

    #[tracing::instrument(skip(self, feed))]
    fn stop_acquisition(
        &mut self,
        index: DeviceIndex,
        feed: &mut Feed<'_>,
    ) -> Result<(), DriverError> {
        let device = self
            .devices
            .get_mut(index)
            .ok_or(DriverError::DeviceNotFound(index))?;
        device.state.entry = None;
        if !self.any_running() {
            if let Some(token) = self.pump.take() {
                feed.deregister(token);
            }
        }
        if feed.is_open() {
            feed.send(Packet::End)?;
        }
        Ok(())
    }

    fn receive(
        &mut self,
        _index: DeviceIndex,
        _readiness: Readiness,
        feed: &mut Feed<'_>,
    ) -> Result<(), DriverError> {
        log::trace!("Feeding chunks");

        for device in self.devices.iter_mut() {
            let state = &mut device.state;
            // Instances without an entry are done (or never started).
            let Some(entry) = state.entry.as_mut() else {
                continue;
            };

            let unit = usize::from(state.unit_size);
            let mut buf = vec![0u8; CHUNK_SIZE - CHUNK_SIZE % unit];
            let filled = match fill_chunk(entry.reader.as_mut(), &mut buf) {
                Ok(filled) => filled,
                Err(e) => {
                    log::error!("Reading {} failed: {}", entry.name, e);
                    state.entry = None;
                    feed.send_as(device.index, Packet::End)?;
                    continue;
                }
            };
            let exhausted = filled < buf.len();
            let whole = filled - filled % unit;
            if whole != filled {
                log::warn!(
                    "{}: dropping {} trailing bytes of a partial sample",
                    entry.name,
                    filled - whole
                );
            }

            if whole > 0 {
                buf.truncate(whole);
                let samples = (whole / unit) as u64;
                let period = period_ps(state.samplerate);
                feed.send_as(
                    device.index,
                    Packet::Logic(Logic {
                        time_offset_ps: state.samples_sent * period,
                        duration_ps: samples * period,
                        unit_size: state.unit_size,
                        data: buf,
                    }),
                )?;
                state.samples_sent += samples;
            }

            if exhausted {
                log::debug!(
                    "Done with {} after {} samples",
                    entry.name,
                    state.samples_sent
                );
                state.entry = None;
                feed.send_as(device.index, Packet::End)?;
            }
        }

        if !self.any_running() {
            if let Some(token) = self.pump.take() {
                feed.deregister(token);
            }
        }
        Ok(())
    }
}
