use std::time::SystemTime;

/// Version of the packet feed layout.
pub const FEED_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub feed_version: u32,
    pub start_time: SystemTime,
    pub samplerate: u64,
    pub logic_probe_count: u32,
    pub analog_probe_count: u32,
}

impl Header {
    /// Header for a logic-only acquisition starting now.
    pub fn logic(samplerate: u64, logic_probe_count: u32) -> Self {
        Self {
            feed_version: FEED_VERSION,
            start_time: SystemTime::now(),
            samplerate,
            logic_probe_count,
            analog_probe_count: 0,
        }
    }
}

/// A block of canonical samples, `unit_size` bytes each.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Logic {
    pub time_offset_ps: u64,
    pub duration_ps: u64,
    pub unit_size: u8,
    pub data: Vec<u8>,
}

impl Logic {
    pub fn sample_count(&self) -> usize {
        match self.unit_size {
            0 => 0,
            unit => self.data.len() / usize::from(unit),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Header(Header),
    Logic(Logic),
    Trigger { time_offset_ps: u64 },
    End,
}

impl Packet {
    pub fn kind(&self) -> &'static str {
        match self {
            Packet::Header(_) => "header",
            Packet::Logic(_) => "logic",
            Packet::Trigger { .. } => "trigger",
            Packet::End => "end",
        }
    }

    pub fn is_end(&self) -> bool {
        matches!(self, Packet::End)
    }
}

/// Sample period in picoseconds, 0 when the rate is unknown.
pub fn period_ps(samplerate: u64) -> u64 {
    if samplerate == 0 {
        0
    } else {
        1_000_000_000_000 / samplerate
    }
}
