use std::fmt;

use crate::probe::Probe;

/// Configuration options a driver may advertise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    LogicAnalyzer,
    Samplerate,
    LimitMsec,
    LimitSamples,
    CaptureRatio,
    ProbeConfig,
    CaptureFile,
    CaptureUnitsize,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::LogicAnalyzer => "logic_analyzer",
            Capability::Samplerate => "samplerate",
            Capability::LimitMsec => "limit_msec",
            Capability::LimitSamples => "limit_samples",
            Capability::CaptureRatio => "capture_ratio",
            Capability::ProbeConfig => "probe_config",
            Capability::CaptureFile => "capture_file",
            Capability::CaptureUnitsize => "capture_unitsize",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A capability together with the value it should be set to.
///
/// `LogicAnalyzer` is a marker capability and has no settable value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigValue {
    Samplerate(u64),
    LimitMsec(u64),
    LimitSamples(u64),
    /// Integer percentage, as a decimal string.
    CaptureRatio(String),
    ProbeConfig(Vec<Probe>),
    CaptureFile(String),
    CaptureUnitsize(u64),
}

impl ConfigValue {
    pub fn capability(&self) -> Capability {
        match self {
            ConfigValue::Samplerate(_) => Capability::Samplerate,
            ConfigValue::LimitMsec(_) => Capability::LimitMsec,
            ConfigValue::LimitSamples(_) => Capability::LimitSamples,
            ConfigValue::CaptureRatio(_) => Capability::CaptureRatio,
            ConfigValue::ProbeConfig(_) => Capability::ProbeConfig,
            ConfigValue::CaptureFile(_) => Capability::CaptureFile,
            ConfigValue::CaptureUnitsize(_) => Capability::CaptureUnitsize,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Capability {0} is not supported by this driver")]
    Unsupported(Capability),

    #[error("Samplerate {0} Hz is not supported")]
    InvalidSamplerate(u64),

    #[error("Invalid trigger character '{character}' on probe {probe}, only '0'/'1' supported")]
    InvalidTrigger { probe: u32, character: char },

    #[error("Probe index {index} out of range (device has probes 1..={num_probes})")]
    ProbeOutOfRange { index: u32, num_probes: u32 },

    #[error("Probe {probe} trigger uses {stages} stages, device supports {max_stages}")]
    TooManyStages {
        probe: u32,
        stages: usize,
        max_stages: usize,
    },

    #[error("{capability} value {value} is below the minimum of {min}")]
    LimitTooSmall {
        capability: Capability,
        value: u64,
        min: u64,
    },

    #[error("Capture ratio {0} out of range (0..=100)")]
    CaptureRatioOutOfRange(i64),

    #[error("Invalid value for {capability}: {reason}")]
    InvalidValue {
        capability: Capability,
        reason: String,
    },

    #[error("Invalid samplerate range: low {low}, high {high}, step {step}")]
    InvalidRange { low: u64, high: u64, step: u64 },
}

/// The samplerates a device can be configured to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SamplerateTable {
    /// Discrete rates, sorted ascending.
    List(Vec<u64>),
    Range { low: u64, high: u64, step: u64 },
}

impl SamplerateTable {
    pub fn list(mut rates: Vec<u64>) -> Self {
        rates.sort_unstable();
        rates.dedup();
        Self::List(rates)
    }

    pub fn range(low: u64, high: u64, step: u64) -> Result<Self, ConfigError> {
        if low > high || step == 0 {
            return Err(ConfigError::InvalidRange { low, high, step });
        }
        Ok(Self::Range { low, high, step })
    }

    /// Exact membership for lists; in-range and on a step boundary for ranges.
    pub fn contains(&self, samplerate: u64) -> bool {
        match self {
            SamplerateTable::List(rates) => rates.binary_search(&samplerate).is_ok(),
            SamplerateTable::Range { low, high, step } => {
                (*low..=*high).contains(&samplerate) && (samplerate - low) % step == 0
            }
        }
    }

    pub fn validate(&self, samplerate: u64) -> Result<(), ConfigError> {
        if self.contains(samplerate) {
            Ok(())
        } else {
            log::warn!("Invalid samplerate ({} Hz)", samplerate);
            Err(ConfigError::InvalidSamplerate(samplerate))
        }
    }

    pub fn lowest(&self) -> Option<u64> {
        match self {
            SamplerateTable::List(rates) => rates.first().copied(),
            SamplerateTable::Range { low, .. } => Some(*low),
        }
    }

    pub fn highest(&self) -> Option<u64> {
        match self {
            SamplerateTable::List(rates) => rates.last().copied(),
            SamplerateTable::Range { high, .. } => Some(*high),
        }
    }
}

/// Parse a capture ratio percentage the way it arrives from a front end.
pub fn parse_capture_ratio(value: &str) -> Result<u32, ConfigError> {
    let ratio: i64 = value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue {
            capability: Capability::CaptureRatio,
            reason: format!("'{value}' is not an integer percentage"),
        })?;
    if !(0..=100).contains(&ratio) {
        return Err(ConfigError::CaptureRatioOutOfRange(ratio));
    }
    Ok(ratio as u32)
}

/// Queries answered by `Driver::get_info`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoField {
    Vendor,
    Model,
    Version,
    NumProbes,
    Samplerates,
    TriggerTypes,
    CurrentSamplerate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InfoValue {
    Text(String),
    Count(u32),
    Samplerates(SamplerateTable),
    TriggerTypes(&'static str),
    Samplerate(u64),
}
