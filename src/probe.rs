//! Probes and their compiled trigger representation.
//!
//! Probe indices are 1-based: probe `n` is channel bit `n - 1` of a sample
//! (probe 1 is the LSB). A probe's trigger string is read position by
//! position, character `i` being the required level on trigger stage `i`.

use crate::capability::ConfigError;

/// One input channel of a capture device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Probe {
    pub index: u32,
    pub enabled: bool,
    pub trigger: Option<String>,
}

impl Probe {
    pub fn new(index: u32) -> Self {
        Self {
            index,
            enabled: true,
            trigger: None,
        }
    }

    pub fn with_trigger(index: u32, trigger: &str) -> Self {
        Self {
            index,
            enabled: true,
            trigger: Some(trigger.to_string()),
        }
    }

    /// Sample bit this probe maps to.
    pub fn bit(&self) -> u32 {
        1 << (self.index - 1)
    }
}

/// One AND-combined trigger condition: bits in `mask` must equal the same
/// bits of `pattern`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TriggerStage {
    pub mask: u32,
    pub pattern: u32,
}

impl TriggerStage {
    pub fn new(mask: u32, pattern: u32) -> Self {
        Self {
            mask,
            pattern: pattern & mask,
        }
    }

    pub fn is_dont_care(&self) -> bool {
        self.mask == 0
    }

    pub fn matches(&self, sample: u32) -> bool {
        (sample & self.mask) == (self.pattern & self.mask)
    }
}

/// Device-native trigger state rebuilt from a full probe list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TriggerSpec {
    stages: Vec<TriggerStage>,
    enabled_mask: u32,
}

impl TriggerSpec {
    /// Compile a probe list for a device with `num_probes` channels and
    /// `max_stages` trigger stages. Always a full recompute.
    pub fn compile(
        probes: &[Probe],
        num_probes: u32,
        max_stages: usize,
    ) -> Result<Self, ConfigError> {
        let mut stages = vec![TriggerStage::default(); max_stages];
        let mut enabled_mask = 0u32;
        let mut used_stages = 0usize;

        for probe in probes {
            if probe.index == 0 || probe.index > num_probes {
                return Err(ConfigError::ProbeOutOfRange {
                    index: probe.index,
                    num_probes,
                });
            }
            if !probe.enabled {
                continue;
            }
            let bit = probe.bit();
            enabled_mask |= bit;

            let Some(trigger) = probe.trigger.as_deref() else {
                continue;
            };
            let stage_count = trigger.chars().count();
            if stage_count > max_stages {
                return Err(ConfigError::TooManyStages {
                    probe: probe.index,
                    stages: stage_count,
                    max_stages,
                });
            }
            for (stage, tc) in stages.iter_mut().zip(trigger.chars()) {
                match tc {
                    '0' => stage.mask |= bit,
                    '1' => {
                        stage.mask |= bit;
                        stage.pattern |= bit;
                    }
                    other => {
                        return Err(ConfigError::InvalidTrigger {
                            probe: probe.index,
                            character: other,
                        })
                    }
                }
            }
            used_stages = used_stages.max(stage_count);
        }

        stages.truncate(used_stages);
        log::debug!(
            "Compiled trigger: {} stage(s), enabled probes 0x{:08x}",
            stages.len(),
            enabled_mask
        );
        Ok(Self {
            stages,
            enabled_mask,
        })
    }

    /// Compile for a device with a single trigger stage. Every character of
    /// a probe's trigger string is ORed into that stage, so "01" ends up as
    /// a high trigger.
    pub fn compile_folded(probes: &[Probe], num_probes: u32) -> Result<TriggerStage, ConfigError> {
        let longest = probes
            .iter()
            .filter_map(|probe| probe.trigger.as_deref())
            .map(|trigger| trigger.chars().count())
            .max()
            .unwrap_or(0);
        let spec = Self::compile(probes, num_probes, longest)?;
        Ok(spec
            .stages
            .iter()
            .fold(TriggerStage::default(), |folded, stage| {
                TriggerStage::new(folded.mask | stage.mask, folded.pattern | stage.pattern)
            }))
    }

    pub fn stages(&self) -> &[TriggerStage] {
        &self.stages
    }

    /// Stage 0, or a don't-care stage when no trigger was configured.
    pub fn first_stage(&self) -> TriggerStage {
        self.stages.first().copied().unwrap_or_default()
    }

    pub fn enabled_mask(&self) -> u32 {
        self.enabled_mask
    }

    pub fn is_empty(&self) -> bool {
        self.stages.iter().all(TriggerStage::is_dont_care)
    }

    /// Rebuild a probe list from the compiled stages. Channels that never
    /// appear in a stage mask come back without a trigger.
    pub fn decode(&self, num_probes: u32) -> Vec<Probe> {
        (1..=num_probes)
            .map(|index| {
                let bit = 1u32 << (index - 1);
                let trigger: String = self
                    .stages
                    .iter()
                    .take_while(|stage| stage.mask & bit != 0)
                    .map(|stage| if stage.pattern & bit != 0 { '1' } else { '0' })
                    .collect();
                Probe {
                    index,
                    enabled: self.enabled_mask & bit != 0,
                    trigger: (!trigger.is_empty()).then_some(trigger),
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitState {
    High,
    Low,
    DontCare,
}

impl BitState {
    fn as_char(self) -> Option<char> {
        match self {
            BitState::High => Some('1'),
            BitState::Low => Some('0'),
            BitState::DontCare => None,
        }
    }
}

/// Builder for a probe list with per-stage trigger levels.
///
/// ```rust
/// use la_capture::probe::{BitState, ProbeConfigBuilder};
///
/// let probes = ProbeConfigBuilder::new(8)
///     .probe(1, BitState::High)
///     .probe(3, BitState::Low)
///     .build();
/// assert_eq!(probes[0].trigger.as_deref(), Some("1"));
/// assert_eq!(probes[1].trigger, None);
/// ```
#[derive(Debug)]
pub struct ProbeConfigBuilder {
    num_probes: u32,
    disabled: Vec<u32>,
    stages: Vec<Vec<(u32, BitState)>>,
}

impl ProbeConfigBuilder {
    pub fn new(num_probes: u32) -> Self {
        Self {
            num_probes,
            disabled: Vec::new(),
            stages: vec![Vec::new()],
        }
    }

    /// Set the level required on `index` for the current stage.
    pub fn probe(mut self, index: u32, state: BitState) -> Self {
        if let Some(stage) = self.stages.last_mut() {
            stage.retain(|(i, _)| *i != index);
            stage.push((index, state));
        }
        self
    }

    /// Start the next trigger stage.
    pub fn next_stage(mut self) -> Self {
        self.stages.push(Vec::new());
        self
    }

    pub fn disable(mut self, index: u32) -> Self {
        self.disabled.push(index);
        self
    }

    pub fn build(self) -> Vec<Probe> {
        (1..=self.num_probes)
            .map(|index| {
                let trigger: String = self
                    .stages
                    .iter()
                    .map_while(|stage| {
                        stage
                            .iter()
                            .find(|(i, _)| *i == index)
                            .and_then(|(_, state)| state.as_char())
                    })
                    .collect();
                Probe {
                    index,
                    enabled: !self.disabled.contains(&index),
                    trigger: (!trigger.is_empty()).then_some(trigger),
                }
            })
            .collect()
    }
}
