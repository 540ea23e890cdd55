//! Software trigger matching and trigger-aware packetization.

use crate::packet::{Logic, Packet};
use crate::probe::TriggerStage;

/// Scans canonical samples for the configured trigger condition.
///
/// Stages are matched in sequence: stage `n + 1` is only considered once a
/// sample satisfied stage `n`. The matcher fires at most once per
/// acquisition; call [`TriggerMatcher::reset`] before the next one.
#[derive(Debug, Clone, Default)]
pub struct TriggerMatcher {
    stages: Vec<TriggerStage>,
    current: usize,
    found: bool,
}

impl TriggerMatcher {
    /// A matcher over `stages`. Matching is disabled when every stage mask is 0.
    pub fn new(stages: &[TriggerStage]) -> Self {
        let stages = if stages.iter().all(TriggerStage::is_dont_care) {
            Vec::new()
        } else {
            stages.to_vec()
        };
        Self {
            stages,
            current: 0,
            found: false,
        }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        !self.stages.is_empty()
    }

    pub fn found(&self) -> bool {
        self.found
    }

    pub fn reset(&mut self) {
        self.current = 0;
        self.found = false;
    }

    /// Feed one sample. Returns true for the single sample that completes
    /// the trigger.
    pub fn check(&mut self, sample: u32) -> bool {
        if self.found || !self.is_enabled() {
            return false;
        }
        if self.stages[self.current].matches(sample) {
            self.current += 1;
            if self.current == self.stages.len() {
                self.found = true;
                return true;
            }
        }
        false
    }

    /// Index of the triggering sample within `data`, if it is in this buffer.
    pub fn scan(&mut self, data: &[u8], unit_size: usize) -> Option<usize> {
        if unit_size == 0 || self.found || !self.is_enabled() {
            return None;
        }
        (0..data.len() / unit_size).find(|&i| self.check(sample_at(data, unit_size, i)))
    }
}

/// Sample `index` of a little-endian buffer with `unit_size`-byte samples.
pub fn sample_at(data: &[u8], unit_size: usize, index: usize) -> u32 {
    data[index * unit_size..(index + 1) * unit_size]
        .iter()
        .take(4)
        .rev()
        .fold(0u32, |acc, &b| (acc << 8) | u32::from(b))
}

fn logic_packet(data: &[u8], unit_size: u8, first_sample: u64, period_ps: u64) -> Packet {
    let samples = data.len() as u64 / u64::from(unit_size.max(1));
    Packet::Logic(Logic {
        time_offset_ps: first_sample * period_ps,
        duration_ps: samples * period_ps,
        unit_size,
        data: data.to_vec(),
    })
}

/// Turn one buffer of canonical samples into packets.
///
/// Without a trigger match this is a single Logic packet. When the trigger
/// fires inside the buffer at sample `t`, the result is: samples `[0, t)`
/// (omitted when `t == 0`), a Trigger marker at `t`, sample `t` on its own,
/// and samples `(t, len)` (omitted when `t` is the last sample). Timestamps
/// are `sample_index * period_ps`, counted from `first_sample`.
pub fn packetize(
    data: &[u8],
    unit_size: u8,
    first_sample: u64,
    period_ps: u64,
    matcher: &mut TriggerMatcher,
) -> Vec<Packet> {
    let unit = usize::from(unit_size);
    let Some(point) = matcher.scan(data, unit) else {
        return vec![logic_packet(data, unit_size, first_sample, period_ps)];
    };

    log::trace!("Trigger at sample {}", first_sample + point as u64);
    let split = point * unit;
    let mut packets = Vec::with_capacity(4);
    if point > 0 {
        packets.push(logic_packet(&data[..split], unit_size, first_sample, period_ps));
    }
    let trigger_sample = first_sample + point as u64;
    packets.push(Packet::Trigger {
        time_offset_ps: trigger_sample * period_ps,
    });
    packets.push(logic_packet(
        &data[split..split + unit],
        unit_size,
        trigger_sample,
        period_ps,
    ));
    if split + unit < data.len() {
        packets.push(logic_packet(
            &data[split + unit..],
            unit_size,
            trigger_sample + 1,
            period_ps,
        ));
    }
    packets
}
