//! In-memory sample store fed from the session bus.
//!
//! Samples are kept in fixed-size chunks so a long capture never needs one
//! huge reallocation. A finished capture can be exported as a polars
//! [`DataFrame`].

use polars::prelude::*;

use crate::packet::{Header, Logic, Packet};
use crate::scheduler::StepKey;
use crate::session::PacketConsumer;

pub const DATASTORE_CHUNK_SIZE: usize = 512 * 1024;

pub const TIME_COLUMN_NAME: &str = "time";
pub const RAW_COLUMN_NAME: &str = "raw";
const ROW_INDEX_NAME: &str = "sample";

#[derive(Debug, thiserror::Error)]
pub enum DatastoreError {
    #[error("Unit size {0} not supported, must be 1..=4")]
    InvalidUnitSize(usize),

    #[error("Failed to build sample frame")]
    Frame(#[from] PolarsError),
}

#[derive(Debug)]
pub struct Datastore {
    unit_size: usize,
    chunk_size: usize,
    chunks: Vec<Vec<u8>>,
    num_units: u64,
    stream: Option<StepKey>,
    header: Option<Header>,
    triggers: Vec<u64>,
    complete: bool,
}

impl Datastore {
    pub fn new(unit_size: usize) -> Result<Self, DatastoreError> {
        if !(1..=4).contains(&unit_size) {
            return Err(DatastoreError::InvalidUnitSize(unit_size));
        }
        Ok(Self {
            unit_size,
            chunk_size: DATASTORE_CHUNK_SIZE * unit_size,
            chunks: Vec::new(),
            num_units: 0,
            stream: None,
            header: None,
            triggers: Vec::new(),
            complete: false,
        })
    }

    /// Chunk size in samples.
    pub fn with_chunk_samples(mut self, samples: usize) -> Self {
        self.chunk_size = samples.max(1) * self.unit_size;
        self
    }

    pub fn unit_size(&self) -> usize {
        self.unit_size
    }

    pub fn num_units(&self) -> u64 {
        self.num_units
    }

    pub fn chunks(&self) -> &[Vec<u8>] {
        &self.chunks
    }

    pub fn header(&self) -> Option<&Header> {
        self.header.as_ref()
    }

    /// Sample indices at which a trigger fired.
    pub fn triggers(&self) -> &[u64] {
        &self.triggers
    }

    /// Whether the stream has ended.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.num_units = 0;
        self.header = None;
        self.triggers.clear();
        self.complete = false;
    }

    /// Append whole samples of `self.unit_size` bytes. A trailing partial
    /// sample is dropped.
    pub fn put(&mut self, data: &[u8]) {
        let usable = data.len() - data.len() % self.unit_size;
        let mut stored = 0;
        while stored < usable {
            let full = self
                .chunks
                .last()
                .map_or(true, |chunk| chunk.len() >= self.chunk_size);
            if full {
                self.chunks.push(Vec::with_capacity(self.chunk_size));
                log::trace!("New datastore chunk #{}", self.chunks.len());
            }
            let Some(chunk) = self.chunks.last_mut() else {
                break;
            };
            let size = (self.chunk_size - chunk.len()).min(usable - stored);
            chunk.extend_from_slice(&data[stored..stored + size]);
            stored += size;
        }
        self.num_units += (usable / self.unit_size) as u64;
    }

    /// Store a Logic block, resizing its samples to our unit size.
    fn put_logic(&mut self, logic: &Logic) {
        let in_unit = usize::from(logic.unit_size);
        if in_unit == self.unit_size {
            self.put(&logic.data);
            return;
        }
        if in_unit == 0 {
            return;
        }
        log::trace!("Converting {}-byte samples to {} bytes", in_unit, self.unit_size);
        let keep = in_unit.min(self.unit_size);
        let mut converted = Vec::with_capacity(logic.sample_count() * self.unit_size);
        for sample in logic.data.chunks_exact(in_unit) {
            converted.extend_from_slice(&sample[..keep]);
            converted.resize(converted.len() + self.unit_size - keep, 0);
        }
        self.put(&converted);
    }

    /// All stored samples, little-endian.
    pub fn samples(&self) -> impl Iterator<Item = u32> + '_ {
        self.chunks
            .iter()
            .flat_map(move |chunk| chunk.chunks_exact(self.unit_size))
            .map(|sample| {
                sample
                    .iter()
                    .rev()
                    .fold(0u32, |acc, &byte| (acc << 8) | u32::from(byte))
            })
    }

    fn num_probes(&self) -> usize {
        let max = self.unit_size * 8;
        self.header
            .as_ref()
            .map_or(max, |header| (header.logic_probe_count as usize).min(max))
    }

    /// One row per sample: `time` in seconds (in samples when no samplerate
    /// is known), the raw sample and a boolean column per probe.
    pub fn to_dataframe(&self) -> Result<DataFrame, DatastoreError> {
        let samples: Vec<u32> = self.samples().collect();
        let samplerate = self.header.as_ref().map_or(0, |header| header.samplerate);
        let period = if samplerate > 0 {
            1.0 / samplerate as f64
        } else {
            1.0
        };

        let probe_names: Vec<String> = (1..=self.num_probes())
            .map(|probe| format!("probe_{}", probe))
            .collect();
        let mut columns: Vec<Column> = Vec::with_capacity(probe_names.len() + 1);
        for (bit, name) in probe_names.iter().enumerate() {
            let values: Vec<bool> = samples.iter().map(|s| (s >> bit) & 1 == 1).collect();
            columns.push(Series::new(name.as_str().into(), values).into());
        }
        columns.push(Series::new(RAW_COLUMN_NAME.into(), samples).into());

        let mut selection = vec![col(TIME_COLUMN_NAME), col(RAW_COLUMN_NAME)];
        selection.extend(probe_names.iter().map(|name| col(name.as_str())));

        let df = DataFrame::new(columns)?
            .lazy()
            .with_row_index(ROW_INDEX_NAME, Some(0))
            .with_columns([(col(ROW_INDEX_NAME).cast(DataType::Float64) * lit(period))
                .alias(TIME_COLUMN_NAME)])
            .select(selection)
            .collect()?;
        Ok(df)
    }
}

impl PacketConsumer for Datastore {
    fn consume(&mut self, key: StepKey, packet: &Packet) {
        if self.stream.is_some_and(|stream| stream != key) {
            log::trace!("Datastore ignoring {} packet from {}", packet.kind(), key);
            return;
        }
        match packet {
            Packet::Header(header) => {
                if self.complete {
                    self.clear();
                }
                self.stream = Some(key);
                self.header = Some(header.clone());
            }
            Packet::Logic(logic) => self.put_logic(logic),
            // The trigger marker precedes the sample it fired on.
            Packet::Trigger { .. } => self.triggers.push(self.num_units),
            Packet::End => {
                log::debug!("Datastore holds {} samples", self.num_units);
                self.complete = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceIndex;
    use crate::scheduler::DriverId;

    fn key(device: usize) -> StepKey {
        StepKey::new(DriverId(0), DeviceIndex(device))
    }

    fn logic(unit_size: u8, data: Vec<u8>) -> Packet {
        Packet::Logic(Logic {
            time_offset_ps: 0,
            duration_ps: 0,
            unit_size,
            data,
        })
    }

    #[test]
    fn test_put_spans_chunks() {
        let mut ds = Datastore::new(2).unwrap().with_chunk_samples(4);
        ds.put(&[1, 0, 2, 0, 3, 0]);
        ds.put(&[4, 0, 5, 0, 6, 0, 7]);
        assert_eq!(ds.num_units(), 6);
        let sizes: Vec<usize> = ds.chunks().iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![8, 4]);
        assert_eq!(ds.samples().collect::<Vec<_>>(), vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_invalid_unit_size() {
        assert!(matches!(
            Datastore::new(0),
            Err(DatastoreError::InvalidUnitSize(0))
        ));
        assert!(Datastore::new(5).is_err());
    }

    #[test]
    fn test_consumes_stream() {
        let mut ds = Datastore::new(1).unwrap();
        ds.consume(key(0), &Packet::Header(Header::logic(1_000_000, 3)));
        ds.consume(key(0), &logic(1, vec![0b000, 0b001]));
        ds.consume(key(0), &Packet::Trigger { time_offset_ps: 2_000_000 });
        ds.consume(key(0), &logic(1, vec![0b101]));
        ds.consume(key(1), &logic(1, vec![0xff]));
        ds.consume(key(0), &logic(1, vec![0b110]));
        assert!(!ds.is_complete());
        ds.consume(key(0), &Packet::End);

        assert!(ds.is_complete());
        assert_eq!(ds.num_units(), 4);
        assert_eq!(ds.triggers(), &[2]);

        let df = ds.to_dataframe().unwrap();
        assert_eq!(df.height(), 4);
        assert_eq!(df.width(), 2 + 3);
        let time = df.column(TIME_COLUMN_NAME).unwrap().f64().unwrap();
        assert_eq!(time.get(2), Some(2.0e-6));
        let probe_1 = df.column("probe_1").unwrap().bool().unwrap();
        let probe_3 = df.column("probe_3").unwrap().bool().unwrap();
        assert_eq!(probe_1.get(1), Some(true));
        assert_eq!(probe_3.get(1), Some(false));
        assert_eq!(probe_3.get(2), Some(true));
        assert_eq!(probe_3.get(3), Some(true));
    }

    #[test]
    fn test_converts_unit_size() {
        let mut ds = Datastore::new(2).unwrap();
        ds.consume(key(0), &Packet::Header(Header::logic(0, 16)));
        ds.consume(key(0), &logic(1, vec![0xab, 0xcd]));
        ds.consume(key(0), &logic(4, vec![0x34, 0x12, 0xff, 0xff]));
        assert_eq!(ds.samples().collect::<Vec<_>>(), vec![0xab, 0xcd, 0x1234]);

        let df = ds.to_dataframe().unwrap();
        assert_eq!(df.width(), 2 + 16);
        let time = df.column(TIME_COLUMN_NAME).unwrap().f64().unwrap();
        assert_eq!(time.get(2), Some(2.0));
    }

    #[test]
    fn test_restart_clears_previous_capture() {
        let mut ds = Datastore::new(1).unwrap();
        ds.consume(key(0), &Packet::Header(Header::logic(1, 8)));
        ds.consume(key(0), &logic(1, vec![1, 2, 3]));
        ds.consume(key(0), &Packet::End);
        ds.consume(key(0), &Packet::Header(Header::logic(1, 8)));
        assert_eq!(ds.num_units(), 0);
        assert!(!ds.is_complete());
    }
}
