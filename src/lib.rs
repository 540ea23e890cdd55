//! # la-capture
//!
//! Acquisition core for logic analyzers: a common driver lifecycle, device
//! protocols for the ChronoVu LA8 and SUMP-compatible samplers (Openbench
//! Logic Sniffer), a replay driver for saved sessions, and a session bus that
//! delivers every capture as the same ordered packet stream.
//!
//! ## Features
//!
//! - **Uniform drivers**: discovery, open/close, capabilities and acquisition
//!   through the [`Driver`] trait
//! - **Serial transport**: ports found and opened through `serialport`
//! - **Software triggers**: multi-stage mask/pattern matching with
//!   trigger-accurate packet splitting
//! - **Single-threaded scheduling**: readiness polling with idle timeouts
//! - **DataFrame output**: captures collected by [`Datastore`] export to `polars`
//!
//! ## Examples
//!
//! ### Capturing from a Logic Sniffer
//!
//! ```rust,no_run
//! use std::cell::RefCell;
//! use std::rc::Rc;
//! use la_capture::{
//!     session, ConfigValue, Datastore, DeviceIndex, Driver, LogicSniffer, SerialOpener,
//!     Session,
//! };
//!
//! let mut sniffer = LogicSniffer::new(Box::new(SerialOpener));
//! let found = sniffer.init(Some("/dev/ttyACM0"))?;
//! println!("Found {} device(s)", found);
//!
//! let device = DeviceIndex(0);
//! sniffer.open(device)?;
//! sniffer.set_configuration(device, ConfigValue::Samplerate(1_000_000))?;
//! sniffer.set_configuration(device, ConfigValue::LimitSamples(4096))?;
//!
//! let store = Rc::new(RefCell::new(Datastore::new(4)?));
//! let mut capture = Session::new(session::shared(&store));
//! let driver = capture.add_driver(Box::new(sniffer));
//! capture.start(driver, device)?;
//! capture.run()?;
//!
//! let df = store.borrow().to_dataframe()?;
//! println!("Captured {} samples", df.height());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ### Probe Configuration
//!
//! ```rust
//! use la_capture::{BitState, ProbeConfigBuilder, TriggerSpec};
//!
//! let probes = ProbeConfigBuilder::new(8)
//!     .probe(1, BitState::High)
//!     .probe(2, BitState::Low)
//!     .disable(8)
//!     .build();
//!
//! let trigger = TriggerSpec::compile(&probes, 8, 1).unwrap();
//! assert_eq!(trigger.first_stage().mask, 0b11);
//! assert_eq!(trigger.first_stage().pattern, 0b01);
//! ```

pub mod capability;
pub mod chronovu_la8;
pub mod codec;
pub mod datastore;
pub mod device;
pub mod driver;
pub mod logic_sniffer;
pub mod mock_transport;
pub mod packet;
pub mod probe;
pub mod scheduler;
pub mod session;
pub mod session_replay;
pub mod transport;
pub mod trigger;

// Re-export the main types for convenience
pub use capability::{
    Capability, ConfigError, ConfigValue, InfoField, InfoValue, SamplerateTable,
};

pub use probe::{BitState, Probe, ProbeConfigBuilder, TriggerSpec, TriggerStage};

pub use packet::{Header, Logic, Packet};

pub use device::{DeviceIndex, DeviceStatus};

pub use driver::{Driver, DriverError};

pub use scheduler::{DriverId, Readiness, Scheduler, Source, StepKey};

pub use session::{BusError, Feed, PacketConsumer, Session, SessionBus};

pub use transport::{
    PortDescriptor, PortSettings, SerialOpener, SerialTransport, Transport, TransportError,
    TransportOpener,
};

pub use chronovu_la8::ChronoVuLa8;

pub use logic_sniffer::{LogicSniffer, SnifferOptions};

pub use session_replay::{CaptureArchive, DirectoryArchive, MemoryArchive, SessionReplay};

pub use datastore::{Datastore, DatastoreError};
