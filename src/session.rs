//! Packet delivery and the acquisition loop.
//!
//! A [`SessionBus`] delivers packets to one [`PacketConsumer`] and enforces
//! stream order per `(driver, device)`: a Header opens a stream, End closes
//! it, and anything else outside an open stream is dropped. Drivers reach
//! the bus and the scheduler through a [`Feed`] scoped to their stream.
//! [`Session`] owns drivers, bus and scheduler and runs the poll loop.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::thread;
use std::time::Duration;

use crate::device::DeviceIndex;
use crate::driver::{Driver, DriverError};
use crate::packet::Packet;
use crate::scheduler::{Dispatch, DriverId, Scheduler, Source, SourceToken, StepKey};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BusError {
    #[error("{packet} packet for {key} is out of order")]
    OutOfOrder { key: StepKey, packet: &'static str },

    #[error("Stream for {0} is already closed")]
    StreamClosed(StepKey),
}

/// Receives every delivered packet.
pub trait PacketConsumer {
    fn consume(&mut self, key: StepKey, packet: &Packet);
}

impl<F> PacketConsumer for F
where
    F: FnMut(StepKey, &Packet),
{
    fn consume(&mut self, key: StepKey, packet: &Packet) {
        (self)(key, packet)
    }
}

/// Consumer that forwards into a shared one, so the caller keeps access to it.
pub fn shared<C: PacketConsumer + 'static>(consumer: &Rc<RefCell<C>>) -> impl PacketConsumer {
    let consumer = Rc::clone(consumer);
    move |key: StepKey, packet: &Packet| consumer.borrow_mut().consume(key, packet)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    Open,
    Closed,
}

pub struct SessionBus {
    consumer: Box<dyn PacketConsumer>,
    streams: HashMap<StepKey, StreamState>,
}

impl SessionBus {
    pub fn new(consumer: impl PacketConsumer + 'static) -> Self {
        Self {
            consumer: Box::new(consumer),
            streams: HashMap::new(),
        }
    }

    /// Deliver `packet` on the stream `key`, or drop it if it breaks order.
    pub fn send(&mut self, key: StepKey, packet: Packet) -> Result<(), BusError> {
        let state = self.streams.get(&key).copied();
        let next = match (&packet, state) {
            (Packet::Header(_), Some(StreamState::Open)) => None,
            (Packet::Header(_), _) => Some(StreamState::Open),
            (Packet::End, Some(StreamState::Open)) => Some(StreamState::Closed),
            (Packet::End, _) => {
                log::warn!("Dropping duplicate end packet for {}", key);
                return Err(BusError::StreamClosed(key));
            }
            (_, Some(StreamState::Open)) => Some(StreamState::Open),
            (_, _) => None,
        };
        let Some(next) = next else {
            log::warn!("Dropping out-of-order {} packet for {}", packet.kind(), key);
            return Err(BusError::OutOfOrder {
                key,
                packet: packet.kind(),
            });
        };

        log::trace!("{}: {} packet", key, packet.kind());
        self.consumer.consume(key, &packet);
        self.streams.insert(key, next);
        Ok(())
    }

    pub fn is_open(&self, key: StepKey) -> bool {
        self.streams.get(&key) == Some(&StreamState::Open)
    }

    /// Close `key` with an End packet if its stream is still open.
    pub fn ensure_end(&mut self, key: StepKey) {
        if self.is_open(key) {
            log::debug!("Closing stream for {} on behalf of the driver", key);
            let _ = self.send(key, Packet::End);
        }
    }
}

/// A driver's view of the session for one stream.
pub struct Feed<'a> {
    key: StepKey,
    bus: &'a mut SessionBus,
    scheduler: &'a mut Scheduler,
}

impl<'a> Feed<'a> {
    pub fn new(key: StepKey, bus: &'a mut SessionBus, scheduler: &'a mut Scheduler) -> Self {
        Self {
            key,
            bus,
            scheduler,
        }
    }

    pub fn key(&self) -> StepKey {
        self.key
    }

    pub fn send(&mut self, packet: Packet) -> Result<(), BusError> {
        self.bus.send(self.key, packet)
    }

    /// Send on the stream of another device of the same driver.
    pub fn send_as(&mut self, device: DeviceIndex, packet: Packet) -> Result<(), BusError> {
        self.bus.send(StepKey::new(self.key.driver, device), packet)
    }

    pub fn is_open(&self) -> bool {
        self.bus.is_open(self.key)
    }

    pub fn register(&mut self, source: Source, timeout: Option<Duration>) -> SourceToken {
        self.scheduler.register(self.key, source, timeout)
    }

    pub fn deregister(&mut self, token: SourceToken) -> bool {
        self.scheduler.deregister(token)
    }

    pub fn is_registered(&self, token: SourceToken) -> bool {
        self.scheduler.is_registered(token)
    }
}

/// Drivers, their shared bus and the scheduler that drives them.
pub struct Session {
    drivers: Vec<Box<dyn Driver>>,
    scheduler: Scheduler,
    bus: SessionBus,
    poll_interval: Duration,
}

impl Session {
    /// Sleep between polls that found nothing to do.
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1);

    pub fn new(consumer: impl PacketConsumer + 'static) -> Self {
        Self {
            drivers: Vec::new(),
            scheduler: Scheduler::new(),
            bus: SessionBus::new(consumer),
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn add_driver(&mut self, driver: Box<dyn Driver>) -> DriverId {
        self.drivers.push(driver);
        DriverId(self.drivers.len() - 1)
    }

    pub fn driver_mut(&mut self, id: DriverId) -> Option<&mut (dyn Driver + 'static)> {
        self.drivers.get_mut(id.0).map(|driver| driver.as_mut())
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Start acquisition on one device. A failed start never leaves an open
    /// stream behind.
    #[tracing::instrument(skip(self), fields(driver = id.0, device = device.0))]
    pub fn start(&mut self, id: DriverId, device: DeviceIndex) -> Result<(), DriverError> {
        let Self {
            drivers,
            scheduler,
            bus,
            ..
        } = self;
        let driver = drivers
            .get_mut(id.0)
            .ok_or_else(|| DriverError::Argument(format!("no driver with id {}", id.0)))?;
        let key = StepKey::new(id, device);
        let mut feed = Feed::new(key, bus, scheduler);
        let result = driver.start_acquisition(device, &mut feed);
        if let Err(e) = &result {
            log::error!("{}: start failed: {}", key, e);
            scheduler.deregister_key(key);
            bus.ensure_end(key);
        }
        result
    }

    /// Stop acquisition on one device; its stream is closed either way.
    #[tracing::instrument(skip(self), fields(driver = id.0, device = device.0))]
    pub fn stop(&mut self, id: DriverId, device: DeviceIndex) -> Result<(), DriverError> {
        let Self {
            drivers,
            scheduler,
            bus,
            ..
        } = self;
        let driver = drivers
            .get_mut(id.0)
            .ok_or_else(|| DriverError::Argument(format!("no driver with id {}", id.0)))?;
        let key = StepKey::new(id, device);
        let mut feed = Feed::new(key, bus, scheduler);
        let result = driver.stop_acquisition(device, &mut feed);
        bus.ensure_end(key);
        result
    }

    /// Run one scheduler step. Returns whether anything was dispatched.
    pub fn iterate(&mut self) -> Result<bool, DriverError> {
        #[cfg(feature = "cpu-profiling")]
        let _zone = tracy_client::Client::running()
            .map(|client| client.span(tracy_client::span_location!("scheduler poll"), 0));

        let Self {
            drivers,
            scheduler,
            bus,
            ..
        } = self;
        let dispatch = scheduler.poll(&mut |key| {
            drivers
                .get_mut(key.driver.0)
                .is_some_and(|driver| driver.poll_readable(key.device))
        });
        let Some(dispatch) = dispatch else {
            return Ok(false);
        };
        Self::dispatch(drivers, scheduler, bus, dispatch)?;
        Ok(true)
    }

    #[tracing::instrument(skip(drivers, scheduler, bus), fields(key = %dispatch.key))]
    fn dispatch(
        drivers: &mut [Box<dyn Driver>],
        scheduler: &mut Scheduler,
        bus: &mut SessionBus,
        dispatch: Dispatch,
    ) -> Result<(), DriverError> {
        let key = dispatch.key;
        let Some(driver) = drivers.get_mut(key.driver.0) else {
            scheduler.deregister(dispatch.token);
            return Err(DriverError::Argument(format!(
                "no driver with id {}",
                key.driver.0
            )));
        };
        let mut feed = Feed::new(key, bus, scheduler);
        let result = driver.receive(key.device, dispatch.readiness, &mut feed);
        if let Err(e) = &result {
            log::error!("{}: acquisition step failed: {}", key, e);
            scheduler.deregister(dispatch.token);
            bus.ensure_end(key);
        }
        result
    }

    /// Poll until no steps remain registered.
    pub fn run(&mut self) -> Result<(), DriverError> {
        while !self.scheduler.is_empty() {
            if !self.iterate()? {
                thread::sleep(self.poll_interval);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{Header, Logic};

    fn key(device: usize) -> StepKey {
        StepKey::new(DriverId(0), DeviceIndex(device))
    }

    fn logic() -> Packet {
        Packet::Logic(Logic {
            time_offset_ps: 0,
            duration_ps: 0,
            unit_size: 1,
            data: vec![0],
        })
    }

    fn recording_bus() -> (SessionBus, Rc<RefCell<Vec<(StepKey, Packet)>>>) {
        let log = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&log);
        let bus = SessionBus::new(move |key: StepKey, packet: &Packet| {
            sink.borrow_mut().push((key, packet.clone()))
        });
        (bus, log)
    }

    #[test]
    fn test_bus_enforces_header_first_end_last() {
        let (mut bus, log) = recording_bus();
        assert!(matches!(
            bus.send(key(0), logic()),
            Err(BusError::OutOfOrder { .. })
        ));
        bus.send(key(0), Packet::Header(Header::logic(1, 8))).unwrap();
        assert!(matches!(
            bus.send(key(0), Packet::Header(Header::logic(1, 8))),
            Err(BusError::OutOfOrder { .. })
        ));
        bus.send(key(0), logic()).unwrap();
        bus.send(key(0), Packet::End).unwrap();
        assert_eq!(bus.send(key(0), Packet::End), Err(BusError::StreamClosed(key(0))));
        assert!(bus.send(key(0), logic()).is_err());

        let kinds: Vec<_> = log.borrow().iter().map(|(_, p)| p.kind()).collect();
        assert_eq!(kinds, vec!["header", "logic", "end"]);
    }

    #[test]
    fn test_streams_are_independent() {
        let (mut bus, log) = recording_bus();
        bus.send(key(0), Packet::Header(Header::logic(1, 8))).unwrap();
        bus.send(key(1), Packet::Header(Header::logic(1, 8))).unwrap();
        bus.send(key(1), Packet::End).unwrap();
        assert!(bus.is_open(key(0)));
        assert!(!bus.is_open(key(1)));
        bus.ensure_end(key(0));
        bus.ensure_end(key(0));
        assert_eq!(log.borrow().len(), 4);

        // A closed stream may be reopened by a new acquisition.
        bus.send(key(1), Packet::Header(Header::logic(1, 8))).unwrap();
        assert!(bus.is_open(key(1)));
    }

    #[test]
    fn test_feed_routes_to_its_stream() {
        let (mut bus, log) = recording_bus();
        let mut scheduler = Scheduler::new();
        let mut feed = Feed::new(key(0), &mut bus, &mut scheduler);
        feed.send(Packet::Header(Header::logic(1, 8))).unwrap();
        let token = feed.register(Source::AlwaysReady, None);
        assert!(feed.is_open());
        assert!(feed.deregister(token));
        feed.send_as(DeviceIndex(3), Packet::Header(Header::logic(1, 8)))
            .unwrap();
        drop(feed);
        assert_eq!(log.borrow()[1].0, key(3));
    }
}
