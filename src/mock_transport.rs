//! In-memory transport for exercising drivers without hardware.
//!
//! [`new`] returns a connected pair: the [`MockTransport`] is handed to the
//! code under test, the [`MockPort`] stays with the test and scripts the
//! device side (queue bytes to read, answer specific writes, limit write
//! sizes) and inspects what the driver did.
//!
//! ```rust
//! use la_capture::mock_transport;
//! use la_capture::transport::Transport;
//!
//! let (mut transport, port) = mock_transport::new();
//! port.reply_to_write(&[0x02], b"1SLO");
//! transport.write(&[0x02]).unwrap();
//! let mut buf = [0u8; 4];
//! assert_eq!(transport.read(&mut buf).unwrap(), 4);
//! assert_eq!(&buf, b"1SLO");
//! ```

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::transport::{PortDescriptor, PortSettings, Transport, TransportError, TransportOpener};

#[derive(Debug, Default)]
struct MockState {
    rx: VecDeque<u8>,
    writes: Vec<Vec<u8>>,
    replies: Vec<(Vec<u8>, Vec<u8>)>,
    write_limit: Option<usize>,
    read_chunk: Option<usize>,
    fail_reads: bool,
    closed: bool,
    purges: usize,
    resets: usize,
    closes: usize,
    restores: usize,
    opens: usize,
    settings: Option<PortSettings>,
}

/// Driver-facing end.
#[derive(Debug, Clone)]
pub struct MockTransport {
    state: Rc<RefCell<MockState>>,
}

/// Test-facing end.
#[derive(Debug, Clone)]
pub struct MockPort {
    state: Rc<RefCell<MockState>>,
}

pub fn new() -> (MockTransport, MockPort) {
    let state = Rc::new(RefCell::new(MockState::default()));
    (
        MockTransport {
            state: Rc::clone(&state),
        },
        MockPort { state },
    )
}

impl MockPort {
    /// Another driver-facing handle onto the same port.
    pub fn transport(&self) -> MockTransport {
        MockTransport {
            state: Rc::clone(&self.state),
        }
    }

    /// Queue bytes for the driver to read.
    pub fn push_rx(&self, data: &[u8]) {
        self.state.borrow_mut().rx.extend(data.iter().copied());
    }

    /// Whenever a single write call carries exactly `request`, queue `response`.
    pub fn reply_to_write(&self, request: &[u8], response: &[u8]) {
        self.state
            .borrow_mut()
            .replies
            .push((request.to_vec(), response.to_vec()));
    }

    /// Accept at most `limit` bytes per write call.
    pub fn set_write_limit(&self, limit: Option<usize>) {
        self.state.borrow_mut().write_limit = limit;
    }

    /// Return at most `chunk` bytes per read call.
    pub fn set_read_chunk(&self, chunk: Option<usize>) {
        self.state.borrow_mut().read_chunk = chunk;
    }

    pub fn fail_reads(&self, fail: bool) {
        self.state.borrow_mut().fail_reads = fail;
    }

    /// Everything written so far, concatenated.
    pub fn written(&self) -> Vec<u8> {
        self.state.borrow().writes.concat()
    }

    /// Individual write calls.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.state.borrow().writes.clone()
    }

    pub fn clear_writes(&self) {
        self.state.borrow_mut().writes.clear();
    }

    pub fn pending_rx(&self) -> usize {
        self.state.borrow().rx.len()
    }

    pub fn purge_count(&self) -> usize {
        self.state.borrow().purges
    }

    pub fn reset_count(&self) -> usize {
        self.state.borrow().resets
    }

    pub fn close_count(&self) -> usize {
        self.state.borrow().closes
    }

    pub fn restore_count(&self) -> usize {
        self.state.borrow().restores
    }

    pub fn open_count(&self) -> usize {
        self.state.borrow().opens
    }

    pub fn is_closed(&self) -> bool {
        self.state.borrow().closed
    }

    /// Settings of the most recent open through a [`MockOpener`].
    pub fn settings(&self) -> Option<PortSettings> {
        self.state.borrow().settings
    }
}

impl Transport for MockTransport {
    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        let mut state = self.state.borrow_mut();
        if state.closed {
            return Err(TransportError::Closed);
        }
        let accepted = state.write_limit.map_or(data.len(), |limit| limit.min(data.len()));
        let chunk = data[..accepted].to_vec();
        let response = state
            .replies
            .iter()
            .find(|(request, _)| *request == chunk)
            .map(|(_, response)| response.clone());
        if let Some(response) = response {
            state.rx.extend(response);
        }
        state.writes.push(chunk);
        Ok(accepted)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let mut state = self.state.borrow_mut();
        if state.closed {
            return Err(TransportError::Closed);
        }
        if state.fail_reads {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "mock read failure",
            )));
        }
        let limit = state.read_chunk.unwrap_or(buf.len()).min(buf.len());
        let count = limit.min(state.rx.len());
        for (dst, src) in buf.iter_mut().zip(state.rx.drain(..count)) {
            *dst = src;
        }
        Ok(count)
    }

    fn bytes_available(&mut self) -> Result<usize, TransportError> {
        let state = self.state.borrow();
        if state.closed {
            return Err(TransportError::Closed);
        }
        Ok(state.rx.len())
    }

    fn purge(&mut self) -> Result<(), TransportError> {
        let mut state = self.state.borrow_mut();
        state.purges += 1;
        state.rx.clear();
        Ok(())
    }

    fn reset(&mut self) -> Result<(), TransportError> {
        self.state.borrow_mut().resets += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        let mut state = self.state.borrow_mut();
        state.closes += 1;
        state.closed = true;
        Ok(())
    }

    fn restore_settings(&mut self) -> Result<(), TransportError> {
        self.state.borrow_mut().restores += 1;
        Ok(())
    }
}

/// Opener over a fixed set of mock ports.
#[derive(Debug, Clone, Default)]
pub struct MockOpener {
    ports: Vec<(PortDescriptor, MockPort)>,
}

impl MockOpener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_port(mut self, descriptor: PortDescriptor, port: &MockPort) -> Self {
        self.ports.push((descriptor, port.clone()));
        self
    }
}

impl TransportOpener for MockOpener {
    fn list_ports(&self) -> Result<Vec<PortDescriptor>, TransportError> {
        Ok(self.ports.iter().map(|(d, _)| d.clone()).collect())
    }

    fn open(
        &self,
        port: &str,
        settings: &PortSettings,
    ) -> Result<Box<dyn Transport>, TransportError> {
        let (_, mock) = self
            .ports
            .iter()
            .find(|(d, _)| d.port == port)
            .ok_or_else(|| TransportError::PortNotFound(port.to_string()))?;
        {
            let mut state = mock.state.borrow_mut();
            state.closed = false;
            state.opens += 1;
            state.settings = Some(*settings);
        }
        Ok(Box::new(mock.transport()))
    }
}
