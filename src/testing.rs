//! Test doubles for pins
//!
//! `MockPin` records every write into a trace shared between pins, so tests
//! can check the exact order of clock and data transitions. Its edge source
//! is one end of a socket pair: writing to the other end makes it readable,
//! which lets the dispatcher's real `poll(2)` loop run in tests.

use crate::error::{GpioError, Result};
use crate::pin::{Direction, Edge, EdgeSource, PinDevice};
use parking_lot::Mutex;
use std::io::{ErrorKind, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinOp {
    Export,
    Unexport,
    Direction(Direction),
    Value(u8),
    Edge(Edge),
    ActiveLow(bool),
}

pub type Trace = Arc<Mutex<Vec<(String, PinOp)>>>;

pub fn trace() -> Trace {
    Arc::new(Mutex::new(Vec::new()))
}

#[derive(Debug)]
struct MockState {
    exported: bool,
    direction: Direction,
    value: u8,
    edge: Edge,
    active_low: bool,
}

pub struct MockPin {
    number: u32,
    name: String,
    state: Mutex<MockState>,
    trace: Trace,
    feeder: Mutex<Option<UnixStream>>,
    armed: Mutex<Option<Receiver<()>>>,
    pending: Mutex<Option<String>>,
}

impl MockPin {
    pub fn new(number: u32, name: &str, trace: Trace) -> Self {
        MockPin {
            number,
            name: name.to_string(),
            state: Mutex::new(MockState {
                exported: false,
                direction: Direction::Input,
                value: 0,
                edge: Edge::None,
                active_low: false,
            }),
            trace,
            feeder: Mutex::new(None),
            armed: Mutex::new(None),
            pending: Mutex::new(None),
        }
    }

    /// An exported input line.
    pub fn input(number: u32, name: &str) -> Self {
        let pin = MockPin::new(number, name, trace());
        pin.state.lock().exported = true;
        pin
    }

    /// Block until the edge source has had its first (discarded) read, so
    /// anything fired afterwards is seen as a new edge.
    pub fn wait_armed(&self) {
        let armed = self.armed.lock().take().expect("no edge source open");
        armed
            .recv_timeout(Duration::from_secs(5))
            .expect("edge source never read");
    }

    /// Leave `value` waiting in the next edge source before any reader
    /// exists, like a line whose state changed before anyone was watching.
    pub fn set_pending(&self, value: &str) {
        *self.pending.lock() = Some(value.to_string());
    }

    /// Simulate a transition: the line now reads `value`.
    pub fn fire(&self, value: &str) {
        let mut feeder = self.feeder.lock();
        let stream = feeder.as_mut().expect("no edge source open");
        writeln!(stream, "{}", value).expect("feed edge source");
    }

    /// Close the feeding end so the next read hits end of file.
    pub fn hang_up(&self) {
        self.feeder.lock().take();
    }

    fn record(&self, op: PinOp) {
        self.trace.lock().push((self.name.clone(), op));
    }
}

impl PinDevice for MockPin {
    fn number(&self) -> u32 {
        self.number
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn exists(&self) -> bool {
        self.state.lock().exported
    }

    fn export(&self) -> Result<()> {
        self.state.lock().exported = true;
        self.record(PinOp::Export);
        Ok(())
    }

    fn unexport(&self) -> Result<()> {
        self.state.lock().exported = false;
        self.record(PinOp::Unexport);
        Ok(())
    }

    fn direction(&self) -> Result<Direction> {
        Ok(self.state.lock().direction)
    }

    fn set_direction(&self, direction: Direction) -> Result<()> {
        self.state.lock().direction = direction;
        self.record(PinOp::Direction(direction));
        Ok(())
    }

    fn value(&self) -> Result<u8> {
        Ok(self.state.lock().value)
    }

    fn set_value(&self, value: u8) -> Result<()> {
        self.state.lock().value = value;
        self.record(PinOp::Value(value));
        Ok(())
    }

    fn edge(&self) -> Result<Edge> {
        Ok(self.state.lock().edge)
    }

    fn set_edge(&self, edge: Edge) -> Result<()> {
        self.state.lock().edge = edge;
        self.record(PinOp::Edge(edge));
        Ok(())
    }

    fn active_low(&self) -> Result<bool> {
        Ok(self.state.lock().active_low)
    }

    fn set_active_low(&self, active_low: bool) -> Result<()> {
        self.state.lock().active_low = active_low;
        self.record(PinOp::ActiveLow(active_low));
        Ok(())
    }

    fn open_edge_source(&self) -> Result<Box<dyn EdgeSource>> {
        let (reader, mut writer) = UnixStream::pair().map_err(GpioError::io("creating socket pair"))?;
        reader
            .set_nonblocking(true)
            .map_err(GpioError::io("setting non-blocking"))?;
        if let Some(value) = self.pending.lock().take() {
            writeln!(writer, "{}", value).map_err(GpioError::io("queueing pending value"))?;
        }
        let (armed_tx, armed_rx) = mpsc::channel();
        *self.feeder.lock() = Some(writer);
        *self.armed.lock() = Some(armed_rx);
        Ok(Box::new(SocketEdgeSource {
            stream: reader,
            armed: Some(armed_tx),
        }))
    }
}

/// Readable whenever a test has fed it a value.
pub struct SocketEdgeSource {
    stream: UnixStream,
    armed: Option<Sender<()>>,
}

impl EdgeSource for SocketEdgeSource {
    fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    fn poll_events(&self) -> libc::c_short {
        libc::POLLIN
    }

    /// Drain everything pending and report the latest line.
    fn read_value(&mut self) -> Result<String> {
        let mut pending = Vec::new();
        let mut buf = [0u8; 64];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => {
                    return Err(GpioError::io("reading mock edge source")(
                        ErrorKind::UnexpectedEof.into(),
                    ))
                }
                Ok(n) => pending.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => return Err(GpioError::io("reading mock edge source")(e)),
            }
        }
        if let Some(armed) = self.armed.take() {
            let _ = armed.send(());
        }
        let text = String::from_utf8_lossy(&pending);
        Ok(text.lines().last().unwrap_or("").to_string())
    }
}
