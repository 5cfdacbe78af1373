//! Scripted stand-ins for the device and the clock.

use std::{
    cell::{Cell, RefCell},
    collections::{HashMap, VecDeque},
    time::Duration,
};

use crate::{
    clock::Clock,
    device::{DFU_DNLOAD, IdentityReader, Transport, TransportError},
    transfer::CHUNK_SIZE,
};

/// Deterministic xorshift bytes, incompressible enough for LZ4.
pub fn pseudo_random_bytes(seed: u64, len: usize) -> Vec<u8> {
    let mut state = seed.wrapping_mul(0x9e37_79b9_7f4a_7c15) | 1;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            (state >> 32) as u8
        })
        .collect()
}

/// Time only moves when something sleeps.
#[derive(Default)]
pub struct ManualClock {
    now: Cell<Duration>,
    sleeps: RefCell<Vec<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.borrow().clone()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        self.now.get()
    }

    fn sleep(&self, duration: Duration) {
        self.now.set(self.now.get() + duration);
        self.sleeps.borrow_mut().push(duration);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRequest {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub data: Vec<u8>,
    /// Bytes acknowledged before this request was issued.
    pub offset: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Reset,
    Close,
    Reopen(u16, u16),
    WaitReady,
}

/// A DFU device which accepts every download unless told otherwise.
#[derive(Default)]
pub struct FakeTransport {
    pub requests: Vec<ControlRequest>,
    pub events: Vec<SessionEvent>,
    pub fail_reset: bool,
    pub reopen_error: Option<TransportError>,
    pub ready_error: Option<TransportError>,
    scripts: HashMap<usize, VecDeque<Result<usize, rusb::Error>>>,
    received: Vec<u8>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues the outcome of the next attempt at sending chunk `chunk`.
    pub fn script_download(&mut self, chunk: usize, outcome: Result<usize, rusb::Error>) {
        self.scripts.entry(chunk).or_default().push_back(outcome);
    }

    pub fn downloads(&self) -> impl Iterator<Item = &ControlRequest> {
        self.requests
            .iter()
            .filter(|request| request.request == DFU_DNLOAD)
    }

    /// Everything the device acknowledged, in order.
    pub fn received(&self) -> Vec<u8> {
        self.received.clone()
    }
}

impl Transport for FakeTransport {
    fn write_control(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
    ) -> Result<usize, rusb::Error> {
        self.requests.push(ControlRequest {
            request_type,
            request,
            value,
            index,
            data: data.to_vec(),
            offset: self.received.len(),
        });

        if request != DFU_DNLOAD {
            return Ok(0);
        }

        let chunk = self.received.len() / CHUNK_SIZE;
        let outcome = self
            .scripts
            .get_mut(&chunk)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Ok(data.len()));

        if matches!(outcome, Ok(amount) if amount == data.len()) {
            self.received.extend_from_slice(data);
        }
        outcome
    }

    fn reset(&mut self) -> Result<(), TransportError> {
        self.events.push(SessionEvent::Reset);
        if self.fail_reset {
            return Err(TransportError::Reset(rusb::Error::NotFound));
        }
        Ok(())
    }

    fn close(&mut self) {
        self.events.push(SessionEvent::Close);
    }

    fn reopen(&mut self, vendor_id: u16, product_id: u16) -> Result<(), TransportError> {
        self.events.push(SessionEvent::Reopen(vendor_id, product_id));
        match self.reopen_error.take() {
            Some(why) => Err(why),
            None => Ok(()),
        }
    }

    fn wait_ready(&mut self) -> Result<(), TransportError> {
        self.events.push(SessionEvent::WaitReady);
        match self.ready_error.take() {
            Some(why) => Err(why),
            None => Ok(()),
        }
    }
}

/// Reports `before` until the clock reaches `boot_at`, then a PongoOS serial.
pub struct ScriptedReader<'a> {
    clock: &'a ManualClock,
    boot_at: Option<Duration>,
    before: Option<String>,
    pub reads: usize,
}

impl<'a> ScriptedReader<'a> {
    pub fn booting_at(clock: &'a ManualClock, boot_at: Duration) -> Self {
        Self {
            clock,
            boot_at: Some(boot_at),
            before: None,
            reads: 0,
        }
    }

    pub fn never_booting(clock: &'a ManualClock) -> Self {
        Self {
            clock,
            boot_at: None,
            before: None,
            reads: 0,
        }
    }

    pub fn with_identity(mut self, identity: &str) -> Self {
        self.before = Some(identity.to_owned());
        self
    }
}

impl IdentityReader for ScriptedReader<'_> {
    fn identity(&mut self) -> Option<String> {
        self.reads += 1;
        match self.boot_at {
            Some(boot_at) if self.clock.now() >= boot_at => {
                Some("SRTG:[PongoOS-2.6.2-6cfdf26]".to_owned())
            }
            _ => self.before.clone(),
        }
    }
}

/// A session that is both transport and identity reader, as the USB session is.
pub struct FakeSession<'a> {
    pub transport: FakeTransport,
    pub reader: ScriptedReader<'a>,
}

impl Transport for FakeSession<'_> {
    fn write_control(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
    ) -> Result<usize, rusb::Error> {
        self.transport
            .write_control(request_type, request, value, index, data)
    }

    fn reset(&mut self) -> Result<(), TransportError> {
        self.transport.reset()
    }

    fn close(&mut self) {
        self.transport.close()
    }

    fn reopen(&mut self, vendor_id: u16, product_id: u16) -> Result<(), TransportError> {
        self.transport.reopen(vendor_id, product_id)
    }

    fn wait_ready(&mut self) -> Result<(), TransportError> {
        self.transport.wait_ready()
    }
}

impl IdentityReader for FakeSession<'_> {
    fn identity(&mut self) -> Option<String> {
        self.reader.identity()
    }
}
