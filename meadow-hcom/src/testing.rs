//! In-process fake Meadow device for session and transfer tests.
//!
//! The device decodes host frames with the real codec and hands each one to
//! a test-supplied handler, whose replies are encoded and released to the
//! reader after an optional delay.

use {
    crate::{
        protocol::{Frame, FrameAccumulator, FrameCodec, HcomCodecV1, ResponseType, frame::HEADER_SIZE, slip},
        session::{DeviceMessage, Session, SessionConfig},
    },
    parking_lot::Mutex,
    std::{
        collections::VecDeque,
        io::{self, Read, Write},
        sync::Arc,
        time::{Duration, Instant},
    },
};

/// One frame the fake device sends back.
pub(crate) struct Reply {
    frame: Frame,
    delay: Duration,
    corrupt: bool,
}

impl Reply {
    /// A reply to `request` carrying `text`.
    pub(crate) fn to(request: &Frame, kind: ResponseType, text: &str) -> Self {
        Self {
            frame: Frame::new(request.header.sequence, kind.code(), 0, text.as_bytes().to_vec()),
            delay: Duration::ZERO,
            corrupt: false,
        }
    }

    /// A plain acceptance of `request`.
    pub(crate) fn accepted(request: &Frame) -> Self {
        Self::to(request, ResponseType::TextAccepted, "")
    }

    /// Output the device emits on its own.
    pub(crate) fn unsolicited(kind: ResponseType, text: &str) -> Self {
        Self {
            frame: Frame::new(0, kind.code(), 0, text.as_bytes().to_vec()),
            delay: Duration::ZERO,
            corrupt: false,
        }
    }

    /// Address the reply to a different sequence number.
    pub(crate) fn with_sequence(mut self, sequence: u16) -> Self {
        self.frame.header.sequence = sequence;
        self
    }

    /// Release the reply only after `delay`.
    pub(crate) fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Damage the reply so its checksum no longer matches.
    pub(crate) fn corrupted(mut self) -> Self {
        self.corrupt = true;
        self
    }
}

type Handler = Box<dyn FnMut(&Frame) -> Vec<Reply> + Send>;

struct DeviceState {
    codec: HcomCodecV1,
    accumulator: FrameAccumulator,
    handler: Handler,
    outbound: Vec<(Instant, Vec<u8>)>,
    inbound: VecDeque<u8>,
    received: Vec<Frame>,
    disconnected: bool,
}

impl DeviceState {
    fn encode(&self, reply: &Reply) -> Vec<u8> {
        let bytes = self
            .codec
            .encode(&reply.frame)
            .expect("reply frame encodes");
        if !reply.corrupt {
            return bytes;
        }
        let mut raw = slip::decode(&bytes).expect("own frame decodes");
        raw[HEADER_SIZE - 1] ^= 0x40;
        slip::encode(&raw)
    }
}

/// Shared handle to a fake device; clones talk to the same device.
#[derive(Clone)]
pub(crate) struct FakeDevice {
    state: Arc<Mutex<DeviceState>>,
}

impl FakeDevice {
    /// A device answering every host frame through `handler`.
    pub(crate) fn new<H>(handler: H) -> Self
    where
        H: FnMut(&Frame) -> Vec<Reply> + Send + 'static,
    {
        let _ = env_logger::builder()
            .is_test(true)
            .try_init();
        let codec = HcomCodecV1;
        Self {
            state: Arc::new(Mutex::new(DeviceState {
                accumulator: FrameAccumulator::for_codec(&codec),
                codec,
                handler: Box::new(handler),
                outbound: Vec::new(),
                inbound: VecDeque::new(),
                received: Vec::new(),
                disconnected: false,
            })),
        }
    }

    /// Open a session wired to this device.
    pub(crate) fn open_session<F>(&self, observer: F) -> Session
    where
        F: Fn(DeviceMessage) + Send + Sync + 'static,
    {
        self.open_session_with(SessionConfig::default(), observer)
    }

    /// Open a session wired to this device with custom settings.
    pub(crate) fn open_session_with<F>(&self, config: SessionConfig, observer: F) -> Session
    where
        F: Fn(DeviceMessage) + Send + Sync + 'static,
    {
        Session::from_io(
            "fake",
            FakeReader {
                state: Arc::clone(&self.state),
            },
            FakeWriter {
                state: Arc::clone(&self.state),
            },
            config,
            observer,
        )
        .expect("reader thread starts")
    }

    /// Every frame the host has sent so far.
    pub(crate) fn received(&self) -> Vec<Frame> {
        self.state
            .lock()
            .received
            .clone()
    }

    /// Type codes of every frame the host has sent so far.
    pub(crate) fn received_types(&self) -> Vec<u16> {
        self.received()
            .iter()
            .map(|f| f.header.type_code)
            .collect()
    }

    /// Put raw bytes on the line immediately.
    pub(crate) fn inject_raw(&self, bytes: &[u8]) {
        self.state
            .lock()
            .inbound
            .extend(bytes);
    }

    /// Simulate the USB cable being pulled.
    pub(crate) fn disconnect(&self) {
        self.state
            .lock()
            .disconnected = true;
    }
}

struct FakeReader {
    state: Arc<Mutex<DeviceState>>,
}

impl Read for FakeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.disconnected {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device unplugged"));
            }

            let now = Instant::now();
            state
                .outbound
                .sort_by_key(|(at, _)| *at);
            let due = state
                .outbound
                .iter()
                .take_while(|(at, _)| *at <= now)
                .count();
            for (_, bytes) in state.outbound.drain(..due) {
                state.inbound.extend(bytes);
            }

            if !state.inbound.is_empty() {
                let n = buf.len().min(state.inbound.len());
                for (slot, byte) in buf.iter_mut().zip(state.inbound.drain(..n)) {
                    *slot = byte;
                }
                return Ok(n);
            }
        }
        std::thread::sleep(Duration::from_millis(1));
        Err(io::Error::new(io::ErrorKind::TimedOut, "no data"))
    }
}

struct FakeWriter {
    state: Arc<Mutex<DeviceState>>,
}

impl Write for FakeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.disconnected {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device unplugged"));
        }

        for body in state.accumulator.push(buf) {
            let Ok(frame) = state.codec.decode(&body) else {
                continue;
            };
            let replies = (state.handler)(&frame);
            state.received.push(frame);
            let now = Instant::now();
            for reply in replies {
                let bytes = state.encode(&reply);
                state
                    .outbound
                    .push((now + reply.delay, bytes));
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
