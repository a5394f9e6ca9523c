//! Transport session over one serial connection.
//!
//! The protocol is not multiplexed: a session carries at most one request
//! at a time. A background thread reads and decodes every inbound frame.
//! A frame whose sequence number matches the pending request goes to the
//! waiting caller. Everything else goes to the device message observer
//! registered at open time: unsolicited trace and stdout output, replies
//! that arrive after their request timed out or was cancelled, and frames
//! that failed to decode.
//!
//! ```text
//!  caller ──send──▶ pending slot ──frame──▶ port
//!                        ▲
//!  reader thread ──match─┘──no match──▶ observer
//! ```

mod commands;

use {
    crate::{
        error::{FrameError, TransportError},
        protocol::{FrameAccumulator, FrameCodec, HcomCodecV1, Request, SerialResponse, UNSOLICITED_SEQUENCE},
    },
    log::{debug, info, trace, warn},
    parking_lot::Mutex,
    std::{
        fmt,
        io::{self, Read, Write},
        sync::{
            Arc,
            atomic::{AtomicBool, AtomicU16, Ordering},
        },
        thread::JoinHandle,
        time::Duration,
    },
    tokio::sync::mpsc,
    tokio_util::sync::CancellationToken,
};

#[cfg(feature = "native")]
use crate::port::{NativePort, Port, SerialConfig};

/// Timeout applied by the typed device commands.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Size of a single read from the port.
const READ_BUFFER_SIZE: usize = 1024;

/// Session settings.
#[derive(Clone)]
pub struct SessionConfig {
    /// Timeout for the typed device commands.
    pub request_timeout: Duration,
    /// Wire encoding spoken by the device.
    pub codec: Arc<dyn FrameCodec>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            codec: Arc::new(HcomCodecV1),
        }
    }
}

impl SessionConfig {
    /// Set the timeout for the typed device commands.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Use a different frame codec.
    #[must_use]
    pub fn with_codec(mut self, codec: Arc<dyn FrameCodec>) -> Self {
        self.codec = codec;
        self
    }
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("request_timeout", &self.request_timeout)
            .field(
                "codec_version",
                &self
                    .codec
                    .version(),
            )
            .finish()
    }
}

/// Inbound traffic not claimed by a pending request.
#[derive(Debug, Clone)]
pub enum DeviceMessage {
    /// A decoded frame with no waiter: device output or a late reply.
    Unsolicited(SerialResponse),
    /// A frame that failed to decode and was discarded.
    Malformed(FrameError),
}

type Observer = Arc<dyn Fn(DeviceMessage) + Send + Sync>;
type Reply = Result<SerialResponse, FrameError>;

struct Pending {
    sequence: u16,
    tx: mpsc::UnboundedSender<Reply>,
}

/// State shared between the session and its reader thread.
struct Shared {
    codec: Arc<dyn FrameCodec>,
    pending: Mutex<Option<Pending>>,
    closed: AtomicBool,
    observer: Observer,
}

impl Shared {
    fn is_closed(&self) -> bool {
        self.closed
            .load(Ordering::Acquire)
    }

    /// Mark the port dead. A pending waiter sees its channel close.
    fn mark_closed(&self) {
        self.closed
            .store(true, Ordering::Release);
        self.pending
            .lock()
            .take();
    }

    fn dispatch(&self, body: &[u8]) {
        match SerialResponse::decode(self.codec.as_ref(), body) {
            Ok(response) => {
                let sequence = response.sequence();
                trace!(
                    "<- {:?} seq={sequence} ({} bytes)",
                    response.response_type(),
                    response
                        .payload()
                        .len()
                );
                let unclaimed = {
                    let pending = self
                        .pending
                        .lock();
                    match pending.as_ref() {
                        Some(p) if sequence != UNSOLICITED_SEQUENCE && p.sequence == sequence => p
                            .tx
                            .send(Ok(response))
                            .err()
                            .and_then(|e| e.0.ok()),
                        _ => Some(response),
                    }
                };
                if let Some(response) = unclaimed {
                    if !response.is_unsolicited() {
                        debug!("Reply seq={} has no waiter", response.sequence());
                    }
                    (self.observer)(DeviceMessage::Unsolicited(response));
                }
            },
            Err(err) => {
                debug!("Discarding inbound frame: {err}");
                // A damaged reply whose header still names the pending
                // request fails that request fast. Any other bad frame only
                // reaches the observer.
                if matches!(err, FrameError::ChecksumInvalid { .. }) {
                    let claimed = self
                        .codec
                        .peek_sequence(body)
                        .filter(|&seq| seq != UNSOLICITED_SEQUENCE);
                    if let Some(seq) = claimed {
                        let pending = self
                            .pending
                            .lock();
                        if let Some(p) = pending
                            .as_ref()
                            .filter(|p| p.sequence == seq)
                        {
                            let _ = p
                                .tx
                                .send(Err(err.clone()));
                        }
                    }
                }
                (self.observer)(DeviceMessage::Malformed(err));
            },
        }
    }
}

/// Hands out non-zero, wrapping sequence numbers.
#[derive(Debug)]
struct SequenceCounter(AtomicU16);

impl SequenceCounter {
    fn starting_at(first: u16) -> Self {
        Self(AtomicU16::new(first))
    }

    fn next(&self) -> u16 {
        loop {
            let sequence = self
                .0
                .fetch_add(1, Ordering::Relaxed);
            if sequence != UNSOLICITED_SEQUENCE {
                return sequence;
            }
        }
    }
}

/// Clears the pending slot when a request ends, including when its future
/// is dropped mid-flight.
struct PendingGuard<'a> {
    shared: &'a Shared,
    sequence: u16,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let mut pending = self
            .shared
            .pending
            .lock();
        if pending
            .as_ref()
            .is_some_and(|p| p.sequence == self.sequence)
        {
            *pending = None;
        }
    }
}

/// An open HCom connection to one device.
pub struct Session {
    name: String,
    config: SessionConfig,
    shared: Arc<Shared>,
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    sequence: SequenceCounter,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Open the serial port described by `serial` and start reading.
    ///
    /// `observer` receives every inbound frame that is not the reply to a
    /// pending request. It runs on the reader thread and must not block.
    #[cfg(feature = "native")]
    pub fn open<F>(serial: &SerialConfig, config: SessionConfig, observer: F) -> crate::Result<Self>
    where
        F: Fn(DeviceMessage) + Send + Sync + 'static,
    {
        let mut port = NativePort::open(serial)?;
        port.clear_buffers()?;
        let reader = port.try_clone_port()?;
        info!(
            "Opened {} at {} baud (read poll {:?})",
            port.name(),
            port.baud_rate(),
            port.timeout()
        );
        let name = port
            .name()
            .to_string();
        Ok(Self::from_io(name, reader, port, config, observer)?)
    }

    /// Run a session over an arbitrary reader and writer pair.
    ///
    /// Reads must time out periodically (`ErrorKind::TimedOut` or
    /// `WouldBlock`) so the reader thread can notice [`Session::close`].
    pub fn from_io<R, W, F>(
        name: impl Into<String>,
        reader: R,
        writer: W,
        config: SessionConfig,
        observer: F,
    ) -> io::Result<Self>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
        F: Fn(DeviceMessage) + Send + Sync + 'static,
    {
        let name = name.into();
        let shared = Arc::new(Shared {
            codec: Arc::clone(&config.codec),
            pending: Mutex::new(None),
            closed: AtomicBool::new(false),
            observer: Arc::new(observer),
        });

        let reader_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name(format!("hcom-{name}"))
            .spawn(move || read_loop(reader, &reader_shared))?;

        Ok(Self {
            name,
            config,
            shared,
            writer: Arc::new(Mutex::new(Box::new(writer))),
            sequence: SequenceCounter::starting_at(1),
            reader: Mutex::new(Some(handle)),
        })
    }

    /// Port name this session was opened on.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Session settings.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Whether the port is still usable.
    pub fn is_open(&self) -> bool {
        !self
            .shared
            .is_closed()
    }

    /// Send a request and wait up to `timeout` for its reply.
    ///
    /// Fails with [`TransportError::Busy`] if another request is pending.
    /// Dropping the returned future cancels the request; a reply arriving
    /// later is delivered to the observer.
    pub async fn send(
        &self,
        request: Request,
        timeout: Duration,
    ) -> Result<SerialResponse, TransportError> {
        self.send_with_cancel(request, timeout, &CancellationToken::new())
            .await
    }

    /// [`Session::send`] that also stops when `cancel` fires.
    pub async fn send_with_cancel(
        &self,
        request: Request,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<SerialResponse, TransportError> {
        let mut replies = self
            .exchange(request, timeout, cancel, |_| true)
            .await?;
        replies
            .pop()
            .ok_or(TransportError::Timeout(timeout))
    }

    /// Send a request answered by several frames.
    ///
    /// Collects every reply carrying the request's sequence number until
    /// `is_final` returns true for one of them. `timeout` bounds the whole
    /// exchange.
    pub async fn send_collect<F>(
        &self,
        request: Request,
        timeout: Duration,
        is_final: F,
    ) -> Result<Vec<SerialResponse>, TransportError>
    where
        F: FnMut(&SerialResponse) -> bool,
    {
        self.send_collect_with_cancel(request, timeout, &CancellationToken::new(), is_final)
            .await
    }

    /// [`Session::send_collect`] that also stops when `cancel` fires.
    pub async fn send_collect_with_cancel<F>(
        &self,
        request: Request,
        timeout: Duration,
        cancel: &CancellationToken,
        is_final: F,
    ) -> Result<Vec<SerialResponse>, TransportError>
    where
        F: FnMut(&SerialResponse) -> bool,
    {
        self.exchange(request, timeout, cancel, is_final)
            .await
    }

    async fn exchange<F>(
        &self,
        request: Request,
        timeout: Duration,
        cancel: &CancellationToken,
        mut is_final: F,
    ) -> Result<Vec<SerialResponse>, TransportError>
    where
        F: FnMut(&SerialResponse) -> bool,
    {
        if self
            .shared
            .is_closed()
        {
            return Err(TransportError::PortClosed);
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let sequence = {
            let mut pending = self
                .shared
                .pending
                .lock();
            if pending.is_some() {
                return Err(TransportError::Busy);
            }
            let sequence = self
                .sequence
                .next();
            *pending = Some(Pending { sequence, tx });
            sequence
        };
        let _guard = PendingGuard {
            shared: &self.shared,
            sequence,
        };

        let kind = request.kind();
        let bytes = self
            .shared
            .codec
            .encode(&request.into_frame(sequence))?;
        debug!("-> {kind:?} seq={sequence} ({} bytes)", bytes.len());
        self.write_frame(bytes)
            .await?;

        let deadline = tokio::time::Instant::now() + timeout;
        let mut replies = Vec::new();
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!("{kind:?} seq={sequence} cancelled");
                    return Err(TransportError::Cancelled);
                },
                () = tokio::time::sleep_until(deadline) => {
                    debug!("{kind:?} seq={sequence} timed out after {timeout:?}");
                    return Err(TransportError::Timeout(timeout));
                },
                reply = rx.recv() => match reply {
                    Some(Ok(response)) => {
                        let done = is_final(&response);
                        replies.push(response);
                        if done {
                            return Ok(replies);
                        }
                    },
                    Some(Err(err)) => return Err(TransportError::Frame(err)),
                    None => return Err(TransportError::PortClosed),
                },
            }
        }
    }

    async fn write_frame(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        let writer = Arc::clone(&self.writer);
        tokio::task::spawn_blocking(move || {
            let mut writer = writer.lock();
            writer.write_all(&bytes)?;
            writer.flush()
        })
        .await
        .map_err(|e| TransportError::Io(io::Error::other(e)))??;
        Ok(())
    }

    /// Stop the reader and release the port, blocking until the reader
    /// thread has exited. Idempotent.
    ///
    /// From async code prefer [`Session::shutdown`].
    pub fn close(&self) {
        if let Some(handle) = self.stop_reader() {
            join_reader(handle, &self.name);
        }
    }

    /// [`Session::close`] that waits for the reader thread off the executor.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.stop_reader() {
            let name = self
                .name
                .clone();
            if tokio::task::spawn_blocking(move || join_reader(handle, &name))
                .await
                .is_err()
            {
                warn!("Joining the reader for {} failed", self.name);
            }
        }
    }

    /// Mark the session closed and take the reader handle, unless the
    /// caller is the reader thread itself.
    fn stop_reader(&self) -> Option<JoinHandle<()>> {
        if !self
            .shared
            .closed
            .swap(true, Ordering::AcqRel)
        {
            info!("Closing session on {}", self.name);
        }
        self.shared
            .pending
            .lock()
            .take();

        self.reader
            .lock()
            .take()
            .filter(|handle| {
                handle
                    .thread()
                    .id()
                    != std::thread::current().id()
            })
    }
}

fn join_reader(handle: JoinHandle<()>, name: &str) {
    if handle
        .join()
        .is_err()
    {
        warn!("Reader thread for {name} panicked");
    }
}

impl Drop for Session {
    /// Signals the reader to stop without waiting for it; it exits after its
    /// current read poll.
    fn drop(&mut self) {
        drop(self.stop_reader());
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.name)
            .field("open", &self.is_open())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn read_loop<R: Read>(mut reader: R, shared: &Shared) {
    let mut accumulator = FrameAccumulator::for_codec(shared.codec.as_ref());
    let mut buf = [0u8; READ_BUFFER_SIZE];

    while !shared.is_closed() {
        match reader.read(&mut buf) {
            Ok(0) => {
                warn!("Serial port reached end of stream");
                break;
            },
            Ok(n) => {
                trace!("<- {n} raw bytes");
                for body in accumulator.push(&buf[..n]) {
                    shared.dispatch(&body);
                }
            },
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) => {},
            Err(e) => {
                warn!("Serial read failed: {e}");
                break;
            },
        }
    }

    shared.mark_closed();
    debug!("Reader thread exiting");
}
