//! Chunked file transfer to the device.
//!
//! ## Sequence
//!
//! ```text
//! host                                   device
//!  | CRC32 of source (streamed)             |
//!  |---- begin (path, size, crc, addr) ---->|
//!  |<--------------- file start okay -------|
//!  |---- chunk 0 -------------------------->|
//!  |<--------------- accepted --------------|
//!  |  ...  one chunk in flight at a time    |
//!  |---- end ------------------------------>|
//!  |<--------------- accepted --------------|
//! ```
//!
//! Each step is retried on its own after a timeout or corrupted reply. The
//! whole transfer is bounded by a separate overall deadline.

use {
    crate::{
        error::{TransferError, TransportError},
        protocol::{MAX_PAYLOAD_SIZE, Request, RequestType, SerialResponse, crc::crc32_reader},
        session::Session,
    },
    log::{debug, info, warn},
    std::{
        fmt,
        fs::File,
        io::{self, BufReader, Read},
        path::Path,
        time::{Duration, Instant},
    },
    tokio_util::sync::CancellationToken,
};

/// Default chunk size: one full frame payload.
pub const DEFAULT_CHUNK_SIZE: usize = MAX_PAYLOAD_SIZE;

/// Default time to wait for the reply to one step.
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// Default bound on a whole transfer.
pub const DEFAULT_OVERALL_TIMEOUT: Duration = Duration::from_secs(600);

/// Default number of attempts per step.
pub const MAX_STEP_ATTEMPTS: u32 = 3;

/// Where transferred bytes end up on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferTarget {
    /// The flash file system of the primary MCU.
    #[default]
    File,
    /// Raw flash of the ESP32 coprocessor.
    Esp32 {
        /// Flash offset to write at.
        flash_address: u32,
    },
}

impl TransferTarget {
    fn begin_request(self) -> RequestType {
        match self {
            Self::File => RequestType::StartFileTransfer,
            Self::Esp32 { .. } => RequestType::StartEspFileTransfer,
        }
    }

    fn end_request(self) -> RequestType {
        match self {
            Self::File => RequestType::EndFileTransfer,
            Self::Esp32 { .. } => RequestType::EndEspFileTransfer,
        }
    }

    fn flash_address(self) -> u32 {
        match self {
            Self::File => 0,
            Self::Esp32 { flash_address } => flash_address,
        }
    }
}

/// Transfer settings.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Bytes per data chunk; capped at [`MAX_PAYLOAD_SIZE`].
    pub chunk_size: usize,
    /// Time to wait for the reply to one step.
    pub step_timeout: Duration,
    /// Bound on the whole transfer, retries included.
    pub overall_timeout: Duration,
    /// Attempts per step before the transfer is aborted.
    pub max_attempts: u32,
    /// Destination kind.
    pub target: TransferTarget,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            step_timeout: DEFAULT_STEP_TIMEOUT,
            overall_timeout: DEFAULT_OVERALL_TIMEOUT,
            max_attempts: MAX_STEP_ATTEMPTS,
            target: TransferTarget::File,
        }
    }
}

impl TransferConfig {
    /// Set the chunk size.
    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Set the per-step timeout.
    #[must_use]
    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    /// Set the overall timeout.
    #[must_use]
    pub fn with_overall_timeout(mut self, timeout: Duration) -> Self {
        self.overall_timeout = timeout;
        self
    }

    /// Set the attempts per step.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Set the destination kind.
    #[must_use]
    pub fn with_target(mut self, target: TransferTarget) -> Self {
        self.target = target;
        self
    }
}

/// Summary of a completed upload.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct FileTransferResult {
    transfer_time_ms: u64,
    file_size: u64,
    crc32: u32,
    checksum: String,
}

impl FileTransferResult {
    /// Build a result; the checksum string is always 8 lowercase hex digits.
    pub fn new(transfer_time: Duration, file_size: u64, crc32: u32) -> Self {
        Self {
            transfer_time_ms: u64::try_from(transfer_time.as_millis()).unwrap_or(u64::MAX),
            file_size,
            crc32,
            checksum: format!("{crc32:08x}"),
        }
    }

    /// The "no transfer occurred" sentinel.
    pub fn empty() -> Self {
        Self::new(Duration::ZERO, 0, 0)
    }

    /// Whether this is the [`FileTransferResult::empty`] sentinel.
    pub fn is_empty(&self) -> bool {
        *self == Self::empty()
    }

    /// Wall-clock time from the begin request to the final acknowledgement.
    pub fn transfer_time(&self) -> Duration {
        Duration::from_millis(self.transfer_time_ms)
    }

    /// Bytes written.
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// CRC32 of the source file.
    pub fn crc32(&self) -> u32 {
        self.crc32
    }

    /// CRC32 of the source file as 8 lowercase hex digits.
    pub fn checksum(&self) -> &str {
        &self.checksum
    }
}

impl fmt::Display for FileTransferResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} bytes in {} ms (crc {})",
            self.file_size, self.transfer_time_ms, self.checksum
        )
    }
}

#[derive(Debug, Clone, Copy)]
enum Step {
    Begin,
    Chunk(u32),
    End,
}

impl Step {
    fn is_chunk(self) -> bool {
        matches!(self, Self::Chunk(_))
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Begin => f.write_str("begin"),
            Self::Chunk(index) => write!(f, "chunk {index}"),
            Self::End => f.write_str("end"),
        }
    }
}

/// Upload `source` to `destination` on the device.
///
/// `progress` is called with `(bytes_sent, total_bytes)` after the begin
/// step and after every accepted chunk.
pub async fn transfer(
    session: &Session,
    source: &Path,
    destination: &str,
    config: &TransferConfig,
    cancel: &CancellationToken,
    progress: &mut dyn FnMut(u64, u64),
) -> Result<FileTransferResult, TransferError> {
    let path = source.to_path_buf();
    let (crc, size, file) = tokio::task::spawn_blocking(move || checksum_source(&path))
        .await
        .map_err(|e| TransferError::Io(io::Error::other(e)))??;
    info!(
        "Uploading {} ({size} bytes, crc {crc:08x}) to {destination}",
        source.display()
    );

    send_stream(
        session,
        &mut BufReader::new(file),
        size,
        crc,
        destination,
        config,
        cancel,
        progress,
    )
    .await
}

/// Checksum `path`, then reopen it for sending and make sure its size has
/// not moved in between.
fn checksum_source(path: &Path) -> Result<(u32, u64, File), TransferError> {
    let (crc, size) = crc32_reader(BufReader::new(File::open(path)?))?;
    let file = File::open(path)?;
    let current = file
        .metadata()?
        .len();
    if current != size {
        return Err(TransferError::SourceChanged {
            expected: size,
            actual: current,
        });
    }
    Ok((crc, size, file))
}

/// Drive the begin/chunk/end steps for `size` bytes read from `reader`.
///
/// `reader` must yield exactly `size` bytes; anything else means the source
/// changed after `crc` was computed.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn send_stream<R: Read>(
    session: &Session,
    reader: &mut R,
    size: u64,
    crc: u32,
    destination: &str,
    config: &TransferConfig,
    cancel: &CancellationToken,
    progress: &mut dyn FnMut(u64, u64),
) -> Result<FileTransferResult, TransferError> {
    let file_size = u32::try_from(size).map_err(|_| TransferError::FileTooLarge(size))?;
    let target = config.target;
    let chunk_size = config
        .chunk_size
        .clamp(1, MAX_PAYLOAD_SIZE);

    let steps = async {
        let started = Instant::now();
        run_step(
            session,
            &Request::begin_file_write(
                target.begin_request(),
                destination,
                file_size,
                crc,
                target.flash_address(),
            ),
            Step::Begin,
            config,
            cancel,
        )
        .await?;
        progress(0, size);

        let mut buf = vec![0u8; chunk_size];
        let mut sent = 0u64;
        let mut index = 0u32;
        while sent < size {
            let want = usize::try_from(size - sent)
                .unwrap_or(usize::MAX)
                .min(chunk_size);
            let n = read_full(reader, &mut buf[..want])?;
            if n < want {
                return Err(TransferError::SourceChanged {
                    expected: size,
                    actual: sent + n as u64,
                });
            }

            run_step(
                session,
                &Request::file_data_chunk(index, buf[..n].to_vec()),
                Step::Chunk(index),
                config,
                cancel,
            )
            .await?;
            sent += n as u64;
            index += 1;
            progress(sent, size);
        }

        let trailing = io::copy(reader, &mut io::sink())?;
        if trailing > 0 {
            return Err(TransferError::SourceChanged {
                expected: size,
                actual: size + trailing,
            });
        }

        run_step(
            session,
            &Request::end_file_write(target.end_request()),
            Step::End,
            config,
            cancel,
        )
        .await?;

        let result = FileTransferResult::new(started.elapsed(), sent, crc);
        info!("Transfer to {destination} complete: {result}");
        Ok(result)
    };

    tokio::time::timeout(config.overall_timeout, steps)
        .await
        .unwrap_or(Err(TransferError::OverallTimeout(config.overall_timeout)))
}

/// Send one step, retrying it alone on transient failures.
///
/// Only an accepted reply completes a step. Informational replies carrying
/// the step's sequence number are logged while waiting for it.
async fn run_step(
    session: &Session,
    request: &Request,
    step: Step,
    config: &TransferConfig,
    cancel: &CancellationToken,
) -> Result<(), TransferError> {
    let max_attempts = config
        .max_attempts
        .max(1);
    let mut attempt = 1;
    loop {
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        let replies = session
            .send_collect_with_cancel(request.clone(), config.step_timeout, cancel, |r| {
                matches!(
                    r,
                    SerialResponse::TextAccepted(_) | SerialResponse::TextRejected(_)
                )
            })
            .await;
        match replies.map(Vec::into_iter) {
            Ok(mut replies) => {
                let Some(last) = replies.next_back() else {
                    return Err(TransferError::Aborted(TransportError::Timeout(
                        config.step_timeout,
                    )));
                };
                for interim in replies {
                    debug!("{step}: {}", interim.text().unwrap_or_default());
                }
                match last {
                    SerialResponse::TextAccepted(_) => {
                        debug!("{step} accepted");
                        return Ok(());
                    },
                    SerialResponse::TextRejected(message) if attempt > 1 && step.is_chunk() => {
                        // The earlier attempt reached the device and only its
                        // acknowledgement was lost.
                        info!(
                            "{step} refused on attempt {attempt} ({}); already applied",
                            message.text()
                        );
                        return Ok(());
                    },
                    other => {
                        let reason = other
                            .text()
                            .unwrap_or_default();
                        warn!("Device rejected {step}: {reason}");
                        return Err(TransferError::DeviceRejected(reason));
                    },
                }
            },
            Err(TransportError::Cancelled) => return Err(TransferError::Cancelled),
            Err(err) if err.is_retryable() && attempt < max_attempts => {
                warn!("{step} failed: {err} (attempt {attempt}/{max_attempts}), retrying");
                attempt += 1;
            },
            Err(err) => return Err(TransferError::Aborted(err)),
        }
    }
}

fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
