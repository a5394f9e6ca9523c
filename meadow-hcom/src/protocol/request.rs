//! Typed requests the host sends to a Meadow device.
//!
//! Type codes are grouped by shape:
//!
//! | Range    | Shape                                   |
//! |----------|-----------------------------------------|
//! | `0x01xx` | header only, scalar in `extra_data`     |
//! | `0x02xx` | raw binary payload                      |
//! | `0x03xx` | file start: size, CRC, address and path |
//! | `0x06xx` | file data chunk                         |

use {
    crate::protocol::frame::Frame,
    byteorder::{ByteOrder, LittleEndian},
};

/// Wire command codes understood by the device firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum RequestType {
    /// Set the device trace level (level in `extra_data`).
    ChangeTraceLevel = 0x0101,
    /// Erase and re-format the flash file system.
    FormatFlashFileSystem = 0x0102,
    /// Finish a file transfer to the file system.
    EndFileTransfer = 0x0103,
    /// Restart the primary MCU.
    RestartPrimaryMcu = 0x0104,
    /// Reboot into the USB DFU bootloader.
    EnterDfuMode = 0x010A,
    /// List files on the flash partition.
    ListPartitionFiles = 0x010C,
    /// List files with their CRC32.
    ListPartitionFilesAndCrc = 0x010D,
    /// Stop the managed runtime from starting at boot.
    MonoDisable = 0x010E,
    /// Let the managed runtime start at boot.
    MonoEnable = 0x010F,
    /// Query whether the managed runtime is enabled.
    MonoRunState = 0x0110,
    /// Query device information.
    GetDeviceInformation = 0x0111,
    /// Stop forwarding trace output to the host.
    NoTraceToHost = 0x0113,
    /// Forward trace output to the host.
    SendTraceToHost = 0x0114,
    /// Finish a transfer to the ESP32 coprocessor.
    EndEspFileTransfer = 0x0115,
    /// Flash the uploaded runtime image.
    MonoFlash = 0x0118,
    /// Forward trace output to the debug UART.
    SendTraceToUart = 0x0119,
    /// Stop forwarding trace output to the debug UART.
    NoTraceToUart = 0x011A,
    /// Query the device name.
    GetDeviceName = 0x011E,
    /// Forward debugger protocol bytes.
    DebuggerData = 0x0201,
    /// Begin a file transfer to the file system.
    StartFileTransfer = 0x0301,
    /// Delete a file by name.
    DeleteFileByName = 0x0302,
    /// Begin a transfer to the ESP32 coprocessor flash.
    StartEspFileTransfer = 0x0303,
    /// One chunk of file data (chunk index in `extra_data`).
    FileDataChunk = 0x0601,
}

impl RequestType {
    const ALL: [Self; 23] = [
        Self::ChangeTraceLevel,
        Self::FormatFlashFileSystem,
        Self::EndFileTransfer,
        Self::RestartPrimaryMcu,
        Self::EnterDfuMode,
        Self::ListPartitionFiles,
        Self::ListPartitionFilesAndCrc,
        Self::MonoDisable,
        Self::MonoEnable,
        Self::MonoRunState,
        Self::GetDeviceInformation,
        Self::NoTraceToHost,
        Self::SendTraceToHost,
        Self::EndEspFileTransfer,
        Self::MonoFlash,
        Self::SendTraceToUart,
        Self::NoTraceToUart,
        Self::GetDeviceName,
        Self::DebuggerData,
        Self::StartFileTransfer,
        Self::DeleteFileByName,
        Self::StartEspFileTransfer,
        Self::FileDataChunk,
    ];

    /// Numeric wire code.
    pub fn code(self) -> u16 {
        self as u16
    }

    /// Look up a request type by wire code.
    pub fn from_code(code: u16) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.code() == code)
    }
}

/// A request ready to be sent on a session.
///
/// Immutable once built. The session assigns the sequence number when the
/// request goes on the wire, so a clone re-sent by a retry gets a new one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    kind: RequestType,
    extra_data: u32,
    payload: Vec<u8>,
}

impl Request {
    /// A header-only request.
    pub fn new(kind: RequestType) -> Self {
        Self {
            kind,
            extra_data: 0,
            payload: Vec::new(),
        }
    }

    /// A request with a raw payload.
    pub fn with_payload(kind: RequestType, payload: Vec<u8>) -> Self {
        Self {
            kind,
            extra_data: 0,
            payload,
        }
    }

    /// Set the header scalar argument.
    #[must_use]
    pub fn with_extra_data(mut self, extra_data: u32) -> Self {
        self.extra_data = extra_data;
        self
    }

    /// Ask for the device information text.
    pub fn get_device_info() -> Self {
        Self::new(RequestType::GetDeviceInformation)
    }

    /// Set the device trace level.
    pub fn set_trace_level(level: u32) -> Self {
        Self::new(RequestType::ChangeTraceLevel).with_extra_data(level)
    }

    /// Forward raw debugger protocol bytes.
    pub fn debugger_data(data: Vec<u8>) -> Self {
        Self::with_payload(RequestType::DebuggerData, data)
    }

    /// Begin a file write.
    ///
    /// Payload: `size u32 | crc32 u32 | flash_address u32 | path bytes`, all
    /// little-endian. The path is not NUL-terminated; the frame length is
    /// authoritative.
    pub fn begin_file_write(
        kind: RequestType,
        destination: &str,
        file_size: u32,
        crc32: u32,
        flash_address: u32,
    ) -> Self {
        let mut payload = vec![0u8; 12];
        LittleEndian::write_u32(&mut payload[0..4], file_size);
        LittleEndian::write_u32(&mut payload[4..8], crc32);
        LittleEndian::write_u32(&mut payload[8..12], flash_address);
        payload.extend_from_slice(destination.as_bytes());
        Self::with_payload(kind, payload)
    }

    /// One chunk of file data.
    pub fn file_data_chunk(index: u32, data: Vec<u8>) -> Self {
        Self::with_payload(RequestType::FileDataChunk, data).with_extra_data(index)
    }

    /// Finish a file write.
    pub fn end_file_write(kind: RequestType) -> Self {
        Self::new(kind)
    }

    /// Delete a file on the device file system.
    pub fn delete_file(name: &str) -> Self {
        Self::with_payload(RequestType::DeleteFileByName, name.as_bytes().to_vec())
    }

    /// Request type.
    pub fn kind(&self) -> RequestType {
        self.kind
    }

    /// Header scalar argument.
    pub fn extra_data(&self) -> u32 {
        self.extra_data
    }

    /// Payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Project the request into a frame carrying `sequence`.
    pub fn into_frame(self, sequence: u16) -> Frame {
        Frame::new(sequence, self.kind.code(), self.extra_data, self.payload)
    }
}

/// Fields of a decoded begin-file-write payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStart {
    /// Declared file size.
    pub file_size: u32,
    /// Declared CRC32 of the file.
    pub crc32: u32,
    /// Target flash address (coprocessor transfers only).
    pub flash_address: u32,
    /// Destination path.
    pub destination: String,
}

impl FileStart {
    /// Parse the payload written by [`Request::begin_file_write`].
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() < 12 {
            return None;
        }
        Some(Self {
            file_size: LittleEndian::read_u32(&payload[0..4]),
            crc32: LittleEndian::read_u32(&payload[4..8]),
            flash_address: LittleEndian::read_u32(&payload[8..12]),
            destination: std::str::from_utf8(&payload[12..])
                .ok()?
                .to_string(),
        })
    }
}
