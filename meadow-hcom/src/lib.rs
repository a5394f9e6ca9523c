//! # meadow-hcom
//!
//! Host-side communication with Meadow microcontroller boards.
//!
//! This crate covers the device-facing core of the Meadow tooling:
//!
//! - HCom frame codec (SLIP framing, 12-byte header, CRC16 trailer)
//! - Typed requests and responses
//! - A transport session with request/response correlation
//! - Chunked file upload with CRC32 verification
//! - Serial port discovery and USB DFU bootloader discovery
//!
//! ## Features
//!
//! - `native` (default): serial ports via the `serialport` crate
//! - `usb` (default): DFU discovery and hot-plug via `rusb`
//! - `serde`: `Serialize` for result and discovery types
//!
//! ## Example
//!
//! ```rust,no_run
//! use {
//!     meadow_hcom::{Session, SessionConfig, SerialConfig, TransferConfig, transfer},
//!     std::path::Path,
//!     tokio_util::sync::CancellationToken,
//! };
//!
//! # async fn run() -> meadow_hcom::Result<()> {
//! let serial = SerialConfig::new("/dev/ttyACM0", 115_200);
//! let session = Session::open(&serial, SessionConfig::default(), |msg| println!("{msg:?}"))?;
//!
//! let info = session.device_info().await?;
//! println!("{:?} running {:?}", info.model(), info.os_version());
//!
//! let result = transfer(
//!     &session,
//!     Path::new("App.dll"),
//!     "App.dll",
//!     &TransferConfig::default(),
//!     &CancellationToken::new(),
//!     &mut |sent, total| println!("{sent}/{total}"),
//! )
//! .await?;
//! println!("uploaded, crc {}", result.checksum());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod device;
pub mod device_info;
pub mod error;
pub mod file_data;
pub mod port;
pub mod protocol;
pub mod session;
pub mod transfer;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports for convenience
#[cfg(feature = "native")]
pub use {
    device::{auto_detect_port, detect_ports, list_serial_candidates, probe_port},
    port::{NativePort, NativePortEnumerator},
};
#[cfg(feature = "usb")]
pub use device::dfu::{LibUsbBackend, LibUsbCandidate};
pub use {
    device::{
        DetectedPort, DeviceKind, confirm_meadow, select_port,
        dfu::{DfuContext, HotplugEvent, HotplugWatch, UsbBackend, UsbCandidate, UsbDeviceHandle, UsbDeviceInfo, UsbIdentity},
    },
    device_info::DeviceInfo,
    error::{DiscoveryError, Error, FrameError, Result, TransferError, TransportError},
    file_data::FileData,
    port::{Port, PortEnumerator, PortInfo, SerialConfig},
    protocol::{Frame, FrameCodec, HcomCodecV1, Request, RequestType, ResponseType, SerialResponse},
    session::{DeviceMessage, Session, SessionConfig},
    transfer::{FileTransferResult, TransferConfig, TransferTarget, transfer},
};
