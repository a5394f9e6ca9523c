//! Device discovery and classification.
//!
//! Serial discovery only lists and labels ports; whether a port really hosts
//! a Meadow is decided by asking it for device info ([`confirm_meadow`]).
//! Devices sitting in the USB DFU bootloader are found through
//! [`dfu::DfuContext`].

pub mod dfu;

use {
    crate::{
        device_info::DeviceInfo,
        error::{Error, Result, TransportError},
        session::Session,
    },
    log::debug,
};

#[cfg(feature = "native")]
use {
    crate::{
        port::{NativePortEnumerator, PortEnumerator, SerialConfig},
        session::SessionConfig,
    },
    log::{info, trace},
    std::time::Duration,
};

/// Wilderness Labs USB vendor id.
pub const WILDERNESS_LABS_VENDOR_ID: u16 = 0x2E6A;

/// STMicroelectronics USB vendor id.
pub const STM32_VENDOR_ID: u16 = 0x0483;

/// What a serial port's USB identity says about the device behind it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum DeviceKind {
    /// A Meadow running its application firmware.
    Meadow,
    /// An STM32 part exposing a virtual COM port.
    Stm32,
    /// Anything else.
    Unknown,
}

/// Known USB vendor/product ids; an empty product list matches any product.
const KNOWN_USB_DEVICES: &[(u16, &[u16], DeviceKind)] = &[
    (WILDERNESS_LABS_VENDOR_ID, &[], DeviceKind::Meadow),
    (STM32_VENDOR_ID, &[], DeviceKind::Stm32),
];

impl DeviceKind {
    /// Classify a USB vendor/product pair.
    #[must_use]
    pub fn from_vid_pid(vid: u16, pid: u16) -> Self {
        for (known_vid, pids, device) in KNOWN_USB_DEVICES {
            if vid == *known_vid && (pids.is_empty() || pids.contains(&pid)) {
                return *device;
            }
        }
        Self::Unknown
    }

    /// Human-readable name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Meadow => "Meadow",
            Self::Stm32 => "STM32",
            Self::Unknown => "Unknown",
        }
    }

    /// Whether the kind was recognized.
    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

/// A serial port with whatever USB metadata the OS reports.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DetectedPort {
    /// Port name/path (e.g., "/dev/ttyACM0" or "COM3").
    pub name: String,
    /// Classified device kind.
    pub device: DeviceKind,
    /// USB Vendor ID (if available).
    pub vid: Option<u16>,
    /// USB Product ID (if available).
    pub pid: Option<u16>,
    /// Device manufacturer string (if available).
    pub manufacturer: Option<String>,
    /// Device product string (if available).
    pub product: Option<String>,
    /// Serial number (if available).
    pub serial: Option<String>,
}

impl DetectedPort {
    /// A port with no USB metadata.
    pub fn plain(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            device: DeviceKind::Unknown,
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
            serial: None,
        }
    }

    /// Whether the port most likely belongs to a Meadow.
    pub fn is_meadow(&self) -> bool {
        self.device == DeviceKind::Meadow
    }
}

/// Enumerate serial ports with metadata.
///
/// Enumeration failures are logged and yield an empty list.
#[cfg(feature = "native")]
pub fn detect_ports() -> Vec<DetectedPort> {
    match NativePortEnumerator::list_ports() {
        Ok(ports) => ports
            .into_iter()
            .map(|info| {
                let device = match (info.vid, info.pid) {
                    (Some(vid), Some(pid)) => {
                        trace!(
                            "Found USB port: {} (VID: {vid:04X}, PID: {pid:04X})",
                            info.name
                        );
                        DeviceKind::from_vid_pid(vid, pid)
                    },
                    _ => DeviceKind::Unknown,
                };
                DetectedPort {
                    name: info.name,
                    device,
                    vid: info.vid,
                    pid: info.pid,
                    manufacturer: info.manufacturer,
                    product: info.product,
                    serial: info.serial_number,
                }
            })
            .collect(),
        Err(e) => {
            debug!("Failed to enumerate serial ports: {e}");
            Vec::new()
        },
    }
}

/// Names of every OS-visible serial port.
#[cfg(feature = "native")]
pub fn list_serial_candidates() -> Vec<String> {
    detect_ports()
        .into_iter()
        .map(|p| p.name)
        .collect()
}

/// Pick a port: the hinted one when present, otherwise the first Meadow,
/// then the first STM32, then whatever comes first.
pub fn select_port(ports: &[DetectedPort], hint: Option<&str>) -> Result<DetectedPort> {
    if let Some(hint) = hint {
        if let Some(port) = ports.iter().find(|p| p.name == hint) {
            return Ok(port.clone());
        }
    }
    ports
        .iter()
        .find(|p| p.device == DeviceKind::Meadow)
        .or_else(|| {
            ports
                .iter()
                .find(|p| p.device == DeviceKind::Stm32)
        })
        .or_else(|| ports.first())
        .cloned()
        .ok_or(Error::DeviceNotFound)
}

/// Auto-detect the port a Meadow is most likely on.
///
/// `hint` is a previously used port name, e.g. from a settings file.
#[cfg(feature = "native")]
pub fn auto_detect_port(hint: Option<&str>) -> Result<DetectedPort> {
    let port = select_port(&detect_ports(), hint)?;
    info!("Auto-detected {} port: {}", port.device.name(), port.name);
    Ok(port)
}

/// Ask whatever is behind `session` for its device info.
///
/// Silence within the session's request timeout, or the port going away,
/// means no Meadow is there: `Ok(None)`. A reply that is not device info is
/// an error.
pub async fn confirm_meadow(session: &Session) -> Result<Option<DeviceInfo>> {
    match session
        .device_info()
        .await
    {
        Ok(info) => Ok(Some(info)),
        Err(Error::Transport(TransportError::Timeout(_) | TransportError::PortClosed)) => {
            debug!("No device info from {}", session.name());
            Ok(None)
        },
        Err(e) => Err(e),
    }
}

/// Open `serial` and check whether a Meadow answers within `timeout`.
#[cfg(feature = "native")]
pub async fn probe_port(serial: &SerialConfig, timeout: Duration) -> Result<Option<DeviceInfo>> {
    let session = Session::open(
        serial,
        SessionConfig::default().with_request_timeout(timeout),
        |_| {},
    )?;
    let info = confirm_meadow(&session).await;
    session
        .shutdown()
        .await;
    info
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            protocol::{Frame, RequestType, ResponseType},
            session::SessionConfig,
            testing::{FakeDevice, Reply},
        },
        std::time::Duration,
    };

    fn usb(name: &str, vid: u16, pid: u16) -> DetectedPort {
        DetectedPort {
            vid: Some(vid),
            pid: Some(pid),
            device: DeviceKind::from_vid_pid(vid, pid),
            ..DetectedPort::plain(name)
        }
    }

    #[test]
    fn test_device_kind_from_vid_pid() {
        assert_eq!(DeviceKind::from_vid_pid(0x2E6A, 0x0001), DeviceKind::Meadow);
        assert_eq!(DeviceKind::from_vid_pid(0x0483, 0x5740), DeviceKind::Stm32);
        assert_eq!(DeviceKind::from_vid_pid(0x1A86, 0x7523), DeviceKind::Unknown);
    }

    #[test]
    fn test_select_prefers_hint() {
        let ports = vec![usb("/dev/ttyACM0", 0x2E6A, 1), DetectedPort::plain("/dev/ttyS0")];
        let port = select_port(&ports, Some("/dev/ttyS0")).unwrap();
        assert_eq!(port.name, "/dev/ttyS0");
    }

    #[test]
    fn test_select_ignores_stale_hint() {
        let ports = vec![DetectedPort::plain("/dev/ttyS0"), usb("/dev/ttyACM1", 0x2E6A, 1)];
        let port = select_port(&ports, Some("/dev/ttyACM9")).unwrap();
        assert_eq!(port.name, "/dev/ttyACM1");
    }

    #[test]
    fn test_select_order() {
        let ports = vec![
            DetectedPort::plain("/dev/ttyS0"),
            usb("/dev/ttyACM0", 0x0483, 0x5740),
            usb("/dev/ttyACM1", 0x2E6A, 1),
        ];
        assert_eq!(select_port(&ports, None).unwrap().name, "/dev/ttyACM1");
        assert_eq!(select_port(&ports[..2], None).unwrap().name, "/dev/ttyACM0");
        assert_eq!(select_port(&ports[..1], None).unwrap().name, "/dev/ttyS0");
        assert!(matches!(select_port(&[], None), Err(Error::DeviceNotFound)));
    }

    #[tokio::test]
    async fn test_confirm_meadow_returns_device_info() {
        let device = FakeDevice::new(|frame: &Frame| {
            vec![Reply::to(frame, ResponseType::DeviceInfo, "Product: F7FeatherV2, Model: F7Micro")]
        });
        let session = device.open_session(|_| {});

        let info = confirm_meadow(&session)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(info.product(), Some("F7FeatherV2"));
        assert_eq!(
            device.received_types(),
            vec![RequestType::GetDeviceInformation.code()]
        );
    }

    #[tokio::test]
    async fn test_confirm_meadow_silence_is_not_a_meadow() {
        let device = FakeDevice::new(|_: &Frame| Vec::new());
        let session = device.open_session_with(
            SessionConfig::default().with_request_timeout(Duration::from_millis(100)),
            |_| {},
        );

        assert!(
            confirm_meadow(&session)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_confirm_meadow_wrong_reply_is_error() {
        let device = FakeDevice::new(|frame: &Frame| vec![Reply::accepted(frame)]);
        let session = device.open_session(|_| {});

        let err = confirm_meadow(&session)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnexpectedResponse(_)));
    }

    #[cfg(feature = "native")]
    #[test]
    fn test_list_serial_candidates_does_not_panic() {
        let _ = list_serial_candidates();
    }
}
