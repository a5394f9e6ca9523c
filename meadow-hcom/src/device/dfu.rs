//! USB discovery of devices in DFU bootloader mode.
//!
//! The vendor id only narrows the candidate set. A candidate counts as a
//! Meadow when its serial number is at most [`MAX_SERIAL_NUMBER_LEN`]
//! characters and, if the active configuration can be read, it exposes
//! exactly [`MEADOW_INTERFACE_COUNT`] interfaces.
//!
//! A [`DfuContext`] owns the USB library context. Only one may be live per
//! process; it must be disposed explicitly and refuses to go away while
//! handles derived from it are still alive.

use {
    super::{STM32_VENDOR_ID, WILDERNESS_LABS_VENDOR_ID},
    crate::error::DiscoveryError,
    log::{debug, trace, warn},
    std::{
        collections::HashSet,
        fmt,
        sync::{
            Arc,
            atomic::{AtomicBool, AtomicUsize, Ordering},
        },
        thread::JoinHandle,
        time::Duration,
    },
};

#[cfg(feature = "usb")]
pub use libusb::{LibUsbBackend, LibUsbCandidate};

/// Product id of the STM32 system bootloader in DFU mode.
pub const STM32_DFU_PRODUCT_ID: u16 = 0xDF11;

/// Vendors whose devices are considered at all.
pub const DEFAULT_VENDOR_ALLOW_LIST: &[u16] = &[STM32_VENDOR_ID, WILDERNESS_LABS_VENDOR_ID];

/// Longest serial number a Meadow reports.
pub const MAX_SERIAL_NUMBER_LEN: usize = 12;

/// Interfaces in a Meadow's active configuration.
pub const MEADOW_INTERFACE_COUNT: u8 = 4;

/// How long one hot-plug wait blocks before checking for shutdown.
const WATCH_TICK: Duration = Duration::from_millis(250);

/// Where a USB device sits on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct UsbIdentity {
    /// USB vendor id.
    pub vendor_id: u16,
    /// USB product id.
    pub product_id: u16,
    /// Bus number.
    pub bus: u8,
    /// Address on the bus.
    pub address: u8,
}

impl fmt::Display for UsbIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:03}:{:03} {:04x}:{:04x}",
            self.bus, self.address, self.vendor_id, self.product_id
        )
    }
}

/// A USB device as seen by a [`UsbBackend`], before classification.
pub trait UsbCandidate {
    /// Vendor, product and bus position.
    fn identity(&self) -> UsbIdentity;

    /// Serial number string, if the device could be opened and reports one.
    fn serial_number(&self) -> Option<String>;

    /// Interface count of the active configuration, if readable.
    fn interface_count(&self) -> Option<u8>;
}

/// A change reported by a hot-plug source.
pub enum UsbChange<C> {
    /// A device was attached.
    Arrived(C),
    /// A device was removed.
    Left(UsbIdentity),
}

/// A blocking source of device arrivals and departures.
pub trait ChangeFeed<C>: Send {
    /// Wait up to `timeout` and return whatever changed meanwhile.
    fn next_changes(&mut self, timeout: Duration) -> Result<Vec<UsbChange<C>>, DiscoveryError>;
}

/// Enumerates USB devices.
pub trait UsbBackend: Send + Sync + 'static {
    /// Device type produced by this backend.
    type Candidate: UsbCandidate + Send + 'static;

    /// Every device currently attached.
    fn candidates(&self) -> Result<Vec<Self::Candidate>, DiscoveryError>;

    /// Native hot-plug notifications, if the platform has them.
    fn change_feed(&self) -> Result<Option<Box<dyn ChangeFeed<Self::Candidate>>>, DiscoveryError> {
        Ok(None)
    }
}

/// An allow-listed USB device after classification.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct UsbDeviceInfo {
    /// Bus identity.
    pub identity: UsbIdentity,
    /// Serial number, read once during classification.
    pub serial_number: Option<String>,
    /// Active configuration interface count, when readable.
    pub interface_count: Option<u8>,
    /// Whether the descriptor shape matches a Meadow.
    pub is_meadow: bool,
}

/// Classify `candidate`; `None` when its vendor is not allow-listed.
pub fn classify<C: UsbCandidate + ?Sized>(candidate: &C, allow_list: &[u16]) -> Option<UsbDeviceInfo> {
    let identity = candidate.identity();
    if !allow_list.contains(&identity.vendor_id) {
        return None;
    }

    let serial_number = candidate.serial_number();
    let interface_count = candidate.interface_count();
    let serial_ok = serial_number
        .as_deref()
        .is_some_and(|s| s.chars().count() <= MAX_SERIAL_NUMBER_LEN);
    let shape_ok = interface_count.is_none_or(|n| n == MEADOW_INTERFACE_COUNT);
    let is_meadow = serial_ok && shape_ok;
    trace!(
        "{identity}: serial {serial_number:?}, interfaces {interface_count:?}, meadow {is_meadow}"
    );

    Some(UsbDeviceInfo {
        identity,
        serial_number,
        interface_count,
        is_meadow,
    })
}

/// Counts one outstanding use of a [`DfuContext`].
#[derive(Debug)]
struct Lease(Arc<AtomicUsize>);

impl Lease {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(Arc::clone(counter))
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.0
            .fetch_sub(1, Ordering::AcqRel);
    }
}

/// A device found through a [`DfuContext`].
///
/// The owning context cannot be disposed while this handle is alive.
#[derive(Debug)]
pub struct UsbDeviceHandle {
    info: UsbDeviceInfo,
    _lease: Lease,
}

impl UsbDeviceHandle {
    /// Classification details.
    pub fn info(&self) -> &UsbDeviceInfo {
        &self.info
    }

    /// Bus identity.
    pub fn identity(&self) -> UsbIdentity {
        self.info.identity
    }

    /// Cached serial number.
    pub fn serial_number(&self) -> Option<&str> {
        self.info
            .serial_number
            .as_deref()
    }

    /// Whether the device looks like a Meadow.
    pub fn is_meadow(&self) -> bool {
        self.info.is_meadow
    }
}

/// A process-wide "at most one live owner" flag.
#[derive(Debug)]
pub struct InstanceSlot(AtomicBool);

impl InstanceSlot {
    /// An unclaimed slot.
    pub const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    fn claim(&'static self) -> Result<SlotGuard, DiscoveryError> {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| SlotGuard(self))
            .map_err(|_| DiscoveryError::AlreadyInitialized)
    }
}

impl Default for InstanceSlot {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
struct SlotGuard(&'static InstanceSlot);

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.0
            .0
            .store(false, Ordering::Release);
    }
}

/// Guards the process-wide USB library context.
static USB_CONTEXT_SLOT: InstanceSlot = InstanceSlot::new();

struct Live<B> {
    backend: Arc<B>,
    _slot: SlotGuard,
}

/// Owner of the USB context used for bootloader-mode discovery.
pub struct DfuContext<B: UsbBackend> {
    live: Option<Live<B>>,
    allow_list: Vec<u16>,
    leases: Arc<AtomicUsize>,
}

#[cfg(feature = "usb")]
impl DfuContext<LibUsbBackend> {
    /// Create the process-wide libusb context with the default allow-list.
    ///
    /// Fails with [`DiscoveryError::AlreadyInitialized`] while another
    /// context is live.
    pub fn init() -> Result<Self, DiscoveryError> {
        let slot = USB_CONTEXT_SLOT.claim()?;
        let backend = LibUsbBackend::new()?;
        debug!("USB context initialized");
        Ok(Self::from_parts(slot, backend, DEFAULT_VENDOR_ALLOW_LIST.to_vec()))
    }
}

impl<B: UsbBackend> DfuContext<B> {
    /// Use `backend` under the process-wide single-instance slot.
    pub fn with_backend(backend: B, allow_list: Vec<u16>) -> Result<Self, DiscoveryError> {
        Self::with_backend_in(&USB_CONTEXT_SLOT, backend, allow_list)
    }

    /// Use `backend` under a caller-provided single-instance slot.
    pub fn with_backend_in(
        slot: &'static InstanceSlot,
        backend: B,
        allow_list: Vec<u16>,
    ) -> Result<Self, DiscoveryError> {
        Ok(Self::from_parts(slot.claim()?, backend, allow_list))
    }

    fn from_parts(slot: SlotGuard, backend: B, allow_list: Vec<u16>) -> Self {
        Self {
            live: Some(Live {
                backend: Arc::new(backend),
                _slot: slot,
            }),
            allow_list,
            leases: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn backend(&self) -> Result<&Arc<B>, DiscoveryError> {
        self.live
            .as_ref()
            .map(|live| &live.backend)
            .ok_or(DiscoveryError::Disposed)
    }

    /// Vendor ids considered during discovery.
    pub fn allow_list(&self) -> &[u16] {
        &self.allow_list
    }

    /// Whether [`DfuContext::dispose`] has not run yet.
    pub fn is_active(&self) -> bool {
        self.live
            .is_some()
    }

    /// Every allow-listed device, Meadow or not.
    pub fn list_candidates(&self) -> Result<Vec<UsbDeviceHandle>, DiscoveryError> {
        let candidates = self
            .backend()?
            .candidates()?;
        Ok(candidates
            .iter()
            .filter_map(|c| classify(c, &self.allow_list))
            .map(|info| UsbDeviceHandle {
                info,
                _lease: Lease::new(&self.leases),
            })
            .collect())
    }

    /// Allow-listed devices classified as a Meadow.
    pub fn list_bootloader_devices(&self) -> Result<Vec<UsbDeviceHandle>, DiscoveryError> {
        let devices: Vec<_> = self
            .list_candidates()?
            .into_iter()
            .filter(UsbDeviceHandle::is_meadow)
            .collect();
        debug!("{} device(s) in bootloader mode", devices.len());
        Ok(devices)
    }

    /// Report device arrivals and departures to `callback` until the
    /// returned watch is dropped.
    ///
    /// Arrivals are re-classified and only Meadow devices are reported;
    /// departures are reported for every allow-listed vendor. The callback
    /// runs on a background thread.
    pub fn watch<F>(&self, callback: F) -> Result<HotplugWatch, DiscoveryError>
    where
        F: FnMut(HotplugEvent) + Send + 'static,
    {
        let backend = self.backend()?;
        let feed: Box<dyn ChangeFeed<B::Candidate>> = match backend.change_feed()? {
            Some(feed) => {
                debug!("Watching USB with native hot-plug events");
                feed
            },
            None => {
                debug!("Hot-plug events unavailable, polling USB every {WATCH_TICK:?}");
                Box::new(PollingFeed::new(Arc::clone(backend))?)
            },
        };

        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let allow_list = self.allow_list.clone();
        let handle = std::thread::Builder::new()
            .name("usb-hotplug".to_string())
            .spawn(move || watch_loop(feed, &allow_list, &thread_stop, callback))
            .map_err(|e| DiscoveryError::Watch(e.to_string()))?;

        Ok(HotplugWatch {
            stop,
            handle: Some(handle),
            _lease: Lease::new(&self.leases),
        })
    }

    /// Release the USB context.
    ///
    /// Fails with [`DiscoveryError::HandlesOutstanding`] while device handles
    /// or watches from this context are alive, and with
    /// [`DiscoveryError::Disposed`] on a second call.
    pub fn dispose(&mut self) -> Result<(), DiscoveryError> {
        if self
            .live
            .is_none()
        {
            return Err(DiscoveryError::Disposed);
        }
        let outstanding = self
            .leases
            .load(Ordering::Acquire);
        if outstanding > 0 {
            return Err(DiscoveryError::HandlesOutstanding(outstanding));
        }
        self.live = None;
        debug!("USB context disposed");
        Ok(())
    }
}

impl<B: UsbBackend> fmt::Debug for DfuContext<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DfuContext")
            .field("active", &self.is_active())
            .field("allow_list", &self.allow_list)
            .field(
                "outstanding",
                &self
                    .leases
                    .load(Ordering::Relaxed),
            )
            .finish()
    }
}

/// A hot-plug notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HotplugEvent {
    /// A Meadow was attached, e.g. after resetting into the bootloader.
    Arrived(UsbDeviceInfo),
    /// An allow-listed device was removed.
    Left(UsbIdentity),
}

/// A running hot-plug monitor; dropping it stops monitoring.
pub struct HotplugWatch {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    _lease: Lease,
}

impl HotplugWatch {
    /// Stop monitoring and wait for the background thread.
    pub fn stop(self) {
        drop(self);
    }
}

impl Drop for HotplugWatch {
    fn drop(&mut self) {
        self.stop
            .store(true, Ordering::Release);
        if let Some(handle) = self
            .handle
            .take()
        {
            let _ = handle.join();
        }
    }
}

impl fmt::Debug for HotplugWatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HotplugWatch")
            .field(
                "stopped",
                &self
                    .stop
                    .load(Ordering::Relaxed),
            )
            .finish()
    }
}

fn watch_loop<C, F>(
    mut feed: Box<dyn ChangeFeed<C>>,
    allow_list: &[u16],
    stop: &AtomicBool,
    mut callback: F,
) where
    C: UsbCandidate,
    F: FnMut(HotplugEvent),
{
    while !stop.load(Ordering::Acquire) {
        let changes = match feed.next_changes(WATCH_TICK) {
            Ok(changes) => changes,
            Err(e) => {
                warn!("USB monitoring stopped: {e}");
                return;
            },
        };
        for change in changes {
            match change {
                UsbChange::Arrived(candidate) => match classify(&candidate, allow_list) {
                    Some(info) if info.is_meadow => callback(HotplugEvent::Arrived(info)),
                    Some(info) => debug!("Ignoring arrival of non-Meadow {}", info.identity),
                    None => {},
                },
                UsbChange::Left(identity) if allow_list.contains(&identity.vendor_id) => {
                    callback(HotplugEvent::Left(identity));
                },
                UsbChange::Left(_) => {},
            }
        }
    }
}

/// Turns repeated enumeration into a change feed.
struct PollingFeed<B: UsbBackend> {
    backend: Arc<B>,
    known: HashSet<UsbIdentity>,
}

impl<B: UsbBackend> PollingFeed<B> {
    fn new(backend: Arc<B>) -> Result<Self, DiscoveryError> {
        let known = backend
            .candidates()?
            .iter()
            .map(UsbCandidate::identity)
            .collect();
        Ok(Self { backend, known })
    }
}

impl<B: UsbBackend> ChangeFeed<B::Candidate> for PollingFeed<B> {
    fn next_changes(
        &mut self,
        timeout: Duration,
    ) -> Result<Vec<UsbChange<B::Candidate>>, DiscoveryError> {
        std::thread::sleep(timeout);
        let current = self
            .backend
            .candidates()?;
        let present: HashSet<UsbIdentity> = current
            .iter()
            .map(UsbCandidate::identity)
            .collect();

        let mut changes: Vec<_> = self
            .known
            .difference(&present)
            .map(|identity| UsbChange::Left(*identity))
            .collect();
        changes.extend(
            current
                .into_iter()
                .filter(|c| {
                    !self
                        .known
                        .contains(&c.identity())
                })
                .map(UsbChange::Arrived),
        );
        self.known = present;
        Ok(changes)
    }
}

#[cfg(feature = "usb")]
mod libusb {
    use {
        super::{ChangeFeed, UsbBackend, UsbCandidate, UsbChange, UsbIdentity},
        crate::error::DiscoveryError,
        log::{debug, trace},
        rusb::{Context, Device, DeviceDescriptor, Hotplug, HotplugBuilder, Registration, UsbContext},
        std::{sync::mpsc, time::Duration},
    };

    /// Enumerates devices through libusb.
    pub struct LibUsbBackend {
        context: Context,
    }

    impl LibUsbBackend {
        /// Create a libusb context.
        pub fn new() -> Result<Self, DiscoveryError> {
            Ok(Self {
                context: Context::new()?,
            })
        }
    }

    /// A libusb device with its cached device descriptor.
    pub struct LibUsbCandidate {
        device: Device<Context>,
        descriptor: DeviceDescriptor,
    }

    impl LibUsbCandidate {
        fn new(device: Device<Context>) -> rusb::Result<Self> {
            let descriptor = device.device_descriptor()?;
            Ok(Self { device, descriptor })
        }
    }

    impl UsbCandidate for LibUsbCandidate {
        fn identity(&self) -> UsbIdentity {
            UsbIdentity {
                vendor_id: self.descriptor.vendor_id(),
                product_id: self.descriptor.product_id(),
                bus: self.device.bus_number(),
                address: self.device.address(),
            }
        }

        fn serial_number(&self) -> Option<String> {
            let handle = match self.device.open() {
                Ok(handle) => handle,
                Err(e) => {
                    debug!("Cannot open {}: {e}", self.identity());
                    return None;
                },
            };
            handle
                .read_serial_number_string_ascii(&self.descriptor)
                .ok()
        }

        fn interface_count(&self) -> Option<u8> {
            self.device
                .active_config_descriptor()
                .ok()
                .map(|config| config.num_interfaces())
        }
    }

    impl UsbBackend for LibUsbBackend {
        type Candidate = LibUsbCandidate;

        fn candidates(&self) -> Result<Vec<LibUsbCandidate>, DiscoveryError> {
            Ok(self
                .context
                .devices()?
                .iter()
                .filter_map(|device| match LibUsbCandidate::new(device) {
                    Ok(candidate) => Some(candidate),
                    Err(e) => {
                        trace!("Skipping device without descriptor: {e}");
                        None
                    },
                })
                .collect())
        }

        fn change_feed(
            &self,
        ) -> Result<Option<Box<dyn ChangeFeed<LibUsbCandidate>>>, DiscoveryError> {
            if !rusb::has_hotplug() {
                return Ok(None);
            }
            let (tx, rx) = mpsc::channel();
            let sink: Box<dyn Hotplug<Context>> = Box::new(HotplugSink { tx });
            let registration = HotplugBuilder::new()
                .enumerate(false)
                .register(&self.context, sink)?;
            Ok(Some(Box::new(NativeFeed {
                context: self.context.clone(),
                _registration: registration,
                rx,
            })))
        }
    }

    struct HotplugSink {
        tx: mpsc::Sender<UsbChange<LibUsbCandidate>>,
    }

    impl Hotplug<Context> for HotplugSink {
        fn device_arrived(&mut self, device: Device<Context>) {
            if let Ok(candidate) = LibUsbCandidate::new(device) {
                let _ = self
                    .tx
                    .send(UsbChange::Arrived(candidate));
            }
        }

        fn device_left(&mut self, device: Device<Context>) {
            if let Ok(candidate) = LibUsbCandidate::new(device) {
                let _ = self
                    .tx
                    .send(UsbChange::Left(candidate.identity()));
            }
        }
    }

    struct NativeFeed {
        context: Context,
        _registration: Registration<Context>,
        rx: mpsc::Receiver<UsbChange<LibUsbCandidate>>,
    }

    impl ChangeFeed<LibUsbCandidate> for NativeFeed {
        fn next_changes(
            &mut self,
            timeout: Duration,
        ) -> Result<Vec<UsbChange<LibUsbCandidate>>, DiscoveryError> {
            self.context
                .handle_events(Some(timeout))?;
            Ok(self
                .rx
                .try_iter()
                .collect())
        }
    }
}
