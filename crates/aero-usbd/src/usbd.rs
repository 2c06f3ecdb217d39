use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{error, info, warn};

use crate::bus::{BusLocation, BusRecord, DeviceList};
use crate::clock::Clock;
use crate::config::UsbdConfig;
use crate::device::emulated::EmulatedDevice;
use crate::device::passthrough::PassthroughDevice;
use crate::device::SharedUsbDevice;
use crate::error::{ConfigError, Result};
use crate::host::{CompletionSink, HostTransferCompletion, UsbHostBackend};
use crate::manager::{DeviceManager, Dispatched, UsbDeviceHandle};
use crate::memory::{GuestBuffer, GuestMemory};
use crate::setup::SetupPacket;
use crate::transfer::{IsoRequest, IsochronousResult, TransferId, TransferResult, TransferSummary};

/// State shared between the context and the completion sinks handed to the backend.
pub(crate) struct Shared {
    manager: Mutex<DeviceManager>,
    initialized: AtomicBool,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, DeviceManager> {
        self.manager.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn transfer_complete(&self, completion: HostTransferCompletion) {
        if !self.initialized.load(Ordering::Acquire) {
            return;
        }
        self.lock().complete_host_transfer(completion);
    }
}

/// The virtual USB host controller context.
///
/// Created by [`Usbd::initialize`] and torn down by [`Usbd::deinitialize`] or on drop. Guest call
/// surfaces keep one of these around and route every `usbd` entry point through it.
pub struct Usbd {
    shared: Arc<Shared>,
    backend: Arc<dyn UsbHostBackend>,
    clock: Arc<dyn Clock>,
    sink: CompletionSink,
}

impl Usbd {
    /// Builds the device set: every host device matching a passthrough filter, followed by the
    /// configured emulated devices.
    ///
    /// A host stack that cannot list its devices is logged and treated as having none.
    pub fn initialize(
        config: UsbdConfig,
        backend: Arc<dyn UsbHostBackend>,
        memory: Box<dyn GuestMemory>,
        clock: Arc<dyn Clock>,
    ) -> std::result::Result<Self, ConfigError> {
        config.validate()?;

        let mut manager = DeviceManager::new(
            config.transfer_pool_size,
            config.fake_transfer_latency_us,
            memory,
        );
        let descriptor_read_timeout = Duration::from_millis(config.descriptor_read_timeout_ms);

        let mut found = Vec::new();
        match backend.device_list() {
            Ok(host_devices) => {
                for info in host_devices {
                    let (vendor_id, product_id) =
                        (info.descriptor.vendor_id, info.descriptor.product_id);
                    let Some(filter) = config.matches_passthrough(vendor_id, product_id) else {
                        continue;
                    };
                    info!(name = %filter.name, "found device");
                    let location = manager.new_location();
                    let device = PassthroughDevice::new(
                        Arc::clone(&backend),
                        info,
                        location,
                        descriptor_read_timeout,
                    );
                    manager.attach_device(Arc::new(Mutex::new(device)));
                    found.push((vendor_id, product_id));
                }
            }
            Err(err) => error!(error = %err, "failed to get device list"),
        }

        for emulated in &config.emulated {
            let ids = (emulated.vendor_id, emulated.product_id);
            if emulated.only_if_absent && found.contains(&ids) {
                info!(name = %emulated.name, "real device present, skipping emulated device");
                continue;
            }
            info!(name = %emulated.name, "adding emulated device");
            let location = manager.new_location();
            let device = EmulatedDevice::from_config(emulated, location);
            manager.attach_device(Arc::new(Mutex::new(device)));
        }

        let shared = Arc::new(Shared {
            manager: Mutex::new(manager),
            initialized: AtomicBool::new(true),
        });
        let sink = CompletionSink::new(Arc::downgrade(&shared));

        Ok(Self {
            shared,
            backend,
            clock,
            sink,
        })
    }

    /// Tears the context down. Completions still in flight in the backend are dropped.
    pub fn deinitialize(self) {
        drop(self);
    }

    /// Sink for backends that deliver completions from their own thread.
    pub fn completion_sink(&self) -> CompletionSink {
        self.sink.clone()
    }

    pub fn new_location(&self) -> BusLocation {
        self.shared.lock().new_location()
    }

    /// Puts a caller-built device on the bus. Build it with a location from
    /// [`Usbd::new_location`].
    pub fn attach_device(&self, device: SharedUsbDevice) -> BusLocation {
        self.shared.lock().attach_device(device)
    }

    /// Runs `f` against guest memory under the manager lock.
    pub fn with_memory<R>(&self, f: impl FnOnce(&mut dyn GuestMemory) -> R) -> R {
        f(self.shared.lock().memory_mut())
    }

    pub fn enumerate_devices(&self) -> DeviceList {
        self.shared.lock().enumerate()
    }

    pub fn open(&self, record: &BusRecord) -> Result<UsbDeviceHandle> {
        self.shared.lock().open(record)
    }

    pub fn open_device_with_ids(&self, vendor_id: u16, product_id: u16) -> Result<UsbDeviceHandle> {
        self.shared.lock().open_device_with_ids(vendor_id, product_id)
    }

    pub fn close(&self, handle: &UsbDeviceHandle) {
        self.shared.lock().close(handle);
    }

    pub fn disconnect(&self, handle: &UsbDeviceHandle, remove_from_bus: bool) {
        self.shared.lock().disconnect(handle, remove_from_bus);
    }

    pub fn check_connected(&self, handle: &UsbDeviceHandle) -> Result<()> {
        self.shared.lock().check_connected(handle)
    }

    pub fn claim_interface(&self, handle: &UsbDeviceHandle, interface: u8) -> Result<()> {
        self.shared.lock().claim_interface(handle, interface)
    }

    pub fn release_interface(&self, handle: &UsbDeviceHandle, interface: u8) -> Result<()> {
        self.shared.lock().release_interface(handle, interface)
    }

    pub fn get_configuration(&self, handle: &UsbDeviceHandle) -> Result<u8> {
        self.shared.lock().get_configuration(handle)
    }

    pub fn set_configuration(&self, handle: &UsbDeviceHandle, value: u8) -> Result<()> {
        self.shared.lock().set_configuration(handle, value)
    }

    pub fn set_interface_alt_setting(
        &self,
        handle: &UsbDeviceHandle,
        interface: u8,
        alternate_setting: u8,
    ) -> Result<()> {
        self.shared
            .lock()
            .set_interface_alt_setting(handle, interface, alternate_setting)
    }

    pub fn config_descriptor(&self, record: &BusRecord, index: u8) -> Result<Vec<u8>> {
        self.shared.lock().config_descriptor(record.location, index)
    }

    pub fn max_packet_size(&self, record: &BusRecord, endpoint: u8) -> Result<u16> {
        self.shared.lock().max_packet_size(record.location, endpoint)
    }

    pub fn submit_control(
        &self,
        handle: &UsbDeviceHandle,
        setup: SetupPacket,
        buffer: GuestBuffer,
    ) -> Result<TransferId> {
        let now_us = self.clock.now_us();
        let dispatched = self.shared.lock().submit_control(handle, setup, buffer, now_us);
        self.hand_to_host(dispatched)
    }

    pub fn submit_interrupt(
        &self,
        handle: &UsbDeviceHandle,
        endpoint: u8,
        buffer: GuestBuffer,
    ) -> Result<TransferId> {
        let now_us = self.clock.now_us();
        let dispatched = self
            .shared
            .lock()
            .submit_interrupt(handle, endpoint, buffer, now_us);
        self.hand_to_host(dispatched)
    }

    pub fn submit_isochronous(
        &self,
        handle: &UsbDeviceHandle,
        request: IsoRequest,
    ) -> Result<TransferId> {
        let now_us = self.clock.now_us();
        let dispatched = self.shared.lock().submit_isochronous(handle, request, now_us);
        self.hand_to_host(dispatched)
    }

    /// Submits a passthrough transfer outside the manager lock; completions may arrive on
    /// another thread while the host is still reporting busy.
    fn hand_to_host(&self, dispatched: Result<Dispatched>) -> Result<TransferId> {
        let Dispatched { id, submission } = dispatched?;
        if let Some(submission) = submission {
            if let Err(err) = submission.submit() {
                self.shared.lock().fail_host_submission(id, err);
            }
        }
        Ok(id)
    }

    /// Lets the host stack process events for up to `timeout`, then completes due emulated
    /// transfers. The manager lock is not held while the backend blocks.
    pub fn poll(&self, timeout: Duration) -> Result<()> {
        let events = self.backend.handle_events(timeout, &self.sink);
        if let Err(err) = events {
            warn!(error = %err, "host event handling failed");
        }

        let now_us = self.clock.now_us();
        let mut manager = self.shared.lock();
        if manager.has_fake_transfers() {
            manager.pump_fake_transfers(now_us);
        }

        events.map_err(Into::into)
    }

    pub fn transfer_result(&self, id: TransferId) -> Result<TransferResult> {
        self.shared.lock().transfer_result(id)
    }

    pub fn isochronous_result(&self, id: TransferId) -> Result<IsochronousResult> {
        self.shared.lock().isochronous_result(id)
    }

    pub fn transfer_summary(&self) -> TransferSummary {
        self.shared.lock().transfer_summary()
    }
}

impl Drop for Usbd {
    fn drop(&mut self) {
        self.shared.initialized.store(false, Ordering::Release);
        // Devices go before the backend so passthrough handles are closed while it still runs.
        self.shared.lock().clear();
    }
}

impl std::fmt::Debug for Usbd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Usbd")
            .field("summary", &self.transfer_summary())
            .finish_non_exhaustive()
    }
}
