//! Devices on the virtual bus.
//!
//! Both device kinds implement [`UsbDevice`]: [`passthrough::PassthroughDevice`] forwards to real
//! hardware through the host backend, [`emulated::EmulatedDevice`] answers standard requests from
//! its own descriptor tree. Transfer methods are asynchronous in contract: they may return before
//! the transfer finishes, and the guest observes completion through the transfer's busy flag.

pub mod emulated;
pub mod passthrough;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::bus::BusLocation;
use crate::descriptor::{ConfigurationDescriptor, DescriptorNode};
use crate::error::{Result, UsbdError};
use crate::host::HostSubmission;
use crate::memory::{GuestBuffer, GuestMemory};
use crate::setup::SetupPacket;
use crate::transfer::{
    FakeCompletion, FakeTransferQueue, IsoRequest, Transfer, TransferId, TransferStatus,
};

/// Device shared between the manager's device list, its open-device list and guest handles.
pub type SharedUsbDevice = Arc<Mutex<dyn UsbDevice>>;

pub(crate) fn lock_device(device: &SharedUsbDevice) -> MutexGuard<'_, dyn UsbDevice + 'static> {
    device.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State every device kind carries.
#[derive(Debug, Clone)]
pub struct DeviceState {
    pub location: BusLocation,
    /// Root is the device descriptor; children are configuration descriptors.
    pub descriptors: DescriptorNode,
    pub current_configuration: u8,
    pub current_interface: u8,
}

impl DeviceState {
    pub fn new(location: BusLocation, descriptors: DescriptorNode) -> Self {
        Self {
            location,
            descriptors,
            current_configuration: 1,
            current_interface: 0,
        }
    }

    /// The configuration subtree whose `bConfigurationValue` is currently selected, falling back
    /// to the first configuration.
    pub fn active_configuration(&self) -> Option<&DescriptorNode> {
        let configs = self.descriptors.children();
        configs
            .iter()
            .find(|c| {
                c.as_configuration()
                    .is_some_and(|cfg| cfg.configuration_value == self.current_configuration)
            })
            .or_else(|| configs.first())
    }
}

/// Per-transfer view handed to a device while it services one request.
pub struct TransferContext<'a> {
    pub(crate) transfer: &'a mut Transfer,
    pub(crate) memory: &'a mut dyn GuestMemory,
    pub(crate) fake_transfers: &'a mut FakeTransferQueue,
    pub(crate) now_us: u64,
    pub(crate) fake_latency_us: u64,
    pub(crate) submission: Option<HostSubmission>,
}

impl<'a> TransferContext<'a> {
    pub(crate) fn new(
        transfer: &'a mut Transfer,
        memory: &'a mut dyn GuestMemory,
        fake_transfers: &'a mut FakeTransferQueue,
        now_us: u64,
        fake_latency_us: u64,
    ) -> Self {
        Self {
            transfer,
            memory,
            fake_transfers,
            now_us,
            fake_latency_us,
            submission: None,
        }
    }

    pub fn id(&self) -> TransferId {
        self.transfer.id
    }

    pub fn iso_request(&self) -> &IsoRequest {
        &self.transfer.iso_request
    }

    pub fn memory(&mut self) -> &mut dyn GuestMemory {
        &mut *self.memory
    }

    pub fn read_guest(&mut self, buffer: GuestBuffer) -> Vec<u8> {
        buffer.read_from(&mut *self.memory)
    }

    /// Copies `data` into `buffer`, clipped to its length. Returns the bytes written.
    pub fn write_guest(&mut self, buffer: GuestBuffer, data: &[u8]) -> usize {
        buffer.write_to(&mut *self.memory, data)
    }

    /// Schedules the transfer to complete with `result`/`count` once the emulated latency has
    /// elapsed. The transfer stays busy until the fake-transfer pump gets to it.
    pub fn complete_fake(&mut self, result: TransferStatus, count: usize) {
        self.transfer.fake = Some(FakeCompletion {
            expected_time: self.now_us.saturating_add(self.fake_latency_us),
            expected_result: result,
            expected_count: u32::try_from(count).unwrap_or(u32::MAX),
        });
        self.fake_transfers.push(self.transfer.id);
    }

    /// Queues `submission` for the host. It is handed over after the manager lock is released;
    /// a submission failure completes the transfer with the mapped status.
    pub fn submit_to_host(&mut self, submission: HostSubmission) {
        self.submission = Some(submission);
    }

    /// Completes the transfer on the spot; used when nothing will ever report back for it.
    pub fn complete_now(&mut self, result: TransferStatus, count: usize) {
        self.transfer
            .complete_now(result, u32::try_from(count).unwrap_or(u32::MAX));
    }
}

pub trait UsbDevice: Send {
    fn state(&self) -> &DeviceState;

    fn state_mut(&mut self) -> &mut DeviceState;

    fn open(&mut self) -> Result<()>;

    /// Releases whatever `open` acquired. The device stays on the bus.
    fn close(&mut self) {}

    /// Populates the configuration subtrees of the descriptor tree.
    fn read_descriptors(&mut self) {}

    /// Writes the current configuration value into `out`; returns the byte count.
    fn get_configuration(&mut self, out: &mut [u8]) -> usize {
        match out.first_mut() {
            Some(b) => {
                *b = self.state().current_configuration;
                1
            }
            None => 0,
        }
    }

    fn set_configuration(&mut self, value: u8) -> bool {
        self.state_mut().current_configuration = value;
        true
    }

    fn set_interface(&mut self, value: u8) -> bool {
        self.state_mut().current_interface = value;
        true
    }

    fn set_alternate_setting(&mut self, _interface: u8, _alternate_setting: u8) -> Result<()> {
        Ok(())
    }

    /// Number of interfaces in the active configuration, 0 if no configuration is known.
    fn interface_count(&self) -> u8 {
        self.state()
            .active_configuration()
            .and_then(DescriptorNode::as_configuration)
            .map_or(0, |cfg: ConfigurationDescriptor| cfg.num_interfaces)
    }

    /// Claims `interface` after checking it exists in the active configuration.
    fn claim_interface(&mut self, interface: u8) -> Result<()> {
        if interface >= self.interface_count() {
            return Err(UsbdError::InvalidArgument);
        }
        Ok(())
    }

    fn release_interface(&mut self, _interface: u8) -> Result<()> {
        Ok(())
    }

    fn control_transfer(
        &mut self,
        setup: SetupPacket,
        buffer: GuestBuffer,
        ctx: &mut TransferContext<'_>,
    );

    fn interrupt_transfer(
        &mut self,
        endpoint: u8,
        buffer: GuestBuffer,
        ctx: &mut TransferContext<'_>,
    );

    fn isochronous_transfer(&mut self, ctx: &mut TransferContext<'_>);

    /// Whether the device is still reachable. Emulated devices always are.
    fn is_connected(&self) -> bool {
        true
    }
}
