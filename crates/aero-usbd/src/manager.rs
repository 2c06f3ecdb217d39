//! Device manager: the transfer pool, the device lists and bus virtualization.
//!
//! All state lives behind the single lock [`crate::Usbd`] keeps around the manager. The
//! allocator, both completion paths and every device-list mutation run under it.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::bus::{BusLocation, BusRecord, DeviceList, UsbSpeed};
use crate::device::{lock_device, SharedUsbDevice, TransferContext, UsbDevice};
use crate::error::{HostError, Result, UsbdError};
use crate::host::{HostSubmission, HostTransferCompletion};
use crate::memory::{GuestBuffer, GuestMemory};
use crate::setup::SetupPacket;
use crate::transfer::{
    FakeTransferQueue, IsoRequest, IsochronousResult, Transfer, TransferId, TransferPool,
    TransferResult, TransferStatus, TransferSummary, MAX_ISO_PACKETS,
};

/// Guest-held reference to an opened device.
#[derive(Clone)]
pub struct UsbDeviceHandle {
    device: SharedUsbDevice,
    location: BusLocation,
    bus_number: u8,
}

impl UsbDeviceHandle {
    pub fn location(&self) -> BusLocation {
        self.location
    }

    /// Bus number of the record the handle was opened from.
    pub fn bus_number(&self) -> u8 {
        self.bus_number
    }

    pub fn device(&self) -> &SharedUsbDevice {
        &self.device
    }
}

impl std::fmt::Debug for UsbDeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsbDeviceHandle")
            .field("location", &self.location)
            .field("bus_number", &self.bus_number)
            .finish()
    }
}

/// A transfer the manager accepted. Passthrough transfers still have to be handed to the host,
/// which [`crate::Usbd`] does once the manager lock is released.
#[derive(Debug)]
pub struct Dispatched {
    pub id: TransferId,
    pub submission: Option<HostSubmission>,
}

#[derive(Clone)]
struct DeviceSlot {
    location: BusLocation,
    device: SharedUsbDevice,
}

pub struct DeviceManager {
    transfers: TransferPool,
    fake_transfers: FakeTransferQueue,
    devices: Vec<DeviceSlot>,
    open_devices: Vec<DeviceSlot>,
    next_session_id: u64,
    location_counter: u8,
    memory: Box<dyn GuestMemory>,
    fake_latency_us: u64,
}

impl DeviceManager {
    pub fn new(
        transfer_pool_size: usize,
        fake_latency_us: u64,
        memory: Box<dyn GuestMemory>,
    ) -> Self {
        Self {
            transfers: TransferPool::new(transfer_pool_size),
            fake_transfers: FakeTransferQueue::default(),
            devices: Vec::new(),
            open_devices: Vec::new(),
            next_session_id: 0,
            location_counter: 0,
            memory,
            fake_latency_us,
        }
    }

    /// Hands out a location for a device about to be attached.
    pub fn new_location(&mut self) -> BusLocation {
        self.location_counter = self.location_counter.wrapping_add(1);
        BusLocation::from_index(self.location_counter)
    }

    /// Adds a device to the bus. It becomes visible on the next enumeration.
    pub fn attach_device(&mut self, device: SharedUsbDevice) -> BusLocation {
        let location = lock_device(&device).state().location;
        if self.devices.iter().any(|slot| slot.location == location) {
            warn!(?location, "replacing device already attached at this location");
            self.disconnect_location(location, true);
        }
        self.devices.push(DeviceSlot { location, device });
        location
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn open_device_count(&self) -> usize {
        self.open_devices.len()
    }

    pub fn is_open(&self, location: BusLocation) -> bool {
        self.open_devices.iter().any(|slot| slot.location == location)
    }

    pub fn has_fake_transfers(&self) -> bool {
        !self.fake_transfers.is_empty()
    }

    pub fn memory_mut(&mut self) -> &mut dyn GuestMemory {
        &mut *self.memory
    }

    /// Synthesizes a fresh bus record for every known device.
    pub fn enumerate(&mut self) -> DeviceList {
        let mut records = Vec::with_capacity(self.devices.len());
        for (index, slot) in self.devices.iter().enumerate() {
            let Ok(bus_number) = u8::try_from(index + 1) else {
                warn!(devices = self.devices.len(), "too many devices to enumerate");
                break;
            };

            let session_id = self.next_session_id;
            self.next_session_id += 1;

            let mut device = lock_device(&slot.device);
            device.read_descriptors();
            let descriptor = device.state().descriptors.as_device().unwrap_or_default();

            // Addresses wrap, but they are the best stable approximation we have.
            let address = session_id as u8;
            records.push(Arc::new(BusRecord {
                session_id,
                bus_number,
                device_address: address,
                port_number: address,
                speed: UsbSpeed::infer(descriptor.max_packet_size0, descriptor.bcd_usb),
                descriptor,
                location: slot.location,
            }));
        }
        debug!(count = records.len(), "enumerated usb devices");
        DeviceList::new(records)
    }

    /// Resolves `record` to its device by bus number, opens it and adds it to the open list.
    ///
    /// Records from an older enumeration can point at a bus number that now belongs to another
    /// device; the location stored in the record settles that.
    pub fn open(&mut self, record: &BusRecord) -> Result<UsbDeviceHandle> {
        let by_bus_number = usize::from(record.bus_number)
            .checked_sub(1)
            .and_then(|index| self.devices.get(index))
            .filter(|slot| slot.location == record.location);
        let slot = by_bus_number
            .or_else(|| self.devices.iter().find(|slot| slot.location == record.location))
            .cloned()
            .ok_or(UsbdError::NoDevice)?;

        {
            let mut device = lock_device(&slot.device);
            if let Err(err) = device.open() {
                error!(
                    error = %err,
                    vendor_id = format_args!("{:#06x}", record.descriptor.vendor_id),
                    product_id = format_args!("{:#06x}", record.descriptor.product_id),
                    "failed to open usb device"
                );
                return Err(err);
            }
        }

        if !self.is_open(slot.location) {
            self.open_devices.push(slot.clone());
        }
        info!(
            vendor_id = format_args!("{:#06x}", record.descriptor.vendor_id),
            product_id = format_args!("{:#06x}", record.descriptor.product_id),
            "usb device opened"
        );

        Ok(UsbDeviceHandle {
            device: slot.device,
            location: slot.location,
            bus_number: record.bus_number,
        })
    }

    pub fn open_device_with_ids(
        &mut self,
        vendor_id: u16,
        product_id: u16,
    ) -> Result<UsbDeviceHandle> {
        let list = self.enumerate();
        let record = list
            .find_by_ids(vendor_id, product_id)
            .cloned()
            .ok_or(UsbdError::NoDevice)?;
        self.open(&record)
    }

    /// Removes the device from the open list and, with `remove_from_bus`, from the bus.
    /// Calling it again for a device that is already gone does nothing.
    pub fn disconnect(&mut self, handle: &UsbDeviceHandle, remove_from_bus: bool) {
        self.disconnect_location(handle.location, remove_from_bus);
    }

    /// Closes the device but leaves it on the bus.
    pub fn close(&mut self, handle: &UsbDeviceHandle) {
        self.disconnect_location(handle.location, false);
    }

    fn disconnect_location(&mut self, location: BusLocation, remove_from_bus: bool) {
        if let Some(pos) = self.open_devices.iter().position(|s| s.location == location) {
            let slot = self.open_devices.remove(pos);
            lock_device(&slot.device).close();
            info!(?location, "usb device unassigned");
        }
        if remove_from_bus {
            if let Some(pos) = self.devices.iter().position(|s| s.location == location) {
                self.devices.remove(pos);
                info!(?location, "usb device removed from bus");
            }
        }
    }

    fn known_device(&self, location: BusLocation) -> Result<SharedUsbDevice> {
        self.devices
            .iter()
            .find(|slot| slot.location == location)
            .map(|slot| slot.device.clone())
            .ok_or(UsbdError::NoDevice)
    }

    fn opened_device(&self, handle: &UsbDeviceHandle) -> Result<SharedUsbDevice> {
        self.open_devices
            .iter()
            .find(|slot| slot.location == handle.location)
            .map(|slot| slot.device.clone())
            .ok_or(UsbdError::NoDevice)
    }

    pub fn check_connected(&self, handle: &UsbDeviceHandle) -> Result<()> {
        let device = self.known_device(handle.location)?;
        if lock_device(&device).is_connected() {
            Ok(())
        } else {
            Err(UsbdError::NoDevice)
        }
    }

    pub fn claim_interface(&mut self, handle: &UsbDeviceHandle, interface: u8) -> Result<()> {
        let device = self.opened_device(handle)?;
        let mut device = lock_device(&device);
        device.read_descriptors();
        device.claim_interface(interface)
    }

    pub fn release_interface(&mut self, handle: &UsbDeviceHandle, interface: u8) -> Result<()> {
        let device = self.opened_device(handle)?;
        let result = lock_device(&device).release_interface(interface);
        result
    }

    pub fn get_configuration(&mut self, handle: &UsbDeviceHandle) -> Result<u8> {
        let device = self.opened_device(handle)?;
        let mut value = [0u8; 1];
        let count = lock_device(&device).get_configuration(&mut value);
        if count == 0 {
            return Err(UsbdError::Io);
        }
        Ok(value[0])
    }

    pub fn set_configuration(&mut self, handle: &UsbDeviceHandle, value: u8) -> Result<()> {
        let device = self.opened_device(handle)?;
        let ok = lock_device(&device).set_configuration(value);
        if ok {
            Ok(())
        } else {
            Err(UsbdError::Io)
        }
    }

    pub fn set_interface_alt_setting(
        &mut self,
        handle: &UsbDeviceHandle,
        interface: u8,
        alternate_setting: u8,
    ) -> Result<()> {
        let device = self.opened_device(handle)?;
        let result = lock_device(&device).set_alternate_setting(interface, alternate_setting);
        result
    }

    /// Serialized configuration `index` (the configuration descriptor followed by everything
    /// nested in it).
    pub fn config_descriptor(&mut self, location: BusLocation, index: u8) -> Result<Vec<u8>> {
        let device = self.known_device(location)?;
        let mut device = lock_device(&device);
        device.read_descriptors();
        device
            .state()
            .descriptors
            .children()
            .get(usize::from(index))
            .map(|config| config.to_bytes())
            .ok_or(UsbdError::NotFound)
    }

    /// `wMaxPacketSize` of `endpoint` in the active configuration.
    pub fn max_packet_size(&mut self, location: BusLocation, endpoint: u8) -> Result<u16> {
        let device = self.known_device(location)?;
        let mut device = lock_device(&device);
        device.read_descriptors();
        device
            .state()
            .active_configuration()
            .and_then(|config| config.find_endpoint(endpoint))
            .map(|ep| ep.max_packet_size)
            .ok_or(UsbdError::NotFound)
    }

    /// Claims a transfer slot and hands it to the device behind `handle`.
    fn dispatch<P, F>(
        &mut self,
        handle: &UsbDeviceHandle,
        now_us: u64,
        prepare: P,
        f: F,
    ) -> Result<Dispatched>
    where
        P: FnOnce(&mut Transfer),
        F: FnOnce(&mut dyn UsbDevice, &mut TransferContext<'_>),
    {
        let device = self.opened_device(handle)?;
        let id = self.transfers.allocate().ok_or(UsbdError::Busy)?;
        let transfer = self.transfers.get_mut(id).ok_or(UsbdError::Fatal)?;
        transfer.owner = Some(handle.location);
        prepare(transfer);

        let mut ctx = TransferContext::new(
            transfer,
            &mut *self.memory,
            &mut self.fake_transfers,
            now_us,
            self.fake_latency_us,
        );
        f(&mut *lock_device(&device), &mut ctx);
        Ok(Dispatched {
            id,
            submission: ctx.submission.take(),
        })
    }

    pub fn submit_control(
        &mut self,
        handle: &UsbDeviceHandle,
        setup: SetupPacket,
        buffer: GuestBuffer,
        now_us: u64,
    ) -> Result<Dispatched> {
        let dispatched = self.dispatch(handle, now_us, |_| {}, |device, ctx| {
            device.control_transfer(setup, buffer, ctx)
        })?;
        debug!(
            transfer = %dispatched.id,
            b_request = setup.b_request,
            "control transfer dispatched"
        );
        Ok(dispatched)
    }

    pub fn submit_interrupt(
        &mut self,
        handle: &UsbDeviceHandle,
        endpoint: u8,
        buffer: GuestBuffer,
        now_us: u64,
    ) -> Result<Dispatched> {
        let dispatched = self.dispatch(handle, now_us, |_| {}, |device, ctx| {
            device.interrupt_transfer(endpoint, buffer, ctx)
        })?;
        debug!(transfer = %dispatched.id, endpoint, "interrupt transfer dispatched");
        Ok(dispatched)
    }

    pub fn submit_isochronous(
        &mut self,
        handle: &UsbDeviceHandle,
        request: IsoRequest,
        now_us: u64,
    ) -> Result<Dispatched> {
        if request.num_packets as usize > MAX_ISO_PACKETS {
            return Err(UsbdError::InvalidArgument);
        }
        let dispatched = self.dispatch(
            handle,
            now_us,
            |transfer| transfer.iso_request = request,
            |device, ctx| device.isochronous_transfer(ctx),
        )?;
        debug!(
            transfer = %dispatched.id,
            endpoint = request.endpoint,
            "isochronous transfer dispatched"
        );
        Ok(dispatched)
    }

    /// Applies a completion reported by the host stack. A `NoDevice` status also disconnects
    /// the device that owned the transfer.
    pub fn complete_host_transfer(&mut self, completion: HostTransferCompletion) {
        let Some(transfer) = self.transfers.get_mut(completion.user_data) else {
            warn!(transfer = %completion.user_data, "completion for unknown transfer");
            return;
        };
        if !transfer.is_busy() || transfer.is_fake() {
            warn!(transfer = %completion.user_data, "stale completion ignored");
            return;
        }

        transfer.apply_host_completion(&completion, &mut *self.memory);
        let owner = transfer.owner;

        if completion.status == TransferStatus::NoDevice {
            if let Some(location) = owner {
                self.disconnect_location(location, true);
            }
        }
    }

    /// Finishes a transfer the host refused to accept.
    pub fn fail_host_submission(&mut self, id: TransferId, err: HostError) {
        let Some(transfer) = self.transfers.get_mut(id) else {
            return;
        };
        if transfer.is_busy() && !transfer.is_fake() {
            transfer.complete_now(TransferStatus::from(err), 0);
        }
    }

    /// Completes every fake transfer due at `now_us`.
    pub fn pump_fake_transfers(&mut self, now_us: u64) -> usize {
        self.fake_transfers.pump(&mut self.transfers, now_us)
    }

    pub fn transfer_result(&self, id: TransferId) -> Result<TransferResult> {
        let transfer = self.transfers.get(id).ok_or(UsbdError::InvalidArgument)?;
        Ok(TransferResult {
            busy: transfer.is_busy(),
            status: transfer.result(),
            actual_length: transfer.byte_count(),
        })
    }

    pub fn isochronous_result(&self, id: TransferId) -> Result<IsochronousResult> {
        let transfer = self.transfers.get(id).ok_or(UsbdError::InvalidArgument)?;
        let request = &transfer.iso_request;
        Ok(IsochronousResult {
            busy: transfer.is_busy(),
            status: transfer.result(),
            start_frame: request.start_frame,
            packets: request.packets[..request.packet_count()].to_vec(),
        })
    }

    pub fn transfer_summary(&self) -> TransferSummary {
        TransferSummary {
            capacity: self.transfers.capacity(),
            busy: self.transfers.busy_count(),
            pending_fake: self.fake_transfers.len(),
        }
    }

    /// Drops every device. Passthrough devices release their host handles as the last
    /// reference goes away.
    pub fn clear(&mut self) {
        for slot in self.open_devices.drain(..) {
            lock_device(&slot.device).close();
        }
        self.devices.clear();
    }
}
