#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use aero_usbd::descriptor::DESCRIPTOR_TYPE_CONFIGURATION;
use aero_usbd::{
    CompletionSink, ConfigurationDescriptor, DescriptorNode, DeviceDescriptor, EndpointDescriptor,
    FakeClock, FlatGuestMemory, HostDeviceId, HostDeviceInfo, HostError, HostHandleId,
    HostIsoPacket, HostResult, HostTransfer, HostTransferCompletion, InterfaceDescriptor,
    SetupPacket, TransferStatus, UsbHostBackend, Usbd, UsbdConfig,
};

pub const GUEST_MEMORY_SIZE: usize = 0x1_0000;

pub const SKYLANDERS_VID: u16 = 0x1430;
pub const SKYLANDERS_PID: u16 = 0x0150;
pub const DIMENSIONS_VID: u16 = 0x0E6F;
pub const DIMENSIONS_PID: u16 = 0x0241;

#[derive(Default)]
pub struct MockState {
    pub devices: Vec<HostDeviceInfo>,
    /// Raw `GET_DESCRIPTOR(CONFIGURATION)` responses per device and index.
    pub config_descriptors: HashMap<(HostDeviceId, u8), Vec<u8>>,
    pub refs: HashMap<HostDeviceId, i32>,
    pub next_handle: HostHandleId,
    pub open_handles: HashMap<HostHandleId, HostDeviceId>,
    pub opened: Vec<HostDeviceId>,
    pub closed: Vec<HostHandleId>,
    pub claimed: Vec<(HostHandleId, u8)>,
    pub released: Vec<(HostHandleId, u8)>,
    pub configuration: u8,
    pub sync_requests: Vec<SetupPacket>,
    /// Number of submissions to reject with `Busy` before accepting.
    pub busy_submissions: usize,
    /// Rejects submissions with `Busy` until the flag is raised.
    pub busy_until: Option<Arc<AtomicBool>>,
    /// Rejects every submission with this error (after the busy ones).
    pub submit_error: Option<HostError>,
    pub submit_attempts: usize,
    pub submitted: Vec<HostTransfer>,
    pub pending_completions: VecDeque<HostTransferCompletion>,
    pub device_list_error: Option<HostError>,
}

/// Scripted host stack.
#[derive(Default)]
pub struct MockHostBackend {
    state: Mutex<MockState>,
}

impl MockHostBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn add_device(&self, info: HostDeviceInfo, config: Vec<u8>) {
        let mut state = self.state();
        state.config_descriptors.insert((info.id, 0), config);
        state.devices.push(info);
    }

    pub fn unplug(&self, id: HostDeviceId) {
        self.state().devices.retain(|d| d.id != id);
    }

    pub fn queue_completion(&self, completion: HostTransferCompletion) {
        self.state().pending_completions.push_back(completion);
    }

    pub fn submitted(&self) -> Vec<HostTransfer> {
        self.state().submitted.clone()
    }

    pub fn last_submitted(&self) -> HostTransfer {
        self.state().submitted.last().cloned().expect("no transfer submitted")
    }
}

impl UsbHostBackend for MockHostBackend {
    fn device_list(&self) -> HostResult<Vec<HostDeviceInfo>> {
        let state = self.state();
        match state.device_list_error {
            Some(err) => Err(err),
            None => Ok(state.devices.clone()),
        }
    }

    fn ref_device(&self, device: HostDeviceId) {
        *self.state().refs.entry(device).or_default() += 1;
    }

    fn unref_device(&self, device: HostDeviceId) {
        *self.state().refs.entry(device).or_default() -= 1;
    }

    fn open(&self, device: HostDeviceId) -> HostResult<HostHandleId> {
        let mut state = self.state();
        if !state.devices.iter().any(|d| d.id == device) {
            return Err(HostError::NoDevice);
        }
        state.next_handle += 1;
        let handle = state.next_handle;
        state.open_handles.insert(handle, device);
        state.opened.push(device);
        Ok(handle)
    }

    fn close(&self, handle: HostHandleId) {
        let mut state = self.state();
        state.open_handles.remove(&handle);
        state.closed.push(handle);
    }

    fn claim_interface(&self, handle: HostHandleId, interface: u8) -> HostResult<()> {
        let mut state = self.state();
        if !state.open_handles.contains_key(&handle) {
            return Err(HostError::NoDevice);
        }
        state.claimed.push((handle, interface));
        Ok(())
    }

    fn release_interface(&self, handle: HostHandleId, interface: u8) -> HostResult<()> {
        self.state().released.push((handle, interface));
        Ok(())
    }

    fn get_configuration(&self, _handle: HostHandleId) -> HostResult<u8> {
        Ok(self.state().configuration)
    }

    fn set_configuration(&self, _handle: HostHandleId, value: u8) -> HostResult<()> {
        self.state().configuration = value;
        Ok(())
    }

    fn set_interface_alt_setting(&self, _: HostHandleId, _: u8, _: u8) -> HostResult<()> {
        Ok(())
    }

    fn control_transfer_sync(
        &self,
        handle: HostHandleId,
        setup: SetupPacket,
        data: &mut [u8],
        _timeout: Duration,
    ) -> HostResult<usize> {
        let mut state = self.state();
        state.sync_requests.push(setup);
        let device = *state.open_handles.get(&handle).ok_or(HostError::NoDevice)?;
        if setup.value_high() != DESCRIPTOR_TYPE_CONFIGURATION {
            return Err(HostError::Pipe);
        }
        let bytes = state
            .config_descriptors
            .get(&(device, setup.value_low()))
            .ok_or(HostError::Pipe)?;
        let len = bytes.len().min(data.len());
        data[..len].copy_from_slice(&bytes[..len]);
        Ok(len)
    }

    fn submit_transfer(&self, transfer: &HostTransfer) -> HostResult<()> {
        let mut state = self.state();
        state.submit_attempts += 1;
        if state.busy_submissions > 0 {
            state.busy_submissions -= 1;
            return Err(HostError::Busy);
        }
        if let Some(released) = &state.busy_until {
            if !released.load(Ordering::Acquire) {
                return Err(HostError::Busy);
            }
        }
        if let Some(err) = state.submit_error {
            return Err(err);
        }
        state.submitted.push(transfer.clone());
        Ok(())
    }

    fn handle_events(&self, _timeout: Duration, sink: &CompletionSink) -> HostResult<()> {
        let completions: Vec<_> = self.state().pending_completions.drain(..).collect();
        for completion in completions {
            sink.transfer_complete(completion);
        }
        Ok(())
    }
}

pub fn device_descriptor(vendor_id: u16, product_id: u16) -> DeviceDescriptor {
    DeviceDescriptor {
        bcd_usb: 0x0200,
        max_packet_size0: 64,
        vendor_id,
        product_id,
        bcd_device: 0x0100,
        num_configurations: 1,
        ..Default::default()
    }
}

pub fn host_device(id: HostDeviceId, vendor_id: u16, product_id: u16) -> HostDeviceInfo {
    HostDeviceInfo {
        id,
        descriptor: device_descriptor(vendor_id, product_id),
        bus_number: 3,
        address: id as u8,
    }
}

/// One HID-style interface with an interrupt IN (0x81) and OUT (0x01) endpoint.
pub fn portal_config_bytes() -> Vec<u8> {
    let mut config = DescriptorNode::from_typed(&ConfigurationDescriptor {
        total_length: 0,
        num_interfaces: 1,
        configuration_value: 1,
        configuration_index: 0,
        attributes: 0x80,
        max_power: 50,
    });
    let interface = config.add_child(DescriptorNode::from_typed(&InterfaceDescriptor {
        interface_number: 0,
        num_endpoints: 2,
        interface_class: 0x03,
        ..Default::default()
    }));
    interface.add_child(DescriptorNode::from_typed(&EndpointDescriptor {
        endpoint_address: 0x81,
        attributes: 0x03,
        max_packet_size: 0x20,
        interval: 1,
    }));
    interface.add_child(DescriptorNode::from_typed(&EndpointDescriptor {
        endpoint_address: 0x01,
        attributes: 0x03,
        max_packet_size: 0x20,
        interval: 1,
    }));
    config.update_total_length();
    config.to_bytes()
}

pub fn completion(
    transfer: &HostTransfer,
    status: TransferStatus,
    data: &[u8],
) -> HostTransferCompletion {
    let mut buffer = transfer.buffer.clone();
    let offset = match transfer.kind {
        aero_usbd::HostTransferKind::Control => aero_usbd::setup::SETUP_PACKET_SIZE,
        _ => 0,
    };
    let end = (offset + data.len()).min(buffer.len());
    buffer[offset..end].copy_from_slice(&data[..end - offset]);
    HostTransferCompletion {
        user_data: transfer.user_data,
        kind: transfer.kind,
        status,
        actual_length: end - offset,
        buffer,
        iso_packets: Vec::new(),
    }
}

pub fn iso_completion(
    transfer: &HostTransfer,
    packets: &[(TransferStatus, u32)],
) -> HostTransferCompletion {
    HostTransferCompletion {
        user_data: transfer.user_data,
        kind: transfer.kind,
        status: TransferStatus::Completed,
        actual_length: packets.iter().map(|&(_, len)| len as usize).sum(),
        buffer: transfer.buffer.clone(),
        iso_packets: packets
            .iter()
            .zip(&transfer.iso_packet_lengths)
            .map(|(&(status, actual_length), &length)| HostIsoPacket {
                length: u32::from(length),
                actual_length,
                status,
            })
            .collect(),
    }
}

pub fn usbd_with(config: UsbdConfig, backend: Arc<MockHostBackend>) -> (Usbd, Arc<FakeClock>) {
    let clock = Arc::new(FakeClock::new(0));
    let usbd = Usbd::initialize(
        config,
        backend,
        Box::new(FlatGuestMemory::new(GUEST_MEMORY_SIZE)),
        clock.clone(),
    )
    .unwrap();
    (usbd, clock)
}

pub fn read_guest(usbd: &Usbd, addr: u64, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    usbd.with_memory(|mem| mem.read(addr, &mut buf));
    buf
}

pub fn write_guest(usbd: &Usbd, addr: u64, data: &[u8]) {
    usbd.with_memory(|mem| mem.write(addr, data));
}
