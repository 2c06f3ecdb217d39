//! Devices backed by real hardware on the host.
//!
//! Every request is forwarded to the [`UsbHostBackend`]. Transfers are submitted asynchronously
//! and finish when the backend reports a completion; the only synchronous host traffic is the
//! configuration-descriptor read done during enumeration.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use super::{DeviceState, TransferContext, UsbDevice};
use crate::bus::BusLocation;
use crate::descriptor::{parse_configuration, DescriptorNode, DESCRIPTOR_TYPE_CONFIGURATION};
use crate::error::{Result, UsbdError};
use crate::host::{
    HostDeviceInfo, HostHandleId, HostSubmission, HostTransfer, HostTransferKind, UsbHostBackend,
};
use crate::memory::GuestBuffer;
use crate::setup::{SetupPacket, ENDPOINT_IN, REQUEST_GET_DESCRIPTOR, SETUP_PACKET_SIZE};
use crate::transfer::{is_in_endpoint, TransferStatus, MAX_TRANSFER_LENGTH};

/// Buffer used for each `GET_DESCRIPTOR(CONFIGURATION)` read during enumeration.
const CONFIG_DESCRIPTOR_READ_SIZE: usize = 1000;

/// Interface claimed when the device is opened.
const DEFAULT_INTERFACE: u8 = 0;

pub struct PassthroughDevice {
    state: DeviceState,
    backend: Arc<dyn UsbHostBackend>,
    info: HostDeviceInfo,
    handle: Option<HostHandleId>,
    claimed: BTreeSet<u8>,
    descriptors_read: bool,
    descriptor_read_timeout: Duration,
}

impl PassthroughDevice {
    /// Takes a reference on the host device; it is dropped together with this device.
    pub fn new(
        backend: Arc<dyn UsbHostBackend>,
        info: HostDeviceInfo,
        location: BusLocation,
        descriptor_read_timeout: Duration,
    ) -> Self {
        backend.ref_device(info.id);
        Self {
            state: DeviceState::new(location, DescriptorNode::device(&info.descriptor)),
            backend,
            info,
            handle: None,
            claimed: BTreeSet::new(),
            descriptors_read: false,
            descriptor_read_timeout,
        }
    }

    pub fn info(&self) -> &HostDeviceInfo {
        &self.info
    }

    pub fn handle(&self) -> Option<HostHandleId> {
        self.handle
    }

    pub fn claimed_interfaces(&self) -> impl Iterator<Item = u8> + '_ {
        self.claimed.iter().copied()
    }

    fn read_configuration(&self, handle: HostHandleId, index: u8) -> Option<DescriptorNode> {
        let mut buf = vec![0u8; CONFIG_DESCRIPTOR_READ_SIZE];
        let setup = SetupPacket::new(
            ENDPOINT_IN,
            REQUEST_GET_DESCRIPTOR,
            (u16::from(DESCRIPTOR_TYPE_CONFIGURATION) << 8) | u16::from(index),
            0,
            CONFIG_DESCRIPTOR_READ_SIZE as u16,
        );
        let len = match self
            .backend
            .control_transfer_sync(handle, setup, &mut buf, self.descriptor_read_timeout)
        {
            Ok(len) => len.min(buf.len()),
            Err(err) => {
                error!(error = %err, index, "couldn't get the config from the device");
                return None;
            }
        };

        let config = parse_configuration(&buf[..len]);
        if config.is_none() {
            error!(index, len, "device returned a malformed configuration descriptor");
        }
        config
    }
}

impl UsbDevice for PassthroughDevice {
    fn state(&self) -> &DeviceState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut DeviceState {
        &mut self.state
    }

    fn open(&mut self) -> Result<()> {
        if self.handle.is_some() {
            return Ok(());
        }

        let handle = self.backend.open(self.info.id)?;
        if let Err(err) = self.backend.set_auto_detach_kernel_driver(handle, true) {
            debug!(error = %err, "auto-detach of kernel drivers unavailable");
        }
        if let Err(err) = self.backend.claim_interface(handle, DEFAULT_INTERFACE) {
            error!(error = %err, "failed to claim the default interface");
            self.backend.close(handle);
            return Err(err.into());
        }

        self.claimed.insert(DEFAULT_INTERFACE);
        self.handle = Some(handle);
        info!(
            vendor_id = format_args!("{:#06x}", self.info.descriptor.vendor_id),
            product_id = format_args!("{:#06x}", self.info.descriptor.product_id),
            "opened passthrough device"
        );
        Ok(())
    }

    fn close(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        for interface in std::mem::take(&mut self.claimed) {
            if let Err(err) = self.backend.release_interface(handle, interface) {
                debug!(error = %err, interface, "failed to release interface");
            }
        }
        self.backend.close(handle);
    }

    /// Reads every configuration descriptor straight from the device, once.
    ///
    /// Enumeration happens before the guest opens the device, so a temporary handle is opened
    /// when needed.
    fn read_descriptors(&mut self) {
        if self.descriptors_read {
            return;
        }

        let num_configurations = self
            .state
            .descriptors
            .as_device()
            .map_or(0, |desc| desc.num_configurations);

        let (handle, temporary) = match self.handle {
            Some(handle) => (handle, false),
            None => match self.backend.open(self.info.id) {
                Ok(handle) => (handle, true),
                Err(err) => {
                    error!(error = %err, "couldn't open device to read its descriptors");
                    return;
                }
            },
        };

        self.state.descriptors.clear_children();
        for index in 0..num_configurations {
            if let Some(config) = self.read_configuration(handle, index) {
                self.state.descriptors.add_child(config);
            }
        }

        if temporary {
            self.backend.close(handle);
        }

        self.descriptors_read =
            self.state.descriptors.children().len() == usize::from(num_configurations);
    }

    fn get_configuration(&mut self, out: &mut [u8]) -> usize {
        let (Some(handle), Some(slot)) = (self.handle, out.first_mut()) else {
            return 0;
        };
        match self.backend.get_configuration(handle) {
            Ok(value) => {
                *slot = value;
                1
            }
            Err(err) => {
                debug!(error = %err, "get_configuration failed");
                0
            }
        }
    }

    fn set_configuration(&mut self, value: u8) -> bool {
        self.state.current_configuration = value;
        let Some(handle) = self.handle else {
            return false;
        };
        self.backend.set_configuration(handle, value).is_ok()
    }

    fn set_interface(&mut self, value: u8) -> bool {
        self.state.current_interface = value;
        let Some(handle) = self.handle else {
            return false;
        };
        let claimed = self.backend.claim_interface(handle, value).is_ok();
        if claimed {
            self.claimed.insert(value);
        }
        claimed
    }

    fn set_alternate_setting(&mut self, interface: u8, alternate_setting: u8) -> Result<()> {
        let handle = self.handle.ok_or(UsbdError::NoDevice)?;
        self.backend
            .set_interface_alt_setting(handle, interface, alternate_setting)?;
        Ok(())
    }

    fn claim_interface(&mut self, interface: u8) -> Result<()> {
        if interface >= self.interface_count() {
            return Err(UsbdError::InvalidArgument);
        }
        let handle = self.handle.ok_or(UsbdError::NoDevice)?;
        if self.claimed.contains(&interface) {
            return Ok(());
        }
        self.backend.claim_interface(handle, interface)?;
        self.claimed.insert(interface);
        Ok(())
    }

    fn release_interface(&mut self, interface: u8) -> Result<()> {
        let handle = self.handle.ok_or(UsbdError::NoDevice)?;
        self.backend.release_interface(handle, interface)?;
        self.claimed.remove(&interface);
        Ok(())
    }

    fn control_transfer(
        &mut self,
        setup: SetupPacket,
        buffer: GuestBuffer,
        ctx: &mut TransferContext<'_>,
    ) {
        let Some(handle) = self.handle else {
            ctx.complete_now(TransferStatus::NoDevice, 0);
            return;
        };

        let data = buffer.truncated(MAX_TRANSFER_LENGTH);
        let wire = SetupPacket {
            w_length: data.len as u16,
            ..setup
        };

        let mut setup_buffer = Vec::with_capacity(SETUP_PACKET_SIZE + data.len);
        setup_buffer.extend_from_slice(&wire.to_bytes());
        if setup.is_device_to_host() {
            setup_buffer.resize(SETUP_PACKET_SIZE + data.len, 0);
            ctx.transfer.control_destination = Some(data);
        } else {
            setup_buffer.extend_from_slice(&ctx.read_guest(data));
            ctx.transfer.control_destination = None;
        }
        ctx.transfer.setup_buffer.clone_from(&setup_buffer);

        let transfer = HostTransfer {
            user_data: ctx.id(),
            handle,
            kind: HostTransferKind::Control,
            endpoint: 0,
            buffer: setup_buffer,
            iso_packet_lengths: Vec::new(),
            timeout: Duration::ZERO,
        };
        ctx.submit_to_host(HostSubmission::new(Arc::clone(&self.backend), transfer));
    }

    fn interrupt_transfer(
        &mut self,
        endpoint: u8,
        buffer: GuestBuffer,
        ctx: &mut TransferContext<'_>,
    ) {
        let Some(handle) = self.handle else {
            ctx.complete_now(TransferStatus::NoDevice, 0);
            return;
        };

        let buffer = buffer.truncated(MAX_TRANSFER_LENGTH);
        let data = if is_in_endpoint(endpoint) {
            ctx.transfer.endpoint_destination = Some(buffer);
            vec![0u8; buffer.len]
        } else {
            ctx.read_guest(buffer)
        };

        let transfer = HostTransfer {
            user_data: ctx.id(),
            handle,
            kind: HostTransferKind::Interrupt,
            endpoint,
            buffer: data,
            iso_packet_lengths: Vec::new(),
            timeout: Duration::ZERO,
        };
        ctx.submit_to_host(HostSubmission::new(Arc::clone(&self.backend), transfer));
    }

    fn isochronous_transfer(&mut self, ctx: &mut TransferContext<'_>) {
        let Some(handle) = self.handle else {
            ctx.complete_now(TransferStatus::NoDevice, 0);
            return;
        };

        let request = *ctx.iso_request();
        let total = request.total_length().min(request.buffer.len);
        let buffer = GuestBuffer::new(request.buffer.addr, total);

        let data = if is_in_endpoint(request.endpoint) {
            ctx.transfer.endpoint_destination = Some(buffer);
            vec![0u8; total]
        } else {
            ctx.read_guest(buffer)
        };

        let transfer = HostTransfer {
            user_data: ctx.id(),
            handle,
            kind: HostTransferKind::Isochronous,
            endpoint: request.endpoint,
            buffer: data,
            iso_packet_lengths: request.packets[..request.packet_count()].to_vec(),
            timeout: Duration::ZERO,
        };
        ctx.submit_to_host(HostSubmission::new(Arc::clone(&self.backend), transfer));
    }

    fn is_connected(&self) -> bool {
        match self.backend.device_list() {
            Ok(devices) => devices.iter().any(|d| d.id == self.info.id),
            Err(err) => {
                debug!(error = %err, "host device list unavailable");
                false
            }
        }
    }
}

impl Drop for PassthroughDevice {
    fn drop(&mut self) {
        self.close();
        self.backend.unref_device(self.info.id);
    }
}
