//! Software-only devices.
//!
//! An [`EmulatedDevice`] answers the standard device requests from its own descriptor tree and
//! string table. Every control transfer is computed synchronously but completes through the
//! fake-transfer queue, so the guest sees the same asynchronous behaviour as with real hardware.
//!
//! Anything beyond the standard requests (class/vendor requests, interrupt endpoints) is up to an
//! optional [`EmulatedPeripheral`]. Without one, such control requests produce no data and
//! interrupt/isochronous transfers are never completed, like an endpoint that keeps NAKing.

use bitflags::bitflags;
use tracing::{debug, warn};

use super::{DeviceState, TransferContext, UsbDevice};
use crate::bus::BusLocation;
use crate::config::EmulatedDeviceConfig;
use crate::descriptor::{
    ConfigurationDescriptor, DescriptorNode, DeviceDescriptor, EndpointDescriptor, HidDescriptor,
    InterfaceDescriptor, DESCRIPTOR_TYPE_CONFIGURATION, DESCRIPTOR_TYPE_DEVICE,
    DESCRIPTOR_TYPE_STRING,
};
use crate::error::Result;
use crate::memory::GuestBuffer;
use crate::setup::{
    RequestDirection, RequestRecipient, RequestType, SetupPacket, REQUEST_GET_CONFIGURATION,
    REQUEST_GET_DESCRIPTOR, REQUEST_GET_STATUS, REQUEST_SET_CONFIGURATION, REQUEST_SET_INTERFACE,
};
use crate::transfer::{is_in_endpoint, TransferStatus, MAX_TRANSFER_LENGTH};

/// English (United States).
pub const LANGID_EN_US: u16 = 0x0409;

/// Largest string descriptor `bLength` that still ends on a whole UTF-16 code unit.
const MAX_STRING_DESCRIPTOR_LEN: usize = 0xFE;

const HID_REPORT_DESCRIPTOR_TYPE: u8 = 0x22;

bitflags! {
    /// `GET_STATUS(DEVICE)` status word.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct DeviceStatus: u16 {
        const SELF_POWERED = 1 << 0;
        const REMOTE_WAKEUP = 1 << 1;
    }
}

/// Device-specific behaviour layered on top of an [`EmulatedDevice`].
pub trait EmulatedPeripheral: Send {
    /// Handles a control request the standard dispatch did not recognise.
    ///
    /// `data` is the guest buffer: filled with the OUT data stage for host-to-device requests,
    /// zeroed for device-to-host requests. Returns the number of bytes consumed/produced, or
    /// `None` if the request is not handled either.
    fn control_request(&mut self, _setup: SetupPacket, _data: &mut [u8]) -> Option<usize> {
        None
    }

    /// Services an interrupt transfer. Same buffer convention as [`Self::control_request`];
    /// `None` leaves the transfer pending.
    fn interrupt_transfer(&mut self, _endpoint: u8, _data: &mut [u8]) -> Option<usize> {
        None
    }
}

pub struct EmulatedDevice {
    state: DeviceState,
    strings: Vec<String>,
    status: DeviceStatus,
    peripheral: Option<Box<dyn EmulatedPeripheral>>,
}

impl EmulatedDevice {
    /// A device with only a device descriptor; add configurations with
    /// [`EmulatedDevice::add_configuration`].
    pub fn new(descriptor: DeviceDescriptor, location: BusLocation) -> Self {
        Self {
            state: DeviceState::new(location, DescriptorNode::device(&descriptor)),
            strings: Vec::new(),
            status: DeviceStatus::empty(),
            peripheral: None,
        }
    }

    /// Builds a device with a single configuration from static parameters.
    pub fn from_config(config: &EmulatedDeviceConfig, location: BusLocation) -> Self {
        let mut strings = Vec::new();
        let mut string_index = |s: &Option<String>| match s {
            Some(s) => {
                strings.push(s.clone());
                strings.len() as u8
            }
            None => 0,
        };
        let manufacturer_index = string_index(&config.manufacturer);
        let product_index = string_index(&config.product);
        let serial_number_index = string_index(&config.serial_number);

        let descriptor = DeviceDescriptor {
            bcd_usb: config.bcd_usb,
            device_class: config.device_class,
            device_subclass: config.device_subclass,
            device_protocol: config.device_protocol,
            max_packet_size0: config.max_packet_size0,
            vendor_id: config.vendor_id,
            product_id: config.product_id,
            bcd_device: config.bcd_device,
            manufacturer_index,
            product_index,
            serial_number_index,
            num_configurations: 0,
        };

        let mut configuration = DescriptorNode::from_typed(&ConfigurationDescriptor {
            total_length: 0,
            num_interfaces: config.interfaces.len() as u8,
            configuration_value: 1,
            configuration_index: 0,
            attributes: if config.self_powered { 0xC0 } else { 0x80 },
            max_power: config.max_power,
        });
        for (number, iface) in config.interfaces.iter().enumerate() {
            let node = configuration.add_child(DescriptorNode::from_typed(&InterfaceDescriptor {
                interface_number: number as u8,
                alternate_setting: 0,
                num_endpoints: iface.endpoints.len() as u8,
                interface_class: iface.interface_class,
                interface_subclass: iface.interface_subclass,
                interface_protocol: iface.interface_protocol,
                interface_index: 0,
            }));
            if let Some(report_descriptor_length) = iface.hid_report_descriptor_length {
                node.add_child(DescriptorNode::from_typed(&HidDescriptor {
                    bcd_hid: 0x0111,
                    country_code: 0,
                    num_descriptors: 1,
                    report_descriptor_type: HID_REPORT_DESCRIPTOR_TYPE,
                    report_descriptor_length,
                }));
            }
            for ep in &iface.endpoints {
                node.add_child(DescriptorNode::from_typed(&EndpointDescriptor {
                    endpoint_address: ep.address,
                    attributes: ep.attributes,
                    max_packet_size: ep.max_packet_size,
                    interval: ep.interval,
                }));
            }
        }

        let mut device = Self::new(descriptor, location);
        device.strings = strings;
        if config.self_powered {
            device.status |= DeviceStatus::SELF_POWERED;
        }
        device.add_configuration(configuration);
        device
    }

    pub fn with_peripheral(mut self, peripheral: Box<dyn EmulatedPeripheral>) -> Self {
        self.peripheral = Some(peripheral);
        self
    }

    /// Appends a configuration subtree, fixing up its `wTotalLength` and the device
    /// descriptor's `bNumConfigurations`.
    pub fn add_configuration(&mut self, mut configuration: DescriptorNode) {
        configuration.update_total_length();
        let root = &mut self.state.descriptors;
        root.add_child(configuration);

        if let Some(mut desc) = root.as_device() {
            desc.num_configurations = root.children().len() as u8;
            root.set_typed(&desc);
        }
    }

    /// Adds a string to the string table and returns its descriptor index (starting at 1).
    pub fn add_string(&mut self, s: impl Into<String>) -> u8 {
        self.strings.push(s.into());
        self.strings.len() as u8
    }

    pub fn status(&self) -> DeviceStatus {
        self.status
    }

    pub fn set_status(&mut self, status: DeviceStatus) {
        self.status = status;
    }

    /// Builds a `GET_DESCRIPTOR` response into `out`. Responses larger than `out` are truncated;
    /// the return value is the number of bytes written. Unknown descriptors produce nothing.
    pub fn get_descriptor(&self, descriptor_type: u8, index: u8, out: &mut [u8]) -> usize {
        let root = &self.state.descriptors;
        let response = match descriptor_type {
            DESCRIPTOR_TYPE_DEVICE => root.raw_bytes(),
            DESCRIPTOR_TYPE_CONFIGURATION => match root.children().get(usize::from(index)) {
                Some(config) => config.raw_bytes(),
                None => {
                    debug!(index, "configuration descriptor index out of range");
                    return 0;
                }
            },
            DESCRIPTOR_TYPE_STRING if index == 0 => string_descriptor_langid(LANGID_EN_US).to_vec(),
            DESCRIPTOR_TYPE_STRING => match self.strings.get(usize::from(index) - 1) {
                Some(s) => string_descriptor_utf16le(s),
                None => {
                    debug!(index, "string descriptor index out of range");
                    return 0;
                }
            },
            _ => {
                warn!(descriptor_type, index, "unhandled descriptor type");
                return 0;
            }
        };

        let len = response.len().min(out.len());
        out[..len].copy_from_slice(&response[..len]);
        len
    }

    /// Writes the 2-byte device status word. Returns the bytes written.
    pub fn get_status(self_powered: bool, remote_wakeup: bool, out: &mut [u8]) -> usize {
        let mut status = DeviceStatus::empty();
        status.set(DeviceStatus::SELF_POWERED, self_powered);
        status.set(DeviceStatus::REMOTE_WAKEUP, remote_wakeup);

        let bytes = status.bits().to_le_bytes();
        let len = bytes.len().min(out.len());
        out[..len].copy_from_slice(&bytes[..len]);
        len
    }

    /// Returns the byte count produced (IN) or accepted (OUT), or `None` if nothing handled it.
    fn dispatch_control(&mut self, setup: SetupPacket, data: &mut [u8]) -> Option<usize> {
        use RequestDirection::{DeviceToHost, HostToDevice};
        use RequestRecipient::{Device, Interface};
        use RequestType::Standard;

        let key = (
            setup.request_direction(),
            setup.request_type(),
            setup.recipient(),
            setup.b_request,
        );
        match key {
            (HostToDevice, Standard, Device, REQUEST_SET_CONFIGURATION) => {
                self.set_configuration(setup.value_low());
                Some(data.len())
            }
            (HostToDevice, Standard, Interface, REQUEST_SET_INTERFACE) => {
                self.set_interface(setup.w_index as u8);
                Some(data.len())
            }
            (DeviceToHost, Standard, Device, REQUEST_GET_STATUS) => {
                Some(Self::get_status(
                    self.status.contains(DeviceStatus::SELF_POWERED),
                    self.status.contains(DeviceStatus::REMOTE_WAKEUP),
                    data,
                ))
            }
            (DeviceToHost, Standard, Device, REQUEST_GET_DESCRIPTOR) => {
                Some(self.get_descriptor(setup.value_high(), setup.value_low(), data))
            }
            (DeviceToHost, Standard, Device, REQUEST_GET_CONFIGURATION) => {
                Some(self.get_configuration(data))
            }
            _ => self
                .peripheral
                .as_mut()
                .and_then(|p| p.control_request(setup, data)),
        }
    }
}

fn string_descriptor_langid(langid: u16) -> [u8; 4] {
    let [l0, l1] = langid.to_le_bytes();
    [4, DESCRIPTOR_TYPE_STRING, l0, l1]
}

/// UTF-16LE string descriptor, truncated to 254 bytes overall.
fn string_descriptor_utf16le(s: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + s.len() * 2);
    out.push(0); // bLength placeholder
    out.push(DESCRIPTOR_TYPE_STRING);
    for unit in s.encode_utf16() {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    out.truncate(MAX_STRING_DESCRIPTOR_LEN);
    out[0] = out.len() as u8;
    out
}

impl UsbDevice for EmulatedDevice {
    fn state(&self) -> &DeviceState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut DeviceState {
        &mut self.state
    }

    fn open(&mut self) -> Result<()> {
        Ok(())
    }

    fn control_transfer(
        &mut self,
        setup: SetupPacket,
        buffer: GuestBuffer,
        ctx: &mut TransferContext<'_>,
    ) {
        let buffer = buffer.truncated(usize::from(setup.w_length));
        let device_to_host = setup.is_device_to_host();
        let mut data = if device_to_host {
            vec![0u8; buffer.len]
        } else {
            ctx.read_guest(buffer)
        };

        let count = match self.dispatch_control(setup, &mut data) {
            Some(count) => count.min(data.len()),
            None => {
                warn!(
                    bm_request_type = setup.bm_request_type,
                    b_request = setup.b_request,
                    w_value = setup.w_value,
                    w_index = setup.w_index,
                    "unhandled control transfer"
                );
                0
            }
        };

        if device_to_host {
            ctx.write_guest(buffer, &data[..count]);
        }
        ctx.complete_fake(TransferStatus::Completed, count);
    }

    fn interrupt_transfer(
        &mut self,
        endpoint: u8,
        buffer: GuestBuffer,
        ctx: &mut TransferContext<'_>,
    ) {
        let Some(peripheral) = self.peripheral.as_mut() else {
            return;
        };

        let buffer = buffer.truncated(MAX_TRANSFER_LENGTH);
        let device_to_host = is_in_endpoint(endpoint);
        let mut data = if device_to_host {
            vec![0u8; buffer.len]
        } else {
            ctx.read_guest(buffer)
        };

        if let Some(count) = peripheral.interrupt_transfer(endpoint, &mut data) {
            let count = count.min(data.len());
            if device_to_host {
                ctx.write_guest(buffer, &data[..count]);
            }
            ctx.complete_fake(TransferStatus::Completed, count);
        }
    }

    fn isochronous_transfer(&mut self, _ctx: &mut TransferContext<'_>) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{FlatGuestMemory, GuestMemory};
    use crate::transfer::{FakeTransferQueue, TransferPool};

    fn device() -> EmulatedDevice {
        EmulatedDevice::new(
            DeviceDescriptor {
                bcd_usb: 0x0200,
                max_packet_size0: 64,
                vendor_id: 0x1430,
                product_id: 0x0150,
                num_configurations: 1,
                ..Default::default()
            },
            BusLocation::from_index(1),
        )
    }

    #[test]
    fn device_descriptor_is_raw_root_bytes() {
        let dev = device();
        let mut buf = [0u8; 18];
        assert_eq!(dev.get_descriptor(DESCRIPTOR_TYPE_DEVICE, 0, &mut buf), 18);
        assert_eq!(&buf[..2], &[18, DESCRIPTOR_TYPE_DEVICE]);
        assert_eq!(&buf[8..10], &0x1430u16.to_le_bytes());
        assert_eq!(buf[17], 1);
    }

    #[test]
    fn short_buffers_get_the_header_prefix() {
        let dev = device();
        let mut buf = [0u8; 1];
        assert_eq!(dev.get_descriptor(DESCRIPTOR_TYPE_DEVICE, 0, &mut buf), 1);
        assert_eq!(buf, [18]);
        assert_eq!(dev.get_descriptor(DESCRIPTOR_TYPE_DEVICE, 0, &mut []), 0);
    }

    #[test]
    fn string_descriptors() {
        let mut dev = device();
        assert_eq!(dev.add_string("Portal"), 1);

        let mut buf = [0u8; 64];
        assert_eq!(dev.get_descriptor(DESCRIPTOR_TYPE_STRING, 0, &mut buf), 4);
        assert_eq!(&buf[..4], &[4, 3, 0x09, 0x04]);

        assert_eq!(dev.get_descriptor(DESCRIPTOR_TYPE_STRING, 1, &mut buf), 14);
        assert_eq!(&buf[..6], &[14, 3, b'P', 0, b'o', 0]);

        assert_eq!(dev.get_descriptor(DESCRIPTOR_TYPE_STRING, 2, &mut buf), 0);
    }

    #[test]
    fn long_strings_are_cut_on_a_code_unit_boundary() {
        let mut dev = device();
        dev.add_string("x".repeat(300));
        let mut buf = [0u8; 512];
        assert_eq!(dev.get_descriptor(DESCRIPTOR_TYPE_STRING, 1, &mut buf), 254);
        assert_eq!(buf[0], 254);
        assert_eq!(&buf[252..254], &[b'x', 0]);
    }

    #[test]
    fn missing_configuration_and_unknown_types_produce_nothing() {
        let dev = device();
        let mut buf = [0u8; 64];
        assert_eq!(dev.get_descriptor(DESCRIPTOR_TYPE_CONFIGURATION, 0, &mut buf), 0);
        assert_eq!(dev.get_descriptor(0x22, 0, &mut buf), 0);
    }

    #[test]
    fn status_word() {
        let mut buf = [0xFFu8; 2];
        assert_eq!(EmulatedDevice::get_status(false, false, &mut buf), 2);
        assert_eq!(buf, [0, 0]);
        assert_eq!(EmulatedDevice::get_status(true, true, &mut buf), 2);
        assert_eq!(buf, [3, 0]);
        let mut one = [0u8; 1];
        assert_eq!(EmulatedDevice::get_status(true, false, &mut one), 1);
        assert_eq!(one, [1]);
    }

    #[test]
    fn control_transfer_schedules_fake_completion() {
        let mut dev = device();
        let mut pool = TransferPool::new(4);
        let mut queue = FakeTransferQueue::default();
        let mut mem = FlatGuestMemory::new(0x1000);
        let id = pool.allocate().unwrap();

        {
            let transfer = pool.get_mut(id).unwrap();
            let mut ctx = TransferContext::new(transfer, &mut mem, &mut queue, 1_000, 100);
            let setup = SetupPacket::new(0x80, REQUEST_GET_DESCRIPTOR, 0x0100, 0, 18);
            dev.control_transfer(setup, GuestBuffer::new(0x100, 18), &mut ctx);
        }

        let transfer = pool.get(id).unwrap();
        assert!(transfer.is_busy());
        assert!(transfer.is_fake());
        assert_eq!(queue.len(), 1);

        let mut out = [0u8; 2];
        mem.read(0x100, &mut out);
        assert_eq!(out, [18, 1]);

        assert_eq!(queue.pump(&mut pool, 1_099), 0);
        assert_eq!(queue.pump(&mut pool, 1_100), 1);
        let transfer = pool.get(id).unwrap();
        assert!(!transfer.is_busy());
        assert_eq!(transfer.byte_count(), 18);
    }

    #[test]
    fn set_configuration_and_interface_are_stored() {
        let mut dev = device();
        let mut pool = TransferPool::new(4);
        let mut queue = FakeTransferQueue::default();
        let mut mem = FlatGuestMemory::new(0x100);

        for setup in [
            SetupPacket::new(0x00, REQUEST_SET_CONFIGURATION, 2, 0, 0),
            SetupPacket::new(0x01, REQUEST_SET_INTERFACE, 0, 3, 0),
        ] {
            let id = pool.allocate().unwrap();
            let transfer = pool.get_mut(id).unwrap();
            let mut ctx = TransferContext::new(transfer, &mut mem, &mut queue, 0, 100);
            dev.control_transfer(setup, GuestBuffer::new(0, 0), &mut ctx);
        }

        assert_eq!(dev.state().current_configuration, 2);
        assert_eq!(dev.state().current_interface, 3);
    }

    struct Echo;

    impl EmulatedPeripheral for Echo {
        fn control_request(&mut self, setup: SetupPacket, data: &mut [u8]) -> Option<usize> {
            (setup.b_request == 0x01).then(|| {
                data.fill(0x5A);
                data.len()
            })
        }

        fn interrupt_transfer(&mut self, _endpoint: u8, data: &mut [u8]) -> Option<usize> {
            data[0] = 0xAB;
            Some(1)
        }
    }

    #[test]
    fn peripheral_handles_class_requests_and_interrupts() {
        let mut dev = device().with_peripheral(Box::new(Echo));
        let mut pool = TransferPool::new(4);
        let mut queue = FakeTransferQueue::default();
        let mut mem = FlatGuestMemory::new(0x100);

        let id = pool.allocate().unwrap();
        {
            let transfer = pool.get_mut(id).unwrap();
            let mut ctx = TransferContext::new(transfer, &mut mem, &mut queue, 0, 100);
            dev.control_transfer(
                SetupPacket::new(0xA1, 0x01, 0x0100, 0, 4),
                GuestBuffer::new(0x10, 4),
                &mut ctx,
            );
        }
        let id2 = pool.allocate().unwrap();
        {
            let transfer = pool.get_mut(id2).unwrap();
            let mut ctx = TransferContext::new(transfer, &mut mem, &mut queue, 0, 100);
            dev.interrupt_transfer(0x81, GuestBuffer::new(0x20, 8), &mut ctx);
        }
        assert_eq!(queue.pump(&mut pool, 100), 2);
        assert_eq!(pool.get(id).unwrap().byte_count(), 4);
        assert_eq!(pool.get(id2).unwrap().byte_count(), 1);
        assert_eq!(&mem.as_slice()[0x10..0x14], &[0x5A; 4]);
        assert_eq!(mem.as_slice()[0x20], 0xAB);
    }

    #[test]
    fn interrupts_without_peripheral_stay_pending() {
        let mut dev = device();
        let mut pool = TransferPool::new(4);
        let mut queue = FakeTransferQueue::default();
        let mut mem = FlatGuestMemory::new(0x100);
        let id = pool.allocate().unwrap();
        {
            let transfer = pool.get_mut(id).unwrap();
            let mut ctx = TransferContext::new(transfer, &mut mem, &mut queue, 0, 100);
            dev.interrupt_transfer(0x81, GuestBuffer::new(0, 32), &mut ctx);
        }
        assert!(queue.is_empty());
        assert!(pool.get(id).unwrap().is_busy());
    }
}
