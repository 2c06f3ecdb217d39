mod util;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use aero_usbd::setup::{
    REQUEST_GET_CONFIGURATION, REQUEST_GET_DESCRIPTOR, REQUEST_GET_STATUS,
    REQUEST_SET_CONFIGURATION,
};
use aero_usbd::transfer::MAX_TRANSFER_LENGTH;
use aero_usbd::{
    EmulatedDevice, EmulatedDeviceConfig, EmulatedEndpointConfig, EmulatedInterfaceConfig,
    EmulatedPeripheral, GuestBuffer, SetupPacket, TransferResult, TransferStatus, UsbDeviceHandle,
    Usbd, UsbdConfig, UsbdError,
};

use util::{read_guest, usbd_with, write_guest, MockHostBackend, DIMENSIONS_PID, DIMENSIONS_VID};

const DATA: u64 = 0x1000;

fn toypad_config() -> EmulatedDeviceConfig {
    EmulatedDeviceConfig {
        name: "toypad".into(),
        vendor_id: DIMENSIONS_VID,
        product_id: DIMENSIONS_PID,
        manufacturer: Some("LEGO".into()),
        product: Some("LEGO READER V2.10".into()),
        interfaces: vec![EmulatedInterfaceConfig {
            interface_class: 0x03,
            hid_report_descriptor_length: Some(29),
            endpoints: vec![
                EmulatedEndpointConfig::default(),
                EmulatedEndpointConfig {
                    address: 0x01,
                    ..Default::default()
                },
            ],
            ..Default::default()
        }],
        ..Default::default()
    }
}

fn open_toypad() -> (Usbd, Arc<aero_usbd::FakeClock>, UsbDeviceHandle) {
    let config = UsbdConfig {
        passthrough: Vec::new(),
        emulated: vec![toypad_config()],
        ..Default::default()
    };
    let (usbd, clock) = usbd_with(config, MockHostBackend::new());
    let handle = usbd
        .open_device_with_ids(DIMENSIONS_VID, DIMENSIONS_PID)
        .unwrap();
    (usbd, clock, handle)
}

fn control_in(b_request: u8, w_value: u16, len: u16) -> SetupPacket {
    SetupPacket::new(0x80, b_request, w_value, 0, len)
}

/// Submits a control IN request and advances the clock until it completes.
fn run_control_in(
    usbd: &Usbd,
    clock: &aero_usbd::FakeClock,
    handle: &UsbDeviceHandle,
    setup: SetupPacket,
) -> (TransferResult, Vec<u8>) {
    let len = usize::from(setup.w_length);
    let id = usbd
        .submit_control(handle, setup, GuestBuffer::new(DATA, len))
        .unwrap();
    clock.advance(Duration::from_micros(100));
    usbd.poll(Duration::ZERO).unwrap();
    let result = usbd.transfer_result(id).unwrap();
    let data = read_guest(usbd, DATA, result.actual_length as usize);
    (result, data)
}

#[test]
fn get_device_descriptor_returns_18_bytes() {
    let (usbd, clock, handle) = open_toypad();

    let (result, data) = run_control_in(
        &usbd,
        &clock,
        &handle,
        control_in(REQUEST_GET_DESCRIPTOR, 0x0100, 64),
    );

    assert!(!result.busy);
    assert_eq!(result.status, TransferStatus::Completed);
    assert_eq!(result.actual_length, 18);
    assert_eq!(&data[..2], &[18, 0x01]);
    assert_eq!(u16::from_le_bytes([data[8], data[9]]), DIMENSIONS_VID);
    assert_eq!(u16::from_le_bytes([data[10], data[11]]), DIMENSIONS_PID);
    // iManufacturer, iProduct, iSerialNumber, bNumConfigurations
    assert_eq!(&data[14..], &[1, 2, 0, 1]);
}

#[test]
fn short_descriptor_request_is_truncated() {
    let (usbd, clock, handle) = open_toypad();

    let (result, data) = run_control_in(
        &usbd,
        &clock,
        &handle,
        control_in(REQUEST_GET_DESCRIPTOR, 0x0100, 8),
    );

    assert_eq!(result.actual_length, 8);
    assert_eq!(&data[..2], &[18, 0x01]);
}

#[test]
fn string_descriptors() {
    let (usbd, clock, handle) = open_toypad();

    let (_, langids) = run_control_in(
        &usbd,
        &clock,
        &handle,
        control_in(REQUEST_GET_DESCRIPTOR, 0x0300, 255),
    );
    assert_eq!(langids, vec![4, 3, 0x09, 0x04]);

    let (result, manufacturer) = run_control_in(
        &usbd,
        &clock,
        &handle,
        control_in(REQUEST_GET_DESCRIPTOR, 0x0301, 255),
    );
    assert_eq!(result.actual_length, 10);
    assert_eq!(manufacturer, vec![10, 3, b'L', 0, b'E', 0, b'G', 0, b'O', 0]);

    let (result, _) = run_control_in(
        &usbd,
        &clock,
        &handle,
        control_in(REQUEST_GET_DESCRIPTOR, 0x0309, 255),
    );
    assert_eq!(result.status, TransferStatus::Completed);
    assert_eq!(result.actual_length, 0);
}

#[test]
fn configuration_descriptor_is_the_configuration_node_alone() {
    let (usbd, clock, handle) = open_toypad();

    let (result, data) = run_control_in(
        &usbd,
        &clock,
        &handle,
        control_in(REQUEST_GET_DESCRIPTOR, 0x0200, 255),
    );

    assert_eq!(result.actual_length, 9);
    assert_eq!(&data[..2], &[9, 0x02]);
    // wTotalLength still covers config 9 + interface 9 + hid 9 + 2 * endpoint 7.
    assert_eq!(u16::from_le_bytes([data[2], data[3]]), 41);
    assert_eq!(data[4], 1);

    // The full subtree stays available outside the request path.
    let records = usbd.enumerate_devices();
    let record = records.find_by_ids(DIMENSIONS_VID, DIMENSIONS_PID).unwrap();
    let full = usbd.config_descriptor(record, 0).unwrap();
    assert_eq!(full.len(), 41);
    assert_eq!(&full[..9], &data[..]);
    assert_eq!(full[9 + 1], 0x04);
    assert_eq!(full[18 + 1], 0x21);
    assert_eq!(&full[27..30], &[7, 0x05, 0x81]);
    assert_eq!(&full[34..37], &[7, 0x05, 0x01]);
    assert_eq!(usbd.config_descriptor(record, 1), Err(UsbdError::NotFound));
    assert_eq!(usbd.max_packet_size(record, 0x81), Ok(64));
}

#[test]
fn get_status_reports_bus_powered_device() {
    let (usbd, clock, handle) = open_toypad();
    write_guest(&usbd, DATA, &[0xAA, 0xAA]);

    let (result, data) = run_control_in(
        &usbd,
        &clock,
        &handle,
        control_in(REQUEST_GET_STATUS, 0, 2),
    );

    assert_eq!(result.actual_length, 2);
    assert_eq!(data, vec![0, 0]);
}

#[test]
fn oversized_guest_buffers_are_bounded_by_the_request() {
    let (usbd, clock, handle) = open_toypad();

    let id = usbd
        .submit_control(
            &handle,
            control_in(REQUEST_GET_STATUS, 0, 2),
            GuestBuffer::new(DATA, usize::MAX),
        )
        .unwrap();
    clock.advance(Duration::from_micros(100));
    usbd.poll(Duration::ZERO).unwrap();

    let result = usbd.transfer_result(id).unwrap();
    assert_eq!(result.status, TransferStatus::Completed);
    assert_eq!(result.actual_length, 2);
}

#[test]
fn set_configuration_is_visible_through_get_configuration() {
    let (usbd, clock, handle) = open_toypad();

    let set = SetupPacket::new(0x00, REQUEST_SET_CONFIGURATION, 1, 0, 0);
    let id = usbd
        .submit_control(&handle, set, GuestBuffer::new(DATA, 0))
        .unwrap();
    clock.advance(Duration::from_micros(100));
    usbd.poll(Duration::ZERO).unwrap();
    assert_eq!(usbd.transfer_result(id).unwrap().status, TransferStatus::Completed);

    let (_, data) = run_control_in(
        &usbd,
        &clock,
        &handle,
        control_in(REQUEST_GET_CONFIGURATION, 0, 1),
    );
    assert_eq!(data, vec![1]);
    assert_eq!(usbd.get_configuration(&handle), Ok(1));
}

#[test]
fn unknown_request_completes_with_no_data() {
    let (usbd, clock, handle) = open_toypad();

    // Vendor request nobody handles.
    let setup = SetupPacket::new(0xC0, 0x42, 0, 0, 16);
    let (result, _) = run_control_in(&usbd, &clock, &handle, setup);

    assert!(!result.busy);
    assert_eq!(result.status, TransferStatus::Completed);
    assert_eq!(result.actual_length, 0);
}

#[test]
fn fake_transfers_complete_after_latency() {
    let (usbd, clock, handle) = open_toypad();
    clock.set_us(1_000);

    let first = usbd
        .submit_control(
            &handle,
            control_in(REQUEST_GET_DESCRIPTOR, 0x0100, 18),
            GuestBuffer::new(DATA, 18),
        )
        .unwrap();
    clock.advance(Duration::from_micros(50));
    let second = usbd
        .submit_control(
            &handle,
            control_in(REQUEST_GET_STATUS, 0, 2),
            GuestBuffer::new(DATA + 0x100, 2),
        )
        .unwrap();
    assert_ne!(first, second);
    assert_eq!(usbd.transfer_summary().pending_fake, 2);

    // t = 1099: nothing due yet.
    clock.set_us(1_099);
    usbd.poll(Duration::ZERO).unwrap();
    assert!(usbd.transfer_result(first).unwrap().busy);
    assert!(usbd.transfer_result(second).unwrap().busy);

    // t = 1100: only the first is due.
    clock.set_us(1_100);
    usbd.poll(Duration::ZERO).unwrap();
    assert!(!usbd.transfer_result(first).unwrap().busy);
    assert!(usbd.transfer_result(second).unwrap().busy);
    assert_eq!(usbd.transfer_summary().pending_fake, 1);

    clock.set_us(1_150);
    usbd.poll(Duration::ZERO).unwrap();
    let second = usbd.transfer_result(second).unwrap();
    assert!(!second.busy);
    assert_eq!(second.actual_length, 2);
    assert_eq!(usbd.transfer_summary().busy, 0);
}

#[derive(Default)]
struct Counter {
    reports: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl EmulatedPeripheral for Counter {
    fn interrupt_transfer(&mut self, endpoint: u8, data: &mut [u8]) -> Option<usize> {
        if endpoint & 0x80 == 0 {
            self.reports.lock().unwrap().push(data.to_vec());
            return Some(data.len());
        }
        let n = self.reports.lock().unwrap().len() as u8;
        data.fill(n);
        Some(data.len())
    }
}

#[test]
fn peripheral_handles_interrupt_traffic() {
    let backend = MockHostBackend::new();
    let config = UsbdConfig {
        passthrough: Vec::new(),
        ..Default::default()
    };
    let (usbd, clock) = usbd_with(config, backend);

    let counter = Counter::default();
    let reports = Arc::clone(&counter.reports);
    let location = usbd.new_location();
    let device =
        EmulatedDevice::from_config(&toypad_config(), location).with_peripheral(Box::new(counter));
    usbd.attach_device(Arc::new(Mutex::new(device)));
    let handle = usbd
        .open_device_with_ids(DIMENSIONS_VID, DIMENSIONS_PID)
        .unwrap();

    write_guest(&usbd, DATA, &[0x55, 0x0F, 0xB0]);
    let out = usbd
        .submit_interrupt(&handle, 0x01, GuestBuffer::new(DATA, 3))
        .unwrap();
    let inp = usbd
        .submit_interrupt(&handle, 0x81, GuestBuffer::new(DATA + 0x40, 4))
        .unwrap();

    clock.advance(Duration::from_micros(100));
    usbd.poll(Duration::ZERO).unwrap();

    assert_eq!(reports.lock().unwrap().as_slice(), &[vec![0x55, 0x0F, 0xB0]]);
    assert_eq!(usbd.transfer_result(out).unwrap().actual_length, 3);
    assert_eq!(usbd.transfer_result(inp).unwrap().actual_length, 4);
    assert_eq!(read_guest(&usbd, DATA + 0x40, 4), vec![1, 1, 1, 1]);
}

#[test]
fn oversized_interrupt_buffers_are_capped() {
    let (usbd, clock) = usbd_with(UsbdConfig::default(), MockHostBackend::new());
    let location = usbd.new_location();
    let device = EmulatedDevice::from_config(&toypad_config(), location)
        .with_peripheral(Box::new(Counter::default()));
    usbd.attach_device(Arc::new(Mutex::new(device)));
    let handle = usbd
        .open_device_with_ids(DIMENSIONS_VID, DIMENSIONS_PID)
        .unwrap();

    let id = usbd
        .submit_interrupt(&handle, 0x81, GuestBuffer::new(DATA, usize::MAX))
        .unwrap();
    clock.advance(Duration::from_micros(100));
    usbd.poll(Duration::ZERO).unwrap();

    let result = usbd.transfer_result(id).unwrap();
    assert_eq!(result.actual_length as usize, MAX_TRANSFER_LENGTH);
}

#[test]
fn interrupt_without_peripheral_stays_pending() {
    let (usbd, clock, handle) = open_toypad();

    let id = usbd
        .submit_interrupt(&handle, 0x81, GuestBuffer::new(DATA, 32))
        .unwrap();
    clock.advance(Duration::from_secs(1));
    usbd.poll(Duration::ZERO).unwrap();

    assert!(usbd.transfer_result(id).unwrap().busy);
}
