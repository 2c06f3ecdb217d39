//! Virtual USB host controller for guest `usbd`-style APIs.
//!
//! The guest sees one uniform bus, but each device on it is backed either by real hardware
//! (forwarded to a host USB stack through [`UsbHostBackend`]) or by a software model that answers
//! standard requests from a [`DescriptorNode`] tree. Transfers to real devices complete when the
//! host stack reports them; transfers to emulated devices are computed synchronously and their
//! completion is scheduled on the [`Clock`] so the guest observes the same asynchronous contract
//! for both.
//!
//! [`Usbd`] is the context object guest call surfaces hold on to. It owns a [`DeviceManager`]
//! behind a single lock and drives both completion paths from [`Usbd::poll`].
#![forbid(unsafe_code)]

pub mod bus;
pub mod clock;
pub mod config;
pub mod descriptor;
pub mod device;
pub mod error;
pub mod host;
pub mod manager;
pub mod memory;
pub mod setup;
pub mod transfer;
mod usbd;

pub use bus::{BusLocation, BusRecord, DeviceList, UsbSpeed};
pub use clock::{Clock, FakeClock, StdClock};
pub use config::{
    EmulatedDeviceConfig, EmulatedEndpointConfig, EmulatedInterfaceConfig, PassthroughFilter,
    UsbdConfig,
};
pub use descriptor::{
    ConfigurationDescriptor, DescriptorNode, DeviceDescriptor, EndpointDescriptor, HidDescriptor,
    InterfaceDescriptor,
};
pub use device::emulated::{DeviceStatus, EmulatedDevice, EmulatedPeripheral};
pub use device::passthrough::PassthroughDevice;
pub use device::{DeviceState, SharedUsbDevice, TransferContext, UsbDevice};
pub use error::{ConfigError, HostError, Result, UsbdError};
pub use host::{
    CompletionSink, HostDeviceId, HostDeviceInfo, HostHandleId, HostIsoPacket, HostResult,
    HostSubmission, HostTransfer, HostTransferCompletion, HostTransferKind, NullHostBackend,
    UsbHostBackend,
};
pub use manager::{DeviceManager, Dispatched, UsbDeviceHandle};
pub use memory::{FlatGuestMemory, GuestBuffer, GuestMemory};
pub use setup::SetupPacket;
pub use transfer::{
    IsoRequest, IsochronousResult, TransferId, TransferResult, TransferStatus, TransferSummary,
};
pub use usbd::Usbd;

/// Number of transfer slots the guest-visible pool holds unless configured otherwise.
pub const DEFAULT_TRANSFER_POOL_SIZE: usize = 0x44;

/// Latency applied to emulated transfers before the pump reports them complete.
pub const DEFAULT_FAKE_TRANSFER_LATENCY_US: u64 = 100;
