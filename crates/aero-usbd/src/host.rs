//! Host USB transport interface.
//!
//! Passthrough devices forward everything to a [`UsbHostBackend`], a thin libusb-shaped
//! abstraction over whatever host stack the embedder has. Asynchronous transfers are submitted
//! with [`UsbHostBackend::submit_transfer`] and their completions are handed back through a
//! [`CompletionSink`], either from [`UsbHostBackend::handle_events`] or from a thread the backend
//! owns.
//!
//! Transfers are built while the device manager is locked but handed to the backend only after
//! the lock is released, so a backend may deliver completions from any thread at any time. A
//! backend that fails a submission must not report a completion for it.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tracing::{error, trace};

use crate::descriptor::DeviceDescriptor;
use crate::error::HostError;
use crate::setup::SetupPacket;
use crate::transfer::{TransferId, TransferStatus};
use crate::usbd::Shared;

pub type HostResult<T> = std::result::Result<T, HostError>;

/// Backend-assigned identity of a host device (libusb's `libusb_device*`).
pub type HostDeviceId = u64;

/// Backend-assigned identity of an open device handle (libusb's `libusb_device_handle*`).
pub type HostHandleId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostDeviceInfo {
    pub id: HostDeviceId,
    pub descriptor: DeviceDescriptor,
    pub bus_number: u8,
    pub address: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostTransferKind {
    Control,
    Interrupt,
    Isochronous,
}

/// An asynchronous transfer handed to the host stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostTransfer {
    /// Echoed back in the completion.
    pub user_data: TransferId,
    pub handle: HostHandleId,
    pub kind: HostTransferKind,
    pub endpoint: u8,
    /// For control transfers: the 8-byte setup packet followed by the data stage.
    pub buffer: Vec<u8>,
    pub iso_packet_lengths: Vec<u16>,
    /// Zero means no timeout.
    pub timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostIsoPacket {
    pub length: u32,
    pub actual_length: u32,
    pub status: TransferStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostTransferCompletion {
    pub user_data: TransferId,
    pub kind: HostTransferKind,
    pub status: TransferStatus,
    pub actual_length: usize,
    /// Transfer buffer as left by the host stack (setup packet included for control transfers).
    pub buffer: Vec<u8>,
    pub iso_packets: Vec<HostIsoPacket>,
}

pub trait UsbHostBackend: Send + Sync {
    /// Devices currently attached to the host.
    fn device_list(&self) -> HostResult<Vec<HostDeviceInfo>>;

    fn ref_device(&self, _device: HostDeviceId) {}

    fn unref_device(&self, _device: HostDeviceId) {}

    fn open(&self, device: HostDeviceId) -> HostResult<HostHandleId>;

    fn close(&self, handle: HostHandleId);

    /// Lets the host stack detach (and later reattach) a kernel driver bound to an interface
    /// we claim. Only meaningful on Linux.
    fn set_auto_detach_kernel_driver(
        &self,
        _handle: HostHandleId,
        _enable: bool,
    ) -> HostResult<()> {
        Ok(())
    }

    fn claim_interface(&self, handle: HostHandleId, interface: u8) -> HostResult<()>;

    fn release_interface(&self, handle: HostHandleId, interface: u8) -> HostResult<()>;

    fn get_configuration(&self, handle: HostHandleId) -> HostResult<u8>;

    fn set_configuration(&self, handle: HostHandleId, value: u8) -> HostResult<()>;

    fn set_interface_alt_setting(
        &self,
        handle: HostHandleId,
        interface: u8,
        alternate_setting: u8,
    ) -> HostResult<()>;

    /// Blocking control transfer. Returns the number of data-stage bytes transferred.
    fn control_transfer_sync(
        &self,
        handle: HostHandleId,
        setup: SetupPacket,
        data: &mut [u8],
        timeout: Duration,
    ) -> HostResult<usize>;

    fn submit_transfer(&self, transfer: &HostTransfer) -> HostResult<()>;

    /// Processes pending host events for up to `timeout`, delivering finished transfers to
    /// `sink`.
    fn handle_events(&self, timeout: Duration, sink: &CompletionSink) -> HostResult<()>;
}

/// A host transfer waiting to be handed to the backend.
///
/// Built by a passthrough device under the manager lock and submitted by [`crate::Usbd`] once
/// the lock is gone: the host may stay busy until its completion thread has drained, and that
/// thread needs the lock to deliver.
pub struct HostSubmission {
    backend: Arc<dyn UsbHostBackend>,
    transfer: HostTransfer,
}

impl HostSubmission {
    pub fn new(backend: Arc<dyn UsbHostBackend>, transfer: HostTransfer) -> Self {
        Self { backend, transfer }
    }

    pub fn transfer(&self) -> &HostTransfer {
        &self.transfer
    }

    /// Submits the transfer, retrying for as long as the host reports it busy.
    pub fn submit(&self) -> HostResult<()> {
        loop {
            match self.backend.submit_transfer(&self.transfer) {
                Ok(()) => {
                    trace!(
                        transfer = %self.transfer.user_data,
                        kind = ?self.transfer.kind,
                        "submitted host transfer"
                    );
                    return Ok(());
                }
                Err(HostError::Busy) => std::thread::yield_now(),
                Err(err) => {
                    error!(
                        error = %err,
                        transfer = %self.transfer.user_data,
                        "unexpected error from submit_transfer"
                    );
                    return Err(err);
                }
            }
        }
    }
}

impl std::fmt::Debug for HostSubmission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostSubmission")
            .field("transfer", &self.transfer)
            .finish_non_exhaustive()
    }
}

/// Backend for hosts without a USB stack: no devices, nothing to open.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullHostBackend;

impl UsbHostBackend for NullHostBackend {
    fn device_list(&self) -> HostResult<Vec<HostDeviceInfo>> {
        Ok(Vec::new())
    }

    fn open(&self, _device: HostDeviceId) -> HostResult<HostHandleId> {
        Err(HostError::NoDevice)
    }

    fn close(&self, _handle: HostHandleId) {}

    fn claim_interface(&self, _handle: HostHandleId, _interface: u8) -> HostResult<()> {
        Err(HostError::NoDevice)
    }

    fn release_interface(&self, _handle: HostHandleId, _interface: u8) -> HostResult<()> {
        Err(HostError::NoDevice)
    }

    fn get_configuration(&self, _handle: HostHandleId) -> HostResult<u8> {
        Err(HostError::NoDevice)
    }

    fn set_configuration(&self, _handle: HostHandleId, _value: u8) -> HostResult<()> {
        Err(HostError::NoDevice)
    }

    fn set_interface_alt_setting(&self, _: HostHandleId, _: u8, _: u8) -> HostResult<()> {
        Err(HostError::NoDevice)
    }

    fn control_transfer_sync(
        &self,
        _handle: HostHandleId,
        _setup: SetupPacket,
        _data: &mut [u8],
        _timeout: Duration,
    ) -> HostResult<usize> {
        Err(HostError::NoDevice)
    }

    fn submit_transfer(&self, _transfer: &HostTransfer) -> HostResult<()> {
        Err(HostError::NoDevice)
    }

    fn handle_events(&self, _timeout: Duration, _sink: &CompletionSink) -> HostResult<()> {
        Ok(())
    }
}

/// Delivers host completions back into a [`crate::Usbd`].
///
/// Cheap to clone and safe to call from any thread. Completions arriving after the context was
/// deinitialized are dropped.
#[derive(Clone, Default)]
pub struct CompletionSink {
    shared: Weak<Shared>,
}

impl CompletionSink {
    pub(crate) fn new(shared: Weak<Shared>) -> Self {
        Self { shared }
    }

    /// A sink not connected to any context.
    pub fn detached() -> Self {
        Self::default()
    }

    pub fn transfer_complete(&self, completion: HostTransferCompletion) {
        match self.shared.upgrade() {
            Some(shared) => shared.transfer_complete(completion),
            None => trace!(
                transfer = %completion.user_data,
                "dropping completion for closed usbd context"
            ),
        }
    }
}

impl std::fmt::Debug for CompletionSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionSink")
            .field("attached", &(self.shared.strong_count() > 0))
            .finish()
    }
}
