//! Transfer records, the fixed-size transfer pool, and both completion paths.
//!
//! A [`Transfer`] slot is claimed by the allocator, filled in by the device the request is
//! dispatched to, and released by exactly one completion:
//!
//! - host completions, delivered by the [`crate::UsbHostBackend`] for passthrough devices, and
//! - fake completions, scheduled by emulated devices and applied by [`FakeTransferQueue::pump`]
//!   once their deadline has passed.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{error, trace};

use crate::bus::BusLocation;
use crate::error::HostError;
use crate::host::{HostTransferCompletion, HostTransferKind};
use crate::memory::{GuestBuffer, GuestMemory};
use crate::setup::{ENDPOINT_IN, SETUP_PACKET_SIZE};

/// Isochronous requests carry at most this many packets.
pub const MAX_ISO_PACKETS: usize = 8;

/// Largest data stage moved for one control or interrupt transfer (a control `wLength` limit).
pub const MAX_TRANSFER_LENGTH: usize = u16::MAX as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferId(pub u32);

impl TransferId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Completion status of a transfer (libusb's `LIBUSB_TRANSFER_*` numbering).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransferStatus {
    #[default]
    Completed,
    Error,
    TimedOut,
    Cancelled,
    Stall,
    NoDevice,
    Overflow,
}

impl TransferStatus {
    pub fn code(self) -> u8 {
        match self {
            TransferStatus::Completed => 0,
            TransferStatus::Error => 1,
            TransferStatus::TimedOut => 2,
            TransferStatus::Cancelled => 3,
            TransferStatus::Stall => 4,
            TransferStatus::NoDevice => 5,
            TransferStatus::Overflow => 6,
        }
    }

    pub fn is_success(self) -> bool {
        self == TransferStatus::Completed
    }
}

impl From<HostError> for TransferStatus {
    fn from(err: HostError) -> Self {
        match err {
            HostError::NoDevice => TransferStatus::NoDevice,
            HostError::Timeout => TransferStatus::TimedOut,
            HostError::Pipe => TransferStatus::Stall,
            HostError::Overflow => TransferStatus::Overflow,
            HostError::Interrupted => TransferStatus::Cancelled,
            _ => TransferStatus::Error,
        }
    }
}

/// Packs one isochronous packet result into the guest's 16-bit format: status in the top nibble,
/// actual length in the low 12 bits.
pub fn pack_iso_packet(status: u8, actual_length: u32) -> u16 {
    (u16::from(status & 0xF) << 12) | (actual_length & 0xFFF) as u16
}

/// Guest isochronous request. On submission `packets` holds the requested length of each packet;
/// after completion it holds the packed per-packet results (see [`pack_iso_packet`]).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsoRequest {
    pub endpoint: u8,
    pub buffer: GuestBuffer,
    pub start_frame: u32,
    pub num_packets: u32,
    pub packets: [u16; MAX_ISO_PACKETS],
}

impl IsoRequest {
    pub fn packet_count(&self) -> usize {
        (self.num_packets as usize).min(MAX_ISO_PACKETS)
    }

    pub fn total_length(&self) -> usize {
        self.packets[..self.packet_count()]
            .iter()
            .map(|&len| usize::from(len))
            .sum()
    }
}

/// Completion an emulated device scheduled for later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FakeCompletion {
    pub(crate) expected_time: u64,
    pub(crate) expected_result: TransferStatus,
    pub(crate) expected_count: u32,
}

/// One slot of the transfer pool.
#[derive(Debug, Clone)]
pub struct Transfer {
    pub(crate) id: TransferId,
    pub(crate) busy: bool,
    pub(crate) result: TransferStatus,
    pub(crate) count: u32,
    pub(crate) setup_buffer: Vec<u8>,
    /// Where an IN control transfer's data stage lands; set only while one is outstanding.
    pub(crate) control_destination: Option<GuestBuffer>,
    /// Same, for IN interrupt/isochronous data.
    pub(crate) endpoint_destination: Option<GuestBuffer>,
    pub(crate) iso_request: IsoRequest,
    pub(crate) fake: Option<FakeCompletion>,
    /// Device the transfer was dispatched to.
    pub(crate) owner: Option<BusLocation>,
}

impl Transfer {
    fn new(id: TransferId) -> Self {
        Self {
            id,
            busy: false,
            result: TransferStatus::Completed,
            count: 0,
            setup_buffer: Vec::new(),
            control_destination: None,
            endpoint_destination: None,
            iso_request: IsoRequest::default(),
            fake: None,
            owner: None,
        }
    }

    fn claim(&mut self) {
        self.busy = true;
        self.result = TransferStatus::Completed;
        self.count = 0;
        self.setup_buffer.clear();
        self.control_destination = None;
        self.endpoint_destination = None;
        self.iso_request = IsoRequest::default();
        self.fake = None;
        self.owner = None;
    }

    pub fn id(&self) -> TransferId {
        self.id
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }

    pub fn is_fake(&self) -> bool {
        self.fake.is_some()
    }

    pub fn result(&self) -> TransferStatus {
        self.result
    }

    pub fn byte_count(&self) -> u32 {
        self.count
    }

    /// Finishes the transfer immediately, without going through either completion queue.
    pub(crate) fn complete_now(&mut self, status: TransferStatus, count: u32) {
        self.result = status;
        self.count = count;
        self.control_destination = None;
        self.endpoint_destination = None;
        self.fake = None;
        self.busy = false;
    }

    /// Applies a completion reported by the host stack.
    pub(crate) fn apply_host_completion(
        &mut self,
        completion: &HostTransferCompletion,
        memory: &mut dyn GuestMemory,
    ) {
        if !completion.status.is_success() {
            error!(
                transfer = %self.id,
                status = ?completion.status,
                "usb transfer failed"
            );
        }

        self.result = completion.status;
        self.count = u32::try_from(completion.actual_length).unwrap_or(u32::MAX);

        for (slot, packet) in self
            .iso_request
            .packets
            .iter_mut()
            .zip(completion.iso_packets.iter().take(MAX_ISO_PACKETS))
        {
            *slot = pack_iso_packet(packet.status.code(), packet.actual_length);
        }

        match completion.kind {
            HostTransferKind::Control => {
                if let Some(dest) = self.control_destination.take() {
                    let data = completion.buffer.get(SETUP_PACKET_SIZE..).unwrap_or_default();
                    let len = completion.actual_length.min(data.len());
                    dest.write_to(memory, &data[..len]);
                }
            }
            HostTransferKind::Interrupt => {
                if let Some(dest) = self.endpoint_destination.take() {
                    let len = completion.actual_length.min(completion.buffer.len());
                    dest.write_to(memory, &completion.buffer[..len]);
                }
            }
            HostTransferKind::Isochronous => {
                if let Some(dest) = self.endpoint_destination.take() {
                    dest.write_to(memory, &completion.buffer);
                }
            }
        }

        self.busy = false;
        trace!(transfer = %self.id, count = self.count, "usb transfer complete");
    }
}

/// Whether `endpoint` is an IN (device-to-host) endpoint address.
pub fn is_in_endpoint(endpoint: u8) -> bool {
    endpoint & ENDPOINT_IN != 0
}

/// Fixed-size pool of transfer slots.
#[derive(Debug)]
pub struct TransferPool {
    slots: Vec<Transfer>,
    cursor: usize,
}

impl TransferPool {
    pub fn new(capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|i| Transfer::new(TransferId(i as u32)))
            .collect();
        Self { slots, cursor: 0 }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Claims the next idle slot after the last one handed out, wrapping around.
    ///
    /// The pool never grows: when a full sweep finds every slot busy, saturation is logged and
    /// `None` is returned.
    pub fn allocate(&mut self) -> Option<TransferId> {
        let capacity = self.slots.len();
        for _ in 0..capacity {
            self.cursor = (self.cursor + 1) % capacity;
            let slot = &mut self.slots[self.cursor];
            if !slot.busy {
                slot.claim();
                return Some(slot.id);
            }
        }
        error!(capacity, "usb transfers are saturated");
        None
    }

    pub fn get(&self, id: TransferId) -> Option<&Transfer> {
        self.slots.get(id.index())
    }

    pub fn get_mut(&mut self, id: TransferId) -> Option<&mut Transfer> {
        self.slots.get_mut(id.index())
    }

    pub fn busy_count(&self) -> usize {
        self.slots.iter().filter(|t| t.busy).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Transfer> {
        self.slots.iter()
    }
}

/// Emulated transfers waiting for their completion deadline.
#[derive(Debug, Default)]
pub struct FakeTransferQueue {
    pending: Vec<TransferId>,
}

impl FakeTransferQueue {
    pub fn push(&mut self, id: TransferId) {
        self.pending.push(id);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Completes every queued transfer whose deadline is at or before `now_us`, in queue order.
    /// Transfers not yet due stay queued. Returns the number completed.
    pub fn pump(&mut self, pool: &mut TransferPool, now_us: u64) -> usize {
        let mut completed = 0usize;
        self.pending.retain(|&id| {
            let Some(transfer) = pool.get_mut(id) else {
                return false;
            };
            let Some(fake) = transfer.fake else {
                // Completed through some other path (e.g. disconnect); nothing left to do.
                return false;
            };
            if fake.expected_time > now_us {
                return true;
            }
            transfer.result = fake.expected_result;
            transfer.count = fake.expected_count;
            transfer.fake = None;
            transfer.busy = false;
            completed += 1;
            false
        });
        completed
    }
}

/// Guest-visible outcome of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TransferResult {
    pub busy: bool,
    pub status: TransferStatus,
    pub actual_length: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IsochronousResult {
    pub busy: bool,
    pub status: TransferStatus,
    pub start_frame: u32,
    /// Packed per-packet results, one per requested packet.
    pub packets: Vec<u16>,
}

/// Pool occupancy snapshot, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TransferSummary {
    pub capacity: usize,
    pub busy: usize,
    pub pending_fake: usize,
}
