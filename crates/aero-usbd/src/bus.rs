//! Synthesized bus topology.
//!
//! Devices on the virtual bus have no host-visible topology of their own (emulated devices do
//! not exist at all on the host). Every enumeration therefore fabricates a fresh set of
//! [`BusRecord`]s: one bus per device, with the device and port address taken from a running
//! session counter.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::descriptor::DeviceDescriptor;

/// Opaque 7-byte location assigned by the device manager; stable for the life of a device.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BusLocation(pub [u8; 7]);

impl BusLocation {
    /// Location number `n`, stored in the first byte.
    pub fn from_index(n: u8) -> Self {
        let mut location = [0u8; 7];
        location[0] = n;
        Self(location)
    }

    pub fn as_bytes(&self) -> &[u8; 7] {
        &self.0
    }
}

impl fmt::Debug for BusLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BusLocation(")?;
        for (i, b) in self.0.iter().enumerate() {
            if i != 0 {
                write!(f, ".")?;
            }
            write!(f, "{b}")?;
        }
        write!(f, ")")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum UsbSpeed {
    Unknown,
    Low,
    Full,
    High,
    Super,
    SuperPlus,
}

impl UsbSpeed {
    /// Infers the speed class from the device descriptor, since there is no real port to ask.
    ///
    /// A 512-byte control endpoint (`bMaxPacketSize0 == 9`, an exponent) only exists on
    /// SuperSpeed devices.
    pub fn infer(max_packet_size0: u8, bcd_usb: u16) -> Self {
        if max_packet_size0 == 9 {
            if bcd_usb >= 0x0310 {
                UsbSpeed::SuperPlus
            } else {
                UsbSpeed::Super
            }
        } else if bcd_usb >= 0x0200 {
            UsbSpeed::High
        } else if max_packet_size0 > 8 {
            UsbSpeed::Full
        } else {
            UsbSpeed::Low
        }
    }
}

/// One synthesized enumeration entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusRecord {
    pub session_id: u64,
    /// 1-based index into the manager's device list at enumeration time.
    pub bus_number: u8,
    pub device_address: u8,
    pub port_number: u8,
    pub speed: UsbSpeed,
    pub descriptor: DeviceDescriptor,
    pub location: BusLocation,
}

/// Snapshot returned by enumeration. Records are reference counted so callers can keep the
/// ones they care about after dropping the list.
#[derive(Debug, Clone, Default)]
pub struct DeviceList {
    records: Vec<Arc<BusRecord>>,
}

impl DeviceList {
    pub fn new(records: Vec<Arc<BusRecord>>) -> Self {
        Self { records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Arc<BusRecord>> {
        self.records.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<BusRecord>> {
        self.records.iter()
    }

    pub fn find_by_ids(&self, vendor_id: u16, product_id: u16) -> Option<&Arc<BusRecord>> {
        self.records.iter().find(|r| {
            r.descriptor.vendor_id == vendor_id && r.descriptor.product_id == product_id
        })
    }
}

impl IntoIterator for DeviceList {
    type Item = Arc<BusRecord>;
    type IntoIter = std::vec::IntoIter<Arc<BusRecord>>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn speed_inference() {
        assert_eq!(UsbSpeed::infer(9, 0x0300), UsbSpeed::Super);
        assert_eq!(UsbSpeed::infer(9, 0x0310), UsbSpeed::SuperPlus);
        assert_eq!(UsbSpeed::infer(9, 0x0320), UsbSpeed::SuperPlus);
        assert_eq!(UsbSpeed::infer(64, 0x0200), UsbSpeed::High);
        assert_eq!(UsbSpeed::infer(64, 0x0110), UsbSpeed::Full);
        assert_eq!(UsbSpeed::infer(8, 0x0110), UsbSpeed::Low);
        assert_eq!(UsbSpeed::infer(8, 0x0200), UsbSpeed::High);
    }

    #[test]
    fn location_debug_is_dotted() {
        assert_eq!(format!("{:?}", BusLocation::from_index(3)), "BusLocation(3.0.0.0.0.0.0)");
    }
}
