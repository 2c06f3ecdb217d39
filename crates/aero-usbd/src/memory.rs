//! Guest memory access for transfer buffers.
//!
//! Guest buffers are described by address and length rather than borrowed slices: a control IN
//! transfer to a real device stays outstanding across [`crate::Usbd::poll`] calls, and its
//! completion copies the response into the guest long after the submitting call returned.

use serde::{Deserialize, Serialize};

/// Guest-physical memory as seen by the virtual host controller.
pub trait GuestMemory: Send {
    fn read(&mut self, addr: u64, buf: &mut [u8]);
    fn write(&mut self, addr: u64, data: &[u8]);
}

/// A guest buffer: `len` bytes starting at guest address `addr`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestBuffer {
    pub addr: u64,
    pub len: usize,
}

impl GuestBuffer {
    pub const fn new(addr: u64, len: usize) -> Self {
        Self { addr, len }
    }

    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The first `max` bytes of the buffer, or all of it if it is shorter.
    pub fn truncated(&self, max: usize) -> Self {
        Self {
            addr: self.addr,
            len: self.len.min(max),
        }
    }

    /// Reads the whole buffer out of guest memory.
    pub fn read_from(&self, memory: &mut dyn GuestMemory) -> Vec<u8> {
        let mut data = vec![0u8; self.len];
        memory.read(self.addr, &mut data);
        data
    }

    /// Writes `data` into the buffer, clipped to the buffer length. Returns the bytes written.
    pub fn write_to(&self, memory: &mut dyn GuestMemory, data: &[u8]) -> usize {
        let len = data.len().min(self.len);
        memory.write(self.addr, &data[..len]);
        len
    }
}

/// Flat, zero-based guest memory backed by a `Vec<u8>`.
///
/// Accesses outside the backing store are clipped: reads fill the remainder with zeroes and
/// writes drop the bytes that do not fit.
#[derive(Debug, Clone, Default)]
pub struct FlatGuestMemory {
    data: Vec<u8>,
}

impl FlatGuestMemory {
    pub fn new(size: usize) -> Self {
        Self {
            data: vec![0; size],
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    fn clip(&self, addr: u64, len: usize) -> Option<(usize, usize)> {
        let start = usize::try_from(addr).ok()?;
        if start >= self.data.len() {
            return None;
        }
        let end = start.saturating_add(len).min(self.data.len());
        Some((start, end))
    }
}

impl GuestMemory for FlatGuestMemory {
    fn read(&mut self, addr: u64, buf: &mut [u8]) {
        buf.fill(0);
        if let Some((start, end)) = self.clip(addr, buf.len()) {
            buf[..end - start].copy_from_slice(&self.data[start..end]);
        }
    }

    fn write(&mut self, addr: u64, data: &[u8]) {
        if let Some((start, end)) = self.clip(addr, data.len()) {
            self.data[start..end].copy_from_slice(&data[..end - start]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_range_accesses_are_clipped() {
        let mut mem = FlatGuestMemory::new(8);
        mem.write(6, &[1, 2, 3, 4]);
        assert_eq!(mem.as_slice(), &[0, 0, 0, 0, 0, 0, 1, 2]);

        let mut buf = [0xffu8; 4];
        mem.read(6, &mut buf);
        assert_eq!(buf, [1, 2, 0, 0]);

        mem.read(100, &mut buf);
        assert_eq!(buf, [0, 0, 0, 0]);
    }

    #[test]
    fn guest_buffer_write_is_bounded_by_len() {
        let mut mem = FlatGuestMemory::new(16);
        let buf = GuestBuffer::new(4, 2);
        assert_eq!(buf.write_to(&mut mem, &[9, 8, 7]), 2);
        assert_eq!(&mem.as_slice()[4..7], &[9, 8, 0]);
        assert_eq!(buf.read_from(&mut mem), vec![9, 8]);
    }

    #[test]
    fn truncated_keeps_the_address() {
        let buf = GuestBuffer::new(0x40, usize::MAX);
        assert_eq!(buf.truncated(18), GuestBuffer::new(0x40, 18));
        assert_eq!(GuestBuffer::new(0x40, 4).truncated(18), GuestBuffer::new(0x40, 4));
    }
}
