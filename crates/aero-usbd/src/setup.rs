//! Control-transfer SETUP packets and standard request codes.

use serde::{Deserialize, Serialize};

pub const SETUP_PACKET_SIZE: usize = 8;

pub const REQUEST_GET_STATUS: u8 = 0x00;
pub const REQUEST_CLEAR_FEATURE: u8 = 0x01;
pub const REQUEST_SET_FEATURE: u8 = 0x03;
pub const REQUEST_SET_ADDRESS: u8 = 0x05;
pub const REQUEST_GET_DESCRIPTOR: u8 = 0x06;
pub const REQUEST_SET_DESCRIPTOR: u8 = 0x07;
pub const REQUEST_GET_CONFIGURATION: u8 = 0x08;
pub const REQUEST_SET_CONFIGURATION: u8 = 0x09;
pub const REQUEST_GET_INTERFACE: u8 = 0x0A;
pub const REQUEST_SET_INTERFACE: u8 = 0x0B;

/// `bmRequestType` bit 7.
pub const ENDPOINT_IN: u8 = 0x80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestDirection {
    HostToDevice,
    DeviceToHost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    Standard,
    Class,
    Vendor,
    Reserved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestRecipient {
    Device,
    Interface,
    Endpoint,
    Other,
    Reserved,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupPacket {
    #[serde(rename = "bmRequestType")]
    pub bm_request_type: u8,
    #[serde(rename = "bRequest")]
    pub b_request: u8,
    #[serde(rename = "wValue")]
    pub w_value: u16,
    #[serde(rename = "wIndex")]
    pub w_index: u16,
    #[serde(rename = "wLength")]
    pub w_length: u16,
}

impl SetupPacket {
    pub fn new(
        bm_request_type: u8,
        b_request: u8,
        w_value: u16,
        w_index: u16,
        w_length: u16,
    ) -> Self {
        Self {
            bm_request_type,
            b_request,
            w_value,
            w_index,
            w_length,
        }
    }

    pub fn request_direction(&self) -> RequestDirection {
        if self.bm_request_type & ENDPOINT_IN != 0 {
            RequestDirection::DeviceToHost
        } else {
            RequestDirection::HostToDevice
        }
    }

    pub fn request_type(&self) -> RequestType {
        match (self.bm_request_type >> 5) & 0x03 {
            0 => RequestType::Standard,
            1 => RequestType::Class,
            2 => RequestType::Vendor,
            _ => RequestType::Reserved,
        }
    }

    pub fn recipient(&self) -> RequestRecipient {
        match self.bm_request_type & 0x1f {
            0 => RequestRecipient::Device,
            1 => RequestRecipient::Interface,
            2 => RequestRecipient::Endpoint,
            3 => RequestRecipient::Other,
            _ => RequestRecipient::Reserved,
        }
    }

    pub fn is_device_to_host(&self) -> bool {
        self.request_direction() == RequestDirection::DeviceToHost
    }

    /// High byte of `wValue` (descriptor type for GET_DESCRIPTOR).
    pub fn value_high(&self) -> u8 {
        (self.w_value >> 8) as u8
    }

    /// Low byte of `wValue` (descriptor index for GET_DESCRIPTOR).
    pub fn value_low(&self) -> u8 {
        (self.w_value & 0x00ff) as u8
    }

    /// Wire layout, little-endian, as placed in front of a control transfer's data stage.
    pub fn to_bytes(&self) -> [u8; SETUP_PACKET_SIZE] {
        let mut out = [0u8; SETUP_PACKET_SIZE];
        out[0] = self.bm_request_type;
        out[1] = self.b_request;
        out[2..4].copy_from_slice(&self.w_value.to_le_bytes());
        out[4..6].copy_from_slice(&self.w_index.to_le_bytes());
        out[6..8].copy_from_slice(&self.w_length.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: [u8; SETUP_PACKET_SIZE]) -> Self {
        Self {
            bm_request_type: bytes[0],
            b_request: bytes[1],
            w_value: u16::from_le_bytes([bytes[2], bytes[3]]),
            w_index: u16::from_le_bytes([bytes[4], bytes[5]]),
            w_length: u16::from_le_bytes([bytes[6], bytes[7]]),
        }
    }
}
