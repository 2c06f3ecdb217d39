//! Runtime configuration.
//!
//! Every field has a default, so an empty JSON object (or no configuration at all) yields the
//! stock setup: the default transfer pool, the toy-portal passthrough filters, and no emulated
//! devices.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::{DEFAULT_FAKE_TRANSFER_LATENCY_US, DEFAULT_TRANSFER_POOL_SIZE};

/// Upper bound for [`UsbdConfig::transfer_pool_size`].
pub const MAX_TRANSFER_POOL_SIZE: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UsbdConfig {
    pub transfer_pool_size: usize,
    /// Delay between an emulated transfer being dispatched and the pump reporting it complete.
    pub fake_transfer_latency_us: u64,
    /// Timeout for the synchronous descriptor reads done during enumeration. Zero waits forever.
    pub descriptor_read_timeout_ms: u64,
    /// Host devices exposed to the guest. Everything else on the host stays invisible.
    pub passthrough: Vec<PassthroughFilter>,
    pub emulated: Vec<EmulatedDeviceConfig>,
}

impl Default for UsbdConfig {
    fn default() -> Self {
        Self {
            transfer_pool_size: DEFAULT_TRANSFER_POOL_SIZE,
            fake_transfer_latency_us: DEFAULT_FAKE_TRANSFER_LATENCY_US,
            descriptor_read_timeout_ms: 0,
            passthrough: PassthroughFilter::defaults(),
            emulated: Vec::new(),
        }
    }
}

impl UsbdConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=MAX_TRANSFER_POOL_SIZE).contains(&self.transfer_pool_size) {
            return Err(ConfigError::TransferPoolSize {
                got: self.transfer_pool_size,
                max: MAX_TRANSFER_POOL_SIZE,
            });
        }
        for (index, device) in self.emulated.iter().enumerate() {
            device
                .validate()
                .map_err(|reason| ConfigError::EmulatedDevice { index, reason })?;
        }
        Ok(())
    }

    pub fn matches_passthrough(
        &self,
        vendor_id: u16,
        product_id: u16,
    ) -> Option<&PassthroughFilter> {
        self.passthrough
            .iter()
            .find(|f| f.vendor_id == vendor_id && f.product_id == product_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassthroughFilter {
    pub vendor_id: u16,
    pub product_id: u16,
    #[serde(default)]
    pub name: String,
}

impl PassthroughFilter {
    pub fn new(vendor_id: u16, product_id: u16, name: impl Into<String>) -> Self {
        Self {
            vendor_id,
            product_id,
            name: name.into(),
        }
    }

    pub fn defaults() -> Vec<Self> {
        vec![
            Self::new(0x1430, 0x0150, "Skylanders Portal"),
            Self::new(0x0E6F, 0x0129, "Disney Infinity Base"),
            Self::new(0x0E6F, 0x0241, "Lego Dimensions Portal"),
        ]
    }
}

/// Static description of a generic emulated device with a single configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmulatedDeviceConfig {
    pub name: String,
    pub vendor_id: u16,
    pub product_id: u16,
    pub bcd_usb: u16,
    pub bcd_device: u16,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub max_packet_size0: u8,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
    pub self_powered: bool,
    /// In 2 mA units.
    pub max_power: u8,
    pub interfaces: Vec<EmulatedInterfaceConfig>,
    /// Only add this device when no passthrough device with the same VID/PID was found.
    pub only_if_absent: bool,
}

impl Default for EmulatedDeviceConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            vendor_id: 0,
            product_id: 0,
            bcd_usb: 0x0200,
            bcd_device: 0x0100,
            device_class: 0,
            device_subclass: 0,
            device_protocol: 0,
            max_packet_size0: 64,
            manufacturer: None,
            product: None,
            serial_number: None,
            self_powered: false,
            max_power: 50,
            interfaces: Vec::new(),
            only_if_absent: false,
        }
    }
}

impl EmulatedDeviceConfig {
    fn validate(&self) -> Result<(), &'static str> {
        if !matches!(self.max_packet_size0, 8 | 16 | 32 | 64 | 9) {
            return Err("max_packet_size0 must be 8, 16, 32, 64 or 9");
        }
        if self.interfaces.len() > 32 {
            return Err("too many interfaces");
        }
        for iface in &self.interfaces {
            if iface.endpoints.len() > 30 {
                return Err("too many endpoints");
            }
            if iface.endpoints.iter().any(|ep| ep.address & 0x0F == 0) {
                return Err("endpoint 0 cannot be described by an endpoint descriptor");
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmulatedInterfaceConfig {
    pub interface_class: u8,
    pub interface_subclass: u8,
    pub interface_protocol: u8,
    /// Adds a HID class descriptor announcing a report descriptor of this length.
    pub hid_report_descriptor_length: Option<u16>,
    pub endpoints: Vec<EmulatedEndpointConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmulatedEndpointConfig {
    pub address: u8,
    pub attributes: u8,
    pub max_packet_size: u16,
    pub interval: u8,
}

impl Default for EmulatedEndpointConfig {
    fn default() -> Self {
        // Interrupt IN endpoint 1.
        Self {
            address: 0x81,
            attributes: 0x03,
            max_packet_size: 64,
            interval: 1,
        }
    }
}
