//! USB descriptor trees.
//!
//! A [`DescriptorNode`] holds one descriptor as raw bytes (`bLength`, `bDescriptorType`, payload)
//! plus its nested descriptors. The device descriptor is the root, configurations are its
//! children, and interfaces/endpoints/class-specific descriptors hang below the configuration.
//! Serialization is a pre-order walk, which reproduces the flat layout a device returns for
//! `GET_DESCRIPTOR(CONFIGURATION)`.
//!
//! Payloads are stored untyped; [`TypedDescriptor`] implementations decode them on demand based
//! on the type tag.

pub const DESCRIPTOR_TYPE_DEVICE: u8 = 0x01;
pub const DESCRIPTOR_TYPE_CONFIGURATION: u8 = 0x02;
pub const DESCRIPTOR_TYPE_STRING: u8 = 0x03;
pub const DESCRIPTOR_TYPE_INTERFACE: u8 = 0x04;
pub const DESCRIPTOR_TYPE_ENDPOINT: u8 = 0x05;
pub const DESCRIPTOR_TYPE_HID: u8 = 0x21;
pub const DESCRIPTOR_TYPE_CS_INTERFACE: u8 = 0x24;
pub const DESCRIPTOR_TYPE_CS_ENDPOINT: u8 = 0x25;

/// `bLength` + `bDescriptorType`.
pub const DESCRIPTOR_HEADER_SIZE: usize = 2;

/// Largest payload a single descriptor can carry (`bLength` is a byte).
pub const MAX_DESCRIPTOR_PAYLOAD: usize = u8::MAX as usize - DESCRIPTOR_HEADER_SIZE;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorNode {
    length: u8,
    descriptor_type: u8,
    payload: Vec<u8>,
    children: Vec<DescriptorNode>,
}

impl DescriptorNode {
    /// Builds a node from a type tag and payload. Payloads longer than
    /// [`MAX_DESCRIPTOR_PAYLOAD`] are truncated.
    pub fn new(descriptor_type: u8, payload: &[u8]) -> Self {
        let payload = &payload[..payload.len().min(MAX_DESCRIPTOR_PAYLOAD)];
        Self {
            length: (payload.len() + DESCRIPTOR_HEADER_SIZE) as u8,
            descriptor_type,
            payload: payload.to_vec(),
            children: Vec::new(),
        }
    }

    /// Builds a node from the raw bytes of one descriptor as found on the wire.
    ///
    /// `bLength` is taken from `bytes[0]`; missing payload bytes are zero-filled so the node
    /// always satisfies `length == 2 + payload.len()`. Returns `None` when there is no complete
    /// header or `bLength < 2`.
    pub fn from_raw(bytes: &[u8]) -> Option<Self> {
        let (&length, rest) = bytes.split_first()?;
        let (&descriptor_type, rest) = rest.split_first()?;
        let payload_len = usize::from(length).checked_sub(DESCRIPTOR_HEADER_SIZE)?;

        let mut payload = vec![0u8; payload_len];
        let available = payload_len.min(rest.len());
        payload[..available].copy_from_slice(&rest[..available]);

        Some(Self {
            length,
            descriptor_type,
            payload,
            children: Vec::new(),
        })
    }

    pub fn from_typed<T: TypedDescriptor>(descriptor: &T) -> Self {
        let mut payload = Vec::with_capacity(T::PAYLOAD_LEN);
        descriptor.encode_payload(&mut payload);
        Self::new(T::DESCRIPTOR_TYPE, &payload)
    }

    pub fn device(descriptor: &DeviceDescriptor) -> Self {
        Self::from_typed(descriptor)
    }

    /// Replaces this node's header and payload, keeping its children.
    pub fn set_typed<T: TypedDescriptor>(&mut self, descriptor: &T) {
        let Self {
            length,
            descriptor_type,
            payload,
            ..
        } = Self::from_typed(descriptor);
        self.length = length;
        self.descriptor_type = descriptor_type;
        self.payload = payload;
    }

    pub fn length(&self) -> u8 {
        self.length
    }

    pub fn descriptor_type(&self) -> u8 {
        self.descriptor_type
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn children(&self) -> &[DescriptorNode] {
        &self.children
    }

    pub fn children_mut(&mut self) -> &mut [DescriptorNode] {
        &mut self.children
    }

    /// Appends `node` and returns a reference to the stored child for further nesting.
    pub fn add_child(&mut self, node: DescriptorNode) -> &mut DescriptorNode {
        self.children.push(node);
        let last = self.children.len() - 1;
        &mut self.children[last]
    }

    pub fn clear_children(&mut self) {
        self.children.clear();
    }

    /// Serialized size of this node and all descendants.
    pub fn total_size(&self) -> usize {
        usize::from(self.length) + self.children.iter().map(Self::total_size).sum::<usize>()
    }

    /// This node's own header and payload, without descendants.
    pub fn raw_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(usize::from(self.length));
        out.push(self.length);
        out.push(self.descriptor_type);
        out.extend_from_slice(&self.payload);
        out
    }

    /// Writes this node and its descendants in pre-order into `buf`.
    ///
    /// Stops as soon as `buf` is full and returns the number of bytes written, which is
    /// `min(buf.len(), self.total_size())`.
    pub fn serialize(&self, buf: &mut [u8]) -> usize {
        let mut written = 0usize;

        let header = [self.length, self.descriptor_type];
        for chunk in [&header[..], &self.payload[..]] {
            let n = chunk.len().min(buf.len() - written);
            buf[written..written + n].copy_from_slice(&chunk[..n]);
            written += n;
            if n < chunk.len() {
                return written;
            }
        }

        for child in &self.children {
            if written == buf.len() {
                break;
            }
            written += child.serialize(&mut buf[written..]);
        }
        written
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.total_size()];
        let written = self.serialize(&mut out);
        out.truncate(written);
        out
    }

    /// Decodes the payload as `T` when the type tag matches.
    pub fn decode<T: TypedDescriptor>(&self) -> Option<T> {
        if self.descriptor_type != T::DESCRIPTOR_TYPE {
            return None;
        }
        T::decode_payload(&self.payload)
    }

    pub fn as_device(&self) -> Option<DeviceDescriptor> {
        self.decode()
    }

    pub fn as_configuration(&self) -> Option<ConfigurationDescriptor> {
        self.decode()
    }

    pub fn as_interface(&self) -> Option<InterfaceDescriptor> {
        self.decode()
    }

    pub fn as_endpoint(&self) -> Option<EndpointDescriptor> {
        self.decode()
    }

    pub fn as_hid(&self) -> Option<HidDescriptor> {
        self.decode()
    }

    /// Pre-order iterator over this node and all descendants.
    pub fn iter(&self) -> Iter<'_> {
        Iter { stack: vec![self] }
    }

    /// Finds the endpoint descriptor with the given `bEndpointAddress` anywhere below this node.
    pub fn find_endpoint(&self, endpoint_address: u8) -> Option<EndpointDescriptor> {
        self.iter()
            .filter_map(DescriptorNode::as_endpoint)
            .find(|ep| ep.endpoint_address == endpoint_address)
    }

    /// Rewrites a configuration descriptor's `wTotalLength` to match its subtree.
    ///
    /// Returns `false` (and leaves the node untouched) for anything but a configuration node
    /// with a complete `wTotalLength` field.
    pub fn update_total_length(&mut self) -> bool {
        if self.descriptor_type != DESCRIPTOR_TYPE_CONFIGURATION || self.payload.len() < 2 {
            return false;
        }
        let total = u16::try_from(self.total_size()).unwrap_or(u16::MAX);
        self.payload[..2].copy_from_slice(&total.to_le_bytes());
        true
    }
}

/// Rebuilds a configuration tree from the flat bytes returned by
/// `GET_DESCRIPTOR(CONFIGURATION)`.
///
/// Interface descriptors nest under the configuration. Every other descriptor nests under the
/// most recent interface, or under the configuration if no interface has been seen yet. The walk
/// stops at the first zero/one-length descriptor or at a descriptor that would run past the end
/// of `bytes`.
pub fn parse_configuration(bytes: &[u8]) -> Option<DescriptorNode> {
    let mut config = DescriptorNode::from_raw(bytes)?;
    if config.descriptor_type != DESCRIPTOR_TYPE_CONFIGURATION {
        return None;
    }

    let mut offset = usize::from(config.length);
    while offset + DESCRIPTOR_HEADER_SIZE <= bytes.len() {
        let len = usize::from(bytes[offset]);
        if len < DESCRIPTOR_HEADER_SIZE || offset + len > bytes.len() {
            break;
        }
        let Some(node) = DescriptorNode::from_raw(&bytes[offset..offset + len]) else {
            break;
        };
        offset += len;

        if node.descriptor_type == DESCRIPTOR_TYPE_INTERFACE {
            config.children.push(node);
            continue;
        }
        match config
            .children
            .iter_mut()
            .rev()
            .find(|c| c.descriptor_type == DESCRIPTOR_TYPE_INTERFACE)
        {
            Some(interface) => interface.children.push(node),
            None => config.children.push(node),
        }
    }

    Some(config)
}

pub struct Iter<'a> {
    stack: Vec<&'a DescriptorNode>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a DescriptorNode;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.stack.pop()?;
        self.stack.extend(node.children.iter().rev());
        Some(node)
    }
}

/// A descriptor with a fixed payload layout.
pub trait TypedDescriptor: Sized {
    const DESCRIPTOR_TYPE: u8;
    const PAYLOAD_LEN: usize;

    fn encode_payload(&self, out: &mut Vec<u8>);

    /// Decodes from a payload of at least `PAYLOAD_LEN` bytes. Trailing bytes are ignored.
    fn decode_payload(payload: &[u8]) -> Option<Self>;
}

fn le16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub bcd_usb: u16,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub max_packet_size0: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub bcd_device: u16,
    pub manufacturer_index: u8,
    pub product_index: u8,
    pub serial_number_index: u8,
    pub num_configurations: u8,
}

impl TypedDescriptor for DeviceDescriptor {
    const DESCRIPTOR_TYPE: u8 = DESCRIPTOR_TYPE_DEVICE;
    const PAYLOAD_LEN: usize = 16;

    fn encode_payload(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.bcd_usb.to_le_bytes());
        out.extend_from_slice(&[
            self.device_class,
            self.device_subclass,
            self.device_protocol,
            self.max_packet_size0,
        ]);
        out.extend_from_slice(&self.vendor_id.to_le_bytes());
        out.extend_from_slice(&self.product_id.to_le_bytes());
        out.extend_from_slice(&self.bcd_device.to_le_bytes());
        out.extend_from_slice(&[
            self.manufacturer_index,
            self.product_index,
            self.serial_number_index,
            self.num_configurations,
        ]);
    }

    fn decode_payload(p: &[u8]) -> Option<Self> {
        if p.len() < Self::PAYLOAD_LEN {
            return None;
        }
        Some(Self {
            bcd_usb: le16(p, 0),
            device_class: p[2],
            device_subclass: p[3],
            device_protocol: p[4],
            max_packet_size0: p[5],
            vendor_id: le16(p, 6),
            product_id: le16(p, 8),
            bcd_device: le16(p, 10),
            manufacturer_index: p[12],
            product_index: p[13],
            serial_number_index: p[14],
            num_configurations: p[15],
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConfigurationDescriptor {
    pub total_length: u16,
    pub num_interfaces: u8,
    pub configuration_value: u8,
    pub configuration_index: u8,
    pub attributes: u8,
    /// In 2 mA units.
    pub max_power: u8,
}

impl TypedDescriptor for ConfigurationDescriptor {
    const DESCRIPTOR_TYPE: u8 = DESCRIPTOR_TYPE_CONFIGURATION;
    const PAYLOAD_LEN: usize = 7;

    fn encode_payload(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.total_length.to_le_bytes());
        out.extend_from_slice(&[
            self.num_interfaces,
            self.configuration_value,
            self.configuration_index,
            self.attributes,
            self.max_power,
        ]);
    }

    fn decode_payload(p: &[u8]) -> Option<Self> {
        if p.len() < Self::PAYLOAD_LEN {
            return None;
        }
        Some(Self {
            total_length: le16(p, 0),
            num_interfaces: p[2],
            configuration_value: p[3],
            configuration_index: p[4],
            attributes: p[5],
            max_power: p[6],
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterfaceDescriptor {
    pub interface_number: u8,
    pub alternate_setting: u8,
    pub num_endpoints: u8,
    pub interface_class: u8,
    pub interface_subclass: u8,
    pub interface_protocol: u8,
    pub interface_index: u8,
}

impl TypedDescriptor for InterfaceDescriptor {
    const DESCRIPTOR_TYPE: u8 = DESCRIPTOR_TYPE_INTERFACE;
    const PAYLOAD_LEN: usize = 7;

    fn encode_payload(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&[
            self.interface_number,
            self.alternate_setting,
            self.num_endpoints,
            self.interface_class,
            self.interface_subclass,
            self.interface_protocol,
            self.interface_index,
        ]);
    }

    fn decode_payload(p: &[u8]) -> Option<Self> {
        if p.len() < Self::PAYLOAD_LEN {
            return None;
        }
        Some(Self {
            interface_number: p[0],
            alternate_setting: p[1],
            num_endpoints: p[2],
            interface_class: p[3],
            interface_subclass: p[4],
            interface_protocol: p[5],
            interface_index: p[6],
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EndpointDescriptor {
    pub endpoint_address: u8,
    pub attributes: u8,
    pub max_packet_size: u16,
    pub interval: u8,
}

impl TypedDescriptor for EndpointDescriptor {
    const DESCRIPTOR_TYPE: u8 = DESCRIPTOR_TYPE_ENDPOINT;
    const PAYLOAD_LEN: usize = 5;

    fn encode_payload(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&[self.endpoint_address, self.attributes]);
        out.extend_from_slice(&self.max_packet_size.to_le_bytes());
        out.push(self.interval);
    }

    fn decode_payload(p: &[u8]) -> Option<Self> {
        if p.len() < Self::PAYLOAD_LEN {
            return None;
        }
        Some(Self {
            endpoint_address: p[0],
            attributes: p[1],
            max_packet_size: le16(p, 2),
            interval: p[4],
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HidDescriptor {
    pub bcd_hid: u16,
    pub country_code: u8,
    pub num_descriptors: u8,
    pub report_descriptor_type: u8,
    pub report_descriptor_length: u16,
}

impl TypedDescriptor for HidDescriptor {
    const DESCRIPTOR_TYPE: u8 = DESCRIPTOR_TYPE_HID;
    const PAYLOAD_LEN: usize = 7;

    fn encode_payload(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.bcd_hid.to_le_bytes());
        out.extend_from_slice(&[
            self.country_code,
            self.num_descriptors,
            self.report_descriptor_type,
        ]);
        out.extend_from_slice(&self.report_descriptor_length.to_le_bytes());
    }

    fn decode_payload(p: &[u8]) -> Option<Self> {
        if p.len() < Self::PAYLOAD_LEN {
            return None;
        }
        Some(Self {
            bcd_hid: le16(p, 0),
            country_code: p[2],
            num_descriptors: p[3],
            report_descriptor_type: p[4],
            report_descriptor_length: le16(p, 5),
        })
    }
}
