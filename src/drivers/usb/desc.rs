//! USB descriptor types and control-request constants.
//!
//! Field layouts follow USB 2.0 §9.6. This reconstructs the
//! `drivers::usb::core` module the donor's `ehci.rs` imports from but whose
//! source was not part of the retrieved pack.

use heapless::Vec;
use zerocopy::byteorder::little_endian::U16;
use zerocopy::{FromBytes, Immutable, KnownLayout};

/// Standard control-request `bRequest` type (USB 2.0 table 9-4).
pub mod request {
    pub const GET_DESCRIPTOR: u8 = 6;
    pub const SET_ADDRESS: u8 = 5;
    pub const SET_CONFIGURATION: u8 = 9;
}

/// `bmRequestType` direction/type/recipient bits (USB 2.0 table 9-2).
pub mod req_type {
    pub const HOST_TO_DEVICE: u8 = 0 << 7;
    pub const DEVICE_TO_HOST: u8 = 1 << 7;
    pub const STANDARD: u8 = 0 << 5;
    pub const RECIPIENT_DEVICE: u8 = 0;
}

/// `bDescriptorType` values (USB 2.0 table 9-5).
pub mod desc_type {
    pub const DEVICE: u8 = 1;
    pub const CONFIGURATION: u8 = 2;
    pub const INTERFACE: u8 = 4;
    pub const ENDPOINT: u8 = 5;
}

/// `bInterfaceClass` values relevant to this crate's minimum class profile.
pub mod class {
    pub const HID: u8 = 0x03;
}

/// Maximum number of interfaces tracked per device during enumeration.
pub const MAX_INTERFACES: usize = 4;
/// Maximum number of endpoints tracked per interface.
pub const MAX_ENDPOINTS: usize = 4;

/// An 8-byte USB control setup packet.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct SetupPacket {
    pub bm_request_type: u8,
    pub b_request: u8,
    pub w_value: u16,
    pub w_index: u16,
    pub w_length: u16,
}

impl SetupPacket {
    pub fn get_descriptor(desc_type: u8, index: u8, length: u16) -> Self {
        SetupPacket {
            bm_request_type: req_type::DEVICE_TO_HOST | req_type::STANDARD | req_type::RECIPIENT_DEVICE,
            b_request: request::GET_DESCRIPTOR,
            w_value: ((desc_type as u16) << 8) | index as u16,
            w_index: 0,
            w_length: length,
        }
    }

    pub fn set_address(address: u8) -> Self {
        SetupPacket {
            bm_request_type: req_type::HOST_TO_DEVICE | req_type::STANDARD | req_type::RECIPIENT_DEVICE,
            b_request: request::SET_ADDRESS,
            w_value: address as u16,
            w_index: 0,
            w_length: 0,
        }
    }

    pub fn set_configuration(config_value: u8) -> Self {
        SetupPacket {
            bm_request_type: req_type::HOST_TO_DEVICE | req_type::STANDARD | req_type::RECIPIENT_DEVICE,
            b_request: request::SET_CONFIGURATION,
            w_value: config_value as u16,
            w_index: 0,
            w_length: 0,
        }
    }

    /// Whether this request's data stage (if any) moves device-to-host.
    pub fn is_device_to_host(&self) -> bool {
        self.bm_request_type & req_type::DEVICE_TO_HOST != 0
    }

    pub fn as_bytes(&self) -> [u8; 8] {
        [
            self.bm_request_type,
            self.b_request,
            (self.w_value & 0xFF) as u8,
            (self.w_value >> 8) as u8,
            (self.w_index & 0xFF) as u8,
            (self.w_index >> 8) as u8,
            (self.w_length & 0xFF) as u8,
            (self.w_length >> 8) as u8,
        ]
    }
}

/// Wire layout of the full 18-byte device descriptor (USB 2.0 table 9-8),
/// cast directly over the DMA scratch buffer rather than hand-indexed —
/// same idiom as the GIC register block reinterpretation this crate's
/// `zerocopy` dependency is grounded on.
#[derive(FromBytes, Immutable, KnownLayout)]
#[repr(C)]
struct DeviceDescriptorWire {
    b_length: u8,
    b_descriptor_type: u8,
    bcd_usb: U16,
    b_device_class: u8,
    b_device_sub_class: u8,
    b_device_protocol: u8,
    b_max_packet_size0: u8,
    id_vendor: U16,
    id_product: U16,
    bcd_device: U16,
    i_manufacturer: u8,
    i_product: u8,
    i_serial_number: u8,
    b_num_configurations: u8,
}

/// Parsed 18-byte device descriptor (USB 2.0 table 9-8).
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceDescriptor {
    pub b_max_packet_size0: u8,
    pub id_vendor: u16,
    pub id_product: u16,
    pub b_num_configurations: u8,
}

impl DeviceDescriptor {
    /// Parse the first 8 bytes (all that's requested before SET_ADDRESS).
    pub fn from_partial(buf: &[u8]) -> Self {
        DeviceDescriptor {
            b_max_packet_size0: buf[7],
            ..Default::default()
        }
    }

    /// Parse the full 18-byte descriptor.
    pub fn from_full(buf: &[u8]) -> Self {
        let Ok(wire) = DeviceDescriptorWire::ref_from_bytes(buf) else {
            // Short read (enumeration step returned fewer bytes than
            // requested); fall back to whatever the partial descriptor saw.
            return DeviceDescriptor::from_partial(buf);
        };
        DeviceDescriptor {
            b_max_packet_size0: wire.b_max_packet_size0,
            id_vendor: wire.id_vendor.get(),
            id_product: wire.id_product.get(),
            b_num_configurations: wire.b_num_configurations,
        }
    }
}

/// Endpoint direction, derived from the low bit of `bEndpointAddress`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Out,
    In,
}

/// Endpoint transfer type (USB 2.0 table 9-13, `bmAttributes` bits 1:0).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointType {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

impl EndpointType {
    pub fn from_attributes(bm_attributes: u8) -> Self {
        match bm_attributes & 0x3 {
            0 => EndpointType::Control,
            1 => EndpointType::Isochronous,
            2 => EndpointType::Bulk,
            _ => EndpointType::Interrupt,
        }
    }
}

/// Parsed endpoint descriptor.
#[derive(Debug, Clone, Copy)]
pub struct EndpointInfo {
    pub address: u8,
    pub direction: Direction,
    pub xfer_type: EndpointType,
    pub max_packet_size: u16,
    pub interval: u8,
}

/// Parsed interface descriptor plus its endpoints.
#[derive(Debug, Clone)]
pub struct InterfaceInfo {
    pub interface_number: u8,
    pub interface_class: u8,
    pub endpoints: Vec<EndpointInfo, MAX_ENDPOINTS>,
}

/// Parsed configuration descriptor and all interfaces within it.
#[derive(Debug, Clone, Default)]
pub struct ConfigurationInfo {
    pub config_value: u8,
    pub total_length: u16,
    pub interfaces: Vec<InterfaceInfo, MAX_INTERFACES>,
}

impl Default for InterfaceInfo {
    fn default() -> Self {
        InterfaceInfo {
            interface_number: 0,
            interface_class: 0,
            endpoints: Vec::new(),
        }
    }
}

/// Parse the 9-byte configuration descriptor header only.
pub fn parse_configuration_header(buf: &[u8]) -> (u16, u8) {
    let total_length = u16::from_le_bytes([buf[2], buf[3]]);
    let config_value = buf[5];
    (total_length, config_value)
}

/// Walk a full configuration descriptor buffer, collecting interface and
/// endpoint descriptors. Unknown descriptor types are skipped by their
/// `bLength`, matching the tolerant walk tinyusb's enumeration task performs.
pub fn parse_configuration(buf: &[u8]) -> ConfigurationInfo {
    let (total_length, config_value) = parse_configuration_header(buf);
    let mut info = ConfigurationInfo {
        config_value,
        total_length,
        interfaces: Vec::new(),
    };

    let mut offset = 0usize;
    let end = (total_length as usize).min(buf.len());
    while offset + 2 <= end {
        let len = buf[offset] as usize;
        if len == 0 || offset + len > end {
            break;
        }
        let desc_type = buf[offset + 1];
        match desc_type {
            desc_type::INTERFACE if len >= 9 => {
                let iface = InterfaceInfo {
                    interface_number: buf[offset + 2],
                    interface_class: buf[offset + 5],
                    endpoints: Vec::new(),
                };
                let _ = info.interfaces.push(iface);
            }
            desc_type::ENDPOINT if len >= 7 => {
                if let Some(iface) = info.interfaces.last_mut() {
                    let address = buf[offset + 2];
                    let direction = if address & 0x80 != 0 {
                        Direction::In
                    } else {
                        Direction::Out
                    };
                    let ep = EndpointInfo {
                        address: address & 0x0F,
                        direction,
                        xfer_type: EndpointType::from_attributes(buf[offset + 3]),
                        max_packet_size: u16::from_le_bytes([buf[offset + 4], buf[offset + 5]]) & 0x7FF,
                        interval: buf[offset + 6],
                    };
                    let _ = iface.endpoints.push(ep);
                }
            }
            _ => {}
        }
        offset += len;
    }

    info
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_descriptor_encodes_type_and_index_in_w_value() {
        let setup = SetupPacket::get_descriptor(desc_type::DEVICE, 0, 8);
        assert_eq!(setup.bm_request_type, req_type::DEVICE_TO_HOST | req_type::STANDARD);
        assert_eq!(setup.b_request, request::GET_DESCRIPTOR);
        assert_eq!(setup.w_value, (desc_type::DEVICE as u16) << 8);
        assert_eq!(setup.w_length, 8);
        assert!(setup.is_device_to_host());
    }

    #[test]
    fn set_address_is_host_to_device_with_no_data_stage() {
        let setup = SetupPacket::set_address(5);
        assert_eq!(setup.b_request, request::SET_ADDRESS);
        assert_eq!(setup.w_value, 5);
        assert_eq!(setup.w_length, 0);
        assert!(!setup.is_device_to_host());
    }

    #[test]
    fn setup_packet_as_bytes_is_little_endian() {
        let setup = SetupPacket {
            bm_request_type: 0x80,
            b_request: 6,
            w_value: 0x0102,
            w_index: 0x0304,
            w_length: 0x0506,
        };
        assert_eq!(setup.as_bytes(), [0x80, 6, 0x02, 0x01, 0x04, 0x03, 0x06, 0x05]);
    }

    #[test]
    fn device_descriptor_from_partial_reads_max_packet_size0() {
        let buf = [18, 1, 0x00, 0x02, 0, 0, 0, 64, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1];
        let desc = DeviceDescriptor::from_partial(&buf);
        assert_eq!(desc.b_max_packet_size0, 64);
    }

    #[test]
    fn device_descriptor_from_full_parses_every_field() {
        // bLength, bDescriptorType, bcdUSB(LE), class, subclass, protocol,
        // maxPacketSize0, idVendor(LE), idProduct(LE), bcdDevice(LE),
        // iManufacturer, iProduct, iSerialNumber, bNumConfigurations.
        let buf: [u8; 18] = [
            18, 1, 0x00, 0x02, 0, 0, 0, 64, 0xD8, 0x04, 0x01, 0x00, 0x00, 0x01, 1, 2, 3, 1,
        ];
        let desc = DeviceDescriptor::from_full(&buf);
        assert_eq!(desc.b_max_packet_size0, 64);
        assert_eq!(desc.id_vendor, 0x04D8);
        assert_eq!(desc.id_product, 0x0001);
        assert_eq!(desc.b_num_configurations, 1);
    }

    #[test]
    fn device_descriptor_from_full_falls_back_on_short_buffer() {
        let buf = [18, 1, 0, 2, 0, 0, 0, 9];
        let desc = DeviceDescriptor::from_full(&buf);
        assert_eq!(desc.b_max_packet_size0, 9);
        assert_eq!(desc.id_vendor, 0);
    }

    #[test]
    fn endpoint_type_from_attributes_decodes_low_two_bits() {
        assert_eq!(EndpointType::from_attributes(0), EndpointType::Control);
        assert_eq!(EndpointType::from_attributes(1), EndpointType::Isochronous);
        assert_eq!(EndpointType::from_attributes(2), EndpointType::Bulk);
        assert_eq!(EndpointType::from_attributes(3), EndpointType::Interrupt);
    }

    #[test]
    fn parse_configuration_walks_interface_and_endpoint() {
        #[rustfmt::skip]
        let buf: [u8; 25] = [
            // Configuration header.
            9, 2, 25, 0, 1, 7, 0, 0x80, 50,
            // Interface descriptor (class 0x03 == HID).
            9, 4, 0, 0, 1, 0x03, 0, 0, 0,
            // Endpoint descriptor: IN, interrupt, 8 bytes, 10ms interval.
            7, 5, 0x81, 0x03, 8, 0, 10,
        ];

        let config = parse_configuration(&buf);
        assert_eq!(config.total_length, 25);
        assert_eq!(config.config_value, 7);
        assert_eq!(config.interfaces.len(), 1);

        let iface = &config.interfaces[0];
        assert_eq!(iface.interface_number, 0);
        assert_eq!(iface.interface_class, class::HID);
        assert_eq!(iface.endpoints.len(), 1);

        let ep = &iface.endpoints[0];
        assert_eq!(ep.address, 0x01);
        assert_eq!(ep.direction, Direction::In);
        assert_eq!(ep.xfer_type, EndpointType::Interrupt);
        assert_eq!(ep.max_packet_size, 8);
        assert_eq!(ep.interval, 10);
    }

    #[test]
    fn parse_configuration_skips_unknown_descriptor_by_length() {
        #[rustfmt::skip]
        let buf: [u8; 12] = [
            9, 2, 12, 0, 0, 1, 0, 0x80, 50,
            // 3-byte descriptor of an unrecognized type, skipped whole.
            3, 0xFF, 0x00,
        ];
        let config = parse_configuration(&buf);
        assert_eq!(config.interfaces.len(), 0);
    }
}
