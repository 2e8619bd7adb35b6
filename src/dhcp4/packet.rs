//! DHCPv4 packet codec (RFC 2131 fixed header + options).

use std::net::Ipv4Addr;

use macaddr::MacAddr6;

use super::options::{Options, OPT_MESSAGE_TYPE};
use crate::error::PacketError;

/// Magic cookie preceding the options block: 99.130.83.99.
pub const MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];

/// Options begin at this offset, right after the cookie.
const OPTIONS_OFFSET: usize = 240;

/// Marshaled packets are padded out to at least this many bytes; some
/// PXE ROMs drop anything shorter.
const MIN_PACKET_SIZE: usize = 272;

/// DHCP message types (option 53).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Discover = 1,
    Offer = 2,
    Request = 3,
    Decline = 4,
    Ack = 5,
    Nak = 6,
    Release = 7,
    Inform = 8,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Discover),
            2 => Some(Self::Offer),
            3 => Some(Self::Request),
            4 => Some(Self::Decline),
            5 => Some(Self::Ack),
            6 => Some(Self::Nak),
            7 => Some(Self::Release),
            8 => Some(Self::Inform),
            _ => None,
        }
    }

    /// The BOOTP op field implied by the message type: requests are
    /// BOOTREQUEST (1), replies are BOOTREPLY (2).
    fn op(&self) -> u8 {
        match self {
            Self::Offer | Self::Ack | Self::Nak => 2,
            _ => 1,
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Discover => write!(f, "DISCOVER"),
            Self::Offer => write!(f, "OFFER"),
            Self::Request => write!(f, "REQUEST"),
            Self::Decline => write!(f, "DECLINE"),
            Self::Ack => write!(f, "ACK"),
            Self::Nak => write!(f, "NAK"),
            Self::Release => write!(f, "RELEASE"),
            Self::Inform => write!(f, "INFORM"),
        }
    }
}

/// How a reply should be transmitted, per RFC 2131 §4.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxType {
    /// Must be broadcast (or unicast to the hardware address).
    Broadcast,
    /// Unicast to the relay agent on port 67.
    RelayAddr,
    /// Unicast to the client's configured address on port 68.
    ClientAddr,
    /// Unicast on port 68 with the link-layer destination set
    /// explicitly; ARP must not be consulted because the client has
    /// no IP yet. Backends that cannot set the link-layer destination
    /// may broadcast instead.
    HardwareAddr,
}

/// A parsed DHCPv4 packet.
#[derive(Debug, Clone)]
pub struct Packet {
    pub r#type: MessageType,
    pub transaction_id: u32,
    pub broadcast: bool,
    pub hardware_addr: MacAddr6,
    pub client_addr: Ipv4Addr,
    pub your_addr: Ipv4Addr,
    pub server_addr: Ipv4Addr,
    pub relay_addr: Ipv4Addr,
    pub boot_server_name: String,
    pub boot_filename: String,
    pub options: Options,
}

impl Packet {
    /// A packet skeleton with all address slots zeroed.
    pub fn new(r#type: MessageType, transaction_id: u32, hardware_addr: MacAddr6) -> Self {
        Self {
            r#type,
            transaction_id,
            broadcast: false,
            hardware_addr,
            client_addr: Ipv4Addr::UNSPECIFIED,
            your_addr: Ipv4Addr::UNSPECIFIED,
            server_addr: Ipv4Addr::UNSPECIFIED,
            relay_addr: Ipv4Addr::UNSPECIFIED,
            boot_server_name: String::new(),
            boot_filename: String::new(),
            options: Options::new(),
        }
    }

    /// Decode a packet from its wire form.
    pub fn unmarshal(bs: &[u8]) -> Result<Self, PacketError> {
        if bs.len() < OPTIONS_OFFSET {
            return Err(PacketError::TooShort {
                expected: OPTIONS_OFFSET,
                actual: bs.len(),
            });
        }
        if bs[236..240] != MAGIC_COOKIE {
            return Err(PacketError::InvalidMagicCookie);
        }

        let htype = bs[1];
        let hlen = bs[2];
        if htype != 1 || hlen != 6 {
            return Err(PacketError::UnsupportedHardware { htype, hlen });
        }

        let options = Options::unmarshal(&bs[OPTIONS_OFFSET..])?;
        let type_byte = *options
            .get(OPT_MESSAGE_TYPE)
            .and_then(|v| v.first())
            .ok_or(PacketError::MissingMessageType)?;
        let r#type =
            MessageType::from_u8(type_byte).ok_or(PacketError::InvalidMessageType(type_byte))?;

        Ok(Self {
            r#type,
            transaction_id: u32::from_be_bytes([bs[4], bs[5], bs[6], bs[7]]),
            broadcast: bs[10] & 0x80 != 0,
            hardware_addr: MacAddr6::new(bs[28], bs[29], bs[30], bs[31], bs[32], bs[33]),
            client_addr: Ipv4Addr::new(bs[12], bs[13], bs[14], bs[15]),
            your_addr: Ipv4Addr::new(bs[16], bs[17], bs[18], bs[19]),
            server_addr: Ipv4Addr::new(bs[20], bs[21], bs[22], bs[23]),
            relay_addr: Ipv4Addr::new(bs[24], bs[25], bs[26], bs[27]),
            boot_server_name: null_terminated(&bs[44..108]),
            boot_filename: null_terminated(&bs[108..236]),
            options,
        })
    }

    /// Encode the packet. The fixed header is 240 bytes, options
    /// follow in ascending code order, and the result is padded to at
    /// least 272 bytes.
    pub fn marshal(&self) -> Result<Vec<u8>, PacketError> {
        let mut opts = self.options.clone();
        opts.insert(OPT_MESSAGE_TYPE, vec![self.r#type as u8]);

        let mut bs = vec![0u8; OPTIONS_OFFSET];
        bs[0] = self.r#type.op();
        bs[1] = 1; // Ethernet
        bs[2] = 6;
        bs[4..8].copy_from_slice(&self.transaction_id.to_be_bytes());
        if self.broadcast {
            bs[10] = 0x80;
        }
        bs[12..16].copy_from_slice(&self.client_addr.octets());
        bs[16..20].copy_from_slice(&self.your_addr.octets());
        bs[20..24].copy_from_slice(&self.server_addr.octets());
        bs[24..28].copy_from_slice(&self.relay_addr.octets());
        bs[28..34].copy_from_slice(self.hardware_addr.as_bytes());
        copy_padded(&mut bs[44..108], self.boot_server_name.as_bytes());
        copy_padded(&mut bs[108..236], self.boot_filename.as_bytes());
        bs[236..240].copy_from_slice(&MAGIC_COOKIE);

        bs.extend_from_slice(&opts.marshal()?);
        if bs.len() < MIN_PACKET_SIZE {
            bs.resize(MIN_PACKET_SIZE, 0);
        }
        Ok(bs)
    }

    /// Pick the transmission strategy for this packet from its
    /// address fields.
    pub fn tx_type(&self) -> TxType {
        if !self.relay_addr.is_unspecified() {
            TxType::RelayAddr
        } else if !self.client_addr.is_unspecified() && !self.broadcast {
            TxType::ClientAddr
        } else if self.broadcast {
            TxType::Broadcast
        } else {
            TxType::HardwareAddr
        }
    }
}

fn null_terminated(bs: &[u8]) -> String {
    let end = bs.iter().position(|&b| b == 0).unwrap_or(bs.len());
    String::from_utf8_lossy(&bs[..end]).into_owned()
}

fn copy_padded(dst: &mut [u8], src: &[u8]) {
    let n = src.len().min(dst.len());
    dst[..n].copy_from_slice(&src[..n]);
}
