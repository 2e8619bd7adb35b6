//! Classic pcap 2.4 reader and writer.
//!
//! Just enough of the format for packet traces: both the microsecond
//! (0xa1b2c3d4) and nanosecond (0xa1b23c4d) magics, either byte
//! order on read, nanosecond little-endian on write.

use std::io::{self, Read, Write};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;

/// Contents of each packet record in a capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    Ethernet,
    Raw,
    Other(u32),
}

impl LinkType {
    fn to_u32(self) -> u32 {
        match self {
            Self::Ethernet => 1,
            Self::Raw => 101,
            Self::Other(v) => v,
        }
    }

    fn from_u32(v: u32) -> Self {
        match v {
            1 => Self::Ethernet,
            101 => Self::Raw,
            other => Self::Other(other),
        }
    }
}

/// One captured packet and its metadata.
#[derive(Debug, Clone)]
pub struct CapturedPacket {
    pub timestamp: SystemTime,
    /// Original length on the wire; can exceed `bytes.len()` when the
    /// capture was truncated by a snap length.
    pub length: usize,
    pub bytes: Vec<u8>,
}

#[derive(Error, Debug)]
pub enum PcapError {
    #[error("bad pcap magic")]
    BadMagic,

    #[error("unknown pcap version {0}.{1}")]
    UnknownVersion(u16, u16),

    #[error(transparent)]
    Io(#[from] io::Error),
}

const MAGIC_MICROS: u32 = 0xa1b2_c3d4;
const MAGIC_NANOS: u32 = 0xa1b2_3c4d;

#[derive(Clone, Copy, PartialEq, Eq)]
enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    fn u16(&self, b: [u8; 2]) -> u16 {
        match self {
            Self::Little => u16::from_le_bytes(b),
            Self::Big => u16::from_be_bytes(b),
        }
    }

    fn u32(&self, b: [u8; 4]) -> u32 {
        match self {
            Self::Little => u32::from_le_bytes(b),
            Self::Big => u32::from_be_bytes(b),
        }
    }
}

/// Extracts packets from a pcap stream.
pub struct Reader<R> {
    pub link_type: LinkType,
    r: R,
    order: ByteOrder,
    nanos_per_subsec: u32,
}

impl<R: Read> Reader<R> {
    pub fn new(mut r: R) -> Result<Self, PcapError> {
        let mut header = [0u8; 24];
        r.read_exact(&mut header)?;

        // The magic is defined as "same or opposite endian" rather
        // than absolutely, so sniff the byte order off the version
        // fields instead. Little-endian first, it is what tools
        // write in practice.
        let mut order = ByteOrder::Little;
        if order.u16([header[4], header[5]]) == 0x0200 {
            order = ByteOrder::Big;
        }

        let magic = order.u32([header[0], header[1], header[2], header[3]]);
        let nanos_per_subsec = match magic {
            MAGIC_MICROS => 1_000,
            MAGIC_NANOS => 1,
            _ => return Err(PcapError::BadMagic),
        };

        let major = order.u16([header[4], header[5]]);
        let minor = order.u16([header[6], header[7]]);
        if major != 2 || minor != 4 {
            return Err(PcapError::UnknownVersion(major, minor));
        }

        let link_type = LinkType::from_u32(order.u32([
            header[20], header[21], header[22], header[23],
        ]));

        Ok(Self {
            link_type,
            r,
            order,
            nanos_per_subsec,
        })
    }

    /// The next packet, or `None` at a clean end of stream.
    pub fn next_packet(&mut self) -> Result<Option<CapturedPacket>, PcapError> {
        let mut hdr = [0u8; 16];
        match self.r.read_exact(&mut hdr) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let sec = self.order.u32([hdr[0], hdr[1], hdr[2], hdr[3]]);
        let subsec = self.order.u32([hdr[4], hdr[5], hdr[6], hdr[7]]);
        let cap_len = self.order.u32([hdr[8], hdr[9], hdr[10], hdr[11]]) as usize;
        let orig_len = self.order.u32([hdr[12], hdr[13], hdr[14], hdr[15]]) as usize;

        let mut bytes = vec![0u8; cap_len];
        self.r.read_exact(&mut bytes)?;

        let timestamp = UNIX_EPOCH
            + Duration::new(sec as u64, subsec * self.nanos_per_subsec);
        Ok(Some(CapturedPacket {
            timestamp,
            length: orig_len,
            bytes,
        }))
    }
}

/// Serializes packets to a pcap stream. The file header is written
/// lazily before the first packet.
pub struct Writer<W> {
    w: W,
    link_type: LinkType,
    snap_len: u32,
    header_written: bool,
}

impl<W: Write> Writer<W> {
    pub fn new(w: W, link_type: LinkType) -> Self {
        Self {
            w,
            link_type,
            snap_len: 65535,
            header_written: false,
        }
    }

    fn write_header(&mut self) -> Result<(), PcapError> {
        let mut hdr = [0u8; 24];
        hdr[0..4].copy_from_slice(&MAGIC_NANOS.to_le_bytes());
        hdr[4..6].copy_from_slice(&2u16.to_le_bytes());
        hdr[6..8].copy_from_slice(&4u16.to_le_bytes());
        // Timezone correction and accuracy are zero in practice.
        hdr[16..20].copy_from_slice(&self.snap_len.to_le_bytes());
        hdr[20..24].copy_from_slice(&self.link_type.to_u32().to_le_bytes());
        self.w.write_all(&hdr)?;
        self.header_written = true;
        Ok(())
    }

    pub fn put(&mut self, pkt: &CapturedPacket) -> Result<(), PcapError> {
        if !self.header_written {
            self.write_header()?;
        }

        let since_epoch = pkt
            .timestamp
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);

        let mut hdr = [0u8; 16];
        hdr[0..4].copy_from_slice(&(since_epoch.as_secs() as u32).to_le_bytes());
        hdr[4..8].copy_from_slice(&since_epoch.subsec_nanos().to_le_bytes());
        hdr[8..12].copy_from_slice(&(pkt.bytes.len() as u32).to_le_bytes());
        hdr[12..16].copy_from_slice(&(pkt.length as u32).to_le_bytes());
        self.w.write_all(&hdr)?;
        self.w.write_all(&pkt.bytes)?;
        Ok(())
    }
}
