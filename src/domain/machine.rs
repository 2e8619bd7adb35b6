//! Machine identity and firmware classification.

use std::fmt;

use macaddr::MacAddr6;

/// CPU architecture self-reported by a booting machine.
///
/// Legacy BIOS machines report themselves as `Ia32` even when the CPU
/// can execute 64-bit code; there is no way to know more from the
/// DHCP exchange alone, so kernel selection should key off this and
/// nothing else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Architecture {
    /// 32-bit x86.
    Ia32 = 0,
    /// 64-bit x86 (amd64).
    X64 = 1,
}

impl Architecture {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Ia32),
            1 => Some(Self::X64),
            _ => None,
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ia32 => write!(f, "IA32"),
            Self::X64 => write!(f, "X64"),
        }
    }
}

/// The kind of firmware attempting to boot.
///
/// Used only to pick the right bootloader binary; kernel selection
/// keys off [`Architecture`]. Values 0/6/7/9 are the RFC 4578
/// client-architecture codes, 1 and 10 are internal: they appear as
/// the numeric suffix of TFTP boot filenames (`<mac>/<fwtype>`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Firmware {
    /// Classic x86 BIOS with a PXE/UNDI network stack.
    X86Pc = 0,
    /// A client running iPXE as its ROM, using iPXE native drivers.
    /// Chainloading these to a UNDI stack does not work.
    X86Ipxe = 1,
    /// 32-bit x86 EFI.
    Efi32 = 6,
    /// 64-bit x86 EFI.
    Efi64 = 7,
    /// EFI byte-code interpreter.
    EfiBc = 9,
    /// A client we already chainloaded to our own iPXE build
    /// (user-class "pixiecore"). Distinguished so the chainload
    /// doesn't loop.
    ChainIpxe = 10,
}

impl Firmware {
    /// Decode the numeric fwtype suffix used in boot filenames.
    pub fn from_fwtype(value: u16) -> Option<Self> {
        match value {
            0 => Some(Self::X86Pc),
            1 => Some(Self::X86Ipxe),
            6 => Some(Self::Efi32),
            7 => Some(Self::Efi64),
            9 => Some(Self::EfiBc),
            10 => Some(Self::ChainIpxe),
            _ => None,
        }
    }

    pub fn fwtype(&self) -> u16 {
        *self as u16
    }
}

impl fmt::Display for Firmware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::X86Pc => write!(f, "BIOS/UNDI"),
            Self::X86Ipxe => write!(f, "iPXE"),
            Self::Efi32 => write!(f, "EFI32"),
            Self::Efi64 => write!(f, "EFI64"),
            Self::EfiBc => write!(f, "EFI-BC"),
            Self::ChainIpxe => write!(f, "chainloaded iPXE"),
        }
    }
}

/// A machine attempting to boot.
///
/// Constructed fresh from DHCP options on every inbound packet and
/// never persisted.
#[derive(Debug, Clone)]
pub struct Machine {
    pub mac: MacAddr6,
    /// Client GUID from option 97, formatted as a UUID string.
    /// Present only when the firmware supplied it (many ROMs omit it).
    pub guid: Option<String>,
    pub arch: Architecture,
}

/// Lowercase colon-separated MAC, the form embedded in boot filenames
/// and URLs.
pub fn mac_string(mac: &MacAddr6) -> String {
    mac.to_string().to_lowercase()
}

/// Format the 16 GUID bytes of option 97 (after the type byte) as a
/// standard UUID string.
pub fn format_guid(bytes: &[u8]) -> String {
    let hex: Vec<String> = bytes.iter().map(|b| format!("{b:02x}")).collect();
    format!(
        "{}-{}-{}-{}-{}",
        hex[0..4].join(""),
        hex[4..6].join(""),
        hex[6..8].join(""),
        hex[8..10].join(""),
        hex[10..16].join(""),
    )
}
