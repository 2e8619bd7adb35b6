//! DHCPv6 option multimap and the composite options the boot path
//! needs (IA_NA, IA_ADDR, status codes, vendor class).

use std::collections::BTreeMap;
use std::net::Ipv6Addr;

use crate::error::Packet6Error;

pub const OPT_CLIENT_ID: u16 = 1;
pub const OPT_SERVER_ID: u16 = 2;
pub const OPT_IA_NA: u16 = 3;
pub const OPT_IA_TA: u16 = 4;
pub const OPT_IA_ADDR: u16 = 5;
pub const OPT_ORO: u16 = 6;
pub const OPT_PREFERENCE: u16 = 7;
pub const OPT_STATUS_CODE: u16 = 13;
pub const OPT_RAPID_COMMIT: u16 = 14;
pub const OPT_VENDOR_CLASS: u16 = 16;
pub const OPT_DNS_SERVERS: u16 = 23;
pub const OPT_BOOTFILE_URL: u16 = 59;
pub const OPT_CLIENT_ARCH_TYPE: u16 = 61;

/// Status code 2: no addresses available (RFC 8415 §21.13).
pub const STATUS_NO_ADDRS_AVAIL: u16 = 2;

/// DHCPv6 options, keyed by code. Unlike DHCPv4, a packet may carry
/// the same code several times (IA_NA in particular), so values are
/// lists in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Options(pub BTreeMap<u16, Vec<Vec<u8>>>);

impl Options {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Parse a run of (code, length, value) triples.
    pub fn unmarshal(mut bs: &[u8]) -> Result<Self, Packet6Error> {
        let mut opts = Self::new();
        while !bs.is_empty() {
            if bs.len() < 4 {
                return Err(Packet6Error::TooShort {
                    expected: 4,
                    actual: bs.len(),
                });
            }
            let code = u16::from_be_bytes([bs[0], bs[1]]);
            let len = u16::from_be_bytes([bs[2], bs[3]]) as usize;
            if bs.len() - 4 < len {
                return Err(Packet6Error::TruncatedOption {
                    option: code,
                    claimed: len,
                    actual: bs.len() - 4,
                });
            }
            if code == OPT_ORO && len % 2 != 0 {
                return Err(Packet6Error::OddOro(len));
            }
            opts.add(code, bs[4..4 + len].to_vec());
            bs = &bs[4 + len..];
        }
        Ok(opts)
    }

    /// Wire encoding; codes ascend, repeats keep insertion order.
    pub fn marshal(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (&code, values) in &self.0 {
            for value in values {
                out.extend_from_slice(&code.to_be_bytes());
                out.extend_from_slice(&(value.len() as u16).to_be_bytes());
                out.extend_from_slice(value);
            }
        }
        out
    }

    pub fn add(&mut self, code: u16, value: Vec<u8>) {
        self.0.entry(code).or_default().push(value);
    }

    pub fn first(&self, code: u16) -> Option<&[u8]> {
        self.0.get(&code)?.first().map(|v| v.as_slice())
    }

    pub fn has(&self, code: u16) -> bool {
        self.0.contains_key(&code)
    }

    pub fn client_id(&self) -> Option<&[u8]> {
        self.first(OPT_CLIENT_ID)
    }

    pub fn server_id(&self) -> Option<&[u8]> {
        self.first(OPT_SERVER_ID)
    }

    /// The IAID of every IA_NA option, in packet order: one per
    /// interface the client wants an address for.
    pub fn ia_na_ids(&self) -> Vec<Vec<u8>> {
        match self.0.get(&OPT_IA_NA) {
            Some(values) => values
                .iter()
                .filter(|v| v.len() >= 4)
                .map(|v| v[0..4].to_vec())
                .collect(),
            None => Vec::new(),
        }
    }

    /// Option 61; zero when absent, which no real architecture uses.
    pub fn client_arch_type(&self) -> u16 {
        match self.first(OPT_CLIENT_ARCH_TYPE) {
            Some(v) if v.len() >= 2 => u16::from_be_bytes([v[0], v[1]]),
            _ => 0,
        }
    }

    /// Did the client's option-request option ask for a bootfile URL?
    pub fn requested_bootfile_url(&self) -> bool {
        let Some(oro) = self.first(OPT_ORO) else {
            return false;
        };
        oro.chunks_exact(2)
            .any(|c| u16::from_be_bytes([c[0], c[1]]) == OPT_BOOTFILE_URL)
    }

    pub fn has_rapid_commit(&self) -> bool {
        self.has(OPT_RAPID_COMMIT)
    }
}

/// IA_NA: IAID, T1, T2, then one embedded option (an IA_ADDR or a
/// status code).
pub fn ia_na(iaid: &[u8], t1: u32, t2: u32, inner: (u16, Vec<u8>)) -> Vec<u8> {
    let (inner_code, inner_value) = inner;
    let mut v = Vec::with_capacity(12 + 4 + inner_value.len());
    v.extend_from_slice(&iaid[..4]);
    v.extend_from_slice(&t1.to_be_bytes());
    v.extend_from_slice(&t2.to_be_bytes());
    v.extend_from_slice(&inner_code.to_be_bytes());
    v.extend_from_slice(&(inner_value.len() as u16).to_be_bytes());
    v.extend_from_slice(&inner_value);
    v
}

/// IA_ADDR: address, preferred lifetime, valid lifetime.
pub fn ia_addr(addr: Ipv6Addr, preferred: u32, valid: u32) -> (u16, Vec<u8>) {
    let mut v = Vec::with_capacity(24);
    v.extend_from_slice(&addr.octets());
    v.extend_from_slice(&preferred.to_be_bytes());
    v.extend_from_slice(&valid.to_be_bytes());
    (OPT_IA_ADDR, v)
}

/// Status code option payload.
pub fn status_code(code: u16, message: &str) -> (u16, Vec<u8>) {
    let mut v = Vec::with_capacity(2 + message.len());
    v.extend_from_slice(&code.to_be_bytes());
    v.extend_from_slice(message.as_bytes());
    (OPT_STATUS_CODE, v)
}

/// Vendor-class payload announcing an HTTP boot client, used when
/// answering UEFI HTTP-boot firmware (arch 0x10).
pub fn http_client_vendor_class() -> Vec<u8> {
    let mut v = Vec::with_capacity(16);
    v.extend_from_slice(&0u32.to_be_bytes()); // enterprise number
    v.extend_from_slice(&(b"HTTPClient".len() as u16).to_be_bytes());
    v.extend_from_slice(b"HTTPClient");
    v
}

/// DNS recursive-resolver option payload.
pub fn dns_servers(addrs: &[Ipv6Addr]) -> Vec<u8> {
    let mut v = Vec::with_capacity(16 * addrs.len());
    for addr in addrs {
        v.extend_from_slice(&addr.octets());
    }
    v
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_with_duplicates() {
        let mut opts = Options::new();
        opts.add(OPT_CLIENT_ID, vec![0, 1, 2]);
        opts.add(OPT_IA_NA, vec![1, 1, 1, 1, 0, 0, 0, 0, 0, 0, 0, 0]);
        opts.add(OPT_IA_NA, vec![2, 2, 2, 2, 0, 0, 0, 0, 0, 0, 0, 0]);

        let bs = opts.marshal();
        let parsed = Options::unmarshal(&bs).unwrap();
        assert_eq!(parsed, opts);
        assert_eq!(parsed.ia_na_ids(), vec![vec![1, 1, 1, 1], vec![2, 2, 2, 2]]);
    }

    #[test]
    fn truncated_option_rejected() {
        let bs = [0, 1, 0, 10, 0xab];
        assert!(matches!(
            Options::unmarshal(&bs),
            Err(Packet6Error::TruncatedOption { option: 1, .. })
        ));
    }

    #[test]
    fn odd_oro_rejected() {
        let bs = [0, 6, 0, 3, 0, 59, 0];
        assert!(matches!(Options::unmarshal(&bs), Err(Packet6Error::OddOro(3))));
    }

    #[test]
    fn requested_bootfile_url() {
        let mut opts = Options::new();
        opts.add(OPT_ORO, vec![0, 23, 0, 59]);
        assert!(opts.requested_bootfile_url());

        let mut opts = Options::new();
        opts.add(OPT_ORO, vec![0, 23]);
        assert!(!opts.requested_bootfile_url());

        assert!(!Options::new().requested_bootfile_url());
    }

    #[test]
    fn client_arch_type_parsing() {
        let mut opts = Options::new();
        opts.add(OPT_CLIENT_ARCH_TYPE, vec![0x00, 0x10]);
        assert_eq!(opts.client_arch_type(), 0x10);
        assert_eq!(Options::new().client_arch_type(), 0);
    }

    #[test]
    fn ia_na_layout() {
        let inner = ia_addr("2001:db8::5".parse().unwrap(), 300, 600);
        let v = ia_na(&[9, 9, 9, 9], 150, 240, inner);

        assert_eq!(&v[0..4], &[9, 9, 9, 9]);
        assert_eq!(u32::from_be_bytes([v[4], v[5], v[6], v[7]]), 150);
        assert_eq!(u32::from_be_bytes([v[8], v[9], v[10], v[11]]), 240);
        // Embedded IA_ADDR header.
        assert_eq!(u16::from_be_bytes([v[12], v[13]]), OPT_IA_ADDR);
        assert_eq!(u16::from_be_bytes([v[14], v[15]]), 24);
        // Lifetimes at the tail of the embedded option.
        assert_eq!(u32::from_be_bytes([v[32], v[33], v[34], v[35]]), 300);
        assert_eq!(u32::from_be_bytes([v[36], v[37], v[38], v[39]]), 600);
    }

    #[test]
    fn status_code_layout() {
        let (code, v) = status_code(STATUS_NO_ADDRS_AVAIL, "no more addresses");
        assert_eq!(code, OPT_STATUS_CODE);
        assert_eq!(u16::from_be_bytes([v[0], v[1]]), 2);
        assert_eq!(&v[2..], b"no more addresses");
    }

    #[test]
    fn http_client_vendor_class_layout() {
        let v = http_client_vendor_class();
        assert_eq!(
            v,
            vec![0, 0, 0, 0, 0, 10, 72, 84, 84, 80, 67, 108, 105, 101, 110, 116]
        );
    }
}
