//! Boot URL selection for DHCPv6 clients.
//!
//! UEFI HTTP-boot firmware (client-arch 0x10) is handed an EFI
//! bootloader URL; everything else gets an iPXE script URL. Either a
//! static pair from the command line, or an HTTP API lookup.

use std::net::Ipv6Addr;
use std::time::Duration;

use crate::booter::make_url_absolute;
use crate::error::BooterError;

/// Client architecture code for UEFI HTTP boot.
pub const ARCH_HTTP_BOOT: u16 = 0x10;

/// Picks the boot file URL for a client.
pub trait BootConfiguration: Send + Sync {
    /// `id` is the client's link-layer address or DUID identifier,
    /// `arch` its client-arch-type option.
    fn boot_url(&self, id: &[u8], arch: u16) -> Result<Vec<u8>, BooterError>;

    /// Server preference option payload, when configured.
    fn preference(&self) -> Option<Vec<u8>> {
        None
    }

    /// Recursive DNS servers to advertise, when configured.
    fn dns_servers(&self) -> &[Ipv6Addr] {
        &[]
    }
}

pub struct StaticBootConfiguration {
    http_boot_url: Vec<u8>,
    ipxe_boot_url: Vec<u8>,
    preference: Option<Vec<u8>>,
    dns_servers: Vec<Ipv6Addr>,
}

impl StaticBootConfiguration {
    pub fn new(
        http_boot_url: &str,
        ipxe_boot_url: &str,
        preference: Option<u8>,
        dns_servers: Vec<Ipv6Addr>,
    ) -> Self {
        Self {
            http_boot_url: http_boot_url.as_bytes().to_vec(),
            ipxe_boot_url: ipxe_boot_url.as_bytes().to_vec(),
            preference: preference.map(|p| vec![p]),
            dns_servers,
        }
    }
}

impl BootConfiguration for StaticBootConfiguration {
    fn boot_url(&self, _id: &[u8], arch: u16) -> Result<Vec<u8>, BooterError> {
        if arch == ARCH_HTTP_BOOT {
            Ok(self.http_boot_url.clone())
        } else {
            Ok(self.ipxe_boot_url.clone())
        }
    }

    fn preference(&self) -> Option<Vec<u8>> {
        self.preference.clone()
    }

    fn dns_servers(&self) -> &[Ipv6Addr] {
        &self.dns_servers
    }
}

/// Asks `GET <prefix>/v1/boot/<hex-id>/<arch>`; the response body is
/// the boot URL, resolved against the prefix when relative.
pub struct ApiBootConfiguration {
    client: reqwest::blocking::Client,
    url_prefix: String,
    preference: Option<Vec<u8>>,
    dns_servers: Vec<Ipv6Addr>,
}

impl ApiBootConfiguration {
    pub fn new(
        url: &str,
        timeout: Duration,
        preference: Option<u8>,
        dns_servers: Vec<Ipv6Addr>,
    ) -> Result<Self, BooterError> {
        let mut prefix = url.to_string();
        if !prefix.ends_with('/') {
            prefix.push('/');
        }
        prefix.push_str("v1");

        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BooterError::Backend(e.to_string()))?;
        Ok(Self {
            client,
            url_prefix: prefix,
            preference: preference.map(|p| vec![p]),
            dns_servers,
        })
    }
}

impl BootConfiguration for ApiBootConfiguration {
    fn boot_url(&self, id: &[u8], arch: u16) -> Result<Vec<u8>, BooterError> {
        let hex_id: String = id.iter().map(|b| format!("{b:02x}")).collect();
        let url = format!("{}/boot/{}/{}", self.url_prefix, hex_id, arch);

        let resp = self
            .client
            .get(&url)
            .send()
            .map_err(|e| BooterError::Backend(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(BooterError::Backend(format!("{url}: {}", resp.status())));
        }
        let body = resp
            .text()
            .map_err(|e| BooterError::Backend(e.to_string()))?;

        let absolute = make_url_absolute(&self.url_prefix, body.trim())?;
        Ok(absolute.into_bytes())
    }

    fn preference(&self) -> Option<Vec<u8>> {
        self.preference.clone()
    }

    fn dns_servers(&self) -> &[Ipv6Addr] {
        &self.dns_servers
    }
}
