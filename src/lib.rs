//! chainboot - network boot orchestration.
//!
//! A ProxyDHCP server that coexists with the site's DHCP server:
//! it classifies PXE boot requests, chainloads clients into iPXE
//! over TFTP, then serves boot scripts and kernel/initrd artifacts
//! over HTTP. What (if anything) a machine boots is decided by a
//! pluggable [`booter::Booter`]. A separate DHCPv6 path
//! ([`serverv6::ServerV6`]) covers IPv6 netboot with its own address
//! pool.

pub mod booter;
pub mod dhcp4;
pub mod dhcp6;
pub mod domain;
pub mod error;
pub mod ipxe;
pub mod pcap;
pub mod server;
pub mod serverv6;
pub mod urlsign;

pub use booter::{ApiBooter, Booter, GrpcBooter, PolicyConfig, StaticBooter};
pub use domain::{Architecture, Firmware, Machine, Spec};
pub use server::Server;
pub use serverv6::ServerV6;
