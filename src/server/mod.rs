//! The boot server: four cooperating listeners walking PXE clients
//! from DISCOVER to OS hand-off.

pub mod binl;
pub mod http;
pub mod proxydhcp;
pub mod tftp;

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use pnet::datalink;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, Notify};
use tracing::info;

use crate::booter::{Booter, PolicyConfig};
use crate::dhcp4::conn::{Conn, PortableConn};
use crate::dhcp4::options::{
    OPT_AGENT_INFORMATION, OPT_CLIENT_ARCH, OPT_CLIENT_GUID, OPT_SERVER_IDENTIFIER,
    OPT_USER_CLASS, OPT_VENDOR_IDENTIFIER, OPT_VENDOR_SPECIFIC,
};
use crate::dhcp4::{MessageType, Options, Packet};
use crate::domain::machine::format_guid;
use crate::domain::{mac_string, Architecture, EventLog, Firmware, Machine};

const DEFAULT_DHCP_PORT: u16 = 67;
const DEFAULT_TFTP_PORT: u16 = 69;
const DEFAULT_PXE_PORT: u16 = 4011;
const DEFAULT_HTTP_PORT: u16 = 80;

/// Shared context handed to every listener.
pub(crate) struct ServerState {
    pub booter: Arc<dyn Booter>,
    pub ipxe: Arc<HashMap<Firmware, Vec<u8>>>,
    pub events: Arc<EventLog>,
    pub http_port: u16,
    pub pcap_trace: Option<PathBuf>,
}

/// Boots machines using a Booter.
///
/// Construct with [`Server::new`], adjust with the `with_*` builders,
/// then [`Server::serve`]. The client-side protocols hardcode the
/// DHCP/TFTP/PXE port numbers in firmware; overriding them only makes
/// sense in tests.
pub struct Server {
    booter: Arc<dyn Booter>,
    ipxe: Arc<HashMap<Firmware, Vec<u8>>>,
    address: Ipv4Addr,
    interface: Option<String>,
    dhcp_no_bind: bool,
    http_port: u16,
    dhcp_port: u16,
    tftp_port: u16,
    pxe_port: u16,
    policy_config: Option<PolicyConfig>,
    pcap_trace: Option<PathBuf>,
    events: Arc<EventLog>,
}

impl Server {
    pub fn new(booter: Arc<dyn Booter>, ipxe: HashMap<Firmware, Vec<u8>>) -> Self {
        Self {
            booter,
            ipxe: Arc::new(ipxe),
            address: Ipv4Addr::UNSPECIFIED,
            interface: None,
            dhcp_no_bind: false,
            http_port: DEFAULT_HTTP_PORT,
            dhcp_port: DEFAULT_DHCP_PORT,
            tftp_port: DEFAULT_TFTP_PORT,
            pxe_port: DEFAULT_PXE_PORT,
            policy_config: None,
            pcap_trace: None,
            events: Arc::new(EventLog::new()),
        }
    }

    pub fn with_address(mut self, address: Ipv4Addr) -> Self {
        self.address = address;
        self
    }

    /// Restrict listeners to one interface; required for raw mode.
    pub fn with_interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = Some(interface.into());
        self
    }

    /// Use the link-layer receive path instead of binding the DHCP
    /// port, so a regular DHCP daemon can keep running next to us.
    pub fn with_dhcp_no_bind(mut self, no_bind: bool) -> Self {
        self.dhcp_no_bind = no_bind;
        self
    }

    pub fn with_http_port(mut self, port: u16) -> Self {
        self.http_port = port;
        self
    }

    pub fn with_dhcp_port(mut self, port: u16) -> Self {
        self.dhcp_port = port;
        self
    }

    pub fn with_tftp_port(mut self, port: u16) -> Self {
        self.tftp_port = port;
        self
    }

    pub fn with_pxe_port(mut self, port: u16) -> Self {
        self.pxe_port = port;
        self
    }

    /// Policy-backend settings to expose on `/certs`.
    pub fn with_policy_config(mut self, config: PolicyConfig) -> Self {
        self.policy_config = Some(config);
        self
    }

    /// Dump every received DHCPv4 payload to a pcap file.
    pub fn with_pcap_trace(mut self, path: PathBuf) -> Self {
        self.pcap_trace = Some(path);
        self
    }

    /// Run all listeners until a fatal error or a termination signal.
    /// The first fatal error from any listener tears the rest down.
    pub async fn serve(&self) -> Result<()> {
        let state = Arc::new(ServerState {
            booter: self.booter.clone(),
            ipxe: self.ipxe.clone(),
            events: self.events.clone(),
            http_port: self.http_port,
            pcap_trace: self.pcap_trace.clone(),
        });

        let running = Arc::new(AtomicBool::new(true));
        let (errs_tx, mut errs_rx) = mpsc::channel::<anyhow::Error>(8);

        // Open every socket before spawning anything, so a bad
        // configuration fails fast instead of half-starting.
        let dhcp_conn = Conn::open(
            self.address,
            self.dhcp_port,
            self.interface.as_deref(),
            self.dhcp_no_bind,
        )?;
        let binl_conn = PortableConn::open(self.address, self.pxe_port, self.interface.as_deref())
            .context("binding PXE/BINL socket")?;
        let tftp_socket = tftp::bind(self.address, self.tftp_port)?;
        let http_listener = TcpListener::bind((self.address, self.http_port))
            .await
            .with_context(|| format!("binding HTTP on {}:{}", self.address, self.http_port))?;

        info!(
            "listening: proxyDHCP :{}{}, PXE/BINL :{}, TFTP :{}, HTTP :{}",
            self.dhcp_port,
            if self.dhcp_no_bind { " (raw)" } else { "" },
            self.pxe_port,
            self.tftp_port,
            self.http_port,
        );

        let _ = spawn_listener("proxydhcp", {
            let (state, running, errs) = (state.clone(), running.clone(), errs_tx.clone());
            move || proxydhcp::run(state, dhcp_conn, running, errs)
        })?;
        let _ = spawn_listener("binl", {
            let (state, running, errs) = (state.clone(), running.clone(), errs_tx.clone());
            move || binl::run(state, binl_conn, running, errs)
        })?;
        let _ = spawn_listener("tftp", {
            let (state, running, errs) = (state.clone(), running.clone(), errs_tx.clone());
            move || tftp::run(state, tftp_socket, running, errs)
        })?;

        let shutdown = Arc::new(Notify::new());
        let router = http::create_router(Arc::new(http::HttpState {
            booter: self.booter.clone(),
            events: self.events.clone(),
            policy_config: self.policy_config.clone(),
        }));
        let http_shutdown = shutdown.clone();
        let mut http_task = tokio::spawn(async move {
            axum::serve(
                http_listener,
                router.into_make_service_with_connect_info::<std::net::SocketAddr>(),
            )
            .with_graceful_shutdown(async move { http_shutdown.notified().await })
            .await
        });

        let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;

        let result = tokio::select! {
            maybe_err = errs_rx.recv() => match maybe_err {
                Some(e) => Err(e),
                None => Ok(()),
            },
            res = &mut http_task => match res {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(anyhow::Error::from(e).context("HTTP server shut down")),
                Err(e) => Err(anyhow::Error::from(e).context("HTTP server panicked")),
            },
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down");
                Ok(())
            }
            _ = sigint.recv() => {
                info!("received SIGINT, shutting down");
                Ok(())
            }
        };

        running.store(false, Ordering::SeqCst);
        shutdown.notify_waiters();
        result
    }
}

fn spawn_listener(
    name: &str,
    f: impl FnOnce() + Send + 'static,
) -> Result<std::thread::JoinHandle<()>> {
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .with_context(|| format!("spawning {name} listener"))
}

/// Classify an inbound boot request into the machine identity and
/// the firmware class that picks its bootloader.
pub(crate) fn classify(pkt: &Packet) -> Result<(Machine, Firmware)> {
    let fwt = pkt
        .options
        .u16(OPT_CLIENT_ARCH)
        .context("malformed DHCP option 93 (required for PXE)")?;

    // Coarse identification from the PXE architecture option alone.
    let (arch, mut fwtype) = match fwt {
        0 => (Architecture::Ia32, Firmware::X86Pc),
        6 => (Architecture::Ia32, Firmware::Efi32),
        7 | 16 => (Architecture::X64, Firmware::Efi64),
        9 => (Architecture::X64, Firmware::EfiBc),
        other => bail!("unsupported client firmware type {other}"),
    };

    // The user-class option distinguishes iPXE sub-breeds. These only
    // refine the firmware type, never the architecture reported to
    // Booters; the chainloading logic needs them to avoid loops.
    if let Ok(user_class) = pkt.options.string(OPT_USER_CLASS) {
        if user_class == "iPXE" && fwtype == Firmware::X86Pc {
            fwtype = Firmware::X86Ipxe;
        }
        if user_class == "pixiecore" {
            fwtype = Firmware::ChainIpxe;
        }
    }

    let guid = pkt
        .options
        .guid()
        .context("malformed client GUID (option 97)")?
        .map(format_guid);

    Ok((
        Machine {
            mac: pkt.hardware_addr,
            guid,
            arch,
        },
        fwtype,
    ))
}

/// Build the ProxyDHCP OFFER for a classified machine.
///
/// Boot filename, server name, and option 43 differ per firmware:
/// BIOS gets a plain TFTP filename with discovery bypassed; EFI
/// firmwares get no option 43 at all, because many of them drop
/// OFFERs that carry it, and instead fall back to BINL on port 4011;
/// iPXE clients get URL filenames directly.
pub(crate) fn offer_dhcp(
    pkt: &Packet,
    mach: &Machine,
    server_ip: Ipv4Addr,
    fwtype: Firmware,
    http_port: u16,
) -> Result<Packet> {
    let mut resp = Packet::new(MessageType::Offer, pkt.transaction_id, mach.mac);
    resp.broadcast = true;
    resp.server_addr = server_ip;
    resp.relay_addr = pkt.relay_addr;
    resp.options
        .insert(OPT_SERVER_IDENTIFIER, server_ip.octets().to_vec());
    // PXE wants the server to identify itself with the client's
    // vendor string. Strange, but required.
    resp.options
        .insert(OPT_VENDOR_IDENTIFIER, b"PXEClient".to_vec());
    if let Some(guid) = pkt.options.get(OPT_CLIENT_GUID) {
        resp.options.insert(OPT_CLIENT_GUID, guid.to_vec());
    }
    if let Some(relay) = pkt.options.get(OPT_AGENT_INFORMATION) {
        resp.options.insert(OPT_AGENT_INFORMATION, relay.to_vec());
    }

    let mac = mac_string(&mach.mac);
    match fwtype {
        Firmware::X86Pc => {
            resp.options
                .insert(OPT_VENDOR_SPECIFIC, discovery_bypass()?);
            resp.boot_server_name = server_ip.to_string();
            resp.boot_filename = format!("{}/{}", mac, fwtype.fwtype());
        }
        Firmware::X86Ipxe => {
            // Native iPXE wants a URL filename rather than a
            // server/filename pair.
            resp.options
                .insert(OPT_VENDOR_SPECIFIC, discovery_bypass()?);
            resp.boot_filename = format!("tftp://{}/{}/{}", server_ip, mac, fwtype.fwtype());
        }
        Firmware::Efi32 | Firmware::Efi64 | Firmware::EfiBc => {
            resp.boot_server_name = server_ip.to_string();
            resp.boot_filename = format!("{}/{}", mac, fwtype.fwtype());
        }
        Firmware::ChainIpxe => {
            resp.boot_filename = format!(
                "http://{}:{}/_/ipxe?arch={}&mac={}",
                server_ip, http_port, mach.arch as u8, mac
            );
        }
    }

    Ok(resp)
}

/// PXE vendor options: boot server discovery control = bypass, just
/// boot from the filename.
fn discovery_bypass() -> Result<Vec<u8>> {
    let mut pxe = Options::new();
    pxe.insert(6, vec![8]);
    Ok(pxe.marshal()?)
}

/// The server's own IPv4 address on an interface, preferring global
/// unicast, then link-local, then loopback.
pub(crate) fn interface_ip(ifindex: u32) -> Result<Ipv4Addr> {
    let iface = datalink::interfaces()
        .into_iter()
        .find(|i| i.index == ifindex)
        .with_context(|| format!("no interface with index {ifindex}"))?;

    let addrs: Vec<Ipv4Addr> = iface
        .ips
        .iter()
        .filter_map(|net| match net.ip() {
            std::net::IpAddr::V4(ip) => Some(ip),
            std::net::IpAddr::V6(_) => None,
        })
        .collect();

    let classes: [&dyn Fn(&Ipv4Addr) -> bool; 3] = [
        &|ip| {
            !ip.is_unspecified()
                && !ip.is_loopback()
                && !ip.is_link_local()
                && !ip.is_broadcast()
                && !ip.is_multicast()
        },
        &|ip| ip.is_link_local(),
        &|ip| ip.is_loopback(),
    ];
    for class in classes {
        if let Some(ip) = addrs.iter().find(|ip| class(ip)) {
            return Ok(*ip);
        }
    }

    bail!("no usable unicast address configured on {}", iface.name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use macaddr::MacAddr6;

    fn discover(arch: u16) -> Packet {
        let mut p = Packet::new(
            MessageType::Discover,
            0xcafe,
            MacAddr6::new(0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff),
        );
        p.broadcast = true;
        p.options.insert(OPT_CLIENT_ARCH, arch.to_be_bytes().to_vec());
        p
    }

    fn server_ip() -> Ipv4Addr {
        Ipv4Addr::new(192, 168, 1, 5)
    }

    mod classification {
        use super::*;

        #[test]
        fn bios() {
            let (mach, fw) = classify(&discover(0)).unwrap();
            assert_eq!(fw, Firmware::X86Pc);
            assert_eq!(mach.arch, Architecture::Ia32);
            assert_eq!(mach.guid, None);
        }

        #[test]
        fn efi_variants() {
            assert_eq!(classify(&discover(6)).unwrap().1, Firmware::Efi32);
            assert_eq!(classify(&discover(7)).unwrap().1, Firmware::Efi64);
            assert_eq!(classify(&discover(9)).unwrap().1, Firmware::EfiBc);
            // Arch 16 is the EFI HTTP-boot code; same bootloader as EFI64.
            assert_eq!(classify(&discover(16)).unwrap().1, Firmware::Efi64);
        }

        #[test]
        fn unsupported_arch_rejected() {
            assert!(classify(&discover(3)).is_err());
        }

        #[test]
        fn missing_arch_rejected() {
            let mut p = discover(0);
            p.options.0.remove(&OPT_CLIENT_ARCH);
            assert!(classify(&p).is_err());
        }

        #[test]
        fn ipxe_user_class_on_bios() {
            let mut p = discover(0);
            p.options.insert(OPT_USER_CLASS, b"iPXE".to_vec());
            assert_eq!(classify(&p).unwrap().1, Firmware::X86Ipxe);
        }

        #[test]
        fn ipxe_user_class_on_efi_is_ignored() {
            let mut p = discover(7);
            p.options.insert(OPT_USER_CLASS, b"iPXE".to_vec());
            assert_eq!(classify(&p).unwrap().1, Firmware::Efi64);
        }

        #[test]
        fn our_own_ipxe_user_class() {
            let mut p = discover(0);
            p.options.insert(OPT_USER_CLASS, b"pixiecore".to_vec());
            assert_eq!(classify(&p).unwrap().1, Firmware::ChainIpxe);
        }

        #[test]
        fn guid_extracted() {
            let mut p = discover(0);
            let mut guid = vec![0u8];
            guid.extend_from_slice(&[0x11; 16]);
            p.options.insert(OPT_CLIENT_GUID, guid);
            let (mach, _) = classify(&p).unwrap();
            assert_eq!(
                mach.guid.as_deref(),
                Some("11111111-1111-1111-1111-111111111111")
            );
        }

        #[test]
        fn bad_guid_rejected() {
            let mut p = discover(0);
            p.options.insert(OPT_CLIENT_GUID, vec![1; 17]);
            assert!(classify(&p).is_err());
        }
    }

    mod offers {
        use super::*;

        fn offer_for(arch: u16, user_class: Option<&[u8]>) -> Packet {
            let mut p = discover(arch);
            if let Some(uc) = user_class {
                p.options.insert(OPT_USER_CLASS, uc.to_vec());
            }
            let (mach, fw) = classify(&p).unwrap();
            offer_dhcp(&p, &mach, server_ip(), fw, 8080).unwrap()
        }

        #[test]
        fn bios_pxe_boot() {
            let resp = offer_for(0, None);
            assert_eq!(resp.r#type, MessageType::Offer);
            assert!(resp.broadcast);
            assert_eq!(resp.transaction_id, 0xcafe);
            assert_eq!(
                resp.options.get(OPT_VENDOR_IDENTIFIER),
                Some(&b"PXEClient"[..])
            );
            assert_eq!(
                resp.options.get(OPT_VENDOR_SPECIFIC),
                Some(&[6u8, 1, 8, 255][..])
            );
            assert_eq!(resp.boot_server_name, "192.168.1.5");
            assert_eq!(resp.boot_filename, "aa:bb:cc:dd:ee:ff/0");
            assert_eq!(resp.options.ip4(OPT_SERVER_IDENTIFIER).unwrap(), server_ip());
        }

        #[test]
        fn efi64_gets_no_option_43() {
            let resp = offer_for(7, None);
            assert!(resp.options.get(OPT_VENDOR_SPECIFIC).is_none());
            assert_eq!(resp.boot_server_name, "192.168.1.5");
            assert_eq!(resp.boot_filename, "aa:bb:cc:dd:ee:ff/7");
        }

        #[test]
        fn native_ipxe_chainload() {
            let resp = offer_for(0, Some(b"iPXE"));
            assert_eq!(
                resp.boot_filename,
                "tftp://192.168.1.5/aa:bb:cc:dd:ee:ff/1"
            );
            assert!(resp.options.get(OPT_VENDOR_SPECIFIC).is_some());
            assert!(resp.boot_server_name.is_empty());
        }

        #[test]
        fn second_stage_points_at_http() {
            let resp = offer_for(0, Some(b"pixiecore"));
            assert_eq!(
                resp.boot_filename,
                "http://192.168.1.5:8080/_/ipxe?arch=0&mac=aa:bb:cc:dd:ee:ff"
            );
            assert!(resp.options.get(OPT_VENDOR_SPECIFIC).is_none());
        }

        #[test]
        fn option_43_iff_bios_or_native_ipxe() {
            for (arch, uc, expect) in [
                (0u16, None, true),
                (0, Some(&b"iPXE"[..]), true),
                (6, None, false),
                (7, None, false),
                (9, None, false),
                (0, Some(&b"pixiecore"[..]), false),
            ] {
                let resp = offer_for(arch, uc);
                assert_eq!(
                    resp.options.get(OPT_VENDOR_SPECIFIC).is_some(),
                    expect,
                    "arch {arch} user-class {uc:?}"
                );
            }
        }

        #[test]
        fn guid_and_relay_info_echoed() {
            let mut p = discover(0);
            let mut guid = vec![0u8];
            guid.extend_from_slice(&[0x22; 16]);
            p.options.insert(OPT_CLIENT_GUID, guid.clone());
            p.options.insert(OPT_AGENT_INFORMATION, vec![1, 2, 3]);
            p.relay_addr = Ipv4Addr::new(10, 1, 1, 1);

            let (mach, fw) = classify(&p).unwrap();
            let resp = offer_dhcp(&p, &mach, server_ip(), fw, 80).unwrap();

            assert_eq!(resp.options.get(OPT_CLIENT_GUID), Some(&guid[..]));
            assert_eq!(
                resp.options.get(OPT_AGENT_INFORMATION),
                Some(&[1u8, 2, 3][..])
            );
            assert_eq!(resp.relay_addr, Ipv4Addr::new(10, 1, 1, 1));
        }
    }
}
