//! PXE/BINL listener on port 4011.
//!
//! Second-stage responder for EFI firmwares: they complete a normal
//! DHCP exchange with the primary server, and because our OFFER
//! carried no option 43 they fall back to asking the boot server
//! directly on this port. The reply is an ACK carrying the same TFTP
//! boot filename the BIOS path gets.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::dhcp4::conn::{is_timeout, PortableConn};
use crate::dhcp4::options::{
    OPT_CLIENT_ARCH, OPT_CLIENT_GUID, OPT_SERVER_IDENTIFIER, OPT_VENDOR_IDENTIFIER,
};
use crate::dhcp4::{MessageType, Packet};
use crate::domain::{mac_string, Firmware, MachineState};

use super::{interface_ip, ServerState};

pub(crate) fn run(
    state: Arc<ServerState>,
    conn: PortableConn,
    running: Arc<AtomicBool>,
    errs: mpsc::Sender<anyhow::Error>,
) {
    let mut buf = [0u8; 1024];

    while running.load(Ordering::SeqCst) {
        let info = match conn.recv(&mut buf) {
            Ok(info) => info,
            Err(e) if is_timeout(&e) => continue,
            Err(e) => {
                let _ = errs.blocking_send(anyhow!(e).context("receiving BINL packet"));
                return;
            }
        };

        let pkt = match Packet::unmarshal(&buf[..info.len]) {
            Ok(pkt) => pkt,
            Err(e) => {
                debug!("packet from {} is not DHCP: {}", info.src, e);
                continue;
            }
        };
        let mac = mac_string(&pkt.hardware_addr);

        let fwtype = match validate(&state, &pkt) {
            Ok(fwtype) => fwtype,
            Err(e) => {
                info!("unusable packet from {}: {}", mac, e);
                continue;
            }
        };

        let server_ip = match interface_ip(info.ifindex) {
            Ok(ip) => ip,
            Err(e) => {
                info!(
                    "want to boot {} but couldn't get a source address on interface {}: {}",
                    mac, info.ifindex, e
                );
                continue;
            }
        };

        state
            .events
            .record(&pkt.hardware_addr, MachineState::Pxe, "Sent PXE configuration");

        let resp = offer_binl(&pkt, server_ip, fwtype);
        let bs = match resp.marshal() {
            Ok(bs) => bs,
            Err(e) => {
                info!("failed to marshal PXE response for {}: {}", mac, e);
                continue;
            }
        };
        if let Err(e) = conn.send_to(&bs, info.src) {
            error!("failed to send PXE response to {} ({}): {}", mac, info.src, e);
        }
    }
}

/// Like the ProxyDHCP classification, except a BIOS arch code here
/// means a native iPXE client: BIOS firmware proper never talks to
/// port 4011.
fn validate(state: &ServerState, pkt: &Packet) -> Result<Firmware> {
    let fwt = pkt
        .options
        .u16(OPT_CLIENT_ARCH)
        .context("malformed DHCP option 93 (required for PXE)")?;

    let fwtype = match fwt {
        0 => Firmware::X86Ipxe,
        6 => Firmware::Efi32,
        7 | 16 => Firmware::Efi64,
        9 => Firmware::EfiBc,
        other => bail!("unsupported client firmware type {other}"),
    };
    if !state.ipxe.contains_key(&fwtype) {
        bail!("no iPXE binary loaded for firmware {fwtype}");
    }

    pkt.options
        .guid()
        .context("malformed client GUID (option 97)")?;

    Ok(fwtype)
}

fn offer_binl(pkt: &Packet, server_ip: std::net::Ipv4Addr, fwtype: Firmware) -> Packet {
    let mut resp = Packet::new(MessageType::Ack, pkt.transaction_id, pkt.hardware_addr);
    resp.client_addr = pkt.client_addr;
    resp.relay_addr = pkt.relay_addr;
    resp.server_addr = server_ip;
    resp.boot_server_name = server_ip.to_string();
    resp.boot_filename = format!("{}/{}", mac_string(&pkt.hardware_addr), fwtype.fwtype());
    resp.options
        .insert(OPT_SERVER_IDENTIFIER, server_ip.octets().to_vec());
    resp.options
        .insert(OPT_VENDOR_IDENTIFIER, b"PXEClient".to_vec());
    if let Some(guid) = pkt.options.get(OPT_CLIENT_GUID) {
        resp.options.insert(OPT_CLIENT_GUID, guid.to_vec());
    }
    resp
}
