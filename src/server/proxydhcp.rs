//! ProxyDHCP listener.
//!
//! Watches for PXE DISCOVERs on the DHCP port and answers with an
//! OFFER that points the client at this server, leaving address
//! assignment to the site's real DHCP server.

use std::fs::File;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::anyhow;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::dhcp4::conn::is_timeout;
use crate::dhcp4::options::OPT_CLIENT_ARCH;
use crate::dhcp4::{Conn, MessageType, Packet};
use crate::domain::{mac_string, Firmware, MachineState};
use crate::pcap;

use super::{classify, interface_ip, offer_dhcp, ServerState};

pub(crate) fn run(
    state: Arc<ServerState>,
    mut conn: Conn,
    running: Arc<AtomicBool>,
    errs: mpsc::Sender<anyhow::Error>,
) {
    let mut trace = open_trace(&state);
    let mut buf = [0u8; 1500];

    while running.load(Ordering::SeqCst) {
        let info = match conn.recv(&mut buf) {
            Ok(info) => info,
            Err(e) if is_timeout(&e) => continue,
            Err(e) => {
                let _ = errs.blocking_send(anyhow!(e).context("receiving DHCP packet"));
                return;
            }
        };

        if let Some(w) = trace.as_mut() {
            let _ = w.put(&pcap::CapturedPacket {
                timestamp: SystemTime::now(),
                length: info.len,
                bytes: buf[..info.len].to_vec(),
            });
        }

        let pkt = match Packet::unmarshal(&buf[..info.len]) {
            Ok(pkt) => pkt,
            Err(e) => {
                debug!("ignoring packet from {}: {}", info.src, e);
                continue;
            }
        };
        let mac = mac_string(&pkt.hardware_addr);

        if let Err(reason) = check_boot_request(&pkt) {
            debug!("ignoring packet from {}: {}", mac, reason);
            continue;
        }

        let (mach, fwtype) = match classify(&pkt) {
            Ok(classified) => classified,
            Err(e) => {
                info!("unusable packet from {}: {}", mac, e);
                continue;
            }
        };

        debug!(
            "got valid request to boot {} (guid {:?}, arch {}, firmware {})",
            mac, mach.guid, mach.arch, fwtype
        );

        match state.booter.boot_spec(&mach) {
            Ok(Some(_)) => {}
            Ok(None) => {
                debug!("no boot spec for {}, ignoring boot request", mac);
                state
                    .events
                    .record(&mach.mac, MachineState::Ignored, "Machine should not netboot");
                continue;
            }
            Err(e) => {
                info!("couldn't get a bootspec for {}: {}", mac, e);
                continue;
            }
        }

        info!("offering to boot {}", mac);
        if fwtype == Firmware::ChainIpxe {
            state
                .events
                .record(&mach.mac, MachineState::ProxyDhcpIpxe, "Offering to boot iPXE");
        } else {
            state
                .events
                .record(&mach.mac, MachineState::ProxyDhcp, "Offering to boot");
        }

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

        let resp = match offer_dhcp(&pkt, &mach, server_ip, fwtype, state.http_port) {
            Ok(resp) => resp,
            Err(e) => {
                info!("failed to construct ProxyDHCP offer for {}: {}", mac, e);
                continue;
            }
        };
        let bs = match resp.marshal() {
            Ok(bs) => bs,
            Err(e) => {
                info!("failed to marshal ProxyDHCP offer for {}: {}", mac, e);
                continue;
            }
        };
        if let Err(e) = conn.send(&resp, &bs, info.ifindex) {
            error!("failed to send ProxyDHCP offer to {}: {}", mac, e);
        }
    }
}

/// Only DISCOVERs carrying the PXE architecture option start a boot
/// conversation; everything else on the port belongs to the real
/// DHCP server.
fn check_boot_request(pkt: &Packet) -> Result<(), String> {
    if pkt.r#type != MessageType::Discover {
        return Err(format!("packet is {}, not DISCOVER", pkt.r#type));
    }
    if !pkt.options.contains(OPT_CLIENT_ARCH) {
        return Err("not a PXE boot request (missing option 93)".to_string());
    }
    Ok(())
}

fn open_trace(state: &ServerState) -> Option<pcap::Writer<File>> {
    let path = state.pcap_trace.as_ref()?;
    match File::create(path) {
        Ok(f) => Some(pcap::Writer::new(f, pcap::LinkType::Raw)),
        Err(e) => {
            warn!("can't open pcap trace {}: {}", path.display(), e);
            None
        }
    }
}
