//! DHCPv6 boot server: a self-contained IPv6 boot path with its own
//! address pool.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use macaddr::MacAddr6;
use tracing::{debug, info};

use crate::dhcp6::conn::{Conn6, SERVER_PORT};
use crate::dhcp6::{BootConfiguration, Packet, PacketBuilder, RandomAddressPool};
use crate::error::Packet6Error;

/// Serves Solicit/Request/Information-Request/Release on UDP/547,
/// joined to `ff02::1:2` on one interface.
pub struct ServerV6 {
    interface: String,
    port: u16,
    preferred_lifetime: u32,
    boot_config: Arc<dyn BootConfiguration>,
    pool: Arc<RandomAddressPool>,
}

impl ServerV6 {
    pub fn new(
        interface: impl Into<String>,
        boot_config: Arc<dyn BootConfiguration>,
        pool: Arc<RandomAddressPool>,
        preferred_lifetime: u32,
    ) -> Self {
        Self {
            interface: interface.into(),
            port: SERVER_PORT,
            preferred_lifetime,
            boot_config,
            pool,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Listen and respond until the socket errors or `running`
    /// clears. Also drives the pool's expiration sweeper.
    pub fn serve(&self, running: Arc<AtomicBool>) -> Result<()> {
        let conn = Conn6::open(&self.interface, self.port)
            .with_context(|| format!("opening DHCPv6 socket on {}", self.interface))?;

        let duid = duid_llt(&conn.hardware_addr());
        info!(
            "DHCPv6 listening on {} port {}, duid {:02x?}",
            self.interface, self.port, duid
        );

        let builder = PacketBuilder::new(
            duid.clone(),
            self.preferred_lifetime,
            self.pool.valid_lifetime(),
            self.boot_config.clone(),
            self.pool.clone(),
        );
        self.pool.start_sweeper(running.clone());

        let mut buf = [0u8; 1500];
        while running.load(Ordering::SeqCst) {
            let info = match conn.recv(&mut buf) {
                Ok(info) => info,
                Err(e) if crate::dhcp4::conn::is_timeout(&e) => continue,
                Err(e) => return Err(e).context("receiving DHCPv6 packet"),
            };

            let pkt = match Packet::unmarshal(&buf[..info.len]) {
                Ok(pkt) => pkt,
                Err(e) => {
                    debug!("malformed DHCPv6 packet from {}: {}", info.src, e);
                    continue;
                }
            };

            if let Err(e) = pkt.should_discard(&duid) {
                match e {
                    Packet6Error::Discard { kind, reason } => {
                        debug!("discarding {} packet from {}: {}", kind, info.src, reason)
                    }
                    other => debug!("discarding packet from {}: {}", info.src, other),
                }
                continue;
            }

            let resp = match builder.build_response(&pkt) {
                Ok(Some(resp)) => resp,
                Ok(None) => {
                    info!(
                        "don't know how to respond to packet type {:?} from {}",
                        pkt.r#type, info.src
                    );
                    continue;
                }
                Err(e) => {
                    info!(
                        "error creating response for transaction {:02x?}: {}",
                        pkt.transaction_id, e
                    );
                    continue;
                }
            };

            if let Err(e) = conn.send(&resp.marshal(), &info.src) {
                info!("error sending reply to {}: {}", info.src, e);
                continue;
            }
            debug!(
                "sent {:?} for transaction {:02x?} to {}",
                resp.r#type, resp.transaction_id, info.src
            );
        }

        Ok(())
    }
}

/// DUID-LLT (RFC 8415 §11.2): fixed type 1, hardware type 1
/// (ethernet), seconds since 2000-01-01 UTC, then the MAC. Computed
/// once per run, so it is stable for the process lifetime.
pub fn duid_llt(addr: &MacAddr6) -> Vec<u8> {
    let epoch_2000 = Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap();
    let elapsed = (Utc::now() - epoch_2000).num_seconds() as u32;

    let mut duid = Vec::with_capacity(14);
    duid.extend_from_slice(&[0, 1]); // DUID-LLT
    duid.extend_from_slice(&[0, 1]); // ethernet
    duid.extend_from_slice(&elapsed.to_be_bytes());
    duid.extend_from_slice(addr.as_bytes());
    duid
}
