//! TFTP listener (RFC 1350 + RFC 2347/2348 option negotiation).
//!
//! Serves exactly one logical resource: the iPXE binary matching the
//! requesting firmware. Paths look like `<mac>/<fwtype>`; anything
//! that doesn't decode to a loaded firmware class gets "file not
//! found". Read-only by construction.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use macaddr::MacAddr6;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::dhcp4::conn::is_timeout;
use crate::domain::{Firmware, MachineState};

use super::ServerState;

const OPCODE_RRQ: u16 = 1;
const OPCODE_WRQ: u16 = 2;
const OPCODE_DATA: u16 = 3;
const OPCODE_ACK: u16 = 4;
const OPCODE_ERROR: u16 = 5;
const OPCODE_OACK: u16 = 6;

const ERROR_FILE_NOT_FOUND: u16 = 1;
const ERROR_ACCESS_VIOLATION: u16 = 2;

const DEFAULT_BLOCK_SIZE: usize = 512;
/// RFC 2348 ceiling.
const MAX_BLOCK_SIZE: usize = 65464;

/// Bind the listener socket up front so configuration errors surface
/// before any thread is spawned.
pub(crate) fn bind(addr: Ipv4Addr, port: u16) -> Result<UdpSocket> {
    let socket = UdpSocket::bind(SocketAddrV4::new(addr, port))
        .with_context(|| format!("binding TFTP socket to {addr}:{port}"))?;
    socket
        .set_read_timeout(Some(Duration::from_secs(1)))
        .context("setting TFTP socket timeout")?;
    Ok(socket)
}

pub(crate) fn run(
    state: Arc<ServerState>,
    socket: UdpSocket,
    running: Arc<AtomicBool>,
    errs: mpsc::Sender<anyhow::Error>,
) {
    let mut buf = [0u8; 2048];

    while running.load(Ordering::SeqCst) {
        let (len, client_addr) = match socket.recv_from(&mut buf) {
            Ok(recv) => recv,
            Err(e) if is_timeout(&e) => continue,
            Err(e) => {
                let _ = errs.blocking_send(anyhow!(e).context("receiving TFTP packet"));
                return;
            }
        };
        if len < 4 {
            continue;
        }

        let opcode = u16::from_be_bytes([buf[0], buf[1]]);
        match opcode {
            OPCODE_RRQ => handle_read_request(&state, &buf[2..len], client_addr),
            OPCODE_WRQ => {
                warn!("write request from {} denied (read-only server)", client_addr);
                send_error(client_addr, ERROR_ACCESS_VIOLATION, "Write not supported");
            }
            _ => {
                debug!("unknown opcode {} from {}", opcode, client_addr);
            }
        }
    }
}

/// Parse the RRQ (filename, mode, option pairs) and hand the transfer
/// to its own thread with an ephemeral socket.
fn handle_read_request(state: &Arc<ServerState>, request: &[u8], client_addr: SocketAddr) {
    let parts: Vec<&[u8]> = request.split(|&b| b == 0).collect();
    if parts.is_empty() {
        return;
    }

    let filename = match std::str::from_utf8(parts[0]) {
        Ok(f) => f.to_string(),
        Err(_) => return,
    };

    let mut options: HashMap<String, String> = HashMap::new();
    let mut i = 2;
    while i + 1 < parts.len() {
        if let (Ok(name), Ok(value)) = (
            std::str::from_utf8(parts[i]),
            std::str::from_utf8(parts[i + 1]),
        ) {
            if !name.is_empty() && !value.is_empty() {
                options.insert(name.to_lowercase(), value.to_string());
            }
        }
        i += 2;
    }

    let state = state.clone();
    thread::spawn(move || {
        if let Err(e) = handle_transfer(&state, &filename, &options, client_addr) {
            error!("TFTP transfer to {} failed: {}", client_addr, e);
        }
    });
}

/// Decode `<mac>/<fwtype>` into the firmware whose iPXE binary to
/// serve.
fn resolve_path(path: &str) -> Option<(MacAddr6, Firmware)> {
    let (mac_part, fwtype_part) = path.trim_start_matches('/').split_once('/')?;
    let mac = MacAddr6::from_str(mac_part).ok()?;
    let fwtype = fwtype_part.parse::<u16>().ok()?;
    Some((mac, Firmware::from_fwtype(fwtype)?))
}

fn handle_transfer(
    state: &ServerState,
    filename: &str,
    options: &HashMap<String, String>,
    client_addr: SocketAddr,
) -> Result<()> {
    let Some((mac, fwtype)) = resolve_path(filename) else {
        warn!("TFTP: {} requested unknown path {:?}", client_addr, filename);
        send_error(client_addr, ERROR_FILE_NOT_FOUND, "File not found");
        return Ok(());
    };
    let Some(data) = state.ipxe.get(&fwtype) else {
        warn!(
            "TFTP: no iPXE binary for firmware {} (requested by {})",
            fwtype, client_addr
        );
        send_error(client_addr, ERROR_FILE_NOT_FOUND, "File not found");
        return Ok(());
    };

    info!("TFTP: {} requesting {:?}", client_addr, filename);

    let mut block_size = DEFAULT_BLOCK_SIZE;
    if let Some(blksize) = options.get("blksize") {
        if let Ok(requested) = blksize.parse::<usize>() {
            block_size = requested.clamp(8, MAX_BLOCK_SIZE);
        }
    }
    let tsize_requested = options.contains_key("tsize");

    let socket = UdpSocket::bind("0.0.0.0:0").context("binding transfer socket")?;
    socket.set_read_timeout(Some(Duration::from_secs(5)))?;
    socket.set_write_timeout(Some(Duration::from_secs(5)))?;

    // Acknowledge negotiated options before the first data block.
    if !options.is_empty() {
        let mut oack = OPCODE_OACK.to_be_bytes().to_vec();
        if block_size != DEFAULT_BLOCK_SIZE {
            oack.extend_from_slice(b"blksize\0");
            oack.extend_from_slice(block_size.to_string().as_bytes());
            oack.push(0);
        }
        if tsize_requested {
            oack.extend_from_slice(b"tsize\0");
            oack.extend_from_slice(data.len().to_string().as_bytes());
            oack.push(0);
        }
        socket.send_to(&oack, client_addr)?;
        match expect_ack(&socket, 0) {
            Ok(()) => {}
            Err(AckError::Io(e)) => return Err(e.into()),
            Err(_) => anyhow::bail!("no acknowledgment for OACK"),
        }
    }

    let mut block_num: u16 = 1;
    let mut offset = 0usize;
    loop {
        let end = (offset + block_size).min(data.len());
        let chunk = &data[offset..end];

        let mut packet = Vec::with_capacity(4 + chunk.len());
        packet.extend_from_slice(&OPCODE_DATA.to_be_bytes());
        packet.extend_from_slice(&block_num.to_be_bytes());
        packet.extend_from_slice(chunk);

        let mut retries = 0;
        loop {
            socket.send_to(&packet, client_addr)?;
            match expect_ack(&socket, block_num) {
                Ok(()) => break,
                Err(AckError::Retry) => {
                    retries += 1;
                    if retries > 5 {
                        anyhow::bail!("transfer timeout after 5 retries at block {block_num}");
                    }
                    debug!("TFTP: retry {} for block {}", retries, block_num);
                }
                Err(AckError::ClientError) => anyhow::bail!("client aborted transfer"),
                Err(AckError::Io(e)) => return Err(e.into()),
            }
        }

        offset = end;
        // A short block terminates the transfer; exact multiples end
        // with an empty block.
        if chunk.len() < block_size {
            break;
        }
        block_num = block_num.wrapping_add(1);
    }

    info!(
        "TFTP: sent {:?} to {} ({} bytes)",
        filename,
        client_addr,
        data.len()
    );
    state
        .events
        .record(&mac, MachineState::Tftp, format!("Sent iPXE binary {fwtype}"));
    Ok(())
}

enum AckError {
    /// Timeout or stray datagram; resend the block.
    Retry,
    ClientError,
    Io(std::io::Error),
}

fn expect_ack(socket: &UdpSocket, block: u16) -> std::result::Result<(), AckError> {
    let mut ack = [0u8; 4];
    match socket.recv_from(&mut ack) {
        Ok((len, _)) if len >= 4 => {
            let opcode = u16::from_be_bytes([ack[0], ack[1]]);
            let acked = u16::from_be_bytes([ack[2], ack[3]]);
            if opcode == OPCODE_ERROR {
                return Err(AckError::ClientError);
            }
            if opcode == OPCODE_ACK && acked == block {
                return Ok(());
            }
            Err(AckError::Retry)
        }
        Ok(_) => Err(AckError::Retry),
        Err(e) if is_timeout(&e) => Err(AckError::Retry),
        Err(e) => Err(AckError::Io(e)),
    }
}

/// Fire an error packet from a throwaway socket; failures here are
/// not worth surfacing.
fn send_error(addr: SocketAddr, code: u16, message: &str) {
    let Ok(socket) = UdpSocket::bind("0.0.0.0:0") else {
        return;
    };
    let mut packet = Vec::with_capacity(5 + message.len());
    packet.extend_from_slice(&OPCODE_ERROR.to_be_bytes());
    packet.extend_from_slice(&code.to_be_bytes());
    packet.extend_from_slice(message.as_bytes());
    packet.push(0);
    let _ = socket.send_to(&packet, addr);
}

#[cfg(test)]
mod tests {
    use super::*;

    mod paths {
        use super::*;

        #[test]
        fn valid_bios_path() {
            let (mac, fw) = resolve_path("aa:bb:cc:dd:ee:ff/0").unwrap();
            assert_eq!(mac, MacAddr6::new(0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff));
            assert_eq!(fw, Firmware::X86Pc);
        }

        #[test]
        fn leading_slash_tolerated() {
            assert!(resolve_path("/aa:bb:cc:dd:ee:ff/7").is_some());
        }

        #[test]
        fn unknown_fwtype_rejected() {
            assert!(resolve_path("aa:bb:cc:dd:ee:ff/3").is_none());
            assert!(resolve_path("aa:bb:cc:dd:ee:ff/99").is_none());
        }

        #[test]
        fn non_numeric_fwtype_rejected() {
            assert!(resolve_path("aa:bb:cc:dd:ee:ff/efi").is_none());
        }

        #[test]
        fn bad_mac_rejected() {
            assert!(resolve_path("nonsense/7").is_none());
            assert!(resolve_path("7").is_none());
        }
    }

    mod transfers {
        use super::*;
        use crate::booter::Booter;
        use crate::domain::{BootFile, EventLog, FileId, Machine, Spec};
        use crate::error::BooterError;

        struct NoBooter;
        impl Booter for NoBooter {
            fn boot_spec(&self, _: &Machine) -> Result<Option<Spec>, BooterError> {
                Ok(None)
            }
            fn read_boot_file(&self, _: &FileId) -> Result<BootFile, BooterError> {
                Err(BooterError::Backend("none".into()))
            }
            fn write_boot_file(
                &self,
                _: &FileId,
                _: Box<dyn std::io::Read + Send + 'static>,
            ) -> Result<(), BooterError> {
                Ok(())
            }
        }

        fn state(data: Vec<u8>) -> Arc<ServerState> {
            let mut ipxe = HashMap::new();
            ipxe.insert(Firmware::Efi64, data);
            Arc::new(ServerState {
                booter: Arc::new(NoBooter),
                ipxe: Arc::new(ipxe),
                events: Arc::new(EventLog::new()),
                http_port: 80,
                pcap_trace: None,
            })
        }

        /// Act as a minimal TFTP client against handle_transfer.
        fn fetch(
            state: &Arc<ServerState>,
            filename: &str,
            options: &HashMap<String, String>,
        ) -> Vec<u8> {
            let client = UdpSocket::bind("127.0.0.1:0").unwrap();
            client
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            let client_addr = client.local_addr().unwrap();

            let state = state.clone();
            let filename = filename.to_string();
            let options = options.clone();
            let server = thread::spawn(move || {
                handle_transfer(&state, &filename, &options, client_addr).unwrap();
            });

            let mut out = Vec::new();
            let mut buf = [0u8; 65536 + 4];
            let mut expected_block: u16 = 1;
            loop {
                let (len, from) = client.recv_from(&mut buf).unwrap();
                let opcode = u16::from_be_bytes([buf[0], buf[1]]);
                match opcode {
                    OPCODE_OACK => {
                        client.send_to(&[0, 4, 0, 0], from).unwrap();
                    }
                    OPCODE_DATA => {
                        let block = u16::from_be_bytes([buf[2], buf[3]]);
                        assert_eq!(block, expected_block);
                        out.extend_from_slice(&buf[4..len]);
                        client
                            .send_to(
                                &[0, 4, buf[2], buf[3]],
                                from,
                            )
                            .unwrap();
                        expected_block = expected_block.wrapping_add(1);
                        // Short block ends the transfer. The block
                        // size in play: default unless negotiated.
                        if len - 4 < 512 {
                            break;
                        }
                    }
                    OPCODE_ERROR => panic!("server sent error"),
                    other => panic!("unexpected opcode {other}"),
                }
            }
            server.join().unwrap();
            out
        }

        #[test]
        fn small_file_default_blocks() {
            let data = vec![7u8; 100];
            let st = state(data.clone());
            let got = fetch(&st, "aa:bb:cc:dd:ee:ff/7", &HashMap::new());
            assert_eq!(got, data);
        }

        #[test]
        fn multi_block_transfer() {
            let data: Vec<u8> = (0..1500u32).map(|i| (i % 251) as u8).collect();
            let st = state(data.clone());
            let got = fetch(&st, "aa:bb:cc:dd:ee:ff/7", &HashMap::new());
            assert_eq!(got, data);
        }

        #[test]
        fn exact_multiple_ends_with_empty_block() {
            let data = vec![1u8; 1024];
            let st = state(data.clone());
            let got = fetch(&st, "aa:bb:cc:dd:ee:ff/7", &HashMap::new());
            assert_eq!(got, data);
        }

        #[test]
        fn transfer_records_event() {
            let st = state(vec![9u8; 10]);
            fetch(&st, "aa:bb:cc:dd:ee:ff/7", &HashMap::new());
            let events = st.events.snapshot();
            assert_eq!(events.len(), 1);
            assert_eq!(events[0].state, MachineState::Tftp);
            assert_eq!(events[0].mac, "aa:bb:cc:dd:ee:ff");
        }

        #[test]
        fn unknown_firmware_gets_file_not_found() {
            let st = state(vec![9u8; 10]);
            let client = UdpSocket::bind("127.0.0.1:0").unwrap();
            client
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            let client_addr = client.local_addr().unwrap();

            handle_transfer(&st, "aa:bb:cc:dd:ee:ff/4", &HashMap::new(), client_addr).unwrap();

            let mut buf = [0u8; 128];
            let (len, _) = client.recv_from(&mut buf).unwrap();
            assert_eq!(u16::from_be_bytes([buf[0], buf[1]]), OPCODE_ERROR);
            assert_eq!(u16::from_be_bytes([buf[2], buf[3]]), ERROR_FILE_NOT_FOUND);
            assert!(len > 4);
        }
    }
}
