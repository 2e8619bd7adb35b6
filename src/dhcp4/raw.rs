//! Link-layer DHCP transport (Linux).
//!
//! Reads frames from an AF_PACKET channel so no bind on the DHCP
//! port is needed and the server can coexist with a running DHCP
//! daemon. The receive path filters for UDPv4 to our port addressed
//! to the interface (or broadcast); the transmit path hand-builds
//! Ethernet+IPv4+UDP frames so replies can carry an explicit
//! link-layer destination for clients that have no IP yet.

use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use anyhow::{Context, Result};
use pnet::datalink::{self, Channel, Config, DataLinkReceiver, DataLinkSender, NetworkInterface};
use pnet::packet::ethernet::{EtherTypes, EthernetPacket, MutableEthernetPacket};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::{self, Ipv4Packet, MutableIpv4Packet};
use pnet::packet::udp::{self, MutableUdpPacket, UdpPacket};
use pnet::packet::MutablePacket;
use pnet::util::MacAddr;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use super::conn::{RecvInfo, DHCP_CLIENT_PORT, DHCP_SERVER_PORT};
use super::packet::{Packet, TxType};

const ETHERNET_HEADER_LEN: usize = 14;
const IPV4_HEADER_LEN: usize = 20;
const UDP_HEADER_LEN: usize = 8;

pub struct RawConn {
    iface_index: u32,
    iface_mac: MacAddr,
    iface_ip: Option<Ipv4Addr>,
    port: u16,
    rx: Box<dyn DataLinkReceiver>,
    tx: Box<dyn DataLinkSender>,
    /// IPPROTO_RAW socket for unicast replies; carries a prebuilt
    /// IPv4 datagram, so no port 67 bind is needed here either.
    unicast: Socket,
}

impl RawConn {
    pub fn open(interface: &str, port: u16) -> Result<Self> {
        let iface = datalink::interfaces()
            .into_iter()
            .find(|i| i.name == interface)
            .with_context(|| format!("interface {interface} not found"))?;

        let iface_mac = iface
            .mac
            .with_context(|| format!("interface {interface} has no link-layer address"))?;
        let iface_ip = interface_ipv4(&iface);

        let config = Config {
            read_timeout: Some(Duration::from_secs(1)),
            ..Config::default()
        };
        let (tx, rx) = match datalink::channel(&iface, config) {
            Ok(Channel::Ethernet(tx, rx)) => (tx, rx),
            Ok(_) => anyhow::bail!("unsupported datalink channel type on {interface}"),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("opening packet channel on {interface} (are you root?)")
                })
            }
        };

        let unicast = Socket::new(
            Domain::IPV4,
            Type::RAW,
            Some(Protocol::from(libc::IPPROTO_RAW)),
        )
        .context("creating raw unicast socket")?;

        Ok(Self {
            iface_index: iface.index,
            iface_mac,
            iface_ip,
            port,
            rx,
            tx,
            unicast,
        })
    }

    pub fn recv(&mut self, buf: &mut [u8]) -> io::Result<RecvInfo> {
        let (iface_ip, port, ifindex) = (self.iface_ip, self.port, self.iface_index);
        loop {
            let frame = self.rx.next()?;
            let Some((payload, src)) = match_dhcp(iface_ip, port, frame) else {
                continue;
            };
            let n = payload.len().min(buf.len());
            buf[..n].copy_from_slice(&payload[..n]);
            return Ok(RecvInfo {
                len: n,
                ifindex,
                src,
            });
        }
    }

    pub fn send(&mut self, pkt: &Packet, bs: &[u8]) -> io::Result<()> {
        match pkt.tx_type() {
            TxType::Broadcast => self.send_frame(
                MacAddr::broadcast(),
                Ipv4Addr::BROADCAST,
                DHCP_CLIENT_PORT,
                bs,
            ),
            TxType::HardwareAddr => {
                let m = pkt.hardware_addr.as_bytes();
                let dst = MacAddr::new(m[0], m[1], m[2], m[3], m[4], m[5]);
                // The client owns no IP yet; address the IP layer to
                // broadcast but steer the frame with the MAC.
                self.send_frame(dst, Ipv4Addr::BROADCAST, DHCP_CLIENT_PORT, bs)
            }
            TxType::RelayAddr => self.send_unicast(pkt.relay_addr, DHCP_SERVER_PORT, bs),
            TxType::ClientAddr => self.send_unicast(pkt.client_addr, DHCP_CLIENT_PORT, bs),
        }
    }

    fn send_frame(
        &mut self,
        dst_mac: MacAddr,
        dst_ip: Ipv4Addr,
        dst_port: u16,
        payload: &[u8],
    ) -> io::Result<()> {
        let src_ip = self.iface_ip.unwrap_or(Ipv4Addr::UNSPECIFIED);
        let mut frame =
            vec![0u8; ETHERNET_HEADER_LEN + IPV4_HEADER_LEN + UDP_HEADER_LEN + payload.len()];

        let mut eth = MutableEthernetPacket::new(&mut frame)
            .ok_or_else(|| io::Error::other("ethernet buffer too small"))?;
        eth.set_destination(dst_mac);
        eth.set_source(self.iface_mac);
        eth.set_ethertype(EtherTypes::Ipv4);

        build_ipv4_udp(
            eth.payload_mut(),
            src_ip,
            dst_ip,
            self.port,
            dst_port,
            payload,
        )?;

        match self.tx.send_to(&frame, None) {
            Some(res) => res,
            None => Err(io::Error::other("datalink send failed")),
        }
    }

    fn send_unicast(&self, dst_ip: Ipv4Addr, dst_port: u16, payload: &[u8]) -> io::Result<()> {
        let src_ip = self.iface_ip.unwrap_or(Ipv4Addr::UNSPECIFIED);
        let mut datagram = vec![0u8; IPV4_HEADER_LEN + UDP_HEADER_LEN + payload.len()];
        build_ipv4_udp(&mut datagram, src_ip, dst_ip, self.port, dst_port, payload)?;

        self.unicast
            .send_to(&datagram, &SockAddr::from(SocketAddrV4::new(dst_ip, 0)))?;
        Ok(())
    }
}

/// Extract the UDP payload if the frame is DHCP traffic for us:
/// UDPv4, our destination port, addressed to the interface IP or
/// 255.255.255.255.
fn match_dhcp(
    iface_ip: Option<Ipv4Addr>,
    port: u16,
    frame: &[u8],
) -> Option<(&[u8], SocketAddrV4)> {
    let eth = EthernetPacket::new(frame)?;
    if eth.get_ethertype() != EtherTypes::Ipv4 {
        return None;
    }
    let ip_bytes = frame.get(ETHERNET_HEADER_LEN..)?;
    let ip = Ipv4Packet::new(ip_bytes)?;
    if ip.get_next_level_protocol() != IpNextHeaderProtocols::Udp {
        return None;
    }
    let dst = ip.get_destination();
    if let Some(own) = iface_ip {
        if dst != own && dst != Ipv4Addr::BROADCAST {
            return None;
        }
    }
    let header_len = ip.get_header_length() as usize * 4;
    if ip_bytes.len() < header_len {
        return None;
    }
    let udp_bytes = &ip_bytes[header_len..];
    let udp = UdpPacket::new(udp_bytes)?;
    if udp.get_destination() != port {
        return None;
    }
    let end = (udp.get_length() as usize).min(udp_bytes.len());
    if end < UDP_HEADER_LEN {
        return None;
    }
    let src = SocketAddrV4::new(ip.get_source(), udp.get_source());
    Some((&udp_bytes[UDP_HEADER_LEN..end], src))
}

/// Fill `buf` with an IPv4 header and UDP datagram around `payload`.
/// Checksums are the canonical one's-complement sums.
fn build_ipv4_udp(
    buf: &mut [u8],
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    payload: &[u8],
) -> io::Result<()> {
    let total_len = (IPV4_HEADER_LEN + UDP_HEADER_LEN + payload.len()) as u16;

    let mut ip = MutableIpv4Packet::new(buf)
        .ok_or_else(|| io::Error::other("ipv4 buffer too small"))?;
    ip.set_version(4);
    ip.set_header_length((IPV4_HEADER_LEN / 4) as u8);
    // DSCP CS6 (network control), the customary marking for DHCP.
    ip.set_dscp(48);
    ip.set_total_length(total_len);
    ip.set_ttl(64);
    ip.set_next_level_protocol(IpNextHeaderProtocols::Udp);
    ip.set_source(src_ip);
    ip.set_destination(dst_ip);
    ip.set_checksum(ipv4::checksum(&ip.to_immutable()));

    let mut udp = MutableUdpPacket::new(ip.payload_mut())
        .ok_or_else(|| io::Error::other("udp buffer too small"))?;
    udp.set_source(src_port);
    udp.set_destination(dst_port);
    udp.set_length((UDP_HEADER_LEN + payload.len()) as u16);
    udp.set_payload(payload);
    udp.set_checksum(udp::ipv4_checksum(&udp.to_immutable(), &src_ip, &dst_ip));

    Ok(())
}

/// First IPv4 address on the interface, if any.
fn interface_ipv4(iface: &NetworkInterface) -> Option<Ipv4Addr> {
    iface.ips.iter().find_map(|net| match net.ip() {
        std::net::IpAddr::V4(ip) => Some(ip),
        std::net::IpAddr::V6(_) => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pnet::packet::Packet as _;

    #[test]
    fn builds_valid_ipv4_udp() {
        let payload = b"dhcp payload";
        let mut buf = vec![0u8; IPV4_HEADER_LEN + UDP_HEADER_LEN + payload.len()];
        build_ipv4_udp(
            &mut buf,
            Ipv4Addr::new(192, 168, 1, 5),
            Ipv4Addr::BROADCAST,
            67,
            68,
            payload,
        )
        .unwrap();

        let ip = Ipv4Packet::new(&buf).unwrap();
        assert_eq!(ip.get_version(), 4);
        assert_eq!(ip.get_source(), Ipv4Addr::new(192, 168, 1, 5));
        assert_eq!(ip.get_destination(), Ipv4Addr::BROADCAST);
        assert_eq!(ip.get_next_level_protocol(), IpNextHeaderProtocols::Udp);
        assert_eq!(ip.get_total_length() as usize, buf.len());
        // Recomputing the checksum over the header must agree with
        // the embedded value.
        assert_eq!(ip.get_checksum(), ipv4::checksum(&ip));

        let udp = UdpPacket::new(ip.payload()).unwrap();
        assert_eq!(udp.get_source(), 67);
        assert_eq!(udp.get_destination(), 68);
        assert_eq!(udp.payload(), payload);
        assert_eq!(
            udp.get_checksum(),
            udp::ipv4_checksum(&udp, &Ipv4Addr::new(192, 168, 1, 5), &Ipv4Addr::BROADCAST)
        );
    }

    fn frame(dst_ip: Ipv4Addr, dst_port: u16, payload: &[u8]) -> Vec<u8> {
        let mut buf =
            vec![0u8; ETHERNET_HEADER_LEN + IPV4_HEADER_LEN + UDP_HEADER_LEN + payload.len()];
        {
            let mut eth = MutableEthernetPacket::new(&mut buf).unwrap();
            eth.set_destination(MacAddr::broadcast());
            eth.set_source(MacAddr::new(2, 0, 0, 0, 0, 1));
            eth.set_ethertype(EtherTypes::Ipv4);
        }
        build_ipv4_udp(
            &mut buf[ETHERNET_HEADER_LEN..],
            Ipv4Addr::new(10, 0, 0, 9),
            dst_ip,
            68,
            dst_port,
            payload,
        )
        .unwrap();
        buf
    }

    #[test]
    fn match_dhcp_accepts_broadcast_to_our_port() {
        let f = frame(Ipv4Addr::BROADCAST, 67, b"discover");
        let own = Some(Ipv4Addr::new(192, 168, 1, 5));
        let (payload, src) = match_dhcp(own, 67, &f).unwrap();
        assert_eq!(payload, b"discover");
        assert_eq!(*src.ip(), Ipv4Addr::new(10, 0, 0, 9));
        assert_eq!(src.port(), 68);
    }

    #[test]
    fn match_dhcp_rejects_other_ports() {
        let f = frame(Ipv4Addr::BROADCAST, 53, b"dns");
        assert!(match_dhcp(Some(Ipv4Addr::new(192, 168, 1, 5)), 67, &f).is_none());
    }

    #[test]
    fn match_dhcp_rejects_foreign_unicast() {
        let f = frame(Ipv4Addr::new(192, 168, 1, 77), 67, b"discover");
        assert!(match_dhcp(Some(Ipv4Addr::new(192, 168, 1, 5)), 67, &f).is_none());
    }

    #[test]
    fn match_dhcp_accepts_unicast_to_us() {
        let f = frame(Ipv4Addr::new(192, 168, 1, 5), 67, b"request");
        assert!(match_dhcp(Some(Ipv4Addr::new(192, 168, 1, 5)), 67, &f).is_some());
    }
}
