//! DHCP-oriented packet sockets.
//!
//! The portable backend binds a UDP socket to the DHCP port with
//! `IP_PKTINFO` enabled so replies can be routed back out the ingress
//! interface. The raw backend (`super::raw`) coexists with a bound
//! DHCP daemon by reading from the link layer instead.

use std::io;
use std::mem;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::os::unix::io::AsRawFd;
use std::time::Duration;

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};

use super::packet::{Packet, TxType};
use super::raw::RawConn;

/// DHCP client port; replies to clients go here.
pub const DHCP_CLIENT_PORT: u16 = 68;
/// DHCP server port; replies to relays go here.
pub const DHCP_SERVER_PORT: u16 = 67;

/// Metadata about a received datagram.
#[derive(Debug, Clone, Copy)]
pub struct RecvInfo {
    pub len: usize,
    /// Ingress interface index from the packet-info control message.
    pub ifindex: u32,
    pub src: SocketAddrV4,
}

/// A DHCP listener socket, portable or raw.
pub enum Conn {
    Portable(PortableConn),
    Raw(RawConn),
}

impl Conn {
    /// Open a listener. `no_bind` selects the raw backend, which
    /// requires a named interface and does not bind the DHCP port.
    pub fn open(
        addr: Ipv4Addr,
        port: u16,
        interface: Option<&str>,
        no_bind: bool,
    ) -> Result<Self> {
        if no_bind {
            let iface = interface
                .context("raw DHCP mode (--dhcp-no-bind) requires --interface")?;
            Ok(Conn::Raw(RawConn::open(iface, port)?))
        } else {
            Ok(Conn::Portable(PortableConn::open(addr, port, interface)?))
        }
    }

    /// Receive one datagram payload into `buf`. Returns
    /// `WouldBlock`/`TimedOut` periodically so callers can check
    /// their shutdown flag.
    pub fn recv(&mut self, buf: &mut [u8]) -> io::Result<RecvInfo> {
        match self {
            Conn::Portable(c) => c.recv(buf),
            Conn::Raw(c) => c.recv(buf),
        }
    }

    /// Transmit a marshaled reply using the strategy implied by the
    /// packet's address fields.
    pub fn send(&mut self, pkt: &Packet, bs: &[u8], ifindex: u32) -> io::Result<()> {
        match self {
            Conn::Portable(c) => c.send(pkt, bs, ifindex),
            Conn::Raw(c) => c.send(pkt, bs),
        }
    }
}

/// UDP socket bound to the DHCP port, with packet-info control
/// messages for interface recovery.
pub struct PortableConn {
    socket: UdpSocket,
}

impl PortableConn {
    pub fn open(addr: Ipv4Addr, port: u16, interface: Option<&str>) -> Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .context("creating DHCP socket")?;
        socket.set_reuse_address(true)?;
        socket.set_broadcast(true)?;

        #[cfg(target_os = "linux")]
        if let Some(iface) = interface {
            bind_to_device(&socket, iface)?;
        }
        #[cfg(not(target_os = "linux"))]
        let _ = interface;

        enable_pktinfo(&socket)?;

        socket
            .bind(&SocketAddrV4::new(addr, port).into())
            .with_context(|| format!("binding DHCP socket to {addr}:{port}"))?;
        socket.set_read_timeout(Some(Duration::from_secs(1)))?;

        Ok(Self {
            socket: socket.into(),
        })
    }

    pub fn recv(&self, buf: &mut [u8]) -> io::Result<RecvInfo> {
        recvmsg_pktinfo(self.socket.as_raw_fd(), buf)
    }

    pub fn send(&self, pkt: &Packet, bs: &[u8], ifindex: u32) -> io::Result<()> {
        match pkt.tx_type() {
            // This backend cannot set the link-layer destination, so
            // hardware-addressed replies fall back to broadcast.
            TxType::Broadcast | TxType::HardwareAddr => sendmsg_pktinfo(
                self.socket.as_raw_fd(),
                bs,
                SocketAddrV4::new(Ipv4Addr::BROADCAST, DHCP_CLIENT_PORT),
                ifindex,
            ),
            TxType::RelayAddr => {
                self.socket
                    .send_to(bs, SocketAddrV4::new(pkt.relay_addr, DHCP_SERVER_PORT))?;
                Ok(())
            }
            TxType::ClientAddr => {
                self.socket
                    .send_to(bs, SocketAddrV4::new(pkt.client_addr, DHCP_CLIENT_PORT))?;
                Ok(())
            }
        }
    }

    /// Reply directly to a socket address; used by the BINL listener,
    /// which always answers the requester's address.
    pub fn send_to(&self, bs: &[u8], dst: SocketAddrV4) -> io::Result<()> {
        self.socket.send_to(bs, dst)?;
        Ok(())
    }
}

#[cfg(target_os = "linux")]
fn bind_to_device(socket: &Socket, iface: &str) -> Result<()> {
    let fd = socket.as_raw_fd();
    let bytes = iface.as_bytes();
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_BINDTODEVICE,
            bytes.as_ptr() as *const libc::c_void,
            bytes.len() as libc::socklen_t,
        )
    };
    if rc != 0 {
        let err = io::Error::last_os_error();
        anyhow::bail!("binding to interface {}: {}", iface, err);
    }
    Ok(())
}

fn enable_pktinfo(socket: &Socket) -> Result<()> {
    let fd = socket.as_raw_fd();
    let on: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_IP,
            libc::IP_PKTINFO,
            &on as *const libc::c_int as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error()).context("enabling IP_PKTINFO");
    }
    Ok(())
}

/// recvmsg wrapper that extracts the ingress interface index from the
/// IP_PKTINFO control message.
fn recvmsg_pktinfo(fd: libc::c_int, buf: &mut [u8]) -> io::Result<RecvInfo> {
    let mut src: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };
    let mut cmsg_buf = [0u8; 64];
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_name = &mut src as *mut libc::sockaddr_in as *mut libc::c_void;
    msg.msg_namelen = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cmsg_buf.len() as _;

    let n = unsafe { libc::recvmsg(fd, &mut msg, 0) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    let mut ifindex = 0u32;
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::IPPROTO_IP && (*cmsg).cmsg_type == libc::IP_PKTINFO {
                let info = libc::CMSG_DATA(cmsg) as *const libc::in_pktinfo;
                ifindex = (*info).ipi_ifindex as u32;
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    Ok(RecvInfo {
        len: n as usize,
        ifindex,
        src: SocketAddrV4::new(
            Ipv4Addr::from(u32::from_be(src.sin_addr.s_addr)),
            u16::from_be(src.sin_port),
        ),
    })
}

/// sendmsg wrapper that pins the egress interface via IP_PKTINFO;
/// required for broadcasts, which otherwise follow the default route.
fn sendmsg_pktinfo(
    fd: libc::c_int,
    bs: &[u8],
    dst: SocketAddrV4,
    ifindex: u32,
) -> io::Result<()> {
    let mut dst_addr: libc::sockaddr_in = unsafe { mem::zeroed() };
    dst_addr.sin_family = libc::AF_INET as libc::sa_family_t;
    dst_addr.sin_port = dst.port().to_be();
    dst_addr.sin_addr.s_addr = u32::from(*dst.ip()).to_be();

    let mut iov = libc::iovec {
        iov_base: bs.as_ptr() as *mut libc::c_void,
        iov_len: bs.len(),
    };

    let mut cmsg_buf = [0u8; 64];
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_name = &mut dst_addr as *mut libc::sockaddr_in as *mut libc::c_void;
    msg.msg_namelen = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;

    let rc = unsafe {
        let space = libc::CMSG_SPACE(mem::size_of::<libc::in_pktinfo>() as libc::c_uint) as usize;
        msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = space as _;

        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        (*cmsg).cmsg_level = libc::IPPROTO_IP;
        (*cmsg).cmsg_type = libc::IP_PKTINFO;
        (*cmsg).cmsg_len = libc::CMSG_LEN(mem::size_of::<libc::in_pktinfo>() as libc::c_uint) as _;
        let info = libc::CMSG_DATA(cmsg) as *mut libc::in_pktinfo;
        (*info) = mem::zeroed();
        (*info).ipi_ifindex = ifindex as libc::c_int;

        libc::sendmsg(fd, &msg, 0)
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// True for errors that just mean "no packet this tick".
pub fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_classification() {
        assert!(is_timeout(&io::Error::from(io::ErrorKind::WouldBlock)));
        assert!(is_timeout(&io::Error::from(io::ErrorKind::TimedOut)));
        assert!(!is_timeout(&io::Error::from(io::ErrorKind::BrokenPipe)));
    }

    #[test]
    fn portable_conn_roundtrip_on_loopback() {
        // Bind to an ephemeral port on loopback and check that
        // send_to/recv carry payloads and populate RecvInfo.
        let conn = PortableConn::open(Ipv4Addr::LOCALHOST, 0, None).unwrap();
        let local = conn.socket.local_addr().unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(b"hello dhcp", local).unwrap();

        let mut buf = [0u8; 64];
        let info = conn.recv(&mut buf).unwrap();
        assert_eq!(info.len, 10);
        assert_eq!(&buf[..info.len], b"hello dhcp");
        assert_eq!(*info.src.ip(), Ipv4Addr::LOCALHOST);
    }
}
