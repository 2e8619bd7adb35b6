//! DHCPv6 server socket: multicast group membership plus
//! destination-address control messages for filtering.

use std::io;
use std::mem;
use std::net::{Ipv6Addr, SocketAddrV6, UdpSocket};
use std::os::unix::io::AsRawFd;
use std::time::Duration;

use anyhow::{Context, Result};
use macaddr::MacAddr6;
use pnet::datalink;
use socket2::{Domain, Protocol, Socket, Type};

/// All-DHCP-servers multicast group (RFC 8415 §7.1).
pub const ALL_SERVERS_GROUP: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0x1, 0x2);
/// Server listen port.
pub const SERVER_PORT: u16 = 547;
/// Port clients listen on for replies.
pub const CLIENT_PORT: u16 = 546;

/// A received datagram's payload metadata.
pub struct Recv6Info {
    pub len: usize,
    pub src: SocketAddrV6,
}

/// Socket joined to the all-servers group on one interface. Receive
/// filters to that interface and group; replies unicast back to the
/// client port.
pub struct Conn6 {
    socket: UdpSocket,
    ifindex: u32,
    mac: MacAddr6,
}

impl Conn6 {
    pub fn open(interface: &str, port: u16) -> Result<Self> {
        let iface = datalink::interfaces()
            .into_iter()
            .find(|i| i.name == interface)
            .with_context(|| format!("interface {interface} not found"))?;
        let mac_bytes = iface
            .mac
            .with_context(|| format!("interface {interface} has no link-layer address"))?
            .octets();
        let mac = MacAddr6::from(mac_bytes);

        let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))
            .context("creating DHCPv6 socket")?;
        socket.set_reuse_address(true)?;
        socket.set_only_v6(true)?;
        socket
            .bind(&SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, port, 0, 0).into())
            .with_context(|| format!("binding DHCPv6 socket to port {port}"))?;
        socket
            .join_multicast_v6(&ALL_SERVERS_GROUP, iface.index)
            .context("joining ff02::1:2")?;
        enable_recv_pktinfo(&socket)?;
        socket.set_read_timeout(Some(Duration::from_secs(1)))?;

        Ok(Self {
            socket: socket.into(),
            ifindex: iface.index,
            mac,
        })
    }

    /// Hardware address of the bound interface, for DUID derivation.
    pub fn hardware_addr(&self) -> MacAddr6 {
        self.mac
    }

    /// Receive the next datagram addressed to the joined group on
    /// our interface; anything else is skipped.
    pub fn recv(&self, buf: &mut [u8]) -> io::Result<Recv6Info> {
        loop {
            let (len, src, dst, ifindex) = recvmsg6(self.socket.as_raw_fd(), buf)?;
            if ifindex != 0 && ifindex != self.ifindex {
                continue;
            }
            if let Some(dst) = dst {
                if !dst.is_multicast() || dst != ALL_SERVERS_GROUP {
                    continue;
                }
            }
            return Ok(Recv6Info { len, src });
        }
    }

    /// Unicast a reply to the client port at `dst`.
    pub fn send(&self, bs: &[u8], dst: &SocketAddrV6) -> io::Result<()> {
        let target = SocketAddrV6::new(*dst.ip(), CLIENT_PORT, 0, self.ifindex);
        self.socket.send_to(bs, target)?;
        Ok(())
    }
}

fn enable_recv_pktinfo(socket: &Socket) -> Result<()> {
    let on: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_IPV6,
            libc::IPV6_RECVPKTINFO,
            &on as *const libc::c_int as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error()).context("enabling IPV6_RECVPKTINFO");
    }
    Ok(())
}

/// recvmsg with the destination address and interface index from the
/// IPV6_PKTINFO control message.
fn recvmsg6(
    fd: libc::c_int,
    buf: &mut [u8],
) -> io::Result<(usize, SocketAddrV6, Option<Ipv6Addr>, u32)> {
    let mut src: libc::sockaddr_in6 = unsafe { mem::zeroed() };
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };
    let mut cmsg_buf = [0u8; 64];
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_name = &mut src as *mut libc::sockaddr_in6 as *mut libc::c_void;
    msg.msg_namelen = mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t;
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cmsg_buf.len() as _;

    let n = unsafe { libc::recvmsg(fd, &mut msg, 0) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    let mut dst = None;
    let mut ifindex = 0u32;
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::IPPROTO_IPV6 && (*cmsg).cmsg_type == libc::IPV6_PKTINFO {
                let info = libc::CMSG_DATA(cmsg) as *const libc::in6_pktinfo;
                dst = Some(Ipv6Addr::from((*info).ipi6_addr.s6_addr));
                ifindex = (*info).ipi6_ifindex as u32;
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    let src_addr = SocketAddrV6::new(
        Ipv6Addr::from(src.sin6_addr.s6_addr),
        u16::from_be(src.sin6_port),
        src.sin6_flowinfo,
        src.sin6_scope_id,
    );
    Ok((n as usize, src_addr, dst, ifindex))
}
