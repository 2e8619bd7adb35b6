//! DHCPv4: wire codec and packet sockets.

pub mod conn;
pub mod options;
pub mod packet;
pub mod raw;

pub use conn::{Conn, PortableConn, RecvInfo};
pub use options::Options;
pub use packet::{MessageType, Packet, TxType};
