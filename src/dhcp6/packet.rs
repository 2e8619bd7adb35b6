//! DHCPv6 packet codec and per-type validation gates.

use super::options::Options;
use crate::error::Packet6Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Solicit = 1,
    Advertise = 2,
    Request = 3,
    Confirm = 4,
    Renew = 5,
    Rebind = 6,
    Reply = 7,
    Release = 8,
    Decline = 9,
    Reconfigure = 10,
    InformationRequest = 11,
    RelayForw = 12,
    RelayRepl = 13,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Solicit),
            2 => Some(Self::Advertise),
            3 => Some(Self::Request),
            4 => Some(Self::Confirm),
            5 => Some(Self::Renew),
            6 => Some(Self::Rebind),
            7 => Some(Self::Reply),
            8 => Some(Self::Release),
            9 => Some(Self::Decline),
            10 => Some(Self::Reconfigure),
            11 => Some(Self::InformationRequest),
            12 => Some(Self::RelayForw),
            13 => Some(Self::RelayRepl),
            _ => None,
        }
    }
}

/// A DHCPv6 packet: type, 3-byte transaction id, options.
#[derive(Debug, Clone)]
pub struct Packet {
    pub r#type: MessageType,
    pub transaction_id: [u8; 3],
    pub options: Options,
}

impl Packet {
    pub fn new(r#type: MessageType, transaction_id: [u8; 3]) -> Self {
        Self {
            r#type,
            transaction_id,
            options: Options::new(),
        }
    }

    pub fn unmarshal(bs: &[u8]) -> Result<Self, Packet6Error> {
        if bs.len() < 4 {
            return Err(Packet6Error::TooShort {
                expected: 4,
                actual: bs.len(),
            });
        }
        let r#type = MessageType::from_u8(bs[0]).ok_or(Packet6Error::UnknownType(bs[0]))?;
        let options = Options::unmarshal(&bs[4..])?;
        Ok(Self {
            r#type,
            transaction_id: [bs[1], bs[2], bs[3]],
            options,
        })
    }

    pub fn marshal(&self) -> Vec<u8> {
        let opts = self.options.marshal();
        let mut bs = Vec::with_capacity(4 + opts.len());
        bs.push(self.r#type as u8);
        bs.extend_from_slice(&self.transaction_id);
        bs.extend_from_slice(&opts);
        bs
    }

    /// Per-type validation gate. An `Err` means the packet must be
    /// dropped without a reply.
    ///
    /// Release is accepted with no further checks; the protocol
    /// offers no recovery for a bad release anyway.
    pub fn should_discard(&self, server_duid: &[u8]) -> Result<(), Packet6Error> {
        match self.r#type {
            MessageType::Solicit => self.check_solicit(),
            MessageType::Request => self.check_request(server_duid),
            MessageType::InformationRequest => self.check_information_request(server_duid),
            MessageType::Release => Ok(()),
            _ => Err(Packet6Error::Discard {
                kind: "unknown",
                reason: "unhandled packet type".to_string(),
            }),
        }
    }

    fn check_solicit(&self) -> Result<(), Packet6Error> {
        let discard = |reason: &str| Packet6Error::Discard {
            kind: "Solicit",
            reason: reason.to_string(),
        };
        if !self.options.requested_bootfile_url() {
            return Err(discard("doesn't request a boot file url"));
        }
        if self.options.client_id().is_none() {
            return Err(discard("has no client id option"));
        }
        if self.options.server_id().is_some() {
            return Err(discard("has a server id option"));
        }
        Ok(())
    }

    fn check_request(&self, server_duid: &[u8]) -> Result<(), Packet6Error> {
        let discard = |reason: String| Packet6Error::Discard {
            kind: "Request",
            reason,
        };
        if !self.options.requested_bootfile_url() {
            return Err(discard("doesn't request a boot file url".to_string()));
        }
        if self.options.client_id().is_none() {
            return Err(discard("has no client id option".to_string()));
        }
        match self.options.server_id() {
            None => return Err(discard("has no server id option".to_string())),
            Some(id) if id != server_duid => {
                return Err(discard(format!(
                    "server id {id:02x?} doesn't match ours {server_duid:02x?}"
                )))
            }
            Some(_) => {}
        }
        Ok(())
    }

    fn check_information_request(&self, server_duid: &[u8]) -> Result<(), Packet6Error> {
        let discard = |reason: String| Packet6Error::Discard {
            kind: "Information-request",
            reason,
        };
        if !self.options.requested_bootfile_url() {
            return Err(discard("doesn't request a boot file url".to_string()));
        }
        if self.options.has(super::options::OPT_IA_NA) || self.options.has(super::options::OPT_IA_TA)
        {
            return Err(discard("has an IA option present".to_string()));
        }
        if let Some(id) = self.options.server_id() {
            if id != server_duid {
                return Err(discard(format!(
                    "server id {id:02x?} doesn't match ours {server_duid:02x?}"
                )));
            }
        }
        Ok(())
    }
}
