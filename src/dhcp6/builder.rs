//! DHCPv6 reply construction.

use std::sync::Arc;

use anyhow::Result;

use super::bootconfig::{BootConfiguration, ARCH_HTTP_BOOT};
use super::options::{
    dns_servers, http_client_vendor_class, ia_addr, ia_na, status_code, Options, OPT_BOOTFILE_URL,
    OPT_CLIENT_ID, OPT_DNS_SERVERS, OPT_IA_NA, OPT_PREFERENCE, OPT_RAPID_COMMIT, OPT_SERVER_ID,
    OPT_VENDOR_CLASS, STATUS_NO_ADDRS_AVAIL,
};
use super::packet::{MessageType, Packet};
use super::pool::{IdentityAssociation, RandomAddressPool};

/// Builds replies to validated packets: Solicit → Advertise (or
/// Reply under rapid commit), Request → Reply, Information-Request →
/// Reply, Release → Reply. Exhaustion turns into a NoAddrsAvail
/// status option so the client sees a definite result instead of a
/// timeout.
pub struct PacketBuilder {
    server_duid: Vec<u8>,
    preferred_lifetime: u32,
    valid_lifetime: u32,
    configuration: Arc<dyn BootConfiguration>,
    addresses: Arc<RandomAddressPool>,
}

impl PacketBuilder {
    pub fn new(
        server_duid: Vec<u8>,
        preferred_lifetime: u32,
        valid_lifetime: u32,
        configuration: Arc<dyn BootConfiguration>,
        addresses: Arc<RandomAddressPool>,
    ) -> Self {
        Self {
            server_duid,
            preferred_lifetime,
            valid_lifetime,
            configuration,
            addresses,
        }
    }

    /// Build the reply for a validated inbound packet. `Ok(None)`
    /// means the type warrants no response.
    pub fn build_response(&self, input: &Packet) -> Result<Option<Packet>> {
        let client_id = input.options.client_id().unwrap_or_default().to_vec();
        let arch = input.options.client_arch_type();

        match input.r#type {
            MessageType::Solicit => {
                let boot_url =
                    self.configuration
                        .boot_url(extract_ll_address_or_id(&client_id), arch)?;
                let reply_type = if input.options.has_rapid_commit() {
                    MessageType::Reply
                } else {
                    MessageType::Advertise
                };
                let requested = input.options.ia_na_ids();
                match self.addresses.reserve_addresses(&client_id, &requested) {
                    Ok(associations) => Ok(Some(self.advertise(
                        reply_type,
                        input,
                        &client_id,
                        arch,
                        &associations,
                        &[],
                        None,
                        &boot_url,
                    ))),
                    // Whatever did get allocated still rides along;
                    // interface-ids that missed out get a status IA.
                    // A completely dry pool answers with a bare
                    // status option, so the client sees a definite
                    // result instead of timing out.
                    Err(e) if e.allocated.is_empty() => Ok(Some(self.advertise_no_addrs(
                        reply_type,
                        input,
                        &client_id,
                        &e.to_string(),
                    ))),
                    Err(e) => {
                        let msg = e.to_string();
                        let unsatisfied = ias_without_addresses(&e.allocated, &requested);
                        Ok(Some(self.advertise(
                            reply_type,
                            input,
                            &client_id,
                            arch,
                            &e.allocated,
                            &unsatisfied,
                            Some(&msg),
                            &boot_url,
                        )))
                    }
                }
            }
            MessageType::Request => {
                let boot_url =
                    self.configuration
                        .boot_url(extract_ll_address_or_id(&client_id), arch)?;
                let requested = input.options.ia_na_ids();
                let (associations, error) =
                    match self.addresses.reserve_addresses(&client_id, &requested) {
                        Ok(associations) => (associations, None),
                        Err(e) => {
                            let msg = e.to_string();
                            (e.allocated, Some(msg))
                        }
                    };
                let unsatisfied = ias_without_addresses(&associations, &requested);
                Ok(Some(self.reply(
                    input,
                    &client_id,
                    arch,
                    &associations,
                    &unsatisfied,
                    error.as_deref(),
                    &boot_url,
                )))
            }
            MessageType::InformationRequest => {
                let boot_url =
                    self.configuration
                        .boot_url(extract_ll_address_or_id(&client_id), arch)?;
                Ok(Some(self.information_reply(input, &client_id, arch, &boot_url)))
            }
            MessageType::Release => {
                self.addresses
                    .release_addresses(&client_id, &input.options.ia_na_ids());
                Ok(Some(self.release_reply(input, &client_id)))
            }
            _ => Ok(None),
        }
    }

    fn base_options(&self, client_id: &[u8]) -> Options {
        let mut opts = Options::new();
        opts.add(OPT_CLIENT_ID, client_id.to_vec());
        opts.add(OPT_SERVER_ID, self.server_duid.clone());
        opts
    }

    fn add_boot_options(&self, opts: &mut Options, arch: u16, boot_url: &[u8]) {
        if arch == ARCH_HTTP_BOOT {
            opts.add(OPT_VENDOR_CLASS, http_client_vendor_class());
        }
        opts.add(OPT_BOOTFILE_URL, boot_url.to_vec());
        let dns = self.configuration.dns_servers();
        if !dns.is_empty() {
            opts.add(OPT_DNS_SERVERS, dns_servers(dns));
        }
    }

    fn add_ia_nas(&self, opts: &mut Options, associations: &[IdentityAssociation]) {
        for assoc in associations {
            opts.add(
                OPT_IA_NA,
                ia_na(
                    &assoc.interface_id,
                    self.t1(),
                    self.t2(),
                    ia_addr(assoc.address, self.preferred_lifetime, self.valid_lifetime),
                ),
            );
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn advertise(
        &self,
        reply_type: MessageType,
        input: &Packet,
        client_id: &[u8],
        arch: u16,
        associations: &[IdentityAssociation],
        unsatisfied: &[Vec<u8>],
        error: Option<&str>,
        boot_url: &[u8],
    ) -> Packet {
        let mut resp = Packet::new(reply_type, input.transaction_id);
        resp.options = self.base_options(client_id);
        self.add_ia_nas(&mut resp.options, associations);
        for iaid in unsatisfied {
            resp.options.add(
                OPT_IA_NA,
                ia_na(
                    iaid,
                    self.t1(),
                    self.t2(),
                    status_code(
                        STATUS_NO_ADDRS_AVAIL,
                        error.unwrap_or("no address available"),
                    ),
                ),
            );
        }
        self.add_boot_options(&mut resp.options, arch, boot_url);
        if let Some(preference) = self.configuration.preference() {
            resp.options.add(OPT_PREFERENCE, preference);
        }
        if reply_type == MessageType::Reply {
            resp.options.add(OPT_RAPID_COMMIT, Vec::new());
        }
        resp
    }

    fn advertise_no_addrs(
        &self,
        reply_type: MessageType,
        input: &Packet,
        client_id: &[u8],
        message: &str,
    ) -> Packet {
        let mut resp = Packet::new(reply_type, input.transaction_id);
        resp.options = self.base_options(client_id);
        let (code, value) = status_code(STATUS_NO_ADDRS_AVAIL, message);
        resp.options.add(code, value);
        resp
    }

    #[allow(clippy::too_many_arguments)]
    fn reply(
        &self,
        input: &Packet,
        client_id: &[u8],
        arch: u16,
        associations: &[IdentityAssociation],
        unsatisfied: &[Vec<u8>],
        error: Option<&str>,
        boot_url: &[u8],
    ) -> Packet {
        let mut resp = Packet::new(MessageType::Reply, input.transaction_id);
        resp.options = self.base_options(client_id);
        self.add_ia_nas(&mut resp.options, associations);
        // Interface-ids we couldn't satisfy get an IA_NA whose
        // embedded option is a status code instead of an address.
        for iaid in unsatisfied {
            resp.options.add(
                OPT_IA_NA,
                ia_na(
                    iaid,
                    self.t1(),
                    self.t2(),
                    status_code(
                        STATUS_NO_ADDRS_AVAIL,
                        error.unwrap_or("no address available"),
                    ),
                ),
            );
        }
        self.add_boot_options(&mut resp.options, arch, boot_url);
        resp
    }

    fn information_reply(
        &self,
        input: &Packet,
        client_id: &[u8],
        arch: u16,
        boot_url: &[u8],
    ) -> Packet {
        let mut resp = Packet::new(MessageType::Reply, input.transaction_id);
        resp.options = self.base_options(client_id);
        self.add_boot_options(&mut resp.options, arch, boot_url);
        resp
    }

    fn release_reply(&self, input: &Packet, client_id: &[u8]) -> Packet {
        let mut resp = Packet::new(MessageType::Reply, input.transaction_id);
        resp.options = self.base_options(client_id);
        let (code, value) = status_code(0, "Release received.");
        resp.options.add(code, value);
        resp
    }

    fn t1(&self) -> u32 {
        self.preferred_lifetime / 2
    }

    fn t2(&self) -> u32 {
        self.preferred_lifetime * 4 / 5
    }
}

/// Interface-ids from the request that got no association.
fn ias_without_addresses(
    associations: &[IdentityAssociation],
    requested: &[Vec<u8>],
) -> Vec<Vec<u8>> {
    requested
        .iter()
        .filter(|iaid| {
            !associations
                .iter()
                .any(|assoc| assoc.interface_id == **iaid)
        })
        .cloned()
        .collect()
}

/// Pull the link-layer address (or failing that, the bare identifier)
/// out of a client-id option: the leading two bytes pick the DUID
/// format.
pub fn extract_ll_address_or_id(client_id: &[u8]) -> &[u8] {
    if client_id.len() < 2 {
        return client_id;
    }
    let duid_type = u16::from_be_bytes([client_id[0], client_id[1]]);
    match duid_type {
        // DUID-LLT: type, hw type, timestamp, then the address.
        1 if client_id.len() > 8 => &client_id[8..],
        // DUID-LL: type, hw type, then the address.
        3 if client_id.len() > 4 => &client_id[4..],
        _ => &client_id[2..],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dhcp6::bootconfig::StaticBootConfiguration;
    use crate::dhcp6::options::{OPT_IA_ADDR, OPT_ORO, OPT_STATUS_CODE};

    const DUID: &[u8] = &[0, 1, 0, 1, 0, 0, 0, 0, 1, 2, 3, 4, 5, 6];

    fn builder(pool_size: u64) -> PacketBuilder {
        let pool = Arc::new(RandomAddressPool::new(
            "2001:db8::1".parse().unwrap(),
            pool_size,
            600,
        ));
        let config = Arc::new(StaticBootConfiguration::new(
            "http://[2001:db8::4]/bootx64.efi",
            "http://[2001:db8::4]/script.ipxe",
            None,
            vec![],
        ));
        PacketBuilder::new(DUID.to_vec(), 300, 600, config, pool)
    }

    fn solicit(iaids: &[[u8; 4]]) -> Packet {
        let mut p = Packet::new(MessageType::Solicit, [1, 2, 3]);
        p.options.add(OPT_ORO, vec![0, 59]);
        p.options
            .add(OPT_CLIENT_ID, vec![0, 3, 0, 1, 0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
        for iaid in iaids {
            let mut v = iaid.to_vec();
            v.extend_from_slice(&[0; 8]);
            p.options.add(OPT_IA_NA, v);
        }
        p
    }

    /// Parse the embedded (code, value) option of an IA_NA payload.
    fn embedded_option(ia: &[u8]) -> (u16, &[u8]) {
        let code = u16::from_be_bytes([ia[12], ia[13]]);
        let len = u16::from_be_bytes([ia[14], ia[15]]) as usize;
        (code, &ia[16..16 + len])
    }

    #[test]
    fn solicit_becomes_advertise_with_address() {
        let b = builder(8);
        let resp = b
            .build_response(&solicit(&[[0, 0, 0, 1]]))
            .unwrap()
            .unwrap();

        assert_eq!(resp.r#type, MessageType::Advertise);
        assert_eq!(resp.transaction_id, [1, 2, 3]);
        assert!(resp.options.has(OPT_CLIENT_ID));
        assert_eq!(resp.options.server_id(), Some(DUID));
        assert_eq!(
            resp.options.first(OPT_BOOTFILE_URL),
            Some(&b"http://[2001:db8::4]/script.ipxe"[..])
        );

        let ia = resp.options.first(OPT_IA_NA).unwrap();
        assert_eq!(&ia[0..4], &[0, 0, 0, 1]);
        // T1 = P/2, T2 = 4P/5.
        assert_eq!(u32::from_be_bytes([ia[4], ia[5], ia[6], ia[7]]), 150);
        assert_eq!(u32::from_be_bytes([ia[8], ia[9], ia[10], ia[11]]), 240);
        let (code, value) = embedded_option(ia);
        assert_eq!(code, OPT_IA_ADDR);
        // Preferred/valid lifetimes trail the 16 address bytes.
        assert_eq!(
            u32::from_be_bytes([value[16], value[17], value[18], value[19]]),
            300
        );
        assert_eq!(
            u32::from_be_bytes([value[20], value[21], value[22], value[23]]),
            600
        );
    }

    #[test]
    fn http_boot_arch_gets_vendor_class_and_efi_url() {
        let b = builder(8);
        let mut p = solicit(&[[0, 0, 0, 1]]);
        p.options.add(super::super::options::OPT_CLIENT_ARCH_TYPE, vec![0, 0x10]);

        let resp = b.build_response(&p).unwrap().unwrap();
        assert!(resp.options.has(OPT_VENDOR_CLASS));
        assert_eq!(
            resp.options.first(OPT_BOOTFILE_URL),
            Some(&b"http://[2001:db8::4]/bootx64.efi"[..])
        );
    }

    #[test]
    fn exhausted_solicit_advertises_no_addrs_avail() {
        let b = builder(0);
        let resp = b
            .build_response(&solicit(&[[0, 0, 0, 1]]))
            .unwrap()
            .unwrap();

        assert_eq!(resp.r#type, MessageType::Advertise);
        assert!(!resp.options.has(OPT_IA_NA));
        let status = resp.options.first(OPT_STATUS_CODE).unwrap();
        assert_eq!(
            u16::from_be_bytes([status[0], status[1]]),
            STATUS_NO_ADDRS_AVAIL
        );
    }

    #[test]
    fn solicit_pool_of_one_with_two_interfaces() {
        // One address, two interface-ids: the Advertise carries the
        // single allocated IA plus a status-code IA for the other.
        let b = builder(1);
        let resp = b
            .build_response(&solicit(&[[0, 0, 0, 1], [0, 0, 0, 2]]))
            .unwrap()
            .unwrap();

        assert_eq!(resp.r#type, MessageType::Advertise);
        let ias = &resp.options.0[&OPT_IA_NA];
        assert_eq!(ias.len(), 2);
        let (first_code, _) = embedded_option(&ias[0]);
        let (second_code, second_value) = embedded_option(&ias[1]);
        assert_eq!(first_code, OPT_IA_ADDR);
        assert_eq!(second_code, OPT_STATUS_CODE);
        assert_eq!(
            u16::from_be_bytes([second_value[0], second_value[1]]),
            STATUS_NO_ADDRS_AVAIL
        );
    }

    #[test]
    fn pool_of_one_with_two_interfaces() {
        // One address to give, two interface-ids asked: the reply
        // carries one real IA and one status-code IA.
        let b = builder(1);
        let mut p = solicit(&[[0, 0, 0, 1], [0, 0, 0, 2]]);
        p.r#type = MessageType::Request;
        p.options.add(OPT_SERVER_ID, DUID.to_vec());

        let resp = b.build_response(&p).unwrap().unwrap();
        assert_eq!(resp.r#type, MessageType::Reply);

        let ias = &resp.options.0[&OPT_IA_NA];
        assert_eq!(ias.len(), 2);
        let (first_code, _) = embedded_option(&ias[0]);
        let (second_code, second_value) = embedded_option(&ias[1]);
        assert_eq!(first_code, OPT_IA_ADDR);
        assert_eq!(second_code, OPT_STATUS_CODE);
        assert_eq!(
            u16::from_be_bytes([second_value[0], second_value[1]]),
            STATUS_NO_ADDRS_AVAIL
        );
    }

    #[test]
    fn rapid_commit_solicit_gets_reply() {
        let b = builder(4);
        let mut p = solicit(&[[0, 0, 0, 1]]);
        p.options.add(OPT_RAPID_COMMIT, Vec::new());

        let resp = b.build_response(&p).unwrap().unwrap();
        assert_eq!(resp.r#type, MessageType::Reply);
        assert!(resp.options.has(OPT_RAPID_COMMIT));
    }

    #[test]
    fn information_request_reply_has_no_ia() {
        let b = builder(4);
        let mut p = Packet::new(MessageType::InformationRequest, [7, 7, 7]);
        p.options.add(OPT_ORO, vec![0, 59]);
        p.options.add(OPT_CLIENT_ID, vec![0, 3, 0, 1, 1, 2, 3, 4, 5, 6]);

        let resp = b.build_response(&p).unwrap().unwrap();
        assert_eq!(resp.r#type, MessageType::Reply);
        assert!(!resp.options.has(OPT_IA_NA));
        assert!(resp.options.has(OPT_BOOTFILE_URL));
    }

    #[test]
    fn release_frees_and_acknowledges() {
        let b = builder(1);
        b.build_response(&solicit(&[[0, 0, 0, 1]])).unwrap();

        let mut rel = solicit(&[[0, 0, 0, 1]]);
        rel.r#type = MessageType::Release;
        let resp = b.build_response(&rel).unwrap().unwrap();
        assert_eq!(resp.r#type, MessageType::Reply);
        let status = resp.options.first(OPT_STATUS_CODE).unwrap();
        assert_eq!(&status[2..], b"Release received.");

        // The address is available again.
        let mut other = solicit(&[[0, 0, 0, 9]]);
        other.options.0.remove(&OPT_CLIENT_ID);
        other
            .options
            .add(OPT_CLIENT_ID, vec![0, 3, 0, 1, 9, 9, 9, 9, 9, 9]);
        let resp = b.build_response(&other).unwrap().unwrap();
        assert!(resp.options.has(OPT_IA_NA));
    }

    #[test]
    fn unhandled_types_get_no_reply() {
        let b = builder(4);
        let p = Packet::new(MessageType::Renew, [0; 3]);
        assert!(b.build_response(&p).unwrap().is_none());
    }

    mod duid_extraction {
        use super::*;

        #[test]
        fn llt_skips_eight_bytes() {
            let id = [0, 1, 0, 1, 0xde, 0xad, 0xbe, 0xef, 1, 2, 3, 4, 5, 6];
            assert_eq!(extract_ll_address_or_id(&id), &[1, 2, 3, 4, 5, 6]);
        }

        #[test]
        fn ll_skips_four_bytes() {
            let id = [0, 3, 0, 1, 1, 2, 3, 4, 5, 6];
            assert_eq!(extract_ll_address_or_id(&id), &[1, 2, 3, 4, 5, 6]);
        }

        #[test]
        fn en_and_unknown_skip_two() {
            let id = [0, 2, 9, 9, 9];
            assert_eq!(extract_ll_address_or_id(&id), &[9, 9, 9]);
        }

        #[test]
        fn tiny_ids_pass_through() {
            assert_eq!(extract_ll_address_or_id(&[7]), &[7]);
        }
    }
}
