//! Booter backed by a gRPC boot policy service.
//!
//! The transport client is injected behind [`BootService`]; this
//! module owns the protocol *around* it: the first DISCOVER of a
//! machine carries its GUID and only warrants a fire-and-forget
//! `dhcp` notification, while later requests (by then the MAC is
//! what identifies the machine) ask `boot` for a real spec.

use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::domain::{mac_string, BootFile, FileId, Machine, Spec};
use crate::error::BooterError;

use super::{Booter, PolicyConfig, RawSpec, SignedFiles};

/// The boot policy RPC surface. Implementations wrap whatever
/// transport the deployment uses; they must be safe for concurrent
/// use.
pub trait BootService: Send + Sync {
    /// Report the first sighting of a machine, identified by GUID.
    fn dhcp(&self, uuid: &str) -> Result<(), BooterError>;

    /// Ask what a machine should boot.
    fn boot(&self, mac: &str, partition: &str) -> Result<BootServiceResponse, BooterError>;
}

#[derive(Debug, Clone, Default)]
pub struct BootServiceResponse {
    pub kernel: String,
    pub init_ram_disks: Vec<String>,
    pub cmdline: String,
}

pub struct GrpcBooter {
    service: Arc<dyn BootService>,
    partition: String,
    config: PolicyConfig,
    files: SignedFiles,
}

impl GrpcBooter {
    pub fn new(
        service: Arc<dyn BootService>,
        partition: String,
        config: PolicyConfig,
        timeout: Duration,
    ) -> Result<Self, BooterError> {
        let files = SignedFiles::new(&config.chain_api_url, timeout)?;
        info!("starting grpc booter, partition {}", partition);
        Ok(Self {
            service,
            partition,
            config,
            files,
        })
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }
}

impl Booter for GrpcBooter {
    fn boot_spec(&self, m: &Machine) -> Result<Option<Spec>, BooterError> {
        if let Some(guid) = &m.guid {
            // First DISCOVER: tell the backend the machine exists.
            // The empty spec still produces an OFFER so the firmware
            // proceeds to the chainload; the real spec comes once the
            // chainloaded iPXE asks again without a GUID.
            self.service.dhcp(guid)?;
            return Ok(Some(Spec::default()));
        }

        let mac = mac_string(&m.mac);
        let resp = self.service.boot(&mac, &self.partition)?;

        let mut cmdline = format!(
            "{} CHAIN_API_URL={}",
            resp.cmdline, self.config.chain_api_url
        );
        if self.config.debug {
            cmdline.push_str(" DEBUG=1");
        }

        let raw = RawSpec {
            kernel: resp.kernel,
            initrd: resp.init_ram_disks,
            cmdline: Some(serde_json::Value::String(cmdline)),
            ..RawSpec::default()
        };
        Ok(Some(self.files.spec_from_raw(raw)?))
    }

    fn read_boot_file(&self, id: &FileId) -> Result<BootFile, BooterError> {
        self.files.read(id)
    }

    fn write_boot_file(
        &self,
        id: &FileId,
        body: Box<dyn Read + Send + 'static>,
    ) -> Result<(), BooterError> {
        self.files.write(id, body)
    }
}
