//! Booter backed by an HTTP JSON policy API.

use std::io::Read;
use std::time::Duration;

use crate::domain::{mac_string, BootFile, FileId, Machine, Spec};
use crate::error::BooterError;

use super::{Booter, RawSpec, SignedFiles};

/// Asks `GET <prefix>/v1/boot/<mac>` what a machine should boot.
///
/// kernel/initrd URLs in the response are resolved against the prefix
/// and signed into ids, so the HTTP layer can serve files on the
/// policy server's behalf without trusting the client.
pub struct ApiBooter {
    files: SignedFiles,
}

impl ApiBooter {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, BooterError> {
        Ok(Self {
            files: SignedFiles::new(url, timeout)?,
        })
    }
}

impl Booter for ApiBooter {
    fn boot_spec(&self, m: &Machine) -> Result<Option<Spec>, BooterError> {
        let url = format!("{}/boot/{}", self.files.url_prefix(), mac_string(&m.mac));

        let resp = self
            .files
            .api_client()
            .get(&url)
            .send()
            .map_err(|e| BooterError::Backend(e.to_string()))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            // The API answers 404 for machines it doesn't manage.
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(BooterError::Backend(format!(
                "{url}: {}",
                resp.status()
            )));
        }

        let raw: RawSpec = resp
            .json()
            .map_err(|e| BooterError::InvalidSpec(e.to_string()))?;
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
