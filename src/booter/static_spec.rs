//! Booter that serves one fixed spec to every machine.

use std::collections::HashMap;
use std::io::Read;

use crate::domain::{BootFile, FileId, Machine, Spec};
use crate::error::BooterError;
use crate::ipxe;

use super::Booter;

/// Every machine boots the same kernel/initrd/cmdline. Ids are plain
/// table keys ("kernel", "initrd-0", …) resolved against local paths
/// or HTTP URLs captured at construction time.
pub struct StaticBooter {
    spec: Spec,
    files: HashMap<String, String>,
    client: reqwest::blocking::Client,
}

impl StaticBooter {
    /// `kernel` and each initrd are local paths or HTTP(S) URLs. The
    /// cmdline may carry `{{ URL "…" }}` tokens; each one is
    /// registered in the file table and replaced with an id token.
    pub fn new(
        kernel: String,
        initrds: Vec<String>,
        cmdline: String,
        message: String,
    ) -> Result<Self, BooterError> {
        let mut files = HashMap::new();
        files.insert("kernel".to_string(), kernel);

        let mut initrd_ids = Vec::with_capacity(initrds.len());
        for (i, source) in initrds.into_iter().enumerate() {
            let id = format!("initrd-{i}");
            files.insert(id.clone(), source);
            initrd_ids.push(FileId(id));
        }

        let mut extra = 0usize;
        let cmdline = {
            let files = &mut files;
            ipxe::expand_tokens(&cmdline, "URL", |url| {
                let id = format!("url-{extra}");
                extra += 1;
                files.insert(id.clone(), url.to_string());
                Ok(format!("{{{{ ID \"{id}\" }}}}"))
            })
            .map_err(|e| BooterError::InvalidSpec(e.to_string()))?
        };

        let client = reqwest::blocking::Client::builder()
            .timeout(None)
            .build()
            .map_err(|e| BooterError::Backend(e.to_string()))?;

        Ok(Self {
            spec: Spec {
                kernel: FileId::from("kernel"),
                initrd: initrd_ids,
                cmdline,
                message,
                ipxe_script: None,
            },
            files,
            client,
        })
    }
}

impl Booter for StaticBooter {
    fn boot_spec(&self, _m: &Machine) -> Result<Option<Spec>, BooterError> {
        Ok(Some(self.spec.clone()))
    }

    fn read_boot_file(&self, id: &FileId) -> Result<BootFile, BooterError> {
        let source = self
            .files
            .get(id.as_str())
            .ok_or_else(|| BooterError::InvalidSpec(format!("unknown file id {id:?}")))?;

        if source.starts_with("http://") || source.starts_with("https://") {
            let resp = self
                .client
                .get(source)
                .send()
                .map_err(|e| BooterError::Backend(e.to_string()))?;
            if !resp.status().is_success() {
                return Err(BooterError::Backend(format!(
                    "GET {source:?} failed: {}",
                    resp.status()
                )));
            }
            let size = resp.content_length();
            Ok(BootFile::new(Box::new(resp), size))
        } else {
            let f = std::fs::File::open(source)?;
            let size = f.metadata().ok().map(|m| m.len());
            Ok(BootFile::new(Box::new(f), size))
        }
    }

    fn write_boot_file(
        &self,
        _id: &FileId,
        _body: Box<dyn Read + Send + 'static>,
    ) -> Result<(), BooterError> {
        Ok(())
    }
}
