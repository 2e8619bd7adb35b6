//! Boot policy: who boots, what they boot, and the files backing it.
//!
//! A [`Booter`] answers two questions for the listeners: "should this
//! machine netboot, and into what?" (`boot_spec`) and "give me the
//! bytes behind this opaque id" (`read_boot_file`). Three
//! implementations: a fixed spec, an HTTP JSON API, and a gRPC
//! policy service.

pub mod api;
pub mod grpc;
pub mod static_spec;

use std::io::Read;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::{BootFile, FileId, Machine, Spec};
use crate::error::BooterError;
use crate::ipxe::{self, RenderError};
use crate::urlsign::{self, KEY_LEN};

pub use api::ApiBooter;
pub use grpc::{BootService, BootServiceResponse, GrpcBooter};
pub use static_spec::StaticBooter;

/// Boot instructions and files for machines.
///
/// The boot protocols are stateless, so `boot_spec` is called several
/// times over a single boot attempt; implementations must be cheap-ish
/// and safe for concurrent use from every listener.
pub trait Booter: Send + Sync {
    /// What should this machine boot? `Ok(None)` means "not one of
    /// ours": the request is ignored and the client falls through to
    /// its next boot source.
    fn boot_spec(&self, m: &Machine) -> Result<Option<Spec>, BooterError>;

    /// Open the file behind an id previously handed out in a Spec.
    fn read_boot_file(&self, id: &FileId) -> Result<BootFile, BooterError>;

    /// Store data under an id. Most backends don't, and no-op.
    fn write_boot_file(
        &self,
        id: &FileId,
        body: Box<dyn Read + Send + 'static>,
    ) -> Result<(), BooterError>;
}

/// The JSON shape policy backends speak.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawSpec {
    #[serde(default)]
    pub kernel: String,
    #[serde(default)]
    pub initrd: Vec<String>,
    /// Either a plain string or an object of flags; see
    /// [`construct_cmdline`].
    #[serde(default)]
    pub cmdline: Option<serde_json::Value>,
    #[serde(default)]
    pub message: String,
    #[serde(default, rename = "ipxe-script")]
    pub ipxe_script: String,
}

/// Policy-backend connection settings, served verbatim on `/certs`
/// for downstream installers that need the same credentials.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default)]
    pub debug: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub grpc_address: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub policy_api_url: String,
    #[serde(default)]
    pub chain_api_url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ca_cert: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cert: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub key: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hmac: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ntp_servers: Vec<String>,
    #[serde(default)]
    pub partition: String,
}

/// Signing key + URL prefix + HTTP clients, shared by the booters
/// that mint signed file ids.
pub struct SignedFiles {
    key: [u8; KEY_LEN],
    url_prefix: String,
    api_client: reqwest::blocking::Client,
    /// Separate client without a timeout: kernel and initrd proxying
    /// can legitimately run for minutes.
    file_client: reqwest::blocking::Client,
}

impl SignedFiles {
    /// `url` is the policy server base; the API lives under `v1/`.
    pub fn new(url: &str, timeout: Duration) -> Result<Self, BooterError> {
        let mut prefix = url.to_string();
        if !prefix.ends_with('/') {
            prefix.push('/');
        }
        prefix.push_str("v1");

        let api_client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BooterError::Backend(e.to_string()))?;
        let file_client = reqwest::blocking::Client::builder()
            .timeout(None)
            .build()
            .map_err(|e| BooterError::Backend(e.to_string()))?;

        Ok(Self {
            key: urlsign::generate_key(),
            url_prefix: prefix,
            api_client,
            file_client,
        })
    }

    pub fn url_prefix(&self) -> &str {
        &self.url_prefix
    }

    pub fn api_client(&self) -> &reqwest::blocking::Client {
        &self.api_client
    }

    /// Turn a backend response into a Spec: resolve kernel/initrd
    /// URLs against the prefix, sign them into ids, normalize the
    /// cmdline, and rewrite its `{{ URL "…" }}` tokens into
    /// `{{ ID "…" }}` tokens with fresh ids.
    pub fn spec_from_raw(&self, raw: RawSpec) -> Result<Spec, BooterError> {
        if !raw.ipxe_script.is_empty() {
            return Ok(Spec {
                ipxe_script: Some(raw.ipxe_script),
                ..Spec::default()
            });
        }

        let kernel_url = make_url_absolute(&self.url_prefix, &raw.kernel)?;
        let kernel = urlsign::sign_url(&kernel_url, &self.key)?;

        let mut initrd = Vec::with_capacity(raw.initrd.len());
        for img in &raw.initrd {
            let u = make_url_absolute(&self.url_prefix, img)?;
            initrd.push(urlsign::sign_url(&u, &self.key)?);
        }

        let cmdline = match raw.cmdline {
            None => String::new(),
            Some(serde_json::Value::String(s)) => s,
            Some(serde_json::Value::Object(map)) => construct_cmdline(&map)?,
            Some(other) => {
                return Err(BooterError::InvalidSpec(format!(
                    "unsupported cmdline type: {other}"
                )))
            }
        };

        let cmdline = ipxe::expand_tokens(&cmdline, "URL", |u| {
            let abs = make_url_absolute(&self.url_prefix, u)
                .map_err(|e| RenderError::Expansion(e.to_string()))?;
            let id = urlsign::sign_url(&abs, &self.key)
                .map_err(|e| RenderError::Expansion(e.to_string()))?;
            Ok(format!("{{{{ ID \"{id}\" }}}}"))
        })
        .map_err(|e| BooterError::InvalidSpec(e.to_string()))?;

        Ok(Spec {
            kernel,
            initrd,
            cmdline,
            message: raw.message,
            ipxe_script: None,
        })
    }

    /// Resolve an id back to its URL and open it. `file://` URLs read
    /// from disk, everything else proxies over HTTP.
    pub fn read(&self, id: &FileId) -> Result<BootFile, BooterError> {
        let url_str = urlsign::get_url(id, &self.key)?;
        let url = reqwest::Url::parse(&url_str)
            .map_err(|_| BooterError::InvalidSpec(format!("{url_str:?} is not a URL")))?;

        if url.scheme() == "file" {
            let path = url
                .to_file_path()
                .map_err(|_| BooterError::InvalidSpec(format!("bad file URL {url_str:?}")))?;
            let f = std::fs::File::open(path)?;
            let size = f.metadata().ok().map(|m| m.len());
            return Ok(BootFile::new(Box::new(f), size));
        }

        let resp = self
            .file_client
            .get(url)
            .send()
            .map_err(|e| BooterError::Backend(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(BooterError::Backend(format!(
                "GET {url_str:?} failed: {}",
                resp.status()
            )));
        }
        let size = resp.content_length();
        Ok(BootFile::new(Box::new(resp), size))
    }

    /// POST data back to the URL behind an id.
    pub fn write(
        &self,
        id: &FileId,
        body: Box<dyn Read + Send + 'static>,
    ) -> Result<(), BooterError> {
        let url_str = urlsign::get_url(id, &self.key)?;
        let resp = self
            .file_client
            .post(&url_str)
            .header("content-type", "application/octet-stream")
            .body(reqwest::blocking::Body::new(body))
            .send()
            .map_err(|e| BooterError::Backend(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(BooterError::Backend(format!(
                "POST {url_str:?} failed: {}",
                resp.status()
            )));
        }
        Ok(())
    }
}

/// Resolve `raw` against `prefix` unless it is already absolute.
pub fn make_url_absolute(prefix: &str, raw: &str) -> Result<String, BooterError> {
    match reqwest::Url::parse(raw) {
        Ok(u) => Ok(u.to_string()),
        Err(_) => {
            let base = reqwest::Url::parse(prefix)
                .map_err(|_| BooterError::InvalidSpec(format!("{prefix:?} is not a URL")))?;
            let joined = base
                .join(raw)
                .map_err(|_| BooterError::InvalidSpec(format!("{raw:?} is not a URL")))?;
            Ok(joined.to_string())
        }
    }
}

/// Build a cmdline from an object of flags, keys in lexicographic
/// order for determinism. `true` emits the bare key, a string emits
/// `key="value"`, and `{"url": "…"}` emits a `{{ URL "…" }}` token
/// for later signing.
pub fn construct_cmdline(
    map: &serde_json::Map<String, serde_json::Value>,
) -> Result<String, BooterError> {
    let mut parts = Vec::with_capacity(map.len());
    for (k, v) in map {
        match v {
            serde_json::Value::Bool(true) => parts.push(k.clone()),
            serde_json::Value::Bool(false) => {}
            serde_json::Value::String(s) => parts.push(format!("{k}={s:?}")),
            serde_json::Value::Object(obj) => {
                let url = obj.get("url").and_then(|u| u.as_str()).ok_or_else(|| {
                    BooterError::InvalidSpec(format!(
                        "cmdline key {k:?} has object value with no 'url' attribute"
                    ))
                })?;
                parts.push(format!("{k}={{{{ URL \"{url}\" }}}}"));
            }
            other => {
                return Err(BooterError::InvalidSpec(format!(
                    "unsupported value {other} for cmdline key {k:?}"
                )))
            }
        }
    }
    Ok(parts.join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_absolute_passthrough() {
        assert_eq!(
            make_url_absolute("http://api/v1", "http://files/kernel").unwrap(),
            "http://files/kernel"
        );
    }

    #[test]
    fn url_relative_resolution() {
        assert_eq!(
            make_url_absolute("http://api/v1/", "files/kernel").unwrap(),
            "http://api/v1/files/kernel"
        );
    }

    mod cmdline {
        use super::*;
        use serde_json::json;

        fn obj(v: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
            v.as_object().unwrap().clone()
        }

        #[test]
        fn keys_sorted_and_typed() {
            let m = obj(json!({
                "quiet": true,
                "console": "ttyS0",
                "b-installer": {"url": "http://x/cloud-init"},
            }));
            let got = construct_cmdline(&m).unwrap();
            assert_eq!(
                got,
                "b-installer={{ URL \"http://x/cloud-init\" }} console=\"ttyS0\" quiet"
            );
        }

        #[test]
        fn false_flags_are_dropped() {
            let m = obj(json!({"a": false, "b": true}));
            assert_eq!(construct_cmdline(&m).unwrap(), "b");
        }

        #[test]
        fn object_without_url_rejected() {
            let m = obj(json!({"a": {"nope": 1}}));
            assert!(construct_cmdline(&m).is_err());
        }

        #[test]
        fn numeric_value_rejected() {
            let m = obj(json!({"a": 3}));
            assert!(construct_cmdline(&m).is_err());
        }
    }

    mod specs {
        use super::*;
        use crate::urlsign;
        use std::time::Duration;

        fn files() -> SignedFiles {
            SignedFiles::new("http://policy.example", Duration::from_secs(10)).unwrap()
        }

        #[test]
        fn raw_script_short_circuits() {
            let f = files();
            let spec = f
                .spec_from_raw(RawSpec {
                    ipxe_script: "#!ipxe\nexit\n".into(),
                    ..RawSpec::default()
                })
                .unwrap();
            assert_eq!(spec.ipxe_script.as_deref(), Some("#!ipxe\nexit\n"));
            assert!(spec.kernel.as_str().is_empty());
        }

        #[test]
        fn kernel_and_initrds_are_signed_urls() {
            let f = files();
            let spec = f
                .spec_from_raw(RawSpec {
                    kernel: "http://files/vmlinuz".into(),
                    initrd: vec!["initrd.img".into()],
                    cmdline: Some(serde_json::Value::String("quiet".into())),
                    ..RawSpec::default()
                })
                .unwrap();

            assert_eq!(
                urlsign::get_url(&spec.kernel, &f.key).unwrap(),
                "http://files/vmlinuz"
            );
            // Relative initrd resolved against the v1 prefix.
            assert_eq!(
                urlsign::get_url(&spec.initrd[0], &f.key).unwrap(),
                "http://policy.example/initrd.img"
            );
            assert_eq!(spec.cmdline, "quiet");
        }

        #[test]
        fn cmdline_url_tokens_become_id_tokens() {
            let f = files();
            let spec = f
                .spec_from_raw(RawSpec {
                    kernel: "http://files/vmlinuz".into(),
                    cmdline: Some(serde_json::Value::String(
                        "config={{ URL \"http://files/answer\" }}".into(),
                    )),
                    ..RawSpec::default()
                })
                .unwrap();

            let rest = spec
                .cmdline
                .strip_prefix("config={{ ID \"")
                .expect("cmdline should carry an ID token");
            let id = rest.strip_suffix("\" }}").unwrap();
            assert_eq!(
                urlsign::get_url(&FileId::from(id), &f.key).unwrap(),
                "http://files/answer"
            );
        }

        #[test]
        fn structured_cmdline_object() {
            let f = files();
            let spec = f
                .spec_from_raw(RawSpec {
                    kernel: "http://files/vmlinuz".into(),
                    cmdline: Some(serde_json::json!({"root": "/dev/sda", "rw": true})),
                    ..RawSpec::default()
                })
                .unwrap();
            assert_eq!(spec.cmdline, "root=\"/dev/sda\" rw");
        }

        #[test]
        fn unsupported_cmdline_type_rejected() {
            let f = files();
            let err = f.spec_from_raw(RawSpec {
                kernel: "http://files/vmlinuz".into(),
                cmdline: Some(serde_json::json!(42)),
                ..RawSpec::default()
            });
            assert!(err.is_err());
        }
    }
}
