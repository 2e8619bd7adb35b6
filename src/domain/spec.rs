//! Boot specs and the opaque file ids they reference.

use std::fmt;
use std::io::Read;

/// An opaque identifier a Booter hands out for files it can serve.
///
/// For the signing booters this is base64url(nonce ∥ sealed URL); for
/// the static booter it is a plain table key. Clients redeem ids via
/// the HTTP file endpoint; they are only valid for the lifetime of
/// the process that minted them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileId(pub String);

impl FileId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for FileId {
    fn from(s: String) -> Self {
        FileId(s)
    }
}

impl From<&str> for FileId {
    fn from(s: &str) -> Self {
        FileId(s.to_string())
    }
}

impl Default for FileId {
    fn default() -> Self {
        FileId(String::new())
    }
}

/// What a machine should boot.
///
/// Either a raw iPXE script the client executes verbatim, or a
/// structured kernel + initrds + cmdline. Ids inside the structured
/// form are only meaningful to the Booter that produced them.
#[derive(Debug, Clone, Default)]
pub struct Spec {
    pub kernel: FileId,
    pub initrd: Vec<FileId>,
    /// Kernel command line. May contain `{{ ID "<id>" }}` tokens that
    /// the HTTP layer expands into signed file URLs.
    pub cmdline: String,
    /// Message to print on the client machine before booting.
    pub message: String,
    /// When set, served to the client verbatim instead of a rendered
    /// script.
    pub ipxe_script: Option<String>,
}

/// An open boot file stream plus its size, when the backing store
/// knows it. Unknown sizes make HTTP boots painfully slow, so Booters
/// should report one whenever they can.
pub struct BootFile {
    pub reader: Box<dyn Read + Send>,
    pub size: Option<u64>,
}

impl BootFile {
    pub fn new(reader: Box<dyn Read + Send>, size: Option<u64>) -> Self {
        Self { reader, size }
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let size = bytes.len() as u64;
        Self {
            reader: Box::new(std::io::Cursor::new(bytes)),
            size: Some(size),
        }
    }
}
