//! iPXE boot script rendering.
//!
//! Renders the structured half of a [`Spec`] into the script iPXE
//! executes, and expands the `{{ NAME "arg" }}` tokens carried in
//! kernel command lines. Two expansion passes exist: the Booter
//! rewrites `{{ URL "…" }}` tokens into `{{ ID "…" }}` tokens with
//! freshly signed ids, and the HTTP layer resolves the `ID` tokens
//! into file-endpoint URLs at serve time.

use reqwest::Url;
use thiserror::Error;

use crate::domain::{mac_string, Machine, Spec};

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("spec is missing a kernel")]
    MissingKernel,

    #[error("unterminated template token in cmdline")]
    UnterminatedToken,

    #[error("malformed template token: {0}")]
    MalformedToken(String),

    #[error("unknown template function {0:?}")]
    UnknownFunction(String),

    #[error("expanding token: {0}")]
    Expansion(String),

    #[error("building URL: {0}")]
    Url(String),
}

/// Render the boot script for `mach`. `server_host` is the HTTP
/// host:port the client reached us on; all generated URLs point back
/// at it.
pub fn render_script(mach: &Machine, spec: &Spec, server_host: &str) -> Result<String, RenderError> {
    if let Some(script) = &spec.ipxe_script {
        return Ok(script.clone());
    }
    if spec.kernel.as_str().is_empty() {
        return Err(RenderError::MissingKernel);
    }

    let mac = mac_string(&mach.mac);
    let mut script = String::from("#!ipxe\n");

    script.push_str(&format!(
        "kernel --name kernel {}\n",
        file_url(server_host, spec.kernel.as_str(), "kernel", &mac)?
    ));
    for (i, initrd) in spec.initrd.iter().enumerate() {
        script.push_str(&format!(
            "initrd --name initrd{} {}\n",
            i,
            file_url(server_host, initrd.as_str(), "initrd", &mac)?
        ));
    }

    // The "ready" fetch is a no-op marker: the client downloading it
    // tells us the kernel handoff started. It is freed immediately.
    script.push_str(&format!(
        "imgfetch --name ready {} ||\n",
        booting_url(server_host, &mac)?
    ));
    script.push_str("imgfree ready ||\n");

    script.push_str("boot kernel ");
    for i in 0..spec.initrd.len() {
        script.push_str(&format!("initrd=initrd{i} "));
    }

    let cmdline = expand_tokens(&spec.cmdline, "ID", |id| {
        let mut u = base_url(server_host, "/_/file")?;
        u.query_pairs_mut().append_pair("name", id);
        Ok(u.to_string())
    })?;
    script.push_str(&cmdline);
    script.push('\n');

    Ok(script)
}

fn base_url(server_host: &str, path: &str) -> Result<Url, RenderError> {
    Url::parse(&format!("http://{server_host}{path}"))
        .map_err(|e| RenderError::Url(e.to_string()))
}

fn file_url(server_host: &str, id: &str, kind: &str, mac: &str) -> Result<String, RenderError> {
    let mut u = base_url(server_host, "/_/file")?;
    u.query_pairs_mut()
        .append_pair("name", id)
        .append_pair("type", kind)
        .append_pair("mac", mac);
    Ok(u.to_string())
}

fn booting_url(server_host: &str, mac: &str) -> Result<String, RenderError> {
    let mut u = base_url(server_host, "/_/booting")?;
    u.query_pairs_mut().append_pair("mac", mac);
    Ok(u.to_string())
}

/// Expand every `{{ <func> "<arg>" }}` token in `input` through
/// `resolve`. Only `func` is accepted; any other function name is an
/// error, as is an unterminated or malformed token.
pub fn expand_tokens(
    input: &str,
    func: &str,
    mut resolve: impl FnMut(&str) -> Result<String, RenderError>,
) -> Result<String, RenderError> {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find("}}").ok_or(RenderError::UnterminatedToken)?;
        let token = after[..end].trim();

        let (name, arg) = parse_token(token)
            .ok_or_else(|| RenderError::MalformedToken(token.to_string()))?;
        if name != func {
            return Err(RenderError::UnknownFunction(name.to_string()));
        }
        out.push_str(&resolve(arg)?);

        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Split `NAME "arg"` into its parts.
fn parse_token(token: &str) -> Option<(&str, &str)> {
    let (name, quoted) = token.split_once(char::is_whitespace)?;
    let quoted = quoted.trim();
    let arg = quoted.strip_prefix('"')?.strip_suffix('"')?;
    if name.is_empty() || arg.contains('"') {
        return None;
    }
    Some((name, arg))
}
