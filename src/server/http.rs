//! HTTP endpoints: the iPXE boot script, signed file delivery, the
//! boot-complete marker, the event ring, and the policy-backend
//! configuration for downstream installers.

use std::io::Read;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, Host, Query, State};
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::{Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use macaddr::MacAddr6;
use serde::Deserialize;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info};

use crate::booter::{Booter, PolicyConfig};
use crate::domain::{Architecture, EventLog, FileId, Machine, MachineState};
use crate::error::HttpError;
use crate::ipxe;

pub(crate) struct HttpState {
    pub booter: Arc<dyn Booter>,
    pub events: Arc<EventLog>,
    pub policy_config: Option<PolicyConfig>,
}

/// Request logging middleware: "IP METHOD PATH - STATUS".
async fn request_logging(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();

    let response = next.run(request).await;

    let status = response.status();
    tracing::debug!("{} {} {} - {}", addr.ip(), method, uri, status.as_u16());

    response
}

pub(crate) fn create_router(state: Arc<HttpState>) -> Router {
    Router::new()
        .route("/_/ipxe", get(handle_ipxe))
        .route("/_/file", get(handle_file))
        .route("/_/booting", get(handle_booting))
        .route("/_/events", get(handle_events))
        .route("/certs", get(handle_certs))
        .layer(middleware::from_fn(request_logging))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct IpxeQuery {
    mac: String,
    arch: String,
}

/// GET /_/ipxe?mac=…&arch=… — render the boot script for a machine.
async fn handle_ipxe(
    State(state): State<Arc<HttpState>>,
    Host(host): Host,
    Query(query): Query<IpxeQuery>,
) -> Result<Response, HttpError> {
    let mac = MacAddr6::from_str(&query.mac)
        .map_err(|_| HttpError::BadRequest("invalid MAC address".into()))?;
    let arch = query
        .arch
        .parse::<u8>()
        .ok()
        .and_then(Architecture::from_u8)
        .ok_or_else(|| HttpError::BadRequest("unknown architecture".into()))?;

    let mach = Machine {
        mac,
        guid: None,
        arch,
    };

    let booter = state.booter.clone();
    let spec_mach = mach.clone();
    let spec = tokio::task::spawn_blocking(move || booter.boot_spec(&spec_mach))
        .await
        .map_err(|e| HttpError::Internal(e.to_string()))?
        .map_err(|e| {
            info!("couldn't get a bootspec for {}: {}", mac, e);
            HttpError::Internal("couldn't get a bootspec".into())
        })?;
    let Some(spec) = spec else {
        debug!("no boot spec for {}, ignoring boot request", mac);
        return Err(HttpError::NotFound("you don't netboot".into()));
    };

    let script = ipxe::render_script(&mach, &spec, &host).map_err(|e| {
        info!("failed to assemble ipxe script for {}: {}", mac, e);
        HttpError::Internal("couldn't get a boot script".into())
    })?;

    info!("sending ipxe boot script to {}", mac);
    state
        .events
        .record(&mac, MachineState::IpxeScript, "Sent iPXE boot script");

    Ok(([(CONTENT_TYPE, "text/plain")], script).into_response())
}

#[derive(Debug, Deserialize)]
struct FileQuery {
    name: String,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    mac: Option<String>,
}

/// GET /_/file?name=… — stream the bytes behind a signed id.
///
/// The opaque 404 on failure is deliberate: the id either never
/// decoded or failed authentication, and clients learn nothing more.
async fn handle_file(
    State(state): State<Arc<HttpState>>,
    Query(query): Query<FileQuery>,
) -> Result<Response, HttpError> {
    if query.name.is_empty() {
        return Err(HttpError::BadRequest("missing filename".into()));
    }
    let id = FileId(query.name.clone());

    let booter = state.booter.clone();
    let file = tokio::task::spawn_blocking(move || booter.read_boot_file(&id))
        .await
        .map_err(|e| HttpError::Internal(e.to_string()))?
        .map_err(|e| {
            info!("error getting file {:?}: {}", query.name, e);
            HttpError::NotFound("couldn't get file".into())
        })?;

    if file.size.is_none() {
        info!(
            "unknown size for file {:?}, boot will be VERY slow (can your Booter provide file sizes?)",
            query.name
        );
    }

    // Completion event, resolved up front so the producer thread
    // doesn't need the query.
    let done_event = query.kind.as_deref().and_then(|kind| {
        let mac = MacAddr6::from_str(query.mac.as_deref()?).ok()?;
        match kind {
            "kernel" => Some((mac, MachineState::Kernel, "Sent kernel")),
            "initrd" => Some((mac, MachineState::Initrd, "Sent initrd")),
            _ => None,
        }
    });

    let size = file.size;
    let events = state.events.clone();
    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, std::io::Error>>(8);
    tokio::task::spawn_blocking(move || {
        let mut reader = file.reader;
        let mut chunk = vec![0u8; 64 * 1024];
        loop {
            match reader.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    if tx
                        .blocking_send(Ok(Bytes::copy_from_slice(&chunk[..n])))
                        .is_err()
                    {
                        // Client went away; no event.
                        return;
                    }
                }
                Err(e) => {
                    let _ = tx.blocking_send(Err(e));
                    return;
                }
            }
        }
        if let Some((mac, st, msg)) = done_event {
            events.record(&mac, st, msg);
        }
    });

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "application/octet-stream");
    if let Some(size) = size {
        builder = builder.header(CONTENT_LENGTH, size);
    }
    builder
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .map_err(|e| HttpError::Internal(e.to_string()))
}

#[derive(Debug, Deserialize)]
struct BootingQuery {
    #[serde(default)]
    mac: Option<String>,
}

/// GET /_/booting?mac=… — a no-op script whose fetch marks the
/// kernel handoff; iPXE downloads and immediately discards it.
async fn handle_booting(
    State(state): State<Arc<HttpState>>,
    Query(query): Query<BootingQuery>,
) -> Response {
    if let Some(mac) = query.mac.as_deref().and_then(|m| MacAddr6::from_str(m).ok()) {
        state
            .events
            .record(&mac, MachineState::Booted, "Booting into OS");
    }
    ([(CONTENT_TYPE, "text/plain")], "# Booting").into_response()
}

/// GET /_/events — the machine-state ring, newest last.
async fn handle_events(State(state): State<Arc<HttpState>>) -> Response {
    Json(state.events.snapshot()).into_response()
}

/// GET /certs — the policy-backend configuration, for installers
/// that need the same credentials. Never logged: it carries keys.
async fn handle_certs(State(state): State<Arc<HttpState>>) -> Result<Response, HttpError> {
    let config = state
        .policy_config
        .as_ref()
        .ok_or_else(|| HttpError::NotFound("no policy configuration".into()))?;
    let js = serde_json::to_string_pretty(config)
        .map_err(|e| HttpError::Internal(e.to_string()))?;
    Ok(([(CONTENT_TYPE, "application/json")], js).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{BootFile, Spec};
    use crate::error::BooterError;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Booter returning canned specs/files keyed by MAC and id.
    struct FakeBooter {
        specs: Mutex<HashMap<String, Spec>>,
        files: Mutex<HashMap<String, Vec<u8>>>,
    }

    impl FakeBooter {
        fn new() -> Self {
            Self {
                specs: Mutex::new(HashMap::new()),
                files: Mutex::new(HashMap::new()),
            }
        }
    }

    impl Booter for FakeBooter {
        fn boot_spec(&self, m: &Machine) -> Result<Option<Spec>, BooterError> {
            Ok(self
                .specs
                .lock()
                .unwrap()
                .get(&crate::domain::mac_string(&m.mac))
                .cloned())
        }

        fn read_boot_file(&self, id: &FileId) -> Result<BootFile, BooterError> {
            self.files
                .lock()
                .unwrap()
                .get(id.as_str())
                .map(|bytes| BootFile::from_bytes(bytes.clone()))
                .ok_or_else(|| BooterError::InvalidSpec("unknown id".into()))
        }

        fn write_boot_file(
            &self,
            _: &FileId,
            _: Box<dyn Read + Send + 'static>,
        ) -> Result<(), BooterError> {
            Ok(())
        }
    }

    fn state(booter: FakeBooter) -> Arc<HttpState> {
        Arc::new(HttpState {
            booter: Arc::new(booter),
            events: Arc::new(EventLog::new()),
            policy_config: None,
        })
    }

    async fn body_string(resp: Response) -> String {
        let bytes = axum::body::to_bytes(resp.into_body(), 1 << 20).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn host() -> Host {
        Host("192.0.2.1:8080".to_string())
    }

    #[tokio::test]
    async fn ipxe_renders_script() {
        let booter = FakeBooter::new();
        booter.specs.lock().unwrap().insert(
            "aa:bb:cc:dd:ee:ff".into(),
            Spec {
                kernel: FileId::from("kid"),
                initrd: vec![],
                cmdline: "quiet".into(),
                message: String::new(),
                ipxe_script: None,
            },
        );
        let st = state(booter);

        let query = IpxeQuery {
            mac: "aa:bb:cc:dd:ee:ff".into(),
            arch: "0".into(),
        };
        let resp = handle_ipxe(State(st.clone()), host(), Query(query))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_string(resp).await;
        assert!(body.starts_with("#!ipxe\n"));
        assert!(body.contains("name=kid"));
        assert!(body.contains("http://192.0.2.1:8080/_/file"));

        let events = st.events.snapshot();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].state, MachineState::IpxeScript);
    }

    #[tokio::test]
    async fn ipxe_unknown_machine_is_404() {
        let query = IpxeQuery {
            mac: "aa:bb:cc:dd:ee:ff".into(),
            arch: "0".into(),
        };
        let err = handle_ipxe(State(state(FakeBooter::new())), host(), Query(query))
            .await
            .unwrap_err();
        assert!(matches!(err, HttpError::NotFound(_)));
    }

    #[tokio::test]
    async fn ipxe_rejects_bad_input() {
        let st = state(FakeBooter::new());

        let bad_mac = IpxeQuery {
            mac: "nonsense".into(),
            arch: "0".into(),
        };
        assert!(matches!(
            handle_ipxe(State(st.clone()), host(), Query(bad_mac)).await,
            Err(HttpError::BadRequest(_))
        ));

        let bad_arch = IpxeQuery {
            mac: "aa:bb:cc:dd:ee:ff".into(),
            arch: "9".into(),
        };
        assert!(matches!(
            handle_ipxe(State(st), host(), Query(bad_arch)).await,
            Err(HttpError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn file_streams_with_content_length() {
        let booter = FakeBooter::new();
        booter
            .files
            .lock()
            .unwrap()
            .insert("abc".into(), b"kernel bytes".to_vec());
        let st = state(booter);

        let query = FileQuery {
            name: "abc".into(),
            kind: Some("kernel".into()),
            mac: Some("aa:bb:cc:dd:ee:ff".into()),
        };
        let resp = handle_file(State(st.clone()), Query(query)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get(CONTENT_LENGTH).unwrap().to_str().unwrap(),
            "12"
        );
        assert_eq!(body_string(resp).await, "kernel bytes");

        // Reading to the end records the kernel event; the producer
        // thread races the body read, so give it a moment.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let events = st.events.snapshot();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].state, MachineState::Kernel);
    }

    #[tokio::test]
    async fn file_bad_id_is_opaque_404() {
        let query = FileQuery {
            name: "bogus".into(),
            kind: None,
            mac: None,
        };
        let err = handle_file(State(state(FakeBooter::new())), Query(query))
            .await
            .unwrap_err();
        assert!(matches!(err, HttpError::NotFound(_)));
    }

    #[tokio::test]
    async fn booting_marks_the_machine() {
        let st = state(FakeBooter::new());
        let resp = handle_booting(
            State(st.clone()),
            Query(BootingQuery {
                mac: Some("aa:bb:cc:dd:ee:ff".into()),
            }),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_string(resp).await, "# Booting");

        let events = st.events.snapshot();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].state, MachineState::Booted);
    }

    #[tokio::test]
    async fn certs_serves_policy_config() {
        let st = Arc::new(HttpState {
            booter: Arc::new(FakeBooter::new()),
            events: Arc::new(EventLog::new()),
            policy_config: Some(PolicyConfig {
                chain_api_url: "http://chainboot.example".into(),
                partition: "p1".into(),
                debug: true,
                ..PolicyConfig::default()
            }),
        });

        let resp = handle_certs(State(st)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_string(resp).await;
        let parsed: PolicyConfig = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed.chain_api_url, "http://chainboot.example");
        assert!(parsed.debug);
        assert_eq!(parsed.partition, "p1");
    }

    #[tokio::test]
    async fn certs_without_config_is_404() {
        let err = handle_certs(State(state(FakeBooter::new())))
            .await
            .unwrap_err();
        assert!(matches!(err, HttpError::NotFound(_)));
    }

    #[tokio::test]
    async fn events_endpoint_returns_ring() {
        let st = state(FakeBooter::new());
        st.events.record(
            &MacAddr6::new(1, 2, 3, 4, 5, 6),
            MachineState::ProxyDhcp,
            "Offering to boot",
        );
        let resp = handle_events(State(st)).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_string(resp).await;
        assert!(body.contains("proxy-dhcp"));
        assert!(body.contains("01:02:03:04:05:06"));
    }
}
