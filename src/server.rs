//! Secure File Server Module
//!
//! A mutual-TLS file server answering on a single context path. Each
//! accepted connection carries exactly one request and moves through:
//!
//! ```text
//! Accepted ─> Handshaking ─┬─> Authenticated ─> Dispatch ─> Completed
//!                          └─> HandshakeFailed
//! ```
//!
//! HTTP framing is hyper's `http1` server running on the TLS stream.
//!
//! ## Security Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    TLS Server                           │
//! │  ┌─────────────────────────────────────────────────────┐│
//! │  │              TLS Acceptor (rustls)                  ││
//! │  │  - Server certificate from the private CA           ││
//! │  │  - Client certificate required and verified         ││
//! │  │  - Optional revocation lists                        ││
//! │  └─────────────────────────────────────────────────────┘│
//! │                         │                               │
//! │  ┌─────────────────────────────────────────────────────┐│
//! │  │            Request Handler                          ││
//! │  │  - Context path and query parsing                   ││
//! │  │  - File name validation (no traversal)              ││
//! │  │  - Upload size limit                                ││
//! │  └─────────────────────────────────────────────────────┘│
//! │                         │                               │
//! │  ┌─────────────────────────────────────────────────────┐│
//! │  │              Document Root                          ││
//! │  └─────────────────────────────────────────────────────┘│
//! └─────────────────────────────────────────────────────────┘
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::TryStreamExt;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::header::{CONTENT_LENGTH, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use openssl::x509::X509;
use tempfile::TempPath;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_rustls::TlsAcceptor;
use tokio_util::io::ReaderStream;
use tracing::{debug, error, info, warn};

use crate::config::ServerSettings;
use crate::dn;
use crate::error::ProtocolError;
use crate::protocol::{
    content_length, text_response, Action, ResponseBody, TransferRequest, CHUNK_SIZE,
};
use crate::tls::ServerTlsConfig;

/// Read buffer cap; a request head larger than this gets 431
const MAX_BUF_SIZE: usize = 64 * 1024;

/// Name prefix of uploads still in flight
const STAGING_PREFIX: &str = ".pft-";

/// Server configuration
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,
    /// Directory files are served from and uploaded to
    pub document_root: PathBuf,
    /// The only request path answered, e.g. `/fileserver`
    pub context_path: String,
    /// Maximum upload size in bytes
    pub max_file_size: u64,
    /// Concurrent connection limit; `None` admits everyone
    pub max_connections: Option<usize>,
    /// TLS configuration
    pub tls_config: ServerTlsConfig,
}

impl ServerConfig {
    pub fn from_settings(settings: &ServerSettings, tls_config: ServerTlsConfig) -> Self {
        Self {
            bind_addr: settings.bind,
            document_root: settings.document_root.clone(),
            context_path: settings.context_path.clone(),
            max_file_size: settings.max_file_size,
            max_connections: settings.max_connections,
            tls_config,
        }
    }
}

/// Lifecycle of one connection, logged as it advances
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    Accepted,
    Handshaking,
    Authenticated,
    Dispatch,
    Completed,
    HandshakeFailed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Per-request settings shared by all connection tasks
struct Handler {
    document_root: PathBuf,
    context_path: String,
    max_file_size: u64,
}

/// Secure file transfer server
pub struct Server {
    config: ServerConfig,
    connection_semaphore: Option<Arc<Semaphore>>,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: ServerConfig) -> Self {
        let connection_semaphore = config
            .max_connections
            .map(|limit| Arc::new(Semaphore::new(limit)));
        Self {
            config,
            connection_semaphore,
        }
    }

    /// Bind the configured address and serve until the task is dropped
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr)
            .await
            .with_context(|| format!("Failed to bind to {}", self.config.bind_addr))?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        self.setup_document_root().await?;

        let local_addr = listener.local_addr().context("Listener has no local address")?;
        info!("🔒 Secure file server listening on {}", local_addr);
        info!(
            "📁 Serving {:?} at {}",
            self.config.document_root, self.config.context_path
        );

        let tls_acceptor = TlsAcceptor::from(self.config.tls_config.config.clone());
        let handler = Arc::new(Handler {
            document_root: self.config.document_root.clone(),
            context_path: self.config.context_path.clone(),
            max_file_size: self.config.max_file_size,
        });

        loop {
            // Accept new TCP connection
            let (tcp_stream, peer_addr) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    continue;
                }
            };

            // Acquire connection permit when a limit is configured
            let permit = match &self.connection_semaphore {
                Some(semaphore) => match semaphore.clone().try_acquire_owned() {
                    Ok(permit) => Some(permit),
                    Err(_) => {
                        warn!("Connection limit reached, rejecting {}", peer_addr);
                        continue;
                    }
                },
                None => None,
            };

            let tls_acceptor = tls_acceptor.clone();
            let handler = handler.clone();

            tokio::spawn(async move {
                let _permit = permit; // Keep permit alive

                match handler.handle_connection(tcp_stream, tls_acceptor, peer_addr).await {
                    Ok(()) => debug!("Connection from {} closed normally", peer_addr),
                    Err(e) => warn!("Connection from {} error: {:#}", peer_addr, e),
                }
            });
        }
    }

    /// Create the document root if it does not exist yet
    async fn setup_document_root(&self) -> Result<()> {
        let root = &self.config.document_root;
        if !root.exists() {
            fs::create_dir_all(root)
                .await
                .with_context(|| format!("Failed to create document root: {:?}", root))?;
            info!("Created document root: {:?}", root);
        }
        Ok(())
    }
}

impl Handler {
    /// Handle a single client connection
    async fn handle_connection(
        self: Arc<Self>,
        tcp_stream: TcpStream,
        tls_acceptor: TlsAcceptor,
        peer_addr: SocketAddr,
    ) -> Result<()> {
        let mut state = ConnectionState::Accepted;
        info!("📥 New connection from {}", peer_addr);

        advance(&mut state, ConnectionState::Handshaking, peer_addr);
        let tls_stream = match tls_acceptor.accept(tcp_stream).await {
            Ok(stream) => stream,
            Err(e) => {
                advance(&mut state, ConnectionState::HandshakeFailed, peer_addr);
                return Err(e).context("TLS handshake failed");
            }
        };

        advance(&mut state, ConnectionState::Authenticated, peer_addr);
        let peer = tls_stream
            .get_ref()
            .1
            .peer_certificates()
            .and_then(|certs| certs.first())
            .and_then(|der| X509::from_der(der.as_ref()).ok())
            .map(|cert| dn::format(cert.subject_name()))
            .unwrap_or_else(|| "<unknown>".to_string());
        info!("🔐 TLS handshake successful with {} ({})", peer_addr, peer);

        advance(&mut state, ConnectionState::Dispatch, peer_addr);
        let service = service_fn(move |request: Request<Incoming>| {
            let handler = self.clone();
            async move { handler.dispatch(request, peer_addr).await }
        });

        // One request per connection; hyper sends close_notify after the response
        let mut http = http1::Builder::new();
        http.keep_alive(false).max_buf_size(MAX_BUF_SIZE);
        let served = http
            .serve_connection(TokioIo::new(tls_stream), service)
            .await;

        advance(&mut state, ConnectionState::Completed, peer_addr);
        served.context("HTTP exchange failed")
    }

    /// Route one request. An `Err` closes the connection without a response.
    async fn dispatch(
        &self,
        request: Request<Incoming>,
        peer_addr: SocketAddr,
    ) -> Result<Response<ResponseBody>> {
        debug!(
            "Request from {}: {} {}",
            peer_addr,
            request.method(),
            request.uri()
        );

        if request.uri().path() != self.context_path {
            debug!("Path {} is outside {}", request.uri().path(), self.context_path);
            return Ok(text_response(StatusCode::NOT_FOUND, "Not found"));
        }

        let transfer = request
            .uri()
            .query()
            .ok_or(ProtocolError::MissingQuery)
            .and_then(TransferRequest::from_query);
        let transfer = match transfer {
            Ok(transfer) => transfer,
            Err(ProtocolError::InvalidFileName { name, reason }) => {
                warn!("Refusing file name {:?} from {}: {}", name, peer_addr, reason);
                return Ok(text_response(StatusCode::BAD_REQUEST, "Invalid file name"));
            }
            Err(e) => {
                warn!("Ignoring request from {}: {}", peer_addr, e);
                return Err(e.into());
            }
        };

        match transfer.action {
            Action::Download => self.handle_download(&transfer.file_name).await,
            Action::Upload => self.handle_upload(request, &transfer.file_name).await,
        }
    }

    /// Handle file download
    async fn handle_download(&self, file_name: &str) -> Result<Response<ResponseBody>> {
        let file_path = self.document_root.join(file_name);

        let metadata = match fs::metadata(&file_path).await {
            Ok(m) if m.is_file() => m,
            _ => {
                debug!("Download of missing file {}", file_name);
                return Ok(text_response(StatusCode::NOT_FOUND, "File not found"));
            }
        };
        let file_size = metadata.len();

        let file = File::open(&file_path)
            .await
            .with_context(|| format!("Failed to open {:?}", file_path))?;

        info!("📥 Sending file: {} ({} bytes)", file_name, file_size);
        let chunks = ReaderStream::with_capacity(file, CHUNK_SIZE).map_ok(Frame::data);
        let response = Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_LENGTH, file_size)
            .body(StreamBody::new(chunks).boxed_unsync())?;
        Ok(response)
    }

    /// Handle file upload.
    ///
    /// The body is staged next to its destination and renamed over it only
    /// once every promised byte has arrived, so an aborted upload leaves any
    /// earlier file of that name untouched.
    async fn handle_upload(
        &self,
        request: Request<Incoming>,
        file_name: &str,
    ) -> Result<Response<ResponseBody>> {
        let size = match content_length(request.headers()) {
            Ok(Some(size)) => size,
            Ok(None) | Err(_) => {
                warn!("Upload of {} without a usable Content-Length", file_name);
                return Ok(text_response(StatusCode::BAD_REQUEST, "Content-Length required"));
            }
        };

        // Check file size
        if size > self.max_file_size {
            warn!(
                "Upload of {} refused: {} bytes (max: {})",
                file_name, size, self.max_file_size
            );
            return Ok(text_response(StatusCode::PAYLOAD_TOO_LARGE, "File too large"));
        }

        let file_path = self.document_root.join(file_name);
        let directory = file_path.parent().unwrap_or(self.document_root.as_path());
        fs::create_dir_all(directory)
            .await
            .with_context(|| format!("Failed to create directory {:?}", directory))?;

        info!(
            "📤 Receiving file: {} ({} bytes, type {})",
            file_name,
            size,
            request
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("unknown")
        );

        let (staged, staged_path) = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .suffix(".part")
            .tempfile_in(directory)
            .with_context(|| format!("Failed to stage upload in {:?}", directory))?
            .into_parts();
        let mut staged = File::from_std(staged);

        let received = receive_body(request.into_body(), &mut staged, size).await;
        drop(staged);
        if let Err(e) = received {
            discard(staged_path);
            return Err(e.context(format!("upload of {} aborted", file_name)));
        }

        staged_path
            .persist(&file_path)
            .with_context(|| format!("Failed to move upload into {:?}", file_path))?;

        info!("✅ File received: {} ({} bytes)", file_name, size);
        Ok(text_response(StatusCode::OK, "Upload complete"))
    }
}

/// Copy the request body into `file`, failing unless exactly `size` bytes arrive
async fn receive_body(mut body: Incoming, file: &mut File, size: u64) -> Result<()> {
    let mut received: u64 = 0;
    while let Some(frame) = body.frame().await {
        let frame = frame
            .with_context(|| format!("body ended after {} of {} bytes", received, size))?;
        if let Ok(data) = frame.into_data() {
            file.write_all(&data).await?;
            received += data.len() as u64;
        }
    }
    if received != size {
        anyhow::bail!("body ended after {} of {} bytes", received, size);
    }
    file.flush().await?;
    Ok(())
}

fn discard(staged: TempPath) {
    let shown = staged.display().to_string();
    if let Err(e) = staged.close() {
        warn!("⚠️ Failed to remove staged upload {}: {}", shown, e);
    }
}

fn advance(state: &mut ConnectionState, next: ConnectionState, peer_addr: SocketAddr) {
    debug!("{}: {} -> {}", peer_addr, state, next);
    *state = next;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{provision_test_pki, raw_exchange, spawn_server, TestPki};
    use std::path::Path;
    use std::time::Duration;

    async fn exchange(pki: &TestPki, addr: SocketAddr, request: &[u8]) -> String {
        let reply = raw_exchange(pki, addr, request, false).await.unwrap();
        String::from_utf8_lossy(&reply).into_owned()
    }

    fn staged_leftovers(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with(STAGING_PREFIX))
            .collect()
    }

    #[tokio::test]
    async fn test_download_existing_and_missing() {
        let pki = provision_test_pki();
        let root = pki.dir.path().join("docs");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("hello.txt"), b"hello, world").unwrap();
        let addr = spawn_server(&pki, &root, &[]).await;

        let reply = exchange(
            &pki,
            addr,
            b"GET /fileserver?download=hello.txt HTTP/1.1\r\nHost: localhost\r\n\r\n",
        )
        .await;
        assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(reply.to_ascii_lowercase().contains("content-length: 12\r\n"));
        assert!(reply.ends_with("\r\n\r\nhello, world"));

        let reply = exchange(
            &pki,
            addr,
            b"GET /fileserver?download=nope.txt HTTP/1.1\r\nHost: localhost\r\n\r\n",
        )
        .await;
        assert!(reply.starts_with("HTTP/1.1 404 "));
    }

    #[tokio::test]
    async fn test_upload_sends_exactly_one_response() {
        let pki = provision_test_pki();
        let root = pki.dir.path().join("docs");
        let addr = spawn_server(&pki, &root, &[]).await;

        let reply = exchange(
            &pki,
            addr,
            b"POST /fileserver?upload=up.txt HTTP/1.1\r\nHost: localhost\r\nContent-Type: txt\r\nContent-Length: 5\r\n\r\nabcde",
        )
        .await;
        assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"));
        assert_eq!(reply.matches("HTTP/1.1 ").count(), 1);
        assert_eq!(std::fs::read(root.join("up.txt")).unwrap(), b"abcde");
        assert!(staged_leftovers(&root).is_empty());
    }

    #[tokio::test]
    async fn test_upload_into_subdirectory_replaces_existing_file() {
        let pki = provision_test_pki();
        let root = pki.dir.path().join("docs");
        std::fs::create_dir_all(root.join("reports")).unwrap();
        std::fs::write(root.join("reports/q1.txt"), b"old contents").unwrap();
        let addr = spawn_server(&pki, &root, &[]).await;

        let reply = exchange(
            &pki,
            addr,
            b"POST /fileserver?upload=reports%2Fq1.txt HTTP/1.1\r\nHost: localhost\r\nContent-Length: 5\r\n\r\nfresh",
        )
        .await;
        assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"));
        assert_eq!(std::fs::read(root.join("reports/q1.txt")).unwrap(), b"fresh");
        assert!(staged_leftovers(&root.join("reports")).is_empty());
    }

    #[tokio::test]
    async fn test_upload_error_statuses() {
        let pki = provision_test_pki();
        let root = pki.dir.path().join("docs");
        let addr = spawn_server(&pki, &root, &[]).await;

        let no_length = exchange(
            &pki,
            addr,
            b"POST /fileserver?upload=a.txt HTTP/1.1\r\nHost: localhost\r\n\r\n",
        )
        .await;
        assert!(no_length.starts_with("HTTP/1.1 400 "));
        assert_eq!(no_length.matches("HTTP/1.1 ").count(), 1);

        let too_large = exchange(
            &pki,
            addr,
            b"POST /fileserver?upload=big.bin HTTP/1.1\r\nHost: localhost\r\nContent-Length: 99999999999\r\n\r\n",
        )
        .await;
        assert!(too_large.starts_with("HTTP/1.1 413 "));
        assert!(!root.join("big.bin").exists());

        let traversal = exchange(
            &pki,
            addr,
            b"POST /fileserver?upload=..%2Fescape.txt HTTP/1.1\r\nHost: localhost\r\nContent-Length: 1\r\n\r\nx",
        )
        .await;
        assert!(traversal.starts_with("HTTP/1.1 400 "));
        assert!(!pki.dir.path().join("escape.txt").exists());

        let hidden = exchange(
            &pki,
            addr,
            b"POST /fileserver?upload=.pft-x.part HTTP/1.1\r\nHost: localhost\r\nContent-Length: 1\r\n\r\nx",
        )
        .await;
        assert!(hidden.starts_with("HTTP/1.1 400 "));
    }

    #[tokio::test]
    async fn test_short_upload_body_is_discarded() {
        let pki = provision_test_pki();
        let root = pki.dir.path().join("docs");
        let addr = spawn_server(&pki, &root, &[]).await;

        // closing our side ends the body early
        let reply = raw_exchange(
            &pki,
            addr,
            b"POST /fileserver?upload=short.txt HTTP/1.1\r\nHost: localhost\r\nContent-Length: 10\r\n\r\nabc",
            true,
        )
        .await
        .unwrap();
        assert!(reply.is_empty());
        assert!(!root.join("short.txt").exists());
        assert!(staged_leftovers(&root).is_empty());
    }

    #[tokio::test]
    async fn test_aborted_upload_keeps_existing_file() {
        let pki = provision_test_pki();
        let root = pki.dir.path().join("docs");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("keep.txt"), b"original contents").unwrap();
        let addr = spawn_server(&pki, &root, &[]).await;

        let reply = raw_exchange(
            &pki,
            addr,
            b"POST /fileserver?upload=keep.txt HTTP/1.1\r\nHost: localhost\r\nContent-Length: 10\r\n\r\nabc",
            true,
        )
        .await
        .unwrap();
        assert!(reply.is_empty());
        assert_eq!(
            std::fs::read(root.join("keep.txt")).unwrap(),
            b"original contents"
        );
        assert!(staged_leftovers(&root).is_empty());
    }

    #[tokio::test]
    async fn test_unknown_action_and_path() {
        let pki = provision_test_pki();
        let root = pki.dir.path().join("docs");
        let addr = spawn_server(&pki, &root, &[]).await;

        let unknown = exchange(
            &pki,
            addr,
            b"GET /fileserver?delete=a.txt HTTP/1.1\r\nHost: localhost\r\n\r\n",
        )
        .await;
        assert!(unknown.is_empty());

        let no_query = exchange(&pki, addr, b"GET /fileserver HTTP/1.1\r\nHost: localhost\r\n\r\n").await;
        assert!(no_query.is_empty());

        let elsewhere = exchange(
            &pki,
            addr,
            b"GET /other?download=a.txt HTTP/1.1\r\nHost: localhost\r\n\r\n",
        )
        .await;
        assert!(elsewhere.starts_with("HTTP/1.1 404 "));
    }

    #[tokio::test]
    async fn test_malformed_request_head() {
        let pki = provision_test_pki();
        let root = pki.dir.path().join("docs");
        let addr = spawn_server(&pki, &root, &[]).await;

        let garbage = exchange(&pki, addr, b"NOT AN HTTP REQUEST\r\n\r\n").await;
        assert!(garbage.starts_with("HTTP/1.1 400 "));
    }

    #[tokio::test]
    async fn test_oversized_request_head_is_cut_off() {
        let pki = provision_test_pki();
        let root = pki.dir.path().join("docs");
        let addr = spawn_server(&pki, &root, &[]).await;

        let mut request = b"GET /fileserver?download=a.txt HTTP/1.1\r\nX-Padding: ".to_vec();
        request.extend(std::iter::repeat(b'a').take(2 * MAX_BUF_SIZE));
        request.extend_from_slice(b"\r\n\r\n");

        // the server stops reading instead of buffering the whole line
        let outcome = tokio::time::timeout(
            Duration::from_secs(10),
            raw_exchange(&pki, addr, &request, false),
        )
        .await
        .expect("server kept reading an unbounded request head");
        if let Ok(reply) = outcome {
            let reply = String::from_utf8_lossy(&reply);
            assert!(reply.is_empty() || reply.starts_with("HTTP/1.1 431 "));
        }
    }

    #[tokio::test]
    async fn test_document_root_created_on_start() {
        let pki = provision_test_pki();
        let root = pki.dir.path().join("fresh").join("docs");
        let addr = spawn_server(&pki, &root, &[]).await;

        // one exchange guarantees the accept loop is running
        exchange(&pki, addr, b"GET /fileserver HTTP/1.1\r\n\r\n").await;
        assert!(root.is_dir());
    }
}
