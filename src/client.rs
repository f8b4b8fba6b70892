//! Secure File Transfer Client Module
//!
//! Each transfer runs on its own tokio task and reports through a
//! [`TransferObserver`]; the caller keeps a [`TransferHandle`] to await the
//! terminal [`TransferOutcome`] or cancel the task.
//!
//! ```text
//!  download(url, dir) / upload(url, file)
//!        │
//!        ▼
//!  connect: TCP + TLS handshake, bounded by connect_timeout
//!        │        └── failure ──> ServerDown / CertificateRejected
//!        ▼
//!  hyper http1 request (+ body for uploads, Progress events per chunk)
//!        │
//!        ▼
//!  response ── 200 ──> body / Completed
//!            └─ other ─> NotFound (download) / Failed (upload)
//! ```
//!
//! Downloads land in a hidden staging file in the destination directory and
//! are renamed into place only when the whole body has arrived.
//!
//! A server certificate the automatic check refuses can still be accepted by
//! the configured [`TrustDecision`](crate::tls::TrustDecision).

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use http_body_util::{BodyExt, Empty, StreamBody};
use hyper::body::{Body, Frame, Incoming};
use hyper::client::conn::http1;
use hyper::header::{CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, HOST};
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::ClientSettings;
use crate::error::{ProtocolError, TransferError, UnreachableError};
use crate::protocol::{content_length, content_type_for, Action, TransferRequest, CHUNK_SIZE};
use crate::tls::{self, ClientTlsConfig};

/// Client configuration
pub struct ClientConfig {
    /// Bound on TCP connect and on the TLS handshake, each
    pub connect_timeout: Duration,
    /// TLS configuration
    pub tls_config: ClientTlsConfig,
}

impl ClientConfig {
    pub fn from_settings(settings: &ClientSettings, tls_config: ClientTlsConfig) -> Self {
        Self {
            connect_timeout: settings.connect_timeout(),
            tls_config,
        }
    }
}

/// Progress and completion notifications of one transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    /// The server accepted the transfer; `total` is the byte count when known
    Started { file_name: String, total: u64 },
    Progress {
        transferred: u64,
        total: u64,
        percent: u8,
    },
    Finished(TransferOutcome),
}

/// Terminal state of a transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    Completed { bytes: u64, path: PathBuf },
    NotFound,
    ServerDown { reason: String },
    CertificateRejected,
    DestinationRequired,
    Failed { reason: String },
    Cancelled,
}

impl TransferOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

impl fmt::Display for TransferOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed { bytes, path } => write!(f, "completed: {} bytes ({:?})", bytes, path),
            Self::NotFound => f.write_str("file does not exist on server"),
            Self::ServerDown { reason } => write!(f, "server down ({})", reason),
            Self::CertificateRejected => f.write_str("certificate rejected"),
            Self::DestinationRequired => f.write_str("destination required"),
            Self::Failed { reason } => write!(f, "transfer failed: {}", reason),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Sink for [`TransferEvent`]s, called from the transfer task
pub trait TransferObserver: Send + Sync + 'static {
    fn on_event(&self, event: TransferEvent);
}

impl TransferObserver for mpsc::UnboundedSender<TransferEvent> {
    fn on_event(&self, event: TransferEvent) {
        // receiver gone means nobody is listening
        let _ = self.send(event);
    }
}

/// Observer that drops every event
#[derive(Debug, Clone, Copy, Default)]
pub struct Silent;

impl TransferObserver for Silent {
    fn on_event(&self, _event: TransferEvent) {}
}

/// Handle on a running transfer
pub struct TransferHandle {
    task: JoinHandle<TransferOutcome>,
    observer: Arc<dyn TransferObserver>,
}

impl TransferHandle {
    /// Wait for the terminal outcome.
    ///
    /// A cancelled transfer is reported to the observer here, since the
    /// aborted task cannot report it itself.
    pub async fn wait(self) -> TransferOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) if e.is_cancelled() => {
                self.observer.on_event(TransferEvent::Finished(TransferOutcome::Cancelled));
                TransferOutcome::Cancelled
            }
            Err(e) => {
                let outcome = TransferOutcome::Failed {
                    reason: format!("transfer task panicked: {}", e),
                };
                self.observer.on_event(TransferEvent::Finished(outcome.clone()));
                outcome
            }
        }
    }

    /// Abort the transfer task. A partly received download is discarded.
    pub fn cancel(&self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Where a transfer URL points
#[derive(Debug, Clone)]
struct Target {
    host: String,
    port: u16,
    /// Path plus query, as sent on the request line
    request_target: String,
    request: TransferRequest,
}

impl Target {
    fn parse(url: &str) -> Result<Self, UnreachableError> {
        let invalid = || UnreachableError::InvalidUrl(url.to_string());
        let parsed = Url::parse(url).map_err(|_| invalid())?;

        let host = parsed.host_str().ok_or_else(invalid)?.to_string();
        let port = parsed.port_or_known_default().ok_or_else(invalid)?;
        let query = parsed.query().ok_or_else(invalid)?;
        let request = TransferRequest::from_query(query).map_err(|_| invalid())?;

        Ok(Self {
            host,
            port,
            request_target: format!("{}?{}", parsed.path(), query),
            request,
        })
    }

    fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

struct ClientInner {
    connector: TlsConnector,
    server_name: rustls::pki_types::ServerName<'static>,
    connect_timeout: Duration,
}

/// Secure file transfer client
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Create a new client instance
    pub fn new(config: ClientConfig) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                connector: TlsConnector::from(config.tls_config.config),
                server_name: config.tls_config.server_name,
                connect_timeout: config.connect_timeout,
            }),
        }
    }

    /// Check that the server at `url` accepts a TLS connection.
    pub async fn probe(&self, url: &str) -> Result<(), UnreachableError> {
        let target = Target::parse(url)?;
        let mut stream = self.inner.connect(&target).await?;
        let _ = stream.shutdown().await;
        Ok(())
    }

    /// Download the file named by `url` into `destination_dir`.
    pub fn download<O>(&self, url: &str, destination_dir: &Path, observer: O) -> TransferHandle
    where
        O: TransferObserver,
    {
        let inner = self.inner.clone();
        let url = url.to_string();
        let destination_dir = destination_dir.to_path_buf();
        spawn_transfer(Arc::new(observer), move |observer| async move {
            inner.download(&url, &destination_dir, observer.as_ref()).await
        })
    }

    /// Upload `source_file` to the location named by `url`.
    pub fn upload<O>(&self, url: &str, source_file: &Path, observer: O) -> TransferHandle
    where
        O: TransferObserver,
    {
        let inner = self.inner.clone();
        let url = url.to_string();
        let source_file = source_file.to_path_buf();
        spawn_transfer(Arc::new(observer), move |observer| async move {
            inner.upload(&url, &source_file, observer).await
        })
    }
}

fn spawn_transfer<F, Fut>(observer: Arc<dyn TransferObserver>, run: F) -> TransferHandle
where
    F: FnOnce(Arc<dyn TransferObserver>) -> Fut,
    Fut: std::future::Future<Output = TransferOutcome> + Send + 'static,
{
    let task_observer = observer.clone();
    let fut = run(observer.clone());
    let task = tokio::spawn(async move {
        let outcome = fut.await;
        task_observer.on_event(TransferEvent::Finished(outcome.clone()));
        outcome
    });
    TransferHandle { task, observer }
}

impl ClientInner {
    /// TCP connect and TLS handshake, each bounded by the connect timeout
    async fn connect(&self, target: &Target) -> Result<TlsStream<TcpStream>, UnreachableError> {
        let addr = target.addr();
        info!("🔗 Connecting to {}...", addr);

        let tcp_stream = match timeout(
            self.connect_timeout,
            TcpStream::connect((target.host.as_str(), target.port)),
        )
        .await
        {
            Err(_) => return Err(UnreachableError::Timeout { addr }),
            Ok(Err(source)) => return Err(UnreachableError::Connect { addr, source }),
            Ok(Ok(stream)) => stream,
        };
        debug!("TCP connection established");

        let tls_stream = match timeout(
            self.connect_timeout,
            self.connector.connect(self.server_name.clone(), tcp_stream),
        )
        .await
        {
            Err(_) => return Err(UnreachableError::Timeout { addr }),
            Ok(Err(source)) if tls::is_certificate_error(&source) => {
                return Err(UnreachableError::CertificateRejected { addr })
            }
            Ok(Err(source)) => return Err(UnreachableError::Handshake { addr, source }),
            Ok(Ok(stream)) => stream,
        };

        info!("🔐 TLS connection established");
        let (_, conn_info) = tls_stream.get_ref();
        if let Some(protocol) = conn_info.protocol_version() {
            debug!("  Protocol: {:?}", protocol);
        }
        if let Some(cipher) = conn_info.negotiated_cipher_suite() {
            debug!("  Cipher: {:?}", cipher.suite());
        }

        Ok(tls_stream)
    }

    async fn connect_for_transfer(
        &self,
        target: &Target,
    ) -> Result<TlsStream<TcpStream>, TransferOutcome> {
        self.connect(target).await.map_err(|e| match e {
            UnreachableError::CertificateRejected { .. } => {
                warn!("Server certificate rejected");
                TransferOutcome::CertificateRejected
            }
            e => {
                warn!("Server down: {}", e);
                TransferOutcome::ServerDown {
                    reason: e.to_string(),
                }
            }
        })
    }

    async fn download(
        &self,
        url: &str,
        destination_dir: &Path,
        observer: &dyn TransferObserver,
    ) -> TransferOutcome {
        if destination_dir.as_os_str().is_empty() {
            return TransferOutcome::DestinationRequired;
        }
        let target = match parse_for(url, Action::Download) {
            Ok(target) => target,
            Err(outcome) => return outcome,
        };
        let stream = match self.connect_for_transfer(&target).await {
            Ok(stream) => stream,
            Err(outcome) => return outcome,
        };

        // Keep the last path component; the server's layout is not mirrored
        let local_name = Path::new(&target.request.file_name)
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| target.request.file_name.clone().into());
        let local_path = destination_dir.join(local_name);

        match receive_file(stream, &target, destination_dir, &local_path, observer).await {
            Ok(Some(bytes)) => {
                info!("✅ Download complete: {} bytes -> {:?}", bytes, local_path);
                TransferOutcome::Completed {
                    bytes,
                    path: local_path,
                }
            }
            Ok(None) => TransferOutcome::NotFound,
            Err(e) => TransferOutcome::Failed {
                reason: e.to_string(),
            },
        }
    }

    async fn upload(
        &self,
        url: &str,
        source_file: &Path,
        observer: Arc<dyn TransferObserver>,
    ) -> TransferOutcome {
        let target = match parse_for(url, Action::Upload) {
            Ok(target) => target,
            Err(outcome) => return outcome,
        };

        let content = match read_source(source_file).await {
            Ok(content) => Bytes::from(content),
            Err(e) => {
                return TransferOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        };

        let stream = match self.connect_for_transfer(&target).await {
            Ok(stream) => stream,
            Err(outcome) => return outcome,
        };

        let bytes = content.len() as u64;
        match send_file(stream, &target, source_file, content, observer).await {
            Ok(()) => {
                info!("✅ Upload complete: {} bytes transferred", bytes);
                TransferOutcome::Completed {
                    bytes,
                    path: source_file.to_path_buf(),
                }
            }
            Err(e) => TransferOutcome::Failed {
                reason: e.to_string(),
            },
        }
    }
}

fn parse_for(url: &str, action: Action) -> Result<Target, TransferOutcome> {
    let target = Target::parse(url).map_err(|e| TransferOutcome::Failed {
        reason: e.to_string(),
    })?;
    if target.request.action != action {
        return Err(TransferOutcome::Failed {
            reason: format!("url {:?} is not a {} request", url, action),
        });
    }
    Ok(target)
}

async fn read_source(path: &Path) -> Result<Vec<u8>, TransferError> {
    match fs::metadata(path).await {
        Ok(metadata) if metadata.is_file() => Ok(fs::read(path).await?),
        _ => Err(TransferError::SourceMissing(path.to_path_buf())),
    }
}

fn percent(transferred: u64, total: u64) -> u8 {
    if total == 0 {
        100
    } else {
        (transferred.min(total) * 100 / total) as u8
    }
}

/// Run one HTTP/1.1 exchange over an established TLS stream
async fn exchange<B>(
    stream: TlsStream<TcpStream>,
    request: Request<B>,
) -> Result<Response<Incoming>, TransferError>
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let (mut sender, connection) = http1::handshake(TokioIo::new(stream)).await?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            debug!("Connection closed: {}", e);
        }
    });
    Ok(sender.send_request(request).await?)
}

/// Send the download request and stream a 200 body into `local_path`.
///
/// `Ok(None)` means the server answered with anything but success. On any
/// error the staging file is removed and `local_path` is left as it was.
async fn receive_file(
    stream: TlsStream<TcpStream>,
    target: &Target,
    destination_dir: &Path,
    local_path: &Path,
    observer: &dyn TransferObserver,
) -> Result<Option<u64>, TransferError> {
    let request = Request::builder()
        .method(Action::Download.method())
        .uri(target.request_target.as_str())
        .header(HOST, target.addr())
        .header(CONNECTION, "close")
        .body(Empty::<Bytes>::new())?;

    let response = exchange(stream, request).await?;
    if response.status() != StatusCode::OK {
        debug!("Download refused with status {}", response.status());
        return Ok(None);
    }
    let total = content_length(response.headers())?
        .ok_or_else(|| ProtocolError::InvalidFormat("response without Content-Length".to_string()))?;

    fs::create_dir_all(destination_dir).await?;
    let (staged, staged_path) = tempfile::Builder::new()
        .prefix(".pft-")
        .suffix(".part")
        .tempfile_in(destination_dir)?
        .into_parts();
    let mut file = File::from_std(staged);

    observer.on_event(TransferEvent::Started {
        file_name: target.request.file_name.clone(),
        total,
    });

    let mut body = response.into_body();
    let mut received: u64 = 0;
    while let Some(frame) = body.frame().await {
        if let Ok(data) = frame?.into_data() {
            file.write_all(&data).await?;
            received += data.len() as u64;
            observer.on_event(TransferEvent::Progress {
                transferred: received,
                total,
                percent: percent(received, total),
            });
        }
    }
    if received != total {
        return Err(TransferError::Truncated {
            received,
            expected: total,
        });
    }
    file.flush().await?;
    drop(file);

    staged_path.persist(local_path).map_err(|e| e.error)?;

    if total == 0 {
        observer.on_event(TransferEvent::Progress {
            transferred: 0,
            total: 0,
            percent: 100,
        });
    }
    Ok(Some(received))
}

/// Send the upload request with `content` as body and check the reply.
async fn send_file(
    stream: TlsStream<TcpStream>,
    target: &Target,
    source_file: &Path,
    content: Bytes,
    observer: Arc<dyn TransferObserver>,
) -> Result<(), TransferError> {
    let total = content.len() as u64;
    let chunks: Vec<Bytes> = (0..content.len())
        .step_by(CHUNK_SIZE)
        .map(|start| content.slice(start..(start + CHUNK_SIZE).min(content.len())))
        .collect();

    // Progress is reported as hyper pulls each chunk for writing
    let progress = observer.clone();
    let mut sent: u64 = 0;
    let frames = futures_util::stream::iter(chunks).map(move |chunk| {
        sent += chunk.len() as u64;
        progress.on_event(TransferEvent::Progress {
            transferred: sent,
            total,
            percent: percent(sent, total),
        });
        Ok::<_, io::Error>(Frame::data(chunk))
    });

    let request = Request::builder()
        .method(Action::Upload.method())
        .uri(target.request_target.as_str())
        .header(HOST, target.addr())
        .header(CONNECTION, "close")
        .header(CONTENT_LENGTH, total)
        .header(CONTENT_TYPE, content_type_for(source_file))
        .body(StreamBody::new(frames))?;

    observer.on_event(TransferEvent::Started {
        file_name: target.request.file_name.clone(),
        total,
    });

    let response = exchange(stream, request).await?;
    if total == 0 {
        observer.on_event(TransferEvent::Progress {
            transferred: 0,
            total: 0,
            percent: 100,
        });
    }
    if response.status() != StatusCode::OK {
        return Err(TransferError::Status(response.status().as_u16()));
    }
    Ok(())
}
