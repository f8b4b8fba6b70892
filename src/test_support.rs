//! Shared fixtures for unit tests.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use openssl::asn1::Asn1Time;
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::x509::X509;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsConnector;

use crate::ca::CertificateAuthority;
use crate::config::CaConfig;
use crate::dn;
use crate::provision::{provision_client, provision_server, ProvisionedIdentity};
use crate::server::{Server, ServerConfig};
use crate::tls::{ClientTlsConfig, RejectUntrusted, ServerTlsConfig};

pub const CA_PASSWORD: &str = "ca-secret";

/// Throwaway self-signed certificate for `subject`.
pub fn self_signed(subject: &str) -> (PKey<Private>, X509) {
    let key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();
    let name = dn::parse(subject).unwrap();

    let mut builder = X509::builder().unwrap();
    builder.set_version(2).unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_not_before(&Asn1Time::days_from_now(0).unwrap()).unwrap();
    builder.set_not_after(&Asn1Time::days_from_now(30).unwrap()).unwrap();
    builder.set_pubkey(&key).unwrap();
    builder.sign(&key, MessageDigest::sha256()).unwrap();

    (key, builder.build())
}

pub fn test_ca_config() -> CaConfig {
    CaConfig {
        key_bits: 2048,
        persist_serial: true,
        ..CaConfig::default()
    }
}

pub fn open_test_ca(dir: &Path) -> CertificateAuthority {
    CertificateAuthority::open(test_ca_config(), CA_PASSWORD, dir).unwrap()
}

/// A CA with one server and one client identity for `localhost`.
pub struct TestPki {
    pub dir: TempDir,
    pub ca: CertificateAuthority,
    pub server: ProvisionedIdentity,
    pub client: ProvisionedIdentity,
}

impl TestPki {
    pub fn identity_password(&self) -> &str {
        &self.ca.config().identity_password
    }
}

pub fn provision_test_pki() -> TestPki {
    let dir = tempfile::tempdir().unwrap();
    let ca_dir = dir.path().join("ca");
    let ca = open_test_ca(&ca_dir);

    let server_dir = dir.path().join("server");
    let client_dir = dir.path().join("client");
    let server = provision_server(&ca, "localhost", &server_dir).unwrap();
    let client = provision_client(&ca, "localhost", &client_dir, &ca_dir).unwrap();

    TestPki {
        dir,
        ca,
        server,
        client,
    }
}

/// Start a server for `pki` on an ephemeral port.
pub async fn spawn_server(pki: &TestPki, document_root: &Path, crl_files: &[PathBuf]) -> SocketAddr {
    let tls_config = ServerTlsConfig::from_keystore(
        &pki.server.keystore,
        pki.identity_password(),
        &pki.server.root_certificate,
        crl_files,
    )
    .unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Server::new(ServerConfig {
        bind_addr: addr,
        document_root: document_root.to_path_buf(),
        context_path: "/fileserver".to_string(),
        max_file_size: 1024 * 1024,
        max_connections: None,
        tls_config,
    });
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    addr
}

/// Send raw request bytes over mutual TLS and collect everything until EOF.
///
/// A server that drops a request closes without close_notify; that truncated
/// end counts as EOF here.
pub async fn raw_exchange(
    pki: &TestPki,
    addr: SocketAddr,
    request: &[u8],
    close_after_write: bool,
) -> std::io::Result<Vec<u8>> {
    let tls = ClientTlsConfig::new(
        Some((pki.client.keystore.as_path(), pki.identity_password())),
        &pki.client.root_certificate,
        "localhost",
        Arc::new(RejectUntrusted),
    )
    .unwrap();

    let tcp = TcpStream::connect(addr).await?;
    let mut stream = TlsConnector::from(tls.config)
        .connect(tls.server_name, tcp)
        .await?;
    stream.write_all(request).await?;
    stream.flush().await?;
    if close_after_write {
        stream.shutdown().await?;
    }

    let mut reply = Vec::new();
    let mut buffer = [0u8; 4096];
    loop {
        match stream.read(&mut buffer).await {
            Ok(0) => break,
            Ok(n) => reply.extend_from_slice(&buffer[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        }
    }
    Ok(reply)
}
