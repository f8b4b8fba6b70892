//! TLS Configuration Module
//!
//! Both ends load their identity from a PKCS#12 keystore issued by the
//! private CA, and trust exactly the anchors found in a PEM trust store.
//!
//! ```text
//!        Client                                   Server
//!  ksclient.p12 ──> client cert ────────────> WebPkiClientVerifier
//!                                               (ca.cer [+ CRLs])
//!  DecidingVerifier <──────────── server cert <── kssrv.p12
//!    ├─ WebPkiServerVerifier (ca.cer)
//!    └─ on failure: TrustDecision (default: reject)
//! ```
//!
//! Client certificates are mandatory: a peer without one never gets past the
//! handshake. Revocation lists, when configured, are enforced by the server
//! for every certificate below the anchor.
//!
//! Both configurations pin the `ring` provider explicitly instead of relying
//! on a process-wide default.

use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use openssl::x509::X509;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::ring;
use rustls::pki_types::{
    CertificateDer, CertificateRevocationListDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName,
    UnixTime,
};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use rustls_pemfile::{certs, crls};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::config::{ClientSettings, ServerSettings};
use crate::dn;
use crate::keystore::Keystore;

/// TLS configuration for the server
pub struct ServerTlsConfig {
    pub config: Arc<ServerConfig>,
}

/// TLS configuration for the client
pub struct ClientTlsConfig {
    pub config: Arc<ClientConfig>,
    pub server_name: ServerName<'static>,
}

/// What the client knows about a server certificate the automatic check refused.
#[derive(Debug, Clone)]
pub struct PeerIdentity {
    pub subject: String,
    /// SHA-256 of the DER certificate, colon-separated uppercase hex
    pub fingerprint: String,
    pub reason: String,
}

/// Last word on a server certificate that failed automatic verification.
///
/// Called synchronously from inside the handshake.
pub trait TrustDecision: Send + Sync {
    fn accept(&self, peer: &PeerIdentity) -> bool;
}

/// Refuses every certificate the automatic check refused.
#[derive(Debug, Clone, Copy, Default)]
pub struct RejectUntrusted;

impl TrustDecision for RejectUntrusted {
    fn accept(&self, peer: &PeerIdentity) -> bool {
        debug!("Rejecting {} ({})", peer.subject, peer.reason);
        false
    }
}

impl<F> TrustDecision for F
where
    F: Fn(&PeerIdentity) -> bool + Send + Sync,
{
    fn accept(&self, peer: &PeerIdentity) -> bool {
        self(peer)
    }
}

impl ServerTlsConfig {
    /// Build a mutual-TLS server configuration.
    ///
    /// # Arguments
    /// * `keystore` - PKCS#12 file holding the server certificate and key
    /// * `password` - keystore password
    /// * `trust_store` - PEM file with the CA certificate(s) client certificates must chain to
    /// * `crl_files` - revocation lists (PEM or DER); empty disables revocation checks
    pub fn from_keystore(
        keystore: &Path,
        password: &str,
        trust_store: &Path,
        crl_files: &[PathBuf],
    ) -> Result<Self> {
        let (chain, key) = load_identity(keystore, password)?;
        let roots = load_root_store(trust_store)?;
        let provider = Arc::new(ring::default_provider());

        let mut verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider.clone());
        if !crl_files.is_empty() {
            let mut lists = Vec::new();
            for path in crl_files {
                lists.extend(load_crls(path)?);
            }
            info!("Enforcing {} revocation list(s) on client certificates", lists.len());
            verifier = verifier.with_crls(lists);
        }
        let verifier = verifier
            .build()
            .context("Failed to build client certificate verifier")?;

        let config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .context("Unsupported TLS protocol versions")?
            .with_client_cert_verifier(verifier)
            .with_single_cert(chain, key)
            .context("Failed to build server TLS config")?;

        Ok(Self {
            config: Arc::new(config),
        })
    }

    pub fn from_settings(settings: &ServerSettings, password: &str) -> Result<Self> {
        Self::from_keystore(
            &settings.keystore,
            password,
            &settings.trust_store,
            &settings.crl_files,
        )
    }
}

impl ClientTlsConfig {
    /// Build a client configuration for `server_name`.
    ///
    /// `identity` is the client keystore and its password. Without it the
    /// client offers no certificate and mutual-TLS servers will refuse it.
    pub fn new(
        identity: Option<(&Path, &str)>,
        trust_store: &Path,
        server_name: &str,
        decision: Arc<dyn TrustDecision>,
    ) -> Result<Self> {
        let roots = load_root_store(trust_store)?;
        let provider = Arc::new(ring::default_provider());

        let automatic = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider.clone())
            .build()
            .context("Failed to build server certificate verifier")?;
        let verifier = Arc::new(DecidingVerifier {
            automatic,
            decision,
        });

        let builder = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .context("Unsupported TLS protocol versions")?
            .dangerous()
            .with_custom_certificate_verifier(verifier);

        let config = match identity {
            Some((keystore, password)) => {
                let (chain, key) = load_identity(keystore, password)?;
                builder
                    .with_client_auth_cert(chain, key)
                    .context("Failed to attach client certificate")?
            }
            None => {
                warn!("No client keystore configured, connecting without a certificate");
                builder.with_no_client_auth()
            }
        };

        let server_name = ServerName::try_from(server_name.to_owned())
            .context("Invalid server name for TLS")?;

        Ok(Self {
            config: Arc::new(config),
            server_name,
        })
    }

    pub fn from_settings(
        settings: &ClientSettings,
        password: &str,
        server_name: &str,
        decision: Arc<dyn TrustDecision>,
    ) -> Result<Self> {
        Self::new(
            Some((settings.keystore.as_path(), password)),
            &settings.trust_store,
            server_name,
            decision,
        )
    }
}

/// Runs the WebPKI check first and defers to a [`TrustDecision`] when it fails.
struct DecidingVerifier {
    automatic: Arc<WebPkiServerVerifier>,
    decision: Arc<dyn TrustDecision>,
}

impl fmt::Debug for DecidingVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecidingVerifier").finish_non_exhaustive()
    }
}

impl ServerCertVerifier for DecidingVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        match self.automatic.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        ) {
            Ok(verified) => Ok(verified),
            Err(err) => {
                let peer = PeerIdentity {
                    subject: subject_of(end_entity),
                    fingerprint: fingerprint(end_entity.as_ref()),
                    reason: err.to_string(),
                };
                if self.decision.accept(&peer) {
                    warn!("⚠️  Accepted {} ({}) despite: {}", peer.subject, peer.fingerprint, peer.reason);
                    Ok(ServerCertVerified::assertion())
                } else {
                    Err(err)
                }
            }
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.automatic.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.automatic.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.automatic.supported_verify_schemes()
    }
}

/// Colon-separated uppercase SHA-256 fingerprint of a DER certificate.
pub fn fingerprint(der: &[u8]) -> String {
    let digest = Sha256::digest(der);
    digest
        .iter()
        .map(|b| hex::encode_upper([*b]))
        .collect::<Vec<_>>()
        .join(":")
}

fn subject_of(der: &CertificateDer<'_>) -> String {
    X509::from_der(der.as_ref())
        .map(|cert| dn::format(cert.subject_name()))
        .unwrap_or_else(|_| "<unparseable certificate>".to_string())
}

/// True when a handshake failed because this side refused the peer certificate.
pub fn is_certificate_error(err: &io::Error) -> bool {
    err.get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>())
        .map(|e| matches!(e, rustls::Error::InvalidCertificate(_)))
        .unwrap_or(false)
}

/// Certificate chain and PKCS#8 key from a PKCS#12 identity keystore
fn load_identity(
    path: &Path,
    password: &str,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let (entry, key) = Keystore::default()
        .read_identity(path, password)
        .with_context(|| format!("Failed to load identity keystore: {:?}", path))?;

    let chain = entry
        .certificates()
        .map(|cert| cert.to_der().map(CertificateDer::from))
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to encode certificate chain")?;
    let key = key
        .private_key_to_pkcs8()
        .context("Failed to encode private key")?;

    info!(
        "Loaded identity '{}' ({} certificate(s)) from {:?}",
        entry.alias,
        chain.len(),
        path
    );
    Ok((chain, PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key))))
}

fn load_root_store(path: &Path) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots
            .add(cert)
            .context("Failed to add CA certificate to root store")?;
    }
    debug!("Loaded {} trust anchor(s) from {:?}", roots.len(), path);
    Ok(roots)
}

/// Load certificates from a PEM file
fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open certificate file: {:?}", path))?;
    let mut reader = BufReader::new(file);

    let certs: Vec<CertificateDer<'static>> = certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to parse certificates")?;

    if certs.is_empty() {
        anyhow::bail!("No certificates found in {:?}", path);
    }

    Ok(certs)
}

/// Load revocation lists from a PEM or DER file
fn load_crls(path: &Path) -> Result<Vec<CertificateRevocationListDer<'static>>> {
    let bytes = fs::read(path).with_context(|| format!("Failed to read CRL file: {:?}", path))?;

    if !bytes.starts_with(b"-----BEGIN") {
        return Ok(vec![CertificateRevocationListDer::from(bytes)]);
    }

    let lists = crls(&mut BufReader::new(bytes.as_slice()))
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to parse revocation lists")?;
    if lists.is_empty() {
        anyhow::bail!("No revocation lists found in {:?}", path);
    }
    Ok(lists)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca::CertificateAuthority;
    use crate::test_support::{provision_test_pki, self_signed};

    #[test]
    fn test_server_config_from_provisioned_keystore() {
        let pki = provision_test_pki();
        let config = ServerTlsConfig::from_keystore(
            &pki.server.keystore,
            pki.identity_password(),
            &pki.server.root_certificate,
            &[],
        );
        assert!(config.is_ok());
    }

    #[test]
    fn test_server_config_with_crl() {
        let pki = provision_test_pki();
        let crl_path = pki.dir.path().join("ca.crl");
        CertificateAuthority::export_crl(&pki.ca.issue_crl(&[]).unwrap(), &crl_path).unwrap();

        let config = ServerTlsConfig::from_keystore(
            &pki.server.keystore,
            pki.identity_password(),
            &pki.server.root_certificate,
            &[crl_path],
        );
        assert!(config.is_ok());
    }

    #[test]
    fn test_server_config_wrong_password() {
        let pki = provision_test_pki();
        let result = ServerTlsConfig::from_keystore(
            &pki.server.keystore,
            "wrong",
            &pki.server.root_certificate,
            &[],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_client_config_with_and_without_identity() {
        let pki = provision_test_pki();
        let with_identity = ClientTlsConfig::new(
            Some((pki.client.keystore.as_path(), pki.identity_password())),
            &pki.client.root_certificate,
            "localhost",
            Arc::new(RejectUntrusted),
        );
        assert!(with_identity.is_ok());

        let anonymous = ClientTlsConfig::new(
            None,
            &pki.client.root_certificate,
            "localhost",
            Arc::new(RejectUntrusted),
        );
        assert!(anonymous.is_ok());
    }

    #[test]
    fn test_fingerprint_format() {
        let (_, cert) = self_signed("CN=fingerprint");
        let der = cert.to_der().unwrap();
        let fp = fingerprint(&der);

        assert_eq!(fp.len(), 32 * 3 - 1);
        assert_eq!(fp.split(':').count(), 32);
        assert_eq!(fp.replace(':', ""), hex::encode_upper(Sha256::digest(&der)));
    }

    #[test]
    fn test_closure_trust_decision() {
        let accept_local: Arc<dyn TrustDecision> =
            Arc::new(|peer: &PeerIdentity| peer.subject.starts_with("CN=localhost"));
        let peer = PeerIdentity {
            subject: "CN=localhost, O=UHA".to_string(),
            fingerprint: String::new(),
            reason: "unknown issuer".to_string(),
        };
        assert!(accept_local.accept(&peer));
        assert!(!RejectUntrusted.accept(&peer));
    }
}
