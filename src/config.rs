//! Configuration for the CA, the server and the client.
//!
//! Every constant the CA and the transfer endpoints depend on (root DN,
//! passwords, validity periods, key size, digest, file layout) lives here so
//! nothing is baked into the code paths. All sections are optional in the TOML
//! file and fall back to the defaults below.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use openssl::hash::MessageDigest;
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub ca: CaConfig,
    pub server: ServerSettings,
    pub client: ClientSettings,
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let config_str = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config: AppConfig =
            toml::from_str(&config_str).context("Failed to parse config file")?;

        Ok(config)
    }
}

/// Digest used when the CA signs certificates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignatureDigest {
    Sha256,
    Sha384,
    Sha512,
}

impl SignatureDigest {
    pub fn message_digest(self) -> MessageDigest {
        match self {
            Self::Sha256 => MessageDigest::sha256(),
            Self::Sha384 => MessageDigest::sha384(),
            Self::Sha512 => MessageDigest::sha512(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CaConfig {
    /// Subject (and issuer) of the self-signed root
    pub root_dn: String,
    /// Alias of the root entry inside the CA keystore
    pub root_alias: String,
    /// File name of the CA keystore inside the store location
    pub keystore_file: String,
    /// Type tag written to and expected from every keystore
    pub keystore_type: String,
    /// Password protecting the CA keystore
    pub keystore_password: String,
    /// Password protecting provisioned server/client keystores
    pub identity_password: String,
    pub key_bits: u32,
    pub digest: SignatureDigest,
    pub root_validity_days: u32,
    pub leaf_validity_days: u32,
    pub crl_validity_days: u32,
    /// Appended after `CN=<host>` for provisioned identities
    pub leaf_dn_suffix: String,
    /// Keep the serial high-water mark on disk across restarts
    pub persist_serial: bool,
    pub serial_file: String,
    pub layout: ProvisioningLayout,
}

impl Default for CaConfig {
    fn default() -> Self {
        Self {
            root_dn: "CN=RootCA, OU=M2, O=miage, L=Mulhouse, ST=68093, C=FR".to_string(),
            root_alias: "rootca".to_string(),
            keystore_file: "ksca.p12".to_string(),
            keystore_type: "PKCS12".to_string(),
            keystore_password: "changeit".to_string(),
            identity_password: "changeit".to_string(),
            key_bits: 2048,
            digest: SignatureDigest::Sha256,
            root_validity_days: 3650,
            leaf_validity_days: 730,
            crl_validity_days: 30,
            leaf_dn_suffix: "OU=FST, O=UHA, L=Mulhouse, ST=68093, C=FR".to_string(),
            persist_serial: true,
            serial_file: "serial".to_string(),
            layout: ProvisioningLayout::default(),
        }
    }
}

/// File names written by server and client provisioning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProvisioningLayout {
    pub root_certificate: String,
    pub server_keystore: String,
    pub server_certificate: String,
    pub server_path: String,
    pub client_keystore: String,
    pub client_certificate: String,
    pub client_path: String,
}

impl Default for ProvisioningLayout {
    fn default() -> Self {
        Self {
            root_certificate: "ca.cer".to_string(),
            server_keystore: "kssrv.p12".to_string(),
            server_certificate: "srv.cer".to_string(),
            server_path: "srv.p7b".to_string(),
            client_keystore: "ksclient.p12".to_string(),
            client_certificate: "client.cer".to_string(),
            client_path: "client.p7b".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub bind: SocketAddr,
    pub document_root: PathBuf,
    /// The single path requests are answered on
    pub context_path: String,
    /// Largest accepted upload, in bytes
    pub max_file_size: u64,
    /// Admission limit; `None` accepts every connection
    pub max_connections: Option<usize>,
    /// Server identity keystore (certificate + key)
    pub keystore: PathBuf,
    /// PEM file holding the trusted roots
    pub trust_store: PathBuf,
    /// Revocation lists enforced during the client handshake
    pub crl_files: Vec<PathBuf>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 7878)),
            document_root: PathBuf::from("fileserver"),
            context_path: "/fileserver".to_string(),
            max_file_size: 1024 * 1024 * 1024,
            max_connections: None,
            keystore: PathBuf::from("certs/server/kssrv.p12"),
            trust_store: PathBuf::from("certs/server/ca.cer"),
            crl_files: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    /// Base URL of the server's context path
    pub server_url: String,
    pub connect_timeout_secs: u64,
    pub keystore: PathBuf,
    pub trust_store: PathBuf,
}

impl ClientSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: "https://localhost:7878/fileserver".to_string(),
            connect_timeout_secs: 5,
            keystore: PathBuf::from("certs/client/ksclient.p12"),
            trust_store: PathBuf::from("certs/client/ca.cer"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_sections_missing() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.ca.key_bits, 2048);
        assert_eq!(config.ca.digest, SignatureDigest::Sha256);
        assert_eq!(config.server.context_path, "/fileserver");
        assert!(config.server.max_connections.is_none());
    }

    #[test]
    fn test_partial_override() {
        let config: AppConfig = toml::from_str(
            r#"
            [ca]
            root_dn = "CN=Test Root, O=Example"
            digest = "sha512"
            leaf_validity_days = 30

            [server]
            bind = "0.0.0.0:9443"
            max_connections = 8
            "#,
        )
        .unwrap();

        assert_eq!(config.ca.root_dn, "CN=Test Root, O=Example");
        assert_eq!(config.ca.digest, SignatureDigest::Sha512);
        assert_eq!(config.ca.leaf_validity_days, 30);
        assert_eq!(config.ca.root_validity_days, 3650);
        assert_eq!(config.server.bind.port(), 9443);
        assert_eq!(config.server.max_connections, Some(8));
        assert_eq!(config.client.connect_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_from_file_missing() {
        assert!(AppConfig::from_file(Path::new("/nonexistent/pft.toml")).is_err());
    }
}
