//! Password-protected keystores.
//!
//! One keystore file backs one identity: the root CA, a server or a client.
//! Each holds a single entry (alias, certificate, optional chain, optional
//! private key) encoded as PKCS#12.

use std::fs;
use std::path::Path;
use std::str::FromStr;

use openssl::pkcs12::Pkcs12;
use openssl::pkey::{PKey, Private};
use openssl::stack::Stack;
use openssl::x509::X509;
use tracing::{debug, info};

use crate::error::KeystoreError;

/// Keystore encodings understood by this crate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum KeystoreType {
    #[default]
    Pkcs12,
}

impl FromStr for KeystoreType {
    type Err = KeystoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PKCS12" | "P12" | "PFX" => Ok(Self::Pkcs12),
            _ => Err(KeystoreError::UnsupportedType(s.to_string())),
        }
    }
}

/// The single entry stored in a keystore.
pub struct KeystoreEntry {
    pub alias: String,
    pub certificate: X509,
    /// Certificates above `certificate`, nearest issuer first
    pub chain: Vec<X509>,
    pub private_key: Option<PKey<Private>>,
}

impl KeystoreEntry {
    pub fn new(alias: impl Into<String>, certificate: X509) -> Self {
        Self {
            alias: alias.into(),
            certificate,
            chain: Vec::new(),
            private_key: None,
        }
    }

    pub fn with_private_key(mut self, key: PKey<Private>) -> Self {
        self.private_key = Some(key);
        self
    }

    pub fn with_chain(mut self, chain: Vec<X509>) -> Self {
        self.chain = chain;
        self
    }

    /// All certificates of the entry, the entry's own certificate first.
    pub fn certificates(&self) -> impl Iterator<Item = &X509> {
        std::iter::once(&self.certificate).chain(self.chain.iter())
    }
}

/// Reads and writes keystore files.
#[derive(Debug, Clone, Copy, Default)]
pub struct Keystore {
    kind: KeystoreType,
}

impl Keystore {
    pub fn new(kind: KeystoreType) -> Self {
        Self { kind }
    }

    /// Keystore handler for a type tag such as `"PKCS12"`.
    pub fn of_type(tag: &str) -> Result<Self, KeystoreError> {
        Ok(Self::new(tag.parse()?))
    }

    pub fn kind(&self) -> KeystoreType {
        self.kind
    }

    /// Write `entry` to `path`, replacing any existing file.
    pub fn write(
        &self,
        path: &Path,
        entry: &KeystoreEntry,
        password: &str,
    ) -> Result<(), KeystoreError> {
        let KeystoreType::Pkcs12 = self.kind;

        let mut builder = Pkcs12::builder();
        builder.name(&entry.alias);
        builder.cert(&entry.certificate);
        if let Some(key) = &entry.private_key {
            builder.pkey(key);
        }
        if !entry.chain.is_empty() {
            let mut stack = Stack::new().map_err(KeystoreError::Encoding)?;
            for cert in &entry.chain {
                stack.push(cert.clone()).map_err(KeystoreError::Encoding)?;
            }
            builder.ca(stack);
        }

        let der = builder
            .build2(password)
            .and_then(|p12| p12.to_der())
            .map_err(KeystoreError::Encoding)?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| KeystoreError::Write {
                path: path.to_path_buf(),
                source,
            })?;
        }
        fs::write(path, der).map_err(|source| KeystoreError::Write {
            path: path.to_path_buf(),
            source,
        })?;

        // Owner-only when the entry carries key material
        #[cfg(unix)]
        if entry.private_key.is_some() {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|source| {
                KeystoreError::Write {
                    path: path.to_path_buf(),
                    source,
                }
            })?;
        }

        info!("Saved keystore entry '{}' to {:?}", entry.alias, path);
        Ok(())
    }

    /// Read and unlock the entry stored at `path`.
    pub fn read(&self, path: &Path, password: &str) -> Result<KeystoreEntry, KeystoreError> {
        let KeystoreType::Pkcs12 = self.kind;

        let der = fs::read(path).map_err(|source| KeystoreError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let parsed = Pkcs12::from_der(&der)
            .and_then(|p12| p12.parse2(password))
            .map_err(|source| KeystoreError::Unlock {
                path: path.to_path_buf(),
                source,
            })?;

        let mut chain: Vec<X509> = parsed
            .ca
            .map(|stack| stack.into_iter().collect())
            .unwrap_or_default();

        // Without a key PKCS12_parse files every certificate under `ca`
        let certificate = match parsed.cert {
            Some(cert) => cert,
            None if !chain.is_empty() => chain.remove(0),
            None => {
                return Err(KeystoreError::MissingEntry {
                    path: path.to_path_buf(),
                    missing: "certificate",
                })
            }
        };

        let alias = certificate
            .alias()
            .map(|a| String::from_utf8_lossy(a).into_owned())
            .unwrap_or_default();

        debug!("Loaded keystore entry '{}' from {:?}", alias, path);

        Ok(KeystoreEntry {
            alias,
            certificate,
            chain,
            private_key: parsed.pkey,
        })
    }

    /// Read an entry that must carry a private key.
    pub fn read_identity(
        &self,
        path: &Path,
        password: &str,
    ) -> Result<(KeystoreEntry, PKey<Private>), KeystoreError> {
        let mut entry = self.read(path, password)?;
        let key = entry.private_key.take().ok_or(KeystoreError::MissingEntry {
            path: path.to_path_buf(),
            missing: "private key",
        })?;
        Ok((entry, key))
    }
}
