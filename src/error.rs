//! Error taxonomy shared by the CA, the validator and the transfer layers.
//!
//! Each layer fails fast with its own typed error. Application edges (the CLI,
//! the accept loop, TLS configuration loading) wrap these in `anyhow`.

use std::io;
use std::path::PathBuf;

use openssl::error::ErrorStack;
use thiserror::Error;

/// Loading, unlocking or writing a password-protected keystore failed.
#[derive(Error, Debug)]
pub enum KeystoreError {
    #[error("failed to read keystore {path:?}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("failed to write keystore {path:?}: {source}")]
    Write { path: PathBuf, source: io::Error },

    #[error("cannot unlock keystore {path:?}: wrong password or corrupt file")]
    Unlock { path: PathBuf, source: ErrorStack },

    #[error("keystore {path:?} has no {missing} entry")]
    MissingEntry { path: PathBuf, missing: &'static str },

    #[error("unsupported keystore type: {0}")]
    UnsupportedType(String),

    #[error("failed to generate the root identity: {0}")]
    RootGeneration(#[from] SigningError),

    #[error("keystore encoding failed: {0}")]
    Encoding(ErrorStack),
}

/// Building or signing a certificate (or a revocation list) failed.
#[derive(Error, Debug)]
pub enum SigningError {
    #[error("invalid distinguished name {name:?}: {reason}")]
    InvalidName { name: String, reason: String },

    #[error("certificate construction failed: {0}")]
    Build(#[from] ErrorStack),

    #[error("serial number state could not be persisted: {0}")]
    Serial(#[source] io::Error),

    #[error("revocation list construction failed: {0}")]
    Crl(#[from] rcgen::Error),

    #[error("cannot build an empty certification path")]
    EmptyPath,

    #[error("failed to export {path:?}: {source}")]
    Export { path: PathBuf, source: io::Error },
}

/// A certification path did not validate.
///
/// Variants keep chain, signature, expiry and revocation causes apart so
/// callers can tell them apart without string matching.
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("failed to load {path:?}: {reason}")]
    Load { path: PathBuf, reason: String },

    #[error("cannot decode certification path: {0}")]
    Decode(String),

    #[error("malformed DER in certification path: {0}")]
    Der(#[from] yasna::ASN1Error),

    #[error("certification path is empty")]
    EmptyPath,

    #[error("no trust anchor for {subject}: {reason}")]
    Untrusted { subject: String, reason: String },

    #[error("bad signature on {subject}: {reason}")]
    Signature { subject: String, reason: String },

    #[error("certificate {subject} has expired")]
    Expired { subject: String },

    #[error("certificate {subject} is not yet valid")]
    NotYetValid { subject: String },

    #[error("certificate {subject} (serial {serial}) has been revoked")]
    Revoked { subject: String, serial: String },

    #[error("revocation status of {subject} unknown: {reason}")]
    RevocationUnknown { subject: String, reason: String },

    #[error("path validation failed for {subject}: {reason} (code {code})")]
    Other {
        subject: String,
        code: i32,
        reason: String,
    },

    #[error("crypto backend error: {0}")]
    Backend(#[from] ErrorStack),
}

/// The availability probe (TCP connect plus TLS handshake) failed.
#[derive(Error, Debug)]
pub enum UnreachableError {
    #[error("invalid server url {0:?}")]
    InvalidUrl(String),

    #[error("cannot connect to {addr}: {source}")]
    Connect { addr: String, source: io::Error },

    #[error("connection to {addr} timed out")]
    Timeout { addr: String },

    #[error("TLS handshake with {addr} failed: {source}")]
    Handshake { addr: String, source: io::Error },

    #[error("certificate presented by {addr} was rejected")]
    CertificateRejected { addr: String },
}

/// I/O or protocol failure while a transfer was in flight.
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("source file {0:?} does not exist or is not a regular file")]
    SourceMissing(PathBuf),

    #[error("server answered with status {0}")]
    Status(u16),

    #[error("connection closed after {received} of {expected} bytes")]
    Truncated { received: u64, expected: u64 },

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("cannot build request: {0}")]
    Request(#[from] hyper::http::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Malformed or unrecognized request/response on the wire.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("invalid message format: {0}")]
    InvalidFormat(String),

    #[error("unknown action {0:?}")]
    UnknownAction(String),

    #[error("request carries no query")]
    MissingQuery,

    #[error("invalid file name {name:?}: {reason}")]
    InvalidFileName {
        name: String,
        #[source]
        reason: FileNameError,
    },
}

/// Why a requested file name cannot be mapped under the document root.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FileNameError {
    #[error("name is empty")]
    Empty,

    #[error("name is not valid percent-encoded UTF-8")]
    Encoding,

    #[error("name is longer than {0} bytes")]
    TooLong(usize),

    #[error("name contains a control character")]
    ControlCharacter,

    #[error("name is absolute")]
    Absolute,

    #[error("name has an empty path segment")]
    EmptySegment,

    #[error("name steps outside the document root")]
    Traversal,

    #[error("segment {0:?} is hidden")]
    Hidden(String),
}

/// Step of identity provisioning, reported when one of them fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionStep {
    GenerateKey,
    IssueCertificate,
    WriteKeystore,
    ExportCertificate,
    ExportRootCertificate,
    ExportPath,
    SelfCheck,
    CopyTrustStore,
}

impl std::fmt::Display for ProvisionStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let step = match self {
            Self::GenerateKey => "generate key pair",
            Self::IssueCertificate => "issue certificate",
            Self::WriteKeystore => "write identity keystore",
            Self::ExportCertificate => "export certificate",
            Self::ExportRootCertificate => "export root certificate",
            Self::ExportPath => "export certification path",
            Self::SelfCheck => "validate certification path",
            Self::CopyTrustStore => "copy CA keystore",
        };
        f.write_str(step)
    }
}

#[derive(Error, Debug)]
#[error("provisioning failed at step '{step}': {source}")]
pub struct ProvisioningError {
    pub step: ProvisionStep,
    #[source]
    pub source: Box<dyn std::error::Error + Send + Sync + 'static>,
}

impl ProvisioningError {
    pub(crate) fn at<E>(step: ProvisionStep) -> impl FnOnce(E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        move |e| Self {
            step,
            source: Box::new(e),
        }
    }
}
