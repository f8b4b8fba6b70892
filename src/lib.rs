//! PKI File Transfer
//!
//! Mutual-TLS file transfer backed by a private certificate authority.
//!
//! ## Features
//! - Self-signed root CA persisted in a PKCS#12 keystore
//! - Server and client identity provisioning signed by that root
//! - Certification paths as PKCS#7, PkiPath or PEM, with chain validation
//!   and optional CRL revocation checks
//! - Upload and download over TLS with client certificate authentication
//! - Interactive trust decisions for server certificates that fail verification
//!
//! ## Usage
//!
//! ```bash
//! # Create the CA and provision both identities
//! pft ca init --dir ./pki/ca
//! pft ca provision-server localhost --out ./pki/server
//! pft ca provision-client localhost --out ./pki/client
//!
//! # Start server
//! pft server --config pft.toml
//!
//! # Upload and download
//! pft upload report.pdf
//! pft download report.pdf --dest ./downloads
//! ```

pub mod ca;
pub mod certpath;
pub mod client;
pub mod config;
pub mod dn;
pub mod error;
pub mod keystore;
pub mod protocol;
pub mod provision;
pub mod serial;
pub mod server;
pub mod tls;
pub mod validator;

#[cfg(test)]
mod test_support;

pub use ca::CertificateAuthority;
pub use certpath::PathEncoding;
pub use client::{Client, ClientConfig, TransferEvent, TransferHandle, TransferObserver, TransferOutcome};
pub use config::AppConfig;
pub use server::{Server, ServerConfig};
pub use tls::{ClientTlsConfig, PeerIdentity, RejectUntrusted, ServerTlsConfig, TrustDecision};
pub use validator::ChainValidator;
