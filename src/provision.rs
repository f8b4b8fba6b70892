//! Server and client identity provisioning.
//!
//! Each identity gets a fresh key pair and a leaf certificate from the CA,
//! then lands on disk as:
//!
//! ```text
//! <dir>/kssrv.p12    identity keystore (cert + key, alias = host name)
//! <dir>/srv.cer      leaf certificate, PEM
//! <dir>/ca.cer       root certificate, PEM
//! <dir>/srv.p7b      single-certificate PKCS#7 path
//! ```
//!
//! (client file names are `ksclient.p12`, `client.cer` and `client.p7b`).
//! The exported path is validated against the exported root before
//! returning. A failing step leaves whatever was already written in place.

use std::fs;
use std::path::{Path, PathBuf};

use openssl::pkey::{PKey, Private};
use openssl::x509::X509;
use tracing::info;

use crate::ca::CertificateAuthority;
use crate::certpath::{build_path, export_path, PathEncoding};
use crate::dn;
use crate::error::{KeystoreError, ProvisionStep, ProvisioningError, ValidationError};
use crate::keystore::{Keystore, KeystoreEntry};
use crate::validator::ChainValidator;

/// Files produced for one provisioned identity.
#[derive(Debug, Clone)]
pub struct ProvisionedIdentity {
    pub host_name: String,
    pub keystore: PathBuf,
    pub certificate: PathBuf,
    pub root_certificate: PathBuf,
    pub path: PathBuf,
    /// Copy of the CA keystore (client identities only)
    pub ca_keystore: Option<PathBuf>,
}

struct IdentityFiles<'a> {
    keystore: &'a str,
    certificate: &'a str,
    path: &'a str,
}

/// Provision a server identity for `host_name` into `output_dir`.
pub fn provision_server(
    ca: &CertificateAuthority,
    host_name: &str,
    output_dir: &Path,
) -> Result<ProvisionedIdentity, ProvisioningError> {
    let layout = &ca.config().layout;
    let files = IdentityFiles {
        keystore: &layout.server_keystore,
        certificate: &layout.server_certificate,
        path: &layout.server_path,
    };
    let identity = provision_identity(ca, host_name, output_dir, &files)?;
    info!("🔐 Server identity for {} provisioned in {:?}", host_name, output_dir);
    Ok(identity)
}

/// Provision a client identity into `client_dir`.
///
/// The CA keystore found in `server_dir` is copied next to the client
/// identity so both ends trust the same root.
pub fn provision_client(
    ca: &CertificateAuthority,
    host_name: &str,
    client_dir: &Path,
    server_dir: &Path,
) -> Result<ProvisionedIdentity, ProvisioningError> {
    let layout = &ca.config().layout;
    let files = IdentityFiles {
        keystore: &layout.client_keystore,
        certificate: &layout.client_certificate,
        path: &layout.client_path,
    };
    let mut identity = provision_identity(ca, host_name, client_dir, &files)?;

    let ca_file = &ca.config().keystore_file;
    let source = server_dir.join(ca_file);
    let destination = client_dir.join(ca_file);
    fs::copy(&source, &destination).map_err(ProvisioningError::at(ProvisionStep::CopyTrustStore))?;
    identity.ca_keystore = Some(destination);

    info!("🔐 Client identity for {} provisioned in {:?}", host_name, client_dir);
    Ok(identity)
}

fn provision_identity(
    ca: &CertificateAuthority,
    host_name: &str,
    dir: &Path,
    files: &IdentityFiles<'_>,
) -> Result<ProvisionedIdentity, ProvisioningError> {
    let config = ca.config();

    let key = ca
        .generate_key_pair()
        .map_err(ProvisioningError::at(ProvisionStep::GenerateKey))?;

    let subject = dn::leaf_subject(host_name, &config.leaf_dn_suffix);
    let cert = ca
        .issue_leaf(&subject, host_name, &key)
        .map_err(ProvisioningError::at(ProvisionStep::IssueCertificate))?;

    let keystore_path = dir.join(files.keystore);
    write_identity(ca, host_name, &keystore_path, &cert, &key)
        .map_err(ProvisioningError::at(ProvisionStep::WriteKeystore))?;

    let certificate_path = dir.join(files.certificate);
    CertificateAuthority::export_certificate(&cert, &certificate_path)
        .map_err(ProvisioningError::at(ProvisionStep::ExportCertificate))?;

    let root_path = dir.join(&config.layout.root_certificate);
    CertificateAuthority::export_certificate(ca.root_certificate(), &root_path)
        .map_err(ProvisioningError::at(ProvisionStep::ExportRootCertificate))?;

    let path_file = dir.join(files.path);
    build_path(&[cert], PathEncoding::Pkcs7)
        .and_then(|encoded| export_path(&encoded, &path_file))
        .map_err(ProvisioningError::at(ProvisionStep::ExportPath))?;

    self_check(&root_path, &path_file, &key).map_err(ProvisioningError::at(ProvisionStep::SelfCheck))?;

    Ok(ProvisionedIdentity {
        host_name: host_name.to_string(),
        keystore: keystore_path,
        certificate: certificate_path,
        root_certificate: root_path,
        path: path_file,
        ca_keystore: None,
    })
}

fn write_identity(
    ca: &CertificateAuthority,
    alias: &str,
    path: &Path,
    cert: &X509,
    key: &PKey<Private>,
) -> Result<(), KeystoreError> {
    let config = ca.config();
    let keystore = Keystore::of_type(&config.keystore_type)?;
    let entry = KeystoreEntry::new(alias, cert.clone())
        .with_private_key(key.clone())
        .with_chain(vec![ca.root_certificate().clone()]);
    keystore.write(path, &entry, &config.identity_password)
}

fn self_check(root: &Path, path_file: &Path, key: &PKey<Private>) -> Result<(), ValidationError> {
    let validator = ChainValidator::from_files(&[root], &[])?;
    let public = validator.validate_file(path_file, PathEncoding::Pkcs7)?;
    if !public.public_eq(key) {
        return Err(ValidationError::Decode(
            "validated path returned a different public key".to_string(),
        ));
    }
    Ok(())
}
