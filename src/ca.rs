//! Private Certificate Authority
//!
//! The CA owns a self-signed RSA root and issues leaf certificates for server
//! and client identities. Its key material lives in a password-protected
//! keystore inside the store location; the first `open` on an empty location
//! generates and persists a fresh root.
//!
//! # Certificate Profiles
//!
//! | | Root | Leaf |
//! |---|---|---|
//! | Serial | 1 | from the [`SerialAllocator`] |
//! | Basic Constraints | critical, CA, no path length limit | absent |
//! | Key Usage | digitalSignature, nonRepudiation, cRLSign, keyCertSign | keyAgreement, keyEncipherment, digitalSignature |
//! | Subject Alt Name | absent | DNS name |
//! | Subject Key Identifier | yes | yes |
//!
//! Validity periods, key size and signature digest come from [`CaConfig`].

use std::fs;
use std::path::{Path, PathBuf};

use openssl::asn1::{Asn1Integer, Asn1Time};
use openssl::bn::BigNum;
use openssl::pkey::{HasPublic, PKey, PKeyRef, Private};
use openssl::rsa::Rsa;
use openssl::x509::extension::{
    BasicConstraints, KeyUsage, SubjectAlternativeName, SubjectKeyIdentifier,
};
use openssl::x509::{X509, X509Ref};
use rcgen::{
    CertificateParams, CertificateRevocationListParams, KeyIdMethod, RevokedCertParams,
    SerialNumber,
};
use rustls::pki_types::CertificateDer;
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::config::CaConfig;
use crate::dn;
use crate::error::{KeystoreError, SigningError};
use crate::keystore::{Keystore, KeystoreEntry};
use crate::serial::{SerialAllocator, ROOT_SERIAL};

const X509_VERSION_3: i32 = 2; // X509 version 3 is represented by 2

pub struct CertificateAuthority {
    config: CaConfig,
    root_cert: X509,
    root_key: PKey<Private>,
    serials: SerialAllocator,
    keystore_path: PathBuf,
}

impl CertificateAuthority {
    /// Load the CA from `store_location`, or create it there.
    ///
    /// The keystore file name comes from `config.keystore_file`. A wrong
    /// password or a corrupt keystore fails; nothing is regenerated over an
    /// existing file.
    pub fn open(
        config: CaConfig,
        password: &str,
        store_location: &Path,
    ) -> Result<Self, KeystoreError> {
        let keystore = Keystore::of_type(&config.keystore_type)?;
        let keystore_path = store_location.join(&config.keystore_file);

        let (root_cert, root_key) = if keystore_path.exists() {
            let (entry, key) = keystore.read_identity(&keystore_path, password)?;
            info!(
                "Loaded root CA {} from {:?}",
                dn::format(entry.certificate.subject_name()),
                keystore_path
            );
            (entry.certificate, key)
        } else {
            let (cert, key) = Self::install(&config, &keystore, &keystore_path, password)?;
            info!(
                "Created root CA {} in {:?}",
                dn::format(cert.subject_name()),
                keystore_path
            );
            (cert, key)
        };

        let serials = if config.persist_serial {
            let serial_path = store_location.join(&config.serial_file);
            SerialAllocator::persistent(&serial_path).map_err(|source| KeystoreError::Read {
                path: serial_path,
                source,
            })?
        } else {
            SerialAllocator::new()
        };

        Ok(Self {
            config,
            root_cert,
            root_key,
            serials,
            keystore_path,
        })
    }

    /// Generate the root identity and persist it.
    fn install(
        config: &CaConfig,
        keystore: &Keystore,
        path: &Path,
        password: &str,
    ) -> Result<(X509, PKey<Private>), KeystoreError> {
        let key = generate_rsa_key(config.key_bits)?;
        let cert = build_root_certificate(config, &key)?;

        let entry = KeystoreEntry::new(&config.root_alias, cert.clone()).with_private_key(key.clone());
        keystore.write(path, &entry, password)?;

        Ok((cert, key))
    }

    /// Issue a leaf certificate for `public_key`, signed by the root.
    pub fn issue_leaf<T: HasPublic>(
        &self,
        subject_name: &str,
        subject_alt_name: &str,
        public_key: &PKeyRef<T>,
    ) -> Result<X509, SigningError> {
        let subject = dn::parse(subject_name)?;
        let serial = self.serials.next().map_err(SigningError::Serial)?;

        let mut builder = X509::builder()?;
        builder.set_version(X509_VERSION_3)?;
        let serial_number: Asn1Integer = serial_to_asn1(serial)?;
        builder.set_serial_number(&serial_number)?;
        builder.set_issuer_name(self.root_cert.subject_name())?;
        builder.set_subject_name(&subject)?;
        let not_before: Asn1Time = Asn1Time::days_from_now(0)?;
        let not_after: Asn1Time = Asn1Time::days_from_now(self.config.leaf_validity_days)?;
        builder.set_not_before(&not_before)?;
        builder.set_not_after(&not_after)?;
        builder.set_pubkey(public_key)?;

        builder.append_extension(
            KeyUsage::new()
                .key_agreement()
                .key_encipherment()
                .digital_signature()
                .build()?,
        )?;

        let san = SubjectAlternativeName::new()
            .dns(subject_alt_name)
            .build(&builder.x509v3_context(Some(&*self.root_cert), None))?;
        builder.append_extension(san)?;

        let ski = SubjectKeyIdentifier::new()
            .build(&builder.x509v3_context(Some(&*self.root_cert), None))?;
        builder.append_extension(ski)?;

        builder.sign(&self.root_key, self.config.digest.message_digest())?;
        let cert = builder.build();

        info!(
            "Issued certificate serial {} for {} (SAN {})",
            serial, subject_name, subject_alt_name
        );
        Ok(cert)
    }

    /// Write `cert` as PEM (Base64 DER between BEGIN/END lines), overwriting.
    pub fn export_certificate(cert: &X509Ref, destination: &Path) -> Result<(), SigningError> {
        let pem = cert.to_pem()?;
        fs::write(destination, pem).map_err(|source| SigningError::Export {
            path: destination.to_path_buf(),
            source,
        })?;
        debug!("Exported certificate to {:?}", destination);
        Ok(())
    }

    /// Produce a PEM-encoded revocation list naming `revoked_serials`.
    pub fn issue_crl(&self, revoked_serials: &[u64]) -> Result<String, SigningError> {
        let key_pem = self.root_key.private_key_to_pem_pkcs8()?;
        let key_pem = String::from_utf8_lossy(&key_pem);
        let signing_key = rcgen::KeyPair::from_pem_and_sign_algo(&key_pem, &rcgen::PKCS_RSA_SHA256)?;

        let root_der = CertificateDer::from(self.root_cert.to_der()?);
        let issuer = CertificateParams::from_ca_cert_der(&root_der)?.self_signed(&signing_key)?;

        let now = OffsetDateTime::now_utc();
        let params = CertificateRevocationListParams {
            this_update: now,
            next_update: now + time::Duration::days(i64::from(self.config.crl_validity_days)),
            crl_number: SerialNumber::from_slice(&minimal_be_bytes(now.unix_timestamp().max(1) as u64)),
            issuing_distribution_point: None,
            revoked_certs: revoked_serials
                .iter()
                .map(|serial| RevokedCertParams {
                    serial_number: SerialNumber::from_slice(&minimal_be_bytes(*serial)),
                    revocation_time: now,
                    reason_code: None,
                    invalidity_date: None,
                })
                .collect(),
            key_identifier_method: KeyIdMethod::Sha256,
        };

        let crl = params.signed_by(&issuer, &signing_key)?;
        info!("Issued revocation list with {} serial(s)", revoked_serials.len());
        Ok(crl.pem()?)
    }

    /// Write a PEM revocation list to `destination`, overwriting.
    pub fn export_crl(crl_pem: &str, destination: &Path) -> Result<(), SigningError> {
        fs::write(destination, crl_pem).map_err(|source| SigningError::Export {
            path: destination.to_path_buf(),
            source,
        })
    }

    /// Fresh RSA key pair of the configured size.
    pub fn generate_key_pair(&self) -> Result<PKey<Private>, SigningError> {
        generate_rsa_key(self.config.key_bits)
    }

    pub fn root_certificate(&self) -> &X509 {
        &self.root_cert
    }

    pub fn root_subject(&self) -> String {
        dn::format(self.root_cert.subject_name())
    }

    pub fn keystore_path(&self) -> &Path {
        &self.keystore_path
    }

    pub fn config(&self) -> &CaConfig {
        &self.config
    }

    /// Last serial handed to a leaf (1 when none has been issued).
    pub fn last_serial(&self) -> u64 {
        self.serials.last()
    }
}

fn generate_rsa_key(bits: u32) -> Result<PKey<Private>, SigningError> {
    let rsa = Rsa::generate(bits)?;
    Ok(PKey::from_rsa(rsa)?)
}

fn build_root_certificate(config: &CaConfig, key: &PKey<Private>) -> Result<X509, SigningError> {
    let name = dn::parse(&config.root_dn)?;

    let mut builder = X509::builder()?;
    builder.set_version(X509_VERSION_3)?;
    let serial_number: Asn1Integer = serial_to_asn1(ROOT_SERIAL)?;
    builder.set_serial_number(&serial_number)?;
    builder.set_subject_name(&name)?;
    builder.set_issuer_name(&name)?;
    let not_before: Asn1Time = Asn1Time::days_from_now(0)?;
    let not_after: Asn1Time = Asn1Time::days_from_now(config.root_validity_days)?;
    builder.set_not_before(&not_before)?;
    builder.set_not_after(&not_after)?;
    builder.set_pubkey(key)?;

    // No pathlen: unlimited path length
    builder.append_extension(BasicConstraints::new().critical().ca().build()?)?;
    builder.append_extension(
        KeyUsage::new()
            .digital_signature()
            .non_repudiation()
            .crl_sign()
            .key_cert_sign()
            .build()?,
    )?;
    let ski = SubjectKeyIdentifier::new().build(&builder.x509v3_context(None, None))?;
    builder.append_extension(ski)?;

    builder.sign(key, config.digest.message_digest())?;
    Ok(builder.build())
}

fn serial_to_asn1(serial: u64) -> Result<Asn1Integer, SigningError> {
    Ok(BigNum::from_slice(&serial.to_be_bytes())?.to_asn1_integer()?)
}

/// Big-endian bytes without leading zeros (at least one byte).
fn minimal_be_bytes(value: u64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count().min(7);
    bytes[skip..].to_vec()
}
