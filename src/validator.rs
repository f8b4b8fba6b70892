//! Certification path validation
//!
//! A [`ChainValidator`] holds a fixed set of trust anchors and, optionally, a
//! set of revocation lists. Validation runs in two phases:
//!
//! ```text
//! encoded path ──decode──> [leaf, issuer, ...]
//!                              │
//!                              ▼
//!            X509StoreContext::verify_cert   (chain, signatures, validity)
//!                              │
//!                              ▼
//!            CRL lookup per non-anchor cert  (only when CRLs were supplied)
//!                              │
//!                              ▼
//!                       leaf public key
//! ```
//!
//! Without revocation lists the second phase is skipped entirely.

use std::cmp::Ordering;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use openssl::asn1::Asn1Time;
use openssl::pkey::{PKey, Public};
use openssl::stack::Stack;
use openssl::x509::store::{X509Store, X509StoreBuilder};
use openssl::x509::verify::X509VerifyParam;
use openssl::x509::{CrlStatus, X509Crl, X509Ref, X509StoreContext, X509};
use tracing::{debug, warn};

use crate::certpath::{decode_path, PathEncoding};
use crate::dn;
use crate::error::ValidationError;

// Raw X509_V_ERR_* codes
const ERR_UNABLE_TO_GET_ISSUER_CERT: i32 = 2;
const ERR_UNABLE_TO_DECRYPT_CERT_SIGNATURE: i32 = 4;
const ERR_CERT_SIGNATURE_FAILURE: i32 = 7;
const ERR_CERT_NOT_YET_VALID: i32 = 9;
const ERR_CERT_HAS_EXPIRED: i32 = 10;
const ERR_DEPTH_ZERO_SELF_SIGNED_CERT: i32 = 18;
const ERR_SELF_SIGNED_CERT_IN_CHAIN: i32 = 19;
const ERR_UNABLE_TO_GET_ISSUER_CERT_LOCALLY: i32 = 20;
const ERR_UNABLE_TO_VERIFY_LEAF_SIGNATURE: i32 = 21;

pub struct ChainValidator {
    anchors: Vec<X509>,
    crls: Vec<X509Crl>,
}

impl ChainValidator {
    /// Validator over in-memory anchors. An empty `crls` disables revocation checking.
    pub fn new(anchors: Vec<X509>, crls: Vec<X509Crl>) -> Self {
        Self { anchors, crls }
    }

    /// Load anchors and revocation lists from PEM or DER files.
    ///
    /// A PEM file may hold several concatenated certificates.
    pub fn from_files<P: AsRef<Path>>(
        ca_files: &[P],
        crl_files: &[P],
    ) -> Result<Self, ValidationError> {
        let mut anchors = Vec::new();
        for path in ca_files {
            anchors.extend(load_certificates(path.as_ref())?);
        }
        if anchors.is_empty() {
            return Err(ValidationError::Load {
                path: PathBuf::new(),
                reason: "no trust anchors supplied".to_string(),
            });
        }

        let crls = crl_files
            .iter()
            .map(|path| load_crl(path.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;

        debug!(
            "Validator ready with {} anchor(s), {} CRL(s)",
            anchors.len(),
            crls.len()
        );
        Ok(Self::new(anchors, crls))
    }

    pub fn revocation_enabled(&self) -> bool {
        !self.crls.is_empty()
    }

    pub fn anchors(&self) -> &[X509] {
        &self.anchors
    }

    /// Validate an encoded path at the current time; returns the leaf key.
    pub fn validate(
        &self,
        encoded: &[u8],
        encoding: PathEncoding,
    ) -> Result<PKey<Public>, ValidationError> {
        self.check(encoded, encoding, None)
    }

    /// Validate an encoded path as of `at`.
    pub fn validate_at(
        &self,
        encoded: &[u8],
        encoding: PathEncoding,
        at: SystemTime,
    ) -> Result<PKey<Public>, ValidationError> {
        self.check(encoded, encoding, Some(at))
    }

    /// Read an encoded path from `path` and validate it at the current time.
    pub fn validate_file(
        &self,
        path: &Path,
        encoding: PathEncoding,
    ) -> Result<PKey<Public>, ValidationError> {
        let encoded = fs::read(path).map_err(|e| ValidationError::Load {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        self.validate(&encoded, encoding)
    }

    fn check(
        &self,
        encoded: &[u8],
        encoding: PathEncoding,
        at: Option<SystemTime>,
    ) -> Result<PKey<Public>, ValidationError> {
        let mut certificates = decode_path(encoded, encoding)?;
        let leaf = certificates.remove(0);
        let at_secs = at.map(unix_seconds);

        let store = self.build_store(at_secs)?;
        let mut untrusted = Stack::new()?;
        for cert in certificates {
            untrusted.push(cert)?;
        }

        let mut context = X509StoreContext::new()?;
        let chain = context.init(&store, &leaf, &untrusted, |ctx| {
            if ctx.verify_cert()? {
                let chain: Vec<X509> = ctx
                    .chain()
                    .map(|stack| stack.iter().map(|c| c.to_owned()).collect())
                    .unwrap_or_default();
                return Ok(Ok(chain));
            }
            let subject = ctx
                .current_cert()
                .map(|c| dn::format(c.subject_name()))
                .unwrap_or_else(|| dn::format(leaf.subject_name()));
            Ok(Err(classify(ctx.error().as_raw(), ctx.error().error_string(), subject)))
        })??;

        if self.revocation_enabled() {
            self.check_revocation(&chain, at_secs)?;
        }

        debug!("Validated path for {}", dn::format(leaf.subject_name()));
        Ok(leaf.public_key()?)
    }

    fn build_store(&self, at_secs: Option<i64>) -> Result<X509Store, ValidationError> {
        let mut builder = X509StoreBuilder::new()?;
        for anchor in &self.anchors {
            builder.add_cert(anchor.clone())?;
        }
        if let Some(secs) = at_secs {
            let mut param = X509VerifyParam::new()?;
            param.set_time(secs as _);
            builder.set_param(&param)?;
        }
        Ok(builder.build())
    }

    /// Every certificate below the anchor must be covered by a fresh CRL
    /// from its issuer that does not list its serial.
    fn check_revocation(&self, chain: &[X509], at_secs: Option<i64>) -> Result<(), ValidationError> {
        let now = match at_secs {
            Some(secs) => Asn1Time::from_unix(secs as _)?,
            None => Asn1Time::days_from_now(0)?,
        };

        for pair in chain.windows(2) {
            let (cert, issuer) = (&pair[0], &pair[1]);
            let subject = dn::format(cert.subject_name());
            let mut covered = false;

            for crl in self.crls_for(cert) {
                let issuer_key: PKey<Public> = issuer.public_key()?;
                if !crl.verify(&issuer_key)? {
                    warn!("Ignoring CRL with bad signature for {}", subject);
                    continue;
                }
                let stale = crl
                    .next_update()
                    .map(|next| next.compare(&now).map(|o| o != Ordering::Greater))
                    .transpose()?
                    .unwrap_or(false);
                if stale {
                    warn!("Ignoring stale CRL for {}", subject);
                    continue;
                }

                covered = true;
                if let CrlStatus::Revoked(_) = crl.get_by_serial(cert.serial_number()) {
                    return Err(ValidationError::Revoked {
                        subject,
                        serial: serial_string(cert),
                    });
                }
            }

            if !covered {
                return Err(ValidationError::RevocationUnknown {
                    subject,
                    reason: "no current revocation list from its issuer".to_string(),
                });
            }
        }
        Ok(())
    }

    fn crls_for<'a>(&'a self, cert: &'a X509Ref) -> impl Iterator<Item = &'a X509Crl> + 'a {
        self.crls.iter().filter(move |crl| {
            crl.issuer_name()
                .try_cmp(cert.issuer_name())
                .map(|o| o == Ordering::Equal)
                .unwrap_or(false)
        })
    }
}

fn classify(code: i32, reason: &str, subject: String) -> ValidationError {
    let reason = reason.to_string();
    match code {
        ERR_CERT_HAS_EXPIRED => ValidationError::Expired { subject },
        ERR_CERT_NOT_YET_VALID => ValidationError::NotYetValid { subject },
        ERR_CERT_SIGNATURE_FAILURE | ERR_UNABLE_TO_DECRYPT_CERT_SIGNATURE => {
            ValidationError::Signature { subject, reason }
        }
        ERR_UNABLE_TO_GET_ISSUER_CERT
        | ERR_UNABLE_TO_GET_ISSUER_CERT_LOCALLY
        | ERR_DEPTH_ZERO_SELF_SIGNED_CERT
        | ERR_SELF_SIGNED_CERT_IN_CHAIN
        | ERR_UNABLE_TO_VERIFY_LEAF_SIGNATURE => ValidationError::Untrusted { subject, reason },
        code => ValidationError::Other {
            subject,
            code,
            reason,
        },
    }
}

fn unix_seconds(at: SystemTime) -> i64 {
    match at.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    }
}

fn serial_string(cert: &X509Ref) -> String {
    cert.serial_number()
        .to_bn()
        .and_then(|bn| bn.to_dec_str().map(|s| s.to_string()))
        .unwrap_or_default()
}

/// Certificates from a PEM bundle or a single DER certificate.
pub fn load_certificates(path: &Path) -> Result<Vec<X509>, ValidationError> {
    let load_err = |reason: String| ValidationError::Load {
        path: path.to_path_buf(),
        reason,
    };
    let bytes = fs::read(path).map_err(|e| load_err(e.to_string()))?;

    let certs = if bytes.windows(10).any(|w| w == b"-----BEGIN") {
        X509::stack_from_pem(&bytes).map_err(|e| load_err(e.to_string()))?
    } else {
        vec![X509::from_der(&bytes).map_err(|e| load_err(e.to_string()))?]
    };
    if certs.is_empty() {
        return Err(load_err("no certificates found".to_string()));
    }
    Ok(certs)
}

/// A revocation list in PEM or DER form.
pub fn load_crl(path: &Path) -> Result<X509Crl, ValidationError> {
    let load_err = |reason: String| ValidationError::Load {
        path: path.to_path_buf(),
        reason,
    };
    let bytes = fs::read(path).map_err(|e| load_err(e.to_string()))?;

    if bytes.starts_with(b"-----BEGIN") {
        X509Crl::from_pem(&bytes)
    } else {
        X509Crl::from_der(&bytes)
    }
    .map_err(|e| load_err(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca::CertificateAuthority;
    use crate::certpath::build_path;
    use crate::test_support::{open_test_ca, self_signed};
    use std::time::Duration;

    const THREE_YEARS: Duration = Duration::from_secs(3 * 365 * 24 * 60 * 60);

    fn issue(ca: &CertificateAuthority) -> (PKey<openssl::pkey::Private>, X509) {
        let key = ca.generate_key_pair().unwrap();
        let cert = ca.issue_leaf("CN=localhost, O=UHA", "localhost", &key).unwrap();
        (key, cert)
    }

    #[test]
    fn test_round_trip_every_encoding() {
        let dir = tempfile::tempdir().unwrap();
        let ca = open_test_ca(dir.path());
        let (key, leaf) = issue(&ca);
        let validator = ChainValidator::new(vec![ca.root_certificate().clone()], vec![]);

        for encoding in [PathEncoding::Pkcs7, PathEncoding::PkiPath, PathEncoding::Pem] {
            let blob = build_path(&[leaf.clone()], encoding).unwrap();
            let public = validator.validate(&blob, encoding).unwrap();
            assert!(public.public_eq(&key), "{} path returned the wrong key", encoding);
        }
    }

    #[test]
    fn test_path_including_root_validates() {
        let dir = tempfile::tempdir().unwrap();
        let ca = open_test_ca(dir.path());
        let (key, leaf) = issue(&ca);
        let validator = ChainValidator::new(vec![ca.root_certificate().clone()], vec![]);

        let blob = build_path(&[leaf, ca.root_certificate().clone()], PathEncoding::PkiPath).unwrap();
        assert!(validator.validate(&blob, PathEncoding::PkiPath).unwrap().public_eq(&key));
    }

    #[test]
    fn test_unknown_root_is_untrusted() {
        let dir = tempfile::tempdir().unwrap();
        let ca = open_test_ca(dir.path());
        let (_, leaf) = issue(&ca);
        let (_, stranger) = self_signed("CN=Somebody Else");
        let validator = ChainValidator::new(vec![stranger], vec![]);

        let blob = build_path(&[leaf], PathEncoding::Pkcs7).unwrap();
        assert!(matches!(
            validator.validate(&blob, PathEncoding::Pkcs7),
            Err(ValidationError::Untrusted { .. })
        ));
    }

    #[test]
    fn test_expired_at_later_instant() {
        let dir = tempfile::tempdir().unwrap();
        let ca = open_test_ca(dir.path());
        let (_, leaf) = issue(&ca);
        let validator = ChainValidator::new(vec![ca.root_certificate().clone()], vec![]);
        let blob = build_path(&[leaf], PathEncoding::Pkcs7).unwrap();

        let later = SystemTime::now() + THREE_YEARS;
        assert!(matches!(
            validator.validate_at(&blob, PathEncoding::Pkcs7, later),
            Err(ValidationError::Expired { .. })
        ));

        let earlier = SystemTime::now() - Duration::from_secs(7 * 24 * 60 * 60);
        assert!(matches!(
            validator.validate_at(&blob, PathEncoding::Pkcs7, earlier),
            Err(ValidationError::NotYetValid { .. })
        ));
    }

    #[test]
    fn test_revoked_serial() {
        let dir = tempfile::tempdir().unwrap();
        let ca = open_test_ca(dir.path());
        let (_, revoked) = issue(&ca);
        let (key, good) = issue(&ca);

        let revoked_serial = serial_string(&revoked).parse::<u64>().unwrap();
        let crl_pem = ca.issue_crl(&[revoked_serial]).unwrap();
        let crl_path = dir.path().join("ca.crl");
        CertificateAuthority::export_crl(&crl_pem, &crl_path).unwrap();
        let root_path = dir.path().join("ca.cer");
        CertificateAuthority::export_certificate(ca.root_certificate(), &root_path).unwrap();

        let validator = ChainValidator::from_files(&[root_path], &[crl_path]).unwrap();
        assert!(validator.revocation_enabled());

        let blob = build_path(&[revoked], PathEncoding::Pkcs7).unwrap();
        match validator.validate(&blob, PathEncoding::Pkcs7) {
            Err(ValidationError::Revoked { serial, .. }) => {
                assert_eq!(serial, revoked_serial.to_string())
            }
            other => panic!("expected Revoked, got {:?}", other.map(|_| ())),
        }

        let blob = build_path(&[good], PathEncoding::Pkcs7).unwrap();
        assert!(validator.validate(&blob, PathEncoding::Pkcs7).unwrap().public_eq(&key));
    }

    #[test]
    fn test_crl_from_foreign_issuer_leaves_status_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let ca = open_test_ca(dir.path());
        let (_, leaf) = issue(&ca);

        let other_dir = tempfile::tempdir().unwrap();
        let mut other_config = crate::test_support::test_ca_config();
        other_config.root_dn = "CN=Other Root, O=Elsewhere".to_string();
        let other = CertificateAuthority::open(other_config, "ca-secret", other_dir.path()).unwrap();
        let crl = X509Crl::from_pem(other.issue_crl(&[]).unwrap().as_bytes()).unwrap();

        let validator = ChainValidator::new(vec![ca.root_certificate().clone()], vec![crl]);
        let blob = build_path(&[leaf], PathEncoding::Pkcs7).unwrap();
        assert!(matches!(
            validator.validate(&blob, PathEncoding::Pkcs7),
            Err(ValidationError::RevocationUnknown { .. })
        ));
    }

    #[test]
    fn test_validate_file_and_bad_blob() {
        let dir = tempfile::tempdir().unwrap();
        let ca = open_test_ca(dir.path());
        let (key, leaf) = issue(&ca);
        let validator = ChainValidator::new(vec![ca.root_certificate().clone()], vec![]);

        let path = dir.path().join("leaf.p7b");
        fs::write(&path, build_path(&[leaf], PathEncoding::Pkcs7).unwrap()).unwrap();
        assert!(validator
            .validate_file(&path, PathEncoding::Pkcs7)
            .unwrap()
            .public_eq(&key));

        assert!(matches!(
            validator.validate(b"garbage", PathEncoding::PkiPath),
            Err(ValidationError::Decode(_))
        ));
        assert!(matches!(
            validator.validate_file(&dir.path().join("missing.p7b"), PathEncoding::Pkcs7),
            Err(ValidationError::Load { .. })
        ));
    }

    #[test]
    fn test_load_certificates_pem_bundle_and_der() {
        let dir = tempfile::tempdir().unwrap();
        let (_, a) = self_signed("CN=a");
        let (_, b) = self_signed("CN=b");

        let bundle = dir.path().join("bundle.pem");
        fs::write(&bundle, [a.to_pem().unwrap(), b.to_pem().unwrap()].concat()).unwrap();
        assert_eq!(load_certificates(&bundle).unwrap().len(), 2);

        let der = dir.path().join("single.der");
        fs::write(&der, a.to_der().unwrap()).unwrap();
        assert_eq!(load_certificates(&der).unwrap().len(), 1);
    }
}
