//! Certification path encoding
//!
//! A path is an ordered list of certificates, leaf first, ending below an
//! implicit trust anchor. Three transport encodings are supported:
//!
//! ```text
//! Pkcs7    ContentInfo { signedData, SignedData {
//!              version 1, digestAlgorithms {}, contentInfo { data },
//!              certificates [0] { leaf, issuer, ... }, signerInfos {} } }
//! PkiPath  SEQUENCE OF Certificate, anchor side first (reversed)
//! Pem      concatenated PEM certificates, leaf first
//! ```
//!
//! Nothing here checks that the order makes sense; that is the validator's
//! job.

use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use openssl::pkcs7::Pkcs7;
use openssl::x509::X509;
use yasna::models::ObjectIdentifier;
use yasna::Tag;

use crate::error::{SigningError, ValidationError};

/// 1.2.840.113549.1.7.2
const OID_SIGNED_DATA: &[u64] = &[1, 2, 840, 113549, 1, 7, 2];
/// 1.2.840.113549.1.7.1
const OID_DATA: &[u64] = &[1, 2, 840, 113549, 1, 7, 1];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathEncoding {
    Pkcs7,
    PkiPath,
    Pem,
}

impl FromStr for PathEncoding {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pkcs7" | "p7b" => Ok(Self::Pkcs7),
            "pkipath" => Ok(Self::PkiPath),
            "pem" => Ok(Self::Pem),
            other => Err(ValidationError::Decode(format!(
                "unknown path encoding {:?}",
                other
            ))),
        }
    }
}

impl fmt::Display for PathEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pkcs7 => "PKCS7",
            Self::PkiPath => "PkiPath",
            Self::Pem => "PEM",
        })
    }
}

/// Encode `certificates` (leaf first) as a single blob.
pub fn build_path(certificates: &[X509], encoding: PathEncoding) -> Result<Vec<u8>, SigningError> {
    if certificates.is_empty() {
        return Err(SigningError::EmptyPath);
    }

    let ders = certificates
        .iter()
        .map(|c| c.to_der())
        .collect::<Result<Vec<_>, _>>()?;

    let encoded = match encoding {
        PathEncoding::Pkcs7 => degenerate_signed_data(&ders),
        PathEncoding::PkiPath => yasna::construct_der(|writer| {
            writer.write_sequence(|writer| {
                for der in ders.iter().rev() {
                    writer.next().write_der(der);
                }
            })
        }),
        PathEncoding::Pem => {
            let mut out = Vec::new();
            for cert in certificates {
                out.extend_from_slice(&cert.to_pem()?);
            }
            out
        }
    };

    Ok(encoded)
}

/// Write an encoded path verbatim to `destination`, overwriting.
pub fn export_path(encoded: &[u8], destination: &Path) -> Result<(), SigningError> {
    fs::write(destination, encoded).map_err(|source| SigningError::Export {
        path: destination.to_path_buf(),
        source,
    })
}

/// Decode a blob back into certificates, leaf first.
pub fn decode_path(encoded: &[u8], encoding: PathEncoding) -> Result<Vec<X509>, ValidationError> {
    let certificates = match encoding {
        PathEncoding::Pkcs7 => decode_pkcs7(encoded)?,
        PathEncoding::PkiPath => {
            let ders = yasna::parse_der(encoded, |reader| {
                reader.collect_sequence_of(|reader| reader.read_der())
            })?;
            let mut certs = ders
                .iter()
                .map(|der| X509::from_der(der).map_err(|e| ValidationError::Decode(e.to_string())))
                .collect::<Result<Vec<_>, _>>()?;
            certs.reverse();
            certs
        }
        PathEncoding::Pem => {
            X509::stack_from_pem(encoded).map_err(|e| ValidationError::Decode(e.to_string()))?
        }
    };

    if certificates.is_empty() {
        return Err(ValidationError::EmptyPath);
    }
    Ok(certificates)
}

fn decode_pkcs7(encoded: &[u8]) -> Result<Vec<X509>, ValidationError> {
    let pkcs7 = if encoded.starts_with(b"-----BEGIN") {
        Pkcs7::from_pem(encoded)
    } else {
        Pkcs7::from_der(encoded)
    }
    .map_err(|e| ValidationError::Decode(e.to_string()))?;

    let certs = pkcs7
        .signed()
        .and_then(|signed| signed.certificates())
        .ok_or_else(|| ValidationError::Decode("PKCS#7 blob carries no certificates".to_string()))?;

    Ok(certs.iter().map(|c| c.to_owned()).collect())
}

/// ContentInfo wrapping a SignedData with certificates only.
///
/// `certificates` is declared as a SET, but DER would sort a SET and lose the
/// path order, so the elements go out as an implicitly tagged SEQUENCE.
fn degenerate_signed_data(ders: &[Vec<u8>]) -> Vec<u8> {
    yasna::construct_der(|writer| {
        writer.write_sequence(|writer| {
            writer
                .next()
                .write_oid(&ObjectIdentifier::from_slice(OID_SIGNED_DATA));
            writer.next().write_tagged(Tag::context(0), |writer| {
                writer.write_sequence(|writer| {
                    writer.next().write_u8(1);
                    writer.next().write_set(|_| {});
                    writer.next().write_sequence(|writer| {
                        writer.next().write_oid(&ObjectIdentifier::from_slice(OID_DATA));
                    });
                    writer
                        .next()
                        .write_tagged_implicit(Tag::context(0), |writer| {
                            writer.write_sequence(|writer| {
                                for der in ders {
                                    writer.next().write_der(der);
                                }
                            })
                        });
                    writer.next().write_set(|_| {});
                })
            });
        })
    })
}
