//! Distinguished name parsing and display.

use openssl::x509::{X509Name, X509NameRef};

use crate::error::SigningError;

/// Parse `"CN=host, OU=unit, O=org, C=FR"` into an X.509 name.
///
/// Attributes keep their textual order. Escaped commas are not supported.
pub fn parse(dn: &str) -> Result<X509Name, SigningError> {
    let invalid = |reason: &str| SigningError::InvalidName {
        name: dn.to_string(),
        reason: reason.to_string(),
    };

    let mut builder = X509Name::builder()?;
    let mut count = 0;

    for part in dn.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (field, value) = part
            .split_once('=')
            .ok_or_else(|| invalid(&format!("attribute {:?} has no '='", part)))?;
        let (field, value) = (field.trim(), value.trim());
        if field.is_empty() || value.is_empty() {
            return Err(invalid(&format!("empty attribute in {:?}", part)));
        }
        builder
            .append_entry_by_text(field, value)
            .map_err(|e| invalid(&format!("attribute {:?}: {}", field, e)))?;
        count += 1;
    }

    if count == 0 {
        return Err(invalid("no attributes"));
    }

    Ok(builder.build())
}

/// Render a name as `"CN=host, O=org"` in stored order.
pub fn format(name: &X509NameRef) -> String {
    name.entries()
        .map(|entry| {
            let field = entry.object().nid().short_name().unwrap_or("?");
            let value = entry.data().to_string().unwrap_or_default();
            format!("{}={}", field, value)
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Compose a leaf subject: `CN=<common_name>` followed by `suffix`.
pub fn leaf_subject(common_name: &str, suffix: &str) -> String {
    if suffix.trim().is_empty() {
        format!("CN={}", common_name)
    } else {
        format!("CN={}, {}", common_name, suffix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_format_keep_order() {
        let name = parse("CN=RootCA, OU=M2, O=miage, L=Mulhouse, ST=68093, C=FR").unwrap();
        assert_eq!(
            format(&name),
            "CN=RootCA, OU=M2, O=miage, L=Mulhouse, ST=68093, C=FR"
        );
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(parse("").is_err());
        assert!(parse("CN").is_err());
        assert!(parse("CN=").is_err());
        assert!(parse("NOTAFIELD=x").is_err());
    }

    #[test]
    fn test_format_keeps_interior_nul() {
        let mut builder = openssl::x509::X509NameBuilder::new().unwrap();
        builder
            .append_entry_by_nid_with_type(
                openssl::nid::Nid::COMMONNAME,
                "before\0after",
                openssl::asn1::Asn1Type::UTF8STRING,
            )
            .unwrap();
        let name = builder.build();
        assert_eq!(format(&name), "CN=before\0after");
    }

    #[test]
    fn test_leaf_subject() {
        assert_eq!(leaf_subject("localhost", "O=UHA, C=FR"), "CN=localhost, O=UHA, C=FR");
        assert_eq!(leaf_subject("localhost", ""), "CN=localhost");
    }
}
