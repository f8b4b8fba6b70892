//! Protocol Definition Module
//!
//! Transfers ride on HTTP/1.1 over TLS (hyper does the framing), one request
//! per connection:
//!
//! ```text
//! Client                                          Server
//!   |-- [TLS Handshake, both sides present certs] -->|
//!   |                                                |
//!   |-- GET /fileserver?download=<name> ------------>|
//!   |<------------- 200, Content-Length: n, <bytes> -|   (or 404)
//!   |                                                |
//!   |-- POST /fileserver?upload=<name> ------------->|
//!   |   Content-Length: n, Content-Type: <ext>       |
//!   |   <bytes>                                      |
//!   |<---------------------------------------- 200 --|   (or 400 / 413)
//! ```
//!
//! The query is a single `action=fileName` pair with the file name
//! percent-encoded. This module holds the pieces both ends agree on: the
//! query grammar, the file name rules and a few response helpers.

use std::fmt;
use std::io;
use std::path::Path;
use std::str::FromStr;

use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full};
use hyper::header::{HeaderMap, CONTENT_LENGTH};
use hyper::{Method, Response, StatusCode};

use crate::error::{FileNameError, ProtocolError};

/// Chunk size for file transfers (64 KB)
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Fallback content type for files without an extension
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Longest accepted file name, in bytes, after percent-decoding
pub const MAX_FILE_NAME_LEN: usize = 255;

/// Body type of every server response
pub type ResponseBody = UnsyncBoxBody<Bytes, io::Error>;

/// Transfer direction named in the query string
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Upload,
    Download,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Upload => "upload",
            Self::Download => "download",
        }
    }

    /// HTTP method the client uses for this action
    pub fn method(self) -> Method {
        match self {
            Self::Upload => Method::POST,
            Self::Download => Method::GET,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "upload" => Ok(Self::Upload),
            "download" => Ok(Self::Download),
            other => Err(ProtocolError::UnknownAction(other.to_string())),
        }
    }
}

/// A parsed `action=fileName` query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub action: Action,
    /// Percent-decoded and validated file name
    pub file_name: String,
}

impl TransferRequest {
    pub fn from_query(query: &str) -> Result<Self, ProtocolError> {
        let (action, encoded) = query.split_once('=').ok_or_else(|| {
            ProtocolError::InvalidFormat(format!("query {:?} is not action=fileName", query))
        })?;
        let action: Action = action.parse()?;

        let invalid = |reason| ProtocolError::InvalidFileName {
            name: encoded.to_string(),
            reason,
        };
        let decoded = urlencoding::decode(encoded).map_err(|_| invalid(FileNameError::Encoding))?;
        let file_name = validate_file_name(&decoded).map_err(invalid)?;

        Ok(Self { action, file_name })
    }
}

/// Check a decoded file name and normalize `\` separators to `/`.
///
/// Names may contain subdirectories. Every segment must be non-empty, must
/// not be `.` or `..` and must not start with a dot; dot-names are reserved
/// for in-flight transfers.
pub fn validate_file_name(name: &str) -> Result<String, FileNameError> {
    if name.is_empty() {
        return Err(FileNameError::Empty);
    }
    if name.len() > MAX_FILE_NAME_LEN {
        return Err(FileNameError::TooLong(MAX_FILE_NAME_LEN));
    }
    if name.chars().any(char::is_control) {
        return Err(FileNameError::ControlCharacter);
    }

    let normalized = name.replace('\\', "/");
    if normalized.starts_with('/') || has_drive_prefix(&normalized) {
        return Err(FileNameError::Absolute);
    }

    for segment in normalized.split('/') {
        match segment {
            "" => return Err(FileNameError::EmptySegment),
            "." | ".." => return Err(FileNameError::Traversal),
            hidden if hidden.starts_with('.') => {
                return Err(FileNameError::Hidden(hidden.to_string()))
            }
            _ => {}
        }
    }

    Ok(normalized)
}

fn has_drive_prefix(name: &str) -> bool {
    let bytes = name.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// Parse `Content-Length`, `None` when the header is absent
pub fn content_length(headers: &HeaderMap) -> Result<Option<u64>, ProtocolError> {
    headers
        .get(CONTENT_LENGTH)
        .map(|value| {
            value
                .to_str()
                .ok()
                .and_then(|v| v.trim().parse::<u64>().ok())
                .ok_or_else(|| {
                    ProtocolError::InvalidFormat(format!("bad Content-Length {:?}", value))
                })
        })
        .transpose()
}

/// A complete response with a short plain-text body
pub fn text_response(status: StatusCode, message: &'static str) -> Response<ResponseBody> {
    let body = Full::new(Bytes::from_static(message.as_bytes()))
        .map_err(|never| match never {})
        .boxed_unsync();
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
}

/// Content type hint sent with uploads: the bare lowercase file extension
pub fn content_type_for(path: &Path) -> String {
    path.extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty())
        .map(str::to_ascii_lowercase)
        .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string())
}

/// `base?action=<percent-encoded file name>`
pub fn transfer_url(base: &str, action: Action, file_name: &str) -> String {
    format!(
        "{}?{}={}",
        base.trim_end_matches('?'),
        action,
        urlencoding::encode(file_name)
    )
}
