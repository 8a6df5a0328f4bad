//! IMAP response handling.
//!
//! Responses are parsed by `imap-proto`; this module extracts what the
//! administrative commands need from them and provides argument quoting
//! and literal framing for the session.

use imap_proto::types::{MailboxDatum, Metadata, QuotaResourceName, Response};

use dirsync_connector::error::{ConnectorError, ConnectorResult};
use dirsync_connector::operation::AclEntry;

pub use imap_proto::types::Status;

/// Parse one complete response, CRLF and literals included.
///
/// Responses `imap-proto` does not understand yield `None`.
#[must_use]
pub fn parse_response(raw: &[u8]) -> Option<Response<'static>> {
    match Response::from_bytes(raw) {
        Ok((_, response)) => Some(response.into_owned()),
        Err(_) => None,
    }
}

/// Response code of a status text, e.g. `NONEXISTENT` for
/// `[NONEXISTENT] Mailbox does not exist`.
///
/// Codes `imap-proto` does not know stay in the text.
#[must_use]
pub fn response_code(text: &str) -> Option<&str> {
    let rest = text.strip_prefix('[')?;
    let end = rest.find(']')?;
    rest[..end].split(' ').next()
}

/// Whether the response is an untagged `BYE`.
#[must_use]
pub fn is_bye(response: &Response<'_>) -> bool {
    matches!(
        response,
        Response::Data {
            status: Status::Bye,
            ..
        }
    )
}

/// Mailbox name of a `LIST` response.
#[must_use]
pub fn list_name<'r>(response: &'r Response<'_>) -> Option<&'r str> {
    match response {
        Response::MailboxData(MailboxDatum::List { name, .. }) => Some(name.as_ref()),
        _ => None,
    }
}

/// Grants of an `ACL` response.
#[must_use]
pub fn acl_entries(response: &Response<'_>) -> Option<Vec<AclEntry>> {
    let Response::Acl(acl) = response else {
        return None;
    };
    Some(
        acl.acls
            .iter()
            .map(|entry| {
                let rights: String = entry.rights.iter().map(|r| char::from(*r)).collect();
                AclEntry::new(entry.identifier.as_ref(), rights)
            })
            .collect(),
    )
}

/// Entries of a `METADATA` response carrying values.
#[must_use]
pub fn metadata_entries<'r>(response: &'r Response<'_>) -> Option<&'r [Metadata]> {
    match response {
        Response::MailboxData(MailboxDatum::MetadataSolicited { values, .. }) => {
            Some(values.as_slice())
        }
        _ => None,
    }
}

/// `STORAGE` limit of a `QUOTA` response for quota root `root`.
#[must_use]
pub fn storage_limit(response: &Response<'_>, root: &str) -> Option<u64> {
    let Response::Quota(quota) = response else {
        return None;
    };
    if quota.root_name != root {
        return None;
    }
    quota
        .resources
        .iter()
        .find(|resource| matches!(resource.name, QuotaResourceName::Storage))
        .map(|resource| resource.limit)
}

/// Quote a string argument.
#[must_use]
pub fn quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        if c == '"' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

/// Length announced by a `{n}` or `{n+}` literal marker ending a line.
#[must_use]
pub fn literal_length(line: &[u8]) -> Option<usize> {
    let body = line
        .strip_suffix(b"\r\n")
        .or_else(|| line.strip_suffix(b"\n"))
        .unwrap_or(line);
    let body = body.strip_suffix(b"}")?;
    let open = body.iter().rposition(|b| *b == b'{')?;
    let digits = &body[open + 1..];
    let digits = digits.strip_suffix(b"+").unwrap_or(digits);
    std::str::from_utf8(digits).ok()?.parse().ok()
}

pub(crate) fn protocol_error(message: impl Into<String>) -> ConnectorError {
    ConnectorError::invalid_data(format!("IMAP protocol error: {}", message.into()))
}

/// Parse `raw` or fail with a protocol error naming the line.
pub(crate) fn require_response(raw: &[u8]) -> ConnectorResult<Response<'static>> {
    parse_response(raw).ok_or_else(|| {
        protocol_error(format!(
            "unparsable response: {}",
            String::from_utf8_lossy(raw).trim_end()
        ))
    })
}
