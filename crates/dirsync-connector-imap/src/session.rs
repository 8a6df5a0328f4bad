//! Tagged command/response exchange over one IMAP connection.

use std::borrow::Cow;

use imap_proto::types::{RequestId, Response};
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream,
};
use tracing::{debug, warn};

use dirsync_connector::error::{ConnectorError, ConnectorResult};

use crate::protocol::{
    is_bye, literal_length, parse_response, protocol_error, quote, require_response,
    response_code, Status,
};

/// Result of one tagged command.
#[derive(Debug, PartialEq)]
pub struct CommandOutcome {
    /// Untagged responses received before completion.
    pub untagged: Vec<Response<'static>>,
    /// Completion status.
    pub status: Status,
    /// Completion text, including any response code `imap-proto` left in it.
    pub text: String,
}

impl CommandOutcome {
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }

    /// Response code of the completion, e.g. `NONEXISTENT`.
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        response_code(&self.text)
    }
}

/// An authenticated or not-yet-authenticated IMAP connection.
pub struct ImapSession<S> {
    stream: BufStream<S>,
    next_tag: u32,
}

impl<S> ImapSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream: BufStream::new(stream),
            next_tag: 0,
        }
    }

    /// Read the server greeting.
    pub async fn read_greeting(&mut self) -> ConnectorResult<()> {
        let raw = self.read_response().await?;
        match require_response(&raw)? {
            Response::Data {
                status: Status::Ok | Status::PreAuth,
                ..
            } => Ok(()),
            Response::Data {
                status: Status::Bye,
                information,
                ..
            } => Err(ConnectorError::Unavailable {
                message: information
                    .map(Cow::into_owned)
                    .unwrap_or_else(|| "IMAP server refused the connection".to_string()),
            }),
            other => Err(protocol_error(format!("unexpected greeting: {other:?}"))),
        }
    }

    /// Authenticate with LOGIN.
    pub async fn login(&mut self, login: &str, password: &str) -> ConnectorResult<()> {
        let outcome = self
            .command(&format!("LOGIN {} {}", quote(login), quote(password)))
            .await?;
        match outcome.status {
            Status::Ok => Ok(()),
            Status::No => Err(ConnectorError::AuthenticationFailed),
            _ => Err(protocol_error(format!("LOGIN rejected: {}", outcome.text))),
        }
    }

    /// Send `command` under a fresh tag and collect responses until its
    /// completion.
    pub async fn command(&mut self, command: &str) -> ConnectorResult<CommandOutcome> {
        self.next_tag += 1;
        let tag = format!("A{:04}", self.next_tag);
        let verb = command.split(' ').next().unwrap_or_default();
        debug!(tag = %tag, command = verb, "Sending IMAP command");

        let request = format!("{tag} {command}\r\n");
        self.stream
            .write_all(request.as_bytes())
            .await
            .map_err(|e| ConnectorError::connection_lost_with_source("IMAP write failed", e))?;
        self.stream
            .flush()
            .await
            .map_err(|e| ConnectorError::connection_lost_with_source("IMAP write failed", e))?;

        let mut untagged = Vec::new();
        loop {
            let raw = self.read_response().await?;
            let Some(response) = parse_response(&raw) else {
                if raw.starts_with(format!("{tag} ").as_bytes()) {
                    return Err(protocol_error(format!(
                        "unparsable completion: {}",
                        String::from_utf8_lossy(&raw).trim_end()
                    )));
                }
                debug!(
                    response = %String::from_utf8_lossy(&raw).trim_end(),
                    "Skipping unrecognized response"
                );
                continue;
            };
            match response {
                Response::Done {
                    tag: RequestId(completed),
                    status,
                    information,
                    ..
                } if completed == tag => {
                    return Ok(CommandOutcome {
                        untagged,
                        status,
                        text: information.map(Cow::into_owned).unwrap_or_default(),
                    });
                }
                Response::Done {
                    tag: RequestId(other),
                    ..
                } => {
                    warn!(expected = %tag, received = %other, "Ignoring completion for unknown tag");
                }
                ref bye if is_bye(bye) => {
                    return Err(ConnectorError::connection_lost(
                        String::from_utf8_lossy(&raw).trim_end().to_string(),
                    ));
                }
                Response::Continue { .. } => {
                    return Err(protocol_error("unexpected continuation request"));
                }
                other => untagged.push(other),
            }
        }
    }

    /// Send LOGOUT and drain the reply. Errors are ignored since the
    /// connection is discarded either way.
    pub async fn logout(&mut self) {
        self.next_tag += 1;
        let tag = format!("A{:04}", self.next_tag);
        let request = format!("{tag} LOGOUT\r\n");
        if self.stream.write_all(request.as_bytes()).await.is_err()
            || self.stream.flush().await.is_err()
        {
            return;
        }
        while let Ok(raw) = self.read_response().await {
            if raw.starts_with(tag.as_bytes()) {
                break;
            }
        }
    }

    /// Read one complete response: a line plus any literals it announces
    /// and the line continuations after them.
    async fn read_response(&mut self) -> ConnectorResult<Vec<u8>> {
        let mut raw = Vec::new();
        loop {
            let start = raw.len();
            let read = self
                .stream
                .read_until(b'\n', &mut raw)
                .await
                .map_err(|e| ConnectorError::connection_lost_with_source("IMAP read failed", e))?;
            if read == 0 {
                return Err(ConnectorError::connection_lost(
                    "IMAP server closed the connection",
                ));
            }

            let Some(len) = literal_length(&raw[start..]) else {
                return Ok(raw);
            };
            let literal_start = raw.len();
            raw.resize(literal_start + len, 0);
            self.stream
                .read_exact(&mut raw[literal_start..])
                .await
                .map_err(|e| {
                    ConnectorError::connection_lost_with_source("IMAP literal truncated", e)
                })?;
        }
    }
}
