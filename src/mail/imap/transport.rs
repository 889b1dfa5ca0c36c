//! Connection setup: implicit TLS or STARTTLS, followed by LOGIN or
//! XOAUTH2 authentication. Grounded on the teacher's
//! `mail/imap/client.rs::connect`, generalized to support STARTTLS (the
//! teacher only ever dials implicit TLS on 993) and to capture the raw
//! greeting banner, which the Gmail/generic fetch paths need to detect
//! the SmarterMail CONDSTORE quirk.
//!
//! Certificate and hostname verification are disabled by policy (spec.md
//! §4.2): too many providers in the wild run broken or self-signed chains
//! for this to be opt-out rather than opt-in.

use async_native_tls::TlsStream;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};

use super::XOAuth2Authenticator;
use crate::config::ImapEndpoint;
use crate::credentials::Credential;
use crate::error::{Result, SyncError};

/// The buffered stream lets us read the greeting line ourselves before
/// handing the connection to `async_imap::Client`, and continue to
/// `read_line` it for the STARTTLS handshake without losing any
/// already-buffered bytes.
pub type ImapStream = BufStream<TlsStream<Compat<TcpStream>>>;
pub type ImapSession = async_imap::Session<ImapStream>;

pub struct Connected {
    pub session: ImapSession,
    pub banner: String,
}

/// Open a new authenticated IMAP session against `endpoint`, logging in
/// with `credential`. `username` is the IMAP login identity (usually the
/// account email).
pub async fn connect(
    endpoint: &ImapEndpoint,
    username: &str,
    credential: &Credential,
) -> Result<Connected> {
    let addr = format!("{}:{}", endpoint.host, endpoint.port);

    let tcp = TcpStream::connect(&addr)
        .await
        .map_err(|e| SyncError::Network {
            server: endpoint.host.clone(),
            source: e,
        })?;

    let (stream, banner) = if endpoint.implicit_tls {
        let tls = tls_handshake(&endpoint.host, tcp).await?;
        let mut buffered = BufStream::new(tls);
        let banner = read_line(&mut buffered, &endpoint.host).await?;
        (buffered, banner)
    } else {
        starttls_upgrade(&endpoint.host, tcp).await?
    };

    // `async_imap::Client::new` doesn't re-read the greeting; it only
    // starts parsing responses once a command is issued. We've already
    // consumed the banner line above for our own SmarterMail detection,
    // and the client never needed it.
    let client = async_imap::Client::new(stream);

    let session = authenticate(client, username, credential).await?;
    Ok(Connected { session, banner })
}

async fn read_line(stream: &mut ImapStream, host: &str) -> Result<String> {
    let mut line = String::new();
    stream
        .read_line(&mut line)
        .await
        .map_err(|e| SyncError::Network {
            server: host.to_string(),
            source: e,
        })?;
    Ok(line)
}

async fn tls_handshake(host: &str, tcp: TcpStream) -> Result<TlsStream<Compat<TcpStream>>> {
    // spec.md §4.2: certificate verification is disabled by policy
    // (historical compatibility with providers running broken chains);
    // cipher selection is left permissive. Strict verification would be
    // an opt-in per-provider allow-list, which nothing in this crate
    // currently exercises.
    let connector = async_native_tls::TlsConnector::new()
        .danger_accept_invalid_certs(true)
        .danger_accept_invalid_hostnames(true);
    connector
        .connect(host, tcp.compat())
        .await
        .map_err(|e| SyncError::ImapAbort(format!("TLS handshake failed: {e}")))
}

/// Connect in the clear, confirm the server advertises `STARTTLS`, issue
/// it, then upgrade the same socket to TLS: read the greeting, probe
/// capabilities, send `STARTTLS`, confirm `OK`, then hand the raw socket
/// to the TLS connector.
async fn starttls_upgrade(host: &str, tcp: TcpStream) -> Result<(ImapStream, String)> {
    let mut plain = BufStream::new(tcp);

    let mut banner = String::new();
    plain
        .read_line(&mut banner)
        .await
        .map_err(|e| SyncError::Network {
            server: host.to_string(),
            source: e,
        })?;

    plain
        .write_all(b"a1 CAPABILITY\r\n")
        .await
        .map_err(|e| SyncError::Network {
            server: host.to_string(),
            source: e,
        })?;
    plain.flush().await.map_err(|e| SyncError::Network {
        server: host.to_string(),
        source: e,
    })?;

    let mut starttls_advertised = false;
    loop {
        let mut line = String::new();
        let n = plain
            .read_line(&mut line)
            .await
            .map_err(|e| SyncError::Network {
                server: host.to_string(),
                source: e,
            })?;
        if n == 0 {
            return Err(SyncError::Network {
                server: host.to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed during CAPABILITY probe",
                ),
            });
        }
        if line.to_ascii_uppercase().contains("STARTTLS") {
            starttls_advertised = true;
        }
        if line.starts_with("a1 ") {
            break;
        }
    }

    if !starttls_advertised {
        return Err(SyncError::SSLNotSupported(host.to_string()));
    }

    plain
        .write_all(b"a2 STARTTLS\r\n")
        .await
        .map_err(|e| SyncError::Network {
            server: host.to_string(),
            source: e,
        })?;
    plain.flush().await.map_err(|e| SyncError::Network {
        server: host.to_string(),
        source: e,
    })?;

    let mut response = String::new();
    plain
        .read_line(&mut response)
        .await
        .map_err(|e| SyncError::Network {
            server: host.to_string(),
            source: e,
        })?;

    if !response.starts_with("a2 OK") {
        return Err(SyncError::ImapProtocol(format!(
            "server refused STARTTLS: {response}"
        )));
    }

    let tcp = plain.into_inner();
    let tls = tls_handshake(host, tcp).await?;
    Ok((BufStream::new(tls), banner))
}

async fn authenticate(
    client: async_imap::Client<ImapStream>,
    username: &str,
    credential: &Credential,
) -> Result<ImapSession> {
    match credential {
        Credential::Password(password) => client
            .login(username, password)
            .await
            .map_err(|(e, _)| classify_login_error(&e)),
        Credential::AccessToken { value, .. } => {
            let authenticator = XOAuth2Authenticator {
                user: username.to_string(),
                access_token: value.clone(),
            };
            client
                .authenticate("XOAUTH2", authenticator)
                .await
                .map_err(|(e, _)| classify_login_error(&e))
        }
    }
}

/// Maps an authentication failure response to the error taxonomy.
/// Providers that require an app-specific password typically mention it
/// in the NO/BAD response text; we detect that by substring match,
/// mirroring the upstream auth handlers' message-based detection.
fn classify_login_error(err: &async_imap::error::Error) -> SyncError {
    super::super::crispin::classify_auth_failure("", &err.to_string())
}
