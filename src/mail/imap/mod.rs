//! IMAP transport: TLS/STARTTLS connection setup and XOAUTH2 SASL, shared
//! by every Crispin client variant and by the connection pool.

pub mod pool;
mod transport;

pub use pool::{ConnectionPool, PoolKind, PooledConnection};
pub use transport::{connect, ImapSession};

/// SASL XOAUTH2 authenticator, handed to `async_imap::Session::authenticate`.
/// The response format is fixed by RFC 7628 and must match exactly what
/// the server expects, including the trailing double `\x01`.
pub(crate) struct XOAuth2Authenticator {
    pub user: String,
    pub access_token: String,
}

impl async_imap::Authenticator for XOAuth2Authenticator {
    type Response = String;

    fn process(&mut self, _challenge: &[u8]) -> Self::Response {
        crate::credentials::build_xoauth2_response(&self.user, &self.access_token)
    }
}
