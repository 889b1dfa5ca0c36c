//! IMAP sync core: connection pooling, the folder sync state machine, and
//! flag/label reconciliation for Gmail and generic IMAP accounts. The
//! `syncd` binary (`src/main.rs`) is a thin supervisor wired on top of
//! this library.

pub mod config;
pub mod constants;
pub mod credentials;
pub mod error;
pub mod mail;
pub mod store;
