//! The sync core's mail subsystem: IMAP transport and pooling, the
//! per-provider Crispin clients, and the shared data model they move
//! messages through.

pub mod catalog;
pub mod crispin;
pub mod dedup;
pub mod engine;
pub mod imap;
pub mod monitor;
pub mod registry;
pub mod types;

pub use crispin::{GenericCrispinClient, GmailCrispinClient, Mailbox};
