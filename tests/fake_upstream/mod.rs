//! Fake upstream IMAP server for integration testing.
//!
//! The gateway under test dials this instead of a real mail server.
//! Tests seed and inspect its [`MailStore`] to observe what actually
//! crossed the upstream wire.

pub mod io;
mod mailbox;
mod server;

pub use mailbox::{MailStore, SharedMail};
pub use server::FakeUpstreamServer;
