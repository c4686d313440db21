//! Runtime — the stateful heart of the gateway.
//!
//! Four long-lived owners, each serializing its own state:
//! - [`allocator`] — process-wide sprite + repo-lock coordinator
//! - [`token`] — the singleton OAuth token manager
//! - [`channel`] — one streaming exec connection per live agent
//! - [`supervisor`] — the per-task session state machine
//!
//! Cross-owner state exchange happens over messages or the database;
//! there is no shared mutable memory between them.

pub mod allocator;
pub mod channel;
pub mod events;
pub mod registry;
pub mod supervisor;
pub mod token;

/// Quote a string for embedding in a `/bin/sh -c` command line:
/// wrap in single quotes, escaping embedded ones as `'\''`.
pub(crate) fn sh_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
