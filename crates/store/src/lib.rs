//! `sd-store` — SQLite persistence for SpriteDeck.
//!
//! One [`Database`] handle owns the connection; the runtime shares it via
//! `Arc`. Four concerns live here: task/repo records, the append-only
//! conversation store (messages + execution sessions with a bounded
//! in-place mutation surface), the DB-enforced repo lock, and the
//! singleton OAuth token row.
//!
//! The repo lock is the ground truth for repository mutual exclusion —
//! there is deliberately no in-memory lock table. Acquisition runs inside
//! an `IMMEDIATE` transaction so the read-check-write is atomic across
//! processes sharing the database file.

mod db;
mod exec_sessions;
mod messages;
mod repos;
mod tasks;
mod tokens;

pub use db::Database;
pub use messages::CreateMessage;
