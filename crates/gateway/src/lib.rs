//! `sd-gateway` — the SpriteDeck orchestration gateway.
//!
//! One process hosts: the HTTP/WS API, the per-task session supervisors,
//! the process-wide allocator (sprite + repo locks), the OAuth token
//! manager, and the agent channels streaming to sprites.

pub mod api;
pub mod bootstrap;
pub mod cli;
pub mod runtime;
pub mod state;
