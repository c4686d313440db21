//! `sd-sprites` — client for the remote sprite (sandbox VM) API.
//!
//! A sprite is an external hibernatable Linux VM addressed by name. The
//! API is plain HTTPS plus a WebSocket exec endpoint; this crate is a
//! stateless facade: create/get/list/suspend/delete, a blocking exec that
//! decodes the framed output stream, and construction of the streaming
//! exec URL (the gateway's agent channel owns the actual socket).

mod client;

pub use client::{Cmd, ExecOpts, ExecOutput, SpriteClient, Sprite, StreamOpts};
