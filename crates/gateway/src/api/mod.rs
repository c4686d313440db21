//! The inbound HTTP/WS surface. Thin by design: handlers translate
//! between JSON and the runtime, nothing more.

pub mod admin;
pub mod auth;
pub mod repos;
pub mod router;
pub mod session_ws;
pub mod tasks;

pub use router::build_router;
