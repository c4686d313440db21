//! `sd-protocol` — the wire protocols between the gateway and a sprite.
//!
//! Two layers, both pure (no IO):
//!
//! 1. [`frames`] — the byte-level multiplexing of stdout/stderr/exit on a
//!    sprite exec stream, plus the interrupt byte written back to it.
//! 2. [`events`] — the newline-delimited stream-JSON protocol the inner
//!    agent speaks on stdout, parsed into a typed [`events::AgentEvent`]
//!    sum. [`tool_result`] holds the payload-shape extraction ladder for
//!    tool results.

pub mod events;
pub mod frames;
pub mod tool_result;

pub use events::{parse_line, AgentEvent, ToolUse};
pub use frames::{Frame, FrameDecoder, LineAssembler, INTERRUPT_BYTE};
pub use tool_result::{extract_tool_result, ExtractedResult};
