//! Frame codec for the sprite exec byte stream.
//!
//! The stream interleaves chunks from three logical channels, each frame
//! prefixed with a one-byte tag: 1 = stdout, 2 = stderr, 3 = exit marker
//! (exactly one payload byte, the exit code). Chunk payloads run until the
//! next tag byte or the end of input; frames may be split arbitrarily
//! across network reads, so the decoder is an incremental state machine.
//!
//! The scan-for-tag rule is sound for this protocol because the agent's
//! stdout is JSON lines and human-readable text — control bytes 0x01-0x03
//! never appear unescaped inside a chunk.

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    Exit(u8),
}

/// Single byte written to the agent's stdin to interrupt it.
pub const INTERRUPT_BYTE: u8 = 0x03;

const TAG_STDOUT: u8 = 1;
const TAG_STDERR: u8 = 2;
const TAG_EXIT: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Channel {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    /// Expecting a tag byte.
    Tag,
    /// Inside a chunk; payload continues until the next tag byte.
    Chunk(Channel),
    /// Tag 3 seen; the next byte is the exit code.
    ExitCode,
}

/// Incremental decoder. Feed it byte slices as they arrive; it emits
/// every frame completed so far and carries partial state across calls.
#[derive(Debug)]
pub struct FrameDecoder {
    state: DecodeState,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            state: DecodeState::Tag,
        }
    }

    /// Decode as many frames as `bytes` completes. A chunk cut off by the
    /// end of the buffer is emitted as its own frame; if the next buffer
    /// continues the same channel (no leading tag byte) the continuation
    /// is emitted as another frame on that channel. Zero-length chunks
    /// (two adjacent tag bytes) produce no frame and no state corruption.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Frame> {
        let mut frames = Vec::new();
        let mut i = 0;

        while i < bytes.len() {
            match self.state {
                DecodeState::Tag => {
                    match bytes[i] {
                        TAG_STDOUT => self.state = DecodeState::Chunk(Channel::Stdout),
                        TAG_STDERR => self.state = DecodeState::Chunk(Channel::Stderr),
                        TAG_EXIT => self.state = DecodeState::ExitCode,
                        other => {
                            // Not a recognized tag. Treat the byte as stray
                            // stdout data rather than dropping it.
                            tracing::debug!(byte = other, "unexpected frame tag");
                            self.state = DecodeState::Chunk(Channel::Stdout);
                            continue;
                        }
                    }
                    i += 1;
                }
                DecodeState::Chunk(channel) => {
                    let end = bytes[i..]
                        .iter()
                        .position(|b| matches!(*b, TAG_STDOUT | TAG_STDERR | TAG_EXIT))
                        .map(|p| i + p)
                        .unwrap_or(bytes.len());
                    if end > i {
                        let payload = bytes[i..end].to_vec();
                        frames.push(match channel {
                            Channel::Stdout => Frame::Stdout(payload),
                            Channel::Stderr => Frame::Stderr(payload),
                        });
                    }
                    if end < bytes.len() {
                        self.state = DecodeState::Tag;
                    }
                    i = end;
                }
                DecodeState::ExitCode => {
                    frames.push(Frame::Exit(bytes[i]));
                    self.state = DecodeState::Tag;
                    i += 1;
                }
            }
        }

        frames
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Line assembly
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Buffers stdout bytes until a newline so the event parser only ever
/// sees complete lines. `flush` surfaces whatever partial trailing text
/// remains when the stream ends (emitted as unparsed output).
#[derive(Debug, Default)]
pub struct LineAssembler {
    buf: Vec<u8>,
}

impl LineAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes and return every complete line (without the newline).
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(bytes);

        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop(); // the newline
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    /// Drain the trailing partial line, if any.
    pub fn flush(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buf);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_stdout_frame() {
        let mut dec = FrameDecoder::new();
        let frames = dec.push(&[1, b'h', b'i']);
        assert_eq!(frames, vec![Frame::Stdout(b"hi".to_vec())]);
    }

    #[test]
    fn interleaved_channels() {
        let mut dec = FrameDecoder::new();
        let frames = dec.push(&[1, b'a', 2, b'e', b'r', b'r', 1, b'b']);
        assert_eq!(
            frames,
            vec![
                Frame::Stdout(b"a".to_vec()),
                Frame::Stderr(b"err".to_vec()),
                Frame::Stdout(b"b".to_vec()),
            ]
        );
    }

    #[test]
    fn exit_frame_carries_code() {
        let mut dec = FrameDecoder::new();
        let frames = dec.push(&[1, b'x', 3, 42]);
        assert_eq!(
            frames,
            vec![Frame::Stdout(b"x".to_vec()), Frame::Exit(42)]
        );
    }

    #[test]
    fn exit_code_split_across_reads() {
        let mut dec = FrameDecoder::new();
        assert_eq!(dec.push(&[3]), vec![]);
        assert_eq!(dec.push(&[0]), vec![Frame::Exit(0)]);
    }

    #[test]
    fn chunk_split_across_reads_stays_on_channel() {
        let mut dec = FrameDecoder::new();
        let first = dec.push(&[2, b'p', b'a']);
        assert_eq!(first, vec![Frame::Stderr(b"pa".to_vec())]);
        // No tag byte: continuation of the stderr chunk.
        let second = dec.push(&[b'r', b't']);
        assert_eq!(second, vec![Frame::Stderr(b"rt".to_vec())]);
    }

    #[test]
    fn zero_length_chunk_does_not_emit() {
        let mut dec = FrameDecoder::new();
        // stdout tag immediately followed by stderr tag.
        let frames = dec.push(&[1, 2, b'e']);
        assert_eq!(frames, vec![Frame::Stderr(b"e".to_vec())]);
    }

    #[test]
    fn empty_input_is_a_no_op() {
        let mut dec = FrameDecoder::new();
        assert_eq!(dec.push(&[]), vec![]);
        assert_eq!(dec.push(&[1, b'a']), vec![Frame::Stdout(b"a".to_vec())]);
    }

    #[test]
    fn round_trip_interleaving_with_trailing_exit() {
        // Encode three logical channels, decode, and compare.
        let mut encoded = Vec::new();
        encoded.extend_from_slice(&[1]);
        encoded.extend_from_slice(b"out1");
        encoded.extend_from_slice(&[2]);
        encoded.extend_from_slice(b"err1");
        encoded.extend_from_slice(&[1]);
        encoded.extend_from_slice(b"out2");
        encoded.extend_from_slice(&[3, 7]);

        let mut dec = FrameDecoder::new();
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit = None;
        // Feed one byte at a time to exercise every split point.
        for b in &encoded {
            for frame in dec.push(std::slice::from_ref(b)) {
                match frame {
                    Frame::Stdout(d) => stdout.extend(d),
                    Frame::Stderr(d) => stderr.extend(d),
                    Frame::Exit(c) => exit = Some(c),
                }
            }
        }
        assert_eq!(stdout, b"out1out2");
        assert_eq!(stderr, b"err1");
        assert_eq!(exit, Some(7));
    }

    // ── LineAssembler ──────────────────────────────────────────────

    #[test]
    fn assembles_split_lines() {
        let mut asm = LineAssembler::new();
        assert_eq!(asm.push(b"{\"type\":\"ass"), Vec::<String>::new());
        assert_eq!(
            asm.push(b"istant\"}\n"),
            vec!["{\"type\":\"assistant\"}".to_string()]
        );
    }

    #[test]
    fn multiple_lines_in_one_push() {
        let mut asm = LineAssembler::new();
        assert_eq!(asm.push(b"a\nb\nc"), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(asm.flush(), Some("c".to_string()));
        assert_eq!(asm.flush(), None);
    }

    #[test]
    fn crlf_is_stripped() {
        let mut asm = LineAssembler::new();
        assert_eq!(asm.push(b"hello\r\n"), vec!["hello".to_string()]);
    }
}
