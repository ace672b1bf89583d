//! Stateful byte-level scanner for OSC shell-integration sequences.
//!
//! Detects `OSC 133` prompt/command markers in raw PTY output while passing
//! every other byte through untouched. State persists across calls so
//! sequences split across read boundaries parse identically to unsplit input.

/// Exit code reported when a command-end marker carries no parseable code.
/// Real shell exits are 0..=255, so -1 is unambiguous.
pub const FALLBACK_EXIT_CODE: i32 = -1;

/// Payload cap. A marker payload is a handful of bytes; anything larger is
/// not ours and gets flushed back into the output stream.
const MAX_PAYLOAD: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OscKind {
    /// `133;A`: the shell is about to draw a prompt.
    PromptStart,
    /// `133;B` or `133;C`: a command line has been accepted and is running.
    CommandStart,
    /// `133;D[;code]`: a command finished with the given exit code.
    CommandEnd { exit_code: i32 },
    /// Any other OSC payload (window titles, other integrations). Stripped
    /// from output but never acted on.
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OscSequence {
    pub kind: OscKind,
    /// Original sequence bytes including the terminator.
    pub raw: Vec<u8>,
}

/// What one `scan` call produced: the bytes that belong in the output stream
/// and the complete marker sequences that were removed from it.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ScanChunk {
    pub passthrough: Vec<u8>,
    pub sequences: Vec<OscSequence>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    Ground,
    Esc,
    Osc,
    OscEsc,
}

/// Byte-level scanner that removes complete `ESC ] ... BEL` / `ESC ] ... ESC \`
/// sequences from a stream and classifies them. Bytes held while a candidate
/// sequence is forming are flushed back into the passthrough if the sequence
/// aborts, so no output byte is ever lost.
pub struct OscScanner {
    state: ScanState,
    payload: Vec<u8>,
    seq_bytes: Vec<u8>,
}

impl OscScanner {
    pub fn new() -> Self {
        Self {
            state: ScanState::Ground,
            payload: Vec::new(),
            seq_bytes: Vec::new(),
        }
    }

    /// Scan a chunk of raw PTY output.
    pub fn scan(&mut self, data: &[u8]) -> ScanChunk {
        let mut out = ScanChunk::default();

        for &byte in data {
            match self.state {
                ScanState::Ground => {
                    if byte == 0x1b {
                        self.state = ScanState::Esc;
                        self.seq_bytes.push(byte);
                    } else {
                        out.passthrough.push(byte);
                    }
                }

                ScanState::Esc => {
                    if byte == b']' {
                        self.state = ScanState::Osc;
                        self.seq_bytes.push(byte);
                    } else if byte == 0x1b {
                        // ESC ESC: the first cannot start a sequence anymore.
                        out.passthrough.push(0x1b);
                    } else {
                        // Not an OSC introducer (CSI, charset selects, ...).
                        self.seq_bytes.push(byte);
                        self.abort(&mut out.passthrough);
                    }
                }

                ScanState::Osc => {
                    if byte == 0x07 {
                        self.seq_bytes.push(byte);
                        self.complete(&mut out.sequences);
                    } else if byte == 0x1b {
                        self.state = ScanState::OscEsc;
                        self.seq_bytes.push(byte);
                    } else if byte < 0x20 || byte == 0x7f {
                        // Control bytes never appear in a well-formed payload.
                        self.seq_bytes.push(byte);
                        self.abort(&mut out.passthrough);
                    } else if self.payload.len() >= MAX_PAYLOAD {
                        self.seq_bytes.push(byte);
                        self.abort(&mut out.passthrough);
                    } else {
                        self.payload.push(byte);
                        self.seq_bytes.push(byte);
                    }
                }

                ScanState::OscEsc => {
                    if byte == b'\\' {
                        self.seq_bytes.push(byte);
                        self.complete(&mut out.sequences);
                    } else if byte == 0x1b {
                        // Still not ST; the held bytes go back to the stream
                        // and this ESC may start a fresh sequence.
                        out.passthrough.append(&mut self.seq_bytes);
                        self.payload.clear();
                        self.seq_bytes.push(0x1b);
                        self.state = ScanState::Esc;
                    } else {
                        self.seq_bytes.push(byte);
                        self.abort(&mut out.passthrough);
                    }
                }
            }
        }

        out
    }

    /// Flush whatever is still held mid-sequence. Call when the stream ends
    /// and nothing further can complete a pending sequence.
    pub fn finish(&mut self) -> Vec<u8> {
        self.state = ScanState::Ground;
        self.payload.clear();
        std::mem::take(&mut self.seq_bytes)
    }

    fn complete(&mut self, sequences: &mut Vec<OscSequence>) {
        let kind = classify(&self.payload);
        let raw = std::mem::take(&mut self.seq_bytes);
        sequences.push(OscSequence { kind, raw });
        self.payload.clear();
        self.state = ScanState::Ground;
    }

    fn abort(&mut self, passthrough: &mut Vec<u8>) {
        passthrough.append(&mut self.seq_bytes);
        self.payload.clear();
        self.state = ScanState::Ground;
    }
}

/// Classify a complete OSC payload.
fn classify(payload: &[u8]) -> OscKind {
    let Some(rest) = payload.strip_prefix(b"133;") else {
        return OscKind::Unknown;
    };
    match rest {
        b"A" => OscKind::PromptStart,
        b"B" | b"C" => OscKind::CommandStart,
        _ if rest.first() == Some(&b'D') => OscKind::CommandEnd {
            exit_code: parse_exit_code(&rest[1..]),
        },
        _ => OscKind::Unknown,
    }
}

/// Parse the exit code from the bytes following `D`. Accepts `;<int>` with
/// optional further `;`-separated fields; anything else yields
/// [`FALLBACK_EXIT_CODE`].
fn parse_exit_code(rest: &[u8]) -> i32 {
    let Some(params) = rest.strip_prefix(b";") else {
        return FALLBACK_EXIT_CODE;
    };
    let first = params.split(|&b| b == b';').next().unwrap_or(&[]);
    std::str::from_utf8(first)
        .ok()
        .and_then(|s| s.parse::<i32>().ok())
        .unwrap_or(FALLBACK_EXIT_CODE)
}

/// Remove every complete OSC sequence from `text`, keeping all other bytes.
pub fn strip_osc(text: &str) -> String {
    let mut scanner = OscScanner::new();
    let mut chunk = scanner.scan(text.as_bytes());
    chunk.passthrough.extend(scanner.finish());
    String::from_utf8_lossy(&chunk.passthrough).into_owned()
}
