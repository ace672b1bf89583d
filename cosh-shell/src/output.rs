//! Output cleaning.
//!
//! Raw PTY output carries integration artifacts the caller must never see:
//! OSC marker sequences, the completion-marker echo lines, and the
//! initialization sentinel. Cleaning removes exactly those and nothing else;
//! prompts, echoed input, and ANSI color all survive.

use crate::integration::{DONE_MARKER_PREFIX, READY_SENTINEL};
use crate::osc::{OscScanner, strip_osc};

/// Whether a line (after ANSI stripping) is internal noise.
fn is_internal_line(line: &str) -> bool {
    let stripped = strip_ansi_escapes::strip_str(line);
    stripped.contains(DONE_MARKER_PREFIX) || stripped.contains(READY_SENTINEL)
}

/// Clean a complete captured transcript for returning to the caller.
///
/// Strips OSC sequences, drops marker/sentinel lines, normalizes CRLF line
/// endings, and trims trailing blank lines.
pub fn clean(raw: &str) -> String {
    let stripped = strip_osc(raw);

    let mut lines: Vec<&str> = Vec::new();
    for line in stripped.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if !is_internal_line(line) {
            lines.push(line);
        }
    }

    while lines.last().is_some_and(|l| l.trim().is_empty()) {
        lines.pop();
    }

    lines.join("\n")
}

/// Incremental display filter.
///
/// Applies the same suppression as [`clean`] to a live stream. A trailing
/// partial line is emitted eagerly unless its tail could still grow into a
/// marker or sentinel, in which case that tail is withheld until the line
/// completes and the call can decide.
pub struct RealtimeFilter {
    scanner: OscScanner,
    /// Unemitted tail of the current (incomplete) line.
    pending: Vec<u8>,
    /// Whether any part of the current line has already been shown.
    emitted_this_line: bool,
}

impl RealtimeFilter {
    pub fn new() -> Self {
        Self {
            scanner: OscScanner::new(),
            pending: Vec::new(),
            emitted_this_line: false,
        }
    }

    /// Filter one chunk, returning the text safe to display now.
    pub fn push(&mut self, chunk: &[u8]) -> String {
        let scanned = self.scanner.scan(chunk);
        self.filter_bytes(&scanned.passthrough)
    }

    /// Flush everything still withheld. Call once when the stream ends.
    pub fn flush(&mut self) -> String {
        let tail = self.scanner.finish();
        let mut out = self.filter_bytes(&tail);

        let pending = std::mem::take(&mut self.pending);
        if !pending.is_empty() {
            let text = String::from_utf8_lossy(&pending);
            if !is_internal_line(&text) {
                out.push_str(&text);
            }
        }
        self.emitted_this_line = false;
        out
    }

    fn filter_bytes(&mut self, data: &[u8]) -> String {
        let mut out = String::new();
        let mut buf = std::mem::take(&mut self.pending);
        buf.extend_from_slice(data);

        // Process complete lines.
        while let Some(nl) = buf.iter().position(|&b| b == b'\n') {
            let rest = buf.split_off(nl + 1);
            let line = buf;
            buf = rest;

            let text = String::from_utf8_lossy(&line);
            let content = text.strip_suffix('\n').unwrap_or(&text);
            let content = content.strip_suffix('\r').unwrap_or(content);
            if !is_internal_line(content) {
                out.push_str(content);
                out.push('\n');
            } else if self.emitted_this_line {
                // Part of this line is already on screen; close it.
                out.push('\n');
            }
            self.emitted_this_line = false;
        }

        // Decide how much of the partial tail can be shown.
        if !buf.is_empty() {
            let text = String::from_utf8_lossy(&buf);
            if is_internal_line(&text) {
                // Already contains a marker; withhold until the line completes.
                self.pending = buf;
            } else {
                let hold = suspicious_suffix_len(&buf);
                let show = buf.len() - hold;
                if show > 0 {
                    out.push_str(&String::from_utf8_lossy(&buf[..show]));
                    self.emitted_this_line = true;
                }
                self.pending = buf[show..].to_vec();
            }
        }

        out
    }
}

impl Default for RealtimeFilter {
    fn default() -> Self {
        Self::new()
    }
}

/// Length of the longest suffix of `data` that is a proper prefix of one of
/// the internal sentinels. Display of those bytes is deferred until the next
/// chunk settles what they are.
fn suspicious_suffix_len(data: &[u8]) -> usize {
    let mut longest = 0;
    for sentinel in [DONE_MARKER_PREFIX.as_bytes(), READY_SENTINEL.as_bytes()] {
        let max = sentinel.len().min(data.len());
        for take in (longest + 1)..=max {
            if data[data.len() - take..] == sentinel[..take] {
                longest = take;
            }
        }
    }
    longest
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn clean_strips_osc_sequences() {
        let raw = "hello\u{1b}]133;D;0\u{7}\nworld";
        assert_eq!(clean(raw), "hello\nworld");
    }

    #[test]
    fn clean_drops_marker_lines() {
        let raw = "$ echo '__COSH_DONE_abc__'\nout\n__COSH_DONE_abc__\n";
        assert_eq!(clean(raw), "out");
    }

    #[test]
    fn clean_drops_ready_sentinel_lines() {
        let raw = "echo '__COSH_SHELL_READY__'\n__COSH_SHELL_READY__\nhi";
        assert_eq!(clean(raw), "hi");
    }

    #[test]
    fn clean_matches_marker_lines_under_ansi_color() {
        let raw = "keep\n\u{1b}[32m__COSH_DONE_x__\u{1b}[0m\n";
        assert_eq!(clean(raw), "keep");
    }

    #[test]
    fn clean_preserves_prompts_and_color() {
        let raw = "\u{1b}[1;32muser@host\u{1b}[0m$ ls\nfile.txt";
        assert_eq!(clean(raw), raw);
    }

    #[test]
    fn clean_normalizes_crlf() {
        assert_eq!(clean("a\r\nb\r\n"), "a\nb");
    }

    #[test]
    fn clean_trims_trailing_blank_lines_only() {
        assert_eq!(clean("a\n\nb\n\n \n"), "a\n\nb");
    }

    #[test]
    fn realtime_passes_partial_lines_promptly() {
        let mut filter = RealtimeFilter::new();
        assert_eq!(filter.push(b"bash-5.2$ "), "bash-5.2$ ");
    }

    #[test]
    fn realtime_suppresses_marker_split_across_chunks() {
        let mut filter = RealtimeFilter::new();
        let mut shown = String::new();
        shown.push_str(&filter.push(b"__COSH_DO"));
        shown.push_str(&filter.push(b"NE_x__\r\n"));
        shown.push_str(&filter.push(b"real\n"));
        assert_eq!(shown, "real\n");
    }

    #[test]
    fn realtime_releases_withheld_non_marker_tail() {
        let mut filter = RealtimeFilter::new();
        let first = filter.push(b"value __COSH");
        assert_eq!(first, "value ");
        let second = filter.push(b"ION\n");
        assert_eq!(second, "__COSHION\n");
    }

    #[test]
    fn realtime_closes_partially_shown_marker_lines() {
        let mut filter = RealtimeFilter::new();
        let mut shown = String::new();
        shown.push_str(&filter.push(b"$ "));
        shown.push_str(&filter.push(b"echo '__COSH_DONE_x__'\r\n"));
        assert_eq!(shown, "$ \n");
    }

    #[test]
    fn realtime_strips_osc_split_across_chunks() {
        let mut filter = RealtimeFilter::new();
        let mut shown = String::new();
        shown.push_str(&filter.push(b"ok\x1b]133;"));
        shown.push_str(&filter.push(b"D;0\x07done\n"));
        assert_eq!(shown, "okdone\n");
    }

    #[test]
    fn realtime_flush_emits_pending_text() {
        let mut filter = RealtimeFilter::new();
        filter.push(b"tail __COSH");
        assert_eq!(filter.flush(), "__COSH");
    }

    #[test]
    fn realtime_flush_drops_pending_marker() {
        let mut filter = RealtimeFilter::new();
        filter.push(b"__COSH_DONE_zz__");
        assert_eq!(filter.flush(), "");
    }
}
