//! Splitting a `text/event-stream` body into frames
//!
//! The backend writes `data: <json>\n\n` per event and finishes with
//! `data: [DONE]\n\n`. Reads from the socket do not line up with frame
//! boundaries, so the decoder keeps raw bytes until a blank line arrives.
//! Buffering bytes rather than strings also keeps multi-byte UTF-8 sequences
//! intact when they straddle two reads.

use bytes::{Buf, BytesMut};

/// Payload that marks the normal end of a stream
pub const DONE_SENTINEL: &str = "[DONE]";

/// One complete frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A `data:` payload (multiple data lines joined with `\n`)
    Data(String),
    /// The end-of-stream sentinel
    Done,
}

/// Incremental frame splitter
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
    /// Offset up to which `buffer` is known to hold no boundary
    scanned: usize,
    finished: bool,
}

impl FrameDecoder {
    /// Create an empty decoder
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one read from the body, returning every frame it completes.
    ///
    /// After the sentinel has been seen the decoder is finished and all
    /// further input is discarded.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Frame> {
        if self.finished {
            return Vec::new();
        }
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some((end, delimiter)) = find_boundary(&self.buffer, self.scanned) {
            let raw = self.buffer.split_to(end);
            self.buffer.advance(delimiter);
            self.scanned = 0;

            if let Some(frame) = parse_frame(&raw) {
                let done = frame == Frame::Done;
                frames.push(frame);
                if done {
                    self.finished = true;
                    self.buffer.clear();
                    break;
                }
            }
        }
        // A boundary may straddle the next read, so re-scan the tail.
        self.scanned = self.buffer.len().saturating_sub(3);
        frames
    }

    /// Flush a trailing frame that was not terminated by a blank line.
    pub fn finish(&mut self) -> Option<Frame> {
        if self.finished {
            return None;
        }
        self.finished = true;
        let rest = self.buffer.split();
        if rest.iter().all(|b| b.is_ascii_whitespace()) {
            return None;
        }
        parse_frame(&rest)
    }

    /// Whether the sentinel (or end of input) has been reached
    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

/// Locate the earliest blank-line boundary at or after `from`.
/// Returns (frame_end, delimiter_len).
fn find_boundary(buf: &[u8], from: usize) -> Option<(usize, usize)> {
    let lf = find(buf, b"\n\n", from).map(|i| (i, 2));
    let crlf = find(buf, b"\r\n\r\n", from).map(|i| (i, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from >= haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|i| i + from)
}

fn parse_frame(raw: &[u8]) -> Option<Frame> {
    let text = match std::str::from_utf8(raw) {
        Ok(text) => text,
        Err(e) => {
            tracing::warn!("Skipping frame with invalid UTF-8: {}", e);
            return None;
        }
    };

    let mut data = Vec::new();
    for line in text.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        match line.strip_prefix("data:") {
            Some(rest) => data.push(rest.strip_prefix(' ').unwrap_or(rest)),
            None => tracing::debug!("Ignoring non-data field line: {}", line),
        }
    }

    if data.is_empty() {
        return None;
    }

    let payload = data.join("\n");
    if payload.trim() == DONE_SENTINEL {
        Some(Frame::Done)
    } else {
        Some(Frame::Data(payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(s: &str) -> Frame {
        Frame::Data(s.to_string())
    }

    #[test]
    fn test_single_frame() {
        let mut dec = FrameDecoder::new();
        let frames = dec.push(b"data: {\"type\":\"done\"}\n\n");
        assert_eq!(frames, vec![data("{\"type\":\"done\"}")]);
    }

    #[test]
    fn test_several_frames_in_one_read() {
        let mut dec = FrameDecoder::new();
        let frames = dec.push(b"data: a\n\ndata: b\n\ndata: c\n\n");
        assert_eq!(frames, vec![data("a"), data("b"), data("c")]);
    }

    #[test]
    fn test_partial_frame_completed_on_next_read() {
        let mut dec = FrameDecoder::new();
        assert!(dec.push(b"data: {\"type\":\"te").is_empty());
        assert!(dec.push(b"xt\",\"content\":\"hi\"}\n").is_empty());
        let frames = dec.push(b"\ndata: next");
        assert_eq!(frames, vec![data("{\"type\":\"text\",\"content\":\"hi\"}")]);
        assert_eq!(dec.push(b"\n\n"), vec![data("next")]);
    }

    #[test]
    fn test_boundary_split_between_reads() {
        let mut dec = FrameDecoder::new();
        assert!(dec.push(b"data: x\n").is_empty());
        assert_eq!(dec.push(b"\n"), vec![data("x")]);
    }

    #[test]
    fn test_multibyte_char_split_across_reads() {
        let payload = "data: 分析完成\n\n".as_bytes();
        let (a, b) = payload.split_at(8); // inside the first CJK char
        let mut dec = FrameDecoder::new();
        assert!(dec.push(a).is_empty());
        assert_eq!(dec.push(b), vec![data("分析完成")]);
    }

    #[test]
    fn test_crlf_delimiters() {
        let mut dec = FrameDecoder::new();
        let frames = dec.push(b"data: one\r\n\r\ndata: two\r\n\r\n");
        assert_eq!(frames, vec![data("one"), data("two")]);
    }

    #[test]
    fn test_done_sentinel_finishes() {
        let mut dec = FrameDecoder::new();
        let frames = dec.push(b"data: a\n\ndata: [DONE]\n\ndata: late\n\n");
        assert_eq!(frames, vec![data("a"), Frame::Done]);
        assert!(dec.is_finished());
        assert!(dec.push(b"data: later\n\n").is_empty());
        assert_eq!(dec.finish(), None);
    }

    #[test]
    fn test_comments_and_other_fields_ignored() {
        let mut dec = FrameDecoder::new();
        let frames = dec.push(b": keep-alive\n\nevent: message\nid: 4\ndata: body\n\n");
        assert_eq!(frames, vec![data("body")]);
    }

    #[test]
    fn test_multiple_data_lines_joined() {
        let mut dec = FrameDecoder::new();
        let frames = dec.push(b"data: line1\ndata:line2\n\n");
        assert_eq!(frames, vec![data("line1\nline2")]);
    }

    #[test]
    fn test_finish_flushes_trailing_frame() {
        let mut dec = FrameDecoder::new();
        assert!(dec.push(b"data: tail").is_empty());
        assert_eq!(dec.finish(), Some(data("tail")));
        assert_eq!(dec.finish(), None);
    }

    #[test]
    fn test_finish_ignores_whitespace_tail() {
        let mut dec = FrameDecoder::new();
        dec.push(b"data: a\n\n\n");
        assert_eq!(dec.finish(), None);
    }

    #[test]
    fn test_invalid_utf8_frame_skipped() {
        let mut dec = FrameDecoder::new();
        let mut bytes = b"data: ".to_vec();
        bytes.extend_from_slice(&[0xff, 0xfe]);
        bytes.extend_from_slice(b"\n\ndata: ok\n\n");
        assert_eq!(dec.push(&bytes), vec![data("ok")]);
    }
}
