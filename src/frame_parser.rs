//! Boundary-based frame counting for `multipart/x-mixed-replace` bodies.
//!
//! Frames are never decoded or materialized; the parser only finds the
//! boundary token in an append-only buffer and counts the segments between
//! consecutive matches.

pub const FRAME_BOUNDARY: &[u8] = b"--frame";

/// Buffer size that triggers truncation.
pub const MAX_BUFFER_BYTES: usize = 1024 * 1024;

/// Trailing window kept after truncation.
pub const RETAINED_BUFFER_BYTES: usize = 512 * 1024;

#[derive(Debug)]
pub struct FrameParser {
    buffer: Vec<u8>,
    boundary: Vec<u8>,
    // Offset before which the buffer is known to contain no match start.
    scanned: usize,
    truncations: u64,
}

impl FrameParser {
    pub fn new() -> Self {
        Self::with_boundary(FRAME_BOUNDARY)
    }

    pub fn with_boundary(boundary: &[u8]) -> Self {
        Self {
            buffer: Vec::new(),
            boundary: boundary.to_vec(),
            scanned: 0,
            truncations: 0,
        }
    }

    /// Appends `chunk` and consumes every complete boundary in the buffer.
    ///
    /// Returns the number of frames completed by this call. A boundary found
    /// at offset 0 closes an empty segment: it is consumed but not counted.
    /// Feeding an empty chunk never counts anything, since everything that
    /// could match was already consumed by the previous call.
    pub fn feed(&mut self, chunk: &[u8]) -> u64 {
        self.buffer.extend_from_slice(chunk);

        let mut frames = 0;
        let mut cursor = 0;
        let mut search_from = self.scanned;

        while let Some(pos) = find(&self.buffer[search_from..], &self.boundary) {
            let match_start = search_from + pos;
            if match_start > cursor {
                frames += 1;
            }
            cursor = match_start + self.boundary.len();
            search_from = cursor;
        }

        if cursor > 0 {
            self.buffer.drain(..cursor);
        }

        if self.buffer.len() > MAX_BUFFER_BYTES {
            let excess = self.buffer.len() - RETAINED_BUFFER_BYTES;
            self.buffer.drain(..excess);
            self.truncations += 1;
        }

        // A boundary may straddle the end of the buffer; rescan that tail next time.
        self.scanned = self
            .buffer
            .len()
            .saturating_sub(self.boundary.len().saturating_sub(1));

        frames
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// How many times the buffer hit the ceiling and was cut back.
    pub fn truncations(&self) -> u64 {
        self.truncations
    }
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new()
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(payload: &[u8]) -> Vec<u8> {
        let mut part = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n".to_vec();
        part.extend_from_slice(payload);
        part.extend_from_slice(b"\r\n");
        part
    }

    #[test]
    fn boundary_at_offset_zero_is_consumed_but_not_counted() {
        let mut parser = FrameParser::new();
        assert_eq!(parser.feed(b"--frame"), 0);
        assert_eq!(parser.buffered(), 0);
    }

    #[test]
    fn counts_segments_between_boundaries() {
        let mut parser = FrameParser::new();
        let mut body = Vec::new();
        for _ in 0..3 {
            body.extend_from_slice(&frame(b"jpegdata"));
        }
        body.extend_from_slice(b"--frame");

        // Leading boundary opens the first segment, each later one closes a frame.
        assert_eq!(parser.feed(&body), 3);
        assert_eq!(parser.buffered(), 0);
    }

    #[test]
    fn feeding_nothing_does_not_double_count() {
        let mut parser = FrameParser::new();
        let mut body = frame(b"first");
        body.extend_from_slice(&frame(b"second"));

        assert_eq!(parser.feed(&body), 1);
        assert_eq!(parser.feed(&[]), 0);
        assert_eq!(parser.feed(&[]), 0);
    }

    #[test]
    fn boundary_split_across_chunks_is_found() {
        let mut parser = FrameParser::new();
        assert_eq!(parser.feed(b"--frame\r\n\r\nabc\r\n--fr"), 0);
        assert_eq!(parser.feed(b"ame\r\n\r\ndef"), 1);
        assert_eq!(parser.buffered(), b"\r\n\r\ndef".len());
    }

    #[test]
    fn adjacent_boundaries_count_nothing() {
        let mut parser = FrameParser::new();
        assert_eq!(parser.feed(b"--frame--frame--frame"), 0);
        assert_eq!(parser.buffered(), 0);
    }

    #[test]
    fn buffer_is_bounded_without_boundaries() {
        let mut parser = FrameParser::new();
        let chunk = vec![0xFFu8; 64 * 1024];
        for _ in 0..40 {
            parser.feed(&chunk);
            assert!(parser.buffered() <= MAX_BUFFER_BYTES);
        }
        assert!(parser.truncations() > 0);
        assert!(parser.buffered() >= RETAINED_BUFFER_BYTES);
    }

    #[test]
    fn frames_after_truncation_are_still_counted() {
        let mut parser = FrameParser::new();
        parser.feed(b"--frame");
        parser.feed(&vec![b'x'; MAX_BUFFER_BYTES + 1]);
        assert_eq!(parser.truncations(), 1);

        assert_eq!(parser.feed(b"--frame"), 1);
        assert_eq!(parser.buffered(), 0);
    }

    #[test]
    fn custom_boundary() {
        let mut parser = FrameParser::with_boundary(b"--myboundary");
        assert_eq!(parser.feed(b"--myboundary AAA --myboundary BBB --frame"), 1);
    }
}
