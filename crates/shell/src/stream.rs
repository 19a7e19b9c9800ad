//! Byte-stream retention for a shell session's stdout/stderr.
//!
//! Each stream is retained as a *tail*: once more than `cap` bytes have ever
//! been appended, the oldest bytes are dropped but `offset` advances to match,
//! so `offset + data.len() == total bytes ever appended` always holds —
//! callers track "absolute positions" into the conceptually-infinite stream
//! and slice relative to whatever is still retained.

/// Trims `s` to its last `max_chars` chars, prefixing `...[truncated]` when
/// anything was cut. Shared by the ephemeral and session-backed command
/// paths so both report output the same way once it exceeds the configured
/// ceiling.
pub fn truncate_tail(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let tail: String = s.chars().rev().take(max_chars).collect::<Vec<_>>().into_iter().rev().collect();
    format!("...[truncated]{tail}")
}

#[derive(Debug, Default)]
pub struct RetainedStream {
    /// Absolute position of `data[0]` in the full (unretained) stream.
    offset: usize,
    data: Vec<u8>,
    cap: usize,
}

impl RetainedStream {
    pub fn new(cap: usize) -> Self {
        Self {
            offset: 0,
            data: Vec::new(),
            cap: cap.max(1),
        }
    }

    /// Absolute position one past the last byte ever appended.
    pub fn total_len(&self) -> usize {
        self.offset + self.data.len()
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
        if self.data.len() > self.cap {
            let drop = self.data.len() - self.cap;
            self.data.drain(0..drop);
            self.offset += drop;
        }
    }

    /// Slice of the stream from absolute position `from` to the current end.
    /// Positions before what is retained are clamped up to `self.offset`
    /// (the best this stream can still report).
    pub fn slice_from(&self, from: usize) -> &[u8] {
        let start = from.saturating_sub(self.offset).min(self.data.len());
        &self.data[start..]
    }

    /// Slice of the stream between two absolute positions.
    pub fn slice(&self, from: usize, to: usize) -> &[u8] {
        let start = from.saturating_sub(self.offset).min(self.data.len());
        let end = to.saturating_sub(self.offset).min(self.data.len());
        if start >= end {
            &[]
        } else {
            &self.data[start..end]
        }
    }

    /// Drops the retention window's contents before absolute position `pos`.
    /// Used to excise a consumed sentinel line from the stdout window.
    pub fn truncate_before(&mut self, pos: usize) {
        if pos <= self.offset {
            return;
        }
        let drop = (pos - self.offset).min(self.data.len());
        self.data.drain(0..drop);
        self.offset += drop;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_advances_offset_once_over_cap() {
        let mut s = RetainedStream::new(4);
        s.append(b"ab");
        s.append(b"cdef");
        assert_eq!(s.total_len(), 6);
        assert_eq!(s.offset + s.data.len(), s.total_len());
        assert_eq!(&s.data, b"cdef");
        assert_eq!(s.offset, 2);
    }

    #[test]
    fn slice_from_clamps_to_retained_window() {
        let mut s = RetainedStream::new(4);
        s.append(b"abcdef");
        assert_eq!(s.slice_from(0), b"cdef");
        assert_eq!(s.slice_from(3), b"ef");
        assert_eq!(s.slice_from(6), b"");
    }

    #[test]
    fn truncate_before_excises_sentinel_prefix() {
        let mut s = RetainedStream::new(100);
        s.append(b"hello\n__SENTINEL__\nmore");
        s.truncate_before(6);
        assert_eq!(&s.data, b"__SENTINEL__\nmore");
        assert_eq!(s.offset, 6);
    }
}
