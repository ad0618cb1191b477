//! Capped output buffer that keeps a stable prefix and a sliding suffix,
//! dropping the middle once the cap is exceeded.

use std::sync::Mutex;

/// Default retained output per exec session (1 MiB).
pub const DEFAULT_MAX_BYTES: usize = 1 << 20;

#[derive(Debug, Default)]
struct BufferInner {
    head: Vec<Vec<u8>>,
    tail: Vec<Vec<u8>>,
    head_bytes: usize,
    tail_bytes: usize,
    omitted: usize,
    total_written: usize,
}

/// Thread-safe head/tail buffer. The head budget is `⌊max/2⌋` and fills
/// first; the tail keeps the most recent `⌈max/2⌉` bytes, evicting its
/// oldest bytes into the `omitted` counter.
#[derive(Debug)]
pub struct HeadTailBuffer {
    max_bytes: usize,
    head_budget: usize,
    tail_budget: usize,
    inner: Mutex<BufferInner>,
}

impl HeadTailBuffer {
    pub fn new(max_bytes: usize) -> Self {
        let head_budget = max_bytes / 2;
        Self {
            max_bytes,
            head_budget,
            tail_budget: max_bytes - head_budget,
            inner: Mutex::new(BufferInner::default()),
        }
    }

    pub fn push(&self, chunk: &[u8]) {
        if chunk.is_empty() {
            return;
        }
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.total_written += chunk.len();

        if self.max_bytes == 0 {
            inner.omitted += chunk.len();
            return;
        }

        // Fill the head budget first; overflow spills into the tail.
        if inner.head_bytes < self.head_budget {
            let remaining = self.head_budget - inner.head_bytes;
            if chunk.len() <= remaining {
                inner.head_bytes += chunk.len();
                inner.head.push(chunk.to_vec());
                return;
            }
            let (head_part, tail_part) = chunk.split_at(remaining);
            if !head_part.is_empty() {
                inner.head_bytes += head_part.len();
                inner.head.push(head_part.to_vec());
            }
            self.push_to_tail(&mut inner, tail_part);
            return;
        }

        self.push_to_tail(&mut inner, chunk);
    }

    fn push_to_tail(&self, inner: &mut BufferInner, chunk: &[u8]) {
        if self.tail_budget == 0 {
            inner.omitted += chunk.len();
            return;
        }

        if chunk.len() >= self.tail_budget {
            // The chunk alone exceeds the tail budget; only its last
            // `tail_budget` bytes survive.
            let kept = &chunk[chunk.len() - self.tail_budget..];
            inner.omitted += inner.tail_bytes + (chunk.len() - kept.len());
            inner.tail = vec![kept.to_vec()];
            inner.tail_bytes = kept.len();
            return;
        }

        inner.tail_bytes += chunk.len();
        inner.tail.push(chunk.to_vec());
        self.trim_tail(inner);
    }

    fn trim_tail(&self, inner: &mut BufferInner) {
        let mut excess = inner.tail_bytes.saturating_sub(self.tail_budget);
        while excess > 0 && !inner.tail.is_empty() {
            let front_len = inner.tail[0].len();
            if excess >= front_len {
                excess -= front_len;
                inner.tail_bytes -= front_len;
                inner.omitted += front_len;
                inner.tail.remove(0);
            } else {
                inner.tail[0].drain(..excess);
                inner.tail_bytes -= excess;
                inner.omitted += excess;
                break;
            }
        }
    }

    /// All retained output, head then tail.
    pub fn snapshot(&self) -> Vec<u8> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut out = Vec::with_capacity(inner.head_bytes + inner.tail_bytes);
        for chunk in inner.head.iter().chain(inner.tail.iter()) {
            out.extend_from_slice(chunk);
        }
        out
    }

    /// Remove and return everything retained, resetting the buffer so the
    /// next collection only sees output that arrived after this call.
    pub fn drain(&self) -> Vec<u8> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut out = Vec::with_capacity(inner.head_bytes + inner.tail_bytes);
        for chunk in inner.head.drain(..) {
            out.extend_from_slice(&chunk);
        }
        for chunk in inner.tail.drain(..) {
            out.extend_from_slice(&chunk);
        }
        inner.head_bytes = 0;
        inner.tail_bytes = 0;
        inner.omitted = 0;
        out
    }

    pub fn retained_bytes(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.head_bytes + inner.tail_bytes
    }

    pub fn omitted_bytes(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .omitted
    }

    /// Total bytes ever pushed, including dropped ones.
    pub fn total_written(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .total_written
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn keeps_prefix_and_suffix_when_over_budget() {
        let buf = HeadTailBuffer::new(10);

        buf.push(b"0123456789");
        assert_eq!(buf.omitted_bytes(), 0);

        // Two bytes over the cap: the middle is dropped.
        buf.push(b"ab");
        assert!(buf.omitted_bytes() > 0);

        let out = buf.snapshot();
        assert!(out.len() <= 10);
        assert_eq!(&out[..5], b"01234");
        assert_eq!(&out[out.len() - 4..], b"89ab");
    }

    #[test]
    fn max_bytes_zero_drops_everything() {
        let buf = HeadTailBuffer::new(0);
        buf.push(b"abc");

        assert_eq!(buf.retained_bytes(), 0);
        assert_eq!(buf.omitted_bytes(), 3);
        assert!(buf.snapshot().is_empty());
    }

    #[test]
    fn head_budget_zero_keeps_only_last_byte_in_tail() {
        let buf = HeadTailBuffer::new(1);
        buf.push(b"abc");

        assert_eq!(buf.retained_bytes(), 1);
        assert_eq!(buf.omitted_bytes(), 2);
        assert_eq!(buf.snapshot(), b"c");
    }

    #[test]
    fn draining_resets_state() {
        let buf = HeadTailBuffer::new(10);
        buf.push(b"0123456789");
        buf.push(b"ab");

        let drained = buf.drain();
        assert!(!drained.is_empty());

        assert_eq!(buf.retained_bytes(), 0);
        assert_eq!(buf.omitted_bytes(), 0);
        assert!(buf.snapshot().is_empty());
    }

    #[test]
    fn chunk_larger_than_tail_budget_keeps_only_its_end() {
        let buf = HeadTailBuffer::new(10);
        buf.push(b"0123456789");

        // Tail budget is 5; this chunk replaces the whole tail.
        buf.push(b"ABCDEFGHIJK");

        let out = buf.snapshot();
        assert_eq!(&out[..5], b"01234");
        assert_eq!(&out[5..], b"GHIJK");
        assert!(buf.omitted_bytes() > 0);
    }

    #[test]
    fn fills_head_then_tail_across_multiple_chunks() {
        let buf = HeadTailBuffer::new(10);

        buf.push(b"01");
        buf.push(b"234");
        assert_eq!(buf.snapshot(), b"01234");

        buf.push(b"567");
        buf.push(b"89");
        assert_eq!(buf.snapshot(), b"0123456789");
        assert_eq!(buf.omitted_bytes(), 0);

        // One more byte evicts the oldest tail byte.
        buf.push(b"a");
        assert_eq!(buf.snapshot(), b"012346789a");
        assert_eq!(buf.omitted_bytes(), 1);
    }

    #[test]
    fn accounting_adds_up() {
        let buf = HeadTailBuffer::new(16);
        let mut pushed = 0usize;
        for i in 0..50 {
            let chunk = vec![b'a' + (i % 26) as u8; 7];
            buf.push(&chunk);
            pushed += chunk.len();
        }
        assert_eq!(buf.total_written(), pushed);
        assert_eq!(buf.retained_bytes() + buf.omitted_bytes(), pushed);
        assert!(buf.retained_bytes() <= 16);
    }

    #[test]
    fn empty_push_is_ignored() {
        let buf = HeadTailBuffer::new(10);
        buf.push(b"");
        assert_eq!(buf.retained_bytes(), 0);
        assert_eq!(buf.total_written(), 0);
    }
}
