//! Delta coalescing for streamed replies
//!
//! Token deltas arrive far faster than either the database or SSE clients
//! want them. A [`Coalescer`] buffers deltas and reports a batch as due once
//! its interval has elapsed or its size threshold is reached.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Measure {
    Chars,
    Bytes,
}

impl Measure {
    fn len(&self, text: &str) -> usize {
        match self {
            Measure::Chars => text.chars().count(),
            Measure::Bytes => text.len(),
        }
    }
}

#[derive(Debug)]
pub struct Coalescer {
    pending: String,
    pending_len: usize,
    last_flush: Instant,
    interval: Duration,
    threshold: usize,
    measure: Measure,
}

impl Coalescer {
    pub fn new(interval: Duration, threshold: usize, measure: Measure) -> Self {
        Self {
            pending: String::new(),
            pending_len: 0,
            last_flush: Instant::now(),
            interval,
            threshold: threshold.max(1),
            measure,
        }
    }

    /// Database write throttle
    pub fn for_db(interval: Duration, chars: usize) -> Self {
        Self::new(interval, chars, Measure::Chars)
    }

    /// SSE emit throttle
    pub fn for_sse(interval: Duration, bytes: usize) -> Self {
        Self::new(interval, bytes, Measure::Bytes)
    }

    /// Buffer a delta; returns the coalesced batch when one is due
    pub fn push(&mut self, delta: &str) -> Option<String> {
        if delta.is_empty() {
            return None;
        }
        self.pending.push_str(delta);
        self.pending_len += self.measure.len(delta);
        if self.is_due() {
            self.flush()
        } else {
            None
        }
    }

    pub fn is_due(&self) -> bool {
        self.pending_len > 0
            && (self.pending_len >= self.threshold || self.last_flush.elapsed() >= self.interval)
    }

    pub fn has_pending(&self) -> bool {
        self.pending_len > 0
    }

    /// Take whatever is buffered, due or not
    pub fn flush(&mut self) -> Option<String> {
        self.last_flush = Instant::now();
        if self.pending_len == 0 {
            return None;
        }
        self.pending_len = 0;
        Some(std::mem::take(&mut self.pending))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_size_threshold_flushes() {
        let mut c = Coalescer::for_sse(Duration::from_millis(150), 8);
        assert_eq!(c.push("abc"), None);
        assert_eq!(c.push("defgh"), Some("abcdefgh".to_string()));
        assert!(!c.has_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_flushes() {
        let mut c = Coalescer::for_db(Duration::from_millis(750), 256);
        assert_eq!(c.push("hello"), None);
        tokio::time::advance(Duration::from_millis(800)).await;
        assert_eq!(c.push(" world"), Some("hello world".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_chars_and_bytes_differ() {
        let mut chars = Coalescer::for_db(Duration::from_secs(60), 4);
        let mut bytes = Coalescer::for_sse(Duration::from_secs(60), 4);
        assert_eq!(chars.push("éé"), None);
        assert_eq!(bytes.push("éé"), Some("éé".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_final_flush_drains_remainder() {
        let mut c = Coalescer::for_sse(Duration::from_secs(60), 512);
        c.push("tail");
        assert_eq!(c.flush(), Some("tail".to_string()));
        assert_eq!(c.flush(), None);
    }
}
