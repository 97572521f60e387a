//! Bounded per-session output history.

/// Append-only text buffer capped at a byte limit.
///
/// When an append pushes the buffer past its limit the oldest text is
/// dropped until roughly three quarters of the limit remain, so a full
/// buffer is shifted once per quarter-limit of output rather than on every
/// append. The cut lands just after a newline when one is close enough,
/// otherwise on the nearest char boundary.
#[derive(Debug, Clone)]
pub struct Scrollback {
    buffer: String,
    limit: usize,
    dropped_bytes: u64,
}

/// How far past the preferred cut point we look for a newline.
const LINE_SEARCH_WINDOW: usize = 4096;
/// A trim frees `limit / TRIM_DIVISOR` bytes of headroom.
const TRIM_DIVISOR: usize = 4;

impl Scrollback {
    pub fn new(limit: usize) -> Self {
        Self {
            buffer: String::new(),
            limit: limit.max(1),
            dropped_bytes: 0,
        }
    }

    pub fn push_str(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        self.buffer.push_str(text);
        self.enforce_limit();
    }

    /// Change the cap, trimming immediately if the buffer is now too large.
    pub fn set_limit(&mut self, limit: usize) {
        self.limit = limit.max(1);
        self.enforce_limit();
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn as_str(&self) -> &str {
        &self.buffer
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Total bytes discarded from the front since creation or the last clear.
    pub fn dropped_bytes(&self) -> u64 {
        self.dropped_bytes
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
        self.dropped_bytes = 0;
    }

    fn enforce_limit(&mut self) {
        let len = self.buffer.len();
        if len <= self.limit {
            return;
        }

        let target = self.limit - self.limit / TRIM_DIVISOR;
        // Cutting before `min_cut` would leave more than `limit` bytes.
        let min_cut = self.char_boundary_at_or_after(len - self.limit);
        let preferred = self.char_boundary_at_or_after(len - target).max(min_cut);

        let bytes = self.buffer.as_bytes();
        let start = min_cut.saturating_sub(1);
        let cut = if let Some(newline) = bytes[start..preferred].iter().rposition(|&b| b == b'\n') {
            start + newline + 1
        } else {
            let search_end = (preferred + LINE_SEARCH_WINDOW).min(len);
            match bytes[preferred..search_end].iter().position(|&b| b == b'\n') {
                Some(newline) => preferred + newline + 1,
                None => preferred,
            }
        };

        self.buffer.drain(..cut);
        self.dropped_bytes += cut as u64;
    }

    fn char_boundary_at_or_after(&self, mut index: usize) -> usize {
        while !self.buffer.is_char_boundary(index) {
            index += 1;
        }
        index
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[test]
    fn keeps_everything_under_limit() {
        let mut scrollback = Scrollback::new(100);
        scrollback.push_str("hello ");
        scrollback.push_str("world");
        assert_eq!(scrollback.as_str(), "hello world");
        assert_eq!(scrollback.dropped_bytes(), 0);
    }

    #[test]
    fn drops_oldest_whole_lines() {
        let mut scrollback = Scrollback::new(12);
        scrollback.push_str("line one\nline two\nline three\n");
        assert!(scrollback.len() <= 12);
        assert_eq!(scrollback.as_str(), "line three\n");
    }

    #[test]
    fn cuts_on_char_boundary_without_newlines() {
        let mut scrollback = Scrollback::new(5);
        scrollback.push_str("ééééé");
        assert!(scrollback.len() <= 5);
        assert!(scrollback.as_str().chars().all(|c| c == 'é'));
    }

    #[test]
    fn shrinking_limit_trims_existing_text() {
        let mut scrollback = Scrollback::new(1024);
        scrollback.push_str("a\nb\nc\n");
        scrollback.set_limit(2);
        assert_eq!(scrollback.as_str(), "c\n");
        assert_eq!(scrollback.limit(), 2);
    }

    #[test]
    fn clear_empties_buffer() {
        let mut scrollback = Scrollback::new(16);
        scrollback.push_str("data\nmore data\nand more\n");
        assert!(scrollback.dropped_bytes() > 0);
        scrollback.clear();
        assert!(scrollback.is_empty());
        assert_eq!(scrollback.dropped_bytes(), 0);
    }

    #[test]
    fn full_buffer_is_trimmed_in_batches() {
        let limit = 4096;
        let line = format!("{}\n", "x".repeat(99));
        let mut scrollback = Scrollback::new(limit);
        let mut trims = 0;
        for _ in 0..1000 {
            let dropped_before = scrollback.dropped_bytes();
            scrollback.push_str(&line);
            if scrollback.dropped_bytes() != dropped_before {
                trims += 1;
            }
            assert!(scrollback.len() <= limit);
        }
        // 100 KB through a 4 KiB buffer: trimming on every append would be ~960 trims.
        assert!(trims <= 110, "trimmed {} times", trims);
        assert!(scrollback.len() >= limit / 2);
        assert!(scrollback.as_str().ends_with(&line));
    }

    proptest! {
        #[test]
        fn never_exceeds_limit(
            limit in 1usize..256,
            chunks in prop::collection::vec(".{0,64}", 0..20),
        ) {
            let mut scrollback = Scrollback::new(limit);
            let mut total = 0usize;
            for chunk in &chunks {
                scrollback.push_str(chunk);
                total += chunk.len();
            }
            prop_assert!(scrollback.len() <= limit);
            prop_assert_eq!(scrollback.len() as u64 + scrollback.dropped_bytes(), total as u64);
        }

        #[test]
        fn retained_text_is_suffix_of_input(chunks in prop::collection::vec("[a-z\n]{0,32}", 0..20)) {
            let mut scrollback = Scrollback::new(40);
            let mut all = String::new();
            for chunk in &chunks {
                scrollback.push_str(chunk);
                all.push_str(chunk);
            }
            prop_assert!(all.ends_with(scrollback.as_str()));
        }
    }
}
