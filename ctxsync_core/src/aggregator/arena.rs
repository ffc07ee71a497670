//! Word arena for the records of one flush
//!
//! Record payloads are appended to one growing buffer and referred to by
//! `(offset, len)` spans. The whole arena is cleared at once when the flush
//! completes, so no record needs its own allocation or lifetime tracking.

/// Location of a payload inside a [`RecordArena`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WordSpan {
    offset: u32,
    len: u16,
}

impl WordSpan {
    #[inline]
    pub fn offset(&self) -> usize {
        self.offset as usize
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Bulk-freed storage for record payload words
#[derive(Debug, Default)]
pub struct RecordArena {
    words: Vec<u32>,
}

impl RecordArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(words: usize) -> Self {
        Self {
            words: Vec::with_capacity(words),
        }
    }

    /// Copy `payload` into the arena
    pub fn push(&mut self, payload: &[u32]) -> WordSpan {
        let span = WordSpan {
            offset: self.words.len() as u32,
            len: payload.len() as u16,
        };
        self.words.extend_from_slice(payload);
        span
    }

    pub fn get(&self, span: WordSpan) -> &[u32] {
        &self.words[span.offset()..span.offset() + span.len()]
    }

    /// Words stored since the last clear
    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Release every span at once; capacity is kept for the next flush
    pub fn clear(&mut self) {
        self.words.clear();
    }
}
