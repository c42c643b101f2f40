//! Word-window chunking with overlap.

use {
    mnemo_common::{Error, Result},
    mnemo_config::ChunkingConfig,
};

use crate::schema::Chunk;

/// Validated chunking parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunker {
    window: usize,
    overlap: usize,
}

impl Chunker {
    pub fn new(window_size_words: usize, overlap_words: usize) -> Result<Self> {
        if window_size_words == 0 {
            return Err(Error::InvalidConfiguration(
                "chunk window must be at least one word".into(),
            ));
        }
        if overlap_words >= window_size_words {
            return Err(Error::InvalidConfiguration(format!(
                "chunk overlap ({overlap_words}) must be smaller than the window ({window_size_words})"
            )));
        }
        Ok(Self {
            window: window_size_words,
            overlap: overlap_words,
        })
    }

    pub fn from_config(config: &ChunkingConfig) -> Result<Self> {
        Self::new(config.window_size_words, config.overlap_words)
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn overlap(&self) -> usize {
        self.overlap
    }

    /// Split `text` into overlapping windows of whitespace-separated words.
    ///
    /// Windows advance by `window - overlap` words. A document no longer than
    /// one window, including an empty one, yields exactly one chunk holding the
    /// whole text. Chunk text is the words re-joined with single spaces.
    pub fn chunk(&self, parent_key: &str, text: &str) -> Vec<Chunk> {
        let words: Vec<&str> = text.split_whitespace().collect();
        if words.len() <= self.window {
            return vec![Chunk {
                parent_key: parent_key.to_string(),
                index: 0,
                text: text.to_string(),
                overlap_words: 0,
                start_word: 0,
                end_word: words.len(),
            }];
        }

        let step = self.window - self.overlap;
        let mut chunks = Vec::new();
        let mut start = 0;
        loop {
            let end = (start + self.window).min(words.len());
            chunks.push(Chunk {
                parent_key: parent_key.to_string(),
                index: chunks.len(),
                text: words[start..end].join(" "),
                overlap_words: if start == 0 { 0 } else { self.overlap },
                start_word: start,
                end_word: end,
            });
            if end == words.len() {
                break;
            }
            start += step;
        }
        chunks
    }
}

/// One-shot form of [`Chunker::chunk`].
pub fn chunk(
    parent_key: &str,
    text: &str,
    window_size_words: usize,
    overlap_words: usize,
) -> Result<Vec<Chunk>> {
    Ok(Chunker::new(window_size_words, overlap_words)?.chunk(parent_key, text))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use {super::*, rstest::rstest};

    fn words(n: usize) -> String {
        (0..n).map(|i| format!("w{i}")).collect::<Vec<_>>().join(" ")
    }

    #[rstest]
    #[case(0)]
    #[case(1)]
    #[case(9)]
    #[case(10)]
    fn short_documents_yield_one_chunk(#[case] n: usize) {
        let text = words(n);
        let chunks = chunk("doc", &text, 10, 3).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, text);
        assert_eq!(chunks[0].overlap_words, 0);
    }

    #[rstest]
    #[case(10, 10)]
    #[case(10, 11)]
    #[case(0, 0)]
    fn bad_overlap_is_rejected(#[case] window: usize, #[case] overlap: usize) {
        assert!(matches!(
            chunk("doc", "a b c", window, overlap),
            Err(Error::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn windows_overlap_by_configured_words() {
        let chunks = chunk("doc", &words(12), 5, 2).unwrap();
        let spans: Vec<_> = chunks.iter().map(|c| (c.start_word, c.end_word)).collect();
        assert_eq!(spans, vec![(0, 5), (3, 8), (6, 11), (9, 12)]);
        assert_eq!(chunks[1].text, "w3 w4 w5 w6 w7");
        assert_eq!(chunks[1].overlap_words, 2);
        assert_eq!(chunks[3].vector_id(), "doc#3");
    }

    #[test]
    fn no_trailing_overlap_only_chunk() {
        // step 3: windows [0,5) [3,8) [6,11) and 11 words covered exactly.
        let chunks = chunk("doc", &words(11), 5, 2).unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks.last().unwrap().end_word, 11);
    }

    #[test]
    fn chunking_is_deterministic() {
        let chunker = Chunker::new(4, 1).unwrap();
        let text = "alpha  beta\ngamma delta epsilon zeta eta";
        assert_eq!(chunker.chunk("k", text), chunker.chunk("k", text));
        assert_eq!(chunker.chunk("k", text)[0].text, "alpha beta gamma delta");
    }
}
