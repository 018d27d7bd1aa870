//! Token-aligned chunking with overlap.

use crate::tokens::{TokenEstimator, Tokenizer, APPROX_CHARS_PER_TOKEN};
use std::iter::FusedIterator;
use std::sync::Arc;
use tracing::{debug, error, info};

/// A contiguous slice of a larger text.
///
/// `start`/`end` are offsets in the unit the chunker walked: tokens when a
/// tokenizer was available, characters otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub index: usize,
    pub total: usize,
    pub text: String,
    pub start: usize,
    pub end: usize,
}

impl Chunk {
    pub fn is_last(&self) -> bool {
        self.index + 1 == self.total
    }
}

/// Splits long content into overlapping, token-bounded chunks.
#[derive(Debug, Clone)]
pub struct Chunker {
    estimator: Arc<TokenEstimator>,
}

impl Chunker {
    pub fn new(estimator: Arc<TokenEstimator>) -> Self {
        Self { estimator }
    }

    /// Lazily chunk `content` into windows of `target_tokens`, each repeating
    /// the last `overlap_tokens` of its predecessor.
    ///
    /// Content that fits in one window comes back as a single chunk equal to
    /// the input. An `overlap_tokens >= target_tokens` misconfiguration still
    /// terminates: the cursor is forced to the end of the current window.
    /// Token windows never split a multi-byte character, so a window may
    /// hold a few tokens less than `target_tokens`.
    pub fn chunk(&self, content: &str, target_tokens: usize, overlap_tokens: usize) -> Chunks {
        let target_tokens = target_tokens.max(1);
        if overlap_tokens >= target_tokens {
            error!(
                target_tokens,
                overlap_tokens, "chunk overlap must be smaller than the target size; chunks will not overlap"
            );
        }

        if let Some(tokens) = self.estimator.encode(content) {
            if tokens.len() <= target_tokens {
                debug!(tokens = tokens.len(), "content fits in a single chunk");
                return Chunks::whole(content);
            }
            let Some(tokenizer) = self.estimator.tokenizer().cloned() else {
                return Chunks::whole(content);
            };
            info!(
                total_tokens = tokens.len(),
                target_tokens,
                overlap_tokens,
                tokenizer = tokenizer.name(),
                "chunking content by tokens"
            );
            let len = tokens.len();
            return Chunks::windows(
                Source::Tokens { tokens, tokenizer },
                len,
                target_tokens,
                overlap_tokens,
            );
        }

        if TokenEstimator::approximate_count(content) <= target_tokens {
            return Chunks::whole(content);
        }
        let chars: Vec<char> = content.chars().collect();
        let len = chars.len();
        info!(
            total_chars = len,
            target_tokens, overlap_tokens, "tokenizer unavailable, chunking content by characters"
        );
        Chunks::windows(
            Source::Chars(chars),
            len,
            target_tokens * APPROX_CHARS_PER_TOKEN,
            overlap_tokens * APPROX_CHARS_PER_TOKEN,
        )
    }
}

/// A UTF-8 character is at most four bytes, and every byte-level token
/// carries at least one byte.
const MAX_TOKENS_PER_CHAR: usize = 4;

enum Source {
    Whole(Option<String>),
    Tokens {
        tokens: Vec<u32>,
        tokenizer: Arc<dyn Tokenizer>,
    },
    Chars(Vec<char>),
}

/// Token offsets that land on a character boundary of the decoded text.
///
/// Byte-level tokenizers can spread one character over several tokens, and
/// a window cut between them would not decode. Groups of tokens are decoded
/// from the last known boundary until they form whole characters. A group
/// that still fails at [`MAX_TOKENS_PER_CHAR`] is a real decode error, not a
/// split character; offsets from there on are left unsnapped.
fn char_boundaries(tokens: &[u32], tokenizer: &dyn Tokenizer) -> Vec<bool> {
    let mut boundary = vec![false; tokens.len() + 1];
    boundary[0] = true;
    let mut start = 0;
    while start < tokens.len() {
        let mut end = start + 1;
        while tokenizer.decode(&tokens[start..end]).is_err() {
            if end - start >= MAX_TOKENS_PER_CHAR || end == tokens.len() {
                debug!(offset = start, "undecodable tokens, windows from here are not snapped");
                boundary[start..].fill(true);
                return boundary;
            }
            end += 1;
        }
        boundary[end] = true;
        start = end;
    }
    boundary
}

/// Window arithmetic over `len` units, optionally restricted to boundaries.
struct Walk {
    len: usize,
    window: usize,
    overlap: usize,
    boundaries: Option<Vec<bool>>,
}

impl Walk {
    fn is_boundary(&self, offset: usize) -> bool {
        self.boundaries.as_ref().map_or(true, |b| b[offset])
    }

    /// End of the window starting at `start`, and where the next window starts.
    ///
    /// Ends snap back to the nearest boundary; only a single unit wider than
    /// the window pushes an end forward. The next start backs off by
    /// `overlap` from the end, snapped back as well, and is forced to the
    /// end when that would not advance.
    fn step(&self, start: usize) -> (usize, Option<usize>) {
        let limit = (start + self.window).min(self.len);
        let mut end = limit;
        while end > start + 1 && !self.is_boundary(end) {
            end -= 1;
        }
        if !self.is_boundary(end) {
            end = limit;
            while end < self.len && !self.is_boundary(end) {
                end += 1;
            }
        }
        if end >= self.len {
            return (self.len, None);
        }
        let mut next = end.saturating_sub(self.overlap);
        while next > start && !self.is_boundary(next) {
            next -= 1;
        }
        if next <= start {
            next = end;
        }
        (end, Some(next))
    }

    /// Number of windows the walk produces.
    fn count(&self) -> usize {
        let mut count = 0;
        let mut cursor = Some(0);
        while let Some(start) = cursor {
            count += 1;
            cursor = self.step(start).1;
        }
        count
    }
}

/// Lazy chunk sequence returned by [`Chunker::chunk`].
///
/// Iterate it once to completion or drop it; it cannot be restarted.
pub struct Chunks {
    source: Source,
    walk: Walk,
    cursor: Option<usize>,
    index: usize,
    total: usize,
}

impl Chunks {
    fn whole(content: &str) -> Self {
        Self {
            source: Source::Whole(Some(content.to_string())),
            walk: Walk {
                len: 0,
                window: 0,
                overlap: 0,
                boundaries: None,
            },
            cursor: None,
            index: 0,
            total: 1,
        }
    }

    fn windows(source: Source, len: usize, window: usize, overlap: usize) -> Self {
        let boundaries = match &source {
            Source::Tokens { tokens, tokenizer } => Some(char_boundaries(tokens, tokenizer.as_ref())),
            _ => None,
        };
        let walk = Walk {
            len,
            window,
            overlap,
            boundaries,
        };
        Self {
            source,
            total: walk.count(),
            walk,
            cursor: Some(0),
            index: 0,
        }
    }

    /// Number of chunks this sequence was planned with, including any that
    /// end up skipped.
    pub fn total(&self) -> usize {
        self.total
    }
}

impl Iterator for Chunks {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        if let Source::Whole(text) = &mut self.source {
            let text = text.take()?;
            let end = text.chars().count();
            return Some(Chunk {
                index: 0,
                total: 1,
                text,
                start: 0,
                end,
            });
        }

        loop {
            let start = self.cursor?;
            let (end, next) = self.walk.step(start);
            self.cursor = next;
            let index = self.index;
            self.index += 1;

            let decoded = match &self.source {
                Source::Tokens { tokens, tokenizer } => tokenizer.decode(&tokens[start..end]),
                Source::Chars(chars) => Ok(chars[start..end].iter().collect()),
                Source::Whole(_) => return None,
            };

            match decoded {
                Ok(text) => {
                    debug!(
                        chunk = index + 1,
                        total = self.total,
                        start,
                        end,
                        "yielding chunk"
                    );
                    return Some(Chunk {
                        index,
                        total: self.total,
                        text,
                        start,
                        end,
                    });
                }
                Err(e) => {
                    error!(
                        chunk = index + 1,
                        start,
                        end,
                        error = %e,
                        "failed to decode chunk window, skipping"
                    );
                }
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match &self.source {
            Source::Whole(text) => {
                let n = usize::from(text.is_some());
                (n, Some(n))
            }
            _ => {
                let remaining = if self.cursor.is_some() {
                    self.total - self.index
                } else {
                    0
                };
                (0, Some(remaining))
            }
        }
    }
}

impl FusedIterator for Chunks {}
