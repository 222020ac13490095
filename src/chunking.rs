//! Splitting extracted text into overlapping, sentence-aware chunks.
//!
//! Chunks target [`DEFAULT_CHUNK_SIZE`] characters and share roughly
//! [`DEFAULT_CHUNK_OVERLAP`] characters with their predecessor. A chunk ends
//! at the last sentence boundary in its final stretch when there is one, at
//! the last whitespace otherwise, and only cuts through a word as a last
//! resort. Every non-whitespace character of the input lands in at least one
//! chunk.

/// Default chunk size in characters.
pub const DEFAULT_CHUNK_SIZE: usize = 512;

/// Default overlap between neighbouring chunks in characters.
pub const DEFAULT_CHUNK_OVERLAP: usize = 100;

/// How far back from the hard end a break point is searched for.
const BREAK_WINDOW: usize = 100;

/// A chunk of text from a larger document.
///
/// Produced by [`chunk_text`].
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    /// The chunk text, trimmed of surrounding whitespace.
    pub text: String,
    /// Zero-based chunk index within the document.
    pub index: usize,
    /// Character offset of the first character of `text` in the document.
    pub offset: usize,
}

/// Split text into overlapping chunks.
///
/// Offsets and sizes count Unicode scalar values, not bytes.
///
/// # Examples
///
/// ```
/// use deskindex::chunking::chunk_text;
///
/// // Short text returns a single chunk
/// let chunks = chunk_text("Hello, world!", 512, 100);
/// assert_eq!(chunks.len(), 1);
/// assert_eq!(chunks[0].text, "Hello, world!");
///
/// // Long text gets split
/// let text = "One sentence here. ".repeat(100);
/// let chunks = chunk_text(&text, 512, 100);
/// assert!(chunks.len() >= 4);
/// assert!(chunks.iter().all(|c| c.text.ends_with('.')));
/// ```
pub fn chunk_text(text: &str, chunk_size: usize, overlap: usize) -> Vec<Chunk> {
    let chunk_size = chunk_size.max(1);
    let overlap = overlap.min(chunk_size - 1);

    let chars: Vec<char> = text.chars().collect();
    let char_to_byte: Vec<usize> = text
        .char_indices()
        .map(|(byte_idx, _)| byte_idx)
        .chain(std::iter::once(text.len()))
        .collect();
    let n = chars.len();

    let mut chunks = Vec::new();
    let mut start = 0;

    while start < n {
        let hard_end = (start + chunk_size).min(n);
        let end = if hard_end < n {
            find_break(&chars, start, hard_end)
        } else {
            n
        };

        let mut s = start;
        while s < end && chars[s].is_whitespace() {
            s += 1;
        }
        let mut e = end;
        while e > s && chars[e - 1].is_whitespace() {
            e -= 1;
        }
        if s < e {
            chunks.push(Chunk {
                text: text[char_to_byte[s]..char_to_byte[e]].to_string(),
                index: chunks.len(),
                offset: s,
            });
        }

        if end >= n {
            break;
        }

        // Step back by the overlap, then forward to the next word start so
        // chunks do not open mid-word. Never past `end`, so nothing is skipped.
        let mut next = end.saturating_sub(overlap).max(start + 1);
        while next < end && !chars[next - 1].is_whitespace() {
            next += 1;
        }
        start = next;
    }

    chunks
}

/// Pick a break position in `(start, hard_end]`.
fn find_break(chars: &[char], start: usize, hard_end: usize) -> usize {
    let floor = hard_end.saturating_sub(BREAK_WINDOW).max(start + 1);

    for i in (floor..hard_end).rev() {
        let c = chars[i];
        let at_sentence_end = c == '\n'
            || (matches!(c, '.' | '!' | '?')
                && chars.get(i + 1).is_none_or(|next| next.is_whitespace()));
        if at_sentence_end {
            return i + 1;
        }
    }

    for i in (floor..hard_end).rev() {
        if chars[i].is_whitespace() {
            return i + 1;
        }
    }

    hard_end
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_covers(text: &str, chunks: &[Chunk]) {
        let chars: Vec<char> = text.chars().collect();
        let mut covered = vec![false; chars.len()];
        for chunk in chunks {
            let len = chunk.text.chars().count();
            let slice: String = chars[chunk.offset..chunk.offset + len].iter().collect();
            assert_eq!(slice, chunk.text, "chunk {} matches its offset", chunk.index);
            for flag in &mut covered[chunk.offset..chunk.offset + len] {
                *flag = true;
            }
        }
        for (i, c) in chars.iter().enumerate() {
            assert!(c.is_whitespace() || covered[i], "char {i} ({c:?}) not covered");
        }
    }

    #[test]
    fn short_text_single_chunk() {
        let chunks = chunk_text(
            "  Hello, world!\n",
            DEFAULT_CHUNK_SIZE,
            DEFAULT_CHUNK_OVERLAP,
        );
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "Hello, world!");
        assert_eq!(chunks[0].index, 0);
        assert_eq!(chunks[0].offset, 2);
    }

    #[test]
    fn empty_and_blank_text_yield_nothing() {
        assert!(chunk_text("", 512, 100).is_empty());
        assert!(chunk_text(" \n\t ", 512, 100).is_empty());
    }

    #[test]
    fn long_text_overlaps_and_covers_everything() {
        let text = "The budget grew this year. Costs were flat! Why? ".repeat(60);
        let chunks = chunk_text(&text, 512, 100);

        assert!(chunks.len() >= 5);
        for pair in chunks.windows(2) {
            let first_end = pair[0].offset + pair[0].text.chars().count();
            assert!(pair[1].offset > pair[0].offset, "offsets increase");
            assert!(pair[1].offset < first_end, "neighbours overlap");
        }
        assert_covers(&text, &chunks);
    }

    #[test]
    fn prefers_sentence_boundaries() {
        let text = "Alpha beta gamma delta. ".repeat(50);
        let chunks = chunk_text(&text, 200, 40);
        for chunk in &chunks {
            assert!(chunk.text.ends_with('.'), "{:?}", chunk.text);
        }
    }

    #[test]
    fn decimal_points_are_not_sentence_ends() {
        let text = format!("{} pi is 3.14159 and more words", "word ".repeat(30));
        let chunks = chunk_text(&text, 160, 20);
        assert!(chunks.iter().all(|c| !c.text.ends_with("3.")));
        assert_covers(&text, &chunks);
    }

    #[test]
    fn unbroken_text_is_cut_hard() {
        let text = "a".repeat(1200);
        let chunks = chunk_text(&text, 512, 100);
        assert_eq!(chunks[0].text.len(), 512);
        assert_covers(&text, &chunks);
    }

    #[test]
    fn handles_multibyte_chars() {
        let text = "café ☕ naïve 日本語 🎉. ".repeat(80);
        let chunks = chunk_text(&text, 100, 20);
        assert!(chunks.len() > 1);
        assert_covers(&text, &chunks);
    }

    #[test]
    fn overlap_larger_than_chunk_still_progresses() {
        let text = "word ".repeat(100);
        let chunks = chunk_text(&text, 20, 50);
        assert!(!chunks.is_empty());
        assert_covers(&text, &chunks);
    }
}
