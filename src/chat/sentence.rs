//! # Sentence Accumulator
//!
//! Voice mode cannot synthesize every text delta on its own: deltas are a few
//! characters long and speech needs whole phrases. The accumulator buffers
//! deltas and releases a sentence once a terminal mark is followed by
//! whitespace.
//!
//! ## Boundary rule:
//! A boundary is one of `. , ! ? 。 ， ！ ？` immediately followed by a
//! whitespace character. The released sentence ends at the mark; the
//! whitespace stays in the buffer and starts the next sentence. Because the
//! rule only looks at the buffered text, splitting the same text across
//! different deltas releases the same sentences.

const SENTENCE_TERMINALS: [char; 8] = ['.', ',', '!', '?', '。', '，', '！', '？'];

#[derive(Debug, Default)]
pub struct SentenceAccumulator {
    buffer: String,
}

impl SentenceAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a delta and return every sentence it completed, in order.
    pub fn push(&mut self, delta: &str) -> Vec<String> {
        self.buffer.push_str(delta);

        let mut sentences = Vec::new();
        while let Some(end) = find_boundary(&self.buffer) {
            let rest = self.buffer.split_off(end);
            sentences.push(std::mem::replace(&mut self.buffer, rest));
        }
        sentences
    }

    /// Release whatever is left at end of stream. Whitespace-only leftovers
    /// are discarded.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        if rest.trim().is_empty() {
            None
        } else {
            Some(rest)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn pending(&self) -> &str {
        &self.buffer
    }
}

/// Byte offset just past the first terminal mark that is followed by whitespace.
fn find_boundary(text: &str) -> Option<usize> {
    let mut chars = text.char_indices().peekable();
    while let Some((index, ch)) = chars.next() {
        if SENTENCE_TERMINALS.contains(&ch) {
            if let Some(&(_, next)) = chars.peek() {
                if next.is_whitespace() {
                    return Some(index + ch.len_utf8());
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(deltas: &[&str]) -> Vec<String> {
        let mut accumulator = SentenceAccumulator::new();
        let mut sentences = Vec::new();
        for delta in deltas {
            sentences.extend(accumulator.push(delta));
        }
        sentences.extend(accumulator.finish());
        sentences
    }

    #[test]
    fn test_two_sentences() {
        let sentences = segment(&["Hello", " world.", " How are you?"]);
        assert_eq!(sentences, vec!["Hello world.", " How are you?"]);
    }

    #[test]
    fn test_terminal_without_whitespace_waits() {
        let mut accumulator = SentenceAccumulator::new();
        assert!(accumulator.push("Version 1.5 is out.").is_empty());
        assert_eq!(accumulator.pending(), "Version 1.5 is out.");
        assert_eq!(accumulator.push(" Next").len(), 1);
        assert_eq!(accumulator.pending(), " Next");
    }

    #[test]
    fn test_split_is_idempotent() {
        let text = "First, a clause. Then a question? Yes! 然后， 中文。 结束";
        let whole = segment(&[text]);
        let chars: Vec<String> = text.chars().map(|c| c.to_string()).collect();
        let refs: Vec<&str> = chars.iter().map(|s| s.as_str()).collect();
        let split = segment(&refs);
        assert_eq!(whole, split);
        assert_eq!(whole.concat(), text);
    }

    #[test]
    fn test_several_sentences_in_one_delta() {
        let mut accumulator = SentenceAccumulator::new();
        let sentences = accumulator.push("One. Two. Three");
        assert_eq!(sentences, vec!["One.", " Two."]);
        assert_eq!(accumulator.finish().as_deref(), Some(" Three"));
    }

    #[test]
    fn test_whitespace_leftover_is_dropped() {
        let mut accumulator = SentenceAccumulator::new();
        assert_eq!(accumulator.push("Done. "), vec!["Done."]);
        assert_eq!(accumulator.finish(), None);
        assert!(accumulator.is_empty());
    }

    #[test]
    fn test_fullwidth_marks() {
        let mut accumulator = SentenceAccumulator::new();
        assert_eq!(accumulator.push("你好！ 再见"), vec!["你好！"]);
    }
}
