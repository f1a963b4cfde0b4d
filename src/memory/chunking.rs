//! Deterministic splitting of long memory content.
//!
//! Text is split on the coarsest boundary that works: blank-line paragraphs,
//! then sentence ends, then whitespace, and finally a hard split by
//! characters. Adjacent pieces are packed greedily up to `max_chars`.
//! Output pieces are trimmed, non-empty, and in original order.

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Split `text` into pieces of at most `max_chars` characters.
///
/// Short text comes back as a single trimmed piece; blank text yields nothing.
pub fn split_content(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut out = Vec::new();
    split_level(text, max_chars, 0, &mut out);
    out
}

fn split_level(text: &str, max: usize, level: usize, out: &mut Vec<String>) {
    let text = text.trim();
    if text.is_empty() {
        return;
    }
    if char_len(text) <= max {
        out.push(text.to_string());
        return;
    }

    let (pieces, joiner) = match level {
        0 => (split_paragraphs(text), "\n\n"),
        1 => (split_sentences(text), " "),
        2 => (text.split_whitespace().collect(), " "),
        _ => {
            hard_split(text, max, out);
            return;
        }
    };

    let mut current = String::new();
    for piece in pieces {
        let piece = piece.trim();
        if piece.is_empty() {
            continue;
        }
        if char_len(piece) > max {
            flush(&mut current, out);
            split_level(piece, max, level + 1, out);
            continue;
        }
        if !current.is_empty() && char_len(&current) + joiner.len() + char_len(piece) > max {
            flush(&mut current, out);
        }
        if !current.is_empty() {
            current.push_str(joiner);
        }
        current.push_str(piece);
    }
    flush(&mut current, out);
}

fn flush(current: &mut String, out: &mut Vec<String>) {
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        out.push(trimmed.to_string());
    }
    current.clear();
}

fn split_paragraphs(text: &str) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut start = 0;
    let mut prev_newline: Option<usize> = None;
    for (i, c) in text.char_indices() {
        if c != '\n' {
            if !c.is_whitespace() {
                prev_newline = None;
            }
            continue;
        }
        if let Some(p) = prev_newline {
            pieces.push(&text[start..p]);
            start = i + 1;
            prev_newline = None;
        } else {
            prev_newline = Some(i);
        }
    }
    pieces.push(&text[start..]);
    pieces
}

/// Cut after `.`, `!` or `?` when followed by whitespace.
fn split_sentences(text: &str) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if matches!(c, '.' | '!' | '?') {
            if let Some(&(_, next)) = chars.peek() {
                if next.is_whitespace() {
                    let end = i + c.len_utf8();
                    pieces.push(&text[start..end]);
                    start = end;
                }
            }
        }
    }
    pieces.push(&text[start..]);
    pieces
}

fn hard_split(text: &str, max: usize, out: &mut Vec<String>) {
    let chars: Vec<char> = text.chars().collect();
    for window in chars.chunks(max) {
        let piece: String = window.iter().collect();
        let piece = piece.trim();
        if !piece.is_empty() {
            out.push(piece.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_one_piece() {
        assert_eq!(split_content("  hello there  ", 100), vec!["hello there"]);
        assert!(split_content("   \n ", 100).is_empty());
    }

    #[test]
    fn prefers_paragraph_boundaries() {
        let text = "First paragraph here.\n\nSecond paragraph here.\n\nThird one.";
        let pieces = split_content(text, 30);
        assert_eq!(
            pieces,
            vec!["First paragraph here.", "Second paragraph here.", "Third one."]
        );
    }

    #[test]
    fn packs_small_paragraphs_together() {
        let text = "aa\n\nbb\n\ncc";
        assert_eq!(split_content(text, 10), vec!["aa\n\nbb\n\ncc"]);
        assert_eq!(split_content(text, 7), vec!["aa\n\nbb", "cc"]);
    }

    #[test]
    fn falls_back_to_sentences_then_words() {
        let text = "One two three. Four five six. Seven eight nine.";
        let pieces = split_content(text, 20);
        assert_eq!(pieces, vec!["One two three.", "Four five six.", "Seven eight nine."]);

        let pieces = split_content("alpha beta gamma delta", 11);
        assert_eq!(pieces, vec!["alpha beta", "gamma delta"]);
    }

    #[test]
    fn hard_split_as_last_resort() {
        let pieces = split_content("abcdefghij", 4);
        assert_eq!(pieces, vec!["abcd", "efgh", "ij"]);
    }

    #[test]
    fn pieces_respect_limit_and_preserve_order() {
        let text = "The quick brown fox. Jumps over the lazy dog!\n\nAnother paragraph? Yes, indeed.";
        let pieces = split_content(text, 25);
        assert!(pieces.iter().all(|p| p.chars().count() <= 25));
        assert!(pieces.iter().all(|p| !p.is_empty() && p.trim() == p));
        let rejoined: String = pieces.join(" ");
        let words: Vec<&str> = rejoined.split_whitespace().collect();
        let original: Vec<&str> = text.split_whitespace().collect();
        assert_eq!(words, original);
    }

    #[test]
    fn multibyte_characters_are_counted_not_bytes() {
        let text = "ééééé";
        assert_eq!(split_content(text, 5), vec!["ééééé"]);
        assert_eq!(split_content(text, 2), vec!["éé", "éé", "é"]);
    }
}
