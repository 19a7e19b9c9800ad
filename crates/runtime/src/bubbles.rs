//! Splits one assistant reply into the separate chat "bubbles" it is
//! streamed and persisted as.

use regex::Regex;

/// Normalizes (CR-stripped, trimmed) `text` and splits it into bubbles.
///
/// Two or more paragraphs (split on ≥2 newlines) become the bubbles as-is.
/// Otherwise the text is split into sentences; ≤2 sentences stay as one
/// bubble, more than that are grouped into consecutive pairs (the final
/// group may hold a single leftover sentence). Empty input yields no bubbles.
pub fn split_into_bubbles(text: &str) -> Vec<String> {
    let normalized = text.replace('\r', "");
    let normalized = normalized.trim();
    if normalized.is_empty() {
        return Vec::new();
    }

    let paragraph_break = Regex::new(r"\n{2,}").expect("valid paragraph-break regex");
    let paragraphs: Vec<&str> = paragraph_break
        .split(normalized)
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();
    if paragraphs.len() >= 2 {
        return paragraphs.into_iter().map(str::to_string).collect();
    }

    let sentences = split_sentences(normalized);
    if sentences.len() <= 2 {
        return vec![normalized.to_string()];
    }

    sentences
        .chunks(2)
        .map(|pair| pair.join(" "))
        .collect()
}

/// Splits on `(?<=[.!?])\s+` without lookbehind, which `regex` doesn't
/// support: a run of whitespace immediately after a sentence-ending mark
/// ends the current sentence; the whitespace itself is consumed by neither
/// side.
fn split_sentences(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        current.push(c);
        if matches!(c, '.' | '!' | '?') && chars.get(i + 1).is_some_and(|n| n.is_whitespace()) {
            let mut j = i + 1;
            while j < chars.len() && chars[j].is_whitespace() {
                j += 1;
            }
            sentences.push(current.trim().to_string());
            current.clear();
            i = j;
            continue;
        }
        i += 1;
    }
    if !current.trim().is_empty() {
        sentences.push(current.trim().to_string());
    }
    sentences
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_yields_no_bubbles() {
        assert!(split_into_bubbles("").is_empty());
        assert!(split_into_bubbles("   \n\n  ").is_empty());
    }

    #[test]
    fn multiple_paragraphs_become_separate_bubbles() {
        let text = "First paragraph.\n\nSecond paragraph.\n\nThird paragraph.";
        let bubbles = split_into_bubbles(text);
        assert_eq!(bubbles, vec!["First paragraph.", "Second paragraph.", "Third paragraph."]);
    }

    #[test]
    fn short_single_paragraph_stays_one_bubble() {
        let text = "One sentence. Another sentence.";
        let bubbles = split_into_bubbles(text);
        assert_eq!(bubbles, vec![text.to_string()]);
    }

    #[test]
    fn long_single_paragraph_groups_sentences_in_pairs() {
        let text = "One. Two. Three. Four. Five.";
        let bubbles = split_into_bubbles(text);
        assert_eq!(bubbles, vec!["One. Two.", "Three. Four.", "Five."]);
    }

    #[test]
    fn carriage_returns_and_outer_whitespace_are_stripped() {
        let text = "\r\n  First.\r\n\r\n  Second.\r\n";
        let bubbles = split_into_bubbles(text);
        assert_eq!(bubbles, vec!["First.", "Second."]);
    }
}
