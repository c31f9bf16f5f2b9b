use lazy_static::lazy_static;
use regex::Regex;

use crate::types::Quote;

lazy_static! {
    static ref MARKER_RE: Regex =
        Regex::new(r"\{\{QUOTE:(\d+)(?::s(\d+):s(\d+))?\}\}").expect("marker regex");
}

/// A complete piece of output: literal answer text, or a resolved citation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Text(String),
    Citation(Quote),
}

/// Incremental scanner that turns a growing text buffer into text and
/// citation segments. Markers may arrive split across any number of deltas;
/// a marker is only acted on once complete, and a suffix that could still
/// become a marker is retained for the next delta. `finish` flushes whatever
/// is left as literal text, so an unterminated marker degrades gracefully.
pub struct MarkerExtractor {
    buffer: String,
    quotes: Vec<Quote>,
}

impl MarkerExtractor {
    pub fn new(quotes: Vec<Quote>) -> Self {
        Self {
            buffer: String::new(),
            quotes,
        }
    }

    pub fn set_quotes(&mut self, quotes: Vec<Quote>) {
        self.quotes = quotes;
    }

    /// Feed one delta, returning every segment that became complete.
    pub fn push(&mut self, delta: &str) -> Vec<Segment> {
        self.buffer.push_str(delta);
        let mut out = Vec::new();

        loop {
            // Emit text + citation for the first complete marker, if any.
            let found = MARKER_RE.captures(&self.buffer).map(|caps| {
                let whole = caps.get(0).expect("capture 0");
                (
                    whole.start(),
                    whole.end(),
                    caps[1].to_string(),
                    caps.get(2).map(|m| m.as_str().to_string()),
                    caps.get(3).map(|m| m.as_str().to_string()),
                )
            });

            if let Some((start, end, index, range_start, range_end)) = found {
                if start > 0 {
                    out.push(Segment::Text(self.buffer[..start].to_string()));
                }
                if let Some(quote) =
                    self.resolve(&index, range_start.as_deref(), range_end.as_deref())
                {
                    out.push(Segment::Citation(quote));
                }
                self.buffer.drain(..end);
                continue;
            }

            // No complete marker: keep only the earliest suffix that could
            // still grow into one, flush everything before it.
            match partial_marker_start(&self.buffer) {
                Some(0) => {}
                Some(p) => {
                    out.push(Segment::Text(self.buffer[..p].to_string()));
                    self.buffer.drain(..p);
                }
                None => {
                    if !self.buffer.is_empty() {
                        out.push(Segment::Text(std::mem::take(&mut self.buffer)));
                    }
                }
            }
            break;
        }

        out
    }

    /// End of stream: whatever is buffered is literal text.
    pub fn finish(&mut self) -> Option<Segment> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(Segment::Text(std::mem::take(&mut self.buffer)))
        }
    }

    fn resolve(
        &self,
        index: &str,
        range_start: Option<&str>,
        range_end: Option<&str>,
    ) -> Option<Quote> {
        let idx: usize = index.parse().ok()?;
        if idx == 0 || idx > self.quotes.len() {
            tracing::warn!(
                "Marker index {} out of range ({} candidates); dropping citation",
                index,
                self.quotes.len()
            );
            return None;
        }
        let quote = &self.quotes[idx - 1];

        let text = match (range_start, range_end) {
            (Some(s), Some(e)) => {
                let start: usize = s.parse().ok()?;
                let end: usize = e.parse().ok()?;
                select_sentences(&quote.text, start, end)
                    .unwrap_or_else(|| quote.text.clone())
            }
            _ => quote.text.clone(),
        };

        Some(Quote {
            text,
            reference: quote.reference.clone(),
            url: quote.url.clone(),
        })
    }
}

/// Earliest position whose suffix is an incomplete prefix of the marker
/// grammar, or None when the whole buffer can be flushed as text.
fn partial_marker_start(buffer: &str) -> Option<usize> {
    for (pos, ch) in buffer.char_indices() {
        if ch == '{' && is_marker_prefix(&buffer[pos..]) {
            return Some(pos);
        }
    }
    None
}

/// Runs the marker grammar `{{QUOTE:<digits>[:s<digits>:s<digits>]}}` as an
/// automaton and reports whether `s` is consumed entirely while still inside
/// it. Complete markers are consumed by the regex pass before this is asked.
fn is_marker_prefix(s: &str) -> bool {
    const HEAD: &str = "{{QUOTE:";

    if s.len() < HEAD.len() {
        return HEAD.starts_with(s);
    }
    if !s.starts_with(HEAD) {
        return false;
    }

    #[derive(Clone, Copy, PartialEq)]
    enum State {
        Index { seen: bool },
        RangeS { first: bool },
        RangeDigits { first: bool, seen: bool },
        CloseBrace,
        Complete,
    }

    let mut state = State::Index { seen: false };
    for c in s[HEAD.len()..].chars() {
        state = match state {
            State::Index { seen } => match c {
                '0'..='9' => State::Index { seen: true },
                ':' if seen => State::RangeS { first: true },
                '}' if seen => State::CloseBrace,
                _ => return false,
            },
            State::RangeS { first } => match c {
                's' => State::RangeDigits { first, seen: false },
                _ => return false,
            },
            State::RangeDigits { first, seen } => match c {
                '0'..='9' => State::RangeDigits { first, seen: true },
                ':' if first && seen => State::RangeS { first: false },
                '}' if !first && seen => State::CloseBrace,
                _ => return false,
            },
            State::CloseBrace => match c {
                '}' => State::Complete,
                _ => return false,
            },
            // Trailing bytes after a full marker mean this start position
            // does not need holding.
            State::Complete => return false,
        };
    }
    true
}

/// Inclusive 1-based sentence sub-range, or None when the range is invalid.
fn select_sentences(text: &str, start: usize, end: usize) -> Option<String> {
    let sentences = split_sentences(text);
    if start == 0 || start > end || end > sentences.len() {
        return None;
    }
    Some(sentences[start - 1..end].join(" "))
}

fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        current.push(c);
        if matches!(c, '.' | '!' | '?') {
            let boundary = match chars.peek() {
                Some(next) => next.is_whitespace(),
                None => true,
            };
            if boundary {
                let trimmed = current.trim();
                if !trimmed.is_empty() {
                    sentences.push(trimmed.to_string());
                }
                current.clear();
            }
        }
    }
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        sentences.push(trimmed.to_string());
    }
    sentences
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ra_quote() -> Quote {
        Quote {
            text: "Ra: I am Ra.".to_string(),
            reference: "1.1".to_string(),
            url: "u".to_string(),
        }
    }

    fn collect(extractor: &mut MarkerExtractor, deltas: &[&str]) -> Vec<Segment> {
        let mut out = Vec::new();
        for d in deltas {
            out.extend(extractor.push(d));
        }
        out.extend(extractor.finish());
        out
    }

    fn reassemble(segments: &[Segment]) -> (String, usize) {
        let mut text = String::new();
        let mut citations = 0;
        for s in segments {
            match s {
                Segment::Text(t) => text.push_str(t),
                Segment::Citation(_) => citations += 1,
            }
        }
        (text, citations)
    }

    #[test]
    fn test_marker_split_across_deltas() {
        let mut ex = MarkerExtractor::new(vec![ra_quote()]);
        let segments = collect(&mut ex, &["Here is a quote: ", "{{QUOTE:1}}"]);
        assert_eq!(
            segments,
            vec![
                Segment::Text("Here is a quote: ".to_string()),
                Segment::Citation(ra_quote()),
            ]
        );
    }

    #[test]
    fn test_every_two_way_split_preserves_output() {
        let quotes = vec![ra_quote(), ra_quote()];
        let input = "Intro {{QUOTE:1}} middle text {{QUOTE:2}} outro.";
        for split in 0..=input.len() {
            if !input.is_char_boundary(split) {
                continue;
            }
            let mut ex = MarkerExtractor::new(quotes.clone());
            let segments = collect(&mut ex, &[&input[..split], &input[split..]]);
            let (text, citations) = reassemble(&segments);
            assert_eq!(citations, 2, "split at {}", split);
            assert_eq!(text, "Intro  middle text  outro.", "split at {}", split);
        }
    }

    #[test]
    fn test_single_char_deltas() {
        let mut ex = MarkerExtractor::new(vec![ra_quote()]);
        let input = "A{{QUOTE:1}}B";
        let deltas: Vec<String> = input.chars().map(|c| c.to_string()).collect();
        let refs: Vec<&str> = deltas.iter().map(|s| s.as_str()).collect();
        let segments = collect(&mut ex, &refs);
        let (text, citations) = reassemble(&segments);
        assert_eq!(text, "AB");
        assert_eq!(citations, 1);
    }

    #[test]
    fn test_out_of_range_index_dropped_silently() {
        let mut ex = MarkerExtractor::new(vec![ra_quote()]);
        let segments = collect(&mut ex, &["before {{QUOTE:7}} after"]);
        let (text, citations) = reassemble(&segments);
        assert_eq!(citations, 0);
        assert_eq!(text, "before  after");
    }

    #[test]
    fn test_unterminated_marker_degrades_to_text() {
        let mut ex = MarkerExtractor::new(vec![ra_quote()]);
        let mut segments = ex.push("truncated {{QUOTE:1");
        // Only the leading text flushes while the suffix could still complete.
        assert_eq!(segments, vec![Segment::Text("truncated ".to_string())]);
        segments.extend(ex.finish());
        assert_eq!(
            segments,
            vec![
                Segment::Text("truncated ".to_string()),
                Segment::Text("{{QUOTE:1".to_string()),
            ]
        );
    }

    #[test]
    fn test_braces_that_cannot_be_markers_flush_immediately() {
        let mut ex = MarkerExtractor::new(vec![ra_quote()]);
        let segments = ex.push("a JSON object {\"key\": 1} is not a marker");
        assert_eq!(
            segments,
            vec![Segment::Text(
                "a JSON object {\"key\": 1} is not a marker".to_string()
            )]
        );
    }

    #[test]
    fn test_sentence_range_selection() {
        let quote = Quote {
            text: "First point. Second point. Third point.".to_string(),
            reference: "4.20".to_string(),
            url: "u".to_string(),
        };
        let mut ex = MarkerExtractor::new(vec![quote]);
        let segments = ex.push("{{QUOTE:1:s2:s3}}");
        assert_eq!(
            segments,
            vec![Segment::Citation(Quote {
                text: "Second point. Third point.".to_string(),
                reference: "4.20".to_string(),
                url: "u".to_string(),
            })]
        );
    }

    #[test]
    fn test_invalid_sentence_range_falls_back_to_whole_quote() {
        let mut ex = MarkerExtractor::new(vec![ra_quote()]);
        let segments = ex.push("{{QUOTE:1:s5:s9}}");
        assert_eq!(segments, vec![Segment::Citation(ra_quote())]);
    }

    #[test]
    fn test_prefix_automaton() {
        for p in [
            "{", "{{", "{{Q", "{{QUOTE", "{{QUOTE:", "{{QUOTE:1", "{{QUOTE:12",
            "{{QUOTE:1}", "{{QUOTE:1:", "{{QUOTE:1:s", "{{QUOTE:1:s2", "{{QUOTE:1:s2:",
            "{{QUOTE:1:s2:s", "{{QUOTE:1:s2:s3", "{{QUOTE:1:s2:s3}",
        ] {
            assert!(is_marker_prefix(p), "expected prefix: {:?}", p);
        }
        for n in [
            "{x", "{{x", "{{QUOTE:}", "{{QUOTE:1x", "{{QUOTE:1:x", "{{QUOTE:1:s2x",
            "{{QUOTE:1:s2:s3}}x", "QUOTE:1",
        ] {
            assert!(!is_marker_prefix(n), "expected non-prefix: {:?}", n);
        }
    }

    #[test]
    fn test_split_sentences_handles_abbrev_free_text() {
        let s = split_sentences("One. Two! Three? Four");
        assert_eq!(s, vec!["One.", "Two!", "Three?", "Four"]);
    }
}
