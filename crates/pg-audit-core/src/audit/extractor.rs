//! SQL command extraction from raw protocol bytes.
//!
//! The extractor does not parse the PostgreSQL wire protocol. It looks for
//! the first command keyword anywhere in a byte span and cuts the span at
//! the first NUL byte after it, which is where simple-query and parse
//! messages terminate their query strings.

use regex::bytes::Regex;

/// Recognized command keywords, in priority order.
///
/// Matching is leftmost across all keywords, so the order only matters for
/// matches starting at the same offset, which these keywords cannot produce.
pub const KEYWORDS: [&str; 6] = ["BEGIN", "COMMIT", "INSERT", "SELECT", "UPDATE", "DELETE"];

/// Byte that terminates an extracted command.
pub const TERMINATOR: u8 = 0;

/// Extracts audit text from relayed byte spans.
#[derive(Debug, Clone)]
pub struct CommandExtractor {
    pattern: Regex,
}

impl CommandExtractor {
    /// Create an extractor for the standard keyword set.
    #[must_use]
    pub fn new() -> Self {
        let alternation = KEYWORDS.join("|");
        Self {
            pattern: Regex::new(&alternation).expect("keyword alternation is a valid regex"),
        }
    }

    /// Offset of the leftmost keyword occurrence, if any.
    #[must_use]
    pub fn find(&self, span: &[u8]) -> Option<usize> {
        self.pattern.find(span).map(|m| m.start())
    }

    /// Extract the audit text from a span.
    ///
    /// Returns the bytes from the leftmost keyword up to, not including, the
    /// first terminator after it (or the end of the span).
    #[must_use]
    pub fn extract<'a>(&self, span: &'a [u8]) -> Option<&'a [u8]> {
        let start = self.find(span)?;
        let rest = &span[start..];
        let end = rest
            .iter()
            .position(|&b| b == TERMINATOR)
            .unwrap_or(rest.len());
        Some(&rest[..end])
    }
}

impl Default for CommandExtractor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_truncates_at_terminator() {
        let extractor = CommandExtractor::new();
        let record = extractor.extract(b"SELECT * FROM users\0xyz").unwrap();
        assert_eq!(record, b"SELECT * FROM users");
    }

    #[test]
    fn test_extract_without_terminator_runs_to_end() {
        let extractor = CommandExtractor::new();
        let record = extractor.extract(b"Q\0\0\0\x10UPDATE t SET a = 1").unwrap();
        assert_eq!(record, b"UPDATE t SET a = 1");
    }

    #[test]
    fn test_no_keyword_yields_nothing() {
        let extractor = CommandExtractor::new();
        assert!(extractor.extract(b"hello world").is_none());
        assert!(extractor.extract(b"").is_none());
        assert!(extractor
            .extract(b"select lowercase is not matched")
            .is_none());
    }

    #[test]
    fn test_leftmost_occurrence_wins_over_priority() {
        let extractor = CommandExtractor::new();
        // BEGIN has the highest priority but DELETE starts first.
        let record = extractor.extract(b"xxDELETE FROM a; BEGIN\0").unwrap();
        assert_eq!(record, b"DELETE FROM a; BEGIN");
        assert_eq!(extractor.find(b"xxDELETE FROM a; BEGIN"), Some(2));
    }

    #[test]
    fn test_terminator_before_keyword_is_ignored() {
        let extractor = CommandExtractor::new();
        let record = extractor.extract(b"\0\0junk\0COMMIT\0").unwrap();
        assert_eq!(record, b"COMMIT");
    }

    #[test]
    fn test_every_keyword_is_recognized() {
        let extractor = CommandExtractor::new();
        for keyword in KEYWORDS {
            let span = format!("P\0stmt\0{keyword} something\0\0");
            let record = extractor.extract(span.as_bytes()).unwrap();
            assert_eq!(record, format!("{keyword} something").as_bytes());
        }
    }

    #[test]
    fn test_keyword_inside_identifier_still_matches() {
        // Matching is byte-level, not token-level.
        let extractor = CommandExtractor::new();
        let record = extractor.extract(b"column_SELECTED\0").unwrap();
        assert_eq!(record, b"SELECTED");
    }

    #[test]
    fn test_non_utf8_bytes_are_preserved() {
        let extractor = CommandExtractor::new();
        let record = extractor.extract(b"\xff\xfeINSERT \xc3\x28\0tail").unwrap();
        assert_eq!(record, b"INSERT \xc3\x28");
    }
}
