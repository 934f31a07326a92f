//! Locating hunk context in a file with progressive fuzzy matching.
//!
//! Each tolerance pass is exhausted before a looser one is tried:
//! 1. Exact match
//! 2. Trailing whitespace ignored
//! 3. Leading + trailing whitespace ignored
//! 4. Unicode punctuation normalized to ASCII equivalents
//!
//! Within a pass the candidate closest to the hunk's declared position wins,
//! so stale line numbers still land on the nearest matching block.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Tolerance {
    Exact,
    TrailingWhitespace,
    Whitespace,
    Unicode,
}

impl Tolerance {
    pub(crate) const ALL: [Tolerance; 4] = [
        Tolerance::Exact,
        Tolerance::TrailingWhitespace,
        Tolerance::Whitespace,
        Tolerance::Unicode,
    ];

    fn line_matches(self, line: &str, pattern: &str) -> bool {
        match self {
            Tolerance::Exact => line == pattern,
            Tolerance::TrailingWhitespace => line.trim_end() == pattern.trim_end(),
            Tolerance::Whitespace => line.trim() == pattern.trim(),
            Tolerance::Unicode => normalise(line) == normalise(pattern),
        }
    }
}

/// True if `pattern` matches `lines` starting exactly at `at`.
pub(crate) fn matches_at(
    lines: &[String],
    pattern: &[&str],
    at: usize,
    tolerance: Tolerance,
) -> bool {
    at + pattern.len() <= lines.len()
        && pattern
            .iter()
            .enumerate()
            .all(|(j, pat)| tolerance.line_matches(&lines[at + j], pat))
}

/// Find `pattern` within `lines` at or after `start`, preferring the position
/// nearest `anchor`. Returns the match index and the tolerance that found it.
pub(crate) fn seek_sequence(
    lines: &[String],
    pattern: &[&str],
    start: usize,
    anchor: usize,
) -> Option<(usize, Tolerance)> {
    if pattern.is_empty() {
        return Some((anchor.clamp(start, lines.len().max(start)), Tolerance::Exact));
    }
    if start + pattern.len() > lines.len() {
        return None;
    }

    let mut candidates: Vec<usize> = (start..=lines.len() - pattern.len()).collect();
    candidates.sort_by_key(|&i| (i.abs_diff(anchor), i));

    Tolerance::ALL.into_iter().find_map(|tolerance| {
        candidates
            .iter()
            .copied()
            .find(|&i| matches_at(lines, pattern, i, tolerance))
            .map(|i| (i, tolerance))
    })
}

/// Normalize common Unicode punctuation to ASCII equivalents.
fn normalise(s: &str) -> String {
    s.trim()
        .chars()
        .map(|c| match c {
            // Various dashes -> ASCII hyphen
            '\u{2010}' | '\u{2011}' | '\u{2012}' | '\u{2013}' | '\u{2014}' | '\u{2015}'
            | '\u{2212}' => '-',
            // Fancy single quotes -> apostrophe
            '\u{2018}' | '\u{2019}' | '\u{201A}' | '\u{201B}' => '\'',
            // Fancy double quotes -> ASCII double quote
            '\u{201C}' | '\u{201D}' | '\u{201E}' | '\u{201F}' => '"',
            // Non-breaking / fancy spaces -> regular space
            '\u{00A0}' | '\u{2002}' | '\u{2003}' | '\u{2004}' | '\u{2005}' | '\u{2006}'
            | '\u{2007}' | '\u{2008}' | '\u{2009}' | '\u{200A}' | '\u{202F}' | '\u{205F}'
            | '\u{3000}' => ' ',
            other => other,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn to_vec(strs: &[&str]) -> Vec<String> {
        strs.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn exact_match() {
        let lines = to_vec(&["foo", "bar", "baz"]);
        assert_eq!(
            seek_sequence(&lines, &["bar", "baz"], 0, 0),
            Some((1, Tolerance::Exact))
        );
    }

    #[test]
    fn trailing_whitespace_match() {
        let lines = to_vec(&["foo   ", "bar\t"]);
        assert_eq!(
            seek_sequence(&lines, &["foo", "bar"], 0, 0),
            Some((0, Tolerance::TrailingWhitespace))
        );
    }

    #[test]
    fn trim_both_sides_match() {
        let lines = to_vec(&["  foo  ", "   bar\t"]);
        assert_eq!(
            seek_sequence(&lines, &["foo", "bar"], 0, 0),
            Some((0, Tolerance::Whitespace))
        );
    }

    #[test]
    fn unicode_normalisation() {
        // EN DASH in source, ASCII hyphen in pattern
        let lines = vec!["import asyncio  # local \u{2013} dep".to_string()];
        assert_eq!(
            seek_sequence(&lines, &["import asyncio  # local - dep"], 0, 0),
            Some((0, Tolerance::Unicode))
        );
    }

    #[test]
    fn one_character_difference_never_matches() {
        let lines = to_vec(&["let x = 1;", "let y = 2;"]);
        assert_eq!(seek_sequence(&lines, &["let x = 1;", "let y = 3;"], 0, 0), None);
    }

    #[test]
    fn pattern_longer_than_input() {
        let lines = to_vec(&["one"]);
        assert_eq!(seek_sequence(&lines, &["one", "two", "three"], 0, 0), None);
    }

    #[test]
    fn empty_pattern_lands_on_anchor() {
        let lines = to_vec(&["a", "b", "c"]);
        assert_eq!(seek_sequence(&lines, &[], 0, 2), Some((2, Tolerance::Exact)));
        assert_eq!(seek_sequence(&lines, &[], 0, 10), Some((3, Tolerance::Exact)));
        assert_eq!(seek_sequence(&lines, &[], 2, 0), Some((2, Tolerance::Exact)));
    }

    #[test]
    fn prefers_match_nearest_anchor() {
        let lines = to_vec(&["a", "b", "x", "a", "b", "x", "a", "b"]);
        assert_eq!(seek_sequence(&lines, &["a", "b"], 0, 5).map(|m| m.0), Some(6));
        assert_eq!(seek_sequence(&lines, &["a", "b"], 0, 4).map(|m| m.0), Some(3));
    }

    #[test]
    fn stricter_pass_wins_over_nearer_fuzzy_match() {
        let lines = to_vec(&["foo ", "foo"]);
        assert_eq!(
            seek_sequence(&lines, &["foo"], 0, 0),
            Some((1, Tolerance::Exact))
        );
    }

    #[test]
    fn respects_start_index() {
        let lines = to_vec(&["a", "b", "a", "b"]);
        assert_eq!(seek_sequence(&lines, &["a", "b"], 1, 0).map(|m| m.0), Some(2));
    }

    #[test]
    fn matches_at_checks_bounds() {
        let lines = to_vec(&["a", "b"]);
        assert!(matches_at(&lines, &["b"], 1, Tolerance::Exact));
        assert!(!matches_at(&lines, &["b", "c"], 1, Tolerance::Exact));
    }
}
