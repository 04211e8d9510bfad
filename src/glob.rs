//! Shell-style glob patterns for host and path allow-lists.
//!
//! Hosts and paths are treated as opaque strings: `*` matches any run of
//! characters (including `.` and `/`), `?` matches exactly one character.
//! Character classes (`[abc]`, `[a-z]`, `[!abc]`) and `\` escapes are
//! supported as well. The empty pattern matches everything.

use std::iter::Peekable;
use std::str::Chars;

use thiserror::Error;

/// Longest accepted pattern, in characters.
pub const MAX_PATTERN_LEN: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GlobError {
    #[error("pattern exceeds {MAX_PATTERN_LEN} characters")]
    TooLong,

    #[error("unclosed character class")]
    UnclosedClass,

    #[error("empty character class")]
    EmptyClass,

    #[error("invalid range {0}-{1} in character class")]
    InvalidRange(char, char),

    #[error("pattern ends with an escape character")]
    TrailingEscape,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(char),
    AnyChar,
    Star,
    Class { negated: bool, ranges: Vec<(char, char)> },
}

impl Segment {
    fn accepts(&self, c: char) -> bool {
        match self {
            Segment::Literal(l) => *l == c,
            Segment::AnyChar => true,
            Segment::Star => false,
            Segment::Class { negated, ranges } => {
                ranges.iter().any(|(lo, hi)| (*lo..=*hi).contains(&c)) != *negated
            }
        }
    }
}

/// A compiled glob pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    segments: Vec<Segment>,
}

impl Pattern {
    /// Compile `source`. The empty string compiles to the match-all pattern.
    pub fn compile(source: &str) -> Result<Self, GlobError> {
        if source.chars().count() > MAX_PATTERN_LEN {
            return Err(GlobError::TooLong);
        }

        let mut segments = Vec::with_capacity(source.len());
        let mut chars = source.chars().peekable();

        while let Some(c) = chars.next() {
            let segment = match c {
                '*' => {
                    // `**` is the same as `*`
                    if matches!(segments.last(), Some(Segment::Star)) {
                        continue;
                    }
                    Segment::Star
                }
                '?' => Segment::AnyChar,
                '\\' => Segment::Literal(chars.next().ok_or(GlobError::TrailingEscape)?),
                '[' => parse_class(&mut chars)?,
                c => Segment::Literal(c),
            };
            segments.push(segment);
        }

        Ok(Self { segments })
    }

    /// Pattern that accepts every candidate.
    pub fn match_all() -> Self {
        Self {
            segments: Vec::new(),
        }
    }

    pub fn is_match_all(&self) -> bool {
        self.segments.is_empty() || self.segments == [Segment::Star]
    }

    /// Test `candidate` against the pattern.
    ///
    /// Iterative backtracking to the most recent `*`; never recurses and
    /// never allocates.
    pub fn is_match(&self, candidate: &str) -> bool {
        if self.segments.is_empty() {
            return true;
        }

        let segments = &self.segments;
        let mut p = 0;
        let mut t = 0;
        // (segment index after the last star, candidate offset it resumed at)
        let mut resume: Option<(usize, usize)> = None;

        loop {
            let next = candidate[t..].chars().next();
            match (segments.get(p), next) {
                (Some(Segment::Star), _) => {
                    p += 1;
                    resume = Some((p, t));
                    continue;
                }
                (Some(segment), Some(c)) if segment.accepts(c) => {
                    p += 1;
                    t += c.len_utf8();
                    continue;
                }
                (None, None) => return true,
                _ => {}
            }

            let Some((star_p, star_t)) = resume else {
                return false;
            };
            let Some(skipped) = candidate[star_t..].chars().next() else {
                return false;
            };
            let next_t = star_t + skipped.len_utf8();
            resume = Some((star_p, next_t));
            p = star_p;
            t = next_t;
        }
    }
}

impl Default for Pattern {
    fn default() -> Self {
        Self::match_all()
    }
}

fn parse_class(chars: &mut Peekable<Chars<'_>>) -> Result<Segment, GlobError> {
    let mut negated = false;
    let mut ranges = Vec::new();

    if matches!(chars.peek(), Some('!') | Some('^')) {
        chars.next();
        negated = true;
    }

    loop {
        let lo = match chars.next().ok_or(GlobError::UnclosedClass)? {
            ']' if ranges.is_empty() => return Err(GlobError::EmptyClass),
            ']' => break,
            '\\' => chars.next().ok_or(GlobError::UnclosedClass)?,
            c => c,
        };

        if chars.peek() == Some(&'-') {
            let mut ahead = chars.clone();
            ahead.next();
            match ahead.next() {
                // trailing `-` before `]` is a literal dash
                Some(']') | None => ranges.push((lo, lo)),
                Some(hi) => {
                    chars.next();
                    chars.next();
                    if hi < lo {
                        return Err(GlobError::InvalidRange(lo, hi));
                    }
                    ranges.push((lo, hi));
                }
            }
        } else {
            ranges.push((lo, lo));
        }
    }

    Ok(Segment::Class { negated, ranges })
}

/// Compile-and-match convenience. A malformed pattern matches nothing.
pub fn matches(pattern: &str, candidate: &str) -> bool {
    Pattern::compile(pattern)
        .map(|p| p.is_match(candidate))
        .unwrap_or(false)
}

/// Canonical form of a request host: ASCII-lowercased, port removed.
pub fn normalize_host(host: &str) -> String {
    let host = host.trim();
    let bare = if host.starts_with('[') {
        // [v6]:port
        match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        }
    } else {
        match host.rsplit_once(':') {
            Some((name, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => {
                name
            }
            _ => host,
        }
    };
    bare.to_ascii_lowercase()
}
