//! Shell-style glob patterns.
//!
//! Supports `*`, `?`, bracket classes (`[abc]`, `[a-z]`, `[^x]` / `[!x]`) and
//! `\` escapes. A pattern is compiled once up front, so a malformed pattern is
//! rejected before any candidate is examined. Inside a class a literal `-`
//! must be escaped (`[a\-]`).

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GlobError {
    #[error("unterminated character class starting at offset {0}")]
    UnterminatedClass(usize),

    #[error("empty character class at offset {0}")]
    EmptyClass(usize),

    #[error("invalid range {start}-{end} in character class")]
    InvalidRange { start: char, end: char },

    #[error("unescaped '-' in character class at offset {0}")]
    BareDash(usize),

    #[error("dangling escape at end of pattern")]
    DanglingEscape,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ClassItem {
    Single(char),
    Range(char, char),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(char),
    AnyChar,
    AnyRun,
    Class { negated: bool, items: Vec<ClassItem> },
}

impl Token {
    fn accepts(&self, c: char) -> bool {
        match self {
            Token::Literal(l) => *l == c,
            Token::AnyChar => true,
            Token::AnyRun => false,
            Token::Class { negated, items } => {
                let hit = items.iter().any(|item| match *item {
                    ClassItem::Single(s) => s == c,
                    ClassItem::Range(lo, hi) => lo <= c && c <= hi,
                });
                hit != *negated
            }
        }
    }
}

/// A compiled glob pattern.
#[derive(Debug, Clone)]
pub struct Glob {
    source: String,
    tokens: Vec<Token>,
}

impl Glob {
    pub fn new(pattern: &str) -> Result<Self, GlobError> {
        let chars: Vec<char> = pattern.chars().collect();
        let mut tokens = Vec::new();
        let mut i = 0;

        while i < chars.len() {
            match chars[i] {
                '*' => {
                    // Consecutive stars are equivalent to one.
                    if tokens.last() != Some(&Token::AnyRun) {
                        tokens.push(Token::AnyRun);
                    }
                    i += 1;
                }
                '?' => {
                    tokens.push(Token::AnyChar);
                    i += 1;
                }
                '\\' => {
                    let escaped = *chars.get(i + 1).ok_or(GlobError::DanglingEscape)?;
                    tokens.push(Token::Literal(escaped));
                    i += 2;
                }
                '[' => {
                    let (class, next) = parse_class(&chars, i)?;
                    tokens.push(class);
                    i = next;
                }
                c => {
                    tokens.push(Token::Literal(c));
                    i += 1;
                }
            }
        }

        Ok(Self {
            source: pattern.to_string(),
            tokens,
        })
    }

    /// The pattern text this glob was compiled from.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Match the whole of `candidate` against the pattern.
    ///
    /// Iterative with single-star backtracking, so pathological patterns
    /// cannot blow the stack.
    pub fn matches(&self, candidate: &str) -> bool {
        let text: Vec<char> = candidate.chars().collect();
        let mut p = 0;
        let mut t = 0;
        // (token index after the last star, text index that star is resumed from)
        let mut star: Option<(usize, usize)> = None;

        while t < text.len() {
            match self.tokens.get(p) {
                Some(Token::AnyRun) => {
                    star = Some((p + 1, t));
                    p += 1;
                    continue;
                }
                Some(token) if token.accepts(text[t]) => {
                    p += 1;
                    t += 1;
                    continue;
                }
                _ => {}
            }

            match star {
                Some((resume_p, resume_t)) => {
                    p = resume_p;
                    t = resume_t + 1;
                    star = Some((resume_p, resume_t + 1));
                }
                None => return false,
            }
        }

        self.tokens[p..].iter().all(|token| *token == Token::AnyRun)
    }
}

/// Parse a bracket class starting at `chars[start] == '['`.
///
/// Returns the class token and the index just past the closing `]`.
fn parse_class(chars: &[char], start: usize) -> Result<(Token, usize), GlobError> {
    let mut i = start + 1;
    let negated = matches!(chars.get(i), Some('^') | Some('!'));
    if negated {
        i += 1;
    }

    let mut items = Vec::new();
    loop {
        let c = *chars.get(i).ok_or(GlobError::UnterminatedClass(start))?;
        if c == ']' {
            break;
        }
        if c == '-' {
            return Err(GlobError::BareDash(i));
        }

        let lo = if c == '\\' {
            i += 1;
            *chars.get(i).ok_or(GlobError::UnterminatedClass(start))?
        } else {
            c
        };
        i += 1;

        let is_range = chars.get(i) == Some(&'-')
            && chars.get(i + 1).is_some_and(|next| *next != ']');
        if is_range {
            let mut hi = chars[i + 1];
            if hi == '-' {
                return Err(GlobError::BareDash(i + 1));
            }
            i += 2;
            if hi == '\\' {
                hi = *chars.get(i).ok_or(GlobError::UnterminatedClass(start))?;
                i += 1;
            }
            if hi < lo {
                return Err(GlobError::InvalidRange { start: lo, end: hi });
            }
            items.push(ClassItem::Range(lo, hi));
        } else {
            items.push(ClassItem::Single(lo));
        }
    }

    if items.is_empty() {
        return Err(GlobError::EmptyClass(start));
    }

    Ok((Token::Class { negated, items }, i + 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn glob(p: &str) -> Glob {
        Glob::new(p).expect("pattern should compile")
    }

    #[test]
    fn literal_requires_exact_match() {
        assert!(glob("host1").matches("host1"));
        assert!(!glob("host1").matches("host10"));
        assert!(!glob("host1").matches("host"));
    }

    #[test]
    fn star_matches_any_run() {
        let g = glob("10.0.*");
        assert!(g.matches("10.0.1.5:4431"));
        assert!(g.matches("10.0."));
        assert!(!g.matches("10.1.0.1:22"));
        assert!(glob("*").matches(""));
        assert!(glob("a*b*c").matches("axxbyyc"));
        assert!(!glob("a*b*c").matches("axxbyy"));
    }

    #[test]
    fn question_matches_single_char() {
        assert!(glob("host?").matches("host7"));
        assert!(!glob("host?").matches("host"));
        assert!(!glob("host?").matches("host77"));
    }

    #[test]
    fn classes_and_ranges() {
        let g = glob("web[0-9][ab]");
        assert!(g.matches("web1a"));
        assert!(g.matches("web9b"));
        assert!(!g.matches("webxa"));
        assert!(!g.matches("web1c"));
    }

    #[test]
    fn negated_classes() {
        assert!(glob("[^a]*").matches("bcd"));
        assert!(!glob("[^a]*").matches("abc"));
        assert!(glob("[!0-9]x").matches("ax"));
        assert!(!glob("[!0-9]x").matches("5x"));
    }

    #[test]
    fn escapes_are_literal() {
        assert!(glob(r"a\*b").matches("a*b"));
        assert!(!glob(r"a\*b").matches("axb"));
        assert!(glob(r"[\]]").matches("]"));
    }

    #[test]
    fn unbalanced_bracket_is_rejected() {
        assert_eq!(Glob::new("[").unwrap_err(), GlobError::UnterminatedClass(0));
        assert_eq!(Glob::new("ab[cd").unwrap_err(), GlobError::UnterminatedClass(2));
    }

    #[test]
    fn empty_class_is_rejected() {
        assert_eq!(Glob::new("[]").unwrap_err(), GlobError::EmptyClass(0));
        assert_eq!(Glob::new("x[^]").unwrap_err(), GlobError::EmptyClass(1));
    }

    #[test]
    fn reversed_range_is_rejected() {
        assert!(matches!(
            Glob::new("[z-a]"),
            Err(GlobError::InvalidRange { start: 'z', end: 'a' })
        ));
    }

    #[test]
    fn trailing_backslash_is_rejected() {
        assert_eq!(Glob::new("abc\\").unwrap_err(), GlobError::DanglingEscape);
    }

    #[test]
    fn bare_dash_in_class_is_rejected() {
        assert_eq!(Glob::new("[a-]").unwrap_err(), GlobError::BareDash(2));
        assert_eq!(Glob::new("[-a]").unwrap_err(), GlobError::BareDash(1));
        assert_eq!(Glob::new("[a--]").unwrap_err(), GlobError::BareDash(3));
    }

    #[test]
    fn escaped_dash_in_class_is_literal() {
        let g = glob("[a\\-]");
        assert!(g.matches("-"));
        assert!(g.matches("a"));
        assert!(!g.matches("b"));
    }

    #[test]
    fn empty_pattern_matches_only_empty() {
        assert!(glob("").matches(""));
        assert!(!glob("").matches("x"));
    }

    #[test]
    fn many_stars_do_not_explode() {
        let g = glob("*a*a*a*a*a*a*a*b");
        let text = "a".repeat(200);
        assert!(!g.matches(&text));
    }
}
