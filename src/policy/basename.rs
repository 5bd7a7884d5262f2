// src/policy/basename.rs

//! Tokenised basename rules
//!
//! A rule is written as a small pattern, for example `log-[0-9]+.txt`:
//!
//! - `[0-9]` matches exactly one digit
//! - `[0-9]+` matches one or more digits
//! - `?` inside literal text matches any single byte
//! - a trailing `*` lets the name continue past the final literal
//!
//! Patterns compile into at most [`MAX_TOKENS`] tokens so matching stays a
//! bounded loop with no allocation.

use crate::error::{Error, Result};
use std::fmt;

pub const MAX_TOKENS: usize = 6;
pub const MAX_LITERAL_LEN: usize = 32;
pub const MAX_RULES_PER_PARENT: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Literal(Vec<u8>),
    /// Exactly one `[0-9]`
    Digit1,
    /// One or more digits
    DigitsPlus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasenameRule {
    pub tokens: Vec<Token>,
    /// Final literal only needs to match as a prefix of the remaining name
    pub tail_wildcard: bool,
    pub allow_mask: u32,
}

impl BasenameRule {
    /// Compile a pattern into a rule
    pub fn parse(pattern: &str, allow_mask: u32) -> Result<Self> {
        let invalid = |msg: &str| Error::validation("basename rule", format!("'{pattern}': {msg}"));
        let bytes = pattern.as_bytes();
        if bytes.is_empty() {
            return Err(invalid("empty pattern"));
        }

        let mut tokens = Vec::new();
        let mut literal = Vec::new();
        let mut tail_wildcard = false;
        let mut i = 0;

        while i < bytes.len() {
            let rest = &bytes[i..];
            if rest.starts_with(b"[0-9]") {
                if !literal.is_empty() {
                    tokens.push(Token::Literal(std::mem::take(&mut literal)));
                }
                if rest[5..].starts_with(b"+") {
                    tokens.push(Token::DigitsPlus);
                    i += 6;
                } else {
                    tokens.push(Token::Digit1);
                    i += 5;
                }
            } else if bytes[i] == b'*' {
                if i != bytes.len() - 1 {
                    return Err(invalid("'*' is only allowed at the end"));
                }
                tokens.push(Token::Literal(std::mem::take(&mut literal)));
                tail_wildcard = true;
                i += 1;
            } else if bytes[i] == b'/' {
                return Err(invalid("basename patterns cannot contain '/'"));
            } else {
                literal.push(bytes[i]);
                if literal.len() > MAX_LITERAL_LEN {
                    return Err(invalid("literal longer than 32 bytes"));
                }
                i += 1;
            }
        }
        if !literal.is_empty() {
            tokens.push(Token::Literal(literal));
        }
        if tokens.len() > MAX_TOKENS {
            return Err(invalid("more than 6 tokens"));
        }

        Ok(Self {
            tokens,
            tail_wildcard,
            allow_mask,
        })
    }

    pub fn token_count(&self) -> usize {
        self.tokens.len()
    }

    /// Whether `name` satisfies every token in order
    pub fn matches(&self, name: &[u8]) -> bool {
        if self.tokens.is_empty() {
            return false;
        }
        let last = self.tokens.len() - 1;
        let mut pos = 0;

        for (index, token) in self.tokens.iter().enumerate() {
            match token {
                Token::Literal(text) => {
                    if name.len() - pos < text.len() {
                        return false;
                    }
                    let window = &name[pos..pos + text.len()];
                    let same = text
                        .iter()
                        .zip(window)
                        .all(|(want, got)| *want == b'?' || want == got);
                    if !same {
                        return false;
                    }
                    pos += text.len();
                    if index == last && self.tail_wildcard {
                        return true;
                    }
                }
                Token::Digit1 => {
                    if pos >= name.len() || !name[pos].is_ascii_digit() {
                        return false;
                    }
                    pos += 1;
                }
                Token::DigitsPlus => {
                    let start = pos;
                    while pos < name.len() && name[pos].is_ascii_digit() {
                        pos += 1;
                    }
                    if pos == start {
                        return false;
                    }
                }
            }
        }

        pos == name.len()
    }
}

impl fmt::Display for BasenameRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for token in &self.tokens {
            match token {
                Token::Literal(text) => write!(f, "{}", String::from_utf8_lossy(text))?,
                Token::Digit1 => f.write_str("[0-9]")?,
                Token::DigitsPlus => f.write_str("[0-9]+")?,
            }
        }
        if self.tail_wildcard {
            f.write_str("*")?;
        }
        Ok(())
    }
}
