//! RFC 6570 level-1 URI templates
//!
//! Only simple string expressions (`{var}`) are supported. Matching binds
//! each variable to a non-empty run of unreserved or percent-encoded
//! characters, so a variable never spans a path separator.

use std::collections::HashMap;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Variable(String),
}

/// A parsed, validated URI template.
#[derive(Debug, Clone, PartialEq)]
pub struct UriTemplate {
    raw: String,
    segments: Vec<Segment>,
}

#[derive(Debug, Error, PartialEq)]
pub enum TemplateError {
    #[error("unterminated expression starting at byte {0}")]
    UnterminatedExpression(usize),
    #[error("stray '}}' at byte {0}")]
    StrayClose(usize),
    #[error("empty expression")]
    EmptyExpression,
    #[error("operator {0:?} requires a template level above 1")]
    UnsupportedOperator(char),
    #[error("invalid character {0:?} in variable name")]
    InvalidVariableChar(char),
    #[error("adjacent expressions cannot be matched unambiguously")]
    AdjacentExpressions,
}

const LEVEL2_PLUS_OPERATORS: &[char] = &['+', '#', '.', '/', ';', '?', '&', '=', ',', '!', '@', '|'];

impl UriTemplate {
    pub fn parse(raw: &str) -> Result<Self, TemplateError> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = raw.char_indices().peekable();

        while let Some((at, ch)) = chars.next() {
            match ch {
                '{' => {
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    let mut name = String::new();
                    let mut terminated = false;
                    for (_, inner) in chars.by_ref() {
                        if inner == '}' {
                            terminated = true;
                            break;
                        }
                        name.push(inner);
                    }
                    if !terminated {
                        return Err(TemplateError::UnterminatedExpression(at));
                    }
                    if name.is_empty() {
                        return Err(TemplateError::EmptyExpression);
                    }
                    let first = name.chars().next().unwrap_or_default();
                    if LEVEL2_PLUS_OPERATORS.contains(&first) {
                        return Err(TemplateError::UnsupportedOperator(first));
                    }
                    if let Some(bad) = name
                        .chars()
                        .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '.'))
                    {
                        return Err(TemplateError::InvalidVariableChar(bad));
                    }
                    if matches!(segments.last(), Some(Segment::Variable(_))) {
                        return Err(TemplateError::AdjacentExpressions);
                    }
                    segments.push(Segment::Variable(name));
                }
                '}' => return Err(TemplateError::StrayClose(at)),
                other => literal.push(other),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Attempts to match a concrete URI, returning the variable bindings on
    /// success. Matching is left-to-right with no backtracking; templates
    /// whose expansions overlap are the caller's responsibility.
    pub fn match_uri(&self, uri: &str) -> Option<HashMap<String, String>> {
        let mut bindings = HashMap::new();
        let mut rest = uri;
        let mut segments = self.segments.iter().peekable();

        while let Some(segment) = segments.next() {
            match segment {
                Segment::Literal(literal) => {
                    rest = rest.strip_prefix(literal.as_str())?;
                }
                Segment::Variable(name) => {
                    let captured = match segments.peek() {
                        Some(Segment::Literal(next)) => {
                            let end = rest.find(next.as_str())?;
                            let (captured, tail) = rest.split_at(end);
                            rest = tail;
                            captured
                        }
                        // parse() rejects adjacent expressions
                        _ => std::mem::take(&mut rest),
                    };
                    if captured.is_empty() || !captured.chars().all(is_value_char) {
                        return None;
                    }
                    bindings.insert(name.clone(), captured.to_string());
                }
            }
        }

        rest.is_empty().then_some(bindings)
    }
}

/// Unreserved characters plus `%`, the alphabet of a simple-string expansion.
fn is_value_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '~' | '%')
}
