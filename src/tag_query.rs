use std::collections::BTreeSet;

use serde::{Deserialize, Serialize, de::Error as _};

use crate::error::ProxyError;

/// Predicate tree over outbound server tag sets.
///
/// Three textual syntaxes normalize to this one AST: natural
/// (`web and not test`), symbol (`web && !test`), and compact
/// (`web,-test`). The JSON form is the persistent representation used by
/// presets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagQuery {
    Tag(String),
    Not(Box<TagQuery>),
    And(Vec<TagQuery>),
    Or(Vec<TagQuery>),
}

impl TagQuery {
    /// OR of leaves; the shape the deprecated comma-list filter produces.
    pub fn any_of<I: IntoIterator<Item = String>>(tags: I) -> Self {
        TagQuery::Or(tags.into_iter().map(TagQuery::Tag).collect())
    }

    /// Membership tests plus boolean combinators. Empty AND is true, empty
    /// OR is false.
    pub fn matches(&self, tags: &BTreeSet<String>) -> bool {
        match self {
            TagQuery::Tag(t) => tags.contains(t),
            TagQuery::Not(inner) => !inner.matches(tags),
            TagQuery::And(items) => items.iter().all(|q| q.matches(tags)),
            TagQuery::Or(items) => items.iter().any(|q| q.matches(tags)),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            TagQuery::Tag(t) => serde_json::json!({ "tag": t }),
            TagQuery::Not(inner) => serde_json::json!({ "$not": inner.to_json() }),
            TagQuery::And(items) => {
                serde_json::json!({ "$and": items.iter().map(|q| q.to_json()).collect::<Vec<_>>() })
            }
            TagQuery::Or(items) => {
                serde_json::json!({ "$or": items.iter().map(|q| q.to_json()).collect::<Vec<_>>() })
            }
        }
    }

    pub fn from_json(value: &serde_json::Value) -> Result<Self, ProxyError> {
        let obj = value
            .as_object()
            .ok_or_else(|| ProxyError::Validation("tag query node must be an object".into()))?;
        if obj.len() != 1 {
            return Err(ProxyError::Validation(
                "tag query node must have exactly one key".into(),
            ));
        }
        let (key, val) = obj.iter().next().expect("len checked");
        match key.as_str() {
            "tag" => {
                let tag = val
                    .as_str()
                    .ok_or_else(|| ProxyError::Validation("'tag' must be a string".into()))?;
                let tag = tag.to_ascii_lowercase();
                if !is_valid_tag(&tag) {
                    return Err(ProxyError::Validation(format!("invalid tag '{tag}'")));
                }
                Ok(TagQuery::Tag(tag))
            }
            "$not" => Ok(TagQuery::Not(Box::new(Self::from_json(val)?))),
            "$and" | "$or" => {
                let items = val
                    .as_array()
                    .ok_or_else(|| ProxyError::Validation(format!("'{key}' must be an array")))?
                    .iter()
                    .map(Self::from_json)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(if key == "$and" {
                    TagQuery::And(items)
                } else {
                    TagQuery::Or(items)
                })
            }
            other => Err(ProxyError::Validation(format!(
                "unknown tag query operator '{other}'"
            ))),
        }
    }

    /// Canonical, parseable human form. `parse(q.to_string())` yields `q`
    /// back for any parser-produced AST.
    fn render(&self, out: &mut String) {
        match self {
            TagQuery::Tag(t) => out.push_str(t),
            TagQuery::Not(inner) => {
                out.push_str("NOT ");
                if matches!(**inner, TagQuery::And(_) | TagQuery::Or(_)) {
                    out.push('(');
                    inner.render(out);
                    out.push(')');
                } else {
                    inner.render(out);
                }
            }
            TagQuery::And(items) => render_list(items, " AND ", |q| matches!(q, TagQuery::Or(_)), out),
            TagQuery::Or(items) => render_list(items, " OR ", |_| false, out),
        }
    }
}

fn render_list(
    items: &[TagQuery],
    sep: &str,
    needs_parens: impl Fn(&TagQuery) -> bool,
    out: &mut String,
) {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push_str(sep);
        }
        if needs_parens(item) {
            out.push('(');
            item.render(out);
            out.push(')');
        } else {
            item.render(out);
        }
    }
}

impl std::fmt::Display for TagQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = String::new();
        self.render(&mut s);
        f.write_str(&s)
    }
}

impl Serialize for TagQuery {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for TagQuery {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        TagQuery::from_json(&value).map_err(D::Error::custom)
    }
}

pub fn is_valid_tag(tag: &str) -> bool {
    !tag.is_empty()
        && tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    And,
    Or,
    Not,
    LParen,
    RParen,
}

/// True when the previous token leaves us expecting an operand, which is the
/// only position where `-` and `not` read as operators.
fn operand_position(prev: Option<&Token>) -> bool {
    matches!(
        prev,
        None | Some(Token::And) | Some(Token::Or) | Some(Token::Not) | Some(Token::LParen)
    )
}

fn tokenize(input: &str) -> Result<Vec<(usize, Token)>, ProxyError> {
    let bytes = input.as_bytes();
    let mut tokens: Vec<(usize, Token)> = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        let prev = tokens.last().map(|(_, t)| t);
        match c {
            ' ' | '\t' | '\r' | '\n' => i += 1,
            '(' => {
                tokens.push((i, Token::LParen));
                i += 1;
            }
            ')' => {
                tokens.push((i, Token::RParen));
                i += 1;
            }
            '+' => {
                tokens.push((i, Token::And));
                i += 1;
            }
            ',' => {
                tokens.push((i, Token::Or));
                i += 1;
            }
            '!' => {
                tokens.push((i, Token::Not));
                i += 1;
            }
            '&' => {
                if bytes.get(i + 1) == Some(&b'&') {
                    tokens.push((i, Token::And));
                    i += 2;
                } else {
                    return Err(parse_error(i, "expected '&&'"));
                }
            }
            '|' => {
                if bytes.get(i + 1) == Some(&b'|') {
                    tokens.push((i, Token::Or));
                    i += 2;
                } else {
                    return Err(parse_error(i, "expected '||'"));
                }
            }
            '-' if operand_position(prev)
                || (i > 0 && (bytes[i - 1] as char).is_ascii_whitespace()) =>
            {
                // Prefix negation when it starts a token after whitespace,
                // an operator, or '('. A '-' inside a word never reaches
                // this arm; the identifier scan consumes it.
                tokens.push((i, Token::Not));
                i += 1;
            }
            _ if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') => {
                let start = i;
                while i < bytes.len() {
                    let c = bytes[i] as char;
                    if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                        i += 1;
                    } else {
                        break;
                    }
                }
                let word = input[start..i].to_ascii_lowercase();
                let token = match word.as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    _ => Token::Ident(word),
                };
                tokens.push((start, token));
            }
            other => return Err(parse_error(i, &format!("unexpected character '{other}'"))),
        }
    }
    Ok(tokens)
}

fn parse_error(pos: usize, msg: &str) -> ProxyError {
    ProxyError::Validation(format!("tag filter parse error at {pos}: {msg}"))
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn offset(&self) -> usize {
        self.tokens.get(self.pos).map(|(o, _)| *o).unwrap_or(self.end)
    }

    fn bump(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    // Precedence low to high: OR < AND < NOT < atom.
    fn parse_or(&mut self) -> Result<TagQuery, ProxyError> {
        let mut items = vec![self.parse_and()?];
        while matches!(self.peek(), Some(Token::Or)) {
            self.bump();
            items.push(self.parse_and()?);
        }
        Ok(if items.len() == 1 {
            items.pop().expect("one item")
        } else {
            TagQuery::Or(items)
        })
    }

    fn parse_and(&mut self) -> Result<TagQuery, ProxyError> {
        let mut items = vec![self.parse_not()?];
        loop {
            match self.peek() {
                Some(Token::And) => {
                    self.bump();
                    items.push(self.parse_not()?);
                }
                // `a NOT b` reads as `a AND NOT b`.
                Some(Token::Not) => items.push(self.parse_not()?),
                _ => break,
            }
        }
        Ok(if items.len() == 1 {
            items.pop().expect("one item")
        } else {
            TagQuery::And(items)
        })
    }

    fn parse_not(&mut self) -> Result<TagQuery, ProxyError> {
        if matches!(self.peek(), Some(Token::Not)) {
            self.bump();
            return Ok(TagQuery::Not(Box::new(self.parse_not()?)));
        }
        self.parse_atom()
    }

    fn parse_atom(&mut self) -> Result<TagQuery, ProxyError> {
        let offset = self.offset();
        match self.bump() {
            Some(Token::Ident(name)) => Ok(TagQuery::Tag(name)),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                let offset = self.offset();
                match self.bump() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(parse_error(offset, "unbalanced parenthesis")),
                }
            }
            Some(other) => Err(parse_error(offset, &format!("unexpected {other:?}"))),
            None => Err(parse_error(offset, "dangling operator")),
        }
    }
}

/// Parse a textual tag filter in any of the three syntaxes.
pub fn parse(input: &str) -> Result<TagQuery, ProxyError> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(parse_error(0, "empty filter"));
    }
    let mut parser = Parser {
        tokens,
        pos: 0,
        end: input.len(),
    };
    let query = parser.parse_or()?;
    if parser.pos != parser.tokens.len() {
        return Err(parse_error(parser.offset(), "trailing input"));
    }
    Ok(query)
}

/// Parse the deprecated simple form: a comma-separated tag list, OR of
/// leaves. Rejects tokens outside `[A-Za-z0-9_.-]`.
pub fn parse_simple_tags(input: &str) -> Result<BTreeSet<String>, ProxyError> {
    let mut tags = BTreeSet::new();
    for raw in input.split(',') {
        let tag = raw.trim().to_ascii_lowercase();
        if tag.is_empty() {
            continue;
        }
        if !is_valid_tag(&tag) {
            return Err(ProxyError::Validation(format!("invalid tag '{tag}'")));
        }
        tags.insert(tag);
    }
    Ok(tags)
}

/// Normalize a tag set the way the evaluator expects (case-folded).
pub fn normalize_tags(tags: &BTreeSet<String>) -> BTreeSet<String> {
    tags.iter().map(|t| t.to_ascii_lowercase()).collect()
}
