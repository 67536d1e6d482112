//! Failure association rule expressions.
//!
//! A rule is a boolean expression over two failure attributes, `test` (the
//! test ID) and `reason` (the primary error message, empty when absent):
//!
//! ```text
//! expr  := and ( OR and )*
//! and   := not ( AND not )*
//! not   := NOT not | pred
//! pred  := '(' expr ')' | TRUE | FALSE
//!        | REGEXP_CONTAINS '(' field ',' string ')'
//!        | field [NOT] LIKE string
//!        | field ( '=' | '!=' | '<>' ) string
//!        | field [NOT] IN '(' string ( ',' string )* ')'
//! ```
//!
//! Keywords are case-insensitive. Patterns are compiled once at parse time.

use crate::error::{Error, Result};
use regex::Regex;
use std::fmt;

/// Attribute values a rule is evaluated against.
#[derive(Debug, Clone, Copy, Default)]
pub struct Attributes<'a> {
    pub test: &'a str,
    pub reason: &'a str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Test,
    Reason,
}

impl Field {
    fn value<'a>(self, attrs: &Attributes<'a>) -> &'a str {
        match self {
            Field::Test => attrs.test,
            Field::Reason => attrs.reason,
        }
    }
}

#[derive(Debug, Clone)]
enum Node {
    Bool(bool),
    Or(Vec<Node>),
    And(Vec<Node>),
    Not(Box<Node>),
    Equals { field: Field, value: String },
    In { field: Field, values: Vec<String> },
    Matches { field: Field, pattern: Regex },
}

impl Node {
    fn eval(&self, attrs: &Attributes<'_>) -> bool {
        match self {
            Node::Bool(value) => *value,
            Node::Or(nodes) => nodes.iter().any(|n| n.eval(attrs)),
            Node::And(nodes) => nodes.iter().all(|n| n.eval(attrs)),
            Node::Not(node) => !node.eval(attrs),
            Node::Equals { field, value } => field.value(attrs) == value,
            Node::In { field, values } => {
                let actual = field.value(attrs);
                values.iter().any(|v| v == actual)
            }
            Node::Matches { field, pattern } => pattern.is_match(field.value(attrs)),
        }
    }
}

/// A parsed, compiled rule definition.
#[derive(Clone)]
pub struct RuleExpression {
    source: String,
    root: Node,
}

impl fmt::Debug for RuleExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RuleExpression").field(&self.source).finish()
    }
}

impl RuleExpression {
    pub fn parse(source: &str) -> Result<Self> {
        let tokens = tokenize(source)?;
        let mut parser = Parser { tokens, pos: 0 };
        let root = parser.expr()?;
        if let Some(token) = parser.peek() {
            return Err(Error::validation(format!(
                "rule definition: unexpected {token} after expression"
            )));
        }
        Ok(Self {
            source: source.to_string(),
            root,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn evaluate(&self, attrs: &Attributes<'_>) -> bool {
        self.root.eval(attrs)
    }
}

/// Escapes `\`, `%` and `_` so `input` matches itself literally in LIKE.
pub fn like_escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        if matches!(c, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Compiles a LIKE pattern into an anchored regex.
pub fn like_to_regex(pattern: &str) -> Result<Regex> {
    let mut re = String::from("(?s)^");
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '%' => re.push_str(".*"),
            '_' => re.push('.'),
            '\\' => match chars.next() {
                Some(escaped) => re.push_str(&regex::escape(&escaped.to_string())),
                None => {
                    return Err(Error::validation(
                        "LIKE pattern ends with an unfinished escape sequence",
                    ))
                }
            },
            other => re.push_str(&regex::escape(&other.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re).map_err(|err| Error::validation(format!("LIKE pattern: {err}")))
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(String),
    /// A string literal, and the same literal with `\%` and `\_` kept
    /// escaped for use as a LIKE pattern.
    Str { text: String, pattern: String },
    LParen,
    RParen,
    Comma,
    Eq,
    Ne,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Word(w) => write!(f, "{w:?}"),
            Token::Str { text, .. } => write!(f, "string {text:?}"),
            Token::LParen => write!(f, "\"(\""),
            Token::RParen => write!(f, "\")\""),
            Token::Comma => write!(f, "\",\""),
            Token::Eq => write!(f, "\"=\""),
            Token::Ne => write!(f, "\"!=\""),
        }
    }
}

fn tokenize(source: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = source.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            '=' => {
                chars.next();
                tokens.push(Token::Eq);
            }
            '!' => {
                chars.next();
                if chars.next() != Some('=') {
                    return Err(Error::validation("rule definition: expected \"!=\""));
                }
                tokens.push(Token::Ne);
            }
            '<' => {
                chars.next();
                if chars.next() != Some('>') {
                    return Err(Error::validation("rule definition: expected \"<>\""));
                }
                tokens.push(Token::Ne);
            }
            '"' | '\'' => {
                let quote = c;
                chars.next();
                let mut text = String::new();
                let mut pattern = String::new();
                loop {
                    match chars.next() {
                        Some('\\') => match chars.next() {
                            Some('n') => {
                                text.push('\n');
                                pattern.push('\n');
                            }
                            Some('t') => {
                                text.push('\t');
                                pattern.push('\t');
                            }
                            Some(e @ ('%' | '_')) => {
                                text.push(e);
                                pattern.push('\\');
                                pattern.push(e);
                            }
                            Some(e) => {
                                text.push(e);
                                pattern.push(e);
                            }
                            None => {
                                return Err(Error::validation(
                                    "rule definition: unterminated string literal",
                                ))
                            }
                        },
                        Some(ch) if ch == quote => break,
                        Some(ch) => {
                            text.push(ch);
                            pattern.push(ch);
                        }
                        None => {
                            return Err(Error::validation(
                                "rule definition: unterminated string literal",
                            ))
                        }
                    }
                }
                tokens.push(Token::Str { text, pattern });
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut word = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_ascii_alphanumeric() || ch == '_' {
                        word.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Word(word));
            }
            other => {
                return Err(Error::validation(format!(
                    "rule definition: unexpected character {other:?}"
                )))
            }
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token::Word(w)) if w.eq_ignore_ascii_case(keyword))
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.peek_keyword(keyword) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: Token) -> Result<()> {
        match self.next() {
            Some(token) if token == expected => Ok(()),
            Some(token) => Err(Error::validation(format!(
                "rule definition: expected {expected}, found {token}"
            ))),
            None => Err(Error::validation(format!(
                "rule definition: expected {expected}, found end of input"
            ))),
        }
    }

    fn string_token(&mut self) -> Result<(String, String)> {
        match self.next() {
            Some(Token::Str { text, pattern }) => Ok((text, pattern)),
            Some(token) => Err(Error::validation(format!(
                "rule definition: expected string literal, found {token}"
            ))),
            None => Err(Error::validation(
                "rule definition: expected string literal, found end of input",
            )),
        }
    }

    /// A string literal compared verbatim.
    fn literal(&mut self) -> Result<String> {
        Ok(self.string_token()?.0)
    }

    /// A string literal as a LIKE pattern.
    fn like_pattern(&mut self) -> Result<String> {
        Ok(self.string_token()?.1)
    }

    fn field(&mut self) -> Result<Field> {
        match self.next() {
            Some(Token::Word(w)) if w == "test" => Ok(Field::Test),
            Some(Token::Word(w)) if w == "reason" => Ok(Field::Reason),
            Some(token) => Err(Error::validation(format!(
                "rule definition: unknown identifier {token}, expected test or reason"
            ))),
            None => Err(Error::validation(
                "rule definition: expected identifier, found end of input",
            )),
        }
    }

    fn expr(&mut self) -> Result<Node> {
        let mut nodes = vec![self.and()?];
        while self.eat_keyword("OR") {
            nodes.push(self.and()?);
        }
        Ok(if nodes.len() == 1 {
            nodes.remove(0)
        } else {
            Node::Or(nodes)
        })
    }

    fn and(&mut self) -> Result<Node> {
        let mut nodes = vec![self.not()?];
        while self.eat_keyword("AND") {
            nodes.push(self.not()?);
        }
        Ok(if nodes.len() == 1 {
            nodes.remove(0)
        } else {
            Node::And(nodes)
        })
    }

    fn not(&mut self) -> Result<Node> {
        if self.eat_keyword("NOT") {
            return Ok(Node::Not(Box::new(self.not()?)));
        }
        self.predicate()
    }

    fn predicate(&mut self) -> Result<Node> {
        if matches!(self.peek(), Some(Token::LParen)) {
            self.pos += 1;
            let node = self.expr()?;
            self.expect(Token::RParen)?;
            return Ok(node);
        }
        if self.eat_keyword("TRUE") {
            return Ok(Node::Bool(true));
        }
        if self.eat_keyword("FALSE") {
            return Ok(Node::Bool(false));
        }
        if self.eat_keyword("REGEXP_CONTAINS") {
            self.expect(Token::LParen)?;
            let field = self.field()?;
            self.expect(Token::Comma)?;
            let pattern = self.literal()?;
            self.expect(Token::RParen)?;
            let pattern = Regex::new(&pattern)
                .map_err(|err| Error::validation(format!("rule definition: {err}")))?;
            return Ok(Node::Matches { field, pattern });
        }

        let field = self.field()?;
        let negate = self.eat_keyword("NOT");
        let node = if self.eat_keyword("LIKE") {
            let pattern = like_to_regex(&self.like_pattern()?)?;
            Node::Matches { field, pattern }
        } else if self.eat_keyword("IN") {
            self.expect(Token::LParen)?;
            let mut values = vec![self.literal()?];
            while matches!(self.peek(), Some(Token::Comma)) {
                self.pos += 1;
                values.push(self.literal()?);
            }
            self.expect(Token::RParen)?;
            Node::In { field, values }
        } else if negate {
            return Err(Error::validation(
                "rule definition: expected LIKE or IN after NOT",
            ));
        } else {
            match self.next() {
                Some(Token::Eq) => Node::Equals {
                    field,
                    value: self.literal()?,
                },
                Some(Token::Ne) => Node::Not(Box::new(Node::Equals {
                    field,
                    value: self.literal()?,
                })),
                Some(token) => {
                    return Err(Error::validation(format!(
                        "rule definition: expected operator, found {token}"
                    )))
                }
                None => {
                    return Err(Error::validation(
                        "rule definition: expected operator, found end of input",
                    ))
                }
            }
        };
        Ok(if negate {
            Node::Not(Box::new(node))
        } else {
            node
        })
    }
}
