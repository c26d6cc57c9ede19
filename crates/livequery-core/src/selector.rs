//! Path expressions understood by [`MemoryTree`](crate::memory::MemoryTree).
//!
//! A small subset of XPath location paths:
//!
//! ```text
//! path      := step+
//! step      := ("/" | "//") name predicate*
//! name      := "*" | identifier
//! predicate := "[" ( "@" ident ( "=" literal )?
//!                  | "text()" "=" literal
//!                  | "contains(" ( "@" ident | "text()" ) "," literal ")"
//!                  | positive-integer ) "]"
//! literal   := "'" chars "'" | '"' chars '"'
//! ```
//!
//! `/` selects children of the context node, `//` selects descendants.
//! Evaluation starts at the document root.

use crate::error::QueryError;

/// A parsed path expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Path {
    /// Steps in evaluation order.
    pub steps: Vec<Step>,
}

/// How a step moves from its context node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    /// Direct children (`/`).
    Child,
    /// All descendants (`//`).
    Descendant,
}

/// One location step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    /// Axis of the step.
    pub axis: Axis,
    /// Required tag name; `None` for `*`.
    pub name: Option<String>,
    /// Filters applied in order.
    pub predicates: Vec<Predicate>,
}

/// What a `contains(...)` predicate inspects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    /// An attribute value.
    Attribute(String),
    /// The element's own text.
    Text,
}

/// A step filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    /// `[@name]`
    HasAttribute(String),
    /// `[@name='value']`
    AttributeEquals(String, String),
    /// `[text()='value']`
    TextEquals(String),
    /// `[contains(@name, 'v')]` or `[contains(text(), 'v')]`
    Contains(Operand, String),
    /// `[n]`, 1-based position among the step's candidates.
    Position(usize),
}

impl Path {
    /// Parses `query`.
    pub fn parse(query: &str) -> Result<Self, QueryError> {
        Parser { query, pos: 0 }.path()
    }
}

struct Parser<'a> {
    query: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn path(mut self) -> Result<Path, QueryError> {
        self.skip_ws();
        if self.at_end() {
            return Err(self.fail("empty query"));
        }
        let mut steps = Vec::new();
        while !self.at_end() {
            steps.push(self.step()?);
            self.skip_ws();
        }
        Ok(Path { steps })
    }

    fn step(&mut self) -> Result<Step, QueryError> {
        let axis = if self.eat("//") {
            Axis::Descendant
        } else if self.eat("/") {
            Axis::Child
        } else {
            return Err(self.fail("expected `/` or `//`"));
        };
        let name = if self.eat("*") {
            None
        } else {
            Some(self.identifier()?)
        };
        let mut predicates = Vec::new();
        while self.eat("[") {
            self.skip_ws();
            predicates.push(self.predicate()?);
            self.skip_ws();
            if !self.eat("]") {
                return Err(self.fail("expected `]`"));
            }
        }
        Ok(Step {
            axis,
            name,
            predicates,
        })
    }

    fn predicate(&mut self) -> Result<Predicate, QueryError> {
        if self.eat("@") {
            let name = self.identifier()?;
            self.skip_ws();
            if self.eat("=") {
                self.skip_ws();
                let value = self.literal()?;
                return Ok(Predicate::AttributeEquals(name, value));
            }
            return Ok(Predicate::HasAttribute(name));
        }
        if self.eat("text()") {
            self.skip_ws();
            if !self.eat("=") {
                return Err(self.fail("expected `=` after text()"));
            }
            self.skip_ws();
            return Ok(Predicate::TextEquals(self.literal()?));
        }
        if self.eat("contains(") {
            self.skip_ws();
            let operand = if self.eat("@") {
                Operand::Attribute(self.identifier()?)
            } else if self.eat("text()") {
                Operand::Text
            } else {
                return Err(self.fail("expected `@attribute` or `text()`"));
            };
            self.skip_ws();
            if !self.eat(",") {
                return Err(self.fail("expected `,`"));
            }
            self.skip_ws();
            let needle = self.literal()?;
            self.skip_ws();
            if !self.eat(")") {
                return Err(self.fail("expected `)`"));
            }
            return Ok(Predicate::Contains(operand, needle));
        }
        let digits = self.take_while(|c| c.is_ascii_digit());
        if digits.is_empty() {
            return Err(self.fail("unsupported predicate"));
        }
        match digits.parse::<usize>() {
            Ok(position) if position > 0 => Ok(Predicate::Position(position)),
            _ => Err(self.fail("position must be a positive integer")),
        }
    }

    fn identifier(&mut self) -> Result<String, QueryError> {
        let start = self.pos;
        let first = self.peek();
        if !first.is_some_and(|c| c.is_ascii_alphabetic() || c == '_') {
            return Err(self.fail("expected a name"));
        }
        self.take_while(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        Ok(self.query[start..self.pos].to_string())
    }

    fn literal(&mut self) -> Result<String, QueryError> {
        let quote = match self.peek() {
            Some(quote @ ('\'' | '"')) => quote,
            _ => return Err(self.fail("expected a quoted string")),
        };
        let opened_at = self.pos;
        self.pos += 1;
        let content_start = self.pos;
        match self.query[content_start..].find(quote) {
            Some(offset) => {
                self.pos = content_start + offset + 1;
                Ok(self.query[content_start..content_start + offset].to_string())
            }
            None => {
                self.pos = opened_at;
                Err(self.fail("unterminated string"))
            }
        }
    }

    fn take_while(&mut self, keep: impl Fn(char) -> bool) -> &'a str {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if !keep(c) {
                break;
            }
            self.pos += c.len_utf8();
        }
        &self.query[start..self.pos]
    }

    fn skip_ws(&mut self) {
        self.take_while(char::is_whitespace);
    }

    fn eat(&mut self, token: &str) -> bool {
        if self.query[self.pos..].starts_with(token) {
            self.pos += token.len();
            true
        } else {
            false
        }
    }

    fn peek(&self) -> Option<char> {
        self.query[self.pos..].chars().next()
    }

    fn at_end(&self) -> bool {
        self.pos >= self.query.len()
    }

    fn fail(&self, reason: &str) -> QueryError {
        QueryError::Malformed {
            query: self.query.to_string(),
            position: self.pos,
            reason: reason.to_string(),
        }
    }
}
