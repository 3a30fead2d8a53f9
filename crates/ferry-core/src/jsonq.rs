//! A jq-style filter subset for tools that emit JSON.
//!
//! Lint recipes that set a JSON query get their stdout parsed as one JSON
//! document and run through the filter; every emitted object becomes a
//! diagnostic candidate. The supported grammar covers what diagnostic
//! extraction needs:
//!
//! ```text
//! .                              identity
//! .foo.bar                       field access
//! .foo?                          field access, silent on mismatch
//! .[]  .foo[]                    array/object iteration
//! .[0] .items[-1]                array index (negative from the end)
//! f | g                          pipeline
//! {file, message, rule: .code}   object construction, shorthand keys
//! ```
//!
//! Evaluation never fails: a step applied to a value of the wrong shape
//! simply produces nothing, matching the engine's skip-silently policy.

use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum JsonQueryError {
    #[error("invalid JSON query at byte {at}: {reason}")]
    Parse { at: usize, reason: String },
}

/// A parsed filter: a pipeline of stages.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    stages: Vec<Stage>,
}

#[derive(Debug, Clone, PartialEq)]
enum Stage {
    /// A path expression; an empty step list is the identity.
    Path(Vec<Step>),
    /// `{key, key: filter, ...}`
    Object(Vec<(String, Option<Filter>)>),
}

#[derive(Debug, Clone, PartialEq)]
enum Step {
    Field(String),
    Index(i64),
    Iterate,
}

impl Filter {
    pub fn parse(src: &str) -> Result<Self, JsonQueryError> {
        let mut parser = Parser {
            src: src.as_bytes(),
            pos: 0,
        };
        let filter = parser.filter()?;
        parser.skip_ws();
        if parser.pos != parser.src.len() {
            return Err(parser.error("trailing input"));
        }
        Ok(filter)
    }

    /// Run the filter, producing every output value.
    pub fn apply(&self, input: &Value) -> Vec<Value> {
        let mut values = vec![input.clone()];
        for stage in &self.stages {
            values = values.iter().flat_map(|v| stage.apply(v)).collect();
        }
        values
    }
}

impl Stage {
    fn apply(&self, input: &Value) -> Vec<Value> {
        match self {
            Stage::Path(steps) => {
                let mut values = vec![input.clone()];
                for step in steps {
                    values = values.iter().flat_map(|v| step.apply(v)).collect();
                }
                values
            }
            Stage::Object(fields) => {
                let mut object = Map::new();
                for (key, filter) in fields {
                    let value = match filter {
                        Some(f) => f.apply(input).into_iter().next().unwrap_or(Value::Null),
                        // Shorthand `{key}` reads `.key` from the input.
                        None => input.get(key).cloned().unwrap_or(Value::Null),
                    };
                    object.insert(key.clone(), value);
                }
                vec![Value::Object(object)]
            }
        }
    }
}

impl Step {
    fn apply(&self, input: &Value) -> Vec<Value> {
        match self {
            Step::Field(name) => match input {
                Value::Object(map) => vec![map.get(name).cloned().unwrap_or(Value::Null)],
                _ => Vec::new(),
            },
            Step::Index(i) => match input {
                Value::Array(items) => {
                    let index = if *i < 0 {
                        items.len() as i64 + i
                    } else {
                        *i
                    };
                    usize::try_from(index)
                        .ok()
                        .and_then(|i| items.get(i))
                        .cloned()
                        .map(|v| vec![v])
                        .unwrap_or_default()
                }
                _ => Vec::new(),
            },
            Step::Iterate => match input {
                Value::Array(items) => items.clone(),
                Value::Object(map) => map.values().cloned().collect(),
                _ => Vec::new(),
            },
        }
    }
}

struct Parser<'a> {
    src: &'a [u8],
    pos: usize,
}

impl Parser<'_> {
    fn error(&self, reason: &str) -> JsonQueryError {
        JsonQueryError::Parse {
            at: self.pos,
            reason: reason.to_string(),
        }
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let c = self.peek()?;
        self.pos += 1;
        Some(c)
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t' | b'\n' | b'\r')) {
            self.pos += 1;
        }
    }

    fn eat(&mut self, c: u8) -> bool {
        if self.peek() == Some(c) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn filter(&mut self) -> Result<Filter, JsonQueryError> {
        let mut stages = vec![self.stage()?];
        loop {
            self.skip_ws();
            if self.eat(b'|') {
                stages.push(self.stage()?);
            } else {
                break;
            }
        }
        Ok(Filter { stages })
    }

    fn stage(&mut self) -> Result<Stage, JsonQueryError> {
        self.skip_ws();
        match self.peek() {
            Some(b'{') => self.object(),
            Some(b'.') => Ok(Stage::Path(self.path()?)),
            _ => Err(self.error("expected '.' or '{'")),
        }
    }

    fn path(&mut self) -> Result<Vec<Step>, JsonQueryError> {
        let mut steps = Vec::new();
        if !self.eat(b'.') {
            return Err(self.error("expected '.'"));
        }
        loop {
            match self.peek() {
                Some(c) if c == b'_' || c.is_ascii_alphabetic() => {
                    let name = self.identifier();
                    self.eat(b'?');
                    steps.push(Step::Field(name));
                }
                Some(b'"') => {
                    let name = self.string()?;
                    self.eat(b'?');
                    steps.push(Step::Field(name));
                }
                Some(b'[') => {
                    self.pos += 1;
                    self.skip_ws();
                    if self.eat(b']') {
                        steps.push(Step::Iterate);
                    } else {
                        let index = self.integer()?;
                        self.skip_ws();
                        if !self.eat(b']') {
                            return Err(self.error("expected ']'"));
                        }
                        steps.push(Step::Index(index));
                    }
                    self.eat(b'?');
                }
                _ => break,
            }
            // Continued paths: `.a.b`, `.a[].b`, `.a[0][1]`
            match self.peek() {
                Some(b'.') => {
                    self.pos += 1;
                }
                Some(b'[') => {}
                _ => break,
            }
        }
        Ok(steps)
    }

    fn object(&mut self) -> Result<Stage, JsonQueryError> {
        self.pos += 1; // '{'
        let mut fields = Vec::new();
        loop {
            self.skip_ws();
            if self.eat(b'}') {
                break;
            }
            let key = match self.peek() {
                Some(b'"') => self.string()?,
                Some(c) if c == b'_' || c.is_ascii_alphabetic() => self.identifier(),
                _ => return Err(self.error("expected object key")),
            };
            self.skip_ws();
            let value = if self.eat(b':') {
                Some(self.filter_until_object_delimiter()?)
            } else {
                None
            };
            fields.push((key, value));
            self.skip_ws();
            if self.eat(b',') {
                continue;
            }
            if self.eat(b'}') {
                break;
            }
            return Err(self.error("expected ',' or '}'"));
        }
        Ok(Stage::Object(fields))
    }

    /// A value filter inside an object literal; stops at `,` or `}`.
    fn filter_until_object_delimiter(&mut self) -> Result<Filter, JsonQueryError> {
        self.skip_ws();
        let stage = self.stage()?;
        Ok(Filter {
            stages: vec![stage],
        })
    }

    fn identifier(&mut self) -> String {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c == b'_' || c.is_ascii_alphanumeric()) {
            self.pos += 1;
        }
        String::from_utf8_lossy(&self.src[start..self.pos]).into_owned()
    }

    fn integer(&mut self) -> Result<i64, JsonQueryError> {
        let start = self.pos;
        self.eat(b'-');
        while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
            self.pos += 1;
        }
        let text = std::str::from_utf8(&self.src[start..self.pos]).unwrap_or("");
        text.parse().map_err(|_| self.error("expected an integer"))
    }

    fn string(&mut self) -> Result<String, JsonQueryError> {
        self.pos += 1; // opening quote
        let mut out = String::new();
        loop {
            match self.bump() {
                Some(b'"') => return Ok(out),
                Some(b'\\') => match self.bump() {
                    Some(b'"') => out.push('"'),
                    Some(b'\\') => out.push('\\'),
                    Some(other) => {
                        out.push('\\');
                        out.push(other as char);
                    }
                    None => return Err(self.error("unterminated string")),
                },
                Some(c) => out.push(c as char),
                None => return Err(self.error("unterminated string")),
            }
        }
    }
}
