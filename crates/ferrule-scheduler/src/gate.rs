//! Per-job conditions.
//!
//! A condition is a small boolean expression over the run context:
//!
//! ```text
//! startsWith(ref, 'refs/tags/v') && event != 'pull_request'
//! ```
//!
//! Supported are `||`, `&&`, `!`, parentheses, `==`, `!=`, the functions
//! `startsWith`, `endsWith` and `contains`, quoted string literals,
//! `true`/`false` and the identifiers `ref`, `ref_name` and `event`. The
//! whole expression may be wrapped in `${{ }}`. Conditions are parsed once,
//! when the job graph is built; evaluation cannot fail.

use crate::triggers::TriggerEvent;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConditionError {
    #[error("empty condition")]
    Empty,

    #[error("unexpected character `{ch}` at offset {offset}")]
    UnexpectedChar { ch: char, offset: usize },

    #[error("unterminated string literal starting at offset {0}")]
    UnterminatedString(usize),

    #[error("expected {expected}, found {found}")]
    UnexpectedToken { expected: String, found: String },

    #[error("unknown identifier `{0}`")]
    UnknownIdentifier(String),

    #[error("unknown function `{0}`")]
    UnknownFunction(String),

    #[error("function `{function}` takes {expected} arguments, got {found}")]
    Arity {
        function: String,
        expected: usize,
        found: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Ref,
    RefName,
    Event,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Function {
    StartsWith,
    EndsWith,
    Contains,
}

impl Function {
    fn name(&self) -> &'static str {
        match self {
            Function::StartsWith => "startsWith",
            Function::EndsWith => "endsWith",
            Function::Contains => "contains",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Str(String),
    Bool(bool),
    Field(Field),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Eq(Box<Expr>, Box<Expr>),
    Ne(Box<Expr>, Box<Expr>),
    Call(Function, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
enum Value {
    Str(String),
    Bool(bool),
}

impl Value {
    fn truthy(&self) -> bool {
        match self {
            Value::Str(s) => !s.is_empty(),
            Value::Bool(b) => *b,
        }
    }

    fn into_string(self) -> String {
        match self {
            Value::Str(s) => s,
            Value::Bool(b) => b.to_string(),
        }
    }
}

impl Expr {
    fn eval(&self, event: &TriggerEvent) -> Value {
        match self {
            Expr::Str(s) => Value::Str(s.clone()),
            Expr::Bool(b) => Value::Bool(*b),
            Expr::Field(Field::Ref) => Value::Str(event.git_ref.clone()),
            Expr::Field(Field::RefName) => Value::Str(event.ref_name().to_string()),
            Expr::Field(Field::Event) => Value::Str(event.kind.as_str().to_string()),
            Expr::Not(inner) => Value::Bool(!inner.eval(event).truthy()),
            Expr::And(lhs, rhs) => Value::Bool(lhs.eval(event).truthy() && rhs.eval(event).truthy()),
            Expr::Or(lhs, rhs) => Value::Bool(lhs.eval(event).truthy() || rhs.eval(event).truthy()),
            Expr::Eq(lhs, rhs) => Value::Bool(values_equal(lhs.eval(event), rhs.eval(event))),
            Expr::Ne(lhs, rhs) => Value::Bool(!values_equal(lhs.eval(event), rhs.eval(event))),
            Expr::Call(function, haystack, needle) => {
                let haystack = haystack.eval(event).into_string();
                let needle = needle.eval(event).into_string();
                Value::Bool(match function {
                    Function::StartsWith => haystack.starts_with(&needle),
                    Function::EndsWith => haystack.ends_with(&needle),
                    Function::Contains => haystack.contains(&needle),
                })
            }
        }
    }
}

fn values_equal(lhs: Value, rhs: Value) -> bool {
    match (lhs, rhs) {
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (a, b) => a.into_string() == b.into_string(),
    }
}

/// A parsed job condition.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    source: String,
    expr: Expr,
}

impl Condition {
    pub fn parse(source: &str) -> Result<Self, ConditionError> {
        let body = strip_wrapper(source.trim());
        let tokens = tokenize(body)?;
        if tokens.is_empty() {
            return Err(ConditionError::Empty);
        }

        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_or()?;
        if let Some(token) = parser.peek() {
            return Err(ConditionError::UnexpectedToken {
                expected: "end of condition".to_string(),
                found: token.describe(),
            });
        }

        Ok(Self {
            source: source.trim().to_string(),
            expr,
        })
    }

    /// The condition as written in the definition.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn evaluate(&self, event: &TriggerEvent) -> bool {
        self.expr.eval(event).truthy()
    }
}

impl FromStr for Condition {
    type Err = ConditionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Decides whether a job instance runs at all.
pub struct ConditionalGate;

impl ConditionalGate {
    pub fn new() -> Self {
        Self
    }

    /// A job without a condition always passes.
    pub fn evaluate(&self, condition: Option<&Condition>, event: &TriggerEvent) -> bool {
        condition.is_none_or(|c| c.evaluate(event))
    }
}

impl Default for ConditionalGate {
    fn default() -> Self {
        Self::new()
    }
}

fn strip_wrapper(source: &str) -> &str {
    source
        .strip_prefix("${{")
        .and_then(|rest| rest.strip_suffix("}}"))
        .map(str::trim)
        .unwrap_or(source)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    LParen,
    RParen,
    Comma,
    Not,
    And,
    Or,
    EqEq,
    NotEq,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Ident(name) => format!("`{}`", name),
            Token::Str(s) => format!("'{}'", s),
            Token::LParen => "`(`".to_string(),
            Token::RParen => "`)`".to_string(),
            Token::Comma => "`,`".to_string(),
            Token::Not => "`!`".to_string(),
            Token::And => "`&&`".to_string(),
            Token::Or => "`||`".to_string(),
            Token::EqEq => "`==`".to_string(),
            Token::NotEq => "`!=`".to_string(),
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, ConditionError> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();

    while let Some((offset, ch)) = chars.next() {
        let token = match ch {
            c if c.is_whitespace() => continue,
            '(' => Token::LParen,
            ')' => Token::RParen,
            ',' => Token::Comma,
            '!' if chars.next_if(|&(_, c)| c == '=').is_some() => Token::NotEq,
            '!' => Token::Not,
            '=' if chars.next_if(|&(_, c)| c == '=').is_some() => Token::EqEq,
            '&' if chars.next_if(|&(_, c)| c == '&').is_some() => Token::And,
            '|' if chars.next_if(|&(_, c)| c == '|').is_some() => Token::Or,
            '\'' | '"' => {
                let quote = ch;
                let mut literal = String::new();
                let mut closed = false;
                while let Some((_, c)) = chars.next() {
                    if c == quote {
                        // A doubled quote is an escaped quote.
                        if chars.next_if(|&(_, n)| n == quote).is_some() {
                            literal.push(quote);
                            continue;
                        }
                        closed = true;
                        break;
                    }
                    literal.push(c);
                }
                if !closed {
                    return Err(ConditionError::UnterminatedString(offset));
                }
                Token::Str(literal)
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut ident = String::from(c);
                while let Some((_, n)) =
                    chars.next_if(|&(_, n)| n.is_ascii_alphanumeric() || n == '_' || n == '.')
                {
                    ident.push(n);
                }
                Token::Ident(ident)
            }
            c => return Err(ConditionError::UnexpectedChar { ch: c, offset }),
        };
        tokens.push(token);
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

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: Token) -> Result<(), ConditionError> {
        match self.next() {
            Some(found) if found == token => Ok(()),
            Some(found) => Err(ConditionError::UnexpectedToken {
                expected: token.describe(),
                found: found.describe(),
            }),
            None => Err(ConditionError::UnexpectedToken {
                expected: token.describe(),
                found: "end of condition".to_string(),
            }),
        }
    }

    fn parse_or(&mut self) -> Result<Expr, ConditionError> {
        let mut lhs = self.parse_and()?;
        while self.eat(&Token::Or) {
            let rhs = self.parse_and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, ConditionError> {
        let mut lhs = self.parse_unary()?;
        while self.eat(&Token::And) {
            let rhs = self.parse_unary()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, ConditionError> {
        if self.eat(&Token::Not) {
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, ConditionError> {
        let lhs = self.parse_primary()?;
        if self.eat(&Token::EqEq) {
            let rhs = self.parse_primary()?;
            return Ok(Expr::Eq(Box::new(lhs), Box::new(rhs)));
        }
        if self.eat(&Token::NotEq) {
            let rhs = self.parse_primary()?;
            return Ok(Expr::Ne(Box::new(lhs), Box::new(rhs)));
        }
        Ok(lhs)
    }

    fn parse_primary(&mut self) -> Result<Expr, ConditionError> {
        match self.next() {
            Some(Token::Str(s)) => Ok(Expr::Str(s)),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Ident(name)) => {
                if self.peek() == Some(&Token::LParen) {
                    return self.parse_call(name);
                }
                match name.as_str() {
                    "true" => Ok(Expr::Bool(true)),
                    "false" => Ok(Expr::Bool(false)),
                    "ref" | "github.ref" => Ok(Expr::Field(Field::Ref)),
                    "ref_name" | "github.ref_name" => Ok(Expr::Field(Field::RefName)),
                    "event" | "github.event_name" => Ok(Expr::Field(Field::Event)),
                    _ => Err(ConditionError::UnknownIdentifier(name)),
                }
            }
            Some(token) => Err(ConditionError::UnexpectedToken {
                expected: "a value".to_string(),
                found: token.describe(),
            }),
            None => Err(ConditionError::UnexpectedToken {
                expected: "a value".to_string(),
                found: "end of condition".to_string(),
            }),
        }
    }

    fn parse_call(&mut self, name: String) -> Result<Expr, ConditionError> {
        let function = match name.as_str() {
            "startsWith" => Function::StartsWith,
            "endsWith" => Function::EndsWith,
            "contains" => Function::Contains,
            _ => return Err(ConditionError::UnknownFunction(name)),
        };
        self.expect(Token::LParen)?;

        let mut args = Vec::new();
        if !self.eat(&Token::RParen) {
            loop {
                args.push(self.parse_or()?);
                if self.eat(&Token::Comma) {
                    continue;
                }
                self.expect(Token::RParen)?;
                break;
            }
        }

        let found = args.len();
        let mut args = args.into_iter();
        match (args.next(), args.next(), found) {
            (Some(haystack), Some(needle), 2) => {
                Ok(Expr::Call(function, Box::new(haystack), Box::new(needle)))
            }
            _ => Err(ConditionError::Arity {
                function: function.name().to_string(),
                expected: 2,
                found,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(condition: &str, event: &TriggerEvent) -> bool {
        Condition::parse(condition).unwrap().evaluate(event)
    }

    #[test]
    fn test_publish_gate_prefix() {
        let gate = "startsWith(ref, 'refs/tags/v0')";
        assert!(eval(gate, &TriggerEvent::push("refs/tags/v0.3.1")));
        assert!(!eval(gate, &TriggerEvent::push("refs/heads/main")));
        assert!(!eval(gate, &TriggerEvent::push("refs/tags/v1.0.0")));
    }

    #[test]
    fn test_wrapped_expression() {
        let event = TriggerEvent::push("refs/heads/main");
        assert!(eval("${{ ref == 'refs/heads/main' }}", &event));
        assert!(eval("${{ref_name == \"main\"}}", &event));
    }

    #[test]
    fn test_operators_and_precedence() {
        let pr = TriggerEvent::pull_request("refs/heads/feature");
        assert!(eval("event == 'pull_request' || false && false", &pr));
        assert!(!eval("(event == 'pull_request' || false) && false", &pr));
        assert!(eval("!startsWith(ref, 'refs/tags/')", &pr));
        assert!(eval("event != 'push' && contains(ref_name, 'feat')", &pr));
        assert!(eval("endsWith(ref, 'ture')", &pr));
        assert!(!eval("!true", &pr));
    }

    #[test]
    fn test_escaped_quote() {
        let event = TriggerEvent::push("refs/heads/it's");
        assert!(eval("ref_name == 'it''s'", &event));
    }

    #[test]
    fn test_gate_without_condition_passes() {
        let gate = ConditionalGate::new();
        assert!(gate.evaluate(None, &TriggerEvent::push("refs/heads/main")));
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(Condition::parse("  "), Err(ConditionError::Empty));
        assert_eq!(
            Condition::parse("branch == 'main'"),
            Err(ConditionError::UnknownIdentifier("branch".to_string()))
        );
        assert_eq!(
            Condition::parse("matches(ref, 'x')"),
            Err(ConditionError::UnknownFunction("matches".to_string()))
        );
        assert!(matches!(
            Condition::parse("startsWith(ref)"),
            Err(ConditionError::Arity { found: 1, .. })
        ));
        assert!(matches!(
            Condition::parse("ref == 'main"),
            Err(ConditionError::UnterminatedString(7))
        ));
        assert!(matches!(
            Condition::parse("ref = 'main'"),
            Err(ConditionError::UnexpectedChar { ch: '=', .. })
        ));
        assert!(matches!(
            Condition::parse("(ref == 'main'"),
            Err(ConditionError::UnexpectedToken { .. })
        ));
        assert!(matches!(
            Condition::parse("ref 'main'"),
            Err(ConditionError::UnexpectedToken { .. })
        ));
    }

    #[test]
    fn test_source_is_kept() {
        let condition = Condition::parse(" startsWith(ref, 'refs/tags/v0') ").unwrap();
        assert_eq!(condition.source(), "startsWith(ref, 'refs/tags/v0')");
        assert_eq!(condition.to_string(), condition.source());
    }
}
