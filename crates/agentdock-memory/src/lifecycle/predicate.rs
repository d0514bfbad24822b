//! Sandboxed predicate grammar (spec §4.9).
//!
//! Decay, promotion, and cleanup rules all gate on a small boolean
//! expression language over a record's fields — never `eval`. A parse
//! failure disables the owning rule and logs a warning rather than
//! propagating, since a single malformed rule must not take down the rest
//! of the lifecycle cycle.

use serde_json::Value;

use crate::record::MemoryRecord;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Str(String),
    True,
    False,
    And,
    Or,
    Not,
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
    LParen,
    RParen,
}

#[derive(Debug, thiserror::Error)]
#[error("predicate parse error: {0}")]
pub struct PredicateParseError(pub String);

fn tokenize(src: &str) -> Result<Vec<Token>, PredicateParseError> {
    let chars: Vec<char> = src.chars().collect();
    let mut i = 0;
    let mut tokens = Vec::new();

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '&' if chars.get(i + 1) == Some(&'&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if chars.get(i + 1) == Some(&'|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Neq);
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '=' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Eq);
                i += 2;
            }
            '<' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Lte);
                i += 2;
            }
            '<' => {
                tokens.push(Token::Lt);
                i += 1;
            }
            '>' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Gte);
                i += 2;
            }
            '>' => {
                tokens.push(Token::Gt);
                i += 1;
            }
            '"' | '\'' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                while i < chars.len() && chars[i] != quote {
                    s.push(chars[i]);
                    i += 1;
                }
                if i >= chars.len() {
                    return Err(PredicateParseError("unterminated string literal".into()));
                }
                i += 1; // closing quote
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n = text
                    .parse()
                    .map_err(|_| PredicateParseError(format!("invalid number literal: {text}")))?;
                tokens.push(Token::Number(n));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                tokens.push(match text.as_str() {
                    "true" => Token::True,
                    "false" => Token::False,
                    _ => Token::Ident(text),
                });
            }
            other => {
                return Err(PredicateParseError(format!("unexpected character: {other}")));
            }
        }
    }

    Ok(tokens)
}

#[derive(Debug, Clone, PartialEq)]
enum Literal {
    Number(f64),
    Str(String),
    Bool(bool),
}

#[derive(Debug, Clone)]
enum Expr {
    Field(String),
    Literal(Literal),
    Includes { field: String, needle: String },
    Compare { op: CmpOp, left: Box<Expr>, right: Box<Expr> },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CmpOp {
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn expect(&mut self, expected: &Token) -> Result<(), PredicateParseError> {
        match self.advance() {
            Some(ref t) if t == expected => Ok(()),
            other => Err(PredicateParseError(format!("expected {expected:?}, found {other:?}"))),
        }
    }

    fn parse_expr(&mut self) -> Result<Expr, PredicateParseError> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr, PredicateParseError> {
        let mut left = self.parse_and()?;
        while matches!(self.peek(), Some(Token::Or)) {
            self.advance();
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, PredicateParseError> {
        let mut left = self.parse_unary()?;
        while matches!(self.peek(), Some(Token::And)) {
            self.advance();
            let right = self.parse_unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, PredicateParseError> {
        if matches!(self.peek(), Some(Token::Not)) {
            self.advance();
            return Ok(Expr::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, PredicateParseError> {
        let left = self.parse_primary()?;
        let op = match self.peek() {
            Some(Token::Eq) => Some(CmpOp::Eq),
            Some(Token::Neq) => Some(CmpOp::Neq),
            Some(Token::Lt) => Some(CmpOp::Lt),
            Some(Token::Lte) => Some(CmpOp::Lte),
            Some(Token::Gt) => Some(CmpOp::Gt),
            Some(Token::Gte) => Some(CmpOp::Gte),
            _ => None,
        };
        let Some(op) = op else {
            return Ok(left);
        };
        self.advance();
        let right = self.parse_primary()?;
        Ok(Expr::Compare {
            op,
            left: Box::new(left),
            right: Box::new(right),
        })
    }

    fn parse_primary(&mut self) -> Result<Expr, PredicateParseError> {
        match self.advance() {
            Some(Token::LParen) => {
                let inner = self.parse_expr()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Number(n)) => Ok(Expr::Literal(Literal::Number(n))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Literal::Str(s))),
            Some(Token::True) => Ok(Expr::Literal(Literal::Bool(true))),
            Some(Token::False) => Ok(Expr::Literal(Literal::Bool(false))),
            Some(Token::Ident(name)) => {
                if name.ends_with(".includes") && matches!(self.peek(), Some(Token::LParen)) {
                    self.advance();
                    let field = name.trim_end_matches(".includes").to_string();
                    let needle = match self.advance() {
                        Some(Token::Str(s)) => s,
                        other => {
                            return Err(PredicateParseError(format!(
                                "includes() expects a string literal argument, found {other:?}"
                            )))
                        }
                    };
                    self.expect(&Token::RParen)?;
                    Ok(Expr::Includes { field, needle })
                } else {
                    Ok(Expr::Field(name))
                }
            }
            other => Err(PredicateParseError(format!("unexpected token: {other:?}"))),
        }
    }
}

/// A parsed, evaluable predicate.
#[derive(Debug, Clone)]
pub struct Predicate {
    expr: Expr,
    source: String,
}

impl Predicate {
    pub fn parse(source: &str) -> Result<Self, PredicateParseError> {
        let tokens = tokenize(source)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_expr()?;
        if parser.pos != parser.tokens.len() {
            return Err(PredicateParseError(format!(
                "trailing tokens after expression: {:?}",
                &parser.tokens[parser.pos..]
            )));
        }
        Ok(Self {
            expr,
            source: source.to_string(),
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn evaluate(&self, record: &MemoryRecord) -> bool {
        eval_bool(&self.expr, record)
    }
}

fn field_value(name: &str, record: &MemoryRecord) -> Literal {
    if let Some(key) = name.strip_prefix("metadata.") {
        return match record.metadata.get(key) {
            Some(Value::Number(n)) => Literal::Number(n.as_f64().unwrap_or(0.0)),
            Some(Value::String(s)) => Literal::Str(s.clone()),
            Some(Value::Bool(b)) => Literal::Bool(*b),
            _ => Literal::Str(String::new()),
        };
    }
    match name {
        "type" => Literal::Str(record.memory_type.as_str().to_string()),
        "importance" => Literal::Number(record.importance),
        "resonance" => Literal::Number(record.resonance),
        "accessCount" => Literal::Number(record.access_count as f64),
        "neverDecay" => Literal::Bool(record.never_decay),
        "reinforceable" => Literal::Bool(record.reinforceable),
        _ => Literal::Str(String::new()),
    }
}

fn eval_value(expr: &Expr, record: &MemoryRecord) -> Literal {
    match expr {
        Expr::Field(name) => field_value(name, record),
        Expr::Literal(lit) => lit.clone(),
        other => Literal::Bool(eval_bool(other, record)),
    }
}

fn eval_bool(expr: &Expr, record: &MemoryRecord) -> bool {
    match expr {
        Expr::And(a, b) => eval_bool(a, record) && eval_bool(b, record),
        Expr::Or(a, b) => eval_bool(a, record) || eval_bool(b, record),
        Expr::Not(a) => !eval_bool(a, record),
        Expr::Includes { field, needle } => {
            if field == "keywords" {
                record.keywords.iter().any(|k| k == needle)
            } else {
                false
            }
        }
        Expr::Compare { op, left, right } => {
            let l = eval_value(left, record);
            let r = eval_value(right, record);
            compare(*op, &l, &r)
        }
        Expr::Field(_) | Expr::Literal(_) => matches!(eval_value(expr, record), Literal::Bool(true)),
    }
}

fn compare(op: CmpOp, l: &Literal, r: &Literal) -> bool {
    match (l, r) {
        (Literal::Number(a), Literal::Number(b)) => match op {
            CmpOp::Eq => a == b,
            CmpOp::Neq => a != b,
            CmpOp::Lt => a < b,
            CmpOp::Lte => a <= b,
            CmpOp::Gt => a > b,
            CmpOp::Gte => a >= b,
        },
        (Literal::Str(a), Literal::Str(b)) => match op {
            CmpOp::Eq => a == b,
            CmpOp::Neq => a != b,
            _ => false,
        },
        (Literal::Bool(a), Literal::Bool(b)) => match op {
            CmpOp::Eq => a == b,
            CmpOp::Neq => a != b,
            _ => false,
        },
        _ => false,
    }
}

/// Parse `source`, returning `None` and logging a warning on failure
/// rather than propagating — a single malformed rule must disable itself,
/// not the rest of the lifecycle cycle (spec §4.9).
pub fn parse_or_warn(rule_id: &str, source: &str) -> Option<Predicate> {
    match Predicate::parse(source) {
        Ok(p) => Some(p),
        Err(err) => {
            tracing::warn!(rule_id, error = %err, predicate = source, "disabling rule with unparseable condition");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::MemoryType;

    fn record() -> MemoryRecord {
        let mut r = MemoryRecord::new("u1", "a1", MemoryType::Episodic, "x", 0.6);
        r.resonance = 0.3;
        r.access_count = 12;
        r.keywords = vec!["urgent".into(), "billing".into()];
        r.metadata.insert("priority".to_string(), Value::String("high".into()));
        r
    }

    #[test]
    fn simple_numeric_comparison() {
        let p = Predicate::parse("importance > 0.5").unwrap();
        assert!(p.evaluate(&record()));
        let p2 = Predicate::parse("importance > 0.9").unwrap();
        assert!(!p2.evaluate(&record()));
    }

    #[test]
    fn boolean_composition() {
        let p = Predicate::parse("resonance < 0.5 && accessCount >= 10").unwrap();
        assert!(p.evaluate(&record()));
        let p2 = Predicate::parse("resonance < 0.5 && accessCount >= 100").unwrap();
        assert!(!p2.evaluate(&record()));
    }

    #[test]
    fn negation_and_or() {
        let p = Predicate::parse("!(type == \"semantic\") || importance > 0.9").unwrap();
        assert!(p.evaluate(&record()));
    }

    #[test]
    fn keywords_includes() {
        let p = Predicate::parse("keywords.includes(\"urgent\")").unwrap();
        assert!(p.evaluate(&record()));
        let p2 = Predicate::parse("keywords.includes(\"missing\")").unwrap();
        assert!(!p2.evaluate(&record()));
    }

    #[test]
    fn metadata_field_access() {
        let p = Predicate::parse("metadata.priority == \"high\"").unwrap();
        assert!(p.evaluate(&record()));
    }

    #[test]
    fn malformed_predicate_fails_to_parse_without_panicking() {
        assert!(Predicate::parse("importance >").is_err());
        assert!(Predicate::parse("importance > 0.5 &&").is_err());
        assert!(parse_or_warn("rule-1", "not valid && &&").is_none());
    }
}
