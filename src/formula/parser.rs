//! Textual formula syntax.
//!
//! Supported syntax:
//! - Comparisons: `==`, `!=`, `>`, `<`, `>=`, `<=`, membership `x in list`
//! - Boolean operators: `&&`, `||`, `!`
//! - Arithmetic: `+`, `-`, `*`, `/` and unary minus
//! - Attributes: `user.roles`, `entity.branch`, `env.today`, `computed.ratio`,
//!   `current.salary`, `outer.theme`
//! - Literals: integers, floats, `"strings"`, `true`, `false`, `null`,
//!   `date("2023-05-25")`, lists `["a", "b"]`
//! - Functions: `size(x)`, `count(...)`, `sum(...)`, `avg(...)`, `min(...)`,
//!   `max(...)`, `divergence(...)` taking `(operand [by group] [where filter])`,
//!   and `exists(filter)`
//! - Parentheses for grouping

use crate::formula::ast::{AggregateFn, BinaryOp, Formula, Literal, Scope, UnaryOp};
use crate::formula::errors::FormulaError;
use chrono::NaiveDate;

const MAX_DEPTH: usize = 64;

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),
    True,
    False,
    Null,
    Dot,
    Comma,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Eq,    // ==
    Ne,    // !=
    Gt,    // >
    Lt,    // <
    Ge,    // >=
    Le,    // <=
    And,   // &&
    Or,    // ||
    Not,   // !
    In,    // in
    By,    // by
    Where, // where
    Plus,
    Minus,
    Star,
    Slash,
}

fn tokenize(input: &str) -> Result<Vec<Token>, FormulaError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let next = chars.get(i + 1).copied();
        match chars[i] {
            ' ' | '\t' | '\n' | '\r' => {
                i += 1;
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '=' if next == Some('=') => {
                tokens.push(Token::Eq);
                i += 2;
            }
            '!' if next == Some('=') => {
                tokens.push(Token::Ne);
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '>' if next == Some('=') => {
                tokens.push(Token::Ge);
                i += 2;
            }
            '>' => {
                tokens.push(Token::Gt);
                i += 1;
            }
            '<' if next == Some('=') => {
                tokens.push(Token::Le);
                i += 2;
            }
            '<' => {
                tokens.push(Token::Lt);
                i += 1;
            }
            '&' if next == Some('&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if next == Some('|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '"' => {
                i += 1;
                let mut s = String::new();
                loop {
                    match chars.get(i) {
                        None => {
                            return Err(FormulaError::InvalidExpression(
                                "unterminated string literal".into(),
                            ));
                        }
                        Some('"') => break,
                        Some('\\') => {
                            let escaped = chars.get(i + 1).ok_or_else(|| {
                                FormulaError::InvalidExpression(
                                    "unterminated string literal".into(),
                                )
                            })?;
                            s.push(match escaped {
                                'n' => '\n',
                                't' => '\t',
                                other => *other,
                            });
                            i += 2;
                        }
                        Some(c) => {
                            s.push(*c);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(s));
                i += 1; // skip closing quote
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let num_str: String = chars[start..i].iter().collect();
                if num_str.contains('.') {
                    let f: f64 = num_str.parse().map_err(|_| {
                        FormulaError::InvalidExpression(format!("invalid float `{num_str}`"))
                    })?;
                    tokens.push(Token::Float(f));
                } else {
                    let n: i64 = num_str.parse().map_err(|_| {
                        FormulaError::InvalidExpression(format!("invalid integer `{num_str}`"))
                    })?;
                    tokens.push(Token::Int(n));
                }
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                match word.as_str() {
                    "true" => tokens.push(Token::True),
                    "false" => tokens.push(Token::False),
                    "null" => tokens.push(Token::Null),
                    "in" => tokens.push(Token::In),
                    "by" => tokens.push(Token::By),
                    "where" => tokens.push(Token::Where),
                    _ => tokens.push(Token::Ident(word)),
                }
            }
            c => {
                return Err(FormulaError::InvalidExpression(format!(
                    "unexpected character `{c}`"
                )));
            }
        }
    }
    Ok(tokens)
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            pos: 0,
            depth: 0,
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset)
    }

    fn advance(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn expect(&mut self, expected: Token, what: &str) -> Result<(), FormulaError> {
        if self.advance() != Some(expected) {
            return Err(FormulaError::InvalidExpression(format!("expected {what}")));
        }
        Ok(())
    }

    fn expect_rparen(&mut self) -> Result<(), FormulaError> {
        self.expect(Token::RParen, "closing parenthesis `)`")
    }

    /// Entry: parse_or, with a nesting guard
    fn parse_expr(&mut self) -> Result<Formula, FormulaError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(FormulaError::InvalidExpression(
                "expression nests too deeply".into(),
            ));
        }
        let expr = self.parse_or();
        self.depth -= 1;
        expr
    }

    /// or_expr = and_expr ("||" and_expr)*
    fn parse_or(&mut self) -> Result<Formula, FormulaError> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.advance();
            let right = self.parse_and()?;
            left = Formula::binary(BinaryOp::Or, left, right);
        }
        Ok(left)
    }

    /// and_expr = comparison ("&&" comparison)*
    fn parse_and(&mut self) -> Result<Formula, FormulaError> {
        let mut left = self.parse_comparison()?;
        while self.peek() == Some(&Token::And) {
            self.advance();
            let right = self.parse_comparison()?;
            left = Formula::binary(BinaryOp::And, left, right);
        }
        Ok(left)
    }

    /// comparison = additive (("==" | "!=" | ">" | "<" | ">=" | "<=" | "in") additive)?
    fn parse_comparison(&mut self) -> Result<Formula, FormulaError> {
        let left = self.parse_additive()?;
        let op = match self.peek() {
            Some(Token::Eq) => BinaryOp::Eq,
            Some(Token::Ne) => BinaryOp::Ne,
            Some(Token::Gt) => BinaryOp::Gt,
            Some(Token::Lt) => BinaryOp::Lt,
            Some(Token::Ge) => BinaryOp::Ge,
            Some(Token::Le) => BinaryOp::Le,
            Some(Token::In) => BinaryOp::In,
            _ => return Ok(left),
        };
        self.advance();
        let right = self.parse_additive()?;
        Ok(Formula::binary(op, left, right))
    }

    /// additive = multiplicative (("+" | "-") multiplicative)*
    fn parse_additive(&mut self) -> Result<Formula, FormulaError> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_multiplicative()?;
            left = Formula::binary(op, left, right);
        }
    }

    /// multiplicative = unary (("*" | "/") unary)*
    fn parse_multiplicative(&mut self) -> Result<Formula, FormulaError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_unary()?;
            left = Formula::binary(op, left, right);
        }
    }

    /// unary = "!" unary | "-" unary | primary
    fn parse_unary(&mut self) -> Result<Formula, FormulaError> {
        match self.peek() {
            Some(Token::Not) => {
                self.advance();
                let expr = self.parse_nested_unary()?;
                Ok(Formula::unary(UnaryOp::Not, expr))
            }
            Some(Token::Minus) => {
                self.advance();
                match self.peek().cloned() {
                    Some(Token::Int(n)) => {
                        self.advance();
                        Ok(Formula::literal(-n))
                    }
                    Some(Token::Float(f)) => {
                        self.advance();
                        Ok(Formula::literal(-f))
                    }
                    _ => {
                        let expr = self.parse_nested_unary()?;
                        Ok(Formula::unary(UnaryOp::Neg, expr))
                    }
                }
            }
            _ => self.parse_primary(),
        }
    }

    fn parse_nested_unary(&mut self) -> Result<Formula, FormulaError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(FormulaError::InvalidExpression(
                "expression nests too deeply".into(),
            ));
        }
        let expr = self.parse_unary();
        self.depth -= 1;
        expr
    }

    /// primary = literal | list | call | attribute | "(" expr ")"
    fn parse_primary(&mut self) -> Result<Formula, FormulaError> {
        match self.peek().cloned() {
            Some(Token::LParen) => {
                self.advance();
                let expr = self.parse_expr()?;
                self.expect_rparen()?;
                Ok(expr)
            }
            Some(Token::Ident(name)) if self.peek_at(1) == Some(&Token::LParen) => {
                self.advance();
                self.advance();
                self.parse_call(&name)
            }
            Some(Token::Ident(name)) => {
                self.advance();
                let scope = Scope::from_keyword(&name).ok_or_else(|| {
                    FormulaError::InvalidExpression(format!(
                        "unknown scope `{name}` (expected user, entity, env, computed, current or outer)"
                    ))
                })?;
                let mut path = Vec::new();
                while self.peek() == Some(&Token::Dot) {
                    self.advance();
                    match self.advance() {
                        Some(Token::Ident(seg)) => path.push(seg),
                        _ => {
                            return Err(FormulaError::InvalidExpression(
                                "expected identifier after `.`".into(),
                            ));
                        }
                    }
                }
                if path.is_empty() {
                    return Err(FormulaError::InvalidExpression(format!(
                        "attribute reference `{name}` needs a field (e.g. `{name}.id`)"
                    )));
                }
                Ok(Formula::Attribute { scope, path })
            }
            _ => Ok(Formula::literal(self.parse_literal()?)),
        }
    }

    fn parse_literal(&mut self) -> Result<Literal, FormulaError> {
        match self.advance() {
            Some(Token::Int(n)) => Ok(Literal::Int(n)),
            Some(Token::Float(f)) => Ok(Literal::Float(f)),
            Some(Token::Str(s)) => Ok(Literal::String(s)),
            Some(Token::True) => Ok(Literal::Bool(true)),
            Some(Token::False) => Ok(Literal::Bool(false)),
            Some(Token::Null) => Ok(Literal::Null),
            Some(Token::Minus) => match self.advance() {
                Some(Token::Int(n)) => Ok(Literal::Int(-n)),
                Some(Token::Float(f)) => Ok(Literal::Float(-f)),
                other => Err(FormulaError::InvalidExpression(format!(
                    "expected a number after `-`, got: {other:?}"
                ))),
            },
            Some(Token::Ident(name)) if name == "date" => {
                self.expect(Token::LParen, "`(` after `date`")?;
                let date = self.parse_date()?;
                self.expect_rparen()?;
                Ok(Literal::Date(date))
            }
            Some(Token::LBracket) => {
                let mut items = Vec::new();
                if self.peek() == Some(&Token::RBracket) {
                    self.advance();
                    return Ok(Literal::List(items));
                }
                loop {
                    items.push(self.parse_literal()?);
                    match self.advance() {
                        Some(Token::Comma) => continue,
                        Some(Token::RBracket) => break,
                        _ => {
                            return Err(FormulaError::InvalidExpression(
                                "expected `,` or `]` in list literal".into(),
                            ));
                        }
                    }
                }
                Ok(Literal::List(items))
            }
            other => Err(FormulaError::InvalidExpression(format!(
                "unexpected token: {other:?}"
            ))),
        }
    }

    fn parse_date(&mut self) -> Result<NaiveDate, FormulaError> {
        match self.advance() {
            Some(Token::Str(s)) => NaiveDate::parse_from_str(&s, "%Y-%m-%d").map_err(|_| {
                FormulaError::InvalidExpression(format!("invalid date `{s}` (expected YYYY-MM-DD)"))
            }),
            _ => Err(FormulaError::InvalidExpression(
                "date(...) takes a string argument".into(),
            )),
        }
    }

    /// call = name "(" args ")"; the opening parenthesis is already consumed
    fn parse_call(&mut self, name: &str) -> Result<Formula, FormulaError> {
        if name == "date" {
            let date = self.parse_date()?;
            self.expect_rparen()?;
            return Ok(Formula::literal(date));
        }
        if name == "size" {
            let operand = self.parse_expr()?;
            self.expect_rparen()?;
            return Ok(Formula::unary(UnaryOp::Size, operand));
        }
        let function = AggregateFn::from_name(name)
            .ok_or_else(|| FormulaError::InvalidExpression(format!("unknown function `{name}`")))?;

        let mut over = None;
        let mut group_by = None;
        let mut filter = None;
        if !matches!(
            self.peek(),
            Some(Token::RParen) | Some(Token::By) | Some(Token::Where)
        ) {
            let expr = self.parse_expr()?;
            if function == AggregateFn::Exists {
                filter = Some(expr);
            } else {
                over = Some(expr);
            }
        }
        if self.peek() == Some(&Token::By) {
            self.advance();
            group_by = Some(self.parse_expr()?);
        }
        if self.peek() == Some(&Token::Where) {
            self.advance();
            if filter.is_some() {
                return Err(FormulaError::InvalidExpression(
                    "`exists` takes a single condition".into(),
                ));
            }
            filter = Some(self.parse_expr()?);
        }
        self.expect_rparen()?;

        if function.needs_operand() && over.is_none() {
            return Err(FormulaError::InvalidExpression(format!(
                "`{name}` needs an operand (e.g. `{name}(entity.salary)`)"
            )));
        }
        Ok(Formula::aggregate(function, over, group_by, filter))
    }
}

/// Parse a formula expression string into a tree.
pub fn parse_formula(input: &str) -> Result<Formula, FormulaError> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(FormulaError::InvalidExpression("empty expression".into()));
    }
    let mut parser = Parser::new(tokens);
    let expr = parser.parse_expr()?;
    if parser.pos < parser.tokens.len() {
        return Err(FormulaError::InvalidExpression(format!(
            "unexpected trailing token: {:?}",
            parser.tokens[parser.pos]
        )));
    }
    Ok(expr)
}
