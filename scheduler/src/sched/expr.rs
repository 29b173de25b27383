/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Restricted expression language for placement requirements and ranks.
//!
//! Operator-supplied expressions are evaluated against a fixed symbol
//! table only; there is deliberately no way to reach host capabilities
//! from here. Grammar: numbers, quoted strings, booleans, identifiers,
//! arithmetic, comparisons, `in` membership and boolean connectives
//! (both `&&`/`||`/`!` and `and`/`or`/`not`).

use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ExprError {
    #[error("unexpected character '{0}'")]
    UnexpectedChar(char),

    #[error("unexpected end of expression")]
    UnexpectedEnd,

    #[error("unexpected token {0}")]
    UnexpectedToken(String),

    #[error("unknown variable '{0}'")]
    UnknownVariable(String),

    #[error("type mismatch in {0}")]
    TypeMismatch(&'static str),

    #[error("division by zero")]
    DivisionByZero,
}

type Result<T> = std::result::Result<T, ExprError>;

/// Runtime value of an expression or symbol.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Num(f64),
    Str(String),
    List(Vec<Value>),
}

impl Value {
    pub fn truthy(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Num(n) => *n != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(items) => !items.is_empty(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum UnOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Str(String),
    Ident(String),
    Bin(BinOp),
    Not,
    LParen,
    RParen,
}

#[derive(Debug, Clone)]
enum Expr {
    Lit(Value),
    Var(String),
    Unary(UnOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
}

/// Evaluate an expression against the given symbol table.
pub fn evaluate(input: &str, vars: &HashMap<String, Value>) -> Result<Value> {
    let tokens = lex(input)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.expression(0)?;
    if let Some(extra) = parser.peek() {
        return Err(ExprError::UnexpectedToken(format!("{:?}", extra)));
    }
    eval(&expr, vars)
}

fn lex(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\n' | '\r' => {
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
            '+' => {
                chars.next();
                tokens.push(Token::Bin(BinOp::Add));
            }
            '-' => {
                chars.next();
                tokens.push(Token::Bin(BinOp::Sub));
            }
            '*' => {
                chars.next();
                tokens.push(Token::Bin(BinOp::Mul));
            }
            '/' => {
                chars.next();
                tokens.push(Token::Bin(BinOp::Div));
            }
            '=' => {
                chars.next();
                if chars.next_if_eq(&'=').is_none() {
                    return Err(ExprError::UnexpectedChar('='));
                }
                tokens.push(Token::Bin(BinOp::Eq));
            }
            '!' => {
                chars.next();
                if chars.next_if_eq(&'=').is_some() {
                    tokens.push(Token::Bin(BinOp::Ne));
                } else {
                    tokens.push(Token::Not);
                }
            }
            '<' => {
                chars.next();
                if chars.next_if_eq(&'=').is_some() {
                    tokens.push(Token::Bin(BinOp::Le));
                } else {
                    tokens.push(Token::Bin(BinOp::Lt));
                }
            }
            '>' => {
                chars.next();
                if chars.next_if_eq(&'=').is_some() {
                    tokens.push(Token::Bin(BinOp::Ge));
                } else {
                    tokens.push(Token::Bin(BinOp::Gt));
                }
            }
            '&' => {
                chars.next();
                if chars.next_if_eq(&'&').is_none() {
                    return Err(ExprError::UnexpectedChar('&'));
                }
                tokens.push(Token::Bin(BinOp::And));
            }
            '|' => {
                chars.next();
                if chars.next_if_eq(&'|').is_none() {
                    return Err(ExprError::UnexpectedChar('|'));
                }
                tokens.push(Token::Bin(BinOp::Or));
            }
            '\'' | '"' => {
                let quote = c;
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some(c) if c == quote => break,
                        Some(c) => s.push(c),
                        None => return Err(ExprError::UnexpectedEnd),
                    }
                }
                tokens.push(Token::Str(s));
            }
            '0'..='9' | '.' => {
                let mut s = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_digit() || c == '.' {
                        s.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let n: f64 = s
                    .parse()
                    .map_err(|_| ExprError::UnexpectedToken(s.clone()))?;
                tokens.push(Token::Num(n));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut s = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        s.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(match s.as_str() {
                    "in" => Token::Bin(BinOp::In),
                    "and" => Token::Bin(BinOp::And),
                    "or" => Token::Bin(BinOp::Or),
                    "not" => Token::Not,
                    _ => Token::Ident(s),
                });
            }
            c => return Err(ExprError::UnexpectedChar(c)),
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

/// Binding power of prefix operators; higher than any infix.
const UNARY_POWER: u8 = 11;

fn infix_power(op: BinOp) -> (u8, u8) {
    match op {
        BinOp::Or => (1, 2),
        BinOp::And => (3, 4),
        BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge | BinOp::In => (5, 6),
        BinOp::Add | BinOp::Sub => (7, 8),
        BinOp::Mul | BinOp::Div => (9, 10),
    }
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Result<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token.ok_or(ExprError::UnexpectedEnd)
    }

    fn expression(&mut self, min_power: u8) -> Result<Expr> {
        let mut lhs = match self.next()? {
            Token::Num(n) => Expr::Lit(Value::Num(n)),
            Token::Str(s) => Expr::Lit(Value::Str(s)),
            Token::Ident(id) if id == "true" => Expr::Lit(Value::Bool(true)),
            Token::Ident(id) if id == "false" => Expr::Lit(Value::Bool(false)),
            Token::Ident(id) => Expr::Var(id),
            Token::Not => Expr::Unary(UnOp::Not, Box::new(self.expression(UNARY_POWER)?)),
            Token::Bin(BinOp::Sub) => {
                Expr::Unary(UnOp::Neg, Box::new(self.expression(UNARY_POWER)?))
            }
            Token::LParen => {
                let inner = self.expression(0)?;
                match self.next()? {
                    Token::RParen => inner,
                    token => return Err(ExprError::UnexpectedToken(format!("{:?}", token))),
                }
            }
            token => return Err(ExprError::UnexpectedToken(format!("{:?}", token))),
        };

        loop {
            let op = match self.peek() {
                Some(Token::Bin(op)) => *op,
                Some(Token::RParen) | None => break,
                Some(token) => return Err(ExprError::UnexpectedToken(format!("{:?}", token))),
            };
            let (left_power, right_power) = infix_power(op);
            if left_power < min_power {
                break;
            }
            self.pos += 1;
            let rhs = self.expression(right_power)?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }
}

fn eval(expr: &Expr, vars: &HashMap<String, Value>) -> Result<Value> {
    match expr {
        Expr::Lit(value) => Ok(value.clone()),
        Expr::Var(name) => vars
            .get(name)
            .cloned()
            .ok_or_else(|| ExprError::UnknownVariable(name.clone())),
        Expr::Unary(UnOp::Not, inner) => Ok(Value::Bool(!eval(inner, vars)?.truthy())),
        Expr::Unary(UnOp::Neg, inner) => match eval(inner, vars)? {
            Value::Num(n) => Ok(Value::Num(-n)),
            _ => Err(ExprError::TypeMismatch("negation")),
        },
        Expr::Binary(op, lhs, rhs) => eval_binary(*op, lhs, rhs, vars),
    }
}

fn eval_binary(op: BinOp, lhs: &Expr, rhs: &Expr, vars: &HashMap<String, Value>) -> Result<Value> {
    // Boolean connectives short-circuit.
    match op {
        BinOp::And => {
            return Ok(Value::Bool(
                eval(lhs, vars)?.truthy() && eval(rhs, vars)?.truthy(),
            ))
        }
        BinOp::Or => {
            return Ok(Value::Bool(
                eval(lhs, vars)?.truthy() || eval(rhs, vars)?.truthy(),
            ))
        }
        _ => {}
    }

    let left = eval(lhs, vars)?;
    let right = eval(rhs, vars)?;
    match op {
        BinOp::Eq => Ok(Value::Bool(left == right)),
        BinOp::Ne => Ok(Value::Bool(left != right)),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => compare(op, &left, &right),
        BinOp::In => match right {
            Value::List(items) => Ok(Value::Bool(items.contains(&left))),
            _ => Err(ExprError::TypeMismatch("membership")),
        },
        BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div => arithmetic(op, &left, &right),
        BinOp::And | BinOp::Or => unreachable!("handled above"),
    }
}

fn compare(op: BinOp, left: &Value, right: &Value) -> Result<Value> {
    let ordering = match (left, right) {
        (Value::Num(l), Value::Num(r)) => l.partial_cmp(r),
        (Value::Str(l), Value::Str(r)) => Some(l.cmp(r)),
        _ => return Err(ExprError::TypeMismatch("comparison")),
    };
    let Some(ordering) = ordering else {
        return Ok(Value::Bool(false));
    };
    let result = match op {
        BinOp::Lt => ordering.is_lt(),
        BinOp::Le => ordering.is_le(),
        BinOp::Gt => ordering.is_gt(),
        BinOp::Ge => ordering.is_ge(),
        _ => unreachable!(),
    };
    Ok(Value::Bool(result))
}

fn arithmetic(op: BinOp, left: &Value, right: &Value) -> Result<Value> {
    let (Value::Num(l), Value::Num(r)) = (left, right) else {
        return Err(ExprError::TypeMismatch("arithmetic"));
    };
    let result = match op {
        BinOp::Add => l + r,
        BinOp::Sub => l - r,
        BinOp::Mul => l * r,
        BinOp::Div => {
            if *r == 0.0 {
                return Err(ExprError::DivisionByZero);
            }
            l / r
        }
        _ => unreachable!(),
    };
    Ok(Value::Num(result))
}
