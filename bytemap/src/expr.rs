//! Arithmetic length expressions.
//!
//! Grammar documents may compute a byte count from already-parsed sibling
//! values, e.g. `"nt_len_1 - 4"`. Supported: non-negative decimal literals,
//! identifiers, `+ - * /` with standard precedence, parentheses. All
//! arithmetic is signed 64-bit; `/` truncates.

#[derive(Clone, PartialEq, Eq, Debug, thiserror::Error)]
pub enum ExprError {
    #[error("invalid character in expression: {0:?}")]
    InvalidChar(char),
    #[error("unknown identifier: {0}")]
    UnknownIdent(String),
    #[error("unbalanced parentheses")]
    UnbalancedParens,
    #[error("malformed expression")]
    Malformed,
    #[error("division by zero")]
    DivisionByZero,
    #[error("arithmetic overflow")]
    Overflow,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Op {
    Add,
    Sub,
    Mul,
    Div,
}

impl Op {
    fn precedence(self) -> u8 {
        match self {
            Op::Add | Op::Sub => 1,
            Op::Mul | Op::Div => 2,
        }
    }

    fn apply(self, a: i64, b: i64) -> Result<i64, ExprError> {
        match self {
            Op::Add => a.checked_add(b).ok_or(ExprError::Overflow),
            Op::Sub => a.checked_sub(b).ok_or(ExprError::Overflow),
            Op::Mul => a.checked_mul(b).ok_or(ExprError::Overflow),
            Op::Div => {
                if b == 0 {
                    Err(ExprError::DivisionByZero)
                } else {
                    a.checked_div(b).ok_or(ExprError::Overflow)
                }
            }
        }
    }
}

#[derive(Clone, PartialEq, Debug)]
enum Token {
    Num(i64),
    Ident(String),
    Op(Op),
    LParen,
    RParen,
}

#[derive(Clone, PartialEq, Debug)]
enum Rpn {
    Num(i64),
    Ident(String),
    Op(Op),
}

/// A parsed, validated expression. Construction checks shape; identifiers are
/// resolved at evaluation time against the caller's scope.
#[derive(Clone, PartialEq, Debug)]
pub struct Expr {
    source: String,
    rpn: Vec<Rpn>,
}

impl Expr {
    pub fn parse(source: &str) -> Result<Self, ExprError> {
        let tokens = tokenize(source)?;
        let rpn = to_rpn(tokens)?;
        check_shape(&rpn)?;
        Ok(Self {
            source: source.to_owned(),
            rpn,
        })
    }

    /// The text the expression was parsed from.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Identifiers in evaluation order.
    pub fn idents(&self) -> impl Iterator<Item = &str> {
        self.rpn.iter().filter_map(|t| match t {
            Rpn::Ident(name) => Some(name.as_str()),
            _ => None,
        })
    }

    /// Evaluate against a name lookup. Fails on unknown names, division by
    /// zero, or overflow.
    pub fn eval(&self, lookup: impl Fn(&str) -> Option<i64>) -> Result<i64, ExprError> {
        let mut stack: Vec<i64> = Vec::with_capacity(4);
        for item in &self.rpn {
            match item {
                Rpn::Num(n) => stack.push(*n),
                Rpn::Ident(name) => {
                    let v = lookup(name).ok_or_else(|| ExprError::UnknownIdent(name.clone()))?;
                    stack.push(v);
                }
                Rpn::Op(op) => {
                    let b = stack.pop().ok_or(ExprError::Malformed)?;
                    let a = stack.pop().ok_or(ExprError::Malformed)?;
                    stack.push(op.apply(a, b)?);
                }
            }
        }
        if stack.len() == 1 {
            Ok(stack[0])
        } else {
            Err(ExprError::Malformed)
        }
    }
}

fn tokenize(source: &str) -> Result<Vec<Token>, ExprError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let flush = |current: &mut String, tokens: &mut Vec<Token>| {
        if current.is_empty() {
            return;
        }
        let word = std::mem::take(current);
        if word.bytes().all(|b| b.is_ascii_digit()) {
            // Literal; overflow of a bare literal is a malformed expression.
            match word.parse::<i64>() {
                Ok(n) => tokens.push(Token::Num(n)),
                Err(_) => tokens.push(Token::Ident(word)),
            }
        } else {
            tokens.push(Token::Ident(word));
        }
    };
    for c in source.chars() {
        match c {
            '+' => {
                flush(&mut current, &mut tokens);
                tokens.push(Token::Op(Op::Add));
            }
            '-' => {
                flush(&mut current, &mut tokens);
                tokens.push(Token::Op(Op::Sub));
            }
            '*' => {
                flush(&mut current, &mut tokens);
                tokens.push(Token::Op(Op::Mul));
            }
            '/' => {
                flush(&mut current, &mut tokens);
                tokens.push(Token::Op(Op::Div));
            }
            '(' => {
                flush(&mut current, &mut tokens);
                tokens.push(Token::LParen);
            }
            ')' => {
                flush(&mut current, &mut tokens);
                tokens.push(Token::RParen);
            }
            c if c.is_ascii_whitespace() => flush(&mut current, &mut tokens),
            c if c.is_ascii_alphanumeric() || c == '_' => current.push(c),
            c => return Err(ExprError::InvalidChar(c)),
        }
    }
    flush(&mut current, &mut tokens);
    Ok(tokens)
}

/// Shunting-yard conversion to reverse Polish notation.
fn to_rpn(tokens: Vec<Token>) -> Result<Vec<Rpn>, ExprError> {
    let mut output = Vec::with_capacity(tokens.len());
    let mut operators: Vec<Token> = Vec::new();
    for token in tokens {
        match token {
            Token::Num(n) => output.push(Rpn::Num(n)),
            Token::Ident(name) => output.push(Rpn::Ident(name)),
            Token::Op(op) => {
                while let Some(Token::Op(top)) = operators.last() {
                    if top.precedence() >= op.precedence() {
                        output.push(Rpn::Op(*top));
                        operators.pop();
                    } else {
                        break;
                    }
                }
                operators.push(Token::Op(op));
            }
            Token::LParen => operators.push(Token::LParen),
            Token::RParen => loop {
                match operators.pop() {
                    Some(Token::Op(op)) => output.push(Rpn::Op(op)),
                    Some(Token::LParen) => break,
                    _ => return Err(ExprError::UnbalancedParens),
                }
            },
        }
    }
    while let Some(token) = operators.pop() {
        match token {
            Token::Op(op) => output.push(Rpn::Op(op)),
            _ => return Err(ExprError::UnbalancedParens),
        }
    }
    Ok(output)
}

/// Symbolic evaluation: verify operand/operator balance without values.
fn check_shape(rpn: &[Rpn]) -> Result<(), ExprError> {
    let mut depth = 0usize;
    for item in rpn {
        match item {
            Rpn::Num(_) | Rpn::Ident(_) => depth += 1,
            Rpn::Op(_) => {
                if depth < 2 {
                    return Err(ExprError::Malformed);
                }
                depth -= 1;
            }
        }
    }
    if depth == 1 {
        Ok(())
    } else {
        Err(ExprError::Malformed)
    }
}
