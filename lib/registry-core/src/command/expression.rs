//! Boolean pattern expressions over service paths
//!
//! Terms are path globs (`com.example.*`, `/v1/*`) combined with `!`, `&`,
//! `|` and parentheses. Precedence is `!` over `&` over `|`. Expressions are
//! parsed into an `Expr` tree and evaluated against a path.

use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExpressionError {
    #[error("empty expression")]
    Empty,

    #[error("invalid character '{ch}' at position {position} in '{expression}'")]
    InvalidCharacter {
        ch: char,
        position: usize,
        expression: String,
    },

    #[error("unexpected '{token}' at position {position} in '{expression}'")]
    UnexpectedToken {
        token: String,
        position: usize,
        expression: String,
    },

    #[error("unexpected end of expression '{expression}'")]
    UnexpectedEnd { expression: String },

    #[error("unbalanced parenthesis at position {position} in '{expression}'")]
    UnbalancedParenthesis { position: usize, expression: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Term(String),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

impl Expr {
    pub fn parse(expression: &str) -> Result<Self, ExpressionError> {
        let tokens = tokenize(expression)?;
        if tokens.is_empty() {
            return Err(ExpressionError::Empty);
        }

        let mut parser = Parser {
            tokens: &tokens,
            pos: 0,
            expression,
        };
        let expr = parser.parse_or()?;
        match parser.peek() {
            None => Ok(expr),
            Some((Token::Close, position)) => Err(ExpressionError::UnbalancedParenthesis {
                position: *position,
                expression: expression.to_string(),
            }),
            Some((token, position)) => Err(ExpressionError::UnexpectedToken {
                token: token.to_string(),
                position: *position,
                expression: expression.to_string(),
            }),
        }
    }

    /// Evaluate with caller-supplied term truth values
    pub fn evaluate_with(&self, term: &dyn Fn(&str) -> bool) -> bool {
        match self {
            Expr::Term(t) => term(t),
            Expr::Not(inner) => !inner.evaluate_with(term),
            Expr::And(l, r) => l.evaluate_with(term) && r.evaluate_with(term),
            Expr::Or(l, r) => l.evaluate_with(term) || r.evaluate_with(term),
        }
    }

    pub fn evaluate(&self, path: &str) -> bool {
        self.evaluate_with(&|term: &str| term_matches(term, path))
    }
}

/// Whether `expression` selects `path`. A blank expression selects nothing.
pub fn matches(expression: &str, path: &str) -> Result<bool, ExpressionError> {
    if expression.trim().is_empty() {
        return Ok(false);
    }
    Ok(Expr::parse(expression)?.evaluate(path))
}

/// Exact match, or prefix match up to the first `*`
pub fn term_matches(term: &str, path: &str) -> bool {
    match term.find('*') {
        Some(idx) => path.starts_with(&term[..idx]),
        None => term == path,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Term(String),
    Not,
    And,
    Or,
    Open,
    Close,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Term(t) => f.write_str(t),
            Token::Not => f.write_str("!"),
            Token::And => f.write_str("&"),
            Token::Or => f.write_str("|"),
            Token::Open => f.write_str("("),
            Token::Close => f.write_str(")"),
        }
    }
}

fn is_term_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '$' | '.' | '*' | '_' | '-' | '/' | ':')
}

fn tokenize(expression: &str) -> Result<Vec<(Token, usize)>, ExpressionError> {
    let mut tokens = Vec::new();
    let mut chars = expression.char_indices().peekable();

    while let Some((position, c)) = chars.next() {
        let token = match c {
            c if c.is_whitespace() => continue,
            '!' => Token::Not,
            '&' => Token::And,
            '|' => Token::Or,
            '(' => Token::Open,
            ')' => Token::Close,
            c if is_term_char(c) => {
                let mut term = String::from(c);
                while let Some(&(_, next)) = chars.peek() {
                    if !is_term_char(next) {
                        break;
                    }
                    term.push(next);
                    chars.next();
                }
                Token::Term(term)
            }
            ch => {
                return Err(ExpressionError::InvalidCharacter {
                    ch,
                    position,
                    expression: expression.to_string(),
                })
            }
        };
        tokens.push((token, position));
    }
    Ok(tokens)
}

struct Parser<'a> {
    tokens: &'a [(Token, usize)],
    pos: usize,
    expression: &'a str,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&'a (Token, usize)> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<&'a (Token, usize)> {
        let token = self.tokens.get(self.pos);
        self.pos += 1;
        token
    }

    fn parse_or(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_and()?;
        while matches!(self.peek(), Some((Token::Or, _))) {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_unary()?;
        while matches!(self.peek(), Some((Token::And, _))) {
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ExpressionError> {
        if matches!(self.peek(), Some((Token::Not, _))) {
            self.pos += 1;
            return Ok(Expr::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, ExpressionError> {
        match self.advance() {
            Some((Token::Term(term), _)) => Ok(Expr::Term(term.clone())),
            Some((Token::Open, open)) => {
                let inner = self.parse_or()?;
                match self.advance() {
                    Some((Token::Close, _)) => Ok(inner),
                    _ => Err(ExpressionError::UnbalancedParenthesis {
                        position: *open,
                        expression: self.expression.to_string(),
                    }),
                }
            }
            Some((token, position)) => Err(ExpressionError::UnexpectedToken {
                token: token.to_string(),
                position: *position,
                expression: self.expression.to_string(),
            }),
            None => Err(ExpressionError::UnexpectedEnd {
                expression: self.expression.to_string(),
            }),
        }
    }
}
