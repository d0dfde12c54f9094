//! AST and recursive-descent parser for the stream-expression language.

use super::lexer::{tokenize, Spanned, Token};
use super::ExprError;

/// Binary comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Contains,
    Matches,
    In,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Str(String),
    Num(f64),
    Bool(bool),
    /// Literal list of strings, for `in [..]` membership tests.
    List(Vec<String>),
    /// Dotted field path or well-known bare name.
    Path(String),
    /// `count(expr)` style call.
    Call { name: String, arg: Box<Expr> },
    Cmp { op: CmpOp, lhs: Box<Expr>, rhs: Box<Expr> },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
}

impl Expr {
    /// Parse an expression source string.
    pub fn parse(source: &str) -> Result<Expr, ExprError> {
        let tokens = tokenize(source)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            source_len: source.len(),
        };
        let expr = parser.or_expr()?;
        if let Some(extra) = parser.peek() {
            return Err(ExprError::parse(extra.position, "unexpected trailing input"));
        }
        Ok(expr)
    }
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    source_len: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Spanned> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Spanned> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn position(&self) -> usize {
        self.peek().map(|t| t.position).unwrap_or(self.source_len)
    }

    fn expect(&mut self, expected: &Token, what: &str) -> Result<(), ExprError> {
        match self.next() {
            Some(t) if t.token == *expected => Ok(()),
            Some(t) => Err(ExprError::parse(t.position, format!("expected {}", what))),
            None => Err(ExprError::parse(self.source_len, format!("expected {}", what))),
        }
    }

    fn or_expr(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.and_expr()?;
        while matches!(self.peek().map(|t| &t.token), Some(Token::Or)) {
            self.next();
            let rhs = self.and_expr()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.not_expr()?;
        while matches!(self.peek().map(|t| &t.token), Some(Token::And)) {
            self.next();
            let rhs = self.not_expr()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn not_expr(&mut self) -> Result<Expr, ExprError> {
        if matches!(self.peek().map(|t| &t.token), Some(Token::Not)) {
            self.next();
            let inner = self.not_expr()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, ExprError> {
        let lhs = self.primary()?;
        let op = match self.peek().map(|t| &t.token) {
            Some(Token::Eq) => Some(CmpOp::Eq),
            Some(Token::Ne) => Some(CmpOp::Ne),
            Some(Token::Lt) => Some(CmpOp::Lt),
            Some(Token::Le) => Some(CmpOp::Le),
            Some(Token::Gt) => Some(CmpOp::Gt),
            Some(Token::Ge) => Some(CmpOp::Ge),
            Some(Token::Contains) => Some(CmpOp::Contains),
            Some(Token::Matches) => Some(CmpOp::Matches),
            Some(Token::In) => Some(CmpOp::In),
            _ => None,
        };
        match op {
            Some(op) => {
                self.next();
                let rhs = self.primary()?;
                Ok(Expr::Cmp {
                    op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                })
            }
            None => Ok(lhs),
        }
    }

    fn primary(&mut self) -> Result<Expr, ExprError> {
        let position = self.position();
        match self.next() {
            Some(Spanned { token: Token::LParen, .. }) => {
                let inner = self.or_expr()?;
                self.expect(&Token::RParen, "')'")?;
                Ok(inner)
            }
            Some(Spanned { token: Token::LBracket, .. }) => self.list_literal(),
            Some(Spanned { token: Token::Str(s), .. }) => Ok(Expr::Str(s)),
            Some(Spanned { token: Token::Num(n), .. }) => Ok(Expr::Num(n)),
            Some(Spanned { token: Token::Bool(b), .. }) => Ok(Expr::Bool(b)),
            Some(Spanned { token: Token::Ident(name), .. }) => {
                if matches!(self.peek().map(|t| &t.token), Some(Token::LParen)) {
                    self.next();
                    let arg = self.or_expr()?;
                    self.expect(&Token::RParen, "')'")?;
                    Ok(Expr::Call {
                        name,
                        arg: Box::new(arg),
                    })
                } else {
                    Ok(Expr::Path(name))
                }
            }
            Some(t) => Err(ExprError::parse(t.position, "expected a value")),
            None => Err(ExprError::parse(position, "unexpected end of expression")),
        }
    }

    fn list_literal(&mut self) -> Result<Expr, ExprError> {
        let mut items = Vec::new();
        loop {
            match self.next() {
                Some(Spanned { token: Token::Str(s), .. }) => items.push(s),
                Some(Spanned { token: Token::Num(n), .. }) => items.push(n.to_string()),
                Some(Spanned { token: Token::RBracket, .. }) if items.is_empty() => {
                    return Ok(Expr::List(items))
                }
                Some(t) => {
                    return Err(ExprError::parse(t.position, "expected a list element"))
                }
                None => {
                    return Err(ExprError::parse(self.source_len, "unterminated list"))
                }
            }
            match self.next() {
                Some(Spanned { token: Token::Comma, .. }) => continue,
                Some(Spanned { token: Token::RBracket, .. }) => return Ok(Expr::List(items)),
                Some(t) => return Err(ExprError::parse(t.position, "expected ',' or ']'")),
                None => return Err(ExprError::parse(self.source_len, "unterminated list")),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_precedence() {
        let expr = Expr::parse("a = 1 or b = 2 and not c = 3").unwrap();
        // `and` binds tighter than `or`
        match expr {
            Expr::Or(_, rhs) => match *rhs {
                Expr::And(_, rhs) => assert!(matches!(*rhs, Expr::Not(_))),
                other => panic!("expected And, got {:?}", other),
            },
            other => panic!("expected Or, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_membership() {
        let expr = Expr::parse(r#"resolution in ["2160p", "1080p"]"#).unwrap();
        match expr {
            Expr::Cmp { op: CmpOp::In, rhs, .. } => {
                assert_eq!(*rhs, Expr::List(vec!["2160p".into(), "1080p".into()]));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_call() {
        let expr = Expr::parse(r#"count(type = "debrid") > 0"#).unwrap();
        assert!(matches!(expr, Expr::Cmp { op: CmpOp::Gt, .. }));
    }

    #[test]
    fn test_trailing_input_rejected() {
        let err = Expr::parse("a = 1 b").unwrap_err();
        assert!(matches!(err, ExprError::Parse { .. }));
    }
}
