//! Recursive-descent parser.
//!
//! Two entry modes mirror the two ways source reaches the engine: [`Mode::Single`]
//! takes exactly one (possibly compound) statement, as typed at a prompt;
//! [`Mode::File`] takes any number of statements.

use std::rc::Rc;

use crate::ast::{BinOp, CmpOp, Expr, FunctionDef, Handler, Stmt, StmtKind, UnaryOp};
use crate::error::SyntaxError;
use crate::lexer::{tokenize, Spanned, Token};

/// How a source text is to be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Single,
    File,
}

/// Parses `source` into a statement list.
pub fn parse(source: &str, mode: Mode) -> Result<Vec<Stmt>, SyntaxError> {
    let mut parser = Parser {
        tokens: tokenize(source)?,
        pos: 0,
    };
    match mode {
        Mode::File => parser.file(),
        Mode::Single => parser.single(),
    }
}

type PResult<T> = Result<T, SyntaxError>;

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        self.tokens
            .get(self.pos)
            .map(|t| &t.token)
            .unwrap_or(&Token::Eof)
    }

    fn line(&self) -> u32 {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|t| t.line)
            .unwrap_or(1)
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == token {
            self.advance();
            true
        } else {
            false
        }
    }

    fn error<T>(&self, message: impl Into<String>) -> PResult<T> {
        Err(SyntaxError::new(self.line(), message))
    }

    fn expect(&mut self, token: Token) -> PResult<()> {
        if self.eat(&token) {
            Ok(())
        } else {
            self.error(format!("invalid syntax: expected {}, found {}", token, self.peek()))
        }
    }

    fn name(&mut self) -> PResult<Rc<str>> {
        match self.advance() {
            Token::Name(name) => Ok(name),
            other => self.error(format!("invalid syntax: expected a name, found {}", other)),
        }
    }

    fn skip_newlines(&mut self) {
        while self.eat(&Token::Newline) {}
    }

    // ========================================================================
    // Statements
    // ========================================================================

    fn file(&mut self) -> PResult<Vec<Stmt>> {
        let mut stmts = Vec::new();
        loop {
            self.skip_newlines();
            if *self.peek() == Token::Eof {
                return Ok(stmts);
            }
            stmts.extend(self.statement()?);
        }
    }

    fn single(&mut self) -> PResult<Vec<Stmt>> {
        self.skip_newlines();
        if *self.peek() == Token::Eof {
            return Ok(Vec::new());
        }
        let stmts = self.statement()?;
        self.skip_newlines();
        if *self.peek() != Token::Eof {
            return self.error("invalid syntax: more than one statement");
        }
        Ok(stmts)
    }

    fn statement(&mut self) -> PResult<Vec<Stmt>> {
        match self.peek() {
            Token::Def | Token::If | Token::While | Token::Try => Ok(vec![self.compound()?]),
            Token::Indent => self.error("unexpected indent"),
            Token::Dedent => self.error("unexpected dedent"),
            _ => self.simple_line(),
        }
    }

    fn simple_line(&mut self) -> PResult<Vec<Stmt>> {
        let mut stmts = vec![self.simple()?];
        while self.eat(&Token::Semicolon) {
            if matches!(self.peek(), Token::Newline | Token::Eof) {
                break;
            }
            stmts.push(self.simple()?);
        }
        if !self.eat(&Token::Newline) && *self.peek() != Token::Eof {
            return self.error(format!("invalid syntax at {}", self.peek()));
        }
        Ok(stmts)
    }

    fn simple(&mut self) -> PResult<Stmt> {
        let line = self.line();
        let kind = match self.peek() {
            Token::Pass => {
                self.advance();
                StmtKind::Pass
            }
            Token::Break => {
                self.advance();
                StmtKind::Break
            }
            Token::Continue => {
                self.advance();
                StmtKind::Continue
            }
            Token::Return => {
                self.advance();
                if self.at_expression_end() {
                    StmtKind::Return(None)
                } else {
                    StmtKind::Return(Some(self.expr_list()?))
                }
            }
            Token::Raise => {
                self.advance();
                if self.at_expression_end() {
                    StmtKind::Raise(None)
                } else {
                    StmtKind::Raise(Some(self.expr()?))
                }
            }
            Token::Global => {
                self.advance();
                let mut names = vec![self.name()?];
                while self.eat(&Token::Comma) {
                    names.push(self.name()?);
                }
                StmtKind::Global(names)
            }
            _ => self.expression_statement()?,
        };
        Ok(Stmt { kind, line })
    }

    fn at_expression_end(&self) -> bool {
        matches!(self.peek(), Token::Newline | Token::Semicolon | Token::Eof)
    }

    fn expression_statement(&mut self) -> PResult<StmtKind> {
        let first = self.expr_list()?;
        if *self.peek() == Token::Assign {
            let mut targets = Vec::new();
            let mut current = first;
            while self.eat(&Token::Assign) {
                match current {
                    Expr::Name(name) => targets.push(name),
                    _ => return self.error("can't assign to expression"),
                }
                current = self.expr_list()?;
            }
            return Ok(StmtKind::Assign(targets, current));
        }
        if let Some(op) = augmented_op(self.peek()) {
            self.advance();
            let Expr::Name(target) = first else {
                return self.error("can't assign to expression");
            };
            return Ok(StmtKind::AugAssign(target, op, self.expr_list()?));
        }
        Ok(StmtKind::Expr(first))
    }

    fn block(&mut self) -> PResult<Vec<Stmt>> {
        self.expect(Token::Colon)?;
        if !self.eat(&Token::Newline) {
            return self.simple_line();
        }
        if !self.eat(&Token::Indent) {
            return self.error("expected an indented block");
        }
        let mut body = Vec::new();
        loop {
            self.skip_newlines();
            if self.eat(&Token::Dedent) || *self.peek() == Token::Eof {
                return Ok(body);
            }
            body.extend(self.statement()?);
        }
    }

    fn compound(&mut self) -> PResult<Stmt> {
        let line = self.line();
        let kind = match self.advance() {
            Token::If => {
                let mut branches = vec![(self.expr()?, self.block()?)];
                while self.eat(&Token::Elif) {
                    branches.push((self.expr()?, self.block()?));
                }
                let orelse = if self.eat(&Token::Else) {
                    Some(self.block()?)
                } else {
                    None
                };
                StmtKind::If(branches, orelse)
            }
            Token::While => StmtKind::While(self.expr()?, self.block()?),
            Token::Def => {
                let name = self.name()?;
                self.expect(Token::LParen)?;
                let mut params = Vec::new();
                while *self.peek() != Token::RParen {
                    params.push(self.name()?);
                    if !self.eat(&Token::Comma) {
                        break;
                    }
                }
                self.expect(Token::RParen)?;
                let body = self.block()?;
                StmtKind::Def(Rc::new(FunctionDef {
                    name,
                    params,
                    body,
                    line,
                }))
            }
            Token::Try => self.try_statement()?,
            other => return self.error(format!("invalid syntax at {}", other)),
        };
        Ok(Stmt { kind, line })
    }

    fn try_statement(&mut self) -> PResult<StmtKind> {
        let body = self.block()?;
        let mut handlers = Vec::new();
        while self.eat(&Token::Except) {
            let kind = if matches!(self.peek(), Token::Colon | Token::As) {
                None
            } else {
                Some(self.expr()?)
            };
            let binding = if self.eat(&Token::As) {
                Some(self.name()?)
            } else {
                None
            };
            handlers.push(Handler {
                kind,
                binding,
                body: self.block()?,
            });
        }
        let orelse = if !handlers.is_empty() && self.eat(&Token::Else) {
            Some(self.block()?)
        } else {
            None
        };
        let finally = if self.eat(&Token::Finally) {
            Some(self.block()?)
        } else {
            None
        };
        if handlers.is_empty() && finally.is_none() {
            return self.error("invalid syntax: try without except or finally");
        }
        Ok(StmtKind::Try {
            body,
            handlers,
            orelse,
            finally,
        })
    }

    // ========================================================================
    // Expressions
    // ========================================================================

    fn starts_expression(&self) -> bool {
        !matches!(
            self.peek(),
            Token::Newline
                | Token::Eof
                | Token::Semicolon
                | Token::Assign
                | Token::RParen
                | Token::RBracket
                | Token::Colon
        ) && augmented_op(self.peek()).is_none()
    }

    /// `a` or `a, b, ...` (a tuple).
    fn expr_list(&mut self) -> PResult<Expr> {
        let first = self.expr()?;
        if *self.peek() != Token::Comma {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat(&Token::Comma) {
            if !self.starts_expression() {
                break;
            }
            items.push(self.expr()?);
        }
        Ok(Expr::Tuple(items))
    }

    fn expr(&mut self) -> PResult<Expr> {
        let mut left = self.and_test()?;
        while self.eat(&Token::Or) {
            left = Expr::Or(Box::new(left), Box::new(self.and_test()?));
        }
        Ok(left)
    }

    fn and_test(&mut self) -> PResult<Expr> {
        let mut left = self.not_test()?;
        while self.eat(&Token::And) {
            left = Expr::And(Box::new(left), Box::new(self.not_test()?));
        }
        Ok(left)
    }

    fn not_test(&mut self) -> PResult<Expr> {
        if self.eat(&Token::Not) {
            return Ok(Expr::Unary(UnaryOp::Not, Box::new(self.not_test()?)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> PResult<Expr> {
        let first = self.bit_or()?;
        let mut chain = Vec::new();
        loop {
            let op = match self.peek() {
                Token::Lt => CmpOp::Lt,
                Token::Gt => CmpOp::Gt,
                Token::Le => CmpOp::Le,
                Token::Ge => CmpOp::Ge,
                Token::EqEq => CmpOp::Eq,
                Token::NotEq => CmpOp::NotEq,
                Token::Is => {
                    self.advance();
                    let op = if self.eat(&Token::Not) { CmpOp::IsNot } else { CmpOp::Is };
                    chain.push((op, self.bit_or()?));
                    continue;
                }
                _ => break,
            };
            self.advance();
            chain.push((op, self.bit_or()?));
        }
        if chain.is_empty() {
            Ok(first)
        } else {
            Ok(Expr::Compare(Box::new(first), chain))
        }
    }

    fn binary_level(
        &mut self,
        next: fn(&mut Self) -> PResult<Expr>,
        ops: fn(&Token) -> Option<BinOp>,
    ) -> PResult<Expr> {
        let mut left = next(self)?;
        while let Some(op) = ops(self.peek()) {
            self.advance();
            let right = next(self)?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn bit_or(&mut self) -> PResult<Expr> {
        self.binary_level(Self::bit_xor, |t| (*t == Token::Pipe).then_some(BinOp::BitOr))
    }

    fn bit_xor(&mut self) -> PResult<Expr> {
        self.binary_level(Self::bit_and, |t| (*t == Token::Caret).then_some(BinOp::BitXor))
    }

    fn bit_and(&mut self) -> PResult<Expr> {
        self.binary_level(Self::shift, |t| (*t == Token::Amp).then_some(BinOp::BitAnd))
    }

    fn shift(&mut self) -> PResult<Expr> {
        self.binary_level(Self::arith, |t| match t {
            Token::Shl => Some(BinOp::Shl),
            Token::Shr => Some(BinOp::Shr),
            _ => None,
        })
    }

    fn arith(&mut self) -> PResult<Expr> {
        self.binary_level(Self::term, |t| match t {
            Token::Plus => Some(BinOp::Add),
            Token::Minus => Some(BinOp::Sub),
            _ => None,
        })
    }

    fn term(&mut self) -> PResult<Expr> {
        self.binary_level(Self::factor, |t| match t {
            Token::Star => Some(BinOp::Mul),
            Token::Slash => Some(BinOp::Div),
            Token::SlashSlash => Some(BinOp::FloorDiv),
            Token::Percent => Some(BinOp::Mod),
            _ => None,
        })
    }

    fn factor(&mut self) -> PResult<Expr> {
        let op = match self.peek() {
            Token::Minus => UnaryOp::Neg,
            Token::Plus => UnaryOp::Pos,
            Token::Tilde => UnaryOp::Invert,
            _ => return self.power(),
        };
        self.advance();
        Ok(Expr::Unary(op, Box::new(self.factor()?)))
    }

    fn power(&mut self) -> PResult<Expr> {
        let base = self.primary()?;
        if self.eat(&Token::StarStar) {
            let exponent = self.factor()?;
            return Ok(Expr::Binary(BinOp::Pow, Box::new(base), Box::new(exponent)));
        }
        Ok(base)
    }

    fn arguments(&mut self) -> PResult<Vec<Expr>> {
        let mut args = Vec::new();
        while *self.peek() != Token::RParen {
            args.push(self.expr()?);
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.expect(Token::RParen)?;
        Ok(args)
    }

    fn primary(&mut self) -> PResult<Expr> {
        let mut expr = self.atom()?;
        loop {
            if self.eat(&Token::LParen) {
                expr = Expr::Call(Box::new(expr), self.arguments()?);
            } else if self.eat(&Token::Dot) {
                let name = self.name()?;
                if self.eat(&Token::LParen) {
                    expr = Expr::Method(Box::new(expr), name, self.arguments()?);
                } else {
                    expr = Expr::Attribute(Box::new(expr), name);
                }
            } else if self.eat(&Token::LBracket) {
                let index = self.expr()?;
                self.expect(Token::RBracket)?;
                expr = Expr::Subscript(Box::new(expr), Box::new(index));
            } else {
                return Ok(expr);
            }
        }
    }

    fn atom(&mut self) -> PResult<Expr> {
        Ok(match self.advance() {
            Token::Int(i) => Expr::Int(i),
            Token::Float(x) => Expr::Float(x),
            Token::Str(s) => {
                let mut text = s.to_string();
                while let Token::Str(next) = self.peek() {
                    text.push_str(next);
                    self.advance();
                }
                Expr::Str(text.into())
            }
            Token::Bytes(b) => Expr::Bytes(b),
            Token::Name(name) => Expr::Name(name),
            Token::True => Expr::Bool(true),
            Token::False => Expr::Bool(false),
            Token::None => Expr::None,
            Token::LParen => {
                if self.eat(&Token::RParen) {
                    return Ok(Expr::Tuple(Vec::new()));
                }
                let inner = self.expr_list()?;
                self.expect(Token::RParen)?;
                inner
            }
            Token::Eof => return self.error("unexpected end of input"),
            other => return self.error(format!("invalid syntax at {}", other)),
        })
    }
}

fn augmented_op(token: &Token) -> Option<BinOp> {
    Some(match token {
        Token::PlusAssign => BinOp::Add,
        Token::MinusAssign => BinOp::Sub,
        Token::StarAssign => BinOp::Mul,
        Token::SlashAssign => BinOp::Div,
        Token::SlashSlashAssign => BinOp::FloorDiv,
        Token::PercentAssign => BinOp::Mod,
        Token::AmpAssign => BinOp::BitAnd,
        Token::PipeAssign => BinOp::BitOr,
        Token::CaretAssign => BinOp::BitXor,
        Token::ShlAssign => BinOp::Shl,
        Token::ShrAssign => BinOp::Shr,
        _ => return None,
    })
}
