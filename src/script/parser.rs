//! 语法分析：Token → AST（递归下降）
//!
//! 优先级（低 → 高）：|| → && → == != → < <= > >= → + - → * / % → 一元 ! - await → 后缀 . [] ()

use serde_json::Value;

use crate::script::lexer::{tokenize, Spanned, Token};
use crate::script::ScriptError;

/// AST 嵌套深度上限（括号、一元运算、成员/二元链、语句块都计入）
pub const MAX_DEPTH: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Var(String),
    Array(Vec<Expr>),
    Object(Vec<(String, Expr)>),
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Logical {
        op: LogicalOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Member {
        object: Box<Expr>,
        property: String,
    },
    Index {
        object: Box<Expr>,
        index: Box<Expr>,
    },
    /// 内置函数调用：resolve(...)、sleep(...)
    Call {
        callee: String,
        args: Vec<Expr>,
    },
    /// 方法调用：agent.goto(...)
    MethodCall {
        object: Box<Expr>,
        method: String,
        args: Vec<Expr>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Let { name: String, value: Expr },
    Assign { name: String, value: Expr },
    If {
        cond: Expr,
        then: Vec<Stmt>,
        otherwise: Vec<Stmt>,
    },
    Throw(Expr),
    Expr(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub statements: Vec<Stmt>,
}

pub fn parse(src: &str) -> Result<Program, ScriptError> {
    let tokens = tokenize(src)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let statements = parser.statements(false)?;
    Ok(Program { statements })
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)].token
    }

    fn peek_at(&self, offset: usize) -> &Token {
        let idx = (self.pos + offset).min(self.tokens.len() - 1);
        &self.tokens[idx].token
    }

    fn line(&self) -> usize {
        self.tokens[self.pos.min(self.tokens.len() - 1)].line
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
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

    fn expect(&mut self, token: Token, what: &str) -> Result<(), ScriptError> {
        if self.eat(&token) {
            Ok(())
        } else {
            Err(self.syntax(&format!("expected {what}, found {}", describe(self.peek()))))
        }
    }

    /// 深入一层；超过 MAX_DEPTH 时报语法错误。调用方负责恢复 depth。
    fn descend(&mut self) -> Result<(), ScriptError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(self.syntax("nesting too deep"));
        }
        Ok(())
    }

    fn skip_newlines(&mut self) {
        while matches!(self.peek(), Token::Newline | Token::Semi) {
            self.advance();
        }
    }

    /// 语句序列；in_block 为 true 时遇到 `}` 结束
    fn statements(&mut self, in_block: bool) -> Result<Vec<Stmt>, ScriptError> {
        let mut out = Vec::new();
        loop {
            self.skip_newlines();
            match self.peek() {
                Token::Eof if in_block => {
                    return Err(self.syntax("expected '}' before end of script"));
                }
                Token::Eof => return Ok(out),
                Token::RBrace if in_block => return Ok(out),
                _ => {}
            }
            out.push(self.statement()?);
            match self.peek() {
                Token::Newline | Token::Semi | Token::Eof => {}
                Token::RBrace if in_block => {}
                other => {
                    return Err(self.syntax(&format!(
                        "expected end of statement, found {}",
                        describe(other)
                    )))
                }
            }
        }
    }

    fn block(&mut self) -> Result<Vec<Stmt>, ScriptError> {
        self.skip_only_newlines();
        if !self.eat(&Token::LBrace) {
            return Err(self.syntax(&format!("expected '{{', found {}", describe(self.peek()))));
        }
        let saved = self.depth;
        self.descend()?;
        let body = self.statements(true)?;
        self.expect(Token::RBrace, "'}'")?;
        self.depth = saved;
        Ok(body)
    }

    fn skip_only_newlines(&mut self) {
        while matches!(self.peek(), Token::Newline) {
            self.advance();
        }
    }

    fn statement(&mut self) -> Result<Stmt, ScriptError> {
        match self.peek().clone() {
            Token::Let => {
                self.advance();
                let name = self.ident("variable name")?;
                self.expect(Token::Assign, "'='")?;
                let value = self.expression()?;
                Ok(Stmt::Let { name, value })
            }
            Token::Throw => {
                self.advance();
                Ok(Stmt::Throw(self.expression()?))
            }
            Token::If => {
                self.advance();
                self.expect(Token::LParen, "'(' after if")?;
                let cond = self.expression()?;
                self.expect(Token::RParen, "')'")?;
                let then = self.block()?;
                let otherwise = if self.else_follows() {
                    self.skip_only_newlines();
                    self.advance();
                    if matches!(self.peek(), Token::If) {
                        let saved = self.depth;
                        self.descend()?;
                        let nested = self.statement()?;
                        self.depth = saved;
                        vec![nested]
                    } else {
                        self.block()?
                    }
                } else {
                    Vec::new()
                };
                Ok(Stmt::If {
                    cond,
                    then,
                    otherwise,
                })
            }
            Token::Ident(name) if self.peek_at(1) == &Token::Assign => {
                self.advance();
                self.advance();
                let value = self.expression()?;
                Ok(Stmt::Assign { name, value })
            }
            _ => Ok(Stmt::Expr(self.expression()?)),
        }
    }

    /// `}` 之后（可跨换行）是否紧跟 else
    fn else_follows(&self) -> bool {
        let mut offset = 0;
        while self.peek_at(offset) == &Token::Newline {
            offset += 1;
        }
        self.peek_at(offset) == &Token::Else
    }

    fn ident(&mut self, what: &str) -> Result<String, ScriptError> {
        match self.advance() {
            Token::Ident(name) => Ok(name),
            other => Err(self.syntax(&format!("expected {what}, found {}", describe(&other)))),
        }
    }

    fn syntax(&self, message: &str) -> ScriptError {
        ScriptError::Syntax {
            line: self.line(),
            message: message.to_string(),
        }
    }

    fn expression(&mut self) -> Result<Expr, ScriptError> {
        self.or()
    }

    fn or(&mut self) -> Result<Expr, ScriptError> {
        let saved = self.depth;
        let mut lhs = self.and()?;
        while self.eat(&Token::Or) {
            self.descend()?;
            let rhs = self.and()?;
            lhs = Expr::Logical {
                op: LogicalOp::Or,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        self.depth = saved;
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Expr, ScriptError> {
        let saved = self.depth;
        let mut lhs = self.equality()?;
        while self.eat(&Token::And) {
            self.descend()?;
            let rhs = self.equality()?;
            lhs = Expr::Logical {
                op: LogicalOp::And,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        self.depth = saved;
        Ok(lhs)
    }

    fn binary_level(
        &mut self,
        ops: &[(Token, BinaryOp)],
        next: fn(&mut Self) -> Result<Expr, ScriptError>,
    ) -> Result<Expr, ScriptError> {
        let saved = self.depth;
        let mut lhs = next(self)?;
        'outer: loop {
            for (token, op) in ops {
                if self.eat(token) {
                    // 左结合链每多一个运算符，AST 就深一层
                    self.descend()?;
                    let rhs = next(self)?;
                    lhs = Expr::Binary {
                        op: *op,
                        lhs: Box::new(lhs),
                        rhs: Box::new(rhs),
                    };
                    continue 'outer;
                }
            }
            self.depth = saved;
            return Ok(lhs);
        }
    }

    fn equality(&mut self) -> Result<Expr, ScriptError> {
        self.binary_level(
            &[(Token::Eq, BinaryOp::Eq), (Token::Ne, BinaryOp::Ne)],
            Self::comparison,
        )
    }

    fn comparison(&mut self) -> Result<Expr, ScriptError> {
        self.binary_level(
            &[
                (Token::Lt, BinaryOp::Lt),
                (Token::Le, BinaryOp::Le),
                (Token::Gt, BinaryOp::Gt),
                (Token::Ge, BinaryOp::Ge),
            ],
            Self::additive,
        )
    }

    fn additive(&mut self) -> Result<Expr, ScriptError> {
        self.binary_level(
            &[(Token::Plus, BinaryOp::Add), (Token::Minus, BinaryOp::Sub)],
            Self::multiplicative,
        )
    }

    fn multiplicative(&mut self) -> Result<Expr, ScriptError> {
        self.binary_level(
            &[
                (Token::Star, BinaryOp::Mul),
                (Token::Slash, BinaryOp::Div),
                (Token::Percent, BinaryOp::Rem),
            ],
            Self::unary,
        )
    }

    fn unary(&mut self) -> Result<Expr, ScriptError> {
        let saved = self.depth;
        self.descend()?;
        let expr = self.unary_inner()?;
        self.depth = saved;
        Ok(expr)
    }

    fn unary_inner(&mut self) -> Result<Expr, ScriptError> {
        match self.peek() {
            Token::Await => {
                self.advance();
                self.unary()
            }
            Token::Bang => {
                self.advance();
                Ok(Expr::Unary {
                    op: UnaryOp::Not,
                    expr: Box::new(self.unary()?),
                })
            }
            Token::Minus => {
                self.advance();
                Ok(Expr::Unary {
                    op: UnaryOp::Neg,
                    expr: Box::new(self.unary()?),
                })
            }
            _ => self.postfix(),
        }
    }

    fn postfix(&mut self) -> Result<Expr, ScriptError> {
        let saved = self.depth;
        let mut expr = self.primary()?;
        loop {
            match self.peek() {
                Token::Dot => {
                    self.descend()?;
                    self.advance();
                    let property = self.ident("property name")?;
                    if self.eat(&Token::LParen) {
                        let args = self.arguments()?;
                        expr = Expr::MethodCall {
                            object: Box::new(expr),
                            method: property,
                            args,
                        };
                    } else {
                        expr = Expr::Member {
                            object: Box::new(expr),
                            property,
                        };
                    }
                }
                Token::LBracket => {
                    self.descend()?;
                    self.advance();
                    let index = self.expression()?;
                    self.expect(Token::RBracket, "']'")?;
                    expr = Expr::Index {
                        object: Box::new(expr),
                        index: Box::new(index),
                    };
                }
                Token::LParen => {
                    self.descend()?;
                    let Expr::Var(callee) = expr else {
                        return Err(self.syntax("only named functions can be called"));
                    };
                    self.advance();
                    let args = self.arguments()?;
                    expr = Expr::Call { callee, args };
                }
                _ => {
                    self.depth = saved;
                    return Ok(expr);
                }
            }
        }
    }

    /// 已消费 `(`，解析到 `)` 为止
    fn arguments(&mut self) -> Result<Vec<Expr>, ScriptError> {
        let mut args = Vec::new();
        if self.eat(&Token::RParen) {
            return Ok(args);
        }
        loop {
            args.push(self.expression()?);
            if self.eat(&Token::Comma) {
                if self.eat(&Token::RParen) {
                    return Ok(args);
                }
                continue;
            }
            self.expect(Token::RParen, "')'")?;
            return Ok(args);
        }
    }

    fn primary(&mut self) -> Result<Expr, ScriptError> {
        let line = self.line();
        match self.advance() {
            Token::Number(n) => Ok(Expr::Literal(
                crate::script::interpreter::number(n).map_err(|_| ScriptError::Syntax {
                    line,
                    message: format!("invalid number literal {n}"),
                })?,
            )),
            Token::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Token::True => Ok(Expr::Literal(Value::Bool(true))),
            Token::False => Ok(Expr::Literal(Value::Bool(false))),
            Token::Null => Ok(Expr::Literal(Value::Null)),
            Token::Ident(name) => Ok(Expr::Var(name)),
            Token::LParen => {
                let expr = self.expression()?;
                self.expect(Token::RParen, "')'")?;
                Ok(expr)
            }
            Token::LBracket => {
                let mut items = Vec::new();
                if self.eat(&Token::RBracket) {
                    return Ok(Expr::Array(items));
                }
                loop {
                    items.push(self.expression()?);
                    if self.eat(&Token::Comma) {
                        if self.eat(&Token::RBracket) {
                            break;
                        }
                        continue;
                    }
                    self.expect(Token::RBracket, "']'")?;
                    break;
                }
                Ok(Expr::Array(items))
            }
            Token::LBrace => self.object(),
            other => Err(ScriptError::Syntax {
                line,
                message: format!("unexpected {}", describe(&other)),
            }),
        }
    }

    /// 已消费 `{`；对象字面量内部允许换行
    fn object(&mut self) -> Result<Expr, ScriptError> {
        let mut fields = Vec::new();
        loop {
            self.skip_only_newlines();
            if self.eat(&Token::RBrace) {
                return Ok(Expr::Object(fields));
            }
            let key = match self.advance() {
                Token::Ident(k) | Token::Str(k) => k,
                other => {
                    return Err(self.syntax(&format!(
                        "expected object key, found {}",
                        describe(&other)
                    )))
                }
            };
            self.expect(Token::Colon, "':'")?;
            self.skip_only_newlines();
            let value = self.expression()?;
            fields.push((key, value));
            self.skip_only_newlines();
            if !self.eat(&Token::Comma) {
                self.skip_only_newlines();
                self.expect(Token::RBrace, "'}'")?;
                return Ok(Expr::Object(fields));
            }
        }
    }
}

fn describe(token: &Token) -> String {
    match token {
        Token::Number(n) => format!("number {n}"),
        Token::Str(s) => format!("string \"{s}\""),
        Token::Ident(name) => format!("'{name}'"),
        Token::Newline => "end of line".to_string(),
        Token::Eof => "end of script".to_string(),
        other => format!("{other:?}"),
    }
}
