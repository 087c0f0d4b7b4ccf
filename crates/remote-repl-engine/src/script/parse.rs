//! Lexer and parser for the script language.
//!
//! Statements are separated by newlines or `;`. Line numbers are zero-based
//! offsets into the source; callers add the request's base line when
//! reporting locations.

use crate::EngineError;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Stmt {
    Assign {
        name: String,
        op: AssignOp,
        expr: Expr,
        line: usize,
    },
    Expr {
        expr: Expr,
        line: usize,
    },
    /// `suspend!("<hook>")` - invoke an installed suspend hook.
    Suspend {
        hook: String,
        line: usize,
    },
    /// `watch!` - persist the current context, without blocking.
    Watch {
        line: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AssignOp {
    Set,
    Add,
    Sub,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Expr {
    Nil,
    Bool(bool),
    Int(i64),
    Str(String),
    Var(String),
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Call {
        name: String,
        args: Vec<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BinOp {
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

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Program {
    pub stmts: Vec<Stmt>,
}

/// Parse a source text. `base` is the source's first line number, used only
/// in error messages.
pub(crate) fn parse(source: &str, base: i64) -> Result<Program, EngineError> {
    let tokens = lex(source, base)?;
    Parser {
        tokens,
        pos: 0,
        base,
    }
    .program()
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Int(i64),
    Str(String),
    Assign,
    PlusAssign,
    MinusAssign,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    LParen,
    RParen,
    Comma,
    Bang,
    Sep,
}

#[derive(Debug, Clone)]
struct Token {
    tok: Tok,
    line: usize,
}

fn lex(source: &str, base: i64) -> Result<Vec<Token>, EngineError> {
    let mut tokens = Vec::new();
    let mut line: usize = 0;
    let mut chars = source.chars().peekable();

    let mut push = |tok: Tok, line: usize| tokens.push(Token { tok, line });

    while let Some(c) = chars.next() {
        match c {
            '\n' => {
                push(Tok::Sep, line);
                line += 1;
            }
            ' ' | '\t' | '\r' => {}
            ';' => push(Tok::Sep, line),
            '#' => {
                while chars.peek().is_some_and(|&c| c != '\n') {
                    chars.next();
                }
            }
            '(' => push(Tok::LParen, line),
            ')' => push(Tok::RParen, line),
            ',' => push(Tok::Comma, line),
            '*' => push(Tok::Star, line),
            '/' => push(Tok::Slash, line),
            '%' => push(Tok::Percent, line),
            '+' => {
                if chars.peek() == Some(&'=') {
                    chars.next();
                    push(Tok::PlusAssign, line);
                } else {
                    push(Tok::Plus, line);
                }
            }
            '-' => {
                if chars.peek() == Some(&'=') {
                    chars.next();
                    push(Tok::MinusAssign, line);
                } else {
                    push(Tok::Minus, line);
                }
            }
            '=' => {
                if chars.peek() == Some(&'=') {
                    chars.next();
                    push(Tok::Eq, line);
                } else {
                    push(Tok::Assign, line);
                }
            }
            '!' => {
                if chars.peek() == Some(&'=') {
                    chars.next();
                    push(Tok::Ne, line);
                } else {
                    push(Tok::Bang, line);
                }
            }
            '<' => {
                if chars.peek() == Some(&'=') {
                    chars.next();
                    push(Tok::Le, line);
                } else {
                    push(Tok::Lt, line);
                }
            }
            '>' => {
                if chars.peek() == Some(&'=') {
                    chars.next();
                    push(Tok::Ge, line);
                } else {
                    push(Tok::Gt, line);
                }
            }
            '"' => {
                let mut s = String::new();
                loop {
                    match chars.next() {
                        None | Some('\n') => {
                            return Err(syntax(base, line, "unterminated string"));
                        }
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some('n') => s.push('\n'),
                            Some('t') => s.push('\t'),
                            Some('\\') => s.push('\\'),
                            Some('"') => s.push('"'),
                            Some(other) => {
                                return Err(syntax(
                                    base,
                                    line,
                                    &format!("unknown escape \\{other}"),
                                ));
                            }
                            None => {
                                return Err(syntax(base, line, "unterminated string"));
                            }
                        },
                        Some(c) => s.push(c),
                    }
                }
                push(Tok::Str(s), line);
            }
            '0'..='9' => {
                let mut digits = String::from(c);
                while chars.peek().is_some_and(char::is_ascii_digit) {
                    digits.push(chars.next().unwrap_or_default());
                }
                let n: i64 = digits
                    .parse()
                    .map_err(|_| syntax(base, line, "integer literal out of range"))?;
                push(Tok::Int(n), line);
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut name = String::from(c);
                while chars
                    .peek()
                    .is_some_and(|&c| c.is_ascii_alphanumeric() || c == '_')
                {
                    name.push(chars.next().unwrap_or_default());
                }
                // a trailing `!` belongs to the name (marker style), unless
                // it starts a `!=`
                if chars.peek() == Some(&'!') {
                    let mut ahead = chars.clone();
                    ahead.next();
                    if ahead.next() != Some('=') {
                        name.push('!');
                        chars.next();
                    }
                }
                push(Tok::Ident(name), line);
            }
            other => {
                return Err(syntax(base, line, &format!("unexpected character {other:?}")));
            }
        }
    }
    Ok(tokens)
}

fn syntax(base: i64, line: usize, msg: &str) -> EngineError {
    EngineError::Parse(format!("syntax error at line {}: {msg}", base + line as i64))
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    base: i64,
}

impl Parser {
    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.pos).map(|t| &t.tok)
    }

    fn peek2(&self) -> Option<&Tok> {
        self.tokens.get(self.pos + 1).map(|t| &t.tok)
    }

    fn line(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map_or(0, |t| t.line)
    }

    fn bump(&mut self) -> Option<Tok> {
        let tok = self.tokens.get(self.pos).map(|t| t.tok.clone());
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn err(&self, msg: &str) -> EngineError {
        syntax(self.base, self.line(), msg)
    }

    fn program(mut self) -> Result<Program, EngineError> {
        let mut stmts = Vec::new();
        loop {
            while self.peek() == Some(&Tok::Sep) {
                self.bump();
            }
            if self.peek().is_none() {
                break;
            }
            stmts.push(self.statement()?);
            match self.peek() {
                None | Some(Tok::Sep) => {}
                Some(_) => return Err(self.err("expected end of statement")),
            }
        }
        Ok(Program { stmts })
    }

    fn statement(&mut self) -> Result<Stmt, EngineError> {
        let line = self.line();

        if self.peek() == Some(&Tok::Ident("watch!".into())) && self.peek2() != Some(&Tok::LParen)
        {
            self.bump();
            return Ok(Stmt::Watch { line });
        }

        if let (Some(Tok::Ident(_)), Some(op)) = (
            self.peek(),
            self.peek2().and_then(|t| match t {
                Tok::Assign => Some(AssignOp::Set),
                Tok::PlusAssign => Some(AssignOp::Add),
                Tok::MinusAssign => Some(AssignOp::Sub),
                _ => None,
            }),
        ) {
            let Some(Tok::Ident(name)) = self.bump() else {
                return Err(self.err("expected identifier"));
            };
            self.bump();
            let expr = self.expr()?;
            return Ok(Stmt::Assign {
                name,
                op,
                expr,
                line,
            });
        }

        let expr = self.expr()?;
        if let Expr::Call { name, args } = &expr {
            if name == "suspend!" {
                return match args.as_slice() {
                    [Expr::Str(hook)] => Ok(Stmt::Suspend {
                        hook: hook.clone(),
                        line,
                    }),
                    _ => Err(self.err("suspend! takes one string argument")),
                };
            }
        }
        Ok(Stmt::Expr { expr, line })
    }

    fn expr(&mut self) -> Result<Expr, EngineError> {
        let lhs = self.additive()?;
        let op = match self.peek() {
            Some(Tok::Eq) => Some(BinOp::Eq),
            Some(Tok::Ne) => Some(BinOp::Ne),
            Some(Tok::Lt) => Some(BinOp::Lt),
            Some(Tok::Le) => Some(BinOp::Le),
            Some(Tok::Gt) => Some(BinOp::Gt),
            Some(Tok::Ge) => Some(BinOp::Ge),
            _ => None,
        };
        if let Some(op) = op {
            self.bump();
            let rhs = self.additive()?;
            return Ok(Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            });
        }
        Ok(lhs)
    }

    fn additive(&mut self) -> Result<Expr, EngineError> {
        let mut lhs = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Tok::Plus) => BinOp::Add,
                Some(Tok::Minus) => BinOp::Sub,
                _ => return Ok(lhs),
            };
            self.bump();
            let rhs = self.multiplicative()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
    }

    fn multiplicative(&mut self) -> Result<Expr, EngineError> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Tok::Star) => BinOp::Mul,
                Some(Tok::Slash) => BinOp::Div,
                Some(Tok::Percent) => BinOp::Rem,
                _ => return Ok(lhs),
            };
            self.bump();
            let rhs = self.unary()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
    }

    fn unary(&mut self) -> Result<Expr, EngineError> {
        let op = match self.peek() {
            Some(Tok::Minus) => Some(UnaryOp::Neg),
            Some(Tok::Bang) => Some(UnaryOp::Not),
            _ => None,
        };
        if let Some(op) = op {
            self.bump();
            let expr = self.unary()?;
            return Ok(Expr::Unary {
                op,
                expr: Box::new(expr),
            });
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, EngineError> {
        match self.bump() {
            Some(Tok::Int(n)) => Ok(Expr::Int(n)),
            Some(Tok::Str(s)) => Ok(Expr::Str(s)),
            Some(Tok::Ident(name)) => match name.as_str() {
                "nil" => Ok(Expr::Nil),
                "true" => Ok(Expr::Bool(true)),
                "false" => Ok(Expr::Bool(false)),
                _ => {
                    if self.peek() == Some(&Tok::LParen) {
                        self.bump();
                        let args = self.call_args()?;
                        Ok(Expr::Call { name, args })
                    } else {
                        Ok(Expr::Var(name))
                    }
                }
            },
            Some(Tok::LParen) => {
                let expr = self.expr()?;
                if self.bump() != Some(Tok::RParen) {
                    return Err(self.err("expected `)`"));
                }
                Ok(expr)
            }
            _ => Err(self.err("expected expression")),
        }
    }

    fn call_args(&mut self) -> Result<Vec<Expr>, EngineError> {
        let mut args = Vec::new();
        if self.peek() == Some(&Tok::RParen) {
            self.bump();
            return Ok(args);
        }
        loop {
            args.push(self.expr()?);
            match self.bump() {
                Some(Tok::Comma) => {}
                Some(Tok::RParen) => return Ok(args),
                _ => return Err(self.err("expected `,` or `)` in argument list")),
            }
        }
    }
}
