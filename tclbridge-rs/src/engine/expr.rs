//! Expression lexer, AST, parser, and evaluator.
//!
//! Used by `expr` and by the conditions of `if`, `while` and `for`.
//! Operands may be numbers, bare booleans, `$var`, `[script]`, `"quoted"`
//! or `{braced}` words, and math function calls.
//!
//! Operator precedence (lowest → highest):
//!   ternary  →  or  →  and  →  bitor  →  bitxor  →  bitand  →
//!   equality (`== != eq ne in ni`)  →  relational  →  shift  →
//!   additive  →  multiplicative  →  unary  →  power  →  primary

use std::cmp::Ordering;

use super::list;
use super::obj::{format_double, parse_boolean, parse_double, parse_int};
use super::parse::{Parser as ScriptParser, Part};
use super::{ensure_sufficient_stack, Code};

// ── ExprContext ───────────────────────────────────────────────────────────────

/// Why evaluation stopped.
#[derive(Debug, Clone, PartialEq)]
pub enum Failure {
    /// Expression-level error; the caller reports the message.
    Message(String),
    /// A substitution completed abnormally and already set the result.
    Code(Code),
}

/// Access to the interpreter for substitutions inside an expression.
pub trait ExprContext {
    /// Value of `$name` or `$name(index)`.
    fn variable(&self, name: &str, index: Option<&[Part]>) -> Result<String, Failure>;

    /// Result of `[script]`.
    fn command(&self, script: &str) -> Result<String, Failure>;

    /// Substituted text of a `"quoted"` operand.
    fn substitute(&self, parts: &[Part]) -> Result<String, Failure>;
}

// ── Operand ───────────────────────────────────────────────────────────────────

/// An evaluated operand.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Int(i64),
    Double(f64),
    Str(String),
}

enum Num {
    I(i64),
    D(f64),
}

impl Operand {
    /// Numeric when the text reads as a number, otherwise a string.
    pub fn from_text(text: &str) -> Operand {
        if let Some(i) = parse_int(text) {
            Operand::Int(i)
        } else if let Some(d) = parse_double(text) {
            Operand::Double(d)
        } else {
            Operand::Str(text.to_owned())
        }
    }

    pub fn to_text(&self) -> String {
        match self {
            Operand::Int(i) => i.to_string(),
            Operand::Double(d) => format_double(*d),
            Operand::Str(s) => s.clone(),
        }
    }

    /// Truth value for conditions and logical operators.
    pub fn truth(&self) -> Result<bool, Failure> {
        match self {
            Operand::Int(i) => Ok(*i != 0),
            Operand::Double(d) => Ok(*d != 0.0),
            Operand::Str(s) => parse_boolean(s)
                .ok_or_else(|| Failure::Message(format!("expected boolean value but got \"{s}\""))),
        }
    }

    fn num(&self, op: &str) -> Result<Num, Failure> {
        match self {
            Operand::Int(i) => Ok(Num::I(*i)),
            Operand::Double(d) => Ok(Num::D(*d)),
            Operand::Str(s) if s.is_empty() => Err(Failure::Message(format!(
                "can't use empty string as operand of \"{op}\""
            ))),
            Operand::Str(_) => Err(Failure::Message(format!(
                "can't use non-numeric string as operand of \"{op}\""
            ))),
        }
    }

    fn int(&self, op: &str) -> Result<i64, Failure> {
        match self.num(op)? {
            Num::I(i) => Ok(i),
            Num::D(_) => Err(Failure::Message(format!(
                "can't use floating-point value as operand of \"{op}\""
            ))),
        }
    }

    fn float(&self, op: &str) -> Result<f64, Failure> {
        Ok(match self.num(op)? {
            Num::I(i) => i as f64,
            Num::D(d) => d,
        })
    }
}

fn flag(b: bool) -> Operand {
    Operand::Int(i64::from(b))
}

// ── Token ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    // Operands
    Int(i64),
    Float(f64),
    Word(String),
    Var { name: String, index: Option<Vec<Part>> },
    Script(String),
    Quoted(Vec<Part>),
    Braced(String),

    // Arithmetic
    Plus,
    Minus,
    Star,
    StarStar,
    Slash,
    Percent,
    Bang,
    Tilde,
    Ampersand,
    Pipe,
    Caret,
    ShiftLeft,
    ShiftRight,

    // Comparison
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    StrEq,
    StrNe,
    In,
    Ni,

    // Logical
    And,
    Or,

    // Misc
    Question,
    Colon,
    Comma,
    LParen,
    RParen,
    Unknown(char),
    Eof,
}

// ── Lexer ─────────────────────────────────────────────────────────────────────

struct Lexer<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Lexer { src, pos: 0 }
    }

    fn peek(&self) -> Option<u8> {
        self.src.as_bytes().get(self.pos).copied()
    }

    fn peek2(&self) -> Option<u8> {
        self.src.as_bytes().get(self.pos + 1).copied()
    }

    fn eat(&mut self, ch: u8) -> bool {
        if self.peek() == Some(ch) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t' | b'\n' | b'\r')) {
            self.pos += 1;
        }
    }

    fn take_while(&mut self, pred: impl Fn(u8) -> bool) -> &'a str {
        let start = self.pos;
        while self.peek().is_some_and(&pred) {
            self.pos += 1;
        }
        &self.src[start..self.pos]
    }

    fn read_number(&mut self) -> Result<Token, String> {
        let start = self.pos;
        if self.peek() == Some(b'0') && matches!(self.peek2(), Some(b'x' | b'X' | b'o' | b'O' | b'b' | b'B')) {
            self.pos += 2;
            self.take_while(|b| b.is_ascii_hexdigit());
        } else {
            self.take_while(|b| b.is_ascii_digit());
            if self.peek() == Some(b'.') {
                self.pos += 1;
                self.take_while(|b| b.is_ascii_digit());
            }
            if matches!(self.peek(), Some(b'e' | b'E')) {
                self.pos += 1;
                if matches!(self.peek(), Some(b'+' | b'-')) {
                    self.pos += 1;
                }
                self.take_while(|b| b.is_ascii_digit());
            }
        }
        let text = &self.src[start..self.pos];
        if let Some(i) = parse_int(text) {
            Ok(Token::Int(i))
        } else if let Some(d) = parse_double(text) {
            Ok(Token::Float(d))
        } else {
            Err(format!("invalid number \"{text}\""))
        }
    }

    fn read_word(&mut self) -> Token {
        let word = self.take_while(|b| b.is_ascii_alphanumeric() || b == b'_');
        match word {
            "eq" => Token::StrEq,
            "ne" => Token::StrNe,
            "in" => Token::In,
            "ni" => Token::Ni,
            _ => Token::Word(word.to_owned()),
        }
    }

    /// Hand `$`, `[`, `"` and `{` to the script parser.
    fn embedded<T>(
        &mut self,
        scan: impl FnOnce(&mut ScriptParser<'a>) -> Result<T, String>,
    ) -> Result<T, String> {
        let mut parser = ScriptParser::at(self.src, self.pos);
        let out = scan(&mut parser)?;
        self.pos = parser.pos();
        Ok(out)
    }

    fn next_token(&mut self) -> Result<Token, String> {
        self.skip_ws();
        let Some(ch) = self.peek() else {
            return Ok(Token::Eof);
        };

        let token = match ch {
            b'0'..=b'9' => return self.read_number(),
            b'.' if self.peek2().is_some_and(|b| b.is_ascii_digit()) => return self.read_number(),
            b'a'..=b'z' | b'A'..=b'Z' | b'_' => return Ok(self.read_word()),
            b'$' => {
                return match self.embedded(|p| p.variable())? {
                    Some(Part::Var { name, index }) => Ok(Token::Var { name, index }),
                    _ => Err("invalid character \"$\"".into()),
                };
            }
            b'[' => return Ok(Token::Script(self.embedded(|p| p.command_substitution())?)),
            b'"' => return Ok(Token::Quoted(self.embedded(|p| p.quoted())?)),
            b'{' => return Ok(Token::Braced(self.embedded(|p| p.braced())?)),
            b'+' => Token::Plus,
            b'-' => Token::Minus,
            b'*' => {
                self.pos += 1;
                if self.eat(b'*') {
                    return Ok(Token::StarStar);
                }
                return Ok(Token::Star);
            }
            b'/' => Token::Slash,
            b'%' => Token::Percent,
            b'~' => Token::Tilde,
            b'^' => Token::Caret,
            b'?' => Token::Question,
            b':' => Token::Colon,
            b',' => Token::Comma,
            b'(' => Token::LParen,
            b')' => Token::RParen,
            b'!' | b'=' | b'<' | b'>' | b'&' | b'|' => {
                self.pos += 1;
                return Ok(match ch {
                    b'!' if self.eat(b'=') => Token::Ne,
                    b'!' => Token::Bang,
                    b'=' if self.eat(b'=') => Token::Eq,
                    b'=' => Token::Unknown('='),
                    b'<' if self.eat(b'<') => Token::ShiftLeft,
                    b'<' if self.eat(b'=') => Token::Le,
                    b'<' => Token::Lt,
                    b'>' if self.eat(b'>') => Token::ShiftRight,
                    b'>' if self.eat(b'=') => Token::Ge,
                    b'>' => Token::Gt,
                    b'&' if self.eat(b'&') => Token::And,
                    b'&' => Token::Ampersand,
                    b'|' if self.eat(b'|') => Token::Or,
                    _ => Token::Pipe,
                });
            }
            _ => {
                let c = self.src[self.pos..].chars().next().unwrap_or('\0');
                self.pos += c.len_utf8();
                return Ok(Token::Unknown(c));
            }
        };
        self.pos += 1;
        Ok(token)
    }

    fn tokenize(mut self) -> Result<Vec<Token>, String> {
        let mut tokens = Vec::new();
        loop {
            let t = self.next_token()?;
            let done = matches!(t, Token::Eof);
            tokens.push(t);
            if done {
                return Ok(tokens);
            }
        }
    }
}

// ── AST ───────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Pow,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    StrEq,
    StrNe,
    In,
    Ni,
    And,
    Or,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
}

impl BinOp {
    fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Rem => "%",
            BinOp::Pow => "**",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::StrEq => "eq",
            BinOp::StrNe => "ne",
            BinOp::In => "in",
            BinOp::Ni => "ni",
            BinOp::And => "&&",
            BinOp::Or => "||",
            BinOp::BitAnd => "&",
            BinOp::BitOr => "|",
            BinOp::BitXor => "^",
            BinOp::Shl => "<<",
            BinOp::Shr => ">>",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UnaryOp {
    Neg,
    Plus,
    Not,
    BitNot,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Operand),
    Var { name: String, index: Option<Vec<Part>> },
    Script(String),
    Quoted(Vec<Part>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Ternary(Box<Expr>, Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
}

// ── Parser ────────────────────────────────────────────────────────────────────

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Parser { tokens, pos: 0 }
    }

    fn peek(&self) -> &Token {
        self.tokens.get(self.pos).unwrap_or(&Token::Eof)
    }

    fn advance(&mut self) -> Token {
        let t = self.tokens.get(self.pos).cloned().unwrap_or(Token::Eof);
        self.pos += 1;
        t
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == expected {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    /// Left-associative binary level.
    fn binary_level(
        &mut self,
        ops: &[(Token, BinOp)],
        next: fn(&mut Parser) -> Result<Expr, String>,
    ) -> Result<Expr, String> {
        let mut lhs = next(self)?;
        'outer: loop {
            for (tok, op) in ops {
                if self.eat(tok) {
                    let rhs = next(self)?;
                    lhs = Expr::Binary(*op, Box::new(lhs), Box::new(rhs));
                    continue 'outer;
                }
            }
            return Ok(lhs);
        }
    }

    // ── Grammar ───────────────────────────────────────────────────────────────

    fn parse_expr(&mut self) -> Result<Expr, String> {
        self.parse_ternary()
    }

    fn parse_ternary(&mut self) -> Result<Expr, String> {
        let cond = self.parse_or()?;
        if self.eat(&Token::Question) {
            let then = self.parse_ternary()?;
            if !self.eat(&Token::Colon) {
                return Err("missing operator \":\" in ternary conditional".into());
            }
            let else_ = self.parse_ternary()?;
            Ok(Expr::Ternary(Box::new(cond), Box::new(then), Box::new(else_)))
        } else {
            Ok(cond)
        }
    }

    fn parse_or(&mut self) -> Result<Expr, String> {
        self.binary_level(&[(Token::Or, BinOp::Or)], Parser::parse_and)
    }

    fn parse_and(&mut self) -> Result<Expr, String> {
        self.binary_level(&[(Token::And, BinOp::And)], Parser::parse_bitor)
    }

    fn parse_bitor(&mut self) -> Result<Expr, String> {
        self.binary_level(&[(Token::Pipe, BinOp::BitOr)], Parser::parse_bitxor)
    }

    fn parse_bitxor(&mut self) -> Result<Expr, String> {
        self.binary_level(&[(Token::Caret, BinOp::BitXor)], Parser::parse_bitand)
    }

    fn parse_bitand(&mut self) -> Result<Expr, String> {
        self.binary_level(&[(Token::Ampersand, BinOp::BitAnd)], Parser::parse_equality)
    }

    fn parse_equality(&mut self) -> Result<Expr, String> {
        self.binary_level(
            &[
                (Token::Eq, BinOp::Eq),
                (Token::Ne, BinOp::Ne),
                (Token::StrEq, BinOp::StrEq),
                (Token::StrNe, BinOp::StrNe),
                (Token::In, BinOp::In),
                (Token::Ni, BinOp::Ni),
            ],
            Parser::parse_relational,
        )
    }

    fn parse_relational(&mut self) -> Result<Expr, String> {
        self.binary_level(
            &[
                (Token::Le, BinOp::Le),
                (Token::Ge, BinOp::Ge),
                (Token::Lt, BinOp::Lt),
                (Token::Gt, BinOp::Gt),
            ],
            Parser::parse_shift,
        )
    }

    fn parse_shift(&mut self) -> Result<Expr, String> {
        self.binary_level(
            &[(Token::ShiftLeft, BinOp::Shl), (Token::ShiftRight, BinOp::Shr)],
            Parser::parse_additive,
        )
    }

    fn parse_additive(&mut self) -> Result<Expr, String> {
        self.binary_level(
            &[(Token::Plus, BinOp::Add), (Token::Minus, BinOp::Sub)],
            Parser::parse_multiplicative,
        )
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, String> {
        self.binary_level(
            &[
                (Token::Star, BinOp::Mul),
                (Token::Slash, BinOp::Div),
                (Token::Percent, BinOp::Rem),
            ],
            Parser::parse_unary,
        )
    }

    fn parse_unary(&mut self) -> Result<Expr, String> {
        ensure_sufficient_stack(|| self.parse_unary_inner())
    }

    fn parse_unary_inner(&mut self) -> Result<Expr, String> {
        let op = match self.peek() {
            Token::Minus => UnaryOp::Neg,
            Token::Plus => UnaryOp::Plus,
            Token::Bang => UnaryOp::Not,
            Token::Tilde => UnaryOp::BitNot,
            _ => return self.parse_power(),
        };
        self.pos += 1;
        Ok(Expr::Unary(op, Box::new(self.parse_unary()?)))
    }

    /// `**` is right-associative and binds tighter than unary minus on
    /// its right: `2 ** -1` parses, `-2 ** 2` is `(-2) ** 2`.
    fn parse_power(&mut self) -> Result<Expr, String> {
        let base = self.parse_primary()?;
        if self.eat(&Token::StarStar) {
            let exponent = self.parse_unary()?;
            return Ok(Expr::Binary(BinOp::Pow, Box::new(base), Box::new(exponent)));
        }
        Ok(base)
    }

    fn parse_primary(&mut self) -> Result<Expr, String> {
        match self.advance() {
            Token::Int(n) => Ok(Expr::Literal(Operand::Int(n))),
            Token::Float(x) => Ok(Expr::Literal(Operand::Double(x))),
            Token::Braced(text) => Ok(Expr::Literal(Operand::from_text(&text))),
            Token::Quoted(parts) => Ok(Expr::Quoted(parts)),
            Token::Var { name, index } => Ok(Expr::Var { name, index }),
            Token::Script(script) => Ok(Expr::Script(script)),
            Token::Word(name) => {
                if self.eat(&Token::LParen) {
                    let mut args = Vec::new();
                    if self.peek() != &Token::RParen {
                        args.push(self.parse_expr()?);
                        while self.eat(&Token::Comma) {
                            args.push(self.parse_expr()?);
                        }
                    }
                    if !self.eat(&Token::RParen) {
                        return Err(format!("missing close parenthesis in call to \"{name}\""));
                    }
                    Ok(Expr::Call(name, args))
                } else if parse_boolean(&name).is_some() || matches!(name.as_str(), "Inf" | "NaN") {
                    Ok(Expr::Literal(Operand::from_text(&name)))
                } else {
                    Err(format!("invalid bare word \"{name}\""))
                }
            }
            Token::LParen => {
                let inner = self.parse_expr()?;
                if !self.eat(&Token::RParen) {
                    return Err("unbalanced open paren".into());
                }
                Ok(inner)
            }
            Token::Eof => Err("missing operand at end of expression".into()),
            Token::Unknown(c) => Err(format!("invalid character \"{c}\"")),
            other => Err(format!("missing operand before {other:?}")),
        }
    }
}

/// Parse an expression string into an AST.
pub fn parse_expr(src: &str) -> Result<Expr, String> {
    let tokens = Lexer::new(src).tokenize()?;
    let mut parser = Parser::new(tokens);
    let expr = parser.parse_expr()?;
    match parser.peek() {
        Token::Eof => Ok(expr),
        Token::RParen => Err("unbalanced close paren".into()),
        other => Err(format!("extra tokens at end of expression: {other:?}")),
    }
}

// ── Evaluator ─────────────────────────────────────────────────────────────────

/// Evaluate an [`Expr`] AST node against the given context.
pub fn eval_expr(expr: &Expr, ctx: &dyn ExprContext) -> Result<Operand, Failure> {
    ensure_sufficient_stack(|| eval_node(expr, ctx))
}

fn eval_node(expr: &Expr, ctx: &dyn ExprContext) -> Result<Operand, Failure> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Var { name, index } => Ok(Operand::from_text(&ctx.variable(name, index.as_deref())?)),
        Expr::Script(script) => Ok(Operand::from_text(&ctx.command(script)?)),
        Expr::Quoted(parts) => Ok(Operand::from_text(&ctx.substitute(parts)?)),

        Expr::Unary(op, inner) => {
            let v = eval_expr(inner, ctx)?;
            match op {
                UnaryOp::Neg => Ok(match v.num("-")? {
                    Num::I(i) => Operand::Int(i.wrapping_neg()),
                    Num::D(d) => Operand::Double(-d),
                }),
                UnaryOp::Plus => v.num("+").map(|_| v),
                UnaryOp::Not => Ok(flag(!v.truth()?)),
                UnaryOp::BitNot => Ok(Operand::Int(!v.int("~")?)),
            }
        }

        Expr::Binary(BinOp::And, lhs, rhs) => {
            if !eval_expr(lhs, ctx)?.truth()? {
                return Ok(flag(false));
            }
            Ok(flag(eval_expr(rhs, ctx)?.truth()?))
        }
        Expr::Binary(BinOp::Or, lhs, rhs) => {
            if eval_expr(lhs, ctx)?.truth()? {
                return Ok(flag(true));
            }
            Ok(flag(eval_expr(rhs, ctx)?.truth()?))
        }
        Expr::Binary(op, lhs, rhs) => {
            let l = eval_expr(lhs, ctx)?;
            let r = eval_expr(rhs, ctx)?;
            eval_binop(*op, &l, &r)
        }

        Expr::Ternary(cond, then, else_) => {
            if eval_expr(cond, ctx)?.truth()? {
                eval_expr(then, ctx)
            } else {
                eval_expr(else_, ctx)
            }
        }

        Expr::Call(name, arg_exprs) => {
            let mut args = Vec::with_capacity(arg_exprs.len());
            for ae in arg_exprs {
                args.push(eval_expr(ae, ctx)?);
            }
            call_function(name, &args)
        }
    }
}

fn message(text: impl Into<String>) -> Failure {
    Failure::Message(text.into())
}

fn compare(l: &Operand, r: &Operand) -> Ordering {
    match (l, r) {
        (Operand::Int(a), Operand::Int(b)) => a.cmp(b),
        (Operand::Str(_), _) | (_, Operand::Str(_)) => l.to_text().cmp(&r.to_text()),
        _ => {
            let a = l.float("<").unwrap_or(f64::NAN);
            let b = r.float("<").unwrap_or(f64::NAN);
            a.partial_cmp(&b).unwrap_or(Ordering::Less)
        }
    }
}

fn eval_binop(op: BinOp, l: &Operand, r: &Operand) -> Result<Operand, Failure> {
    let sym = op.symbol();
    match op {
        BinOp::Add | BinOp::Sub | BinOp::Mul => Ok(match (l.num(sym)?, r.num(sym)?) {
            (Num::I(a), Num::I(b)) => Operand::Int(match op {
                BinOp::Add => a.wrapping_add(b),
                BinOp::Sub => a.wrapping_sub(b),
                _ => a.wrapping_mul(b),
            }),
            _ => {
                let (a, b) = (l.float(sym)?, r.float(sym)?);
                Operand::Double(match op {
                    BinOp::Add => a + b,
                    BinOp::Sub => a - b,
                    _ => a * b,
                })
            }
        }),

        BinOp::Div => match (l.num(sym)?, r.num(sym)?) {
            (Num::I(_), Num::I(0)) => Err(message("divide by zero")),
            (Num::I(a), Num::I(b)) => {
                let q = a.wrapping_div(b);
                let floor = if a.wrapping_rem(b) != 0 && ((a < 0) != (b < 0)) { q - 1 } else { q };
                Ok(Operand::Int(floor))
            }
            _ => Ok(Operand::Double(l.float(sym)? / r.float(sym)?)),
        },

        BinOp::Rem => {
            let (a, b) = (l.int(sym)?, r.int(sym)?);
            if b == 0 {
                return Err(message("divide by zero"));
            }
            let m = a.wrapping_rem(b);
            Ok(Operand::Int(if m != 0 && ((m < 0) != (b < 0)) { m + b } else { m }))
        }

        BinOp::Pow => match (l.num(sym)?, r.num(sym)?) {
            (Num::I(base), Num::I(exp)) => int_pow(base, exp).map(Operand::Int),
            _ => Ok(Operand::Double(l.float(sym)?.powf(r.float(sym)?))),
        },

        BinOp::Eq => Ok(flag(compare(l, r) == Ordering::Equal)),
        BinOp::Ne => Ok(flag(compare(l, r) != Ordering::Equal)),
        BinOp::Lt => Ok(flag(compare(l, r) == Ordering::Less)),
        BinOp::Le => Ok(flag(compare(l, r) != Ordering::Greater)),
        BinOp::Gt => Ok(flag(compare(l, r) == Ordering::Greater)),
        BinOp::Ge => Ok(flag(compare(l, r) != Ordering::Less)),
        BinOp::StrEq => Ok(flag(l.to_text() == r.to_text())),
        BinOp::StrNe => Ok(flag(l.to_text() != r.to_text())),

        BinOp::In | BinOp::Ni => {
            let needle = l.to_text();
            let found = list::split(&r.to_text())
                .map_err(Failure::Message)?
                .iter()
                .any(|item| *item == needle);
            Ok(flag(found == (op == BinOp::In)))
        }

        BinOp::BitAnd => Ok(Operand::Int(l.int(sym)? & r.int(sym)?)),
        BinOp::BitOr => Ok(Operand::Int(l.int(sym)? | r.int(sym)?)),
        BinOp::BitXor => Ok(Operand::Int(l.int(sym)? ^ r.int(sym)?)),
        BinOp::Shl => Ok(Operand::Int(l.int(sym)?.wrapping_shl(r.int(sym)? as u32 & 63))),
        BinOp::Shr => Ok(Operand::Int(l.int(sym)? >> (r.int(sym)? & 63))),

        BinOp::And => Ok(flag(l.truth()? && r.truth()?)),
        BinOp::Or => Ok(flag(l.truth()? || r.truth()?)),
    }
}

fn int_pow(base: i64, exp: i64) -> Result<i64, Failure> {
    if exp >= 0 {
        let exp = u32::try_from(exp).unwrap_or(u32::MAX);
        return Ok(base.wrapping_pow(exp));
    }
    match base {
        0 => Err(message("exponentiation of zero by negative power")),
        1 => Ok(1),
        -1 => Ok(if exp % 2 == 0 { 1 } else { -1 }),
        _ => Ok(0),
    }
}

fn call_function(name: &str, args: &[Operand]) -> Result<Operand, Failure> {
    let arity = |n: usize| -> Result<(), Failure> {
        match args.len().cmp(&n) {
            Ordering::Less => Err(message(format!("too few arguments for math function \"{name}\""))),
            Ordering::Greater => Err(message(format!("too many arguments for math function \"{name}\""))),
            Ordering::Equal => Ok(()),
        }
    };
    let unary_float = |f: fn(f64) -> f64| -> Result<Operand, Failure> {
        arity(1)?;
        Ok(Operand::Double(f(args[0].float(name)?)))
    };

    match name {
        "abs" => {
            arity(1)?;
            Ok(match args[0].num(name)? {
                Num::I(i) => Operand::Int(i.wrapping_abs()),
                Num::D(d) => Operand::Double(d.abs()),
            })
        }
        "int" => {
            arity(1)?;
            Ok(Operand::Int(match args[0].num(name)? {
                Num::I(i) => i,
                Num::D(d) => d.trunc() as i64,
            }))
        }
        "round" => {
            arity(1)?;
            Ok(Operand::Int(match args[0].num(name)? {
                Num::I(i) => i,
                Num::D(d) => d.round() as i64,
            }))
        }
        "double" => unary_float(|d| d),
        "floor" => unary_float(f64::floor),
        "ceil" => unary_float(f64::ceil),
        "sqrt" => unary_float(f64::sqrt),
        "min" | "max" => {
            if args.is_empty() {
                return Err(message(format!("too few arguments for math function \"{name}\"")));
            }
            let want = if name == "min" { Ordering::Less } else { Ordering::Greater };
            let mut best = &args[0];
            best.num(name)?;
            for arg in &args[1..] {
                arg.num(name)?;
                if compare(arg, best) == want {
                    best = arg;
                }
            }
            Ok(best.clone())
        }
        _ => Err(message(format!("unknown math function \"{name}\""))),
    }
}

/// Convenience: parse and evaluate an expression string.
pub fn eval_str(src: &str, ctx: &dyn ExprContext) -> Result<Operand, Failure> {
    let expr = parse_expr(src).map_err(Failure::Message)?;
    eval_expr(&expr, ctx)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
