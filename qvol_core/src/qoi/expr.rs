//! Single-variable expressions for the symbolic QoI, e.g. `x^2`, `1/x`,
//! `3*x + sqrt(x)`.

use std::fmt;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExprError {
    #[error("unexpected character {0:?} at {1}")]
    UnexpectedChar(char, usize),
    #[error("unexpected end of expression")]
    UnexpectedEnd,
    #[error("unexpected token at {0}")]
    UnexpectedToken(usize),
    #[error("unknown function {0:?}")]
    UnknownFunction(String),
    #[error("bad number {0:?}")]
    BadNumber(String),
    #[error("expression nests deeper than {0} levels")]
    TooDeep(usize),
    #[error("expression has more than {0} tokens")]
    TooLong(usize),
}

/// Nesting limit for parentheses, calls, unary minus and `^`.
pub const MAX_DEPTH: usize = 64;
/// Bounds the depth of left-associative chains like `x+x+...+x`.
pub const MAX_TOKENS: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Func {
    Sqrt,
    Exp,
    Ln,
    Abs,
    Sin,
    Cos,
}

impl Func {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "sqrt" => Func::Sqrt,
            "exp" => Func::Exp,
            "ln" | "log" => Func::Ln,
            "abs" => Func::Abs,
            "sin" => Func::Sin,
            "cos" => Func::Cos,
            _ => return None,
        })
    }

    fn apply(self, v: f64) -> f64 {
        match self {
            Func::Sqrt => v.sqrt(),
            Func::Exp => v.exp(),
            Func::Ln => v.ln(),
            Func::Abs => v.abs(),
            Func::Sin => v.sin(),
            Func::Cos => v.cos(),
        }
    }

    fn name(self) -> &'static str {
        match self {
            Func::Sqrt => "sqrt",
            Func::Exp => "exp",
            Func::Ln => "ln",
            Func::Abs => "abs",
            Func::Sin => "sin",
            Func::Cos => "cos",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Var,
    Const(f64),
    Neg(Box<Expr>),
    Add(Box<Expr>, Box<Expr>),
    Sub(Box<Expr>, Box<Expr>),
    Mul(Box<Expr>, Box<Expr>),
    Div(Box<Expr>, Box<Expr>),
    Pow(Box<Expr>, Box<Expr>),
    Call(Func, Box<Expr>),
}

/// Expression shapes with a closed-form error bound.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Shape {
    Linear(f64),
    Square,
    Reciprocal,
    Ln,
}

impl Expr {
    pub fn parse(text: &str) -> Result<Self, ExprError> {
        let tokens = tokenize(text)?;
        if tokens.len() > MAX_TOKENS {
            return Err(ExprError::TooLong(MAX_TOKENS));
        }
        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
        };
        let expr = parser.expr()?;
        match parser.tokens.get(parser.pos) {
            None => Ok(expr),
            Some((_, at)) => Err(ExprError::UnexpectedToken(*at)),
        }
    }

    pub fn eval(&self, x: f64) -> f64 {
        match self {
            Expr::Var => x,
            Expr::Const(c) => *c,
            Expr::Neg(a) => -a.eval(x),
            Expr::Add(a, b) => a.eval(x) + b.eval(x),
            Expr::Sub(a, b) => a.eval(x) - b.eval(x),
            Expr::Mul(a, b) => a.eval(x) * b.eval(x),
            Expr::Div(a, b) => a.eval(x) / b.eval(x),
            Expr::Pow(a, b) => {
                let base = a.eval(x);
                match **b {
                    Expr::Const(e) if e.fract() == 0.0 && e.abs() <= i32::MAX as f64 => {
                        base.powi(e as i32)
                    }
                    _ => base.powf(b.eval(x)),
                }
            }
            Expr::Call(f, a) => f.apply(a.eval(x)),
        }
    }

    /// Recognise the handful of shapes that have a closed-form bound.
    pub fn shape(&self) -> Option<Shape> {
        match self {
            Expr::Var => Some(Shape::Linear(1.0)),
            Expr::Mul(a, b) => match (&**a, &**b) {
                (Expr::Const(c), Expr::Var) | (Expr::Var, Expr::Const(c)) => {
                    Some(Shape::Linear(*c))
                }
                (Expr::Var, Expr::Var) => Some(Shape::Square),
                _ => None,
            },
            Expr::Pow(a, b) => match (&**a, &**b) {
                (Expr::Var, Expr::Const(e)) if *e == 2.0 => Some(Shape::Square),
                (Expr::Var, Expr::Const(e)) if *e == 1.0 => Some(Shape::Linear(1.0)),
                (Expr::Var, Expr::Const(e)) if *e == -1.0 => Some(Shape::Reciprocal),
                _ => None,
            },
            Expr::Div(a, b) => match (&**a, &**b) {
                (Expr::Const(c), Expr::Var) if *c == 1.0 => Some(Shape::Reciprocal),
                (Expr::Var, Expr::Const(c)) if *c != 0.0 => Some(Shape::Linear(1.0 / c)),
                _ => None,
            },
            Expr::Call(Func::Ln, a) if **a == Expr::Var => Some(Shape::Ln),
            _ => None,
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Var => write!(f, "x"),
            Expr::Const(c) => write!(f, "{c}"),
            Expr::Neg(a) => write!(f, "-({a})"),
            Expr::Add(a, b) => write!(f, "({a} + {b})"),
            Expr::Sub(a, b) => write!(f, "({a} - {b})"),
            Expr::Mul(a, b) => write!(f, "({a} * {b})"),
            Expr::Div(a, b) => write!(f, "({a} / {b})"),
            Expr::Pow(a, b) => write!(f, "({a})^({b})"),
            Expr::Call(func, a) => write!(f, "{}({a})", func.name()),
        }
    }
}

// ── lexer ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Num(f64),
    Ident(String),
    Op(char),
    LParen,
    RParen,
}

fn tokenize(text: &str) -> Result<Vec<(Tok, usize)>, ExprError> {
    let chars: Vec<char> = text.chars().collect();
    let mut out = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' => i += 1,
            '+' | '-' | '*' | '/' | '^' => {
                out.push((Tok::Op(c), i));
                i += 1;
            }
            '(' => {
                out.push((Tok::LParen, i));
                i += 1;
            }
            ')' => {
                out.push((Tok::RParen, i));
                i += 1;
            }
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                // scientific notation: 1e-3, 2.5E+4
                if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
                    let mut j = i + 1;
                    if j < chars.len() && (chars[j] == '+' || chars[j] == '-') {
                        j += 1;
                    }
                    if j < chars.len() && chars[j].is_ascii_digit() {
                        i = j;
                        while i < chars.len() && chars[i].is_ascii_digit() {
                            i += 1;
                        }
                    }
                }
                let s: String = chars[start..i].iter().collect();
                let v = s.parse::<f64>().map_err(|_| ExprError::BadNumber(s))?;
                out.push((Tok::Num(v), start));
            }
            c if c.is_ascii_alphabetic() => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                out.push((Tok::Ident(chars[start..i].iter().collect()), start));
            }
            other => return Err(ExprError::UnexpectedChar(other, i)),
        }
    }
    Ok(out)
}

// ── parser ─────────────────────────────────────────────────────────────────
//
//   expr  := term (('+' | '-') term)*
//   term  := unary (('*' | '/') unary)*
//   unary := '-' unary | power
//   power := atom ('^' unary)?
//   atom  := number | 'x' | ident '(' expr ')' | '(' expr ')'

struct Parser {
    tokens: Vec<(Tok, usize)>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn next(&mut self) -> Result<(Tok, usize), ExprError> {
        let tok = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or(ExprError::UnexpectedEnd)?;
        self.pos += 1;
        Ok(tok)
    }

    fn expect(&mut self, want: Tok) -> Result<(), ExprError> {
        let (tok, at) = self.next()?;
        if tok == want {
            Ok(())
        } else {
            Err(ExprError::UnexpectedToken(at))
        }
    }

    fn expr(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.term()?;
        while let Some(Tok::Op(op @ ('+' | '-'))) = self.peek().cloned() {
            self.pos += 1;
            let rhs = self.term()?;
            lhs = if op == '+' {
                Expr::Add(Box::new(lhs), Box::new(rhs))
            } else {
                Expr::Sub(Box::new(lhs), Box::new(rhs))
            };
        }
        Ok(lhs)
    }

    fn term(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.unary()?;
        while let Some(Tok::Op(op @ ('*' | '/'))) = self.peek().cloned() {
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = if op == '*' {
                Expr::Mul(Box::new(lhs), Box::new(rhs))
            } else {
                Expr::Div(Box::new(lhs), Box::new(rhs))
            };
        }
        Ok(lhs)
    }

    // every recursive path passes through here
    fn unary(&mut self) -> Result<Expr, ExprError> {
        if self.depth == MAX_DEPTH {
            return Err(ExprError::TooDeep(MAX_DEPTH));
        }
        self.depth += 1;
        let out = self.unary_inner();
        self.depth -= 1;
        out
    }

    fn unary_inner(&mut self) -> Result<Expr, ExprError> {
        if let Some(Tok::Op('-')) = self.peek() {
            self.pos += 1;
            return Ok(match self.unary()? {
                Expr::Const(c) => Expr::Const(-c),
                e => Expr::Neg(Box::new(e)),
            });
        }
        self.power()
    }

    fn power(&mut self) -> Result<Expr, ExprError> {
        let base = self.atom()?;
        if let Some(Tok::Op('^')) = self.peek() {
            self.pos += 1;
            let exp = self.unary()?;
            return Ok(Expr::Pow(Box::new(base), Box::new(exp)));
        }
        Ok(base)
    }

    fn atom(&mut self) -> Result<Expr, ExprError> {
        let (tok, at) = self.next()?;
        match tok {
            Tok::Num(v) => Ok(Expr::Const(v)),
            Tok::Ident(name) if name == "x" => Ok(Expr::Var),
            Tok::Ident(name) => {
                let func = Func::from_name(&name).ok_or(ExprError::UnknownFunction(name))?;
                self.expect(Tok::LParen)?;
                let arg = self.expr()?;
                self.expect(Tok::RParen)?;
                Ok(Expr::Call(func, Box::new(arg)))
            }
            Tok::LParen => {
                let inner = self.expr()?;
                self.expect(Tok::RParen)?;
                Ok(inner)
            }
            _ => Err(ExprError::UnexpectedToken(at)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precedence_and_associativity() {
        let e = Expr::parse("1 + 2*x^2").unwrap();
        assert_eq!(e.eval(3.0), 19.0);
        let e = Expr::parse("-x^2").unwrap();
        assert_eq!(e.eval(3.0), -9.0);
        let e = Expr::parse("2^3^2").unwrap();
        assert_eq!(e.eval(0.0), 512.0);
        let e = Expr::parse("(x - 1) / (x + 1)").unwrap();
        assert_eq!(e.eval(3.0), 0.5);
    }

    #[test]
    fn functions_and_scientific_numbers() {
        let e = Expr::parse("sqrt(x) + ln(exp(2.5e-1))").unwrap();
        assert!((e.eval(16.0) - 4.25).abs() < 1e-12);
    }

    #[test]
    fn recognises_closed_form_shapes() {
        assert_eq!(Expr::parse("x").unwrap().shape(), Some(Shape::Linear(1.0)));
        assert_eq!(Expr::parse("4 * x").unwrap().shape(), Some(Shape::Linear(4.0)));
        assert_eq!(Expr::parse("x^2").unwrap().shape(), Some(Shape::Square));
        assert_eq!(Expr::parse("1/x").unwrap().shape(), Some(Shape::Reciprocal));
        assert_eq!(Expr::parse("log(x)").unwrap().shape(), Some(Shape::Ln));
        assert_eq!(Expr::parse("x^3").unwrap().shape(), None);
    }

    #[test]
    fn rejects_malformed_input() {
        assert_eq!(Expr::parse("x +"), Err(ExprError::UnexpectedEnd));
        assert!(matches!(Expr::parse("foo(x)"), Err(ExprError::UnknownFunction(_))));
        assert!(matches!(Expr::parse("x $ 2"), Err(ExprError::UnexpectedChar('$', 2))));
        assert!(matches!(Expr::parse("x x"), Err(ExprError::UnexpectedToken(2))));
    }

    #[test]
    fn nesting_is_capped() {
        let nested = |n: usize| format!("{}x{}", "(".repeat(n), ")".repeat(n));
        assert_eq!(Expr::parse(&nested(40)).unwrap().eval(2.0), 2.0);
        assert_eq!(Expr::parse(&nested(1000)), Err(ExprError::TooDeep(MAX_DEPTH)));
        let negated = format!("{}x", "-".repeat(1000));
        assert_eq!(Expr::parse(&negated), Err(ExprError::TooDeep(MAX_DEPTH)));
        let tower = vec!["2"; 1000].join("^");
        assert_eq!(Expr::parse(&tower), Err(ExprError::TooDeep(MAX_DEPTH)));
        let calls = format!("{}x{}", "sqrt(".repeat(1000), ")".repeat(1000));
        assert_eq!(Expr::parse(&calls), Err(ExprError::TooDeep(MAX_DEPTH)));
    }

    #[test]
    fn long_chains_are_capped() {
        let chain = vec!["x"; 1000].join("+");
        assert_eq!(Expr::parse(&chain).unwrap().eval(1.0), 1000.0);
        let chain = vec!["x"; MAX_TOKENS].join("+");
        assert_eq!(Expr::parse(&chain), Err(ExprError::TooLong(MAX_TOKENS)));
    }
}
