//! String-defined rules: tokenizer, recursive-descent parser, bytecode
//! compiler and a small stack VM.
//!
//! Names are resolved to state/parameter indices once, at compile time. The
//! identifier `t` reads the current time unless a state or parameter shadows it.

use crate::autodiff::Dual;
use crate::error::EvolutionResult;
use crate::params::{ParamKey, ParameterSet};
use crate::traits::{DynamicalSystem, Scalar};
use std::cell::RefCell;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EquationError {
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Unknown variable or parameter: {0}")]
    UnknownIdentifier(String),

    #[error("Unknown function: {0}")]
    UnknownFunction(String),

    #[error("Expected {expected} equations (one per state variable), got {got}")]
    EquationCount { expected: usize, got: usize },

    #[error("Expected {expected} parameter values, got {got}")]
    ParameterCount { expected: usize, got: usize },
}

/// OpCodes for the stack VM. Every op pops its operands and pushes one value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OpCode {
    LoadConst(f64),
    /// State variable by index.
    LoadVar(usize),
    /// Parameter by index.
    LoadParam(usize),
    LoadTime,
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Neg,
    Sin,
    Cos,
    Tan,
    Exp,
    Ln,
    Sqrt,
    Abs,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bytecode {
    pub ops: Vec<OpCode>,
}

pub struct VM;

impl VM {
    /// Runs `bytecode` against the given state, parameters and time, using
    /// `stack` as scratch. Bytecode from [`Compiler`] is always balanced; an
    /// unbalanced program evaluates to NaN.
    pub fn execute<T: Scalar>(
        bytecode: &Bytecode,
        vars: &[T],
        params: &[T],
        t: T,
        stack: &mut Vec<T>,
    ) -> T {
        stack.clear();

        for op in &bytecode.ops {
            let value = match *op {
                OpCode::LoadConst(v) => T::from_f64(v).unwrap_or_else(T::nan),
                OpCode::LoadVar(i) => vars[i],
                OpCode::LoadParam(i) => params[i],
                OpCode::LoadTime => t,
                OpCode::Add | OpCode::Sub | OpCode::Mul | OpCode::Div | OpCode::Pow => {
                    let (Some(b), Some(a)) = (stack.pop(), stack.pop()) else {
                        return T::nan();
                    };
                    match op {
                        OpCode::Add => a + b,
                        OpCode::Sub => a - b,
                        OpCode::Mul => a * b,
                        OpCode::Div => a / b,
                        _ => pow(a, b),
                    }
                }
                unary => {
                    let Some(a) = stack.pop() else {
                        return T::nan();
                    };
                    match unary {
                        OpCode::Neg => -a,
                        OpCode::Sin => a.sin(),
                        OpCode::Cos => a.cos(),
                        OpCode::Tan => a.tan(),
                        OpCode::Exp => a.exp(),
                        OpCode::Ln => a.ln(),
                        OpCode::Sqrt => a.sqrt(),
                        _ => a.abs(),
                    }
                }
            };
            stack.push(value);
        }

        match (stack.pop(), stack.is_empty()) {
            (Some(result), true) => result,
            _ => T::nan(),
        }
    }
}

/// `a^b` with small integer exponents routed through `powi`, which stays
/// defined for negative bases.
fn pow<T: Scalar>(a: T, b: T) -> T {
    if let Some(n) = b.to_f64() {
        if n.fract() == 0.0 && n.abs() <= 64.0 && b == T::from_f64(n).unwrap_or_else(T::nan) {
            return a.powi(n as i32);
        }
    }
    a.powf(b)
}

// --- AST & Compiler ---

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Variable(String),
    /// Operator is one of `+ - * / ^`.
    Binary(Box<Expr>, char, Box<Expr>),
    Neg(Box<Expr>),
    Call(String, Box<Expr>),
}

/// Resolves names to indices and lowers [`Expr`] to [`Bytecode`].
pub struct Compiler {
    pub var_map: HashMap<String, usize>,
    pub param_map: HashMap<String, usize>,
}

impl Compiler {
    pub fn new(var_names: &[String], param_names: &[String]) -> Self {
        let index = |names: &[String]| {
            names
                .iter()
                .enumerate()
                .map(|(i, n)| (n.clone(), i))
                .collect::<HashMap<_, _>>()
        };
        Self {
            var_map: index(var_names),
            param_map: index(param_names),
        }
    }

    pub fn compile(&self, expr: &Expr) -> Result<Bytecode, EquationError> {
        let mut ops = Vec::new();
        self.lower(expr, &mut ops)?;
        Ok(Bytecode { ops })
    }

    fn lower(&self, expr: &Expr, ops: &mut Vec<OpCode>) -> Result<(), EquationError> {
        match expr {
            Expr::Number(n) => ops.push(OpCode::LoadConst(*n)),
            Expr::Variable(name) => {
                let op = if let Some(&i) = self.var_map.get(name) {
                    OpCode::LoadVar(i)
                } else if let Some(&i) = self.param_map.get(name) {
                    OpCode::LoadParam(i)
                } else if name == "t" {
                    OpCode::LoadTime
                } else {
                    return Err(EquationError::UnknownIdentifier(name.clone()));
                };
                ops.push(op);
            }
            Expr::Binary(left, op, right) => {
                self.lower(left, ops)?;
                self.lower(right, ops)?;
                ops.push(match op {
                    '+' => OpCode::Add,
                    '-' => OpCode::Sub,
                    '*' => OpCode::Mul,
                    '/' => OpCode::Div,
                    '^' => OpCode::Pow,
                    other => return Err(EquationError::Parse(format!("unknown operator '{other}'"))),
                });
            }
            Expr::Neg(operand) => {
                self.lower(operand, ops)?;
                ops.push(OpCode::Neg);
            }
            Expr::Call(func, arg) => {
                self.lower(arg, ops)?;
                ops.push(match func.as_str() {
                    "sin" => OpCode::Sin,
                    "cos" => OpCode::Cos,
                    "tan" => OpCode::Tan,
                    "exp" => OpCode::Exp,
                    "ln" | "log" => OpCode::Ln,
                    "sqrt" => OpCode::Sqrt,
                    "abs" => OpCode::Abs,
                    _ => return Err(EquationError::UnknownFunction(func.clone())),
                });
            }
        }
        Ok(())
    }
}

// --- Parser ---

/// Parses one expression; trailing input is an error.
pub fn parse(input: &str) -> Result<Expr, EquationError> {
    let tokens = tokenize(input)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_sum()?;
    match parser.peek() {
        None => Ok(expr),
        Some(token) => Err(EquationError::Parse(format!(
            "unexpected {token:?} after expression"
        ))),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Identifier(String),
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>, EquationError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c.is_ascii_digit() || c == '.' {
            let mut literal = String::new();
            while let Some(&d) = chars.peek() {
                let exponent_sign =
                    (d == '+' || d == '-') && literal.ends_with(['e', 'E']);
                if d.is_ascii_digit() || d == '.' || d == 'e' || d == 'E' || exponent_sign {
                    literal.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            let value = literal
                .parse()
                .map_err(|_| EquationError::Parse(format!("invalid number '{literal}'")))?;
            tokens.push(Token::Number(value));
        } else if c.is_alphabetic() || c == '_' {
            let mut ident = String::new();
            while let Some(&d) = chars.peek() {
                if d.is_alphanumeric() || d == '_' {
                    ident.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            tokens.push(Token::Identifier(ident));
        } else {
            tokens.push(match c {
                '+' => Token::Plus,
                '-' => Token::Minus,
                '*' => Token::Star,
                '/' => Token::Slash,
                '^' => Token::Caret,
                '(' => Token::LParen,
                ')' => Token::RParen,
                other => {
                    return Err(EquationError::Parse(format!(
                        "unexpected character '{other}'"
                    )))
                }
            });
            chars.next();
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn consume(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect_rparen(&mut self) -> Result<(), EquationError> {
        match self.consume() {
            Some(Token::RParen) => Ok(()),
            _ => Err(EquationError::Parse("expected ')'".to_string())),
        }
    }

    // sum := product (('+' | '-') product)*
    fn parse_sum(&mut self) -> Result<Expr, EquationError> {
        let mut left = self.parse_product()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => '+',
                Some(Token::Minus) => '-',
                _ => break,
            };
            self.consume();
            let right = self.parse_product()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    // product := unary (('*' | '/') unary)*
    fn parse_product(&mut self) -> Result<Expr, EquationError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => '*',
                Some(Token::Slash) => '/',
                _ => break,
            };
            self.consume();
            let right = self.parse_unary()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    // unary := '-' unary | power
    fn parse_unary(&mut self) -> Result<Expr, EquationError> {
        if let Some(Token::Minus) = self.peek() {
            self.consume();
            let operand = self.parse_unary()?;
            return Ok(Expr::Neg(Box::new(operand)));
        }
        self.parse_power()
    }

    // power := primary ('^' unary)?   (right associative, so -x^2 = -(x^2))
    fn parse_power(&mut self) -> Result<Expr, EquationError> {
        let base = self.parse_primary()?;
        if let Some(Token::Caret) = self.peek() {
            self.consume();
            let exponent = self.parse_unary()?;
            return Ok(Expr::Binary(Box::new(base), '^', Box::new(exponent)));
        }
        Ok(base)
    }

    fn parse_primary(&mut self) -> Result<Expr, EquationError> {
        match self.consume() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::Identifier(name)) => {
                if let Some(Token::LParen) = self.peek() {
                    self.consume();
                    let arg = self.parse_sum()?;
                    self.expect_rparen()?;
                    Ok(Expr::Call(name, Box::new(arg)))
                } else {
                    Ok(Expr::Variable(name))
                }
            }
            Some(Token::LParen) => {
                let expr = self.parse_sum()?;
                self.expect_rparen()?;
                Ok(expr)
            }
            Some(token) => Err(EquationError::Parse(format!("unexpected {token:?}"))),
            None => Err(EquationError::Parse("unexpected end of input".to_string())),
        }
    }
}

// --- EquationSystem ---

/// A [`DynamicalSystem`] defined by one compiled expression per state
/// variable. Also serves as its own parameter container.
#[derive(Debug, Clone)]
pub struct EquationSystem<T: Scalar> {
    pub equations: Vec<Bytecode>,
    pub params: Vec<T>,
    param_names: Vec<String>,
    var_names: Vec<String>,
    // Reused VM stack. Makes the system !Sync; clone per thread instead.
    stack: RefCell<Vec<T>>,
}

impl<T: Scalar> EquationSystem<T> {
    pub fn new(equations: Vec<Bytecode>, params: Vec<T>) -> Self {
        Self {
            equations,
            params,
            param_names: Vec::new(),
            var_names: Vec::new(),
            stack: RefCell::new(Vec::with_capacity(64)),
        }
    }

    /// Parses and compiles `equations` (one per entry of `var_names`).
    pub fn compile(
        var_names: &[&str],
        param_names: &[&str],
        equations: &[&str],
        params: Vec<T>,
    ) -> Result<Self, EquationError> {
        if equations.len() != var_names.len() {
            return Err(EquationError::EquationCount {
                expected: var_names.len(),
                got: equations.len(),
            });
        }
        if params.len() != param_names.len() {
            return Err(EquationError::ParameterCount {
                expected: param_names.len(),
                got: params.len(),
            });
        }
        let var_names: Vec<String> = var_names.iter().map(|s| s.to_string()).collect();
        let param_names: Vec<String> = param_names.iter().map(|s| s.to_string()).collect();
        let compiler = Compiler::new(&var_names, &param_names);
        let bytecode = equations
            .iter()
            .map(|eq| parse(eq).and_then(|expr| compiler.compile(&expr)))
            .collect::<Result<Vec<_>, _>>()?;

        let mut system = Self::new(bytecode, params);
        system.var_names = var_names;
        system.param_names = param_names;
        Ok(system)
    }

    pub fn var_names(&self) -> &[String] {
        &self.var_names
    }

    pub fn param_names(&self) -> &[String] {
        &self.param_names
    }

    /// Same bytecode evaluated on another scalar type.
    pub fn cast<U: Scalar>(&self) -> EquationSystem<U> {
        let params = self
            .params
            .iter()
            .map(|p| U::from_f64(p.to_f64().unwrap_or(f64::NAN)).unwrap_or_else(U::nan))
            .collect();
        let mut system = EquationSystem::new(self.equations.clone(), params);
        system.var_names = self.var_names.clone();
        system.param_names = self.param_names.clone();
        system
    }
}

impl<T: Scalar> DynamicalSystem<T> for EquationSystem<T> {
    fn dimension(&self) -> usize {
        self.equations.len()
    }

    fn apply(&self, t: T, x: &[T], out: &mut [T]) {
        let mut stack = self.stack.borrow_mut();
        for (slot, eq) in out.iter_mut().zip(&self.equations) {
            *slot = VM::execute(eq, x, &self.params, t, &mut stack);
        }
    }
}

// Jacobians of the f64 system: parameters enter as constants.
impl DynamicalSystem<Dual> for EquationSystem<f64> {
    fn dimension(&self) -> usize {
        self.equations.len()
    }

    fn apply(&self, t: Dual, x: &[Dual], out: &mut [Dual]) {
        let params: Vec<Dual> = self.params.iter().map(|&p| Dual::constant(p)).collect();
        let mut stack = Vec::with_capacity(16);
        for (slot, eq) in out.iter_mut().zip(&self.equations) {
            *slot = VM::execute(eq, x, &params, t, &mut stack);
        }
    }
}

impl ParameterSet for EquationSystem<f64> {
    fn set_parameter(&mut self, key: &ParamKey, value: f64) -> EvolutionResult<()> {
        let slot = match key {
            ParamKey::Index(i) => (*i < self.params.len()).then_some(*i),
            ParamKey::Name(name) => self.param_names.iter().position(|n| n == name),
        };
        match slot {
            Some(i) => {
                self.params[i] = value;
                Ok(())
            }
            None => Err(crate::error::EvolutionError::unknown_parameter(
                key.to_string(),
            )),
        }
    }
}
