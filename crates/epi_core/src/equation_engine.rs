use crate::symbolic::{Expr, Func};
use crate::traits::{DynamicalSystem, Scalar};
use std::cell::RefCell;
use std::collections::HashMap;

/// OpCodes for the Stack-based Virtual Machine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OpCode {
    /// Pushes a constant `f64` value onto the stack.
    LoadConst(f64),
    /// Pushes the value of a state variable (by index) onto the stack.
    /// Indices follow the compartment order the system was compiled with.
    LoadVar(usize),
    /// Pushes the value of a parameter (by index) onto the stack.
    LoadParam(usize),
    /// Pops top two values (b, a), pushes (a + b).
    Add,
    /// Pops top two values (b, a), pushes (a - b).
    Sub,
    /// Pops top two values (b, a), pushes (a * b).
    Mul,
    /// Pops top two values (b, a), pushes (a / b).
    Div,
    /// Pops top two values (b, a), pushes (a ^ b).
    Pow,
    /// Pops top value (a), pushes a^n for an integer n.
    PowI(i32),
    Sqrt,
    Sin,
    Cos,
    Exp,
    Ln,
    /// Pops top value (a), pushes -a.
    Neg,
}

/// Represents a compiled sequence of operations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bytecode {
    pub ops: Vec<OpCode>,
}

/// Stack-based Virtual Machine for evaluating equations.
///
/// The VM is stateless; `execute` takes all necessary context:
/// - `bytecode`: Instructions to run.
/// - `vars`: Current state vector (read-only).
/// - `params`: Parameter vector (read-only).
/// - `stack`: A mutable buffer for intermediate computations.
///
/// Returns the value left on the stack. Bytecode produced by [`Compiler`]
/// is always balanced; a malformed program yields NaN.
pub struct VM;

fn pop<T: Scalar>(stack: &mut Vec<T>) -> T {
    stack.pop().unwrap_or_else(T::nan)
}

impl VM {
    pub fn execute<T: Scalar>(
        bytecode: &Bytecode,
        vars: &[T],
        params: &[T],
        stack: &mut Vec<T>,
    ) -> T {
        stack.clear();

        for op in &bytecode.ops {
            match op {
                OpCode::LoadConst(val) => {
                    stack.push(T::from_f64(*val).unwrap_or_else(T::nan));
                }
                OpCode::LoadVar(idx) => {
                    stack.push(vars[*idx]);
                }
                OpCode::LoadParam(idx) => {
                    stack.push(params[*idx]);
                }
                OpCode::Add => {
                    let b = pop(stack);
                    let a = pop(stack);
                    stack.push(a + b);
                }
                OpCode::Sub => {
                    let b = pop(stack);
                    let a = pop(stack);
                    stack.push(a - b);
                }
                OpCode::Mul => {
                    let b = pop(stack);
                    let a = pop(stack);
                    stack.push(a * b);
                }
                OpCode::Div => {
                    let b = pop(stack);
                    let a = pop(stack);
                    stack.push(a / b);
                }
                OpCode::Pow => {
                    let b = pop(stack);
                    let a = pop(stack);
                    stack.push(a.powf(b));
                }
                OpCode::PowI(n) => {
                    let a = pop(stack);
                    stack.push(a.powi(*n));
                }
                OpCode::Sqrt => {
                    let a = pop(stack);
                    stack.push(a.sqrt());
                }
                OpCode::Sin => {
                    let a = pop(stack);
                    stack.push(a.sin());
                }
                OpCode::Cos => {
                    let a = pop(stack);
                    stack.push(a.cos());
                }
                OpCode::Exp => {
                    let a = pop(stack);
                    stack.push(a.exp());
                }
                OpCode::Ln => {
                    let a = pop(stack);
                    stack.push(a.ln());
                }
                OpCode::Neg => {
                    let a = pop(stack);
                    stack.push(-a);
                }
            }
        }

        pop(stack)
    }
}

/// Compiles a symbolic [`Expr`] into `Bytecode`.
/// Resolves variable and parameter names to indices.
pub struct Compiler {
    pub var_map: HashMap<String, usize>,
    pub param_map: HashMap<String, usize>,
}

impl Compiler {
    pub fn new(var_names: &[String], param_names: &[String]) -> Self {
        let mut var_map = HashMap::new();
        for (i, name) in var_names.iter().enumerate() {
            var_map.insert(name.clone(), i);
        }

        let mut param_map = HashMap::new();
        for (i, name) in param_names.iter().enumerate() {
            param_map.insert(name.clone(), i);
        }

        Self { var_map, param_map }
    }

    /// Fails with the name of the first symbol that is neither a variable
    /// nor a parameter.
    pub fn compile(&self, expr: &Expr) -> Result<Bytecode, String> {
        let mut ops = Vec::new();
        self.compile_recursive(expr, &mut ops)?;
        Ok(Bytecode { ops })
    }

    fn compile_recursive(&self, expr: &Expr, ops: &mut Vec<OpCode>) -> Result<(), String> {
        match expr {
            Expr::Num(n) => ops.push(OpCode::LoadConst(*n)),
            Expr::Sym(name) => {
                if let Some(&idx) = self.var_map.get(name) {
                    ops.push(OpCode::LoadVar(idx));
                } else if let Some(&idx) = self.param_map.get(name) {
                    ops.push(OpCode::LoadParam(idx));
                } else {
                    return Err(name.clone());
                }
            }
            Expr::Add(terms) => {
                if terms.is_empty() {
                    ops.push(OpCode::LoadConst(0.0));
                }
                for (i, term) in terms.iter().enumerate() {
                    match negated(term) {
                        Some(magnitude) if i > 0 => {
                            self.compile_recursive(&magnitude, ops)?;
                            ops.push(OpCode::Sub);
                        }
                        _ => {
                            self.compile_recursive(term, ops)?;
                            if i > 0 {
                                ops.push(OpCode::Add);
                            }
                        }
                    }
                }
            }
            Expr::Mul(factors) => {
                let (flip_sign, factors) = match factors.split_first() {
                    Some((Expr::Num(c), rest)) if *c == -1.0 && !rest.is_empty() => (true, rest),
                    _ => (false, factors.as_slice()),
                };
                ops.push(OpCode::LoadConst(1.0));
                for factor in factors {
                    match reciprocal(factor) {
                        Some(denominator) => {
                            self.compile_recursive(&denominator, ops)?;
                            ops.push(OpCode::Div);
                        }
                        None => {
                            self.compile_recursive(factor, ops)?;
                            ops.push(OpCode::Mul);
                        }
                    }
                }
                if flip_sign {
                    ops.push(OpCode::Neg);
                }
            }
            Expr::Pow(base, exponent) => {
                self.compile_recursive(base, ops)?;
                match exponent.as_num() {
                    Some(e) if e == 0.5 => ops.push(OpCode::Sqrt),
                    Some(e) if e.fract() == 0.0 && e.abs() <= i32::MAX as f64 => {
                        ops.push(OpCode::PowI(e as i32))
                    }
                    _ => {
                        self.compile_recursive(exponent, ops)?;
                        ops.push(OpCode::Pow);
                    }
                }
            }
            Expr::Func(func, arg) => {
                self.compile_recursive(arg, ops)?;
                ops.push(match func {
                    Func::Sin => OpCode::Sin,
                    Func::Cos => OpCode::Cos,
                    Func::Exp => OpCode::Exp,
                    Func::Ln => OpCode::Ln,
                });
            }
        }
        Ok(())
    }
}

/// `Some(b)` when `term` is `-b`.
fn negated(term: &Expr) -> Option<Expr> {
    match term {
        Expr::Num(v) if *v < 0.0 => Some(Expr::Num(-v)),
        Expr::Mul(factors) => match factors.split_first() {
            Some((Expr::Num(c), rest)) if *c < 0.0 => {
                let mut magnitude = vec![Expr::Num(-c)];
                magnitude.extend(rest.iter().cloned());
                Some(Expr::Mul(magnitude))
            }
            _ => None,
        },
        _ => None,
    }
}

/// `Some(b^n)` when `factor` is `b^-n` for a numeric `n`.
fn reciprocal(factor: &Expr) -> Option<Expr> {
    match factor {
        Expr::Pow(base, exponent) => match exponent.as_num() {
            Some(e) if e < 0.0 => Some((**base).clone().pow(Expr::Num(-e))),
            _ => None,
        },
        _ => None,
    }
}

// --- Parser ---

/// Parses rate-expression text into an unsimplified symbolic [`Expr`].
///
/// Grammar, loosest binding first: `+ -`, `* /`, unary sign, `^` (right
/// associative; `**` is accepted as a synonym). Calls: `sin`, `cos`, `exp`,
/// `ln`/`log` and `sqrt`.
pub fn parse(input: &str) -> Result<Expr, String> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err("Empty expression".to_string());
    }
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_expression()?;
    match parser.peek() {
        None => Ok(expr),
        Some(token) => Err(format!("Unexpected {} after complete expression", token.describe())),
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

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Number(n) => format!("number {n}"),
            Token::Identifier(name) => format!("identifier '{name}'"),
            Token::Plus => "'+'".to_string(),
            Token::Minus => "'-'".to_string(),
            Token::Star => "'*'".to_string(),
            Token::Slash => "'/'".to_string(),
            Token::Caret => "'^'".to_string(),
            Token::LParen => "'('".to_string(),
            Token::RParen => "')'".to_string(),
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c.is_ascii_digit() || c == '.' {
            let mut num_str = String::new();
            while let Some(&d) = chars.peek() {
                if d.is_ascii_digit() || d == '.' {
                    num_str.push(d);
                    chars.next();
                } else if (d == 'e' || d == 'E') && !num_str.contains(['e', 'E']) {
                    // Exponent only when a digit (optionally signed) follows.
                    let mut lookahead = chars.clone();
                    lookahead.next();
                    let mut suffix = String::from(d);
                    if let Some(&sign) = lookahead.peek() {
                        if sign == '+' || sign == '-' {
                            suffix.push(sign);
                            lookahead.next();
                        }
                    }
                    if !lookahead.peek().is_some_and(|x| x.is_ascii_digit()) {
                        break;
                    }
                    num_str.push_str(&suffix);
                    chars = lookahead;
                } else {
                    break;
                }
            }
            let value = num_str
                .parse()
                .map_err(|_| format!("Invalid number '{num_str}'"))?;
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
            chars.next();
            let token = match c {
                '+' => Token::Plus,
                '-' => Token::Minus,
                '*' => {
                    if chars.peek() == Some(&'*') {
                        chars.next();
                        Token::Caret
                    } else {
                        Token::Star
                    }
                }
                '/' => Token::Slash,
                '^' => Token::Caret,
                '(' => Token::LParen,
                ')' => Token::RParen,
                other => return Err(format!("Unexpected character '{other}'")),
            };
            tokens.push(token);
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

    fn expect_rparen(&mut self) -> Result<(), String> {
        match self.consume() {
            Some(Token::RParen) => Ok(()),
            Some(token) => Err(format!("Expected ')' but found {}", token.describe())),
            None => Err("Expected ')' before end of input".to_string()),
        }
    }

    fn parse_expression(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_term()?;

        loop {
            match self.peek() {
                Some(Token::Plus) => {
                    self.consume();
                    let right = self.parse_term()?;
                    left = left + right;
                }
                Some(Token::Minus) => {
                    self.consume();
                    let right = self.parse_term()?;
                    left = left - right;
                }
                _ => break,
            }
        }
        Ok(left)
    }

    fn parse_term(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_unary()?;

        loop {
            match self.peek() {
                Some(Token::Star) => {
                    self.consume();
                    let right = self.parse_unary()?;
                    left = left * right;
                }
                Some(Token::Slash) => {
                    self.consume();
                    let right = self.parse_unary()?;
                    left = left / right;
                }
                _ => break,
            }
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, String> {
        match self.peek() {
            Some(Token::Minus) => {
                self.consume();
                Ok(-self.parse_unary()?)
            }
            Some(Token::Plus) => {
                self.consume();
                self.parse_unary()
            }
            _ => self.parse_power(),
        }
    }

    fn parse_power(&mut self) -> Result<Expr, String> {
        let base = self.parse_primary()?;
        if let Some(Token::Caret) = self.peek() {
            self.consume();
            // Right associative, and the exponent may carry its own sign.
            let exponent = self.parse_unary()?;
            return Ok(base.pow(exponent));
        }
        Ok(base)
    }

    fn parse_primary(&mut self) -> Result<Expr, String> {
        match self.consume() {
            Some(Token::Number(n)) => Ok(Expr::Num(n)),
            Some(Token::Identifier(name)) => {
                if let Some(Token::LParen) = self.peek() {
                    self.consume();
                    let arg = self.parse_expression()?;
                    self.expect_rparen()?;
                    if name == "sqrt" {
                        return Ok(arg.sqrt());
                    }
                    match Func::from_name(&name) {
                        Some(func) => Ok(Expr::call(func, arg)),
                        None => Err(format!("Unknown function '{name}'")),
                    }
                } else {
                    Ok(Expr::Sym(name))
                }
            }
            Some(Token::LParen) => {
                let expr = self.parse_expression()?;
                self.expect_rparen()?;
                Ok(expr)
            }
            Some(token) => Err(format!("Unexpected {}", token.describe())),
            None => Err("Unexpected end of input".to_string()),
        }
    }
}

// --- EquationSystem ---

/// A concrete implementation of `DynamicalSystem` that uses the VM.
/// Contains one compiled bytecode expression per state variable.
pub struct EquationSystem<T: Scalar> {
    pub equations: Vec<Bytecode>,
    pub params: Vec<T>,
    // Interior mutability for VM stack to avoid allocation in apply.
    pub stack: RefCell<Vec<T>>,
}

impl<T: Scalar> EquationSystem<T> {
    pub fn new(equations: Vec<Bytecode>, params: Vec<T>) -> Self {
        Self {
            equations,
            params,
            stack: RefCell::new(Vec::with_capacity(64)),
        }
    }
}

impl<T: Scalar> DynamicalSystem<T> for EquationSystem<T> {
    fn dimension(&self) -> usize {
        self.equations.len()
    }

    fn apply(&self, _t: T, x: &[T], out: &mut [T]) {
        let mut stack = self.stack.borrow_mut();
        for (i, eq) in self.equations.iter().enumerate() {
            out[i] = VM::execute(eq, x, &self.params, &mut stack);
        }
    }
}
