use crate::traits::Scalar;
use std::collections::HashMap;

/// OpCodes for the Stack-based Virtual Machine.
/// The VM operates on a stack of `Scalar` values (f64 or Dual).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OpCode {
    /// Pushes a constant `f64` value onto the stack.
    LoadConst(f64),
    /// Pushes the value of an input (by index) onto the stack.
    /// Indices follow the order in which the compiler was given input names.
    LoadInput(usize),
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
    Sin,
    Cos,
    Tan,
    Exp,
    Ln,
    Sqrt,
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
/// - `inputs`: Input values (read-only).
/// - `stack`: A mutable buffer for intermediate computations.
pub struct VM;

impl VM {
    /// Executes the bytecode. Returns `None` if the bytecode underflows the
    /// stack or refers to an input that was not supplied.
    pub fn execute<T: Scalar>(bytecode: &Bytecode, inputs: &[T], stack: &mut Vec<T>) -> Option<T> {
        stack.clear();

        for op in &bytecode.ops {
            let value = match op {
                OpCode::LoadConst(val) => T::from_f64(*val),
                OpCode::LoadInput(idx) => *inputs.get(*idx)?,
                OpCode::Add | OpCode::Sub | OpCode::Mul | OpCode::Div | OpCode::Pow => {
                    let b = stack.pop()?;
                    let a = stack.pop()?;
                    match op {
                        OpCode::Add => a + b,
                        OpCode::Sub => a - b,
                        OpCode::Mul => a * b,
                        OpCode::Div => a / b,
                        _ => a.powf(b),
                    }
                }
                OpCode::Sin => stack.pop()?.sin(),
                OpCode::Cos => stack.pop()?.cos(),
                OpCode::Tan => stack.pop()?.tan(),
                OpCode::Exp => stack.pop()?.exp(),
                OpCode::Ln => stack.pop()?.ln(),
                OpCode::Sqrt => stack.pop()?.sqrt(),
                OpCode::Neg => -stack.pop()?,
            };
            stack.push(value);
        }

        stack.pop()
    }
}

// --- AST & Parser ---

/// Abstract Syntax Tree nodes for expressions.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Variable(String),
    Binary(Box<Expr>, char, Box<Expr>), // char is operator +, -, *, /, ^
    Unary(char, Box<Expr>),             // -
    Call(String, Box<Expr>),            // functions like sin(x)
}

impl Expr {
    /// Variable names in order of first appearance.
    pub fn variables(&self) -> Vec<String> {
        let mut names = Vec::new();
        self.collect_variables(&mut names);
        names
    }

    fn collect_variables(&self, names: &mut Vec<String>) {
        match self {
            Expr::Number(_) => {}
            Expr::Variable(name) => {
                if !names.iter().any(|n| n == name) {
                    names.push(name.clone());
                }
            }
            Expr::Binary(left, _, right) => {
                left.collect_variables(names);
                right.collect_variables(names);
            }
            Expr::Unary(_, operand) | Expr::Call(_, operand) => operand.collect_variables(names),
        }
    }
}

/// Compiles an AST (`Expr`) into `Bytecode`.
/// Resolves input names to indices.
pub struct Compiler {
    pub input_map: HashMap<String, usize>,
}

impl Compiler {
    pub fn new(input_names: &[String]) -> Self {
        let input_map = input_names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();
        Self { input_map }
    }

    pub fn compile(&self, expr: &Expr) -> Result<Bytecode, String> {
        let mut ops = Vec::new();
        self.compile_recursive(expr, &mut ops)?;
        Ok(Bytecode { ops })
    }

    fn compile_recursive(&self, expr: &Expr, ops: &mut Vec<OpCode>) -> Result<(), String> {
        match expr {
            Expr::Number(n) => ops.push(OpCode::LoadConst(*n)),
            Expr::Variable(name) => match self.input_map.get(name) {
                Some(&idx) => ops.push(OpCode::LoadInput(idx)),
                None => return Err(format!("Unknown variable: {name}")),
            },
            Expr::Binary(left, op, right) => {
                self.compile_recursive(left, ops)?;
                self.compile_recursive(right, ops)?;
                let code = match op {
                    '+' => OpCode::Add,
                    '-' => OpCode::Sub,
                    '*' => OpCode::Mul,
                    '/' => OpCode::Div,
                    '^' => OpCode::Pow,
                    _ => return Err(format!("Unknown binary operator: {op}")),
                };
                ops.push(code);
            }
            Expr::Unary(op, operand) => {
                self.compile_recursive(operand, ops)?;
                match op {
                    '-' => ops.push(OpCode::Neg),
                    _ => return Err(format!("Unknown unary operator: {op}")),
                }
            }
            Expr::Call(func, arg) => {
                self.compile_recursive(arg, ops)?;
                let code = match func.as_str() {
                    "sin" => OpCode::Sin,
                    "cos" => OpCode::Cos,
                    "tan" => OpCode::Tan,
                    "exp" => OpCode::Exp,
                    "ln" | "log" => OpCode::Ln,
                    "sqrt" => OpCode::Sqrt,
                    _ => return Err(format!("Unknown function: {func}")),
                };
                ops.push(code);
            }
        }
        Ok(())
    }
}

// --- Simple Parser ---

/// Parses a string expression into an AST.
pub fn parse(input: &str) -> Result<Expr, String> {
    let tokens = tokenize(input)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_expression()?;
    match parser.peek() {
        None => Ok(expr),
        Some(token) => Err(format!("Unexpected trailing token {token:?}")),
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
                    num_str.push(d);
                    chars.next();
                    if let Some(&sign) = chars.peek() {
                        if sign == '+' || sign == '-' {
                            num_str.push(sign);
                            chars.next();
                        }
                    }
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
                '*' if chars.peek() == Some(&'*') => {
                    chars.next();
                    Token::Caret
                }
                '*' => Token::Star,
                '/' => Token::Slash,
                '^' => Token::Caret,
                '(' => Token::LParen,
                ')' => Token::RParen,
                _ => return Err(format!("Unexpected character '{c}'")),
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
    fn peek(&self) -> Option<Token> {
        self.tokens.get(self.pos).cloned()
    }

    fn consume(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn parse_expression(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_factor()?;

        while let Some(token) = self.peek() {
            let op = match token {
                Token::Plus => '+',
                Token::Minus => '-',
                _ => break,
            };
            self.consume();
            let right = self.parse_factor()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn parse_factor(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_unary()?;

        while let Some(token) = self.peek() {
            let op = match token {
                Token::Star => '*',
                Token::Slash => '/',
                _ => break,
            };
            self.consume();
            let right = self.parse_unary()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    /// Unary minus binds looser than `^`: `-x^2` is `-(x^2)`.
    fn parse_unary(&mut self) -> Result<Expr, String> {
        if let Some(Token::Minus) = self.peek() {
            self.consume();
            let expr = self.parse_unary()?;
            return Ok(Expr::Unary('-', Box::new(expr)));
        }
        self.parse_power()
    }

    /// Right-associative: `a^b^c` is `a^(b^c)`.
    fn parse_power(&mut self) -> Result<Expr, String> {
        let base = self.parse_primary()?;
        if let Some(Token::Caret) = self.peek() {
            self.consume();
            let exponent = self.parse_unary()?;
            return Ok(Expr::Binary(Box::new(base), '^', Box::new(exponent)));
        }
        Ok(base)
    }

    fn parse_primary(&mut self) -> Result<Expr, String> {
        match self.consume() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::Identifier(name)) => {
                if let Some(Token::LParen) = self.peek() {
                    self.consume(); // eat '('
                    let arg = self.parse_expression()?;
                    if let Some(Token::RParen) = self.consume() {
                        Ok(Expr::Call(name, Box::new(arg)))
                    } else {
                        Err("Expected ')'".to_string())
                    }
                } else {
                    Ok(Expr::Variable(name))
                }
            }
            Some(Token::LParen) => {
                let expr = self.parse_expression()?;
                if let Some(Token::RParen) = self.consume() {
                    Ok(expr)
                } else {
                    Err("Expected ')'".to_string())
                }
            }
            Some(token) => Err(format!("Unexpected token {token:?}")),
            None => Err("Unexpected end of expression".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autodiff::Dual;

    fn eval(text: &str, names: &[&str], inputs: &[f64]) -> f64 {
        let names: Vec<String> = names.iter().map(|n| n.to_string()).collect();
        let expr = parse(text).expect("parse");
        let code = Compiler::new(&names).compile(&expr).expect("compile");
        VM::execute(&code, inputs, &mut Vec::new()).expect("execute")
    }

    #[test]
    fn precedence_and_associativity() {
        assert_eq!(eval("1 + 2 * 3", &[], &[]), 7.0);
        assert_eq!(eval("-x^2", &["x"], &[3.0]), -9.0);
        assert_eq!(eval("2^3^2", &[], &[]), 512.0);
        assert_eq!(eval("x**2 / 4", &["x"], &[4.0]), 4.0);
        assert_eq!(eval("(1 - 2) - 3", &[], &[]), -4.0);
        assert_eq!(eval("2^-1", &[], &[]), 0.5);
    }

    #[test]
    fn scientific_notation_and_functions() {
        assert!((eval("1.5e-3 * 1e3", &[], &[]) - 1.5).abs() < 1e-12);
        assert!((eval("sqrt(x) + ln(exp(2))", &["x"], &[16.0]) - 6.0).abs() < 1e-12);
        assert!(eval("sin(0) + cos(0) + tan(0)", &[], &[]) == 1.0);
    }

    #[test]
    fn variables_are_listed_once_in_order() {
        let expr = parse("b * a + sin(b) - c").unwrap();
        assert_eq!(expr.variables(), vec!["b", "a", "c"]);
    }

    #[test]
    fn malformed_input_is_rejected() {
        assert!(parse("1 +").is_err());
        assert!(parse("(x").is_err());
        assert!(parse("x y").is_err());
        assert!(parse("x # 2").is_err());
        let expr = parse("foo(x)").unwrap();
        let err = Compiler::new(&["x".to_string()]).compile(&expr).unwrap_err();
        assert!(err.contains("Unknown function"));
        let err = Compiler::new(&[]).compile(&parse("x").unwrap()).unwrap_err();
        assert!(err.contains("Unknown variable"));
    }

    #[test]
    fn dual_evaluation_gives_derivative() {
        let names = vec!["x".to_string()];
        let code = Compiler::new(&names)
            .compile(&parse("x^2 + 3*sin(x)").unwrap())
            .unwrap();
        let out = VM::execute(&code, &[Dual::variable(1.0)], &mut Vec::new()).unwrap();
        assert!((out.eps - (2.0 + 3.0 * 1.0_f64.cos())).abs() < 1e-12);
    }

    #[test]
    fn missing_inputs_yield_none() {
        let code = Bytecode {
            ops: vec![OpCode::LoadInput(2)],
        };
        assert!(VM::execute::<f64>(&code, &[1.0], &mut Vec::new()).is_none());
        let code = Bytecode {
            ops: vec![OpCode::Add],
        };
        assert!(VM::execute::<f64>(&code, &[], &mut Vec::new()).is_none());
    }
}
