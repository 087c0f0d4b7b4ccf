//! Expression and assignment evaluation against a context.

use crate::env::ContextHandle;
use crate::value::Value;
use crate::{EngineError, OutputSink};

use super::parse::{AssignOp, BinOp, Expr, UnaryOp};

pub(crate) struct Evaluator<'a> {
    pub ctx: &'a ContextHandle,
    pub sink: &'a dyn OutputSink,
}

impl Evaluator<'_> {
    pub fn assign(&self, name: &str, op: AssignOp, expr: &Expr) -> Result<Value, EngineError> {
        let rhs = self.eval(expr)?;
        let value = match op {
            AssignOp::Set => rhs,
            AssignOp::Add => binary(BinOp::Add, self.lookup(name)?, rhs)?,
            AssignOp::Sub => binary(BinOp::Sub, self.lookup(name)?, rhs)?,
        };
        self.ctx.set(name, value.clone());
        Ok(value)
    }

    pub fn eval(&self, expr: &Expr) -> Result<Value, EngineError> {
        match expr {
            Expr::Nil => Ok(Value::Nil),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::Int(n) => Ok(Value::Int(*n)),
            Expr::Str(s) => Ok(Value::Str(s.clone())),
            Expr::Var(name) => {
                // bang names are callables (markers), never variables
                if name.ends_with('!') {
                    return Err(EngineError::Eval(format!("undefined function: {name}")));
                }
                self.lookup(name)
            }
            Expr::Unary { op, expr } => unary(*op, self.eval(expr)?),
            Expr::Binary { op, lhs, rhs } => binary(*op, self.eval(lhs)?, self.eval(rhs)?),
            Expr::Call { name, args } => self.call(name, args),
        }
    }

    fn lookup(&self, name: &str) -> Result<Value, EngineError> {
        self.ctx
            .get(name)
            .ok_or_else(|| EngineError::Eval(format!("undefined variable: {name}")))
    }

    fn call(&self, name: &str, args: &[Expr]) -> Result<Value, EngineError> {
        match name {
            "print" | "println" | "eprint" | "eprintln" => {
                let mut text = String::new();
                for arg in args {
                    text.push_str(&self.eval(arg)?.to_string());
                }
                if name.ends_with("ln") {
                    text.push('\n');
                }
                if name.starts_with('e') {
                    self.sink.write_err(&text);
                } else {
                    self.sink.write_out(&text);
                }
                Ok(Value::Nil)
            }
            "suspend!" => Err(EngineError::Eval(
                "suspend! is only valid as a statement".into(),
            )),
            _ => Err(EngineError::Eval(format!("undefined function: {name}"))),
        }
    }
}

fn unary(op: UnaryOp, value: Value) -> Result<Value, EngineError> {
    match (op, value) {
        (UnaryOp::Neg, Value::Int(n)) => n
            .checked_neg()
            .map(Value::Int)
            .ok_or_else(|| EngineError::Eval("integer overflow".into())),
        (UnaryOp::Not, Value::Bool(b)) => Ok(Value::Bool(!b)),
        (UnaryOp::Neg, value) => Err(EngineError::Eval(format!(
            "cannot negate {}",
            value.type_name()
        ))),
        (UnaryOp::Not, value) => Err(EngineError::Eval(format!(
            "cannot logically negate {}",
            value.type_name()
        ))),
    }
}

fn binary(op: BinOp, lhs: Value, rhs: Value) -> Result<Value, EngineError> {
    match op {
        BinOp::Eq => return Ok(Value::Bool(lhs == rhs)),
        BinOp::Ne => return Ok(Value::Bool(lhs != rhs)),
        _ => {}
    }
    match (op, lhs, rhs) {
        (BinOp::Add, Value::Str(a), Value::Str(b)) => Ok(Value::Str(a + &b)),
        (BinOp::Add, Value::Int(a), Value::Int(b)) => checked(a.checked_add(b)),
        (BinOp::Sub, Value::Int(a), Value::Int(b)) => checked(a.checked_sub(b)),
        (BinOp::Mul, Value::Int(a), Value::Int(b)) => checked(a.checked_mul(b)),
        (BinOp::Div | BinOp::Rem, Value::Int(_), Value::Int(0)) => {
            Err(EngineError::Eval("division by zero".into()))
        }
        (BinOp::Div, Value::Int(a), Value::Int(b)) => checked(a.checked_div(b)),
        (BinOp::Rem, Value::Int(a), Value::Int(b)) => checked(a.checked_rem(b)),
        (BinOp::Lt, Value::Int(a), Value::Int(b)) => Ok(Value::Bool(a < b)),
        (BinOp::Le, Value::Int(a), Value::Int(b)) => Ok(Value::Bool(a <= b)),
        (BinOp::Gt, Value::Int(a), Value::Int(b)) => Ok(Value::Bool(a > b)),
        (BinOp::Ge, Value::Int(a), Value::Int(b)) => Ok(Value::Bool(a >= b)),
        (BinOp::Lt, Value::Str(a), Value::Str(b)) => Ok(Value::Bool(a < b)),
        (BinOp::Le, Value::Str(a), Value::Str(b)) => Ok(Value::Bool(a <= b)),
        (BinOp::Gt, Value::Str(a), Value::Str(b)) => Ok(Value::Bool(a > b)),
        (BinOp::Ge, Value::Str(a), Value::Str(b)) => Ok(Value::Bool(a >= b)),
        (op, lhs, rhs) => Err(EngineError::Eval(format!(
            "unsupported operand types for {}: {} and {}",
            op_symbol(op),
            lhs.type_name(),
            rhs.type_name()
        ))),
    }
}

fn checked(result: Option<i64>) -> Result<Value, EngineError> {
    result
        .map(Value::Int)
        .ok_or_else(|| EngineError::Eval("integer overflow".into()))
}

const fn op_symbol(op: BinOp) -> &'static str {
    match op {
        BinOp::Add => "+",
        BinOp::Sub => "-",
        BinOp::Mul => "*",
        BinOp::Div => "/",
        BinOp::Rem => "%",
        BinOp::Eq => "==",
        BinOp::Ne => "!=",
        BinOp::Lt => "<",
        BinOp::Le => "<=",
        BinOp::Gt => ">",
        BinOp::Ge => ">=",
    }
}
