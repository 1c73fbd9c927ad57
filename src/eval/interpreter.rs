//! Tree-walking evaluator over the live context table

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::{Map, Value};

use super::builtins;
use super::parser::{Expr, LogicalOp, Program};
use super::EvalError;
use crate::context::{ContextCallable, ContextTable, ContextValue};

/// Name that always refers to the whole context table
pub const CONTEXT_NAME: &str = "context";

/// Deepest expression tree the evaluator walks
pub const MAX_EVAL_DEPTH: usize = 256;

pub struct Interpreter<'t> {
    table: &'t mut ContextTable,
    params: Vec<String>,
    output: String,
    depth: usize,
}

impl<'t> Interpreter<'t> {
    pub fn new(table: &'t mut ContextTable) -> Self {
        Self {
            table,
            params: Vec::new(),
            output: String::new(),
            depth: 0,
        }
    }

    /// Run every statement; the value of the last one is the result
    pub async fn run(&mut self, program: &Program) -> Result<Value, EvalError> {
        self.params = program.params.clone();
        self.depth = 0;
        let mut last = Value::Null;
        for statement in &program.statements {
            last = self.eval(statement).await?;
        }
        Ok(last)
    }

    /// Text written by `print` so far
    pub fn into_output(self) -> String {
        self.output
    }

    fn names_table(&self, name: &str) -> bool {
        name == CONTEXT_NAME || self.params.iter().any(|p| p == name)
    }

    fn lookup(&self, name: &str, column: usize) -> Result<Value, EvalError> {
        if self.names_table(name) {
            return Ok(self.table.to_json());
        }
        if let Some(value) = self.table.get(name) {
            return Ok(value.to_json());
        }
        if builtins::is_builtin(name) {
            return Err(EvalError::runtime(format!("'{}' is a function and must be called", name), column));
        }
        Err(EvalError::runtime(format!("name '{}' is not defined", name), column))
    }

    /// A context callable named by `name`, `context.name` or `context['name']`
    fn callable_for(&self, callee: &Expr) -> Option<(String, ContextCallable)> {
        let name = match callee {
            Expr::Ident { name, .. } => name.as_str(),
            Expr::Field { target, name, .. } => match target.as_ref() {
                Expr::Ident { name: base, .. } if self.names_table(base) => name.as_str(),
                _ => return None,
            },
            Expr::Index { target, index, .. } => match (target.as_ref(), index.as_ref()) {
                (Expr::Ident { name: base, .. }, Expr::Literal(Value::String(name))) if self.names_table(base) => {
                    name.as_str()
                }
                _ => return None,
            },
            _ => return None,
        };
        match self.table.get(name) {
            Some(ContextValue::Callable(callable)) => Some((name.to_string(), callable.clone())),
            _ => None,
        }
    }

    fn eval<'s>(&'s mut self, expr: &'s Expr) -> BoxFuture<'s, Result<Value, EvalError>> {
        async move {
            // An error ends the whole run, so early returns leave the counter as is
            self.depth += 1;
            if self.depth > MAX_EVAL_DEPTH {
                return Err(EvalError::runtime("expression nested too deeply", expr.column().unwrap_or(0)));
            }
            let result = match expr {
                Expr::Literal(value) => Ok(value.clone()),
                Expr::Ident { name, column } => self.lookup(name, *column),
                Expr::List(items) => {
                    let mut values = Vec::with_capacity(items.len());
                    for item in items {
                        values.push(self.eval(item).await?);
                    }
                    Ok(Value::Array(values))
                }
                Expr::Object(pairs) => {
                    let mut map = Map::new();
                    for (key, value) in pairs {
                        let value = self.eval(value).await?;
                        map.insert(key.clone(), value);
                    }
                    Ok(Value::Object(map))
                }
                Expr::Field { target, name, column } => {
                    let target = self.eval(target).await?;
                    field(&target, name).map_err(|message| EvalError::runtime(message, *column))
                }
                Expr::Index { target, index, column } => {
                    let target = self.eval(target).await?;
                    let index = self.eval(index).await?;
                    subscript(&target, &index).map_err(|message| EvalError::runtime(message, *column))
                }
                Expr::Call { callee, args, column } => self.call(callee, args, *column).await,
                Expr::Neg { operand, column } => {
                    let value = self.eval(operand).await?;
                    builtins::negate(&value).map_err(|message| EvalError::runtime(message, *column))
                }
                Expr::Not(operand) => {
                    let value = self.eval(operand).await?;
                    Ok(Value::Bool(!builtins::truthy(&value)))
                }
                Expr::Binary { op, left, right, column } => {
                    let left = self.eval(left).await?;
                    let right = self.eval(right).await?;
                    builtins::binary(*op, &left, &right).map_err(|message| EvalError::runtime(message, *column))
                }
                Expr::Logical { op, left, right } => {
                    let left = self.eval(left).await?;
                    let short_circuit = match op {
                        LogicalOp::And => !builtins::truthy(&left),
                        LogicalOp::Or => builtins::truthy(&left),
                    };
                    if short_circuit {
                        Ok(left)
                    } else {
                        self.eval(right).await
                    }
                }
            };
            self.depth -= 1;
            result
        }
        .boxed()
    }

    async fn call(&mut self, callee: &Expr, args: &[Expr], column: usize) -> Result<Value, EvalError> {
        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            values.push(self.eval(arg).await?);
        }

        if let Some((name, callable)) = self.callable_for(callee) {
            return callable
                .call(values)
                .await
                .map_err(|message| EvalError::call(name, message));
        }

        let name = match callee {
            Expr::Ident { name, .. } if builtins::is_builtin(name) => name.as_str(),
            Expr::Ident { name, .. } if self.table.get(name).is_some() || self.names_table(name) => {
                return Err(EvalError::runtime(format!("'{}' is not callable", name), column));
            }
            Expr::Ident { name, .. } => {
                return Err(EvalError::runtime(format!("name '{}' is not defined", name), column));
            }
            _ => return Err(EvalError::runtime("expression is not callable", column)),
        };

        match name {
            "print" => {
                let line: Vec<String> = values.iter().map(builtins::display).collect();
                self.output.push_str(&line.join(" "));
                self.output.push('\n');
                Ok(Value::Null)
            }
            "set" => match values.as_slice() {
                [Value::String(key), value] => {
                    if self.names_table(key) {
                        return Err(EvalError::call("set", format!("'{}' cannot be replaced", key)));
                    }
                    self.table.set(key.clone(), ContextValue::Data(value.clone()));
                    Ok(value.clone())
                }
                _ => Err(EvalError::call("set", "expects a name and a value")),
            },
            other => builtins::call_pure(other, &values).map_err(|message| EvalError::call(other, message)),
        }
    }
}

fn field(target: &Value, name: &str) -> Result<Value, String> {
    match target {
        Value::Object(map) => map
            .get(name)
            .cloned()
            .ok_or_else(|| format!("no field '{}'", name)),
        other => Err(format!(
            "cannot read field '{}' of '{}'",
            name,
            crate::context::json_type_name(other)
        )),
    }
}

fn subscript(target: &Value, index: &Value) -> Result<Value, String> {
    match (target, index) {
        (Value::Object(map), Value::String(key)) => map
            .get(key)
            .cloned()
            .ok_or_else(|| format!("key '{}' not found", key)),
        (Value::Array(items), Value::Number(_)) => {
            let position = resolve_position(index, items.len())?;
            Ok(items[position].clone())
        }
        (Value::String(s), Value::Number(_)) => {
            let chars: Vec<char> = s.chars().collect();
            let position = resolve_position(index, chars.len())?;
            Ok(Value::String(chars[position].to_string()))
        }
        _ => Err(format!(
            "cannot index '{}' with '{}'",
            crate::context::json_type_name(target),
            crate::context::json_type_name(index)
        )),
    }
}

/// Python-style index, negative values count from the end
fn resolve_position(index: &Value, len: usize) -> Result<usize, String> {
    let raw = index
        .as_i64()
        .ok_or_else(|| "index must be an integer".to_string())?;
    let position = if raw < 0 { len as i64 + raw } else { raw };
    if position < 0 || position >= len as i64 {
        return Err(format!("index {} out of range", raw));
    }
    Ok(position as usize)
}
